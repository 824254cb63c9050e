use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backend::BackendResponse;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Below this many characters an answer is flagged as too short.
    pub min_chars: usize,
    /// Length band earning the full length bonus.
    pub good_length_range: (usize, usize),
    /// Latency at or under this earns the full speed bonus.
    pub good_latency: Duration,
    pub min_unique_word_ratio: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_chars: 20,
            good_length_range: (50, 4000),
            good_latency: Duration::from_secs(20),
            min_unique_word_ratio: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub is_valid: bool,
    pub problems: Vec<String>,
}

fn error_phrase_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(error|erro|internal server error|service unavailable|timeout|timed out|request failed|exception|traceback|sorry, (i|we) (can[' ]?not|could not))",
        )
        .expect("static regex compiles")
    })
}

fn mojibake_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // UTF-8 text decoded as Latin-1 leaves these pairs behind.
    RE.get_or_init(|| Regex::new("Ã[©£§µ¡³º¢]|â€").expect("static regex compiles"))
}

/// Pre-merge sanity gate. Flags answers that are too short, repetitive,
/// structurally empty, garbled, or that read like a transport error message.
pub fn validate(text: &str, config: &QualityConfig) -> QualityReport {
    let trimmed = text.trim();
    let mut problems = Vec::new();

    if trimmed.chars().count() < config.min_chars {
        problems.push(format!(
            "too short ({} chars, minimum {})",
            trimmed.chars().count(),
            config.min_chars
        ));
    }

    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if !words.is_empty() && words.len() >= 10 {
        let unique: std::collections::HashSet<String> =
            words.iter().map(|w| w.to_lowercase()).collect();
        let ratio = unique.len() as f64 / words.len() as f64;
        if ratio < config.min_unique_word_ratio {
            problems.push(format!("highly repetitive (unique-word ratio {:.2})", ratio));
        }
    }

    let has_sentence_boundary = trimmed.contains(['.', '!', '?']);
    if words.len() < 5 && !has_sentence_boundary {
        problems.push("structurally empty (no sentence boundary, too few words)".to_string());
    }

    if trimmed.contains('\u{FFFD}') || mojibake_regex().is_match(trimmed) {
        problems.push("contains encoding artifacts".to_string());
    }

    if error_phrase_regex().is_match(trimmed) {
        problems.push("reads like an error or timeout message".to_string());
    }

    QualityReport {
        is_valid: problems.is_empty(),
        problems,
    }
}

/// Standalone quality score in [0, 1]: base plus bonuses for length and
/// latency landing in their good ranges. Errors and empty text score zero.
pub fn score(response: &BackendResponse, config: &QualityConfig) -> f64 {
    if response.error.is_some() || response.text.trim().is_empty() {
        return 0.0;
    }

    let mut score = 0.5;

    let len = response.text.chars().count();
    let (min_good, max_good) = config.good_length_range;
    let length_bonus = if len >= min_good && len <= max_good {
        0.3
    } else if len < min_good {
        0.3 * len as f64 / min_good as f64
    } else {
        0.3 * max_good as f64 / len as f64
    };
    score += length_bonus;

    let latency_bonus = if response.latency <= config.good_latency {
        0.2
    } else {
        0.2 * config.good_latency.as_secs_f64() / response.latency.as_secs_f64()
    };
    score += latency_bonus;

    score.clamp(0.0, 1.0)
}
