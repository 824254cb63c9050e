use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::BackendResponse;
use crate::consensus::quality::{self, QualityConfig, QualityReport};
use crate::consensus::similarity::{SimilarityScorer, SimilarityWeights};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub weights: SimilarityWeights,
    /// Terms the deployment cares about; drives the domain component of
    /// similarity and off-topic outlier detection.
    pub domain_vocabulary: Vec<String>,
    /// Mean-similarity floor below which a response is an outlier.
    pub min_similarity: f64,
    pub medium_confidence: f64,
    pub high_confidence: f64,
    pub single_source_confidence: f64,
    /// Per-response consensus score blend.
    pub score_similarity_weight: f64,
    pub score_quality_weight: f64,
    pub score_trust_weight: f64,
    /// Final confidence blend.
    pub confidence_score_weight: f64,
    pub confidence_similarity_weight: f64,
    /// Multiplier on consensus-score variance subtracted from confidence.
    pub variance_penalty: f64,
    /// Sentences more similar than this to an existing one are redundant.
    pub dedup_threshold: f64,
    pub max_enrichment_sentences: usize,
    /// When every response is an outlier: hard Consensus error, or a
    /// bottom-band best-effort result.
    pub fail_on_no_agreement: bool,
    pub quality: QualityConfig,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            weights: SimilarityWeights::default(),
            domain_vocabulary: Vec::new(),
            min_similarity: 0.6,
            medium_confidence: 0.7,
            high_confidence: 0.8,
            single_source_confidence: 0.55,
            score_similarity_weight: 0.5,
            score_quality_weight: 0.3,
            score_trust_weight: 0.2,
            confidence_score_weight: 0.6,
            confidence_similarity_weight: 0.4,
            variance_penalty: 1.0,
            dedup_threshold: 0.8,
            max_enrichment_sentences: 2,
            fail_on_no_agreement: true,
            quality: QualityConfig::default(),
        }
    }
}

/// The merged verdict for one dispatch. Produced once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub text: String,
    pub confidence: f64,
    pub contributors: Vec<String>,
    pub outliers: Vec<String>,
    pub justification: String,
}

/// Turns N independent completed responses into one answer with a traceable
/// confidence number. Operates on a completed snapshot only.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    scorer: SimilarityScorer,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig) -> Self {
        let scorer = SimilarityScorer::new(
            config.weights.clone(),
            config.domain_vocabulary.clone(),
        );
        Self { config, scorer }
    }

    pub fn validate_quality(&self, text: &str) -> QualityReport {
        quality::validate(text, &self.config.quality)
    }

    /// `trust_weights` are optional externally supplied per-backend weights
    /// in [0, 1]; unlisted backends default to full trust.
    pub fn merge(
        &self,
        responses: &[BackendResponse],
        trust_weights: &HashMap<String, f64>,
    ) -> Result<ConsensusResult> {
        let valid: Vec<&BackendResponse> = responses
            .iter()
            .filter(|r| r.is_valid() && self.validate_quality(&r.text).is_valid)
            .collect();

        debug!(
            total = responses.len(),
            valid = valid.len(),
            "Merging backend responses"
        );

        match valid.len() {
            0 => Err(Error::NoValidResponses),
            1 => Ok(self.single_source(valid[0], &[])),
            _ => self.multi_source(&valid, trust_weights),
        }
    }

    fn single_source(&self, response: &BackendResponse, outliers: &[String]) -> ConsensusResult {
        let mut justification = format!(
            "Single-source consensus: only '{}' produced a usable answer",
            response.backend
        );
        if !outliers.is_empty() {
            justification.push_str(&format!(
                "; {} response(s) diverged too far to merge: {}",
                outliers.len(),
                outliers.join(", ")
            ));
        }
        ConsensusResult {
            text: response.text.clone(),
            confidence: self.config.single_source_confidence,
            contributors: vec![response.backend.clone()],
            outliers: outliers.to_vec(),
            justification,
        }
    }

    fn multi_source(
        &self,
        valid: &[&BackendResponse],
        trust_weights: &HashMap<String, f64>,
    ) -> Result<ConsensusResult> {
        let n = valid.len();

        // Pairwise matrix over all valid responses; the scorer caches each
        // unordered pair.
        let mut similarity = vec![vec![0.0f64; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let s = self.scorer.score(&valid[i].text, &valid[j].text);
                similarity[i][j] = s;
                similarity[j][i] = s;
            }
        }

        // Iterative outlier removal: one off-topic response drags every
        // mean down, so drop the worst below-threshold response and
        // re-evaluate the rest against each other. Agreement needs at least
        // two responses; a final lone survivor is an outlier set, not a
        // consensus.
        let mut survivors: Vec<usize> = (0..n).collect();
        let mut outliers: Vec<usize> = Vec::new();
        loop {
            if survivors.len() < 2 {
                outliers.append(&mut survivors);
                break;
            }
            let means: Vec<(usize, f64)> = survivors
                .iter()
                .map(|&i| {
                    let sum: f64 = survivors
                        .iter()
                        .filter(|&&j| j != i)
                        .map(|&j| similarity[i][j])
                        .sum();
                    (i, sum / (survivors.len() - 1) as f64)
                })
                .collect();
            match means
                .iter()
                .filter(|(_, mean)| *mean < self.config.min_similarity)
                .min_by(|a, b| a.1.total_cmp(&b.1))
            {
                Some(&(worst, _)) => {
                    survivors.retain(|&i| i != worst);
                    outliers.push(worst);
                }
                None => break,
            }
        }
        let outlier_names: Vec<String> =
            outliers.iter().map(|&i| valid[i].backend.clone()).collect();

        if !outlier_names.is_empty() {
            warn!(outliers = ?outlier_names, "Responses excluded from merge as outliers");
        }

        if survivors.is_empty() {
            if self.config.fail_on_no_agreement {
                return Err(Error::consensus(format!(
                    "no agreement among {} responses; every mean similarity fell \
                     below threshold {:.3}",
                    n, self.config.min_similarity
                )));
            }
            // Best-effort: keep the highest-quality response at bottom-band
            // confidence.
            let best = (0..n)
                .max_by(|&a, &b| {
                    quality::score(valid[a], &self.config.quality)
                        .total_cmp(&quality::score(valid[b], &self.config.quality))
                })
                .unwrap_or(0);
            let others: Vec<String> = (0..n)
                .filter(|&i| i != best)
                .map(|i| valid[i].backend.clone())
                .collect();
            let mut result = self.single_source(valid[best], &others);
            result.confidence = (self.config.min_similarity / 2.0)
                .min(self.config.single_source_confidence);
            result.justification = format!(
                "No agreement among {} responses; returning the highest-quality \
                 answer from '{}' at reduced confidence",
                n, valid[best].backend
            );
            return Ok(result);
        }

        // Consensus scores among survivors only.
        let survivor_mean_sim: HashMap<usize, f64> = survivors
            .iter()
            .map(|&i| {
                let sum: f64 = survivors
                    .iter()
                    .filter(|&&j| j != i)
                    .map(|&j| similarity[i][j])
                    .sum();
                (i, sum / (survivors.len() - 1) as f64)
            })
            .collect();

        let scores: HashMap<usize, f64> = survivors
            .iter()
            .map(|&i| {
                let response = valid[i];
                let trust = trust_weights
                    .get(&response.backend)
                    .copied()
                    .unwrap_or(1.0)
                    .clamp(0.0, 1.0);
                let score = self.config.score_similarity_weight * survivor_mean_sim[&i]
                    + self.config.score_quality_weight
                        * quality::score(response, &self.config.quality)
                    + self.config.score_trust_weight * trust;
                (i, score)
            })
            .collect();

        let base_idx = *survivors
            .iter()
            .max_by(|a, b| scores[a].total_cmp(&scores[b]))
            .expect("survivors is non-empty");
        let base = valid[base_idx];

        let mean_score =
            scores.values().sum::<f64>() / scores.len() as f64;
        let overall_mean_sim =
            survivor_mean_sim.values().sum::<f64>() / survivor_mean_sim.len() as f64;
        let variance = scores
            .values()
            .map(|s| (s - mean_score).powi(2))
            .sum::<f64>()
            / scores.len() as f64;

        let confidence = (self.config.confidence_score_weight * mean_score
            + self.config.confidence_similarity_weight * overall_mean_sim
            - self.config.variance_penalty * variance)
            .clamp(0.0, 1.0);

        let contributors: Vec<String> = survivors
            .iter()
            .map(|&i| valid[i].backend.clone())
            .collect();

        let (text, enriched) = if confidence >= self.config.high_confidence {
            (base.text.clone(), 0)
        } else {
            self.enrich(base, &survivors, base_idx, valid)
        };

        let mut justification = format!(
            "Consensus across {} of {} responses (base: '{}', mean similarity {:.2}, \
             mean score {:.2})",
            survivors.len(),
            n,
            base.backend,
            overall_mean_sim,
            mean_score
        );
        if enriched > 0 {
            justification.push_str(&format!(
                "; enriched with {} sentence(s) from agreeing responses",
                enriched
            ));
        }
        if !outlier_names.is_empty() {
            justification.push_str(&format!(
                "; excluded outliers: {}",
                outlier_names.join(", ")
            ));
        }
        if confidence < self.config.medium_confidence {
            justification.push_str(
                "; WARNING: low confidence, responses disagree substantially \
                 and the answer should be reviewed",
            );
        }

        info!(
            confidence,
            contributors = contributors.len(),
            outliers = outlier_names.len(),
            "Consensus reached"
        );

        Ok(ConsensusResult {
            text,
            confidence,
            contributors,
            outliers: outlier_names,
            justification,
        })
    }

    /// Appends up to `max_enrichment_sentences` non-redundant sentences from
    /// other surviving responses. A sentence is admitted only if it stays
    /// under the dedup threshold against every sentence already present.
    fn enrich(
        &self,
        base: &BackendResponse,
        survivors: &[usize],
        base_idx: usize,
        valid: &[&BackendResponse],
    ) -> (String, usize) {
        let mut sentences: Vec<String> = split_sentences(&base.text);
        let mut text = base.text.trim_end().to_string();
        let mut added = 0;

        'candidates: for &i in survivors.iter().filter(|&&i| i != base_idx) {
            for candidate in split_sentences(&valid[i].text) {
                if added >= self.config.max_enrichment_sentences {
                    break 'candidates;
                }
                let redundant = sentences
                    .iter()
                    .any(|existing| {
                        self.scorer.score(existing, &candidate) >= self.config.dedup_threshold
                    });
                if !redundant {
                    if !text.ends_with(['.', '!', '?']) {
                        text.push('.');
                    }
                    text.push(' ');
                    text.push_str(candidate.trim());
                    sentences.push(candidate);
                    added += 1;
                }
            }
        }

        (text, added)
    }
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let trimmed = current.trim();
            if trimmed.split_whitespace().count() >= 2 {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if rest.split_whitespace().count() >= 2 {
        sentences.push(rest.to_string());
    }
    sentences
}
