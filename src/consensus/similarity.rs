use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Component weights for the composite similarity score. Empirical defaults;
/// tune per deployment rather than treating them as invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub sequence: f64,
    pub keyword: f64,
    pub structure: f64,
    pub domain: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            sequence: 0.3,
            keyword: 0.3,
            structure: 0.2,
            domain: 0.2,
        }
    }
}

/// Pairwise text similarity with an unordered-pair cache. Reads dominate;
/// writes take the lock only on a miss.
pub struct SimilarityScorer {
    weights: SimilarityWeights,
    domain_vocabulary: Vec<String>,
    stopwords: HashSet<&'static str>,
    cache: RwLock<HashMap<(u64, u64), f64>>,
}

const STOPWORDS: &[&str] = &[
    // English
    "the", "a", "an", "of", "to", "and", "or", "is", "are", "was", "in", "on",
    "for", "with", "that", "this", "it", "as", "at", "by", "be", "not",
    // Portuguese
    "o", "os", "as", "um", "uma", "de", "do", "da", "dos", "das", "em", "no",
    "na", "nos", "nas", "que", "para", "com", "por", "sobre", "ser", "são",
    "é", "está", "e", "ou", "se", "ao", "à",
];

impl SimilarityScorer {
    pub fn new(weights: SimilarityWeights, domain_vocabulary: Vec<String>) -> Self {
        Self {
            weights,
            domain_vocabulary: domain_vocabulary
                .into_iter()
                .map(|term| term.to_lowercase())
                .collect(),
            stopwords: STOPWORDS.iter().copied().collect(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Composite score in [0, 1]. Symmetric: the cache key is the unordered
    /// text pair.
    pub fn score(&self, a: &str, b: &str) -> f64 {
        let key = pair_key(a, b);
        if let Some(&cached) = self.cache.read().get(&key) {
            trace!("Similarity cache hit");
            return cached;
        }

        let sequence = self.sequence_similarity(a, b);
        let keyword = self.keyword_similarity(a, b);
        let structure = self.structural_similarity(a, b);
        let domain = self.domain_similarity(a, b);

        let total = self.weights.sequence
            + self.weights.keyword
            + self.weights.structure
            + self.weights.domain;
        let score = if total <= f64::EPSILON {
            0.0
        } else {
            (self.weights.sequence * sequence
                + self.weights.keyword * keyword
                + self.weights.structure * structure
                + self.weights.domain * domain)
                / total
        };

        self.cache.write().insert(key, score);
        score
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    /// Token-level overlap ratio, 2M / (|a| + |b|) with M the length of the
    /// longest common subsequence of tokens.
    fn sequence_similarity(&self, a: &str, b: &str) -> f64 {
        let ta = tokenize(a);
        let tb = tokenize(b);
        if ta.is_empty() && tb.is_empty() {
            return 1.0;
        }
        if ta.is_empty() || tb.is_empty() {
            return 0.0;
        }
        let matches = lcs_len(&ta, &tb);
        2.0 * matches as f64 / (ta.len() + tb.len()) as f64
    }

    /// Jaccard similarity over content words (stopwords and very short
    /// tokens dropped).
    fn keyword_similarity(&self, a: &str, b: &str) -> f64 {
        let ka = self.keywords(a);
        let kb = self.keywords(b);
        jaccard(&ka, &kb)
    }

    /// Compares coarse shape: sentence, paragraph and list-item counts.
    fn structural_similarity(&self, a: &str, b: &str) -> f64 {
        let ratios = [
            count_ratio(sentence_count(a), sentence_count(b)),
            count_ratio(paragraph_count(a), paragraph_count(b)),
            count_ratio(list_item_count(a), list_item_count(b)),
        ];
        ratios.iter().sum::<f64>() / ratios.len() as f64
    }

    /// Overlap of domain vocabulary terms found in each text. Without a
    /// vocabulary there is no evidence of divergence, so score neutrally
    /// high; with one, two texts touching none of it compare as unknowns.
    fn domain_similarity(&self, a: &str, b: &str) -> f64 {
        if self.domain_vocabulary.is_empty() {
            return 1.0;
        }
        let ma = self.domain_terms(a);
        let mb = self.domain_terms(b);
        if ma.is_empty() && mb.is_empty() {
            return 0.5;
        }
        jaccard(&ma, &mb)
    }

    fn keywords(&self, text: &str) -> HashSet<String> {
        tokenize(text)
            .into_iter()
            .filter(|token| token.chars().count() >= 3)
            .filter(|token| !self.stopwords.contains(token.as_str()))
            .collect()
    }

    fn domain_terms(&self, text: &str) -> HashSet<String> {
        let lowered = text.to_lowercase();
        self.domain_vocabulary
            .iter()
            .filter(|term| lowered.contains(term.as_str()))
            .cloned()
            .collect()
    }
}

fn pair_key(a: &str, b: &str) -> (u64, u64) {
    let ha = text_hash(a);
    let hb = text_hash(b);
    (ha.min(hb), ha.max(hb))
}

fn text_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn lcs_len(a: &[String], b: &[String]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for token_a in a {
        for (j, token_b) in b.iter().enumerate() {
            curr[j + 1] = if token_a == token_b {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

fn count_ratio(a: usize, b: usize) -> f64 {
    let (min, max) = (a.min(b), a.max(b));
    if max == 0 {
        1.0
    } else {
        min as f64 / max as f64
    }
}

pub(crate) fn sentence_count(text: &str) -> usize {
    let count = text
        .split(['.', '!', '?'])
        .filter(|s| s.trim().split_whitespace().count() >= 2)
        .count();
    count.max(usize::from(!text.trim().is_empty()))
}

fn paragraph_count(text: &str) -> usize {
    text.split("\n\n").filter(|p| !p.trim().is_empty()).count()
}

fn list_item_count(text: &str) -> usize {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with('-')
                || trimmed.starts_with('*')
                || trimmed
                    .split_once(['.', ')'])
                    .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> SimilarityScorer {
        SimilarityScorer::new(SimilarityWeights::default(), vec![])
    }

    #[test]
    fn test_identical_texts_score_one() {
        let s = scorer();
        let text = "O DUAT é um direito real sobre a terra.";
        assert!((s.score(text, text) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unrelated_texts_score_low() {
        let s = scorer();
        let a = "O DUAT é um direito real sobre a terra em Moçambique.";
        let b = "Quantum entanglement links particle spins across distance.";
        assert!(s.score(a, b) < 0.5);
    }

    #[test]
    fn test_paraphrases_score_above_outlier_threshold() {
        let s = SimilarityScorer::new(
            SimilarityWeights::default(),
            vec!["duat".into(), "direito".into(), "terra".into(), "uso".into()],
        );
        let a = "O DUAT é um direito real sobre a terra";
        let b = "DUAT é o direito real de uso da terra";
        let score = s.score(a, b);
        assert!(score > 0.6, "score was {}", score);
    }

    #[test]
    fn test_symmetry_and_cache() {
        let s = scorer();
        let a = "first answer about contracts";
        let b = "second answer about leases";
        let ab = s.score(a, b);
        let ba = s.score(b, a);
        assert_eq!(ab, ba);
        // Unordered pair cached once.
        assert_eq!(s.cache_len(), 1);
    }

    #[test]
    fn test_domain_component_separates_topics() {
        let s = SimilarityScorer::new(
            SimilarityWeights {
                sequence: 0.0,
                keyword: 0.0,
                structure: 0.0,
                domain: 1.0,
            },
            vec!["duat".into(), "terra".into()],
        );
        let on_topic = "O DUAT garante o uso da terra";
        let off_topic = "O tempo em Maputo está ensolarado";
        assert_eq!(s.score(on_topic, off_topic), 0.0);
        assert_eq!(s.score(on_topic, on_topic), 1.0);
    }

    #[test]
    fn test_structural_similarity_counts_lists() {
        let s = scorer();
        let listed = "Requirements:\n- one\n- two\n- three";
        let prose = "The requirements are one, two and three.";
        let same_shape = "Steps:\n- alpha\n- beta\n- gamma";
        assert_eq!(s.structural_similarity(listed, same_shape), 1.0);
        assert!(s.structural_similarity(listed, prose) < 1.0);
    }

    #[test]
    fn test_lcs() {
        let a = tokenize("a b c d");
        let b = tokenize("a x c d y");
        assert_eq!(lcs_len(&a, &b), 3);
    }

    #[test]
    fn test_empty_inputs() {
        let s = scorer();
        assert_eq!(s.score("", ""), 1.0);
        assert!(s.score("some text here", "") < 0.6);
    }
}
