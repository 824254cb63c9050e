// Consensus layer: scores pairwise similarity between backend responses,
// filters low-quality or off-topic answers, and merges the survivors into
// a single result with a confidence estimate.

pub mod engine;
pub mod quality;
pub mod similarity;

pub use engine::{ConsensusConfig, ConsensusEngine, ConsensusResult};
pub use quality::{QualityConfig, QualityReport};
pub use similarity::{SimilarityScorer, SimilarityWeights};
