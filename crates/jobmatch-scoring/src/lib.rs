//! Profile extraction, local similarity, remote evaluation and score calibration.

mod calibration;
mod embedding;
mod evaluator;
mod profile;

pub use calibration::{CalibrationError, CalibrationWeights, ScoreCalibrator};
pub use embedding::{
    cosine_similarity, load_embedder, Embedder, EmbeddingError, EmbeddingScorer, HashedModelSpec, HashingEmbedder,
    SimilarityNormalization, DEFAULT_DIMENSIONS, HASHED_MODEL_VERSION,
};
pub use evaluator::{
    parse_assessment, ChatMessage, ChatRole, EvaluatorConfig, EvaluatorError, ExternalEvaluator, OpenAiCompatibleClient,
    OpenAiCompatibleConfig, ReasoningTransport, SchemaViolation, TransportError,
};
pub use profile::{profile_fingerprint, ProfileError, ProfileExtractor};

pub const CRATE_NAME: &str = "jobmatch-scoring";
