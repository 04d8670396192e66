use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jobmatch_core::{CandidateProfile, ErrorKind, Posting};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

pub const HASHED_MODEL_VERSION: &str = "hash-ngram-v1";
pub const DEFAULT_DIMENSIONS: usize = 384;
const MAX_DIMENSIONS: usize = 1 << 16;

const DEFAULT_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on", "or", "our", "the",
    "to", "we", "will", "with", "you", "your", "och", "att", "en", "ett", "för", "i", "med", "som", "till", "vi", "du",
    "är", "på", "av", "det",
];

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("cannot read embedding model {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("embedding model {path} is invalid: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

impl EmbeddingError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

/// Deterministic text embedder with a fixed output dimension.
pub trait Embedder: Send + Sync {
    fn model_version(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;

    fn embed_batch(&self, texts: &[&str]) -> Vec<Vec<f32>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// On-disk description of a hashed n-gram model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashedModelSpec {
    pub version: String,
    pub dimensions: usize,
    /// Per-feature weights; features not listed weigh 1.0.
    #[serde(default)]
    pub idf: HashMap<String, f32>,
    #[serde(default)]
    pub stopwords: Option<Vec<String>>,
}

/// Signed feature hashing over unigrams and bigrams with sublinear term frequency,
/// L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    version: String,
    dimensions: usize,
    idf: HashMap<String, f32>,
    stopwords: HashSet<String>,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            version: HASHED_MODEL_VERSION.to_string(),
            dimensions: dimensions.clamp(1, MAX_DIMENSIONS),
            idf: HashMap::new(),
            stopwords: DEFAULT_STOPWORDS.iter().map(|w| w.to_string()).collect(),
        }
    }

    pub fn from_spec(spec: HashedModelSpec, path: &Path) -> Result<Self, EmbeddingError> {
        let invalid = |reason: String| EmbeddingError::Invalid {
            path: path.to_path_buf(),
            reason,
        };
        if !spec.version.starts_with("hash-ngram-") {
            return Err(invalid(format!("unsupported model version {}", spec.version)));
        }
        if spec.dimensions == 0 || spec.dimensions > MAX_DIMENSIONS {
            return Err(invalid(format!("dimensions must be in 1..={MAX_DIMENSIONS}, got {}", spec.dimensions)));
        }
        if let Some((feature, weight)) = spec.idf.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(invalid(format!("weight for {feature:?} must be finite and non-negative, got {weight}")));
        }
        let stopwords = match spec.stopwords {
            Some(words) => words.into_iter().map(|w| w.to_lowercase()).collect(),
            None => DEFAULT_STOPWORDS.iter().map(|w| w.to_string()).collect(),
        };
        Ok(Self {
            version: spec.version,
            dimensions: spec.dimensions,
            idf: spec.idf,
            stopwords,
        })
    }

    pub async fn load(path: &Path) -> Result<Self, EmbeddingError> {
        let raw = tokio::fs::read(path).await.map_err(|source| EmbeddingError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let spec: HashedModelSpec = serde_json::from_slice(&raw).map_err(|e| EmbeddingError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_spec(spec, path)
    }

    fn tokens(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !(c.is_alphanumeric() || c == '+' || c == '#'))
            .filter(|t| !t.is_empty() && !self.stopwords.contains(*t))
            .map(str::to_string)
            .collect()
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        let hash = u64::from_le_bytes(word);
        let sign = if hash >> 63 == 1 { -1.0 } else { 1.0 };
        ((hash % self.dimensions as u64) as usize, sign)
    }
}

impl Embedder for HashingEmbedder {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let tokens = self.tokens(text);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *counts.entry(token.clone()).or_default() += 1;
        }
        for pair in tokens.windows(2) {
            *counts.entry(format!("{} {}", pair[0], pair[1])).or_default() += 1;
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for (feature, count) in &counts {
            let weight = self.idf.get(feature).copied().unwrap_or(1.0);
            let tf = 1.0 + (*count as f32).ln();
            let (index, sign) = self.bucket(feature);
            vector[index] += sign * tf * weight;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

/// The configured model, or the built-in hashed model when no path is given.
pub async fn load_embedder(path: Option<&Path>) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    let embedder = match path {
        Some(path) => HashingEmbedder::load(path).await?,
        None => HashingEmbedder::default(),
    };
    info!(
        model = embedder.model_version(),
        dimensions = embedder.dimensions(),
        "embedding model ready"
    );
    Ok(Arc::new(embedder))
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return None;
    }
    Some((dot / denom).clamp(-1.0, 1.0))
}

/// Monotonic map from cosine similarity onto `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityNormalization {
    /// `max(sim, 0)`
    #[default]
    ClampPositive,
    /// `(sim + 1) / 2`
    Rescale,
}

impl SimilarityNormalization {
    pub fn apply(&self, similarity: f64) -> f64 {
        let sim = if similarity.is_finite() { similarity.clamp(-1.0, 1.0) } else { 0.0 };
        match self {
            SimilarityNormalization::ClampPositive => sim.max(0.0),
            SimilarityNormalization::Rescale => (sim + 1.0) / 2.0,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "clamp" | "clamp_positive" => Some(SimilarityNormalization::ClampPositive),
            "rescale" => Some(SimilarityNormalization::Rescale),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct EmbeddingScorer {
    embedder: Arc<dyn Embedder>,
    normalization: SimilarityNormalization,
}

impl EmbeddingScorer {
    pub fn new(embedder: Arc<dyn Embedder>, normalization: SimilarityNormalization) -> Self {
        Self {
            embedder,
            normalization,
        }
    }

    pub fn model_version(&self) -> &str {
        self.embedder.model_version()
    }

    pub fn embed_profile(&self, profile: &CandidateProfile) -> Vec<f32> {
        self.embedder.embed(&profile.raw_text)
    }

    fn to_score(&self, profile_vector: &[f32], posting_vector: &[f32]) -> f64 {
        // an empty text embeds to the zero vector, which has no direction
        let similarity = cosine_similarity(profile_vector, posting_vector).unwrap_or(0.0);
        self.normalization.apply(similarity)
    }

    pub fn score(&self, profile_vector: &[f32], posting: &Posting) -> f64 {
        let posting_vector = self.embedder.embed(&posting.scoring_text());
        self.to_score(profile_vector, &posting_vector)
    }

    /// Scores in input order.
    pub fn score_batch(&self, profile_vector: &[f32], postings: &[Posting]) -> Vec<f64> {
        let texts: Vec<String> = postings.iter().map(Posting::scoring_text).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        self.embedder
            .embed_batch(&refs)
            .iter()
            .map(|posting_vector| self.to_score(profile_vector, posting_vector))
            .collect()
    }
}
