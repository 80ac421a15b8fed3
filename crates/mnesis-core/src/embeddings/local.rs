//! Local Semantic Embeddings
//!
//! Two backends behind one service type:
//!
//! - **Local** (`embeddings` feature): fastembed ONNX inference with
//!   bge-small-en-v1.5. The model loads lazily on first use (may block for
//!   seconds while downloading); callers consult [`EmbeddingService::status`]
//!   and fall back to zero-vector paths while it warms.
//! - **Hashed**: deterministic character-trigram hashing. Identical text
//!   yields identical vectors and lexically close text yields high cosine
//!   similarity. Always ready; used by tests and feature-off builds.
//!
//! All produced vectors are 384-dimensional and L2-normalized.

use serde::{Deserialize, Serialize};

#[cfg(feature = "embeddings")]
use std::sync::{Mutex, OnceLock};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Embedding dimensions (bge-small-en-v1.5)
pub const EMBEDDING_DIM: usize = 384;

/// Maximum text length for embedding (truncated if longer)
pub const MAX_TEXT_LENGTH: usize = 8192;

/// Batch size for efficient embedding generation
#[cfg(feature = "embeddings")]
const BATCH_SIZE: usize = 32;

// ============================================================================
// GLOBAL MODEL (lazy, process-wide)
// ============================================================================

#[cfg(feature = "embeddings")]
static EMBEDDING_MODEL_RESULT: OnceLock<Result<Mutex<fastembed::TextEmbedding>, String>> =
    OnceLock::new();

#[cfg(feature = "embeddings")]
fn model_cache_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("FASTEMBED_CACHE_PATH") {
        return std::path::PathBuf::from(path);
    }
    if let Some(proj_dirs) = directories::ProjectDirs::from("app", "mnesis", "core") {
        return proj_dirs.cache_dir().join("fastembed");
    }
    crate::config::config_dir().join("model_cache")
}

#[cfg(feature = "embeddings")]
fn get_model()
-> Result<std::sync::MutexGuard<'static, fastembed::TextEmbedding>, EmbeddingError> {
    let result = EMBEDDING_MODEL_RESULT.get_or_init(|| {
        let cache_dir = model_cache_dir();
        if let Err(e) = std::fs::create_dir_all(&cache_dir) {
            tracing::warn!("Failed to create model cache directory {:?}: {}", cache_dir, e);
        }

        let options =
            fastembed::InitOptions::new(fastembed::EmbeddingModel::BGESmallENV15)
                .with_show_download_progress(false)
                .with_cache_dir(cache_dir);

        fastembed::TextEmbedding::try_new(options)
            .map(Mutex::new)
            .map_err(|e| {
                format!(
                    "Failed to initialize bge-small-en-v1.5 embedding model: {}. \
                     Ensure ONNX runtime is available and model files can be downloaded.",
                    e
                )
            })
    });

    match result {
        Ok(model) => model
            .lock()
            .map_err(|e| EmbeddingError::ModelInit(format!("Lock poisoned: {}", e))),
        Err(err) => Err(EmbeddingError::ModelInit(err.clone())),
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error types
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    /// Failed to initialize the embedding model
    #[error("Model initialization failed: {0}")]
    ModelInit(String),
    /// Failed to generate an embedding
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),
    /// Invalid input (empty text)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Embedder lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderStatus {
    Loading,
    Ready,
    Error,
}

// ============================================================================
// EMBEDDING TYPE
// ============================================================================

/// A semantic embedding vector
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// The embedding vector
    pub vector: Vec<f32>,
}

impl Default for Embedding {
    fn default() -> Self {
        Self::zero()
    }
}

impl Embedding {
    /// Create a new embedding from a vector
    pub fn new(vector: Vec<f32>) -> Self {
        Self { vector }
    }

    /// The all-zeros placeholder used when the embedder is not ready.
    pub fn zero() -> Self {
        Self {
            vector: vec![0.0; EMBEDDING_DIM],
        }
    }

    /// True when every component is (near) zero.
    pub fn is_zero(&self) -> bool {
        self.vector.iter().all(|v| v.abs() < 1e-9)
    }

    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }

    /// Compute cosine similarity with another embedding
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.vector, &other.vector)
    }

    /// Normalize the embedding vector to unit length
    pub fn normalize(&mut self) {
        let norm = self.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut self.vector {
                *x /= norm;
            }
        }
    }

    /// Check if the embedding is normalized (unit length)
    pub fn is_normalized(&self) -> bool {
        let norm = self.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        (norm - 1.0).abs() < 0.001
    }

    /// Convert to little-endian bytes for BLOB storage
    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Create from little-endian bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return None;
        }
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self::new(vector))
    }
}

// ============================================================================
// EMBEDDING SERVICE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    #[cfg(feature = "embeddings")]
    Local,
    Hashed,
}

/// Service for generating embeddings. Cheap to construct; the underlying
/// model is process-global and loads on first use.
pub struct EmbeddingService {
    backend: Backend,
}

impl Default for EmbeddingService {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingService {
    /// Default backend: local model when compiled in, hashed otherwise.
    pub fn new() -> Self {
        #[cfg(feature = "embeddings")]
        {
            Self {
                backend: Backend::Local,
            }
        }
        #[cfg(not(feature = "embeddings"))]
        {
            Self {
                backend: Backend::Hashed,
            }
        }
    }

    /// Deterministic trigram-hash backend. Always ready, no model download.
    pub fn hashed() -> Self {
        Self {
            backend: Backend::Hashed,
        }
    }

    /// Current lifecycle status.
    pub fn status(&self) -> EmbedderStatus {
        match self.backend {
            #[cfg(feature = "embeddings")]
            Backend::Local => match EMBEDDING_MODEL_RESULT.get() {
                Some(Ok(_)) => EmbedderStatus::Ready,
                Some(Err(_)) => EmbedderStatus::Error,
                None => EmbedderStatus::Loading,
            },
            Backend::Hashed => EmbedderStatus::Ready,
        }
    }

    /// Whether `embed` can be called without blocking on model load.
    pub fn is_ready(&self) -> bool {
        self.status() == EmbedderStatus::Ready
    }

    /// Force model initialization (downloads on first run). Blocking.
    pub fn init(&self) -> Result<(), EmbeddingError> {
        match self.backend {
            #[cfg(feature = "embeddings")]
            Backend::Local => get_model().map(|_| ()),
            Backend::Hashed => Ok(()),
        }
    }

    /// Model name for diagnostics.
    pub fn model_name(&self) -> &'static str {
        match self.backend {
            #[cfg(feature = "embeddings")]
            Backend::Local => crate::DEFAULT_EMBEDDING_MODEL,
            Backend::Hashed => "hashed-trigram-384",
        }
    }

    pub fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    /// Count tokens the way the embedding tokenizer would (approximation).
    pub fn count_tokens(&self, text: &str) -> usize {
        super::tokens::count_tokens(text)
    }

    /// Generate a unit embedding for a single text.
    pub fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput(
                "Text cannot be empty".to_string(),
            ));
        }
        let text = truncate_utf8(text, MAX_TEXT_LENGTH);

        match self.backend {
            #[cfg(feature = "embeddings")]
            Backend::Local => {
                let mut model = get_model()?;
                let embeddings = model
                    .embed(vec![text], None)
                    .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;
                let vector = embeddings
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        EmbeddingError::EmbeddingFailed("No embedding generated".to_string())
                    })?;
                let mut embedding = Embedding::new(vector);
                embedding.normalize();
                Ok(embedding)
            }
            Backend::Hashed => Ok(hashed_embedding(text)),
        }
    }

    /// Generate embeddings for multiple texts.
    pub fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        match self.backend {
            #[cfg(feature = "embeddings")]
            Backend::Local => {
                let mut model = get_model()?;
                let mut all = Vec::with_capacity(texts.len());
                for chunk in texts.chunks(BATCH_SIZE) {
                    let truncated: Vec<&str> =
                        chunk.iter().map(|t| truncate_utf8(t, MAX_TEXT_LENGTH)).collect();
                    let embeddings = model
                        .embed(truncated, None)
                        .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;
                    for vector in embeddings {
                        let mut embedding = Embedding::new(vector);
                        embedding.normalize();
                        all.push(embedding);
                    }
                }
                Ok(all)
            }
            Backend::Hashed => Ok(texts
                .iter()
                .map(|t| hashed_embedding(truncate_utf8(t, MAX_TEXT_LENGTH)))
                .collect()),
        }
    }
}

/// Truncate to a byte budget on a char boundary.
fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Deterministic trigram-hash embedding: each lowercase character trigram
/// increments one of 384 buckets (FNV-1a), then the vector is L2-normalized.
fn hashed_embedding(text: &str) -> Embedding {
    let mut vector = vec![0.0f32; EMBEDDING_DIM];
    let lowered = text.to_lowercase();
    let chars: Vec<char> = lowered.chars().collect();

    let mut bump = |bytes: &[u8]| {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in bytes {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        vector[(hash % EMBEDDING_DIM as u64) as usize] += 1.0;
    };

    if chars.len() < 3 {
        bump(lowered.as_bytes());
    } else {
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            bump(trigram.as_bytes());
        }
    }

    let mut embedding = Embedding::new(vector);
    embedding.normalize();
    embedding
}

// ============================================================================
// SIMILARITY FUNCTIONS
// ============================================================================

/// Compute cosine similarity between two vectors
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        dot_product / denominator
    } else {
        0.0
    }
}

// ============================================================================
// TESTS
// ============================================================================
