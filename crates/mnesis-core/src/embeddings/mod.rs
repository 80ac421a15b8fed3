//! Semantic Embeddings Module
//!
//! Local embedding generation, no external API calls. The default backend is
//! fastembed (ONNX) with bge-small-en-v1.5; a deterministic hashed backend
//! backs tests and builds without the `embeddings` feature.

mod local;
mod tokens;

pub use local::{
    cosine_similarity, EmbedderStatus, Embedding, EmbeddingError, EmbeddingService,
    EMBEDDING_DIM, MAX_TEXT_LENGTH,
};

pub use tokens::count_tokens;
