//! Embedding model abstraction.

pub mod embedder;

pub use embedder::{EmbedFuture, Embedder, OllamaEmbedder};
