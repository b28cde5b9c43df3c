//! Text tokenization, label embedding, and on-disk embedding caches.
//!
//! This crate provides:
//! - A hash-bucket tokenizer for free-text category labels
//! - Text encoders (a Burn module and a deterministic hash fallback)
//! - Label embedding tables with cache-file persistence
//! - Prompt-embedding checkpoints (class names paired with their vectors)

pub mod cache;
pub mod checkpoint;
pub mod encoder;
pub mod tokenizer;
pub mod types;

pub use cache::{cached_label_embeddings, EmbeddingTable};
pub use checkpoint::PromptEmbeddingCheckpoint;
pub use encoder::{
    build_text_encoder, BagTextEncoder, BagTextEncoderConfig, HashTextEncoder, TextEncoder,
};
pub use tokenizer::HashTokenizer;
pub use types::{EmbedResult, TextEmbedError};
