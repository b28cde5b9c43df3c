//! Error definitions for text_embed.

use std::path::PathBuf;
use thiserror::Error;

pub type EmbedResult<T> = Result<T, TextEmbedError>;

#[derive(Debug, Error)]
pub enum TextEmbedError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoder failure: {0}")]
    Encode(String),
    #[error("checkpoint invalid at {path}: {msg}")]
    Checkpoint { path: PathBuf, msg: String },
    #[error("embedding count {vectors} does not match label count {labels}")]
    CountMismatch { labels: usize, vectors: usize },
}
