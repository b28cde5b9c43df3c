//! Prompt-embedding checkpoints: class names paired with their vectors.

use crate::cache::EmbeddingTable;
use crate::types::{EmbedResult, TextEmbedError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Serialized prompt embeddings produced by an earlier open-vocabulary run,
/// consumed by the linear-probe trainer to condition the classification head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEmbeddingCheckpoint {
    pub names: Vec<String>,
    /// One row per name, all rows the same length.
    pub embeddings: Vec<Vec<f32>>,
}

impl PromptEmbeddingCheckpoint {
    pub fn new(names: Vec<String>, embeddings: Vec<Vec<f32>>) -> Self {
        Self { names, embeddings }
    }

    pub fn class_count(&self) -> usize {
        self.names.len()
    }

    pub fn dimensions(&self) -> usize {
        self.embeddings.first().map(|v| v.len()).unwrap_or(0)
    }

    /// Row-major flat copy of the embedding matrix.
    pub fn flat_embeddings(&self) -> Vec<f32> {
        self.embeddings.iter().flatten().copied().collect()
    }

    pub fn to_table(&self) -> EmbeddingTable {
        EmbeddingTable::from_pairs(
            self.names
                .iter()
                .cloned()
                .zip(self.embeddings.iter().cloned()),
        )
    }

    fn validate(&self, path: &Path) -> EmbedResult<()> {
        if self.names.len() != self.embeddings.len() {
            return Err(TextEmbedError::Checkpoint {
                path: path.to_path_buf(),
                msg: format!(
                    "{} names but {} embedding rows",
                    self.names.len(),
                    self.embeddings.len()
                ),
            });
        }
        let dim = self.dimensions();
        if self.embeddings.iter().any(|row| row.len() != dim) {
            return Err(TextEmbedError::Checkpoint {
                path: path.to_path_buf(),
                msg: "embedding rows have mixed lengths".to_string(),
            });
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> EmbedResult<()> {
        self.validate(path)?;
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| TextEmbedError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }
        let data = serde_json::to_vec_pretty(self).map_err(|e| TextEmbedError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        fs::write(path, data).map_err(|e| TextEmbedError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn load(path: &Path) -> EmbedResult<Self> {
        let raw = fs::read(path).map_err(|e| TextEmbedError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let ckpt: Self = serde_json::from_slice(&raw).map_err(|e| TextEmbedError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        ckpt.validate(path)?;
        Ok(ckpt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_rows_are_rejected() {
        let ckpt = PromptEmbeddingCheckpoint::new(
            vec!["dog".to_string(), "cat".to_string()],
            vec![vec![0.1, 0.2]],
        );
        let tmp = std::env::temp_dir().join("pe_mismatch.json");
        assert!(ckpt.save(&tmp).is_err());
    }

    #[test]
    fn flat_embeddings_are_row_major() {
        let ckpt = PromptEmbeddingCheckpoint::new(
            vec!["a".to_string(), "b".to_string()],
            vec![vec![1.0, 2.0], vec![3.0, 4.0]],
        );
        assert_eq!(ckpt.flat_embeddings(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ckpt.dimensions(), 2);
        assert_eq!(ckpt.class_count(), 2);
    }
}
