//! Label embedding tables and the on-disk embedding cache.

use crate::encoder::TextEncoder;
use crate::types::{EmbedResult, TextEmbedError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Ordered label -> vector mapping, persisted as a single JSON file.
///
/// Entry order matches the label order the table was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingTable {
    entries: Vec<EmbeddingEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingEntry {
    pub label: String,
    pub vector: Vec<f32>,
}

impl EmbeddingTable {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<f32>)>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(label, vector)| EmbeddingEntry { label, vector })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    pub fn entries(&self) -> &[EmbeddingEntry] {
        &self.entries
    }

    pub fn get(&self, label: &str) -> Option<&[f32]> {
        self.entries
            .iter()
            .find(|e| e.label == label)
            .map(|e| e.vector.as_slice())
    }

    /// Vector length, taken from the first entry (0 for an empty table).
    pub fn dimensions(&self) -> usize {
        self.entries.first().map(|e| e.vector.len()).unwrap_or(0)
    }

    pub fn save(&self, path: &Path) -> EmbedResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| TextEmbedError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }
        let data = serde_json::to_vec(self).map_err(|e| TextEmbedError::Json {
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
        serde_json::from_slice(&raw).map_err(|e| TextEmbedError::Json {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Returns label embeddings, loading from `cache_path` when it exists and
/// computing + persisting them otherwise.
///
/// A present cache file is returned verbatim; its keys are not checked
/// against `labels` (labels are assumed stable per cache path). Computation
/// is all-or-nothing: a failure mid-batch leaves no cache file behind, and
/// nothing guards against two processes writing the same path.
pub fn cached_label_embeddings(
    encoder: &dyn TextEncoder,
    labels: &[String],
    batch: usize,
    cache_path: &Path,
) -> EmbedResult<EmbeddingTable> {
    if cache_path.exists() {
        return EmbeddingTable::load(cache_path);
    }

    let batch = batch.max(1);
    let mut vectors = Vec::with_capacity(labels.len());
    for chunk in labels.chunks(batch) {
        vectors.extend(encoder.encode_batch(chunk)?);
    }
    if vectors.len() != labels.len() {
        return Err(TextEmbedError::CountMismatch {
            labels: labels.len(),
            vectors: vectors.len(),
        });
    }

    let table = EmbeddingTable::from_pairs(labels.iter().cloned().zip(vectors));
    table.save(cache_path)?;
    println!(
        "encoded {} label embeddings with {} -> {}",
        table.len(),
        encoder.model_id(),
        cache_path.display()
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_preserves_insertion_order() {
        let table = EmbeddingTable::from_pairs(vec![
            ("zebra".to_string(), vec![0.0, 1.0]),
            ("ant".to_string(), vec![1.0, 0.0]),
        ]);
        let labels: Vec<&str> = table.labels().collect();
        assert_eq!(labels, ["zebra", "ant"]);
        assert_eq!(table.get("ant"), Some(&[1.0, 0.0][..]));
        assert_eq!(table.dimensions(), 2);
    }

    #[test]
    fn empty_table_has_zero_dimensions() {
        let table = EmbeddingTable::from_pairs(Vec::<(String, Vec<f32>)>::new());
        assert!(table.is_empty());
        assert_eq!(table.dimensions(), 0);
    }
}
