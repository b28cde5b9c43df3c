//! Dataset cards and the nested train/val data configuration.

use crate::types::{DataResult, DetectDataError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-dataset metadata card: root path, split subdirectories, class count
/// and names, and an optional minival split for large validation sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetCard {
    pub path: PathBuf,
    pub train: String,
    pub val: String,
    #[serde(default)]
    pub minival: Option<String>,
    pub nc: usize,
    pub names: Vec<String>,
}

impl DatasetCard {
    pub fn load(path: &Path) -> DataResult<Self> {
        let raw = fs::read(path).map_err(|e| DetectDataError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let card: Self = serde_json::from_slice(&raw).map_err(|e| DetectDataError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        if card.names.len() != card.nc {
            return Err(DetectDataError::Config(format!(
                "dataset card {} declares nc={} but lists {} names",
                path.display(),
                card.nc,
                card.names.len()
            )));
        }
        Ok(card)
    }

    pub fn train_path(&self) -> PathBuf {
        self.path.join(&self.train)
    }

    /// Split name used for validation: `minival` when the card carries one.
    pub fn val_split(&self) -> &str {
        if self.minival.is_some() {
            "minival"
        } else {
            "val"
        }
    }

    pub fn val_path(&self) -> PathBuf {
        match &self.minival {
            Some(minival) => self.path.join(minival),
            None => self.path.join(&self.val),
        }
    }
}

/// A single data source: a plain detection dataset (via its card) or a
/// grounding image/annotation pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSpec {
    Detection { card: PathBuf },
    Grounding { img_path: PathBuf, json_file: PathBuf },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SplitConfig {
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
}

/// Top-level data configuration with `train` and `val` splits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub train: Option<SplitConfig>,
    #[serde(default)]
    pub val: Option<SplitConfig>,
}

/// A train source with its split path resolved.
#[derive(Debug, Clone)]
pub enum ResolvedSource {
    Detection { card: DatasetCard, split_path: PathBuf },
    Grounding { img_path: PathBuf, json_file: PathBuf },
}

/// Unified dataset descriptor for one training run. Class count, names, and
/// root path come from the single validation dataset.
#[derive(Debug, Clone)]
pub struct ResolvedDataset {
    pub train: Vec<ResolvedSource>,
    pub val_card: DatasetCard,
    pub val_split: String,
    pub val_path: PathBuf,
    pub nc: usize,
    pub names: Vec<String>,
    pub path: PathBuf,
}

impl DataConfig {
    pub fn load(path: &Path) -> DataResult<Self> {
        let raw = fs::read(path).map_err(|e| DetectDataError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_slice(&raw).map_err(|e| DetectDataError::Json {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Resolves the configuration into a unified dataset descriptor.
    ///
    /// Structural checks (train/val present, exactly one validation dataset)
    /// run before any card is read from disk.
    pub fn resolve(&self) -> DataResult<ResolvedDataset> {
        let train = self
            .train
            .as_ref()
            .filter(|split| !split.sources.is_empty())
            .ok_or_else(|| DetectDataError::Config("train dataset not found".to_string()))?;
        let val = self
            .val
            .as_ref()
            .filter(|split| !split.sources.is_empty())
            .ok_or_else(|| DetectDataError::Config("validation dataset not found".to_string()))?;
        if val.sources.len() != 1 {
            return Err(DetectDataError::Config(format!(
                "only validating on 1 dataset is supported, but got {}",
                val.sources.len()
            )));
        }
        let val_card_path = match &val.sources[0] {
            SourceSpec::Detection { card } => card,
            SourceSpec::Grounding { .. } => {
                return Err(DetectDataError::Config(
                    "validation requires a plain detection dataset".to_string(),
                ))
            }
        };

        let val_card = DatasetCard::load(val_card_path)?;
        let mut train_sources = Vec::with_capacity(train.sources.len());
        for spec in &train.sources {
            match spec {
                SourceSpec::Detection { card } => {
                    let card = DatasetCard::load(card)?;
                    let split_path = card.train_path();
                    train_sources.push(ResolvedSource::Detection { card, split_path });
                }
                SourceSpec::Grounding { img_path, json_file } => {
                    train_sources.push(ResolvedSource::Grounding {
                        img_path: img_path.clone(),
                        json_file: json_file.clone(),
                    });
                }
            }
        }

        Ok(ResolvedDataset {
            train: train_sources,
            val_split: val_card.val_split().to_string(),
            val_path: val_card.val_path(),
            nc: val_card.nc,
            names: val_card.names.clone(),
            path: val_card.path.clone(),
            val_card,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_train_fails_before_io() {
        let cfg: DataConfig = serde_json::from_str(
            r#"{ "val": { "sources": [ { "detection": { "card": "/nonexistent/card.json" } } ] } }"#,
        )
        .unwrap();
        // The card path does not exist; the error must still be the config
        // check, proving no I/O was attempted first.
        let err = cfg.resolve().unwrap_err();
        assert!(matches!(err, DetectDataError::Config(ref msg) if msg.contains("train")));
    }

    #[test]
    fn missing_val_fails() {
        let cfg: DataConfig = serde_json::from_str(
            r#"{ "train": { "sources": [ { "detection": { "card": "/nonexistent/card.json" } } ] } }"#,
        )
        .unwrap();
        let err = cfg.resolve().unwrap_err();
        assert!(matches!(err, DetectDataError::Config(ref msg) if msg.contains("validation")));
    }

    #[test]
    fn two_validation_sources_fail() {
        let cfg: DataConfig = serde_json::from_str(
            r#"{
                "train": { "sources": [ { "detection": { "card": "/nonexistent/a.json" } } ] },
                "val": { "sources": [
                    { "detection": { "card": "/nonexistent/b.json" } },
                    { "detection": { "card": "/nonexistent/c.json" } }
                ] }
            }"#,
        )
        .unwrap();
        let err = cfg.resolve().unwrap_err();
        assert!(matches!(err, DetectDataError::Config(ref msg) if msg.contains("got 2")));
    }

    #[test]
    fn grounding_only_validation_is_rejected() {
        let cfg: DataConfig = serde_json::from_str(
            r#"{
                "train": { "sources": [ { "detection": { "card": "/nonexistent/a.json" } } ] },
                "val": { "sources": [
                    { "grounding": { "img_path": "/img", "json_file": "/ann.json" } }
                ] }
            }"#,
        )
        .unwrap();
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn card_val_split_prefers_minival() {
        let card = DatasetCard {
            path: PathBuf::from("/data/lvis"),
            train: "train".into(),
            val: "val".into(),
            minival: Some("minival".into()),
            nc: 1,
            names: vec!["person".into()],
        };
        assert_eq!(card.val_split(), "minival");
        assert_eq!(card.val_path(), PathBuf::from("/data/lvis/minival"));
    }
}
