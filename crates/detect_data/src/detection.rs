//! Plain detection sources: per-frame label JSON under `labels/` plus images.

use crate::transform::{AugmentStage, TextSampleStage, TransformStage};
use crate::types::{DataResult, DetectDataError, FrameMetadata, TrainSample};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Default cap on text prompts per image for multi-modal training.
pub const DEFAULT_TEXT_SAMPLES: usize = 80;
/// Default number of negatives sampled per image.
pub const DEFAULT_NEG_SAMPLES: usize = 16;

/// A fixed-category detection split loaded from disk.
///
/// Exposes category names and frequencies; both feed negative-label
/// selection and embedding generation during assembly.
#[derive(Debug, Clone)]
pub struct DetectionSource {
    root: PathBuf,
    samples: Vec<TrainSample>,
    category_names: BTreeSet<String>,
    category_freq: HashMap<String, usize>,
    transforms: Vec<TransformStage>,
}

impl DetectionSource {
    /// Scans `<split_path>/labels/*.json` and builds the sample list.
    ///
    /// `multi_modal` adds a text-sampling stage to the transform chain;
    /// validation loads use `false` and get augmentation only.
    pub fn load(split_path: &Path, multi_modal: bool) -> DataResult<Self> {
        let labels_dir = split_path.join("labels");
        let mut entries: Vec<PathBuf> = fs::read_dir(&labels_dir)
            .map_err(|e| DetectDataError::Io {
                path: labels_dir.clone(),
                source: e,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        entries.sort();

        let mut samples = Vec::with_capacity(entries.len());
        let mut category_names = BTreeSet::new();
        let mut category_freq: HashMap<String, usize> = HashMap::new();
        for path in entries {
            let raw = fs::read(&path).map_err(|e| DetectDataError::Io {
                path: path.clone(),
                source: e,
            })?;
            let meta: FrameMetadata =
                serde_json::from_slice(&raw).map_err(|e| DetectDataError::Json {
                    path: path.clone(),
                    source: e,
                })?;
            meta.validate().map_err(|e| DetectDataError::Validation {
                path: path.clone(),
                msg: e.to_string(),
            })?;
            if !meta.image_present {
                continue;
            }
            for label in &meta.labels {
                category_names.insert(label.category.clone());
                *category_freq.entry(label.category.clone()).or_insert(0) += 1;
            }
            samples.push(TrainSample {
                image: split_path.join(&meta.image),
                labels: meta.labels,
            });
        }

        // Validation loads keep augmentation inert.
        let augment = if multi_modal {
            AugmentStage::default()
        } else {
            AugmentStage {
                flip_horizontal_prob: 0.0,
                color_jitter_prob: 0.0,
                color_jitter_strength: 0.0,
            }
        };
        let mut transforms = vec![TransformStage::Augment(augment)];
        if multi_modal {
            transforms.push(TransformStage::TextSample(TextSampleStage::new(
                DEFAULT_TEXT_SAMPLES,
                DEFAULT_NEG_SAMPLES,
            )));
        }

        Ok(Self {
            root: split_path.to_path_buf(),
            samples,
            category_names,
            category_freq,
            transforms,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample(&self, index: usize) -> Option<&TrainSample> {
        self.samples.get(index)
    }

    pub fn samples(&self) -> &[TrainSample] {
        &self.samples
    }

    pub fn category_names(&self) -> &BTreeSet<String> {
        &self.category_names
    }

    pub fn category_freq(&self) -> &HashMap<String, usize> {
        &self.category_freq
    }

    pub fn transforms(&self) -> &[TransformStage] {
        &self.transforms
    }

    pub fn transforms_mut(&mut self) -> &mut [TransformStage] {
        &mut self.transforms
    }
}
