//! Grounding sources: an image directory plus one phrase annotation file.

use crate::transform::{AugmentStage, TextSampleStage, TransformStage};
use crate::types::{DataResult, DetectDataError, DetectionLabel, TrainSample};
use crate::detection::{DEFAULT_NEG_SAMPLES, DEFAULT_TEXT_SAMPLES};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One region of a grounding annotation: a free-text phrase and its box in
/// normalized coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingRegion {
    pub phrase: String,
    pub bbox_norm: [f32; 4],
}

/// One image entry of a grounding annotation file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingEntry {
    pub image: String,
    pub regions: Vec<GroundingRegion>,
}

/// An image+annotation grounding dataset.
///
/// Grounding phrases are open-ended, so the source exposes phrase
/// frequencies but no closed category-name set.
#[derive(Debug, Clone)]
pub struct GroundingSource {
    img_root: PathBuf,
    samples: Vec<TrainSample>,
    category_freq: HashMap<String, usize>,
    transforms: Vec<TransformStage>,
}

impl GroundingSource {
    pub fn load(img_path: &Path, json_file: &Path) -> DataResult<Self> {
        let raw = fs::read(json_file).map_err(|e| DetectDataError::Io {
            path: json_file.to_path_buf(),
            source: e,
        })?;
        let entries: Vec<GroundingEntry> =
            serde_json::from_slice(&raw).map_err(|e| DetectDataError::Json {
                path: json_file.to_path_buf(),
                source: e,
            })?;

        let mut samples = Vec::with_capacity(entries.len());
        let mut category_freq: HashMap<String, usize> = HashMap::new();
        for entry in entries {
            let mut labels = Vec::with_capacity(entry.regions.len());
            for region in entry.regions {
                let label = DetectionLabel {
                    category: region.phrase,
                    bbox_px: None,
                    bbox_norm: Some(region.bbox_norm),
                };
                label.validate().map_err(|e| DetectDataError::Validation {
                    path: json_file.to_path_buf(),
                    msg: format!("{} ({})", e, entry.image),
                })?;
                *category_freq.entry(label.category.clone()).or_insert(0) += 1;
                labels.push(label);
            }
            samples.push(TrainSample {
                image: img_path.join(&entry.image),
                labels,
            });
        }

        // Grounding data is train-only, so the text stage is always present.
        let transforms = vec![
            TransformStage::Augment(AugmentStage::default()),
            TransformStage::TextSample(TextSampleStage::new(
                DEFAULT_TEXT_SAMPLES,
                DEFAULT_NEG_SAMPLES,
            )),
        ];

        Ok(Self {
            img_root: img_path.to_path_buf(),
            samples,
            category_freq,
            transforms,
        })
    }

    pub fn img_root(&self) -> &Path {
        &self.img_root
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
