//! Core types and error definitions for detect_data.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type DataResult<T> = Result<T, DetectDataError>;

#[derive(Debug, Error)]
pub enum DetectDataError {
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
    #[error("config error: {0}")]
    Config(String),
    #[error("label validation failed at {path}: {msg}")]
    Validation { path: PathBuf, msg: String },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("missing embedding for label {0:?}")]
    MissingEmbedding(String),
    #[error("{0}")]
    Other(String),
}

/// One annotated region: a free-text category plus its box in pixel or
/// normalized coordinates (at least one must be present).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionLabel {
    pub category: String,
    pub bbox_px: Option<[f32; 4]>,
    pub bbox_norm: Option<[f32; 4]>,
}

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("bbox_px invalid order or NaN: {0:?}")]
    InvalidBboxPx([f32; 4]),
    #[error("bbox_norm out of range: {0:?}")]
    InvalidBboxNorm([f32; 4]),
    #[error("empty category text")]
    EmptyCategory,
    #[error("no bbox provided")]
    MissingBbox,
    #[error("missing image path for present frame")]
    MissingImage,
}

impl DetectionLabel {
    pub fn validate(&self) -> Result<(), LabelError> {
        if self.category.trim().is_empty() {
            return Err(LabelError::EmptyCategory);
        }
        if self.bbox_px.is_none() && self.bbox_norm.is_none() {
            return Err(LabelError::MissingBbox);
        }
        if let Some(px) = self.bbox_px {
            if px.iter().any(|v| v.is_nan()) || px[0] > px[2] || px[1] > px[3] {
                return Err(LabelError::InvalidBboxPx(px));
            }
        }
        if let Some(norm) = self.bbox_norm {
            let in_range = norm.iter().all(|v| !v.is_nan() && (0.0..=1.0).contains(v));
            if !in_range || norm[0] > norm[2] || norm[1] > norm[3] {
                return Err(LabelError::InvalidBboxNorm(norm));
            }
        }
        Ok(())
    }
}

/// Per-frame metadata JSON stored next to the images of a detection split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub frame_id: u64,
    pub image: String,
    pub image_present: bool,
    pub labels: Vec<DetectionLabel>,
}

impl FrameMetadata {
    pub fn validate(&self) -> Result<(), LabelError> {
        if self.image_present && self.image.trim().is_empty() {
            return Err(LabelError::MissingImage);
        }
        for label in &self.labels {
            label.validate()?;
        }
        Ok(())
    }
}

/// One training sample: an image path plus its annotated regions.
#[derive(Debug, Clone)]
pub struct TrainSample {
    pub image: PathBuf,
    pub labels: Vec<DetectionLabel>,
}

impl TrainSample {
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|l| l.category.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_without_any_bbox_is_rejected() {
        let label = DetectionLabel {
            category: "dog".into(),
            bbox_px: None,
            bbox_norm: None,
        };
        assert!(matches!(label.validate(), Err(LabelError::MissingBbox)));
    }

    #[test]
    fn label_with_reversed_norm_bbox_is_rejected() {
        let label = DetectionLabel {
            category: "dog".into(),
            bbox_px: None,
            bbox_norm: Some([0.8, 0.1, 0.2, 0.5]),
        };
        assert!(matches!(
            label.validate(),
            Err(LabelError::InvalidBboxNorm(_))
        ));
    }

    #[test]
    fn empty_category_is_rejected() {
        let label = DetectionLabel {
            category: "  ".into(),
            bbox_px: None,
            bbox_norm: Some([0.1, 0.1, 0.2, 0.2]),
        };
        assert!(matches!(label.validate(), Err(LabelError::EmptyCategory)));
    }
}
