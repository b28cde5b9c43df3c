//! Dataset descriptors, loaders, and assembly for open-vocabulary detection.
//!
//! This crate provides:
//! - Dataset cards and the nested train/val data configuration
//! - Plain detection sources (per-frame label JSON + images)
//! - Grounding sources (image directory + phrase annotation file)
//! - Category frequency aggregation and negative-label selection
//! - Transform stages, including text-prompt sampling with injected
//!   label embeddings
//! - Order-preserving concatenation of heterogeneous sources

pub mod assembly;
pub mod config;
pub mod detection;
pub mod grounding;
pub mod transform;
pub mod types;

pub use assembly::{
    aggregate_category_freq, aggregate_category_names, assemble_training_dataset, negative_labels,
    MergedDataset, SourceDataset, TrainingDataset, NEG_FREQ_THRESHOLD,
};
pub use config::{DataConfig, DatasetCard, ResolvedDataset, ResolvedSource, SourceSpec, SplitConfig};
pub use detection::DetectionSource;
pub use grounding::{GroundingEntry, GroundingRegion, GroundingSource};
pub use transform::{AugmentStage, TextPrompts, TextSampleStage, TransformStage};
pub use types::{DataResult, DetectDataError, DetectionLabel, FrameMetadata, TrainSample};
