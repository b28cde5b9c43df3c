#![recursion_limit = "256"]

//! Trainer and validator variants for the open-vocabulary detector.

pub mod batch;
pub mod trainer;
pub mod validator;

pub use batch::{collate, CollatedBatch, IMAGE_FEATURES, INPUT_FEATURES};
pub use models::{DetectionOutput, OpenVocabDetector, OpenVocabDetectorConfig};
pub use trainer::{run_train, BackendKind, TrainMode, Trainer, TrainerArgs};
pub use validator::{DetectionValidator, EvalSummary, OpenVocabValidator, ValidatorKind};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
