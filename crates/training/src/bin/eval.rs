use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::{Tensor, TensorData};
use clap::Parser;
use detect_data::{DataConfig, DetectionSource};
use std::path::Path;
use text_embed::{build_text_encoder, BagTextEncoderConfig, PromptEmbeddingCheckpoint};
use training::trainer::{validate_backend_choice, BackendKind};
use training::{
    DetectionValidator, OpenVocabDetector, OpenVocabDetectorConfig, OpenVocabValidator,
    TrainBackend, INPUT_FEATURES,
};

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Evaluate a detector checkpoint on the configured validation split (precision/recall by IoU)"
)]
struct Args {
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
    /// Data configuration path (train/val sources).
    #[arg(long, default_value = "assets/data.json")]
    data: String,
    /// Checkpoint path to load.
    #[arg(long)]
    checkpoint: Option<String>,
    /// Prompt-embedding checkpoint; when given, the model is rebuilt with
    /// fused classes (required to load linear-probe checkpoints) and eval
    /// runs class-free against the fused head.
    #[arg(long)]
    prompt_embeddings: Option<String>,
    /// Construct the model without the visual-prompt branch (required to
    /// load checkpoints trained with linear probing).
    #[arg(long, default_value_t = false)]
    no_visual_branch: bool,
    /// Text embedding width; must match the checkpoint.
    #[arg(long, default_value_t = 64)]
    embed_dim: usize,
    /// Maximum boxes per image; must match the checkpoint.
    #[arg(long, default_value_t = 64)]
    max_boxes: usize,
    /// Text encoder checkpoint; hash fallback otherwise.
    #[arg(long)]
    text_encoder: Option<String>,
    /// Objectness threshold for a positive prediction.
    #[arg(long, default_value_t = 0.3)]
    obj_thresh: f32,
    /// IoU threshold for a true positive.
    #[arg(long, default_value_t = 0.5)]
    iou_thresh: f32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    validate_backend_choice(args.backend)?;

    let data = DataConfig::load(Path::new(&args.data))?.resolve()?;
    let val_source = DetectionSource::load(&data.val_path, false)?;
    if val_source.is_empty() {
        println!("No validation samples found under {}", data.val_path.display());
        return Ok(());
    }

    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let prompt_ckpt = args
        .prompt_embeddings
        .as_ref()
        .map(|p| PromptEmbeddingCheckpoint::load(Path::new(p)))
        .transpose()?;

    let cfg = OpenVocabDetectorConfig {
        embed_dim: args.embed_dim,
        max_boxes: args.max_boxes,
        nc: data.nc,
        input_dim: Some(INPUT_FEATURES),
        visual_branch: !args.no_visual_branch,
        ..OpenVocabDetectorConfig::default()
    };
    let mut model = OpenVocabDetector::<TrainBackend>::new(cfg, &device);
    if let Some(ckpt) = &prompt_ckpt {
        let pe = Tensor::<TrainBackend, 2>::from_data(
            TensorData::new(ckpt.flat_embeddings(), [ckpt.class_count(), ckpt.dimensions()]),
            &device,
        );
        model = model.set_classes(pe).fuse_prompt_embeddings();
    }
    // Loading happens on the prepared model so fused-class checkpoints find
    // matching record shapes.
    let model = match &args.checkpoint {
        Some(path) => {
            let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
            match model.clone().load_file(Path::new(path), &recorder, &device) {
                Ok(loaded) => loaded,
                Err(e) => {
                    println!("Failed to load checkpoint {path}; using fresh model ({e})");
                    model
                }
            }
        }
        None => {
            println!("No checkpoint provided; using fresh model");
            model
        }
    };

    let base = DetectionValidator {
        obj_thresh: args.obj_thresh,
        iou_thresh: args.iou_thresh,
    };
    let summary = if prompt_ckpt.is_some() {
        base.validate(&model, &val_source, &device)?
    } else {
        let encoder = build_text_encoder::<TrainBackend>(
            BagTextEncoderConfig {
                embed_dim: args.embed_dim,
                ..BagTextEncoderConfig::default()
            },
            args.text_encoder.as_deref().map(Path::new),
            &device,
        );
        let validator = OpenVocabValidator::from_names(base, data.names.clone(), encoder.as_ref())?;
        validator.validate(&model, &val_source, &device)?
    };

    println!(
        "Eval complete on {} split: {} (iou_thresh={})",
        data.val_split,
        summary.describe(),
        args.iou_thresh
    );
    Ok(())
}
