//! Trainer variants for the open-vocabulary detector.
//!
//! One trainer drives all modes; `TrainMode` selects the model-construction
//! policy, the dataset shape, which batch features reach the device, and the
//! validator attached for final evaluation.

use crate::batch::{collate, CollatedBatch, INPUT_FEATURES};
use crate::validator::{DetectionValidator, OpenVocabValidator, ValidatorKind};
use crate::TrainBackend;
use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use clap::{Parser, ValueEnum};
use detect_data::{
    aggregate_category_freq, aggregate_category_names, assemble_training_dataset, negative_labels,
    DataConfig, DetectionSource, GroundingSource, ResolvedDataset, ResolvedSource, SourceDataset,
    TrainSample, TrainingDataset, NEG_FREQ_THRESHOLD,
};
use models::{DetectionOutput, OpenVocabDetector, OpenVocabDetectorConfig};
use std::fs;
use std::path::{Path, PathBuf};
use text_embed::{
    build_text_encoder, cached_label_embeddings, BagTextEncoderConfig, EmbeddingTable,
    PromptEmbeddingCheckpoint, TextEncoder,
};

type ADBackend = Autodiff<TrainBackend>;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainMode {
    /// Fine-tune with text prompts on a single detection dataset.
    Standard,
    /// Linear probing: frozen backbone, fused prompt embeddings, fresh
    /// trainable head projections.
    LinearProbe,
    /// Train from scratch on mixed detection + grounding sources.
    FromScratch,
    /// Prompt-free: linear-probe model surgery on the from-scratch dataset,
    /// text features dropped from batches.
    PromptFree,
    /// From-scratch training with per-image visual prompts.
    VisualPrompt,
}

impl TrainMode {
    /// Modes that assemble every configured train source; the rest train on
    /// the first detection source alone.
    pub fn multi_source(&self) -> bool {
        matches!(
            self,
            TrainMode::FromScratch | TrainMode::PromptFree | TrainMode::VisualPrompt
        )
    }

    /// Modes whose batches carry text features onto the device.
    pub fn uses_text_features(&self) -> bool {
        !matches!(self, TrainMode::PromptFree | TrainMode::LinearProbe)
    }

    /// Modes whose datasets sample text prompts (and therefore need the
    /// embedding caches built).
    pub fn samples_text(&self) -> bool {
        !matches!(self, TrainMode::LinearProbe)
    }

    /// Modes that require a prompt-embedding checkpoint for head fusion.
    pub fn needs_prompt_checkpoint(&self) -> bool {
        matches!(self, TrainMode::LinearProbe | TrainMode::PromptFree)
    }

    pub fn uses_visual_prompts(&self) -> bool {
        matches!(self, TrainMode::VisualPrompt)
    }

    /// The validator attached to this mode. Prompt-free evaluation has no
    /// text conditioning, so it gets the plain detection validator.
    pub fn validator(&self) -> ValidatorKind {
        match self {
            TrainMode::PromptFree => ValidatorKind::Plain,
            _ => ValidatorKind::OpenVocab,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            println!("note: built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "train",
    about = "Train the open-vocabulary detector (text, prompt-free, and visual-prompt modes)"
)]
pub struct TrainerArgs {
    /// Training mode.
    #[arg(long, value_enum, default_value_t = TrainMode::Standard)]
    pub mode: TrainMode,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Data configuration path (train/val sources).
    #[arg(long, default_value = "assets/data.json")]
    pub data: String,
    /// Number of epochs.
    #[arg(long, default_value_t = 1)]
    pub epochs: usize,
    /// Batch size.
    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,
    /// Learning rate.
    #[arg(long, default_value_t = 1e-3)]
    pub lr: f32,
    /// Maximum boxes per image (pads/truncates to this for training).
    #[arg(long, default_value_t = 64)]
    pub max_boxes: usize,
    /// Cap on distinct text samples per image; the dataset class count is
    /// clamped to this for all modes except linear probing.
    #[arg(long, default_value_t = 80)]
    pub nc_cap: usize,
    /// Text embedding width.
    #[arg(long, default_value_t = 64)]
    pub embed_dim: usize,
    /// Batch size for label embedding generation.
    #[arg(long, default_value_t = 32)]
    pub embed_batch: usize,
    /// Loss weight for box regression.
    #[arg(long, default_value_t = 1.0)]
    pub lambda_box: f32,
    /// Loss weight for objectness.
    #[arg(long, default_value_t = 1.0)]
    pub lambda_obj: f32,
    /// Loss weight for region classification.
    #[arg(long, default_value_t = 0.5)]
    pub lambda_cls: f32,
    /// Objectness threshold for evaluation.
    #[arg(long, default_value_t = 0.3)]
    pub obj_thresh: f32,
    /// IoU threshold for evaluation.
    #[arg(long, default_value_t = 0.5)]
    pub iou_thresh: f32,
    /// Initial weights checkpoint to load.
    #[arg(long)]
    pub weights: Option<String>,
    /// Prompt-embedding checkpoint fused into the head for linear probing
    /// and prompt-free training.
    #[arg(long)]
    pub prompt_embeddings: Option<String>,
    /// Text encoder checkpoint; the deterministic hash encoder is used when
    /// absent.
    #[arg(long)]
    pub text_encoder: Option<String>,
    /// Checkpoint output path.
    #[arg(long)]
    pub checkpoint_out: Option<String>,
}

impl TrainerArgs {
    /// Programmatic construction with the CLI defaults.
    pub fn new(mode: TrainMode, data: impl Into<String>) -> Self {
        Self {
            mode,
            backend: BackendKind::NdArray,
            data: data.into(),
            epochs: 1,
            batch_size: 2,
            lr: 1e-3,
            max_boxes: 64,
            nc_cap: 80,
            embed_dim: 64,
            embed_batch: 32,
            lambda_box: 1.0,
            lambda_obj: 1.0,
            lambda_cls: 0.5,
            obj_thresh: 0.3,
            iou_thresh: 0.5,
            weights: None,
            prompt_embeddings: None,
            text_encoder: None,
            checkpoint_out: None,
        }
    }
}

pub fn run_train(args: TrainerArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    Trainer::new(args)?.run()
}

/// One training run: resolved dataset plus the mode-dependent policies.
pub struct Trainer {
    args: TrainerArgs,
    data: ResolvedDataset,
}

impl Trainer {
    pub fn new(args: TrainerArgs) -> anyhow::Result<Self> {
        let config = DataConfig::load(Path::new(&args.data))?;
        let data = config.resolve()?;
        Ok(Self { args, data })
    }

    pub fn mode(&self) -> TrainMode {
        self.args.mode
    }

    pub fn data(&self) -> &ResolvedDataset {
        &self.data
    }

    /// Builds the model per the mode's construction policy.
    ///
    /// All modes except linear probing clamp the class count to `nc_cap`:
    /// the value bounds distinct text samples per image, not the real
    /// vocabulary size. Linear probing keeps the full count, drops the
    /// visual-prompt branch, fuses the prompt-embedding checkpoint into the
    /// head, and reinitializes the head projections as the only trainable
    /// part besides the fused classes.
    pub fn build_model<B: Backend>(
        &self,
        prompt_ckpt: Option<&PromptEmbeddingCheckpoint>,
        device: &B::Device,
    ) -> anyhow::Result<OpenVocabDetector<B>> {
        let mode = self.args.mode;
        let nc = if mode.needs_prompt_checkpoint() {
            self.data.nc
        } else {
            self.data.nc.min(self.args.nc_cap)
        };
        let cfg = OpenVocabDetectorConfig {
            embed_dim: self.args.embed_dim,
            max_boxes: self.args.max_boxes,
            nc,
            input_dim: Some(INPUT_FEATURES),
            visual_branch: true,
            ..OpenVocabDetectorConfig::default()
        };
        let mut model = OpenVocabDetector::<B>::new(cfg, device);

        if let Some(weights) = &self.args.weights {
            let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
            model = model
                .load_file(Path::new(weights), &recorder, device)
                .map_err(|e| anyhow::anyhow!("failed to load weights {weights}: {e}"))?;
        }

        if mode.needs_prompt_checkpoint() {
            let ckpt = prompt_ckpt.ok_or_else(|| {
                anyhow::anyhow!("--prompt-embeddings is required for {:?} training", mode)
            })?;
            if ckpt.dimensions() != self.args.embed_dim {
                anyhow::bail!(
                    "prompt embeddings are {}-dimensional but the model expects {}",
                    ckpt.dimensions(),
                    self.args.embed_dim
                );
            }
            let pe = Tensor::<B, 2>::from_data(
                TensorData::new(
                    ckpt.flat_embeddings(),
                    [ckpt.class_count(), ckpt.dimensions()],
                ),
                device,
            );
            model = model
                .without_visual_branch()
                .set_classes(pe)
                .fuse_prompt_embeddings()
                .reinit_class_head(device);
        }

        Ok(model)
    }

    fn load_prompt_checkpoint(&self) -> anyhow::Result<Option<PromptEmbeddingCheckpoint>> {
        if !self.args.mode.needs_prompt_checkpoint() {
            return Ok(None);
        }
        let path = self.args.prompt_embeddings.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "--prompt-embeddings is required for {:?} training",
                self.args.mode
            )
        })?;
        Ok(Some(PromptEmbeddingCheckpoint::load(Path::new(path))?))
    }

    fn first_detection_split(&self) -> anyhow::Result<PathBuf> {
        self.data
            .train
            .iter()
            .find_map(|source| match source {
                ResolvedSource::Detection { split_path, .. } => Some(split_path.clone()),
                ResolvedSource::Grounding { .. } => None,
            })
            .ok_or_else(|| anyhow::anyhow!("no detection dataset among train sources"))
    }

    fn load_train_sources(&self) -> anyhow::Result<Vec<SourceDataset>> {
        let multi_modal = self.args.mode.samples_text();
        if !self.args.mode.multi_source() {
            let split = self.first_detection_split()?;
            let source = DetectionSource::load(&split, multi_modal)?;
            return Ok(vec![SourceDataset::Detection(source)]);
        }
        let mut sources = Vec::with_capacity(self.data.train.len());
        for resolved in &self.data.train {
            let source = match resolved {
                ResolvedSource::Detection { split_path, .. } => {
                    SourceDataset::Detection(DetectionSource::load(split_path, multi_modal)?)
                }
                ResolvedSource::Grounding { img_path, json_file } => {
                    SourceDataset::Grounding(GroundingSource::load(img_path, json_file)?)
                }
            };
            sources.push(source);
        }
        Ok(sources)
    }

    /// Assembles the training dataset, generating (or loading) the pos/neg
    /// embedding caches next to the first source's root.
    pub fn build_train_dataset(
        &self,
        encoder: &dyn TextEncoder,
    ) -> anyhow::Result<TrainingDataset> {
        let sources = self.load_train_sources()?;
        if !self.args.mode.samples_text() {
            let pos = EmbeddingTable::from_pairs(Vec::new());
            let neg = EmbeddingTable::from_pairs(Vec::new());
            return Ok(assemble_training_dataset(sources, &pos, &neg)?);
        }

        let mut names = aggregate_category_names(&sources);
        let freq = aggregate_category_freq(&sources);
        // Open-ended phrases carry no closed name set but still need
        // embeddings; fold the frequency keys in.
        names.extend(freq.keys().cloned());
        let pos_names: Vec<String> = names.into_iter().collect();
        let neg_names = negative_labels(&freq, NEG_FREQ_THRESHOLD);

        let first_root = sources[0].root().to_path_buf();
        let cache_dir = first_root.parent().unwrap_or(&first_root).to_path_buf();
        let pos = cached_label_embeddings(
            encoder,
            &pos_names,
            self.args.embed_batch,
            &cache_dir.join("pos_embeddings.json"),
        )?;
        let neg = cached_label_embeddings(
            encoder,
            &neg_names,
            self.args.embed_batch,
            &cache_dir.join("neg_embeddings.json"),
        )?;

        Ok(assemble_training_dataset(sources, &pos, &neg)?)
    }

    pub fn build_val_dataset(&self) -> anyhow::Result<DetectionSource> {
        Ok(DetectionSource::load(&self.data.val_path, false)?)
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.args
            .checkpoint_out
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("checkpoints/openvocab_detector.bin"))
    }

    pub fn run(&self) -> anyhow::Result<()> {
        let device = <ADBackend as Backend>::Device::default();
        let encoder = build_text_encoder::<ADBackend>(
            BagTextEncoderConfig {
                embed_dim: self.args.embed_dim,
                ..BagTextEncoderConfig::default()
            },
            self.args.text_encoder.as_deref().map(Path::new),
            &device,
        );

        let prompt_ckpt = self.load_prompt_checkpoint()?;
        let mut model = self.build_model::<ADBackend>(prompt_ckpt.as_ref(), &device)?;
        let dataset = self.build_train_dataset(encoder.as_ref())?;
        if dataset.is_empty() {
            anyhow::bail!("training dataset is empty");
        }
        let fused_names: Option<Vec<String>> = prompt_ckpt.map(|c| c.names);

        let ckpt_path = self.checkpoint_path();
        if let Some(parent) = ckpt_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("failed to create {:?}: {e}", parent)
            })?;
        }

        let mode = self.args.mode;
        let freeze_backbone = mode.needs_prompt_checkpoint();
        let mut optim = AdamConfig::new().init();
        let mut rng = rand::rng();
        let batch_size = self.args.batch_size.max(1);
        let visual_dim = mode.uses_visual_prompts().then_some(self.args.embed_dim);

        for epoch in 0..self.args.epochs {
            let mut losses = Vec::new();
            let indices: Vec<usize> = (0..dataset.len()).collect();
            for chunk in indices.chunks(batch_size) {
                let samples: Vec<&TrainSample> =
                    chunk.iter().filter_map(|i| dataset.sample(*i)).collect();
                let stages = dataset
                    .source_for(chunk[0])
                    .map(|s| s.transforms())
                    .unwrap_or(&[]);
                let batch = collate::<ADBackend>(
                    &samples,
                    stages,
                    self.args.max_boxes,
                    visual_dim,
                    &mut rng,
                    &device,
                )?;
                let batch = preprocess_batch(batch, mode, &device);

                let (loss, loss_val) =
                    self.training_step(&model, &batch, fused_names.as_deref(), freeze_backbone)?;
                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(self.args.lr as f64, model, grads);
                losses.push(loss_val);
            }
            let avg_loss: f32 = if losses.is_empty() {
                0.0
            } else {
                losses.iter().sum::<f32>() / losses.len() as f32
            };
            println!("epoch {epoch}: avg loss {avg_loss:.4}");
        }

        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        model
            .clone()
            .save_file(&ckpt_path, &recorder)
            .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;
        println!("Saved checkpoint to {}", ckpt_path.display());

        if mode.samples_text() && mode.uses_text_features() {
            self.export_prompt_embeddings(encoder.as_ref(), &ckpt_path)?;
        }

        self.final_eval(&model.valid(), encoder.as_ref())?;
        Ok(())
    }

    /// One forward/loss computation. Returns the autodiff loss tensor and
    /// its detached scalar value.
    fn training_step(
        &self,
        model: &OpenVocabDetector<ADBackend>,
        batch: &CollatedBatch<ADBackend>,
        fused_names: Option<&[String]>,
        freeze_backbone: bool,
    ) -> anyhow::Result<(Tensor<ADBackend, 1>, f32)> {
        let mode = self.args.mode;
        let (output, class_labels): (DetectionOutput<ADBackend>, Vec<String>) =
            if mode.uses_text_features() {
                let txt_feats = batch
                    .txt_feats
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("batch carries no text features"))?;
                let labels = batch
                    .prompts
                    .as_ref()
                    .map(|p| p.labels.clone())
                    .unwrap_or_default();
                (
                    model.forward_open_vocab(batch.inputs.clone(), txt_feats, freeze_backbone),
                    labels,
                )
            } else {
                let output = model
                    .forward_fused(batch.inputs.clone(), freeze_backbone)
                    .ok_or_else(|| anyhow::anyhow!("no fused classes available for {mode:?}"))?;
                (output, fused_names.unwrap_or_default().to_vec())
            };

        let gt_classes = class_columns(&batch.categories, &class_labels, self.args.max_boxes);
        let num_classes = class_labels.len().max(1);
        let (obj_targets, box_targets, box_weights, cls_targets, cls_weights) = build_targets(
            output.boxes.clone(),
            batch.boxes.clone(),
            batch.box_mask.clone(),
            &gt_classes,
            num_classes,
        );

        let eps = 1e-6;
        let scores = output.scores.clone().clamp(eps, 1.0 - eps);
        let obj_loss = bce_loss_2d(scores, obj_targets.clone());

        let box_err = (output.boxes.clone() - box_targets) * box_weights.clone();
        let matched = box_weights.clone().sum().div_scalar(4.0);
        let matched_scalar = matched
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default()
            .first()
            .copied()
            .unwrap_or(0.0);
        let box_loss = if matched_scalar > 0.0 {
            box_err.abs().sum().div_scalar(matched_scalar)
        } else {
            zero_scalar(&box_weights.device())
        };

        let cls_probs =
            burn::tensor::activation::sigmoid(output.class_logits.clone()).clamp(eps, 1.0 - eps);
        let cls_inv = Tensor::<ADBackend, 3>::ones(cls_targets.dims(), &cls_targets.device())
            - cls_targets.clone();
        let cls_bce = -((cls_targets * cls_probs.clone().log())
            + (cls_inv
                * (Tensor::<ADBackend, 3>::ones(cls_probs.dims(), &cls_probs.device())
                    - cls_probs)
                    .log()))
            * cls_weights;
        let cls_loss = if matched_scalar > 0.0 {
            cls_bce
                .sum()
                .div_scalar(matched_scalar * num_classes as f32)
        } else {
            zero_scalar(&output.scores.device())
        };

        let mut loss = box_loss * self.args.lambda_box
            + obj_loss * self.args.lambda_obj
            + cls_loss * self.args.lambda_cls;

        // Visual prompts contribute a second objectness signal.
        if let Some(visuals) = batch.visuals.clone() {
            if let Some(sim) = model.forward_visual_prompts(
                batch.inputs.clone(),
                visuals,
                freeze_backbone,
            ) {
                let probs = burn::tensor::activation::sigmoid(sim).clamp(eps, 1.0 - eps);
                loss = loss + bce_loss_2d(probs, obj_targets) * self.args.lambda_obj;
            }
        }

        let loss_val: f32 = loss
            .clone()
            .detach()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default()
            .into_iter()
            .next()
            .unwrap_or(0.0);
        Ok((loss, loss_val))
    }

    /// Persists the validation-class prompt embeddings next to the model
    /// checkpoint, for later linear-probe or prompt-free runs.
    fn export_prompt_embeddings(
        &self,
        encoder: &dyn TextEncoder,
        ckpt_path: &Path,
    ) -> anyhow::Result<()> {
        let vectors = encoder.encode_batch(&self.data.names)?;
        let pe = PromptEmbeddingCheckpoint::new(self.data.names.clone(), vectors);
        let pe_path = ckpt_path.with_extension("pe.json");
        pe.save(&pe_path)?;
        println!("Saved prompt embeddings to {}", pe_path.display());
        Ok(())
    }

    /// Runs the mode's validator once on the resolved validation split.
    pub fn final_eval(
        &self,
        model: &OpenVocabDetector<TrainBackend>,
        encoder: &dyn TextEncoder,
    ) -> anyhow::Result<()> {
        let device = <TrainBackend as Backend>::Device::default();
        let val_source = self.build_val_dataset()?;
        let base = DetectionValidator {
            obj_thresh: self.args.obj_thresh,
            iou_thresh: self.args.iou_thresh,
        };
        let summary = match self.args.mode.validator() {
            ValidatorKind::Plain => base.validate(model, &val_source, &device)?,
            ValidatorKind::OpenVocab => {
                let validator =
                    OpenVocabValidator::from_names(base, self.data.names.clone(), encoder)?;
                validator.validate(model, &val_source, &device)?
            }
        };
        println!(
            "final eval on {} split: {}",
            self.data.val_split,
            summary.describe()
        );
        Ok(())
    }
}

/// Drops or keeps device-bound extras per mode: text features for modes that
/// consume them, visual prompts only for visual-prompt training.
pub fn preprocess_batch<B: Backend>(
    mut batch: CollatedBatch<B>,
    mode: TrainMode,
    device: &B::Device,
) -> CollatedBatch<B> {
    if mode.uses_text_features() {
        if let Some(feats) = batch.txt_feats.take() {
            batch.txt_feats = Some(feats.to_device(device));
        }
    } else {
        batch.txt_feats = None;
        batch.prompts = None;
    }
    if mode.uses_visual_prompts() {
        if let Some(visuals) = batch.visuals.take() {
            batch.visuals = Some(visuals.to_device(device));
        }
    } else {
        batch.visuals = None;
    }
    batch
}

/// Per-sample, per-box column of the box's category in `class_labels`, or
/// `None` when the label set does not contain it.
fn class_columns(
    categories: &[Vec<String>],
    class_labels: &[String],
    max_boxes: usize,
) -> Vec<Vec<Option<usize>>> {
    categories
        .iter()
        .map(|cats| {
            let mut row: Vec<Option<usize>> = cats
                .iter()
                .map(|c| class_labels.iter().position(|l| l == c))
                .collect();
            row.truncate(max_boxes);
            row
        })
        .collect()
}

fn zero_scalar<B: Backend>(device: &B::Device) -> Tensor<B, 1> {
    Tensor::<B, 1>::from_data(TensorData::new(vec![0.0f32; 1], [1]), device)
}

/// Mean binary cross-entropy over a [batch, n] probability tensor.
fn bce_loss_2d<B: Backend>(probs: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    let dims = targets.dims();
    let inv = Tensor::<B, 2>::ones(dims, &targets.device()) - targets.clone();
    let loss = -((targets * probs.clone().log())
        + (inv * (Tensor::<B, 2>::ones(probs.dims(), &probs.device()) - probs).log()));
    loss.sum().div_scalar((dims[0] * dims[1]) as f32)
}

/// Greedy per-ground-truth target assignment: each ground-truth box claims
/// the prediction with the highest IoU. Also emits one-hot class targets and
/// a matched-row mask for the classification loss.
#[allow(clippy::type_complexity)]
pub fn build_targets<B: Backend>(
    pred_boxes: Tensor<B, 3>,
    gt_boxes: Tensor<B, 3>,
    gt_mask: Tensor<B, 2>,
    gt_classes: &[Vec<Option<usize>>],
    num_classes: usize,
) -> (
    Tensor<B, 2>,
    Tensor<B, 3>,
    Tensor<B, 3>,
    Tensor<B, 3>,
    Tensor<B, 3>,
) {
    let batch = pred_boxes.dims()[0];
    let max_pred = pred_boxes.dims()[1];
    let max_gt = gt_boxes.dims()[1];

    let gt_mask_vec = gt_mask.into_data().to_vec::<f32>().unwrap_or_default();
    let gt_boxes_vec = gt_boxes.clone().into_data().to_vec::<f32>().unwrap_or_default();
    let pred_boxes_vec = pred_boxes
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();

    let mut obj_targets = vec![0.0f32; batch * max_pred];
    let mut box_targets = vec![0.0f32; batch * max_pred * 4];
    let mut box_weights = vec![0.0f32; batch * max_pred * 4];
    let mut cls_targets = vec![0.0f32; batch * max_pred * num_classes];
    let mut cls_weights = vec![0.0f32; batch * max_pred * num_classes];

    for b in 0..batch {
        for g in 0..max_gt {
            let mask_idx = b * max_gt + g;
            if gt_mask_vec.get(mask_idx).copied().unwrap_or(0.0) < 0.5 {
                continue;
            }
            let gb = [
                gt_boxes_vec[(b * max_gt + g) * 4],
                gt_boxes_vec[(b * max_gt + g) * 4 + 1],
                gt_boxes_vec[(b * max_gt + g) * 4 + 2],
                gt_boxes_vec[(b * max_gt + g) * 4 + 3],
            ];

            let mut best_iou = -1.0f32;
            let mut best_p = 0usize;
            for p in 0..max_pred {
                let pb = [
                    pred_boxes_vec[(b * max_pred + p) * 4],
                    pred_boxes_vec[(b * max_pred + p) * 4 + 1],
                    pred_boxes_vec[(b * max_pred + p) * 4 + 2],
                    pred_boxes_vec[(b * max_pred + p) * 4 + 3],
                ];
                let iou = iou_xyxy(pb, gb);
                if iou > best_iou {
                    best_iou = iou;
                    best_p = p;
                }
            }

            let obj_idx = b * max_pred + best_p;
            obj_targets[obj_idx] = 1.0;
            let bt_base = (b * max_pred + best_p) * 4;
            box_targets[bt_base..bt_base + 4].copy_from_slice(&gb);
            box_weights[bt_base..bt_base + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

            let cls_base = (b * max_pred + best_p) * num_classes;
            let column = gt_classes.get(b).and_then(|row| row.get(g)).copied().flatten();
            if let Some(column) = column {
                if column < num_classes {
                    cls_targets[cls_base + column] = 1.0;
                    for slot in cls_weights[cls_base..cls_base + num_classes].iter_mut() {
                        *slot = 1.0;
                    }
                }
            }
        }
    }

    let device = &B::Device::default();
    let obj_targets =
        Tensor::<B, 2>::from_data(TensorData::new(obj_targets, [batch, max_pred]), device);
    let box_targets =
        Tensor::<B, 3>::from_data(TensorData::new(box_targets, [batch, max_pred, 4]), device);
    let box_weights =
        Tensor::<B, 3>::from_data(TensorData::new(box_weights, [batch, max_pred, 4]), device);
    let cls_targets = Tensor::<B, 3>::from_data(
        TensorData::new(cls_targets, [batch, max_pred, num_classes]),
        device,
    );
    let cls_weights = Tensor::<B, 3>::from_data(
        TensorData::new(cls_weights, [batch, max_pred, num_classes]),
        device,
    );

    (obj_targets, box_targets, box_weights, cls_targets, cls_weights)
}

pub(crate) fn iou_xyxy(a: [f32; 4], b: [f32; 4]) -> f32 {
    let ax0 = a[0].min(a[2]);
    let ay0 = a[1].min(a[3]);
    let ax1 = a[0].max(a[2]);
    let ay1 = a[1].max(a[3]);
    let bx0 = b[0].min(b[2]);
    let by0 = b[1].min(b[3]);
    let bx1 = b[0].max(b[2]);
    let by1 = b[1].max(b[3]);

    let inter_x0 = ax0.max(bx0);
    let inter_y0 = ay0.max(by0);
    let inter_x1 = ax1.min(bx1);
    let inter_y1 = ay1.min(by1);

    let inter_w = (inter_x1 - inter_x0).max(0.0);
    let inter_h = (inter_y1 - inter_y0).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (ax1 - ax0).max(0.0) * (ay1 - ay0).max(0.0);
    let area_b = (bx1 - bx0).max(0.0) * (by1 - by0).max(0.0);
    let denom = area_a + area_b - inter_area;
    if denom <= 0.0 {
        0.0
    } else {
        inter_area / denom
    }
}

/// Loads a detector checkpoint into a freshly constructed model; the
/// configuration must match the one used for training.
pub fn load_detector_from_checkpoint<P: AsRef<Path>>(
    path: P,
    cfg: OpenVocabDetectorConfig,
    device: &<TrainBackend as Backend>::Device,
) -> Result<OpenVocabDetector<TrainBackend>, RecorderError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    OpenVocabDetector::<TrainBackend>::new(cfg, device).load_file(path.as_ref(), &recorder, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_policies() {
        assert!(TrainMode::FromScratch.multi_source());
        assert!(!TrainMode::Standard.multi_source());
        assert!(!TrainMode::PromptFree.uses_text_features());
        assert!(!TrainMode::LinearProbe.samples_text());
        assert!(TrainMode::LinearProbe.needs_prompt_checkpoint());
        assert!(matches!(
            TrainMode::PromptFree.validator(),
            ValidatorKind::Plain
        ));
        assert!(matches!(
            TrainMode::VisualPrompt.validator(),
            ValidatorKind::OpenVocab
        ));
    }

    #[test]
    fn class_columns_maps_known_labels() {
        let categories = vec![vec!["dog".to_string(), "cat".to_string()]];
        let labels = vec!["cat".to_string(), "dog".to_string()];
        let columns = class_columns(&categories, &labels, 8);
        assert_eq!(columns, vec![vec![Some(1), Some(0)]]);
    }

    #[test]
    fn class_columns_marks_unknown_labels() {
        let categories = vec![vec!["unicorn".to_string()]];
        let labels = vec!["cat".to_string()];
        let columns = class_columns(&categories, &labels, 8);
        assert_eq!(columns, vec![vec![None]]);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = [0.1, 0.1, 0.5, 0.5];
        assert!((iou_xyxy(b, b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(iou_xyxy([0.0, 0.0, 0.1, 0.1], [0.5, 0.5, 0.9, 0.9]), 0.0);
    }
}
