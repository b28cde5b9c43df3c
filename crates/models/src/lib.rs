//! Burn modules for open-vocabulary detection.
//!
//! `OpenVocabDetector` predicts boxes and objectness from pooled image
//! features and classifies regions against text embeddings supplied at
//! runtime (open-vocabulary), fused into the head (prompt-free after
//! linear probing), or derived from visual prompts.
//!
//! ## Design Note
//! The module is a deliberately small stand-in for a full cross-modal
//! detector: the surgery surface (class fusion, visual-branch removal,
//! head reinitialization, backbone freezing) is the part the trainers
//! depend on.

use burn::module::{Module, Param};
use burn::nn;
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::{backend::Backend, Tensor};

#[derive(Debug, Clone)]
pub struct OpenVocabDetectorConfig {
    pub hidden: usize,
    pub depth: usize,
    pub max_boxes: usize,
    /// Text embedding width the region features are projected into.
    pub embed_dim: usize,
    /// Cap on text samples per image; the classification surface is sized
    /// dynamically from the prompts supplied at runtime.
    pub nc: usize,
    pub input_dim: Option<usize>,
    pub visual_branch: bool,
}

impl Default for OpenVocabDetectorConfig {
    fn default() -> Self {
        Self {
            hidden: 128,
            depth: 2,
            max_boxes: 64,
            embed_dim: 64,
            nc: 80,
            input_dim: None,
            visual_branch: true,
        }
    }
}

/// Per-batch outputs: boxes `[B, max_boxes, 4]`, objectness `[B, max_boxes]`,
/// class logits `[B, max_boxes, K]` for K runtime prompts.
#[derive(Debug, Clone)]
pub struct DetectionOutput<B: Backend> {
    pub boxes: Tensor<B, 3>,
    pub scores: Tensor<B, 2>,
    pub class_logits: Tensor<B, 3>,
}

#[derive(Debug, Module)]
pub struct OpenVocabDetector<B: Backend> {
    stem: nn::Linear<B>,
    blocks: Vec<nn::Linear<B>>,
    box_head: nn::Linear<B>,
    score_head: nn::Linear<B>,
    /// Projects backbone features into `max_boxes` region embeddings.
    region_proj: nn::Linear<B>,
    /// Visual-prompt branch; dropped for linear probing.
    visual_proj: Option<nn::Linear<B>>,
    /// Prompt embeddings installed by `set_classes`, pre-fusion.
    prompt_embeddings: Option<Param<Tensor<B, 2>>>,
    /// Classification matrix after fusion, `[nc, embed_dim]`.
    fused_classes: Option<Param<Tensor<B, 2>>>,
    max_boxes: usize,
    embed_dim: usize,
    hidden: usize,
    input_dim: usize,
    nc: usize,
}

impl<B: Backend> OpenVocabDetector<B> {
    pub fn new(cfg: OpenVocabDetectorConfig, device: &B::Device) -> Self {
        let input_dim = cfg.input_dim.unwrap_or(4);
        let max_boxes = cfg.max_boxes.max(1);
        let stem = nn::LinearConfig::new(input_dim, cfg.hidden).init(device);
        let mut blocks = Vec::new();
        for _ in 0..cfg.depth {
            blocks.push(nn::LinearConfig::new(cfg.hidden, cfg.hidden).init(device));
        }
        let box_head = nn::LinearConfig::new(cfg.hidden, max_boxes * 4).init(device);
        let score_head = nn::LinearConfig::new(cfg.hidden, max_boxes).init(device);
        let region_proj = nn::LinearConfig::new(cfg.hidden, max_boxes * cfg.embed_dim).init(device);
        let visual_proj = if cfg.visual_branch {
            Some(nn::LinearConfig::new(cfg.embed_dim, cfg.embed_dim).init(device))
        } else {
            None
        };
        Self {
            stem,
            blocks,
            box_head,
            score_head,
            region_proj,
            visual_proj,
            prompt_embeddings: None,
            fused_classes: None,
            max_boxes,
            embed_dim: cfg.embed_dim,
            hidden: cfg.hidden,
            input_dim,
            nc: cfg.nc.max(1),
        }
    }

    pub fn nc(&self) -> usize {
        self.nc
    }

    pub fn max_boxes(&self) -> usize {
        self.max_boxes
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn has_visual_branch(&self) -> bool {
        self.visual_proj.is_some()
    }

    pub fn has_prompt_embeddings(&self) -> bool {
        self.prompt_embeddings.is_some()
    }

    pub fn has_fused_classes(&self) -> bool {
        self.fused_classes.is_some()
    }

    /// Classification matrix installed by fusion, if any.
    pub fn fused_class_matrix(&self) -> Option<Tensor<B, 2>> {
        self.fused_classes.as_ref().map(|p| p.val())
    }

    /// Backbone features. With `freeze_backbone` the result is detached, so
    /// gradients reach only the heads.
    fn features(&self, input: Tensor<B, 2>, freeze_backbone: bool) -> Tensor<B, 2> {
        let mut x = relu(self.stem.forward(input));
        for block in &self.blocks {
            x = relu(block.forward(x));
        }
        if freeze_backbone {
            x = x.detach();
        }
        x
    }

    /// Boxes and objectness from backbone features. Box coordinates are
    /// sigmoid-bounded and reordered so x0 <= x1, y0 <= y1 within [0, 1].
    fn boxes_and_scores(&self, feats: Tensor<B, 2>) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let boxes_flat = sigmoid(self.box_head.forward(feats.clone()));
        let scores = sigmoid(self.score_head.forward(feats));
        let batch = boxes_flat.dims()[0];
        let boxes = boxes_flat.reshape([batch, self.max_boxes, 4]);

        let x0 = boxes.clone().slice([0..batch, 0..self.max_boxes, 0..1]);
        let y0 = boxes.clone().slice([0..batch, 0..self.max_boxes, 1..2]);
        let x1 = boxes.clone().slice([0..batch, 0..self.max_boxes, 2..3]);
        let y1 = boxes.clone().slice([0..batch, 0..self.max_boxes, 3..4]);

        let dx = x0.clone() - x1.clone();
        let dy = y0.clone() - y1.clone();
        let half = 0.5;

        let x_min = ((x0.clone() + x1.clone() - dx.clone().abs()) * half).clamp(0.0, 1.0);
        let x_max = ((x0 + x1 + dx.abs()) * half).clamp(0.0, 1.0);
        let y_min = ((y0.clone() + y1.clone() - dy.clone().abs()) * half).clamp(0.0, 1.0);
        let y_max = ((y0 + y1 + dy.abs()) * half).clamp(0.0, 1.0);

        let ordered = Tensor::cat(vec![x_min, y_min, x_max, y_max], 2);
        (ordered, scores)
    }

    /// L2-normalized region embeddings, `[B, max_boxes, embed_dim]`.
    fn region_embeddings(&self, feats: Tensor<B, 2>) -> Tensor<B, 3> {
        let batch = feats.dims()[0];
        let region = self
            .region_proj
            .forward(feats)
            .reshape([batch, self.max_boxes, self.embed_dim]);
        let norm = (region.clone() * region.clone())
            .sum_dim(2)
            .sqrt()
            .clamp(1e-6, f32::MAX);
        region / norm
    }

    /// Boxes and objectness only, no class conditioning.
    pub fn forward_detect(
        &self,
        input: Tensor<B, 2>,
        freeze_backbone: bool,
    ) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let feats = self.features(input, freeze_backbone);
        self.boxes_and_scores(feats)
    }

    /// Open-vocabulary forward pass against `txt_feats` `[K, embed_dim]`.
    pub fn forward_open_vocab(
        &self,
        input: Tensor<B, 2>,
        txt_feats: Tensor<B, 2>,
        freeze_backbone: bool,
    ) -> DetectionOutput<B> {
        let feats = self.features(input, freeze_backbone);
        let (boxes, scores) = self.boxes_and_scores(feats.clone());
        let region = self.region_embeddings(feats);
        let k = txt_feats.dims()[0];
        let batch = region.dims()[0];
        let class_logits = region
            .reshape([batch * self.max_boxes, self.embed_dim])
            .matmul(txt_feats.transpose())
            .reshape([batch, self.max_boxes, k]);
        DetectionOutput {
            boxes,
            scores,
            class_logits,
        }
    }

    /// Prompt-free forward pass against the fused classification matrix.
    /// Returns `None` until `fuse_prompt_embeddings` has run.
    pub fn forward_fused(
        &self,
        input: Tensor<B, 2>,
        freeze_backbone: bool,
    ) -> Option<DetectionOutput<B>> {
        let classes = self.fused_class_matrix()?;
        Some(self.forward_open_vocab(input, classes, freeze_backbone))
    }

    /// Visual-prompt objectness: region similarity to projected per-image
    /// prompt vectors `[B, embed_dim]`. `None` when the branch was removed.
    pub fn forward_visual_prompts(
        &self,
        input: Tensor<B, 2>,
        visuals: Tensor<B, 2>,
        freeze_backbone: bool,
    ) -> Option<Tensor<B, 2>> {
        let proj = self.visual_proj.as_ref()?;
        let feats = self.features(input, freeze_backbone);
        let region = self.region_embeddings(feats);
        let batch = region.dims()[0];
        let prompt = proj.forward(visuals);
        let norm = (prompt.clone() * prompt.clone())
            .sum_dim(1)
            .sqrt()
            .clamp(1e-6, f32::MAX);
        let prompt = (prompt / norm).reshape([batch, 1, self.embed_dim]);
        let sim = (region * prompt).sum_dim(2);
        Some(sim.reshape([batch, self.max_boxes]))
    }

    /// Installs prompt embeddings `[nc, embed_dim]` for later fusion.
    pub fn set_classes(mut self, embeddings: Tensor<B, 2>) -> Self {
        self.nc = embeddings.dims()[0];
        self.prompt_embeddings = Some(Param::from_tensor(embeddings));
        self
    }

    /// Folds installed prompt embeddings into the classification head and
    /// drops the standalone table. A no-op when nothing is installed.
    pub fn fuse_prompt_embeddings(mut self) -> Self {
        if let Some(pe) = self.prompt_embeddings.take() {
            self.fused_classes = Some(pe);
        }
        self
    }

    /// Removes the visual-prompt branch.
    pub fn without_visual_branch(mut self) -> Self {
        self.visual_proj = None;
        self
    }

    /// Reinitializes the region projection head with fresh trainable
    /// weights, leaving everything else untouched.
    pub fn reinit_class_head(mut self, device: &B::Device) -> Self {
        self.region_proj =
            nn::LinearConfig::new(self.hidden, self.max_boxes * self.embed_dim).init(device);
        self
    }
}

pub mod prelude {
    pub use super::{DetectionOutput, OpenVocabDetector, OpenVocabDetectorConfig};
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;

    type B = burn_ndarray::NdArray<f32>;

    fn device() -> <B as Backend>::Device {
        <B as Backend>::Device::default()
    }

    fn small_config() -> OpenVocabDetectorConfig {
        OpenVocabDetectorConfig {
            hidden: 16,
            depth: 1,
            max_boxes: 4,
            embed_dim: 8,
            nc: 3,
            input_dim: Some(6),
            visual_branch: true,
        }
    }

    fn input(batch: usize) -> Tensor<B, 2> {
        let data = vec![0.5f32; batch * 6];
        Tensor::from_data(TensorData::new(data, [batch, 6]), &device())
    }

    fn prompts(k: usize) -> Tensor<B, 2> {
        let data = (0..k * 8).map(|i| i as f32 * 0.01 + 0.1).collect::<Vec<_>>();
        Tensor::from_data(TensorData::new(data, [k, 8]), &device())
    }

    #[test]
    fn open_vocab_forward_shapes() {
        let model = OpenVocabDetector::<B>::new(small_config(), &device());
        let out = model.forward_open_vocab(input(2), prompts(5), false);
        assert_eq!(out.boxes.dims(), [2, 4, 4]);
        assert_eq!(out.scores.dims(), [2, 4]);
        assert_eq!(out.class_logits.dims(), [2, 4, 5]);
    }

    #[test]
    fn boxes_are_ordered_and_in_range() {
        let model = OpenVocabDetector::<B>::new(small_config(), &device());
        let out = model.forward_open_vocab(input(1), prompts(2), false);
        let flat = out.boxes.into_data().to_vec::<f32>().unwrap();
        for b in flat.chunks(4) {
            assert!(b[0] <= b[2] && b[1] <= b[3]);
            assert!(b.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn fusion_moves_prompts_into_head() {
        let model = OpenVocabDetector::<B>::new(small_config(), &device());
        assert!(model.forward_fused(input(1), false).is_none());

        let model = model.set_classes(prompts(3)).fuse_prompt_embeddings();
        assert!(!model.has_prompt_embeddings());
        assert!(model.has_fused_classes());
        assert_eq!(model.nc(), 3);

        let out = model.forward_fused(input(1), false).unwrap();
        assert_eq!(out.class_logits.dims(), [1, 4, 3]);
    }

    #[test]
    fn visual_branch_can_be_removed() {
        let model = OpenVocabDetector::<B>::new(small_config(), &device());
        assert!(model.has_visual_branch());
        let visuals = prompts(2); // [2, embed_dim] doubles as per-image prompts
        assert!(model
            .forward_visual_prompts(input(2), visuals.clone(), false)
            .is_some());

        let model = model.without_visual_branch();
        assert!(!model.has_visual_branch());
        assert!(model
            .forward_visual_prompts(input(2), visuals, false)
            .is_none());
    }
}
