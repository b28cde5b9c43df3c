//! Batch collation: samples to tensors, with per-batch text prompts.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use detect_data::{TextPrompts, TrainSample, TransformStage};
use rand::RngCore;

/// Pooled image features per sample: mean/std RGB, aspect ratio, box count.
pub const IMAGE_FEATURES: usize = 8;
/// Model input width: first box plus pooled image features.
pub const INPUT_FEATURES: usize = 4 + IMAGE_FEATURES;

#[derive(Debug, Clone)]
pub struct CollatedBatch<B: Backend> {
    /// Model inputs (shape: [batch, INPUT_FEATURES]).
    pub inputs: Tensor<B, 2>,
    /// Normalized boxes per sample (shape: [batch, max_boxes, 4]).
    pub boxes: Tensor<B, 3>,
    /// Mask indicating which box slots are populated (shape: [batch, max_boxes]).
    pub box_mask: Tensor<B, 2>,
    /// Category text per kept box, parallel to the box slots.
    pub categories: Vec<Vec<String>>,
    /// Prompts sampled for this batch, when a text stage was available.
    pub prompts: Option<TextPrompts>,
    /// Prompt embeddings (shape: [K, embed_dim]), parallel to `prompts`.
    pub txt_feats: Option<Tensor<B, 2>>,
    /// Per-image visual prompt vectors (shape: [batch, embed_dim]).
    pub visuals: Option<Tensor<B, 2>>,
}

/// Collates one batch of samples from a single source.
///
/// Images are loaded and must share dimensions within the batch. The
/// source's augment stages run first; its text stage (when present and
/// primed with embeddings) samples per-batch prompts from the categories
/// present across the whole batch.
pub fn collate<B: Backend>(
    samples: &[&TrainSample],
    stages: &[TransformStage],
    max_boxes: usize,
    visual_dim: Option<usize>,
    rng: &mut dyn RngCore,
    device: &B::Device,
) -> anyhow::Result<CollatedBatch<B>> {
    if samples.is_empty() {
        anyhow::bail!("cannot collate empty batch");
    }
    let max_boxes = max_boxes.max(1);

    // Load first image to establish dimensions.
    let first = image::open(&samples[0].image)
        .map_err(|e| anyhow::anyhow!("failed to open image {:?}: {e}", samples[0].image))?
        .to_rgb8();
    let (width, height) = first.dimensions();

    let batch = samples.len();
    let mut inputs: Vec<f32> = Vec::with_capacity(batch * INPUT_FEATURES);
    let mut all_boxes: Vec<Vec<[f32; 4]>> = Vec::with_capacity(batch);
    let mut categories: Vec<Vec<String>> = Vec::with_capacity(batch);
    let mut visuals: Vec<f32> = Vec::new();

    for (idx, sample) in samples.iter().enumerate() {
        let mut img = if idx == 0 {
            first.clone()
        } else {
            let img = image::open(&sample.image)
                .map_err(|e| anyhow::anyhow!("failed to open image {:?}: {e}", sample.image))?
                .to_rgb8();
            let (w, h) = img.dimensions();
            if w != width || h != height {
                anyhow::bail!(
                    "image dimensions differ within batch: {:?} is {}x{}, expected {}x{}",
                    sample.image,
                    w,
                    h,
                    width,
                    height
                );
            }
            img
        };

        let mut boxes = Vec::new();
        let mut cats = Vec::new();
        for label in &sample.labels {
            let bbox = if let Some(norm) = label.bbox_norm {
                norm
            } else if let Some(px) = label.bbox_px {
                [
                    px[0] / width as f32,
                    px[1] / height as f32,
                    px[2] / width as f32,
                    px[3] / height as f32,
                ]
            } else {
                continue;
            };
            boxes.push(bbox);
            cats.push(label.category.clone());
            if boxes.len() >= max_boxes {
                break;
            }
        }

        for stage in stages {
            if let TransformStage::Augment(augment) = stage {
                augment.apply(&mut img, &mut boxes, rng);
            }
        }

        let stats = image_stats(&img, boxes.len() as f32);
        let first_box = boxes.first().copied().unwrap_or([0.0; 4]);
        inputs.extend_from_slice(&first_box);
        inputs.extend_from_slice(&stats);

        if let Some(dim) = visual_dim {
            visuals.extend_from_slice(&visual_prompt(&stats, first_box, dim));
        }

        all_boxes.push(boxes);
        categories.push(cats);
    }

    let mut boxes_buf = vec![0.0f32; batch * max_boxes * 4];
    let mut mask_buf = vec![0.0f32; batch * max_boxes];
    for (b, boxes) in all_boxes.iter().enumerate() {
        for (i, bbox) in boxes.iter().enumerate() {
            let base = (b * max_boxes + i) * 4;
            boxes_buf[base..base + 4].copy_from_slice(bbox);
            mask_buf[b * max_boxes + i] = 1.0;
        }
    }

    // Sample prompts once per batch from all present categories, keeping
    // appearance order across samples.
    let text_stage = stages.iter().find_map(|stage| match stage {
        TransformStage::TextSample(s) => Some(s),
        _ => None,
    });
    let (prompts, txt_feats) = match text_stage {
        Some(stage) if stage.has_embeddings() => {
            let mut batch_categories: Vec<String> = Vec::new();
            for cats in &categories {
                for c in cats {
                    if !batch_categories.contains(c) {
                        batch_categories.push(c.clone());
                    }
                }
            }
            let prompts = stage.sample(&batch_categories, rng)?;
            if prompts.labels.is_empty() {
                (None, None)
            } else {
                let dim = prompts.vectors.first().map(|v| v.len()).unwrap_or(0);
                let flat: Vec<f32> = prompts.vectors.iter().flatten().copied().collect();
                let feats = Tensor::<B, 2>::from_data(
                    TensorData::new(flat, [prompts.labels.len(), dim]),
                    device,
                );
                (Some(prompts), Some(feats))
            }
        }
        _ => (None, None),
    };

    let inputs =
        Tensor::<B, 2>::from_data(TensorData::new(inputs, [batch, INPUT_FEATURES]), device);
    let boxes =
        Tensor::<B, 3>::from_data(TensorData::new(boxes_buf, [batch, max_boxes, 4]), device);
    let box_mask = Tensor::<B, 2>::from_data(TensorData::new(mask_buf, [batch, max_boxes]), device);
    let visuals = visual_dim.map(|dim| {
        Tensor::<B, 2>::from_data(TensorData::new(visuals, [batch, dim]), device)
    });

    Ok(CollatedBatch {
        inputs,
        boxes,
        box_mask,
        categories,
        prompts,
        txt_feats,
        visuals,
    })
}

/// Mean/std per RGB channel, aspect ratio, box count.
fn image_stats(img: &image::RgbImage, box_count: f32) -> [f32; IMAGE_FEATURES] {
    let (width, height) = img.dimensions();
    let count = (width * height).max(1) as f32;
    let mut mean = [0.0f32; 3];
    for pixel in img.pixels() {
        for c in 0..3 {
            mean[c] += pixel[c] as f32 / 255.0;
        }
    }
    for m in mean.iter_mut() {
        *m /= count;
    }
    let mut var = [0.0f32; 3];
    for pixel in img.pixels() {
        for c in 0..3 {
            let d = pixel[c] as f32 / 255.0 - mean[c];
            var[c] += d * d;
        }
    }
    let aspect = width as f32 / height.max(1) as f32;
    [
        mean[0],
        mean[1],
        mean[2],
        (var[0] / count).sqrt(),
        (var[1] / count).sqrt(),
        (var[2] / count).sqrt(),
        aspect,
        box_count,
    ]
}

/// Cheap per-image visual prompt: pooled stats plus the first box geometry,
/// zero-padded (or truncated) to the embedding width.
fn visual_prompt(stats: &[f32; IMAGE_FEATURES], first_box: [f32; 4], dim: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(dim);
    out.extend_from_slice(&first_box);
    out.extend_from_slice(stats);
    out.resize(dim, 0.0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type B = burn_ndarray::NdArray<f32>;

    #[test]
    fn empty_batch_is_rejected() {
        let device = <B as Backend>::Device::default();
        let mut rng = StdRng::seed_from_u64(3);
        assert!(collate::<B>(&[], &[], 4, None, &mut rng, &device).is_err());
    }

    #[test]
    fn visual_prompt_is_padded_to_width() {
        let stats = [0.1f32; IMAGE_FEATURES];
        let v = visual_prompt(&stats, [0.1, 0.2, 0.3, 0.4], 32);
        assert_eq!(v.len(), 32);
        assert_eq!(&v[0..4], &[0.1, 0.2, 0.3, 0.4]);
        assert!(v[IMAGE_FEATURES + 4..].iter().all(|x| *x == 0.0));
    }
}
