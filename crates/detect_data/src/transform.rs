//! Transform stages applied per sample, including text-prompt sampling.

use crate::types::{DataResult, DetectDataError};
use rand::{Rng, RngCore};
use text_embed::EmbeddingTable;

/// One stage of a source's transform chain. Only the text-sampling stage
/// accepts embedding tables; `set_embeddings` on any other stage is a no-op.
#[derive(Debug, Clone)]
pub enum TransformStage {
    Augment(AugmentStage),
    TextSample(TextSampleStage),
}

impl TransformStage {
    /// Injects embedding tables where the stage supports them. Returns
    /// whether the stage accepted the tables.
    pub fn set_embeddings(&mut self, pos: &EmbeddingTable, neg: &EmbeddingTable) -> bool {
        match self {
            TransformStage::TextSample(stage) => {
                stage.set_embeddings(pos.clone(), neg.clone());
                true
            }
            TransformStage::Augment(_) => false,
        }
    }
}

/// Light image augmentation: horizontal flip and brightness/contrast jitter.
#[derive(Debug, Clone)]
pub struct AugmentStage {
    pub flip_horizontal_prob: f32,
    pub color_jitter_prob: f32,
    pub color_jitter_strength: f32,
}

impl Default for AugmentStage {
    fn default() -> Self {
        Self {
            flip_horizontal_prob: 0.5,
            color_jitter_prob: 0.0,
            color_jitter_strength: 0.1,
        }
    }
}

impl AugmentStage {
    pub fn apply(
        &self,
        img: &mut image::RgbImage,
        boxes: &mut [[f32; 4]],
        rng: &mut dyn RngCore,
    ) {
        self.maybe_hflip(img, boxes, rng);
        self.maybe_jitter(img, rng);
    }

    fn maybe_hflip(
        &self,
        img: &mut image::RgbImage,
        boxes: &mut [[f32; 4]],
        rng: &mut dyn RngCore,
    ) {
        if self.flip_horizontal_prob <= 0.0 {
            return;
        }
        if rng.random_range(0.0..1.0) < self.flip_horizontal_prob {
            image::imageops::flip_horizontal_in_place(img);
            for b in boxes.iter_mut() {
                let x0 = b[0];
                let x1 = b[2];
                b[0] = (1.0 - x1).clamp(0.0, 1.0);
                b[2] = (1.0 - x0).clamp(0.0, 1.0);
            }
        }
    }

    fn maybe_jitter(&self, img: &mut image::RgbImage, rng: &mut dyn RngCore) {
        if self.color_jitter_prob <= 0.0 || self.color_jitter_strength <= 0.0 {
            return;
        }
        if rng.random_range(0.0..1.0) >= self.color_jitter_prob {
            return;
        }
        let strength = self.color_jitter_strength;
        let bright = 1.0 + rng.random_range(-strength..strength);
        let contrast = 1.0 + rng.random_range(-strength..strength);
        for pixel in img.pixels_mut() {
            for c in 0..3 {
                let v = pixel[c] as f32 / 255.0;
                let mut v = (v - 0.5) * contrast + 0.5;
                v *= bright;
                pixel[c] = (v.clamp(0.0, 1.0) * 255.0) as u8;
            }
        }
    }
}

/// Text prompts for one sample: positive labels present in the image plus
/// sampled negatives, with their embedding vectors.
#[derive(Debug, Clone)]
pub struct TextPrompts {
    pub labels: Vec<String>,
    pub vectors: Vec<Vec<f32>>,
    /// First `num_pos` entries are positives, the rest negatives.
    pub num_pos: usize,
}

/// Samples per-image text prompts once pos/neg embedding tables have been
/// injected by dataset assembly.
#[derive(Debug, Clone)]
pub struct TextSampleStage {
    /// Cap on total text prompts per image.
    pub max_samples: usize,
    /// Negatives sampled per image (subject to the cap).
    pub num_neg: usize,
    pos: Option<EmbeddingTable>,
    neg: Option<EmbeddingTable>,
}

impl TextSampleStage {
    pub fn new(max_samples: usize, num_neg: usize) -> Self {
        Self {
            max_samples: max_samples.max(1),
            num_neg,
            pos: None,
            neg: None,
        }
    }

    pub fn set_embeddings(&mut self, pos: EmbeddingTable, neg: EmbeddingTable) {
        self.pos = Some(pos);
        self.neg = Some(neg);
    }

    pub fn has_embeddings(&self) -> bool {
        self.pos.is_some() && self.neg.is_some()
    }

    /// Builds prompts for one sample from its present categories.
    ///
    /// Positives are the deduplicated categories in appearance order; a
    /// missing positive embedding is a hard error. Negatives are drawn
    /// without replacement from the negative table, skipping labels already
    /// present as positives.
    pub fn sample(
        &self,
        categories: &[String],
        rng: &mut dyn RngCore,
    ) -> DataResult<TextPrompts> {
        let pos_table = self
            .pos
            .as_ref()
            .ok_or_else(|| DetectDataError::Other("text stage has no embeddings set".into()))?;
        let neg_table = self
            .neg
            .as_ref()
            .ok_or_else(|| DetectDataError::Other("text stage has no embeddings set".into()))?;

        let mut labels: Vec<String> = Vec::new();
        let mut vectors: Vec<Vec<f32>> = Vec::new();
        for category in categories {
            if labels.iter().any(|l| l == category) {
                continue;
            }
            if labels.len() == self.max_samples {
                break;
            }
            let vector = pos_table
                .get(category)
                .ok_or_else(|| DetectDataError::MissingEmbedding(category.clone()))?;
            labels.push(category.clone());
            vectors.push(vector.to_vec());
        }
        let num_pos = labels.len();

        let mut candidates: Vec<&str> = neg_table
            .labels()
            .filter(|l| !labels.iter().any(|p| p == l))
            .collect();
        let budget = self
            .num_neg
            .min(self.max_samples.saturating_sub(num_pos));
        for _ in 0..budget {
            if candidates.is_empty() {
                break;
            }
            let pick = rng.random_range(0..candidates.len());
            let label = candidates.swap_remove(pick);
            let vector = neg_table
                .get(label)
                .ok_or_else(|| DetectDataError::MissingEmbedding(label.to_string()))?;
            labels.push(label.to_string());
            vectors.push(vector.to_vec());
        }

        Ok(TextPrompts {
            labels,
            vectors,
            num_pos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn table(labels: &[&str], dim: usize) -> EmbeddingTable {
        EmbeddingTable::from_pairs(
            labels
                .iter()
                .enumerate()
                .map(|(i, l)| (l.to_string(), vec![i as f32; dim])),
        )
    }

    #[test]
    fn positives_are_deduplicated_in_order() {
        let mut stage = TextSampleStage::new(10, 0);
        stage.set_embeddings(table(&["dog", "cat"], 4), table(&[], 4));
        let mut rng = StdRng::seed_from_u64(7);
        let cats = vec!["dog".to_string(), "cat".to_string(), "dog".to_string()];
        let prompts = stage.sample(&cats, &mut rng).unwrap();
        assert_eq!(prompts.labels, ["dog", "cat"]);
        assert_eq!(prompts.num_pos, 2);
    }

    #[test]
    fn negatives_exclude_present_positives_and_respect_cap() {
        let mut stage = TextSampleStage::new(3, 8);
        stage.set_embeddings(
            table(&["dog"], 4),
            table(&["dog", "car", "tree", "sky"], 4),
        );
        let mut rng = StdRng::seed_from_u64(7);
        let prompts = stage.sample(&["dog".to_string()], &mut rng).unwrap();
        assert_eq!(prompts.num_pos, 1);
        assert!(prompts.labels.len() <= 3);
        assert_eq!(prompts.labels.iter().filter(|l| *l == "dog").count(), 1);
    }

    #[test]
    fn missing_positive_embedding_is_fatal() {
        let mut stage = TextSampleStage::new(4, 0);
        stage.set_embeddings(table(&["dog"], 4), table(&[], 4));
        let mut rng = StdRng::seed_from_u64(7);
        let err = stage.sample(&["unicorn".to_string()], &mut rng).unwrap_err();
        assert!(matches!(err, DetectDataError::MissingEmbedding(_)));
    }

    #[test]
    fn augment_stage_rejects_embeddings() {
        let mut stage = TransformStage::Augment(AugmentStage::default());
        let accepted = stage.set_embeddings(&table(&[], 4), &table(&[], 4));
        assert!(!accepted);
    }

    #[test]
    fn hflip_inverts_boxes() {
        let stage = AugmentStage {
            flip_horizontal_prob: 1.0,
            color_jitter_prob: 0.0,
            color_jitter_strength: 0.0,
        };
        let mut img = image::RgbImage::new(2, 2);
        let mut boxes = vec![[0.25, 0.0, 0.75, 1.0]];
        let mut rng = StdRng::seed_from_u64(7);
        stage.apply(&mut img, &mut boxes, &mut rng);
        let flipped = boxes[0];
        assert!((flipped[0] - 0.25).abs() < 1e-6);
        assert!((flipped[2] - 0.75).abs() < 1e-6);
    }
}
