//! Validators: plain detection eval and text-conditioned eval.

use crate::batch::collate;
use crate::trainer::iou_xyxy;
use burn::tensor::{backend::Backend, Tensor, TensorData};
use detect_data::{DetectionSource, TrainSample};
use models::OpenVocabDetector;
use rand::rngs::StdRng;
use rand::SeedableRng;
use text_embed::TextEncoder;

#[derive(Debug, Clone, Copy)]
pub enum ValidatorKind {
    Plain,
    OpenVocab,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EvalSummary {
    pub true_positives: f32,
    pub false_positives: f32,
    pub false_negatives: f32,
}

impl EvalSummary {
    pub fn precision(&self) -> f32 {
        if self.true_positives + self.false_positives > 0.0 {
            self.true_positives / (self.true_positives + self.false_positives)
        } else {
            0.0
        }
    }

    pub fn recall(&self) -> f32 {
        if self.true_positives + self.false_negatives > 0.0 {
            self.true_positives / (self.true_positives + self.false_negatives)
        } else {
            0.0
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "precision={:.3}, recall={:.3} (tp={}, fp={}, fn={})",
            self.precision(),
            self.recall(),
            self.true_positives,
            self.false_positives,
            self.false_negatives
        )
    }
}

/// Class-free detection eval: predictions above the objectness threshold
/// count as true positives when any ground-truth box matches by IoU.
#[derive(Debug, Clone, Copy)]
pub struct DetectionValidator {
    pub obj_thresh: f32,
    pub iou_thresh: f32,
}

impl Default for DetectionValidator {
    fn default() -> Self {
        Self {
            obj_thresh: 0.3,
            iou_thresh: 0.5,
        }
    }
}

const EVAL_BATCH: usize = 8;

impl DetectionValidator {
    pub fn validate<B: Backend>(
        &self,
        model: &OpenVocabDetector<B>,
        source: &DetectionSource,
        device: &B::Device,
    ) -> anyhow::Result<EvalSummary> {
        self.run(model, source, device, None)
    }

    fn run<B: Backend>(
        &self,
        model: &OpenVocabDetector<B>,
        source: &DetectionSource,
        device: &B::Device,
        classes: Option<(&[String], Tensor<B, 2>)>,
    ) -> anyhow::Result<EvalSummary> {
        let mut summary = EvalSummary::default();
        // Eval augmentation is inert; the seed only pins prompt sampling.
        let mut rng = StdRng::seed_from_u64(0);
        let max_boxes = model.max_boxes();

        let samples: Vec<&TrainSample> = source.samples().iter().collect();
        for chunk in samples.chunks(EVAL_BATCH) {
            let batch = collate::<B>(
                chunk,
                source.transforms(),
                max_boxes,
                None,
                &mut rng,
                device,
            )?;

            let (pred_boxes, pred_scores, pred_class) = match &classes {
                Some((names, txt_feats)) => {
                    let out =
                        model.forward_open_vocab(batch.inputs.clone(), txt_feats.clone(), false);
                    let logits = out
                        .class_logits
                        .into_data()
                        .to_vec::<f32>()
                        .unwrap_or_default();
                    (out.boxes, out.scores, Some((names.len(), logits)))
                }
                None => {
                    let (boxes, scores) = model.forward_detect(batch.inputs.clone(), false);
                    (boxes, scores, None)
                }
            };

            let pb = pred_boxes.into_data().to_vec::<f32>().unwrap_or_default();
            let ps = pred_scores.into_data().to_vec::<f32>().unwrap_or_default();
            let gb = batch.boxes.into_data().to_vec::<f32>().unwrap_or_default();
            let gm = batch.box_mask.into_data().to_vec::<f32>().unwrap_or_default();

            for b in 0..chunk.len() {
                let mut gt_list = Vec::new();
                for g in 0..max_boxes {
                    if gm[b * max_boxes + g] > 0.5 {
                        let class_idx = classes.as_ref().and_then(|(names, _)| {
                            let category = batch.categories[b].get(g)?;
                            names.iter().position(|n| n == category)
                        });
                        gt_list.push((
                            [
                                gb[(b * max_boxes + g) * 4],
                                gb[(b * max_boxes + g) * 4 + 1],
                                gb[(b * max_boxes + g) * 4 + 2],
                                gb[(b * max_boxes + g) * 4 + 3],
                            ],
                            class_idx,
                        ));
                    }
                }
                let mut gt_matched = vec![false; gt_list.len()];
                for p in 0..max_boxes {
                    let score = ps[b * max_boxes + p];
                    if score <= self.obj_thresh {
                        continue;
                    }
                    let pb_box = [
                        pb[(b * max_boxes + p) * 4],
                        pb[(b * max_boxes + p) * 4 + 1],
                        pb[(b * max_boxes + p) * 4 + 2],
                        pb[(b * max_boxes + p) * 4 + 3],
                    ];
                    let pred_class_idx = pred_class.as_ref().map(|(k, logits)| {
                        let row = &logits[(b * max_boxes + p) * k..(b * max_boxes + p + 1) * k];
                        argmax(row)
                    });
                    let mut matched = false;
                    for (i, (gb_box, gt_class)) in gt_list.iter().enumerate() {
                        if gt_matched[i] {
                            continue;
                        }
                        if iou_xyxy(pb_box, *gb_box) < self.iou_thresh {
                            continue;
                        }
                        // Text-conditioned eval also requires the class to
                        // agree; class-free eval matches on IoU alone.
                        if let Some(pred_idx) = pred_class_idx {
                            if *gt_class != Some(pred_idx) {
                                continue;
                            }
                        }
                        matched = true;
                        gt_matched[i] = true;
                        break;
                    }
                    if matched {
                        summary.true_positives += 1.0;
                    } else {
                        summary.false_positives += 1.0;
                    }
                }
                for matched in gt_matched {
                    if !matched {
                        summary.false_negatives += 1.0;
                    }
                }
            }
        }

        Ok(summary)
    }
}

fn argmax(row: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_val = f32::MIN;
    for (i, v) in row.iter().enumerate() {
        if *v > best_val {
            best_val = *v;
            best = i;
        }
    }
    best
}

/// Text-conditioned eval: the validation class names are embedded once and
/// each prediction's argmax class must agree with the ground truth.
pub struct OpenVocabValidator {
    base: DetectionValidator,
    names: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

impl OpenVocabValidator {
    pub fn from_names(
        base: DetectionValidator,
        names: Vec<String>,
        encoder: &dyn TextEncoder,
    ) -> anyhow::Result<Self> {
        let vectors = encoder.encode_batch(&names)?;
        Ok(Self {
            base,
            names,
            vectors,
        })
    }

    pub fn validate<B: Backend>(
        &self,
        model: &OpenVocabDetector<B>,
        source: &DetectionSource,
        device: &B::Device,
    ) -> anyhow::Result<EvalSummary> {
        let dim = self.vectors.first().map(|v| v.len()).unwrap_or(0);
        let flat: Vec<f32> = self.vectors.iter().flatten().copied().collect();
        let txt_feats =
            Tensor::<B, 2>::from_data(TensorData::new(flat, [self.names.len(), dim]), device);
        self.base
            .run(model, source, device, Some((&self.names, txt_feats)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_rates_handle_zero_counts() {
        let summary = EvalSummary::default();
        assert_eq!(summary.precision(), 0.0);
        assert_eq!(summary.recall(), 0.0);
    }

    #[test]
    fn summary_rates() {
        let summary = EvalSummary {
            true_positives: 6.0,
            false_positives: 2.0,
            false_negatives: 2.0,
        };
        assert!((summary.precision() - 0.75).abs() < 1e-6);
        assert!((summary.recall() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn argmax_picks_largest() {
        assert_eq!(argmax(&[0.1, 0.9, 0.3]), 1);
        assert_eq!(argmax(&[-1.0, -2.0]), 0);
    }
}
