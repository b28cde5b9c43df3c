//! Merging heterogeneous sources into one training dataset.

use crate::detection::DetectionSource;
use crate::grounding::GroundingSource;
use crate::transform::TransformStage;
use crate::types::{DataResult, DetectDataError, TrainSample};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use text_embed::EmbeddingTable;

/// Aggregate frequency at or above which a label qualifies as a negative.
pub const NEG_FREQ_THRESHOLD: usize = 100;

/// One constituent dataset of a training run.
#[derive(Debug, Clone)]
pub enum SourceDataset {
    Detection(DetectionSource),
    Grounding(GroundingSource),
}

impl SourceDataset {
    pub fn len(&self) -> usize {
        match self {
            SourceDataset::Detection(s) => s.len(),
            SourceDataset::Grounding(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample(&self, index: usize) -> Option<&TrainSample> {
        match self {
            SourceDataset::Detection(s) => s.sample(index),
            SourceDataset::Grounding(s) => s.sample(index),
        }
    }

    /// Root directory holding this source's images; used to derive sibling
    /// cache paths.
    pub fn root(&self) -> &Path {
        match self {
            SourceDataset::Detection(s) => s.root(),
            SourceDataset::Grounding(s) => s.img_root(),
        }
    }

    /// Closed category-name set, when the source has one. Grounding phrases
    /// are open-ended, so grounding sources return `None`.
    pub fn category_names(&self) -> Option<&BTreeSet<String>> {
        match self {
            SourceDataset::Detection(s) => Some(s.category_names()),
            SourceDataset::Grounding(_) => None,
        }
    }

    pub fn category_freq(&self) -> Option<&HashMap<String, usize>> {
        match self {
            SourceDataset::Detection(s) => Some(s.category_freq()),
            SourceDataset::Grounding(s) => Some(s.category_freq()),
        }
    }

    pub fn transforms(&self) -> &[TransformStage] {
        match self {
            SourceDataset::Detection(s) => s.transforms(),
            SourceDataset::Grounding(s) => s.transforms(),
        }
    }

    pub fn transforms_mut(&mut self) -> &mut [TransformStage] {
        match self {
            SourceDataset::Detection(s) => s.transforms_mut(),
            SourceDataset::Grounding(s) => s.transforms_mut(),
        }
    }
}

/// Union of category names across sources; sources without a closed set
/// contribute nothing.
pub fn aggregate_category_names(sources: &[SourceDataset]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for source in sources {
        if let Some(source_names) = source.category_names() {
            names.extend(source_names.iter().cloned());
        }
    }
    names
}

/// Summed label frequencies across sources; sources without frequency
/// metadata contribute nothing.
pub fn aggregate_category_freq(sources: &[SourceDataset]) -> HashMap<String, usize> {
    let mut freq: HashMap<String, usize> = HashMap::new();
    for source in sources {
        if let Some(source_freq) = source.category_freq() {
            for (label, count) in source_freq {
                *freq.entry(label.clone()).or_insert(0) += count;
            }
        }
    }
    freq
}

/// Labels frequent enough to serve as negatives: aggregate count at or
/// above `threshold`. Sorted for a deterministic result.
pub fn negative_labels(freq: &HashMap<String, usize>, threshold: usize) -> Vec<String> {
    let mut out: Vec<String> = freq
        .iter()
        .filter(|(_, count)| **count >= threshold)
        .map(|(label, _)| label.clone())
        .collect();
    out.sort();
    out
}

/// Order-preserving concatenation of several sources.
#[derive(Debug, Clone)]
pub struct MergedDataset {
    sources: Vec<SourceDataset>,
}

impl MergedDataset {
    pub fn len(&self) -> usize {
        self.sources.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Global index lookup: walks sources in order.
    pub fn sample(&self, index: usize) -> Option<&TrainSample> {
        let mut remaining = index;
        for source in &self.sources {
            if remaining < source.len() {
                return source.sample(remaining);
            }
            remaining -= source.len();
        }
        None
    }

    pub fn sources(&self) -> &[SourceDataset] {
        &self.sources
    }
}

/// The assembled training dataset: a lone source stays unwrapped.
#[derive(Debug, Clone)]
pub enum TrainingDataset {
    Single(SourceDataset),
    Merged(MergedDataset),
}

impl TrainingDataset {
    pub fn len(&self) -> usize {
        match self {
            TrainingDataset::Single(s) => s.len(),
            TrainingDataset::Merged(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample(&self, index: usize) -> Option<&TrainSample> {
        match self {
            TrainingDataset::Single(s) => s.sample(index),
            TrainingDataset::Merged(m) => m.sample(index),
        }
    }

    pub fn sources(&self) -> &[SourceDataset] {
        match self {
            TrainingDataset::Single(s) => std::slice::from_ref(s),
            TrainingDataset::Merged(m) => m.sources(),
        }
    }

    /// Text stage of the source owning `index`, for per-batch prompt
    /// sampling at collate time.
    pub fn text_stage_for(&self, index: usize) -> Option<&crate::transform::TextSampleStage> {
        let (source, _local) = self.locate(index)?;
        source.transforms().iter().find_map(|stage| match stage {
            TransformStage::TextSample(s) => Some(s),
            _ => None,
        })
    }

    /// Source owning the global `index`.
    pub fn source_for(&self, index: usize) -> Option<&SourceDataset> {
        self.locate(index).map(|(source, _)| source)
    }

    fn locate(&self, index: usize) -> Option<(&SourceDataset, usize)> {
        match self {
            TrainingDataset::Single(s) => {
                if index < s.len() {
                    Some((s, index))
                } else {
                    None
                }
            }
            TrainingDataset::Merged(m) => {
                let mut remaining = index;
                for source in m.sources() {
                    if remaining < source.len() {
                        return Some((source, remaining));
                    }
                    remaining -= source.len();
                }
                None
            }
        }
    }
}

/// Injects pos/neg embedding tables into every stage that accepts them,
/// then concatenates. A single source is returned unwrapped.
pub fn assemble_training_dataset(
    mut sources: Vec<SourceDataset>,
    pos: &EmbeddingTable,
    neg: &EmbeddingTable,
) -> DataResult<TrainingDataset> {
    if sources.is_empty() {
        return Err(DetectDataError::Config(
            "no training sources to assemble".to_string(),
        ));
    }
    for source in &mut sources {
        for stage in source.transforms_mut() {
            stage.set_embeddings(pos, neg);
        }
    }
    if sources.len() == 1 {
        Ok(TrainingDataset::Single(sources.remove(0)))
    } else {
        Ok(TrainingDataset::Merged(MergedDataset { sources }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_label_threshold_boundary() {
        let mut freq = HashMap::new();
        freq.insert("common".to_string(), 100usize);
        freq.insert("borderline".to_string(), 99usize);
        freq.insert("rare".to_string(), 3usize);
        freq.insert("very common".to_string(), 4000usize);

        let negs = negative_labels(&freq, NEG_FREQ_THRESHOLD);
        assert_eq!(negs, ["common", "very common"]);
    }

    #[test]
    fn negative_labels_empty_table() {
        let freq = HashMap::new();
        assert!(negative_labels(&freq, NEG_FREQ_THRESHOLD).is_empty());
    }
}
