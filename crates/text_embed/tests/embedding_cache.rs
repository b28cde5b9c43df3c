use std::sync::atomic::{AtomicUsize, Ordering};
use text_embed::{cached_label_embeddings, EmbedResult, HashTextEncoder, TextEncoder};
use text_embed::{EmbeddingTable, PromptEmbeddingCheckpoint};

/// Wraps an encoder and counts how many times it is invoked.
struct CountingEncoder {
    inner: HashTextEncoder,
    calls: AtomicUsize,
}

impl CountingEncoder {
    fn new(dim: usize) -> Self {
        Self {
            inner: HashTextEncoder::new(dim),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextEncoder for CountingEncoder {
    fn encode_batch(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.encode_batch(texts)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_id(&self) -> &str {
        "counting-encoder"
    }
}

fn labels(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn second_call_hits_cache_without_reencoding() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cache = tmp.path().join("pos_embeddings.json");
    let encoder = CountingEncoder::new(16);
    let set = labels(&["person", "dog", "traffic light"]);

    let first = cached_label_embeddings(&encoder, &set, 2, &cache)?;
    let calls_after_first = encoder.calls();
    assert!(calls_after_first >= 1);

    let second = cached_label_embeddings(&encoder, &set, 2, &cache)?;
    assert_eq!(encoder.calls(), calls_after_first, "cache hit re-invoked encoder");
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn cache_miss_builds_table_keyed_by_exact_label_set() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cache = tmp.path().join("neg_embeddings.json");
    let encoder = CountingEncoder::new(8);
    let set = labels(&["zebra", "ant", "bear"]);

    let table = cached_label_embeddings(&encoder, &set, 2, &cache)?;
    let got: Vec<&str> = table.labels().collect();
    assert_eq!(got, ["zebra", "ant", "bear"]);
    assert_eq!(table.dimensions(), 8);
    // 3 labels at batch 2 -> 2 encoder invocations, partial batch included.
    assert_eq!(encoder.calls(), 2);
    Ok(())
}

#[test]
fn present_cache_is_returned_verbatim_even_for_other_labels() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cache = tmp.path().join("embeddings.json");
    let encoder = CountingEncoder::new(8);

    let stale = EmbeddingTable::from_pairs(vec![("old label".to_string(), vec![0.5; 8])]);
    stale.save(&cache)?;

    let got = cached_label_embeddings(&encoder, &labels(&["new label"]), 4, &cache)?;
    assert_eq!(got, stale);
    assert_eq!(encoder.calls(), 0);
    Ok(())
}

#[test]
fn table_roundtrips_through_disk() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("table.json");
    let encoder = HashTextEncoder::new(12);
    let set = labels(&["stop sign", "bicycle"]);
    let vectors = encoder.encode_batch(&set)?;
    let table = EmbeddingTable::from_pairs(set.into_iter().zip(vectors));

    table.save(&path)?;
    let loaded = EmbeddingTable::load(&path)?;
    assert_eq!(table, loaded);
    Ok(())
}

#[test]
fn bag_encoder_is_deterministic_for_fixed_weights() -> anyhow::Result<()> {
    use text_embed::{BagTextEncoder, BagTextEncoderConfig};
    type B = burn_ndarray::NdArray<f32>;

    let device = <B as burn::tensor::backend::Backend>::Device::default();
    let encoder = BagTextEncoder::<B>::new(
        BagTextEncoderConfig {
            vocab_size: 128,
            hidden: 32,
            embed_dim: 16,
        },
        &device,
    );
    let set = labels(&["fire hydrant", "dog"]);
    let a = encoder.encode_batch(&set)?;
    let b = encoder.encode_batch(&set)?;
    assert_eq!(a, b);
    assert_eq!(a[0].len(), 16);
    for row in &a {
        let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }
    Ok(())
}

#[test]
fn prompt_checkpoint_roundtrips() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("train_pe.json");
    let ckpt = PromptEmbeddingCheckpoint::new(
        vec!["person".to_string(), "car".to_string()],
        vec![vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]],
    );
    ckpt.save(&path)?;

    let loaded = PromptEmbeddingCheckpoint::load(&path)?;
    assert_eq!(loaded.names, ckpt.names);
    assert_eq!(loaded.embeddings, ckpt.embeddings);
    assert_eq!(loaded.to_table().get("car"), Some(&[0.4, 0.5, 0.6][..]));
    Ok(())
}
