//! Text encoders: a Burn bag-of-tokens module and a deterministic hash fallback.

use crate::tokenizer::HashTokenizer;
use crate::types::{EmbedResult, TextEmbedError};
use burn::module::Module;
use burn::nn;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Tensor, TensorData};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Text-to-vector interface consumed by the embedding cache and validators.
///
/// Implementations must be deterministic for fixed weights: the same input
/// batch always yields the same vectors.
pub trait TextEncoder {
    /// Encode a batch of label strings into fixed-length vectors, one per
    /// input, in input order.
    fn encode_batch(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>>;
    fn dimensions(&self) -> usize;
    fn model_id(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct BagTextEncoderConfig {
    pub vocab_size: usize,
    pub hidden: usize,
    pub embed_dim: usize,
}

impl Default for BagTextEncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 4096,
            hidden: 256,
            embed_dim: 64,
        }
    }
}

/// Hashed bag-of-tokens encoder: token counts -> two linear layers ->
/// L2-normalized embedding.
#[derive(Debug, Module)]
pub struct BagTextEncoder<B: Backend> {
    proj1: nn::Linear<B>,
    proj2: nn::Linear<B>,
    vocab_size: usize,
    embed_dim: usize,
}

impl<B: Backend> BagTextEncoder<B> {
    pub fn new(cfg: BagTextEncoderConfig, device: &B::Device) -> Self {
        let vocab_size = cfg.vocab_size.max(1);
        let proj1 = nn::LinearConfig::new(vocab_size, cfg.hidden).init(device);
        let proj2 = nn::LinearConfig::new(cfg.hidden, cfg.embed_dim).init(device);
        Self {
            proj1,
            proj2,
            vocab_size,
            embed_dim: cfg.embed_dim,
        }
    }

    pub fn forward(&self, counts: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = relu(self.proj1.forward(counts));
        let x = self.proj2.forward(x);
        let norm = (x.clone() * x.clone())
            .sum_dim(1)
            .sqrt()
            .clamp(1e-6, f32::MAX);
        x / norm
    }

    /// Term-frequency matrix for a batch of texts, shape [batch, vocab_size].
    pub fn count_tokens(&self, texts: &[String], device: &B::Device) -> Tensor<B, 2> {
        let tokenizer = HashTokenizer::new(self.vocab_size as u32);
        let mut counts = vec![0.0f32; texts.len() * self.vocab_size];
        for (row, text) in texts.iter().enumerate() {
            for token in tokenizer.tokenize(text) {
                counts[row * self.vocab_size + token as usize] += 1.0;
            }
        }
        Tensor::from_data(
            TensorData::new(counts, [texts.len(), self.vocab_size]),
            device,
        )
    }
}

impl<B: Backend> TextEncoder for BagTextEncoder<B> {
    fn encode_batch(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let device = B::Device::default();
        let counts = self.count_tokens(texts, &device);
        let embedded = self.forward(counts);
        let flat = embedded
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| TextEmbedError::Encode(format!("{e:?}")))?;
        Ok(flat.chunks(self.embed_dim).map(|c| c.to_vec()).collect())
    }

    fn dimensions(&self) -> usize {
        self.embed_dim
    }

    fn model_id(&self) -> &str {
        "bag-text-encoder"
    }
}

/// Deterministic hash-based encoder used when no checkpoint is available.
///
/// Each token contributes a pseudo-random unit direction derived from its
/// SHA-256 digest; the sum is L2-normalized. Not a learned model, but stable
/// across runs, which is what caching and tests need.
#[derive(Debug, Clone)]
pub struct HashTextEncoder {
    tokenizer: HashTokenizer,
    embed_dim: usize,
}

impl HashTextEncoder {
    pub fn new(embed_dim: usize) -> Self {
        Self {
            tokenizer: HashTokenizer::default(),
            embed_dim: embed_dim.max(1),
        }
    }

    fn token_direction(&self, token: u32) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.embed_dim);
        let mut counter = 0u32;
        while out.len() < self.embed_dim {
            let mut hasher = Sha256::new();
            hasher.update(token.to_le_bytes());
            hasher.update(counter.to_le_bytes());
            for byte in hasher.finalize() {
                if out.len() == self.embed_dim {
                    break;
                }
                out.push(byte as f32 / 127.5 - 1.0);
            }
            counter += 1;
        }
        out
    }
}

impl TextEncoder for HashTextEncoder {
    fn encode_batch(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let mut acc = vec![0.0f32; self.embed_dim];
            for token in self.tokenizer.tokenize(text) {
                for (slot, v) in acc.iter_mut().zip(self.token_direction(token)) {
                    *slot += v;
                }
            }
            let norm = acc.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 1e-6 {
                for v in acc.iter_mut() {
                    *v /= norm;
                }
            }
            vectors.push(acc);
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.embed_dim
    }

    fn model_id(&self) -> &str {
        "hash-text-encoder"
    }
}

/// Builds the text encoder used for label embedding generation.
///
/// Loads a Burn checkpoint when one is provided and readable; otherwise falls
/// back to the deterministic hash encoder.
pub fn build_text_encoder<B: Backend>(
    cfg: BagTextEncoderConfig,
    checkpoint: Option<&Path>,
    device: &B::Device,
) -> Box<dyn TextEncoder> {
    let embed_dim = cfg.embed_dim;
    if let Some(path) = checkpoint {
        if path.exists() {
            let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
            match BagTextEncoder::<B>::new(cfg.clone(), device).load_file(path, &recorder, device) {
                Ok(encoder) => return Box::new(encoder),
                Err(err) => {
                    eprintln!(
                        "Failed to load text encoder checkpoint {:?}: {err}. Falling back to hash encoder.",
                        path
                    );
                }
            }
        } else {
            eprintln!(
                "Text encoder checkpoint {:?} not found; using hash encoder.",
                path
            );
        }
    }
    Box::new(HashTextEncoder::new(embed_dim))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_encoder_is_deterministic() {
        let enc = HashTextEncoder::new(32);
        let labels = vec!["dog".to_string(), "traffic light".to_string()];
        let a = enc.encode_batch(&labels).unwrap();
        let b = enc.encode_batch(&labels).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].len(), 32);
    }

    #[test]
    fn hash_encoder_output_is_normalized() {
        let enc = HashTextEncoder::new(16);
        let out = enc
            .encode_batch(&["fire hydrant".to_string()])
            .unwrap()
            .remove(0);
        let norm: f32 = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn hash_encoder_empty_text_yields_zero_vector() {
        let enc = HashTextEncoder::new(8);
        let out = enc.encode_batch(&["   ".to_string()]).unwrap().remove(0);
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn different_labels_get_different_vectors() {
        let enc = HashTextEncoder::new(32);
        let out = enc
            .encode_batch(&["dog".to_string(), "cat".to_string()])
            .unwrap();
        assert_ne!(out[0], out[1]);
    }
}
