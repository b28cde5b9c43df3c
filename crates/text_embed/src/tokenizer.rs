//! Hash-bucket tokenization for category labels and grounding phrases.

use sha2::{Digest, Sha256};

/// Maps words to stable vocabulary buckets via SHA-256.
///
/// Labels are short noun phrases ("traffic light", "dog"), so a fixed-size
/// hashed vocabulary is enough; collisions fold rare words together, which
/// the encoders tolerate.
#[derive(Debug, Clone)]
pub struct HashTokenizer {
    vocab_size: u32,
}

impl Default for HashTokenizer {
    fn default() -> Self {
        Self { vocab_size: 4096 }
    }
}

impl HashTokenizer {
    pub fn new(vocab_size: u32) -> Self {
        Self {
            vocab_size: vocab_size.max(1),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size as usize
    }

    /// Lowercases, splits on non-alphanumeric runs, and hashes each word
    /// into a bucket id in `[0, vocab_size)`.
    pub fn tokenize(&self, text: &str) -> Vec<u32> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| self.bucket(w))
            .collect()
    }

    fn bucket(&self, word: &str) -> u32 {
        let digest = Sha256::digest(word.as_bytes());
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&digest[..4]);
        u32::from_le_bytes(raw) % self.vocab_size
    }
}

#[cfg(test)]
mod tests {
    use super::HashTokenizer;

    #[test]
    fn tokenize_is_deterministic_and_case_insensitive() {
        let tok = HashTokenizer::default();
        let a = tok.tokenize("Traffic Light");
        let b = tok.tokenize("traffic light");
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn tokens_stay_in_vocab_range() {
        let tok = HashTokenizer::new(32);
        for id in tok.tokenize("a very long phrase with many different words") {
            assert!((id as usize) < tok.vocab_size());
        }
    }

    #[test]
    fn punctuation_and_empty_segments_are_dropped() {
        let tok = HashTokenizer::default();
        assert_eq!(tok.tokenize("dog, cat"), tok.tokenize("dog cat"));
        assert!(tok.tokenize("  ,;  ").is_empty());
    }
}
