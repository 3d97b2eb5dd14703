//! Small shared helpers: tokenisation, hashing, time conversions.

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

/// Language-agnostic tokeniser: lowercased alphanumeric runs.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Hex-encoded SHA-256 of the content, used for L2 deduplication.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// First sentence of a text, ended by `.`, `!` or `?`, or the whole text.
pub fn first_sentence(text: &str) -> &str {
    let trimmed = text.trim();
    for (idx, ch) in trimmed.char_indices() {
        if matches!(ch, '.' | '!' | '?') {
            return &trimmed[..idx + ch.len_utf8()];
        }
    }
    trimmed
}

/// Exponential recency kernel: 0.5^(age / half_life).
pub fn recency_kernel(age_secs: f64, half_life_secs: f64) -> f64 {
    if half_life_secs <= 0.0 {
        return 1.0;
    }
    0.5_f64.powf((age_secs / half_life_secs).max(0.0))
}

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Serialise an embedding as little-endian f32 bytes.
pub fn embedding_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity between two vectors; 0.0 on mismatched lengths or zero
/// norms.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_on_non_alphanumeric() {
        assert_eq!(
            tokenize("Python type-hints, are GREAT!"),
            vec!["python", "type", "hints", "are", "great"]
        );
        assert!(tokenize("  ").is_empty());
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 64);
    }

    #[test]
    fn first_sentence_extraction() {
        assert_eq!(first_sentence("Hello there. Second."), "Hello there.");
        assert_eq!(first_sentence("no punctuation"), "no punctuation");
        assert_eq!(first_sentence("  leading ws! rest"), "leading ws!");
    }

    #[test]
    fn recency_kernel_halves_at_half_life() {
        assert!((recency_kernel(3600.0, 3600.0) - 0.5).abs() < 1e-9);
        assert!((recency_kernel(0.0, 3600.0) - 1.0).abs() < 1e-9);
        assert!(recency_kernel(7200.0, 3600.0) < recency_kernel(3600.0, 3600.0));
    }

    #[test]
    fn embedding_bytes_roundtrip() {
        let v = vec![0.1f32, -2.5, 3.25];
        assert_eq!(embedding_from_bytes(&embedding_to_bytes(&v)), v);
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
