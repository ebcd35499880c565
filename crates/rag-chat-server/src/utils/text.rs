use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Canonical text form used everywhere a hash or cache key is derived:
/// NFC, trimmed, internal whitespace runs collapsed to a single space.
pub fn normalize_text(text: &str) -> String {
    let nfc: String = text.nfc().collect();
    let mut out = String::with_capacity(nfc.len());
    let mut last_was_space = false;

    for ch in nfc.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }

    out
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Content hash of a chunk or document: digest of the normalized text.
pub fn content_hash(text: &str) -> String {
    sha256_hex(normalize_text(text).as_bytes())
}

/// Stable chunk identifier derived from (source, content_hash).
pub fn chunk_id(source: &str, content_hash: &str) -> String {
    sha256_hex(format!("{}:{}", source, content_hash).as_bytes())
}

/// Words containing at least one alphabetic character. Digits-only and
/// punctuation-only tokens do not count toward the gating word minimum.
pub fn alphabetic_word_count(text: &str) -> usize {
    text.split_whitespace()
        .filter(|w| w.chars().any(|c| c.is_alphabetic()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_text("  hello \t\n world  "), "hello world");
    }

    #[test]
    fn test_normalize_nfc() {
        // "é" as combining sequence vs precomposed must normalize identically
        let decomposed = "Cafe\u{0301}";
        let precomposed = "Caf\u{00e9}";
        assert_eq!(normalize_text(decomposed), normalize_text(precomposed));
    }

    #[test]
    fn test_content_hash_ignores_formatting() {
        let a = content_hash("The deadline  is\nMarch 15.");
        let b = content_hash("The deadline is March 15.");
        assert_eq!(a, b);
    }

    #[test]
    fn test_chunk_id_stable() {
        let h = content_hash("some text");
        assert_eq!(chunk_id("doc.pdf", &h), chunk_id("doc.pdf", &h));
        assert_ne!(chunk_id("doc.pdf", &h), chunk_id("other.pdf", &h));
    }

    #[test]
    fn test_alphabetic_word_count() {
        assert_eq!(alphabetic_word_count("when is the deadline"), 4);
        assert_eq!(alphabetic_word_count("123 456 ???"), 0);
        assert_eq!(alphabetic_word_count("q1 2025"), 1);
    }
}
