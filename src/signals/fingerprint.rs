//! Attachment fingerprints.
//!
//! Ingestion supplies a raw byte hash. A second fingerprint over the
//! normalized extracted text catches the same document re-exported or
//! re-printed to PDF, where the bytes differ but the words do not.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Below this many normalized characters the text is too generic to fingerprint.
const MIN_FINGERPRINT_CHARS: usize = 64;

fn generic_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:image\d*\.(?:png|jpe?g|gif|bmp)|inlineimage.*|logo.*|signature.*|outlook-.*\.(?:png|jpe?g|gif))$|-logo[-.]|logo-")
            .expect("generic attachment regex should compile")
    })
}

/// Fingerprint of the extracted text: SHA-256 over NFKC-folded lowercase
/// alphanumeric tokens joined by single spaces.
pub fn text_fingerprint(text: &str) -> Option<String> {
    let normalized = text
        .nfkc()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    let joined = tokens.join(" ");
    if joined.chars().count() < MIN_FINGERPRINT_CHARS {
        return None;
    }
    let digest = Sha256::digest(joined.as_bytes());
    Some(format!("txt:{}", hex::encode(digest)))
}

/// Inline images, logos and signature blocks travel with every message from
/// a sender and say nothing about the subject matter.
pub fn is_generic_attachment(name: &str) -> bool {
    generic_name_re().is_match(name.trim())
}
