use std::collections::HashSet;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const EXTENSION: &str = ".png";
const FALLBACK_STEM: &str = "image";
const COPY_SUFFIX: &str = "-copy";
const MAX_WORDS: usize = 8;

/// Derives the output filename for one prompt.
///
/// Diacritics are folded away, everything that is not an ASCII letter
/// becomes a word break, the first eight words are joined with hyphens and
/// lower-cased. Collisions with `existing` get a `-copy` suffix, repeated
/// until unique, so derived names never contain digits. Deterministic for
/// identical inputs and identical existing-name sets.
pub fn derive_name(prompt: &str, existing: &HashSet<String>) -> String {
    let folded: String = prompt
        .nfd()
        .filter(|ch| !is_combining_mark(*ch))
        .map(|ch| {
            if ch.is_ascii_alphabetic() || ch.is_whitespace() {
                ch
            } else {
                ' '
            }
        })
        .collect();

    let stem = folded
        .split_whitespace()
        .take(MAX_WORDS)
        .collect::<Vec<&str>>()
        .join("-")
        .to_ascii_lowercase();
    let stem = if stem.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        stem
    };

    let mut candidate = format!("{stem}{EXTENSION}");
    let mut base = stem;
    while existing.contains(&candidate) {
        base.push_str(COPY_SUFFIX);
        candidate = format!("{base}{EXTENSION}");
    }
    candidate
}
