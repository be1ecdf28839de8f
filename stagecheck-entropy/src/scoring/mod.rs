use crate::entropy::{calculate_shannon_entropy, max_entropy_for_len};
use crate::EntropyScore;

/// Thresholds a bare token must meet to be treated as an opaque credential.
#[derive(Debug, Clone)]
pub struct TokenThresholds {
    pub min_len: usize,
    pub min_entropy: EntropyScore,
    /// Distinct classes among lowercase, uppercase and digits. Symbols do not
    /// count, so dashed identifiers score like their alphanumeric content.
    pub min_char_classes: u8,
}

impl Default for TokenThresholds {
    fn default() -> Self {
        // Hex digests and UUIDs top out at two classes, which keeps trace ids
        // and fingerprints readable in reports.
        Self {
            min_len: 32,
            min_entropy: 4.0,
            min_char_classes: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenScore {
    pub len: usize,
    pub entropy: EntropyScore,
    /// Entropy relative to the ceiling for this length, 0.0 - 1.0.
    pub normalized_entropy: f64,
    pub char_classes: u8,
    pub opaque: bool,
}

fn count_char_classes(token: &[u8]) -> u8 {
    let (mut lower, mut upper, mut digit) = (false, false, false);
    for &b in token {
        match b {
            b'a'..=b'z' => lower = true,
            b'A'..=b'Z' => upper = true,
            b'0'..=b'9' => digit = true,
            _ => {}
        }
    }
    [lower, upper, digit].iter().filter(|&&c| c).count() as u8
}

/// Scores a candidate token against the given thresholds.
pub fn score_token(token: &str, thresholds: &TokenThresholds) -> TokenScore {
    let bytes = token.as_bytes();
    let entropy = calculate_shannon_entropy(bytes);
    let ceiling = max_entropy_for_len(bytes.len());
    let normalized_entropy = if ceiling > 0.0 { entropy / ceiling } else { 0.0 };
    let char_classes = count_char_classes(bytes);

    let opaque = bytes.len() >= thresholds.min_len
        && entropy >= thresholds.min_entropy
        && char_classes >= thresholds.min_char_classes;

    TokenScore {
        len: bytes.len(),
        entropy,
        normalized_entropy,
        char_classes,
        opaque,
    }
}
