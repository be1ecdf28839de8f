use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use daachorse::DoubleArrayAhoCorasick;

/// Key-name fragments that mark a value as secret-bearing.
pub const DEFAULT_SECRET_KEYWORDS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passwd",
    "key",
    "authorization",
    "credential",
    "cookie",
    "session",
    "private",
];

/// Matches map keys against a vocabulary of secret-shaped names.
///
/// Matching is a case-insensitive substring search, so `X-Api-Key`,
/// `db_password` and `refreshToken` all match. Substring matching errs towards
/// masking more, never less.
pub struct SecretKeyMatcher {
    automaton: DoubleArrayAhoCorasick<usize>,
    keywords: Vec<String>,
}

impl fmt::Debug for SecretKeyMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKeyMatcher")
            .field("automaton", &"<DoubleArrayAhoCorasick>")
            .field("keywords", &self.keywords)
            .finish()
    }
}

impl Default for SecretKeyMatcher {
    fn default() -> Self {
        Self::with_keywords(DEFAULT_SECRET_KEYWORDS)
            .expect("Failed to build Aho-Corasick automaton for the built-in secret keywords")
    }
}

impl SecretKeyMatcher {
    /// Builds a matcher from a custom vocabulary. Keywords are lowercased.
    ///
    /// Returns `None` when the vocabulary is empty or cannot be compiled
    /// (e.g. duplicate entries).
    pub fn with_keywords<S: AsRef<str>>(keywords: &[S]) -> Option<Self> {
        let mut lowered: Vec<String> = keywords
            .iter()
            .map(|k| k.as_ref().trim().to_ascii_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        lowered.sort();
        lowered.dedup();
        if lowered.is_empty() {
            return None;
        }

        let automaton = DoubleArrayAhoCorasick::new(lowered.iter().map(String::as_str)).ok()?;
        Some(Self {
            automaton,
            keywords: lowered,
        })
    }

    /// Returns true if `key` contains any secret keyword, ignoring ASCII case.
    pub fn is_secret_key(&self, key: &str) -> bool {
        let lowered = key.to_ascii_lowercase();
        self.automaton.find_iter(lowered.as_bytes()).next().is_some()
    }

    /// The normalized vocabulary this matcher was built from.
    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }
}
