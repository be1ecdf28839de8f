//! Correlation identifiers tying together every artifact of one run.
//!
//! Format: `<prefix>-<UTC yyyymmddTHHMMSSZ>-<8 hex chars>`. The timestamp makes
//! ids sort by start time; the short hash (SHA-256 over a random UUID) keeps
//! concurrent runs apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

pub const DEFAULT_PREFIX: &str = "sc";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self::generate_at(DEFAULT_PREFIX, Utc::now())
    }

    pub fn generate_at(prefix: &str, at: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(Uuid::new_v4().as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(format!(
            "{}-{}-{}",
            prefix,
            at.format("%Y%m%dT%H%M%SZ"),
            &digest[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
