// stagecheck-entropy/src/lib.rs
//! Secret-shape detection primitives shared by the stagecheck redactor.
//!
//! * [`entropy`]: Shannon entropy over raw bytes.
//! * [`keywords`]: case-insensitive matching of secret-shaped key names.
//! * [`scoring`]: decides whether a token looks like an opaque credential.
#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod entropy;
pub mod keywords;
pub mod scoring;

/// Common type definitions
pub type EntropyScore = f64;

pub use entropy::calculate_shannon_entropy;
pub use keywords::SecretKeyMatcher;
pub use scoring::{score_token, TokenScore, TokenThresholds};
