//! Report generation: JSON, Markdown and the evidence bundle on disk.

pub mod evidence;
pub mod json;
pub mod markdown;

pub use evidence::{verify_artifacts, write_artifacts, ArtifactSet, Manifest, ManifestEntry, Verification};
pub use json::{from_json, to_json};
pub use markdown::render as render_markdown;
