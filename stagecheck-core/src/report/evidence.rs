// stagecheck-core/src/report/evidence.rs
//! Writes a run's artifacts to disk.
//!
//! Layout under `<report_dir>/<correlation_id>/`:
//!
//! ```text
//! report.json
//! report.md
//! evidence/<name>...
//! manifest.json      SHA-256 of every file above, optionally HMAC-signed
//! ```
//!
//! License: MIT OR APACHE 2.0

use crate::errors::{Result, StagecheckError};
use crate::orchestrator::ValidationRun;
use crate::redaction;
use crate::report::{json, markdown};
use hmac::{Hmac, Mac};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};

type HmacSha256 = Hmac<Sha256>;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SIGNATURE_ALG: &str = "hmac-sha256";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the run directory, `/`-separated.
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub correlation_id: String,
    pub files: Vec<ManifestEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_alg: Option<String>,
}

impl Manifest {
    /// Bytes covered by the signature: the manifest without its signature fields.
    fn signing_payload(&self) -> Result<Vec<u8>> {
        let unsigned = Manifest {
            signature: None,
            signature_alg: None,
            ..self.clone()
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }

    fn sign(&mut self, key: &[u8]) -> Result<()> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| StagecheckError::Config(format!("invalid report signing key: {}", e)))?;
        mac.update(&self.signing_payload()?);
        self.signature = Some(hex::encode(mac.finalize().into_bytes()));
        self.signature_alg = Some(SIGNATURE_ALG.to_string());
        Ok(())
    }

    fn verify_signature(&self, key: &[u8]) -> Result<bool> {
        let Some(signature) = &self.signature else {
            return Ok(false);
        };
        let Ok(expected) = hex::decode(signature) else {
            return Ok(false);
        };
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| StagecheckError::Config(format!("invalid report signing key: {}", e)))?;
        mac.update(&self.signing_payload()?);
        Ok(mac.verify_slice(&expected).is_ok())
    }
}

/// Where [`write_artifacts`] put things.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub dir: PathBuf,
    pub report_json: PathBuf,
    pub report_md: PathBuf,
    pub evidence: Vec<PathBuf>,
    pub manifest: PathBuf,
    pub signed: bool,
}

/// Outcome of [`verify_artifacts`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    /// Files whose digest no longer matches, or that are missing.
    pub mismatched: Vec<String>,
    /// `None` when no key was supplied.
    pub signature_valid: Option<bool>,
}

impl Verification {
    pub fn is_ok(&self) -> bool {
        self.mismatched.is_empty() && self.signature_valid != Some(false)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Evidence names come from the engine, but never let one escape the directory.
fn safe_evidence_name(name: &str) -> Result<&str> {
    let path = Path::new(name);
    let plain = path.components().count() == 1
        && matches!(path.components().next(), Some(Component::Normal(_)));
    if plain {
        Ok(name)
    } else {
        Err(StagecheckError::Scope(format!(
            "evidence name '{}' is not a plain file name",
            name
        )))
    }
}

fn write_file(dir: &Path, relative: &str, bytes: &[u8], manifest: &mut Manifest) -> Result<PathBuf> {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, bytes)?;
    manifest.files.push(ManifestEntry {
        path: relative.to_string(),
        sha256: sha256_hex(bytes),
        bytes: bytes.len() as u64,
    });
    debug!("Wrote {}", path.display());
    Ok(path)
}

/// Writes report, evidence and manifest into `<report_dir>/<correlation_id>/`.
///
/// Everything written is redacted; `signing_key` adds an HMAC-SHA256 over
/// the manifest.
pub fn write_artifacts(
    run: &ValidationRun,
    report_dir: &Path,
    signing_key: Option<&[u8]>,
) -> Result<ArtifactSet> {
    let dir = report_dir.join(run.correlation_id.as_str());
    fs::create_dir_all(&dir)?;

    let mut manifest = Manifest {
        correlation_id: run.correlation_id.to_string(),
        files: Vec::new(),
        signature: None,
        signature_alg: None,
    };

    let report_json = write_file(&dir, "report.json", json::to_json(run)?.as_bytes(), &mut manifest)?;
    let report_md = write_file(&dir, "report.md", markdown::render(run).as_bytes(), &mut manifest)?;

    let mut evidence = Vec::with_capacity(run.evidence.len());
    for item in &run.evidence {
        let name = safe_evidence_name(&item.name)?;
        let content = serde_json::json!({
            "correlation_id": run.correlation_id,
            "name": item.name,
            "description": item.description,
            "content": redaction::redact(&item.content),
        });
        let bytes = serde_json::to_vec_pretty(&content)?;
        evidence.push(write_file(&dir, &format!("evidence/{}", name), &bytes, &mut manifest)?);
    }

    if let Some(key) = signing_key {
        manifest.sign(key)?;
    }
    let manifest_path = dir.join(MANIFEST_FILE);
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;

    info!(
        "Wrote report for {} to {} ({} evidence file(s){})",
        run.correlation_id,
        dir.display(),
        evidence.len(),
        if signing_key.is_some() { ", signed" } else { "" }
    );
    Ok(ArtifactSet {
        dir,
        report_json,
        report_md,
        evidence,
        manifest: manifest_path,
        signed: signing_key.is_some(),
    })
}

/// Re-hashes every file listed in a run directory's manifest.
pub fn verify_artifacts(dir: &Path, signing_key: Option<&[u8]>) -> Result<Verification> {
    let raw = fs::read(dir.join(MANIFEST_FILE))?;
    let manifest: Manifest = serde_json::from_slice(&raw)?;

    let mut mismatched = Vec::new();
    for entry in &manifest.files {
        match fs::read(dir.join(&entry.path)) {
            Ok(bytes) if sha256_hex(&bytes) == entry.sha256 => {}
            _ => mismatched.push(entry.path.clone()),
        }
    }
    let signature_valid = match signing_key {
        Some(key) => Some(manifest.verify_signature(key)?),
        None => None,
    };
    Ok(Verification {
        mismatched,
        signature_valid,
    })
}
