//! Versioned Artifact Container
//!
//! Trained models are persisted as opaque payloads wrapped in an envelope
//! that records the format version, what the payload is and for which
//! region, plus an xxh3 checksum of the payload.
//!
//! Artifacts are written once per (region, model) under a deterministic
//! name, so concurrent writers never share a file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{DewsError, Result};
use crate::forecast::ModelKind;

/// Version for artifact format migrations
pub const ARTIFACT_VERSION: u32 = 1;

/// File holding the anomaly detector for every region
pub const ANOMALY_ARTIFACT: &str = "anomaly_detector.bin";

/// What an envelope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    AnomalyDetector,
    Forecaster(ModelKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEnvelope {
    /// Format version
    pub version: u32,
    pub kind: ArtifactKind,
    /// Empty for artifacts spanning all regions
    pub region: String,
    /// xxh3 of `payload`
    pub checksum: u64,
    pub payload: Vec<u8>,
}

impl ArtifactEnvelope {
    pub fn seal(kind: ArtifactKind, region: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            version: ARTIFACT_VERSION,
            kind,
            region: region.into(),
            checksum: xxh3_64(&payload),
            payload,
        }
    }

    /// Verify the checksum and expected kind, returning the payload.
    pub fn open(self, expected: ArtifactKind) -> Result<Vec<u8>> {
        if self.kind != expected {
            return Err(DewsError::Deserialization(format!(
                "expected {:?} artifact, found {:?}",
                expected, self.kind
            )));
        }
        if xxh3_64(&self.payload) != self.checksum {
            return Err(DewsError::ChecksumMismatch(self.describe()));
        }
        Ok(self.payload)
    }

    fn describe(&self) -> String {
        match self.kind {
            ArtifactKind::AnomalyDetector => "anomaly detector".to_string(),
            ArtifactKind::Forecaster(kind) => format!("{}/{}", self.region, kind),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| DewsError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: ArtifactEnvelope =
            bincode::deserialize(bytes).map_err(|e| DewsError::Deserialization(e.to_string()))?;

        if envelope.version > ARTIFACT_VERSION {
            return Err(DewsError::UnsupportedVersion {
                found: envelope.version,
                max_supported: ARTIFACT_VERSION,
            });
        }

        Ok(envelope)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = self.to_bytes()?;
        fs::write(path, &bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "artifact written");
        Ok(())
    }

    /// Read an artifact; an absent file is `MissingArtifact`.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DewsError::MissingArtifact(path.to_path_buf()));
        }
        Self::from_bytes(&fs::read(path)?)
    }
}

/// `{region}_{model}.bin`.
///
/// Letters, digits and `-` are kept; every other byte of the region,
/// `_` included, becomes `_XX` (upper-case hex), so distinct regions never
/// share a file.
pub fn artifact_name(region: &str, kind: ModelKind) -> String {
    let mut encoded = String::with_capacity(region.len());
    for c in region.chars() {
        if c.is_alphanumeric() || c == '-' {
            encoded.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                encoded.push_str(&format!("_{:02X}", byte));
            }
        }
    }
    format!("{}_{}.bin", encoded, kind.name())
}

pub fn artifact_path(dir: &Path, region: &str, kind: ModelKind) -> PathBuf {
    dir.join(artifact_name(region, kind))
}
