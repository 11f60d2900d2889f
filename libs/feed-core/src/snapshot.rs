//! Frozen configuration snapshots
//!
//! Background contexts share no memory with the consumer, so they receive
//! the configuration as serialized text captured at synthesis time. Later
//! controller changes in the consumer are not observed there.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{InterceptConfig, SharedConfig};
use crate::errors::SnapshotError;

/// Serialized, content-addressed copy of an [`InterceptConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// JSON encoding of the configuration.
    pub body: String,
    /// SHA-256 of `body`, lowercase hex.
    pub digest: String,
}

impl ConfigSnapshot {
    /// Serialize `config` into a snapshot.
    pub fn capture(config: &InterceptConfig) -> Result<Self, SnapshotError> {
        let body = serde_json::to_string(config).map_err(|e| SnapshotError::Encode(e.to_string()))?;
        let digest = compute_digest(&body);
        Ok(Self { body, digest })
    }

    /// Rebuild an independent configuration from the snapshot.
    pub fn restore(&self) -> Result<InterceptConfig, SnapshotError> {
        if compute_digest(&self.body) != self.digest {
            return Err(SnapshotError::Decode("digest mismatch".to_string()));
        }
        serde_json::from_str(&self.body).map_err(|e| SnapshotError::Decode(e.to_string()))
    }

    /// Short digest prefix, enough to tell snapshots apart in locators.
    pub fn short_digest(&self) -> &str {
        &self.digest[..self.digest.len().min(16)]
    }
}

impl SharedConfig {
    /// Capture the live configuration as it is right now.
    pub fn snapshot(&self) -> Result<ConfigSnapshot, SnapshotError> {
        self.update(|config| ConfigSnapshot::capture(config))
    }
}

fn compute_digest(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}
