use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

/// A planar image target a tracker can be asked to find.
///
/// The asset bytes are opaque to the pipeline; only a SHA-256 fingerprint is kept so two
/// loads of the same asset can be recognised.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageTarget {
    name: String,
    fingerprint: [u8; 32],
    /// Physical width of the target in scene units.
    scale: f32,
}

impl ImageTarget {
    pub fn from_bytes(name: &str, asset: &[u8], scale: f32) -> Result<Self> {
        crate::validate_name(name)?;
        if asset.is_empty() {
            return Err(anyhow!("target '{}': asset is empty", name));
        }
        if !(scale.is_finite() && scale > 0.0) {
            return Err(anyhow!("target '{}': scale must be positive", name));
        }
        Ok(Self {
            name: name.to_string(),
            fingerprint: Sha256::digest(asset).into(),
            scale,
        })
    }

    pub fn from_file(name: &str, path: &Path, scale: f32) -> Result<Self> {
        let asset = std::fs::read(path)
            .map_err(|e| anyhow!("failed to read target asset {}: {}", path.display(), e))?;
        Self::from_bytes(name, &asset, scale)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint)
    }
}
