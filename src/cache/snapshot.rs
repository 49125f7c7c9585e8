//! On-disk snapshot format: an 8-byte magic, a little-endian u32 schema
//! version, then the bincode payload.
//!
//! Bump `SCHEMA_VERSION` whenever `CacheSnapshot` or anything it contains
//! changes shape; older files are then rebuilt instead of misread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CacheError;
use crate::fingerprint::{Descriptor, ImageFingerprint, Keypoint};
use crate::metadata::CardMetadata;
use crate::reference::ReferenceEntry;

pub const MAGIC: &[u8; 8] = b"CMREFv\0\0";
pub const SCHEMA_VERSION: u32 = 1;
const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    pub orientation: f32,
    pub strength: f32,
    pub descriptor: Descriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub relative_path: String,
    pub folder: String,
    pub width: u32,
    pub height: u32,
    pub features: Vec<FeatureRecord>,
    pub metadata: Option<CardMetadata>,
}

impl From<&ReferenceEntry> for EntryRecord {
    fn from(entry: &ReferenceEntry) -> Self {
        let (width, height) = entry.fingerprint.dimensions();
        let features = entry
            .fingerprint
            .keypoints()
            .iter()
            .zip(entry.fingerprint.descriptors())
            .map(|(kp, desc)| FeatureRecord {
                x: kp.x,
                y: kp.y,
                scale: kp.scale,
                orientation: kp.orientation,
                strength: kp.strength,
                descriptor: *desc,
            })
            .collect();
        Self {
            relative_path: entry.relative_path.clone(),
            folder: entry.folder.clone(),
            width,
            height,
            features,
            metadata: entry.metadata.clone(),
        }
    }
}

impl EntryRecord {
    /// `None` if the stored features no longer form a matchable fingerprint.
    pub fn into_entry(self) -> Option<ReferenceEntry> {
        let (keypoints, descriptors): (Vec<Keypoint>, Vec<Descriptor>) = self
            .features
            .into_iter()
            .map(|f| {
                (
                    Keypoint {
                        x: f.x,
                        y: f.y,
                        scale: f.scale,
                        orientation: f.orientation,
                        strength: f.strength,
                    },
                    f.descriptor,
                )
            })
            .unzip();
        let fingerprint = ImageFingerprint::new(self.width, self.height, keypoints, descriptors)?;
        Some(ReferenceEntry {
            relative_path: self.relative_path,
            folder: self.folder,
            fingerprint,
            metadata: self.metadata,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Canonical reference root the snapshot was built from.
    pub root_path: String,
    /// `FingerprintConfig::digest` at build time.
    pub fingerprint_digest: String,
    pub root_signature: String,
    pub folder_signatures: BTreeMap<String, String>,
    pub entries: Vec<EntryRecord>,
    /// Time of the last full build. Partial rebuilds keep it.
    pub created_at: DateTime<Utc>,
}

impl CacheSnapshot {
    pub fn is_expired(&self, now: DateTime<Utc>, max_age_days: i64) -> bool {
        now.signed_duration_since(self.created_at) > chrono::Duration::days(max_age_days)
    }
}

pub fn encode(snapshot: &CacheSnapshot) -> Result<Vec<u8>, CacheError> {
    let payload = bincode::serialize(snapshot)?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<CacheSnapshot, CacheError> {
    if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
        return Err(CacheError::BadMagic);
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[8..HEADER_LEN]);
    let found = u32::from_le_bytes(version);
    if found != SCHEMA_VERSION {
        return Err(CacheError::SchemaVersion {
            found,
            expected: SCHEMA_VERSION,
        });
    }
    Ok(bincode::deserialize(&bytes[HEADER_LEN..])?)
}
