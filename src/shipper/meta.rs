//! Persisted record of which blocks have been shipped.
//!
//! Two files are maintained side by side in the tenant directory:
//! - `tenantstore.shipper.json`: block ID → shipped time (unix ms)
//! - `thanos.shipper.json`: legacy list of uploaded block IDs
//!
//! Readers prefer the current file and fall back to the legacy one. A missing
//! legacy file means the shipper has never run.

use crate::fsutil;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use ulid::Ulid;

pub const SHIPPER_META_FILENAME: &str = "tenantstore.shipper.json";
pub const LEGACY_SHIPPER_META_FILENAME: &str = "thanos.shipper.json";
pub const SHIPPER_META_VERSION_1: u32 = 1;

/// Shipped block IDs and the time each was shipped.
pub type ShippedBlocks = HashMap<Ulid, DateTime<Utc>>;

/// Current on-disk format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipperMeta {
    pub version: u32,
    /// Unix milliseconds per block.
    #[serde(default)]
    pub shipped: BTreeMap<Ulid, i64>,
}

/// Legacy on-disk format, kept for readers of the previous layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyShipperMeta {
    pub version: u32,
    #[serde(default)]
    pub uploaded: Vec<Ulid>,
}

impl ShipperMeta {
    pub fn new() -> Self {
        Self {
            version: SHIPPER_META_VERSION_1,
            shipped: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, id: Ulid, shipped_at: DateTime<Utc>) {
        self.shipped.insert(id, shipped_at.timestamp_millis());
    }

    pub fn to_shipped_blocks(&self) -> ShippedBlocks {
        self.shipped
            .iter()
            .map(|(id, ms)| (*id, DateTime::from_timestamp_millis(*ms).unwrap_or_default()))
            .collect()
    }

    fn to_legacy(&self) -> LegacyShipperMeta {
        LegacyShipperMeta {
            version: SHIPPER_META_VERSION_1,
            uploaded: self.shipped.keys().copied().collect(),
        }
    }
}

/// Read shipped blocks from `dir`, falling back to the legacy file.
///
/// Legacy entries carry no timestamp, so `now` is used for them. Returns an
/// empty set when neither file exists.
pub fn read_shipped_blocks(dir: &Path, now: DateTime<Utc>) -> Result<ShippedBlocks> {
    match read_shipper_meta_file(dir) {
        Ok(meta) => Ok(meta.to_shipped_blocks()),
        Err(_) => read_legacy_shipped_blocks(dir, now),
    }
}

fn read_legacy_shipped_blocks(dir: &Path, now: DateTime<Utc>) -> Result<ShippedBlocks> {
    let meta = match read_legacy_shipper_meta_file(dir) {
        Ok(meta) => meta,
        Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => LegacyShipperMeta::default(),
        Err(e) => return Err(e),
    };
    Ok(meta.uploaded.into_iter().map(|id| (id, now)).collect())
}

/// Read `<dir>/tenantstore.shipper.json`.
pub fn read_shipper_meta_file(dir: &Path) -> Result<ShipperMeta> {
    let path = dir.join(SHIPPER_META_FILENAME);
    let bytes = std::fs::read(&path)?;
    let meta: ShipperMeta = serde_json::from_slice(&bytes).map_err(|e| {
        Error::Serialization(format!("failed to parse {} as JSON: {}", path.display(), e))
    })?;
    if meta.version != SHIPPER_META_VERSION_1 {
        return Err(Error::Serialization(format!(
            "unexpected meta file version {}",
            meta.version
        )));
    }
    Ok(meta)
}

/// Read `<dir>/thanos.shipper.json`.
pub fn read_legacy_shipper_meta_file(dir: &Path) -> Result<LegacyShipperMeta> {
    let path = dir.join(LEGACY_SHIPPER_META_FILENAME);
    let bytes = std::fs::read(&path)?;
    let meta: LegacyShipperMeta = serde_json::from_slice(&bytes).map_err(|e| {
        Error::Serialization(format!("failed to parse {} as JSON: {}", path.display(), e))
    })?;
    if meta.version != SHIPPER_META_VERSION_1 {
        return Err(Error::Serialization(format!(
            "unexpected meta file version {}",
            meta.version
        )));
    }
    Ok(meta)
}

/// Persist `meta` in both the current and the legacy format.
pub fn write_shipper_meta_file(dir: &Path, meta: &ShipperMeta) -> Result<()> {
    fsutil::write_json_atomic(&dir.join(SHIPPER_META_FILENAME), meta)?;
    fsutil::write_json_atomic(&dir.join(LEGACY_SHIPPER_META_FILENAME), &meta.to_legacy())
}
