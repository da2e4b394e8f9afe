//! Snapshot of the blocks a tenant has shipped.

use crate::shipper::{read_shipped_blocks, ShippedBlocks};
use crate::Result;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

/// Shipped blocks as last read from the shipper's record.
///
/// Refreshes replace the whole map; readers get an immutable `Arc` and never
/// contend with the tenant state lock.
#[derive(Debug)]
pub struct ShippedBlocksCache {
    snapshot: ArcSwap<ShippedBlocks>,
}

impl Default for ShippedBlocksCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ShippedBlocksCache {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(ShippedBlocks::new()),
        }
    }

    /// Re-read the record in `dir` and publish it.
    ///
    /// On error the previous snapshot stays in place.
    pub fn refresh(&self, dir: &Path, now: DateTime<Utc>) -> Result<()> {
        let shipped = read_shipped_blocks(dir, now)?;
        self.snapshot.store(Arc::new(shipped));
        Ok(())
    }

    pub fn load(&self) -> Arc<ShippedBlocks> {
        self.snapshot.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shipper::meta::{write_shipper_meta_file, ShipperMeta};
    use tempfile::TempDir;
    use ulid::Ulid;

    #[test]
    fn test_refresh_swaps_snapshot() {
        let dir = TempDir::new().unwrap();
        let cache = ShippedBlocksCache::new();
        assert!(cache.load().is_empty());

        let id = Ulid::new();
        let mut meta = ShipperMeta::new();
        meta.insert(id, Utc::now());
        write_shipper_meta_file(dir.path(), &meta).unwrap();

        let before = cache.load();
        cache.refresh(dir.path(), Utc::now()).unwrap();

        assert!(before.is_empty());
        assert!(cache.load().contains_key(&id));
    }

    #[test]
    fn test_refresh_error_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let cache = ShippedBlocksCache::new();

        let id = Ulid::new();
        let mut meta = ShipperMeta::new();
        meta.insert(id, Utc::now());
        write_shipper_meta_file(dir.path(), &meta).unwrap();
        cache.refresh(dir.path(), Utc::now()).unwrap();

        std::fs::write(
            dir.path().join(crate::shipper::meta::SHIPPER_META_FILENAME),
            b"garbage",
        )
        .unwrap();
        std::fs::write(
            dir.path()
                .join(crate::shipper::meta::LEGACY_SHIPPER_META_FILENAME),
            b"garbage",
        )
        .unwrap();

        assert!(cache.refresh(dir.path(), Utc::now()).is_err());
        assert!(cache.load().contains_key(&id));
    }
}
