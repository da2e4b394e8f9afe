//! Block shipper
//!
//! The shipper scans a tenant's TSDB directory for finished blocks and uploads
//! the ones that have not been shipped yet. What has been shipped is persisted
//! next to the blocks (see [`meta`]) so restarts do not re-upload.
//!
//! `sync` is not safe to call concurrently with itself for the same directory.
//! It is safe to run alongside the storage engine's own compaction: it only
//! reads block directories and writes its own meta files.

pub mod meta;
mod telemetry;

pub use meta::{read_shipped_blocks, ShippedBlocks, ShipperMeta};

use crate::block::{self, BlockMeta, META_FILENAME};
use crate::bucket::Bucket;
use crate::clock::Clock;
use crate::config::ShipperConfig;
use crate::{Error, Result};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// External label marking blocks built from out-of-order samples.
pub const OUT_OF_ORDER_EXTERNAL_LABEL_KEY: &str = "__out_of_order__";
pub const OUT_OF_ORDER_EXTERNAL_LABEL_VALUE: &str = "true";

/// Uploads finished TSDB blocks from a local directory to a bucket.
pub struct Shipper {
    dir: PathBuf,
    bucket: Arc<dyn Bucket>,
    source: String,
    add_ooo_label: bool,
    clock: Arc<dyn Clock>,
    /// Unix ms of the last successful upload, 0 if none yet.
    last_successful_upload_ms: AtomicI64,
}

impl Shipper {
    pub fn new(
        dir: impl Into<PathBuf>,
        bucket: Arc<dyn Bucket>,
        config: &ShipperConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dir: dir.into(),
            bucket,
            source: config.source.clone(),
            add_ooo_label: config.add_ooo_label,
            clock,
            last_successful_upload_ms: AtomicI64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bucket(&self) -> &Arc<dyn Bucket> {
        &self.bucket
    }

    /// Unix ms of the last successful block upload, 0 if nothing was uploaded.
    pub fn last_successful_upload_time(&self) -> i64 {
        self.last_successful_upload_ms.load(Ordering::Acquire)
    }

    /// Run one synchronization pass.
    ///
    /// Ships every base-level, non-empty local block that is not yet shipped,
    /// oldest first. Returns the number of blocks newly recorded as shipped.
    /// Individual upload failures do not stop the pass; they are reported as
    /// [`Error::ShipFailures`] after the record has been persisted.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<usize> {
        let result = self.sync_pass(cancel).await;
        telemetry::record_dir_sync();
        if matches!(result, Err(ref e) if !matches!(e, Error::ShipFailures { .. })) {
            telemetry::record_dir_sync_failure();
        }
        result
    }

    async fn sync_pass(&self, cancel: &CancellationToken) -> Result<usize> {
        let previously_shipped = match read_shipped_blocks(&self.dir, self.clock.now()) {
            Ok(shipped) => shipped,
            Err(e) => {
                // The record only saves bucket round trips; rebuild it from scratch.
                warn!(dir = %self.dir.display(), error = %e, "Reading shipper meta file failed, will override it");
                ShippedBlocks::new()
            }
        };

        let mut record = ShipperMeta::new();
        let mut shipped = 0usize;
        let mut upload_errors = 0usize;

        for meta in self.block_metas_from_oldest()? {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(shipped_at) = previously_shipped.get(&meta.ulid) {
                record.insert(meta.ulid, *shipped_at);
                continue;
            }

            if meta.stats.num_samples == 0 {
                debug!(block = %meta.ulid, "Ignoring empty block");
                continue;
            }

            // Higher levels come from a separate compaction pipeline that ships them itself.
            if meta.compaction.level > 1 {
                debug!(block = %meta.ulid, level = meta.compaction.level, "Skipping compacted block");
                continue;
            }

            let meta_path = format!("{}/{}", meta.ulid, META_FILENAME);
            let exists = self
                .bucket
                .exists(&meta_path)
                .await
                .map_err(|e| Error::ExistenceCheck(Box::new(e)))?;
            if exists {
                // Uploaded before a crash, but never recorded. Count it as shipped now.
                info!(block = %meta.ulid, "Block already present in bucket, recording as shipped");
                record.insert(meta.ulid, self.clock.now());
                shipped += 1;
                continue;
            }

            if let Err(e) = self.upload(&meta).await {
                error!(block = %meta.ulid, error = %e, "Shipping failed");
                upload_errors += 1;
                continue;
            }

            let now = self.clock.now();
            record.insert(meta.ulid, now);
            shipped += 1;
            self.last_successful_upload_ms
                .store(now.timestamp_millis(), Ordering::Release);
            telemetry::record_upload();
        }

        if let Err(e) = meta::write_shipper_meta_file(&self.dir, &record) {
            warn!(dir = %self.dir.display(), error = %e, "Updating shipper meta file failed");
        }

        if upload_errors > 0 {
            telemetry::record_upload_failures(upload_errors as u64);
            return Err(Error::ShipFailures {
                shipped,
                failed: upload_errors,
            });
        }
        Ok(shipped)
    }

    /// Upload one block with enriched metadata.
    ///
    /// The enrichment only goes to the bucket. The local `meta.json` is left
    /// alone because the storage engine treats it as the block-complete marker.
    async fn upload(&self, meta: &BlockMeta) -> Result<()> {
        info!(block = %meta.ulid, "Upload new block");

        let block_dir = block::block_dir(&self.dir, meta.ulid);
        let enriched = self.enrich(meta, &block_dir);
        self.bucket.upload_block(&block_dir, &enriched).await
    }

    fn enrich(&self, meta: &BlockMeta, block_dir: &Path) -> BlockMeta {
        let mut enriched = meta.clone();
        let out_of_order = enriched.from_out_of_order();

        let thanos = enriched.thanos.get_or_insert_with(Default::default);
        thanos.source = self.source.clone();
        thanos.segment_files = block::segment_files(block_dir);
        if self.add_ooo_label && out_of_order {
            thanos.labels.insert(
                OUT_OF_ORDER_EXTERNAL_LABEL_KEY.to_string(),
                OUT_OF_ORDER_EXTERNAL_LABEL_VALUE.to_string(),
            );
        }
        enriched
    }

    /// Metadata of every block directory, sorted by `min_time` ascending.
    fn block_metas_from_oldest(&self) -> Result<Vec<BlockMeta>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| Error::BlockMeta {
            dir: self.dir.clone(),
            reason: format!("read dir: {}", e),
        })?;

        let mut metas = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if block::is_block_dir(name).is_none() {
                continue;
            }
            let path = entry.path();
            let file_type = std::fs::metadata(&path).map_err(|e| Error::BlockMeta {
                dir: path.clone(),
                reason: format!("stat block: {}", e),
            })?;
            if !file_type.is_dir() {
                continue;
            }
            metas.push(BlockMeta::read_from_dir(&path)?);
        }

        metas.sort_by_key(|m| m.min_time);
        Ok(metas)
    }
}
