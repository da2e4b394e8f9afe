//! Integration tests for block shipping.
//!
//! Tests cover:
//! - Idempotent repeated syncs
//! - Blocks already present remotely are recorded without re-upload
//! - Empty and compacted blocks are never shipped
//! - One failing upload does not stop the others
//! - Oldest-first shipping order
//! - Shipper record persistence and legacy fallback

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::memory::InMemory;
use object_store::ObjectStore;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tenantstore::block::{self, BlockMeta, BlockStats, CHUNKS_DIRNAME, INDEX_FILENAME};
use tenantstore::bucket::{Bucket, ObjectStoreBucket};
use tenantstore::clock::{Clock, ManualClock};
use tenantstore::config::ShipperConfig;
use tenantstore::shipper::meta::{
    read_shipper_meta_file, write_shipper_meta_file, LEGACY_SHIPPER_META_FILENAME,
    SHIPPER_META_FILENAME,
};
use tenantstore::shipper::{read_shipped_blocks, Shipper, ShipperMeta};
use tenantstore::{Error, Result};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

fn write_block(root: &Path, min_time: i64, num_samples: u64, level: u32) -> BlockMeta {
    let mut meta = BlockMeta::new(
        Ulid::new(),
        min_time,
        min_time + 1_000,
        BlockStats {
            num_samples,
            num_series: 1,
            num_chunks: 1,
        },
    );
    meta.compaction.level = level;
    let dir = block::block_dir(root, meta.ulid);
    std::fs::create_dir_all(dir.join(CHUNKS_DIRNAME)).unwrap();
    std::fs::write(dir.join(CHUNKS_DIRNAME).join("000001"), b"chunk data").unwrap();
    std::fs::write(dir.join(INDEX_FILENAME), b"index data").unwrap();
    meta.write_to_dir(&dir).unwrap();
    meta
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    ))
}

/// Bucket wrapper recording upload order and failing chosen blocks.
struct TestBucket {
    inner: ObjectStoreBucket,
    uploads: Mutex<Vec<Ulid>>,
    exists_calls: Mutex<usize>,
    fail_uploads: HashSet<Ulid>,
    fail_exists: bool,
}

impl TestBucket {
    fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner: ObjectStoreBucket::for_tenant(store, "tenant-1"),
            uploads: Mutex::new(Vec::new()),
            exists_calls: Mutex::new(0),
            fail_uploads: HashSet::new(),
            fail_exists: false,
        }
    }

    fn uploads(&self) -> Vec<Ulid> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl Bucket for TestBucket {
    async fn exists(&self, path: &str) -> Result<bool> {
        *self.exists_calls.lock() += 1;
        if self.fail_exists {
            return Err(Error::Internal("bucket unavailable".to_string()));
        }
        self.inner.exists(path).await
    }

    async fn upload_block(&self, block_dir: &Path, meta: &BlockMeta) -> Result<()> {
        if self.fail_uploads.contains(&meta.ulid) {
            return Err(Error::Internal("upload refused".to_string()));
        }
        self.inner.upload_block(block_dir, meta).await?;
        self.uploads.lock().push(meta.ulid);
        Ok(())
    }
}

fn shipper(dir: &Path, bucket: Arc<TestBucket>, clock: Arc<ManualClock>) -> Shipper {
    Shipper::new(dir, bucket, &ShipperConfig::default(), clock)
}

fn recorded(dir: &Path) -> HashSet<Ulid> {
    read_shipper_meta_file(dir)
        .unwrap()
        .shipped
        .keys()
        .copied()
        .collect()
}

#[tokio::test]
async fn test_second_sync_ships_nothing() {
    let dir = TempDir::new().unwrap();
    let bucket = Arc::new(TestBucket::new(Arc::new(InMemory::new())));
    let shipper = shipper(dir.path(), bucket.clone(), clock());
    write_block(dir.path(), 0, 10, 1);
    write_block(dir.path(), 1_000, 10, 1);

    let cancel = CancellationToken::new();
    assert_eq!(shipper.sync(&cancel).await.unwrap(), 2);
    assert_eq!(shipper.sync(&cancel).await.unwrap(), 0);
    assert_eq!(bucket.uploads().len(), 2);
}

#[tokio::test]
async fn test_remote_block_recorded_without_reupload() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let meta = write_block(dir.path(), 0, 10, 1);

    // Simulate a crash after upload but before the record was written.
    let first = Arc::new(TestBucket::new(store.clone()));
    first
        .upload_block(&block::block_dir(dir.path(), meta.ulid), &meta)
        .await
        .unwrap();

    let bucket = Arc::new(TestBucket::new(store));
    let clock = clock();
    let shipper = shipper(dir.path(), bucket.clone(), clock.clone());

    assert_eq!(shipper.sync(&CancellationToken::new()).await.unwrap(), 1);
    assert!(bucket.uploads().is_empty());

    let record = read_shipper_meta_file(dir.path()).unwrap();
    assert_eq!(
        record.shipped.get(&meta.ulid),
        Some(&clock.now().timestamp_millis())
    );
}

#[tokio::test]
async fn test_empty_and_compacted_blocks_never_shipped() {
    let dir = TempDir::new().unwrap();
    let bucket = Arc::new(TestBucket::new(Arc::new(InMemory::new())));
    let shipper = shipper(dir.path(), bucket.clone(), clock());
    let empty = write_block(dir.path(), 0, 0, 1);
    let compacted = write_block(dir.path(), 1_000, 10, 2);
    let regular = write_block(dir.path(), 2_000, 10, 1);

    let cancel = CancellationToken::new();
    for _ in 0..3 {
        shipper.sync(&cancel).await.unwrap();
    }

    assert_eq!(bucket.uploads(), vec![regular.ulid]);
    let shipped = recorded(dir.path());
    assert!(!shipped.contains(&empty.ulid));
    assert!(!shipped.contains(&compacted.ulid));
    // Skipped blocks never reach the existence check.
    assert_eq!(*bucket.exists_calls.lock(), 1);
}

#[tokio::test]
async fn test_failed_upload_does_not_stop_others() {
    let dir = TempDir::new().unwrap();
    let b1 = write_block(dir.path(), 100, 10, 1);
    let b2 = write_block(dir.path(), 200, 10, 1);
    let b3 = write_block(dir.path(), 300, 10, 1);

    let mut bucket = TestBucket::new(Arc::new(InMemory::new()));
    bucket.fail_uploads.insert(b2.ulid);
    let bucket = Arc::new(bucket);
    let shipper = shipper(dir.path(), bucket.clone(), clock());

    let err = shipper.sync(&CancellationToken::new()).await.unwrap_err();
    match &err {
        Error::ShipFailures { shipped, failed } => {
            assert_eq!(*shipped, 2);
            assert_eq!(*failed, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("failed to sync 1 blocks"));
    assert!(err.is_retryable());

    assert_eq!(recorded(dir.path()), HashSet::from([b1.ulid, b3.ulid]));
    assert_eq!(bucket.uploads(), vec![b1.ulid, b3.ulid]);
}

#[tokio::test]
async fn test_failed_block_retried_next_sync() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let b1 = write_block(dir.path(), 100, 10, 1);

    let mut failing = TestBucket::new(store.clone());
    failing.fail_uploads.insert(b1.ulid);
    let cancel = CancellationToken::new();
    assert!(shipper(dir.path(), Arc::new(failing), clock())
        .sync(&cancel)
        .await
        .is_err());
    assert!(recorded(dir.path()).is_empty());

    let healthy = Arc::new(TestBucket::new(store));
    assert_eq!(
        shipper(dir.path(), healthy.clone(), clock())
            .sync(&cancel)
            .await
            .unwrap(),
        1
    );
    assert_eq!(healthy.uploads(), vec![b1.ulid]);
}

#[tokio::test]
async fn test_blocks_shipped_oldest_first() {
    let dir = TempDir::new().unwrap();
    let b100 = write_block(dir.path(), 100, 10, 1);
    let b50 = write_block(dir.path(), 50, 10, 1);
    let b200 = write_block(dir.path(), 200, 10, 1);

    let bucket = Arc::new(TestBucket::new(Arc::new(InMemory::new())));
    let shipper = shipper(dir.path(), bucket.clone(), clock());
    shipper.sync(&CancellationToken::new()).await.unwrap();

    assert_eq!(bucket.uploads(), vec![b50.ulid, b100.ulid, b200.ulid]);
}

#[tokio::test]
async fn test_existence_check_failure_aborts_sync() {
    let dir = TempDir::new().unwrap();
    write_block(dir.path(), 0, 10, 1);

    let mut bucket = TestBucket::new(Arc::new(InMemory::new()));
    bucket.fail_exists = true;
    let bucket = Arc::new(bucket);
    let shipper = shipper(dir.path(), bucket.clone(), clock());

    let err = shipper.sync(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::ExistenceCheck(_)));
    assert!(bucket.uploads().is_empty());
    assert!(!dir.path().join(SHIPPER_META_FILENAME).exists());
}

#[tokio::test]
async fn test_cancelled_sync_uploads_nothing() {
    let dir = TempDir::new().unwrap();
    write_block(dir.path(), 0, 10, 1);
    let bucket = Arc::new(TestBucket::new(Arc::new(InMemory::new())));
    let shipper = shipper(dir.path(), bucket.clone(), clock());

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        shipper.sync(&cancel).await,
        Err(Error::Cancelled)
    ));
    assert!(bucket.uploads().is_empty());
}

#[tokio::test]
async fn test_corrupt_record_rebuilt() {
    let dir = TempDir::new().unwrap();
    let meta = write_block(dir.path(), 0, 10, 1);
    std::fs::write(dir.path().join(SHIPPER_META_FILENAME), b"{not json").unwrap();
    std::fs::write(dir.path().join(LEGACY_SHIPPER_META_FILENAME), b"{not json").unwrap();

    let bucket = Arc::new(TestBucket::new(Arc::new(InMemory::new())));
    let shipper = shipper(dir.path(), bucket.clone(), clock());
    assert_eq!(shipper.sync(&CancellationToken::new()).await.unwrap(), 1);
    assert_eq!(recorded(dir.path()), HashSet::from([meta.ulid]));
}

#[tokio::test]
async fn test_remote_meta_is_enriched() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let meta = write_block(dir.path(), 0, 10, 1);

    let bucket = Arc::new(TestBucket::new(store.clone()));
    shipper(dir.path(), bucket, clock())
        .sync(&CancellationToken::new())
        .await
        .unwrap();

    let path = object_store::path::Path::from(format!("tenant-1/{}/meta.json", meta.ulid));
    let bytes = store.get(&path).await.unwrap().bytes().await.unwrap();
    let remote: BlockMeta = serde_json::from_slice(&bytes).unwrap();
    let thanos = remote.thanos.unwrap();
    assert_eq!(thanos.source, "ingester");
    assert_eq!(thanos.segment_files, vec!["000001"]);

    for file in ["index", "chunks/000001"] {
        let path = object_store::path::Path::from(format!("tenant-1/{}/{}", meta.ulid, file));
        assert!(store.head(&path).await.is_ok(), "missing {file}");
    }
}

#[test]
fn test_record_round_trip() {
    let dir = TempDir::new().unwrap();
    let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
    let at: DateTime<Utc> = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();

    let mut meta = ShipperMeta::new();
    for id in &ids {
        meta.insert(*id, at);
    }
    write_shipper_meta_file(dir.path(), &meta).unwrap();

    let shipped = read_shipped_blocks(dir.path(), Utc::now()).unwrap();
    assert_eq!(shipped.len(), 3);
    for id in &ids {
        assert_eq!(shipped.get(id), Some(&at));
    }
}

#[test]
fn test_legacy_only_record_uses_now() {
    let dir = TempDir::new().unwrap();
    let ids: Vec<Ulid> = (0..2).map(|_| Ulid::new()).collect();
    let legacy = serde_json::json!({
        "version": 1,
        "uploaded": ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
    });
    std::fs::write(
        dir.path().join(LEGACY_SHIPPER_META_FILENAME),
        serde_json::to_vec(&legacy).unwrap(),
    )
    .unwrap();

    let now = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
    let shipped = read_shipped_blocks(dir.path(), now).unwrap();
    assert_eq!(
        shipped.keys().copied().collect::<HashSet<_>>(),
        ids.iter().copied().collect::<HashSet<_>>()
    );
    assert!(shipped.values().all(|t| *t == now));
}

#[test]
fn test_missing_record_is_empty() {
    let dir = TempDir::new().unwrap();
    assert!(read_shipped_blocks(dir.path(), Utc::now())
        .unwrap()
        .is_empty());
}
