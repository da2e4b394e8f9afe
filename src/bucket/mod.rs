//! Remote bucket access for shipped blocks.
//!
//! The shipper only needs two things from object storage: "does this object
//! exist" and "upload this block directory". [`Bucket`] captures exactly that;
//! [`ObjectStoreBucket`] implements it over any [`object_store::ObjectStore`].

use crate::block::{self, BlockMeta, CHUNKS_DIRNAME, INDEX_FILENAME, META_FILENAME};
use crate::{Error, Result};
use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Object path of the tenant deletion mark, relative to the tenant prefix.
pub const TENANT_DELETION_MARK_PATH: &str = "markers/tenant-deletion-mark.json";

/// Remote block storage for a single tenant.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Check whether an object exists at `path` (relative to the tenant).
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Upload a local block directory, using `meta` as the remote `meta.json`.
    ///
    /// `meta.json` is uploaded last so its presence marks a complete block.
    async fn upload_block(&self, block_dir: &Path, meta: &BlockMeta) -> Result<()>;
}

/// [`Bucket`] over an object store, scoped to a tenant prefix.
pub struct ObjectStoreBucket {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreBucket {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self { store, prefix }
    }

    /// Tenant-scoped bucket: objects live under `<tenant_id>/`.
    pub fn for_tenant(store: Arc<dyn ObjectStore>, tenant_id: &str) -> Self {
        Self::new(store, tenant_id)
    }

    pub fn object_path(&self, relative: &str) -> ObjectPath {
        let relative = relative.trim_start_matches('/');
        if self.prefix.is_empty() {
            ObjectPath::from(relative)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, relative))
        }
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<ObjectPath> {
        let bytes = tokio::fs::read(local).await?;
        let location = self.object_path(remote);
        debug!(local = %local.display(), remote = %location, size_bytes = bytes.len(), "Uploading block file");
        self.store.put(&location, bytes.into()).await?;
        Ok(location)
    }

    async fn cleanup(&self, uploaded: &[ObjectPath]) {
        for location in uploaded {
            if let Err(e) = self.store.delete(location).await {
                warn!(remote = %location, error = %e, "Failed to clean up partially uploaded block file");
            }
        }
    }

    async fn upload_files(
        &self,
        block_dir: &Path,
        meta: &BlockMeta,
        uploaded: &mut Vec<ObjectPath>,
    ) -> Result<()> {
        let id = meta.ulid.to_string();

        for segment in block::segment_files(block_dir) {
            let local = block_dir.join(CHUNKS_DIRNAME).join(&segment);
            let remote = format!("{}/{}/{}", id, CHUNKS_DIRNAME, segment);
            uploaded.push(self.put_file(&local, &remote).await?);
        }

        let remote_index = format!("{}/{}", id, INDEX_FILENAME);
        uploaded.push(
            self.put_file(&block_dir.join(INDEX_FILENAME), &remote_index)
                .await?,
        );

        let meta_bytes = serde_json::to_vec_pretty(meta)?;
        let meta_location = self.object_path(&format!("{}/{}", id, META_FILENAME));
        self.store.put(&meta_location, meta_bytes.into()).await?;
        Ok(())
    }
}

#[async_trait]
impl Bucket for ObjectStoreBucket {
    async fn exists(&self, path: &str) -> Result<bool> {
        match self.store.head(&self.object_path(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_block(&self, block_dir: &Path, meta: &BlockMeta) -> Result<()> {
        validate_block_dir(block_dir, meta)?;

        let mut uploaded = Vec::new();
        let result = self.upload_files(block_dir, meta, &mut uploaded).await;
        if result.is_err() {
            self.cleanup(&uploaded).await;
        }
        result
    }
}

fn validate_block_dir(block_dir: &Path, meta: &BlockMeta) -> Result<()> {
    let invalid = |reason: String| Error::InvalidBlock {
        dir: block_dir.to_path_buf(),
        reason,
    };

    if !block_dir.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    let dir_name = block_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if block::is_block_dir(dir_name) != Some(meta.ulid) {
        return Err(invalid(format!(
            "directory name does not match block ID {}",
            meta.ulid
        )));
    }
    if !block_dir.join(CHUNKS_DIRNAME).is_dir() {
        return Err(invalid(format!("missing {} directory", CHUNKS_DIRNAME)));
    }
    if !block_dir.join(INDEX_FILENAME).is_file() {
        return Err(invalid(format!("missing {} file", INDEX_FILENAME)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockStats;
    use object_store::memory::InMemory;
    use std::fs;
    use tempfile::TempDir;
    use ulid::Ulid;

    fn write_block(root: &Path) -> (std::path::PathBuf, BlockMeta) {
        let meta = BlockMeta::new(Ulid::new(), 0, 1_000, BlockStats::default());
        let dir = block::block_dir(root, meta.ulid);
        fs::create_dir_all(dir.join(CHUNKS_DIRNAME)).unwrap();
        fs::write(dir.join(CHUNKS_DIRNAME).join("000001"), b"chunk").unwrap();
        fs::write(dir.join(INDEX_FILENAME), b"index").unwrap();
        meta.write_to_dir(&dir).unwrap();
        (dir, meta)
    }

    #[tokio::test]
    async fn test_upload_then_exists() {
        let root = TempDir::new().unwrap();
        let (dir, meta) = write_block(root.path());
        let store = Arc::new(InMemory::new());
        let bucket = ObjectStoreBucket::for_tenant(store.clone(), "tenant-a");

        let meta_path = format!("{}/{}", meta.ulid, META_FILENAME);
        assert!(!bucket.exists(&meta_path).await.unwrap());

        bucket.upload_block(&dir, &meta).await.unwrap();

        assert!(bucket.exists(&meta_path).await.unwrap());
        assert!(bucket
            .exists(&format!("{}/chunks/000001", meta.ulid))
            .await
            .unwrap());
        assert!(bucket
            .exists(&format!("{}/index", meta.ulid))
            .await
            .unwrap());

        let location = ObjectPath::from(format!("tenant-a/{}/{}", meta.ulid, META_FILENAME));
        let remote = store.get(&location).await.unwrap().bytes().await.unwrap();
        let remote_meta: BlockMeta = serde_json::from_slice(&remote).unwrap();
        assert_eq!(remote_meta, meta);
    }

    #[tokio::test]
    async fn test_upload_rejects_incomplete_block() {
        let root = TempDir::new().unwrap();
        let (dir, meta) = write_block(root.path());
        fs::remove_file(dir.join(INDEX_FILENAME)).unwrap();
        let bucket = ObjectStoreBucket::for_tenant(Arc::new(InMemory::new()), "tenant-a");

        let err = bucket.upload_block(&dir, &meta).await.unwrap_err();
        assert!(matches!(err, Error::InvalidBlock { .. }));
        assert!(!bucket
            .exists(&format!("{}/{}", meta.ulid, META_FILENAME))
            .await
            .unwrap());
    }

    #[test]
    fn test_object_path_prefix() {
        let bucket = ObjectStoreBucket::new(Arc::new(InMemory::new()), "/tenant-a/");
        assert_eq!(
            bucket.object_path("markers/tenant-deletion-mark.json").as_ref(),
            "tenant-a/markers/tenant-deletion-mark.json"
        );
    }
}
