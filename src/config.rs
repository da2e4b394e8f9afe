//! Configuration and component factory
//!
//! Every setting has a default and can be overridden through environment
//! variables, so development setups need no configuration at all.

use crate::{Error, Result};
use object_store::{aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, ObjectStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shipper configuration
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// Whether blocks are shipped at all. Disabled tenants never get a shipper.
    pub enabled: bool,
    /// Source tag attached to uploaded block metadata
    pub source: String,
    /// Mark blocks built from out-of-order samples with an external label
    pub add_ooo_label: bool,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: "ingester".to_string(),
            add_ooo_label: false,
        }
    }
}

impl ShipperConfig {
    /// Environment variables:
    /// - SHIPPER_ENABLED (default: true)
    /// - SHIPPER_SOURCE (default: ingester)
    /// - SHIPPER_ADD_OOO_LABEL (default: false)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            enabled: env_bool("SHIPPER_ENABLED")?.unwrap_or(defaults.enabled),
            source: std::env::var("SHIPPER_SOURCE").unwrap_or(defaults.source),
            add_ooo_label: env_bool("SHIPPER_ADD_OOO_LABEL")?.unwrap_or(defaults.add_ooo_label),
        })
    }
}

/// Tenant lifecycle configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How often blocks are shipped
    pub ship_interval: Duration,
    /// How often the head is checked for compaction
    pub compaction_interval: Duration,
    /// Block range used to split forced head compactions
    pub block_duration: Duration,
    /// Close tenants idle for this long. `None` disables idle close.
    pub idle_timeout: Option<Duration>,
    /// How often idle tenants are looked for
    pub close_idle_interval: Duration,
    /// Force a head compaction once a tenant has been idle this long
    pub head_compaction_idle_timeout: Option<Duration>,
    /// Minimum time between two tenant deletion mark checks
    pub deletion_mark_check_interval: Duration,
    /// Tenants keep only an in-memory head and never write blocks
    pub head_only: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ship_interval: Duration::from_secs(60),
            compaction_interval: Duration::from_secs(60),
            block_duration: Duration::from_secs(2 * 60 * 60), // 2 hours
            idle_timeout: None,
            close_idle_interval: Duration::from_secs(60),
            head_compaction_idle_timeout: None,
            deletion_mark_check_interval: Duration::from_secs(60 * 60),
            head_only: false,
        }
    }
}

impl LifecycleConfig {
    /// Environment variables (durations in seconds):
    /// - SHIP_INTERVAL_SECS (default: 60)
    /// - COMPACTION_INTERVAL_SECS (default: 60)
    /// - BLOCK_DURATION_SECS (default: 7200)
    /// - IDLE_TIMEOUT_SECS (default: unset, 0 disables)
    /// - CLOSE_IDLE_INTERVAL_SECS (default: 60)
    /// - HEAD_COMPACTION_IDLE_TIMEOUT_SECS (default: unset, 0 disables)
    /// - DELETION_MARK_CHECK_INTERVAL_SECS (default: 3600)
    /// - HEAD_ONLY (default: false)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            ship_interval: env_positive_duration_secs("SHIP_INTERVAL_SECS")?
                .unwrap_or(defaults.ship_interval),
            compaction_interval: env_positive_duration_secs("COMPACTION_INTERVAL_SECS")?
                .unwrap_or(defaults.compaction_interval),
            block_duration: env_positive_duration_secs("BLOCK_DURATION_SECS")?
                .unwrap_or(defaults.block_duration),
            idle_timeout: env_duration_secs("IDLE_TIMEOUT_SECS")?.filter(|d| !d.is_zero()),
            close_idle_interval: env_positive_duration_secs("CLOSE_IDLE_INTERVAL_SECS")?
                .unwrap_or(defaults.close_idle_interval),
            head_compaction_idle_timeout: env_duration_secs("HEAD_COMPACTION_IDLE_TIMEOUT_SECS")?
                .filter(|d| !d.is_zero()),
            deletion_mark_check_interval: env_duration_secs("DELETION_MARK_CHECK_INTERVAL_SECS")?
                .unwrap_or(defaults.deletion_mark_check_interval),
            head_only: env_bool("HEAD_ONLY")?.unwrap_or(defaults.head_only),
        })
    }

    /// Block duration in milliseconds, the unit of sample timestamps.
    pub fn block_duration_ms(&self) -> i64 {
        self.block_duration.as_millis() as i64
    }
}

/// Object storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
    },
    Filesystem {
        root: PathBuf,
    },
}

/// Object storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Local directory holding one TSDB directory per tenant
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("/var/lib/tenantstore/tsdb"),
        }
    }
}

impl StorageConfig {
    /// Environment variables:
    /// - STORAGE_BACKEND: "memory" (default), "s3" or "filesystem"
    /// - S3_BUCKET: S3 bucket name (required for s3)
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - STORAGE_ROOT: bucket root directory (required for filesystem)
    /// - TSDB_DATA_DIR: local tenant TSDB directory
    pub fn from_env() -> Result<Self> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "memory".to_string());
        let backend = match backend.trim().to_ascii_lowercase().as_str() {
            "memory" => StorageBackend::Memory,
            "s3" => StorageBackend::S3 {
                bucket: std::env::var("S3_BUCKET").map_err(|_| {
                    Error::Config("S3_BUCKET required when STORAGE_BACKEND=s3".to_string())
                })?,
                region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                endpoint: std::env::var("S3_ENDPOINT").ok(),
            },
            "filesystem" | "fs" => StorageBackend::Filesystem {
                root: std::env::var("STORAGE_ROOT").map(PathBuf::from).map_err(|_| {
                    Error::Config(
                        "STORAGE_ROOT required when STORAGE_BACKEND=filesystem".to_string(),
                    )
                })?,
            },
            other => {
                return Err(Error::Config(format!(
                    "Unknown STORAGE_BACKEND: {}. Use 'memory', 's3' or 'filesystem'",
                    other
                )))
            }
        };
        let data_dir = std::env::var("TSDB_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default().data_dir);
        Ok(Self { backend, data_dir })
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the object store the tenant buckets are carved from.
    ///
    /// S3 credentials come from AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY when
    /// set, otherwise from the ambient IAM role.
    pub fn create_object_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
        match &config.backend {
            StorageBackend::Memory => {
                info!("Using in-memory object store (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            StorageBackend::S3 {
                bucket,
                region,
                endpoint,
            } => {
                info!("Using S3 object store: bucket={}, region={}", bucket, region);

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(region);

                // Custom endpoints (MinIO, LocalStack)
                if let Some(endpoint) = endpoint {
                    info!("Using custom S3 endpoint: {}", endpoint);
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                    builder = builder.with_access_key_id(&key);
                }
                if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                    builder = builder.with_secret_access_key(&secret);
                }

                Ok(Arc::new(builder.build()?))
            }
            StorageBackend::Filesystem { root } => {
                info!("Using filesystem object store at {}", root.display());
                std::fs::create_dir_all(root)?;
                Ok(Arc::new(LocalFileSystem::new_with_prefix(root)?))
            }
        }
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{raw}'"
        ))),
    }
}

fn env_duration_secs(name: &str) -> Result<Option<Duration>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|secs| Some(Duration::from_secs(secs)))
        .map_err(|e| Error::Config(format!("{name} must be a number of seconds: {e}")))
}

/// Like [`env_duration_secs`], rejecting zero. Used for intervals and ranges.
fn env_positive_duration_secs(name: &str) -> Result<Option<Duration>> {
    match env_duration_secs(name)? {
        Some(d) if d.is_zero() => Err(Error::Config(format!(
            "{name} must be greater than zero"
        ))),
        other => Ok(other),
    }
}
