//! Tenant manager
//!
//! Owns every [`TenantStore`] of the process and runs the periodic work on
//! them: shipping, compaction and closing idle tenants.

use super::{telemetry, CloseCheckResult, SeriesAdmission, TenantState, TenantStore};
use crate::bucket::{Bucket, ObjectStoreBucket};
use crate::clock::Clock;
use crate::config::{ComponentFactory, LifecycleConfig, ShipperConfig};
use crate::labels::Labels;
use crate::limits::{InstanceLimitsFn, SeriesLimiter};
use crate::shipper::Shipper;
use crate::storage::{MemoryStorage, TenantStorage};
use crate::{Config, Error, Result};

use dashmap::DashMap;
use object_store::ObjectStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Builds the bucket a tenant ships to.
pub type BucketFactory = Arc<dyn Fn(&str) -> Arc<dyn Bucket> + Send + Sync>;

/// All tenants of the process.
pub struct TenantManager {
    config: LifecycleConfig,
    shipper_config: ShipperConfig,
    data_dir: PathBuf,
    bucket_factory: BucketFactory,
    limiter: Option<Arc<dyn SeriesLimiter>>,
    instance_limits: Option<InstanceLimitsFn>,
    /// In-memory series across all tenants
    instance_series: Arc<AtomicI64>,
    clock: Arc<dyn Clock>,
    tenants: DashMap<String, Arc<TenantStore>>,
}

impl TenantManager {
    pub fn new(
        config: LifecycleConfig,
        shipper_config: ShipperConfig,
        data_dir: impl Into<PathBuf>,
        object_store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bucket_factory: BucketFactory = Arc::new(move |tenant_id: &str| {
            Arc::new(ObjectStoreBucket::for_tenant(object_store.clone(), tenant_id))
                as Arc<dyn Bucket>
        });
        Self {
            config,
            shipper_config,
            data_dir: data_dir.into(),
            bucket_factory,
            limiter: None,
            instance_limits: None,
            instance_series: Arc::new(AtomicI64::new(0)),
            clock,
            tenants: DashMap::new(),
        }
    }

    /// Build a manager from process configuration, creating the object store.
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let object_store = ComponentFactory::create_object_store(&config.storage)?;
        Ok(Self::new(
            config.lifecycle.clone(),
            config.shipper.clone(),
            &config.storage.data_dir,
            object_store,
            clock,
        ))
    }

    /// Ship to buckets built by `factory` instead of the object store.
    pub fn with_bucket_factory(mut self, factory: BucketFactory) -> Self {
        self.bucket_factory = factory;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn SeriesLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_instance_limits(mut self, limits: InstanceLimitsFn) -> Self {
        self.instance_limits = Some(limits);
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// In-memory series held by all tenants.
    pub fn instance_series(&self) -> i64 {
        self.instance_series.load(Ordering::Acquire)
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantStore>> {
        self.tenants.get(tenant_id).map(|t| t.clone())
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tenants.iter().map(|t| t.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Return the tenant's store, opening it on first use.
    pub fn get_or_create(&self, tenant_id: &str) -> Result<Arc<TenantStore>> {
        if let Some(store) = self.get(tenant_id) {
            return Ok(store);
        }
        let entry = self
            .tenants
            .entry(tenant_id.to_string())
            .or_try_insert_with(|| self.create_store(tenant_id).map(Arc::new))?;
        Ok(entry.clone())
    }

    fn create_store(&self, tenant_id: &str) -> Result<TenantStore> {
        if tenant_id.is_empty()
            || tenant_id.contains(['/', '\\'])
            || tenant_id == "."
            || tenant_id == ".."
        {
            return Err(Error::Config(format!("invalid tenant id '{}'", tenant_id)));
        }

        let admission = Arc::new(SeriesAdmission::new(
            tenant_id,
            self.limiter.clone(),
            self.instance_series.clone(),
            self.instance_limits.clone(),
        ));

        let (storage, shipper): (Arc<dyn TenantStorage>, Option<Arc<Shipper>>) =
            if self.config.head_only {
                (
                    Arc::new(MemoryStorage::head_only().with_series_callback(admission)),
                    None,
                )
            } else {
                let dir = self.data_dir.join(tenant_id);
                let storage = MemoryStorage::open(&dir, self.config.block_duration)?
                    .with_series_callback(admission);
                let shipper = self.shipper_config.enabled.then(|| {
                    Arc::new(Shipper::new(
                        &dir,
                        (self.bucket_factory)(tenant_id),
                        &self.shipper_config,
                        self.clock.clone(),
                    ))
                });
                (Arc::new(storage), shipper)
            };

        info!(tenant = tenant_id, head_only = self.config.head_only, shipping = shipper.is_some(), "Opened tenant TSDB");
        Ok(TenantStore::new(
            tenant_id,
            storage,
            shipper,
            self.clock.clone(),
        ))
    }

    /// Append one sample for a tenant, opening it if needed.
    pub fn append(&self, tenant_id: &str, labels: &Labels, timestamp: i64, value: f64) -> Result<()> {
        self.get_or_create(tenant_id)?
            .append(labels, timestamp, value)
    }

    /// Ship blocks of every tenant, one tenant at a time.
    pub async fn ship_all(&self, cancel: &CancellationToken) -> usize {
        let mut total = 0;
        for tenant_id in self.tenant_ids() {
            if cancel.is_cancelled() {
                break;
            }
            let Some(store) = self.get(&tenant_id) else {
                continue;
            };
            match store
                .ship_blocks(cancel, self.config.deletion_mark_check_interval)
                .await
            {
                Ok(shipped) => total += shipped,
                Err(Error::ShipFailures { shipped, .. }) => total += shipped,
                Err(_) => {}
            }
        }
        total
    }

    /// Compact every tenant, then delete local blocks that are safe to drop.
    ///
    /// With `force` the whole head is compacted. Otherwise tenants idle for
    /// longer than the head compaction idle timeout get a forced compaction
    /// and the rest a regular one.
    pub async fn compact_all(&self, force: bool) {
        let now = self.clock.now();
        for tenant_id in self.tenant_ids() {
            let Some(store) = self.get(&tenant_id) else {
                continue;
            };

            let idle = self
                .config
                .head_compaction_idle_timeout
                .is_some_and(|timeout| store.is_idle(now, timeout));

            let result = if force || idle {
                if idle {
                    info!(tenant = %tenant_id, "TSDB is idle, forcing head compaction");
                }
                store.compact_head(self.config.block_duration_ms()).await
            } else {
                store.compact()
            };
            match result {
                Ok(()) => {}
                Err(e @ Error::CompactionConflict(_)) => {
                    debug!(tenant = %tenant_id, error = %e, "Skipped head compaction")
                }
                Err(e) => {
                    error!(tenant = %tenant_id, error = %e, "TSDB blocks compaction for user has failed")
                }
            }

            match store.delete_shipped_blocks() {
                Ok(0) => {}
                Ok(n) => info!(tenant = %tenant_id, blocks = n, "Deleted shipped local blocks"),
                Err(e) => warn!(tenant = %tenant_id, error = %e, "Failed to delete local blocks"),
            }
        }
    }

    /// Close every tenant that has been idle for the configured timeout.
    ///
    /// Returns the outcome per tenant. Nothing happens when no idle timeout
    /// is configured.
    pub async fn close_idle_tenants(&self) -> Vec<(String, CloseCheckResult)> {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return Vec::new();
        };

        let mut results = Vec::new();
        for tenant_id in self.tenant_ids() {
            let result = self.close_tenant_if_idle(&tenant_id, idle_timeout).await;
            telemetry::record_close_check(result.as_str());
            if result == CloseCheckResult::IdleClosed {
                info!(tenant = %tenant_id, "Closed idle TSDB");
            } else {
                debug!(tenant = %tenant_id, result = %result, "TSDB not closed");
            }
            results.push((tenant_id, result));
        }
        results
    }

    async fn close_tenant_if_idle(
        &self,
        tenant_id: &str,
        idle_timeout: std::time::Duration,
    ) -> CloseCheckResult {
        let Some(store) = self.get(tenant_id) else {
            return CloseCheckResult::NotActive;
        };

        // Local data is only released once it lives in the bucket.
        let head_only = store.storage().blocks_dir().is_none();
        if !head_only && store.shipper().is_none() {
            return CloseCheckResult::ShippingDisabled;
        }

        let result = store.should_close(idle_timeout);
        if !result.should_close() {
            return result;
        }

        // Blocks appends, forced compactions and shipping from here on.
        if store
            .cas_state(TenantState::Active, TenantState::Closing)
            .is_err()
        {
            return CloseCheckResult::NotActive;
        }
        let revert = RevertClosing { store: &store };

        store.in_flight().wait_drained().await;

        // Things may have changed while waiting.
        let result = store.should_close(idle_timeout);
        if !result.should_close() {
            return result;
        }
        let tenant_deleted = result == CloseCheckResult::TenantMarkedForDeletion;

        // Normally empty, but a tenant being deleted may still hold series.
        let remaining = store.storage().num_series() as i64;

        if let Err(e) = store.close() {
            error!(tenant = %tenant_id, error = %e, "Failed to close idle TSDB");
            return CloseCheckResult::CloseFailed;
        }
        self.instance_series.fetch_sub(remaining, Ordering::AcqRel);

        if let Some(dir) = store.storage().blocks_dir() {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(tenant = %tenant_id, dir = %dir.display(), error = %e, "Failed to delete local TSDB");
                    return CloseCheckResult::DataRemovalFailed;
                }
            }
        }

        if let Err(conflict) = store.cas_state(TenantState::Closing, TenantState::Closed) {
            warn!(tenant = %tenant_id, state = %conflict.actual, "Unexpected state while closing TSDB");
        }
        drop(revert);
        self.tenants.remove(tenant_id);

        if tenant_deleted {
            info!(tenant = %tenant_id, "Deleted local TSDB of tenant marked for deletion");
        }
        CloseCheckResult::IdleClosed
    }

    /// Run the periodic loops until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ship = tokio::time::interval(self.config.ship_interval);
        let mut compact = tokio::time::interval(self.config.compaction_interval);
        let mut close_idle = tokio::time::interval(self.config.close_idle_interval);
        ship.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        compact.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        close_idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ship.tick() => {
                    let shipped = self.ship_all(&cancel).await;
                    if shipped > 0 {
                        info!(blocks = shipped, "Shipped blocks");
                    }
                }
                _ = compact.tick() => {
                    self.compact_all(false).await;
                }
                _ = close_idle.tick() => {
                    self.close_idle_tenants().await;
                }
                _ = cancel.cancelled() => {
                    info!("Tenant manager shutting down");
                    break;
                }
            }
        }
    }
}

/// Puts a closing tenant back to active unless it reached `closed`.
struct RevertClosing<'a> {
    store: &'a TenantStore,
}

impl Drop for RevertClosing<'_> {
    fn drop(&mut self) {
        let _ = self
            .store
            .cas_state(TenantState::Closing, TenantState::Active);
    }
}
