//! Per-tenant TSDB lifecycle
//!
//! A [`TenantStore`] wraps one tenant's storage engine and decides what may
//! happen to it at any instant:
//! - Appends hold an [`AppendPermit`] and are only admitted while active
//! - Shipping runs in `active_shipping`, alongside appends
//! - Forced head compaction waits for in-flight appends and blocks new ones
//! - Idle tenants with everything compacted and shipped can be closed
//!
//! [`TenantManager`] drives these operations for every tenant of the process.

pub mod admission;
pub mod inflight;
pub mod manager;
pub mod shipped;
pub mod state;
mod telemetry;

pub use admission::SeriesAdmission;
pub use inflight::{AppendPermit, InFlightTracker};
pub use manager::TenantManager;
pub use shipped::ShippedBlocksCache;
pub use state::TenantState;

use crate::block::BlockMeta;
use crate::bucket::TENANT_DELETION_MARK_PATH;
use crate::clock::Clock;
use crate::error::StateConflict;
use crate::labels::Labels;
use crate::shipper::{ShippedBlocks, Shipper};
use crate::storage::TenantStorage;
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Outcome of an idle close check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCheckResult {
    /// Idle, compacted and shipped
    Idle,
    /// Blocks are not shipped, so local data is never released
    ShippingDisabled,
    NotIdle,
    /// The head still holds series
    NotCompacted,
    /// Some local block is not shipped yet
    NotShipped,
    CheckFailed,
    CloseFailed,
    /// The tenant left the active state while being checked
    NotActive,
    DataRemovalFailed,
    TenantMarkedForDeletion,
    /// Closed and removed
    IdleClosed,
}

impl CloseCheckResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseCheckResult::Idle => "idle",
            CloseCheckResult::ShippingDisabled => "shipping_disabled",
            CloseCheckResult::NotIdle => "not_idle",
            CloseCheckResult::NotCompacted => "not_compacted",
            CloseCheckResult::NotShipped => "not_shipped",
            CloseCheckResult::CheckFailed => "check_failed",
            CloseCheckResult::CloseFailed => "close_failed",
            CloseCheckResult::NotActive => "not_active",
            CloseCheckResult::DataRemovalFailed => "data_removal_failed",
            CloseCheckResult::TenantMarkedForDeletion => "tenant_marked_for_deletion",
            CloseCheckResult::IdleClosed => "idle_closed",
        }
    }

    pub fn should_close(&self) -> bool {
        matches!(
            self,
            CloseCheckResult::Idle | CloseCheckResult::TenantMarkedForDeletion
        )
    }
}

impl std::fmt::Display for CloseCheckResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tenant's storage plus its lifecycle state.
pub struct TenantStore {
    tenant_id: String,
    storage: Arc<dyn TenantStorage>,
    state: RwLock<TenantState>,
    in_flight: InFlightTracker,
    /// Unix seconds of the last successful append
    last_update_secs: AtomicI64,
    deletion_mark_found: AtomicBool,
    /// Unix seconds of the last deletion mark lookup
    last_deletion_mark_check_secs: AtomicI64,
    shipped: ShippedBlocksCache,
    /// `None` when shipping is disabled or the storage is head-only
    shipper: Option<Arc<Shipper>>,
    clock: Arc<dyn Clock>,
}

impl TenantStore {
    pub fn new(
        tenant_id: impl Into<String>,
        storage: Arc<dyn TenantStorage>,
        shipper: Option<Arc<Shipper>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shipper = shipper.filter(|_| storage.blocks_dir().is_some());
        let store = Self {
            tenant_id: tenant_id.into(),
            storage,
            state: RwLock::new(TenantState::Active),
            in_flight: InFlightTracker::new(),
            last_update_secs: AtomicI64::new(0),
            deletion_mark_found: AtomicBool::new(false),
            last_deletion_mark_check_secs: AtomicI64::new(0),
            shipped: ShippedBlocksCache::new(),
            shipper,
            clock,
        };
        store.set_last_update(store.clock.now());
        if let Err(e) = store.update_cached_shipped_blocks() {
            warn!(tenant = %store.tenant_id, error = %e, "Failed to load shipped blocks");
        }
        store
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn storage(&self) -> &Arc<dyn TenantStorage> {
        &self.storage
    }

    pub fn shipper(&self) -> Option<&Arc<Shipper>> {
        self.shipper.as_ref()
    }

    pub fn state(&self) -> TenantState {
        *self.state.read()
    }

    pub fn in_flight(&self) -> &InFlightTracker {
        &self.in_flight
    }

    /// Move from `from` to `to` if the state is currently `from`.
    pub fn cas_state(
        &self,
        from: TenantState,
        to: TenantState,
    ) -> std::result::Result<(), StateConflict> {
        let mut state = self.state.write();
        *state = TenantState::transition(*state, from, to)?;
        debug!(tenant = %self.tenant_id, from = %from, to = %to, "Tenant state changed");
        Ok(())
    }

    /// Admit one append. The returned permit must live until the append is done.
    pub fn acquire_append_permit(&self) -> Result<AppendPermit> {
        let state = self.state.read();
        if state.allows_pushes() {
            return Ok(self.in_flight.acquire());
        }
        match *state {
            TenantState::ForceCompacting => {
                telemetry::record_append_rejection("force_compacting");
                Err(Error::ForcedCompactionInProgress)
            }
            TenantState::Closing => {
                telemetry::record_append_rejection("closing");
                Err(Error::TenantClosing)
            }
            _ => {
                telemetry::record_append_rejection("not_active");
                Err(Error::TenantNotActive)
            }
        }
    }

    /// Append one sample under a permit.
    pub fn append(&self, labels: &Labels, timestamp: i64, value: f64) -> Result<()> {
        let _permit = self.acquire_append_permit()?;
        self.storage.append(labels, timestamp, value)?;
        self.set_last_update(self.clock.now());
        Ok(())
    }

    pub fn set_last_update(&self, at: DateTime<Utc>) {
        self.last_update_secs.store(at.timestamp(), Ordering::Release);
    }

    /// Last successful append, truncated to the second.
    pub fn last_update(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_update_secs.load(Ordering::Acquire), 0)
            .unwrap_or_default()
    }

    /// Whether the last update is more than `idle` before `now`.
    pub fn is_idle(&self, now: DateTime<Utc>, idle: Duration) -> bool {
        let last_ms = self.last_update_secs.load(Ordering::Acquire) * 1000;
        last_ms.saturating_add(idle.as_millis() as i64) < now.timestamp_millis()
    }

    /// Compact the whole head, splitting it on `block_duration_ms` boundaries.
    ///
    /// Appends are rejected for the duration. Waits for in-flight appends
    /// first, without a timeout. Does nothing for head-only storage.
    pub async fn compact_head(&self, block_duration_ms: i64) -> Result<()> {
        if self.storage.blocks_dir().is_none() {
            return Ok(());
        }
        if block_duration_ms <= 0 {
            return Err(Error::Config(format!(
                "block duration must be positive, got {}ms",
                block_duration_ms
            )));
        }

        self.cas_state(TenantState::Active, TenantState::ForceCompacting)
            .map_err(|c| Error::CompactionConflict(c.actual))?;
        let _restore = RestoreActive { store: self };

        self.in_flight.wait_drained().await;

        let result = self.compact_head_windows(block_duration_ms);
        telemetry::record_forced_compaction(result.is_ok());
        result
    }

    fn compact_head_windows(&self, block_duration_ms: i64) -> Result<()> {
        let bucket = |t: i64| t.div_euclid(block_duration_ms);

        let mut min_time = self.storage.min_time();
        let mut max_time = self.storage.max_time();
        if min_time > max_time {
            return Ok(());
        }

        while bucket(min_time) != bucket(max_time) {
            let boundary = (bucket(min_time) + 1) * block_duration_ms;
            self.storage.compact_range(min_time, boundary - 1)?;

            let next_min = self.storage.min_time();
            max_time = self.storage.max_time();
            if next_min > max_time {
                return Ok(());
            }
            if next_min <= min_time {
                return Err(Error::Internal(format!(
                    "head compaction made no progress at {}",
                    min_time
                )));
            }
            min_time = next_min;
        }

        self.storage.compact_range(min_time, max_time)
    }

    /// Regular compaction as decided by the storage engine.
    pub fn compact(&self) -> Result<()> {
        self.storage.compact()
    }

    /// Decide whether the tenant may be closed after `idle_timeout` without appends.
    pub fn should_close(&self, idle_timeout: Duration) -> CloseCheckResult {
        if self.deletion_mark_found.load(Ordering::Acquire) {
            return CloseCheckResult::TenantMarkedForDeletion;
        }

        if !self.is_idle(self.clock.now(), idle_timeout) {
            return CloseCheckResult::NotIdle;
        }

        if self.storage.blocks_dir().is_none() {
            return CloseCheckResult::Idle;
        }

        if self.storage.num_series() > 0 {
            return CloseCheckResult::NotCompacted;
        }

        let shipped = self.shipped.load();
        if self
            .storage
            .blocks()
            .iter()
            .any(|b| !shipped.contains_key(&b.ulid))
        {
            return CloseCheckResult::NotShipped;
        }

        CloseCheckResult::Idle
    }

    pub fn deletion_mark_found(&self) -> bool {
        self.deletion_mark_found.load(Ordering::Acquire)
    }

    pub fn set_deletion_mark_found(&self, found: bool) {
        self.deletion_mark_found.store(found, Ordering::Release);
    }

    /// Blocks that may be deleted locally: deletable according to the
    /// storage engine and, when shipping, already shipped.
    pub fn blocks_to_delete(&self, blocks: &[BlockMeta]) -> HashSet<Ulid> {
        if self.storage.blocks_dir().is_none() {
            return HashSet::new();
        }
        let deletable = self.storage.deletable_blocks(blocks);
        if self.shipper.is_none() {
            return deletable;
        }

        let shipped = self.shipped.load();
        deletable
            .into_iter()
            .filter(|id| shipped.contains_key(id))
            .collect()
    }

    /// Delete the local blocks selected by [`Self::blocks_to_delete`].
    pub fn delete_shipped_blocks(&self) -> Result<usize> {
        let ids = self.blocks_to_delete(&self.storage.blocks());
        if ids.is_empty() {
            return Ok(0);
        }
        self.storage.delete_blocks(&ids)?;
        telemetry::record_deleted_blocks(ids.len() as u64);
        Ok(ids.len())
    }

    /// Reload the shipped-block snapshot from the shipper's record.
    pub fn update_cached_shipped_blocks(&self) -> Result<()> {
        if self.shipper.is_none() {
            return Ok(());
        }
        let Some(dir) = self.storage.blocks_dir() else {
            return Ok(());
        };
        self.shipped.refresh(dir, self.clock.now())
    }

    pub fn cached_shipped_blocks(&self) -> Arc<ShippedBlocks> {
        self.shipped.load()
    }

    /// Creation time (ms) of the oldest local block not shipped yet, 0 if none.
    pub fn oldest_unshipped_block_time(&self) -> u64 {
        let shipped = self.shipped.load();
        self.storage
            .blocks()
            .iter()
            .filter(|b| !shipped.contains_key(&b.ulid))
            .map(|b| b.ulid.timestamp_ms())
            .min()
            .unwrap_or(0)
    }

    /// Run one shipping pass for this tenant.
    ///
    /// Skipped (returning 0) without a shipper, when the tenant is marked for
    /// deletion, or when it is not active. The deletion mark is looked up at
    /// most once per `deletion_mark_check_interval`.
    pub async fn ship_blocks(
        &self,
        cancel: &CancellationToken,
        deletion_mark_check_interval: Duration,
    ) -> Result<usize> {
        let Some(shipper) = &self.shipper else {
            return Ok(0);
        };
        if self.deletion_mark_found() {
            return Ok(0);
        }

        let now = self.clock.now().timestamp();
        let last_check = self.last_deletion_mark_check_secs.load(Ordering::Acquire);
        if now - last_check > deletion_mark_check_interval.as_secs() as i64 {
            // A failed lookup still counts as a check.
            self.last_deletion_mark_check_secs
                .store(now, Ordering::Release);
            match shipper.bucket().exists(TENANT_DELETION_MARK_PATH).await {
                Ok(true) => {
                    self.set_deletion_mark_found(true);
                    info!(tenant = %self.tenant_id, "Tenant deletion mark exists, not shipping blocks");
                    return Ok(0);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(tenant = %self.tenant_id, error = %e, "Failed to check tenant deletion mark");
                }
            }
        }

        if let Err(conflict) = self.cas_state(TenantState::Active, TenantState::ActiveShipping) {
            info!(tenant = %self.tenant_id, state = %conflict.actual, "Shipper skipped because the TSDB is not active");
            return Ok(0);
        }

        let result = shipper.sync(cancel).await;

        if let Err(conflict) = self.cas_state(TenantState::ActiveShipping, TenantState::Active) {
            warn!(tenant = %self.tenant_id, state = %conflict.actual, "Unexpected state after shipping");
        }

        match &result {
            Ok(uploaded) => {
                debug!(tenant = %self.tenant_id, uploaded, "Shipper synchronized blocks with storage")
            }
            Err(e) => {
                warn!(tenant = %self.tenant_id, error = %e, "Shipper failed to synchronize blocks with storage")
            }
        }

        if let Err(e) = self.update_cached_shipped_blocks() {
            warn!(tenant = %self.tenant_id, error = %e, "Failed to update cached shipped blocks after shipper synchronisation");
        }

        result
    }

    /// Close the storage engine.
    pub fn close(&self) -> Result<()> {
        self.storage.close()
    }
}

/// Puts a force-compacting tenant back to active when dropped.
struct RestoreActive<'a> {
    store: &'a TenantStore,
}

impl Drop for RestoreActive<'_> {
    fn drop(&mut self) {
        let mut state = self.store.state.write();
        if *state == TenantState::ForceCompacting {
            *state = TenantState::Active;
        }
    }
}
