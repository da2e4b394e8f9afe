//! # tenantstore
//!
//! Per-tenant TSDB lifecycle management and block shipping to object storage.
//!
//! Every tenant of a metrics ingester owns an appendable head that compacts
//! into immutable blocks. Those blocks have to reach object storage before
//! the local copy can be dropped, while appends, compaction and shipping all
//! run concurrently.
//!
//! ## Components
//!
//! - **Shipper** ([`shipper`]): uploads finished blocks oldest first and
//!   records what was shipped in a crash-safe file next to the blocks
//! - **Tenant lifecycle** ([`tenant`]): state machine gating appends,
//!   shipping, forced compaction and idle close
//! - **Series admission** ([`tenant::admission`]): quota checks run by the
//!   storage engine before it creates a series
//! - **Storage** ([`storage`]): the engine capability the lifecycle drives,
//!   with an in-memory reference engine

pub mod block;
pub mod bucket;
pub mod clock;
pub mod config;
pub mod fsutil;
pub mod labels;
pub mod limits;
pub mod shipper;
pub mod storage;
pub mod telemetry;
pub mod tenant;

mod error;

pub use error::{Error, Result, StateConflict};

use config::{LifecycleConfig, ShipperConfig, StorageConfig};

/// Configuration for a tenantstore process
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Object storage and local data directory
    pub storage: StorageConfig,
    /// Block shipping
    pub shipper: ShipperConfig,
    /// Compaction, shipping and idle close schedule
    pub lifecycle: LifecycleConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            storage: StorageConfig::from_env()?,
            shipper: ShipperConfig::from_env()?,
            lifecycle: LifecycleConfig::from_env()?,
        })
    }
}

/// Re-exports for convenience
pub mod prelude {
    pub use crate::block::BlockMeta;
    pub use crate::bucket::{Bucket, ObjectStoreBucket};
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::{ComponentFactory, LifecycleConfig, ShipperConfig, StorageConfig};
    pub use crate::labels::Labels;
    pub use crate::shipper::Shipper;
    pub use crate::storage::{MemoryStorage, TenantStorage};
    pub use crate::tenant::{CloseCheckResult, TenantManager, TenantState, TenantStore};
    pub use crate::{Config, Error, Result};
}
