//! Storage engine capability
//!
//! A tenant's data lives in a [`TenantStorage`]: an appendable head plus,
//! optionally, immutable blocks on local disk. Engines that keep everything
//! in memory report no blocks directory and the lifecycle code treats them as
//! head-only (nothing to ship, nothing to delete).

pub mod memory;

pub use memory::MemoryStorage;

use crate::block::BlockMeta;
use crate::labels::Labels;
use crate::Result;
use std::collections::HashSet;
use std::path::Path;
use ulid::Ulid;

/// Hooks the storage engine calls around series creation and deletion.
pub trait SeriesLifecycleCallback: Send + Sync {
    /// Called before a new series is created. An error rejects the write.
    fn pre_creation(&self, metric: &Labels) -> Result<()>;

    /// Called after a series was created.
    fn post_creation(&self, metric: &Labels);

    /// Called after a batch of series was removed from the head.
    fn post_deletion(&self, metrics: &[Labels]);
}

/// The operations the tenant lifecycle needs from a storage engine.
pub trait TenantStorage: Send + Sync {
    /// Append one sample to the head.
    fn append(&self, labels: &Labels, timestamp: i64, value: f64) -> Result<()>;

    /// Number of series currently held in the head.
    fn num_series(&self) -> u64;

    /// Lowest sample timestamp in the head, `i64::MAX` when empty.
    fn min_time(&self) -> i64;

    /// Highest sample timestamp in the head, `i64::MIN` when empty.
    fn max_time(&self) -> i64;

    /// Regular compaction: whatever the engine does on its periodic tick.
    fn compact(&self) -> Result<()>;

    /// Compact the head samples in `[min_time, max_time]` (both inclusive)
    /// into a block. A no-op for head-only engines.
    fn compact_range(&self, min_time: i64, max_time: i64) -> Result<()>;

    /// Metadata of the local blocks. Empty for head-only engines.
    fn blocks(&self) -> Vec<BlockMeta>;

    /// The engine's own decision on which of `blocks` may be deleted.
    fn deletable_blocks(&self, blocks: &[BlockMeta]) -> HashSet<Ulid>;

    /// Delete local blocks.
    fn delete_blocks(&self, ids: &HashSet<Ulid>) -> Result<()>;

    /// Directory holding the blocks, `None` for head-only engines.
    fn blocks_dir(&self) -> Option<&Path>;

    fn close(&self) -> Result<()>;
}
