//! In-memory reference storage engine.
//!
//! Keeps the head as a map of series to samples. When opened on a directory
//! it compacts the head into Prometheus-layout block directories (`meta.json`,
//! `index`, `chunks/000001`); opened head-only it truncates old samples
//! instead. Good enough for development and for exercising the lifecycle and
//! shipping code against real block directories.

use super::{SeriesLifecycleCallback, TenantStorage};
use crate::block::{self, BlockMeta, BlockStats, CHUNKS_DIRNAME, INDEX_FILENAME};
use crate::fsutil;
use crate::labels::Labels;
use crate::{Error, Result};

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Samples older than this relative to the newest one are dropped by a
/// head-only compaction.
const HEAD_ONLY_RETAIN: Duration = Duration::from_secs(10 * 60);

const TMP_BLOCK_SUFFIX: &str = ".tmp-for-creation";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct Sample {
    t: i64,
    v: f64,
}

enum Mode {
    HeadOnly,
    Blocks {
        dir: PathBuf,
        /// Head range that triggers a regular compaction, in ms
        block_range_ms: i64,
        retention: Option<Duration>,
    },
}

#[derive(Default)]
struct Head {
    series: HashMap<Labels, Vec<Sample>>,
}

impl Head {
    fn min_time(&self) -> i64 {
        self.series
            .values()
            .filter_map(|s| s.first())
            .map(|s| s.t)
            .min()
            .unwrap_or(i64::MAX)
    }

    fn max_time(&self) -> i64 {
        self.series
            .values()
            .filter_map(|s| s.last())
            .map(|s| s.t)
            .max()
            .unwrap_or(i64::MIN)
    }

    /// Samples in `[min_time, max_time]` per series, sorted by labels.
    fn copy_range(&self, min_time: i64, max_time: i64) -> Vec<(Labels, Vec<Sample>)> {
        let mut copied: Vec<(Labels, Vec<Sample>)> = self
            .series
            .iter()
            .filter_map(|(labels, samples)| {
                let inside: Vec<Sample> = samples
                    .iter()
                    .filter(|s| s.t >= min_time && s.t <= max_time)
                    .copied()
                    .collect();
                (!inside.is_empty()).then(|| (labels.clone(), inside))
            })
            .collect();
        copied.sort_by(|a, b| a.0.cmp(&b.0));
        copied
    }

    /// Drop samples in `[min_time, max_time]` and return the series left
    /// without samples, which are removed from the head.
    fn remove_range(&mut self, min_time: i64, max_time: i64) -> Vec<Labels> {
        let mut emptied = Vec::new();
        for (labels, samples) in self.series.iter_mut() {
            samples.retain(|s| s.t < min_time || s.t > max_time);
            if samples.is_empty() {
                emptied.push(labels.clone());
            }
        }
        for labels in &emptied {
            self.series.remove(labels);
        }
        emptied
    }
}

#[derive(Serialize)]
struct ChunkRecord<'a> {
    labels: &'a Labels,
    samples: &'a [Sample],
}

/// In-memory head with optional on-disk blocks.
pub struct MemoryStorage {
    mode: Mode,
    head: RwLock<Head>,
    blocks: RwLock<Vec<BlockMeta>>,
    callback: Option<Arc<dyn SeriesLifecycleCallback>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    /// A head that never writes blocks.
    pub fn head_only() -> Self {
        Self {
            mode: Mode::HeadOnly,
            head: RwLock::new(Head::default()),
            blocks: RwLock::new(Vec::new()),
            callback: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Open (or create) a block directory, loading any blocks already there.
    pub fn open(dir: impl Into<PathBuf>, block_range: Duration) -> Result<Self> {
        let block_range_ms = i64::try_from(block_range.as_millis()).unwrap_or(i64::MAX);
        if block_range_ms <= 0 {
            return Err(Error::Config(format!(
                "block range must be at least 1ms, got {:?}",
                block_range
            )));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let blocks = load_blocks(&dir)?;
        info!(dir = %dir.display(), blocks = blocks.len(), "Opened block storage");
        Ok(Self {
            mode: Mode::Blocks {
                dir,
                block_range_ms,
                retention: None,
            },
            head: RwLock::new(Head::default()),
            blocks: RwLock::new(blocks),
            callback: None,
            closed: AtomicBool::new(false),
        })
    }

    /// Blocks ending more than `retention` before the newest block become deletable.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        if let Mode::Blocks {
            retention: ref mut r,
            ..
        } = self.mode
        {
            *r = Some(retention);
        }
        self
    }

    pub fn with_series_callback(mut self, callback: Arc<dyn SeriesLifecycleCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Internal("storage is closed".to_string()));
        }
        Ok(())
    }

    fn notify_deleted(&self, deleted: &[Labels]) {
        if deleted.is_empty() {
            return;
        }
        if let Some(callback) = &self.callback {
            callback.post_deletion(deleted);
        }
    }

    fn write_block(&self, dir: &Path, series: &[(Labels, Vec<Sample>)]) -> Result<BlockMeta> {
        let num_samples: usize = series.iter().map(|(_, s)| s.len()).sum();
        let min_time = series
            .iter()
            .flat_map(|(_, s)| s.iter().map(|x| x.t))
            .min()
            .unwrap_or(0);
        let max_time = series
            .iter()
            .flat_map(|(_, s)| s.iter().map(|x| x.t))
            .max()
            .unwrap_or(0);

        let meta = BlockMeta::new(
            Ulid::new(),
            min_time,
            max_time + 1,
            BlockStats {
                num_samples: num_samples as u64,
                num_series: series.len() as u64,
                num_chunks: series.len() as u64,
            },
        );

        let final_dir = block::block_dir(dir, meta.ulid);
        let tmp_dir = dir.join(format!("{}{}", meta.ulid, TMP_BLOCK_SUFFIX));
        if let Err(e) = write_block_files(&tmp_dir, &meta, series) {
            if let Err(cleanup) = fs::remove_dir_all(&tmp_dir) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %tmp_dir.display(), error = %cleanup, "Failed to remove incomplete block directory");
                }
            }
            return Err(e);
        }

        fsutil::rename_file(&tmp_dir, &final_dir)?;
        debug!(block = %meta.ulid, min_time, max_time, num_samples, "Wrote block");
        Ok(meta)
    }

    fn truncate_head(&self, before: i64) {
        let emptied = self.head.write().remove_range(i64::MIN, before - 1);
        self.notify_deleted(&emptied);
    }
}

impl TenantStorage for MemoryStorage {
    fn append(&self, labels: &Labels, timestamp: i64, value: f64) -> Result<()> {
        self.ensure_open()?;
        let mut head = self.head.write();
        if !head.series.contains_key(labels) {
            if let Some(callback) = &self.callback {
                callback.pre_creation(labels)?;
            }
            head.series.insert(labels.clone(), Vec::new());
            if let Some(callback) = &self.callback {
                callback.post_creation(labels);
            }
        }
        let samples = head
            .series
            .get_mut(labels)
            .ok_or_else(|| Error::Internal("series vanished after insert".to_string()))?;
        let pos = samples.partition_point(|s| s.t <= timestamp);
        samples.insert(
            pos,
            Sample {
                t: timestamp,
                v: value,
            },
        );
        Ok(())
    }

    fn num_series(&self) -> u64 {
        self.head.read().series.len() as u64
    }

    fn min_time(&self) -> i64 {
        self.head.read().min_time()
    }

    fn max_time(&self) -> i64 {
        self.head.read().max_time()
    }

    fn compact(&self) -> Result<()> {
        self.ensure_open()?;
        match &self.mode {
            Mode::HeadOnly => {
                let max_time = self.max_time();
                if max_time == i64::MIN {
                    return Ok(());
                }
                self.truncate_head(max_time - HEAD_ONLY_RETAIN.as_millis() as i64);
                Ok(())
            }
            Mode::Blocks { block_range_ms, .. } => {
                let range = *block_range_ms;
                // Compact whole block ranges once the head spans 1.5 of them.
                loop {
                    let (min_time, max_time) = (self.min_time(), self.max_time());
                    if min_time > max_time || max_time - min_time <= range / 2 * 3 {
                        return Ok(());
                    }
                    let start = min_time.div_euclid(range) * range;
                    self.compact_range(min_time, start + range - 1)?;
                }
            }
        }
    }

    fn compact_range(&self, min_time: i64, max_time: i64) -> Result<()> {
        self.ensure_open()?;
        let Mode::Blocks { dir, .. } = &self.mode else {
            return Ok(());
        };

        let mut head = self.head.write();
        let series = head.copy_range(min_time, max_time);
        if series.is_empty() {
            return Ok(());
        }

        // Samples leave the head only once their block is on disk.
        let meta = self.write_block(dir, &series)?;
        let emptied = head.remove_range(min_time, max_time);
        drop(head);

        {
            let mut blocks = self.blocks.write();
            blocks.push(meta);
            blocks.sort_by_key(|b| b.min_time);
        }
        self.notify_deleted(&emptied);
        Ok(())
    }

    fn blocks(&self) -> Vec<BlockMeta> {
        self.blocks.read().clone()
    }

    fn deletable_blocks(&self, blocks: &[BlockMeta]) -> HashSet<Ulid> {
        let Mode::Blocks { retention, .. } = &self.mode else {
            return HashSet::new();
        };

        let mut deletable = HashSet::new();

        // Blocks already merged into a higher-level block.
        for parent in blocks {
            for source in &parent.compaction.sources {
                if *source != parent.ulid && blocks.iter().any(|b| b.ulid == *source) {
                    deletable.insert(*source);
                }
            }
        }

        if let Some(retention) = retention {
            let newest = blocks.iter().map(|b| b.max_time).max().unwrap_or(i64::MIN);
            let cutoff = newest.saturating_sub(retention.as_millis() as i64);
            for b in blocks {
                if b.max_time <= cutoff {
                    deletable.insert(b.ulid);
                }
            }
        }

        deletable
    }

    fn delete_blocks(&self, ids: &HashSet<Ulid>) -> Result<()> {
        let Mode::Blocks { dir, .. } = &self.mode else {
            return Ok(());
        };
        let mut blocks = self.blocks.write();
        for id in ids {
            let path = block::block_dir(dir, *id);
            match fs::remove_dir_all(&path) {
                Ok(()) => info!(block = %id, "Deleted local block"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            blocks.retain(|b| b.ulid != *id);
        }
        Ok(())
    }

    fn blocks_dir(&self) -> Option<&Path> {
        match &self.mode {
            Mode::HeadOnly => None,
            Mode::Blocks { dir, .. } => Some(dir),
        }
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn write_block_files(
    tmp_dir: &Path,
    meta: &BlockMeta,
    series: &[(Labels, Vec<Sample>)],
) -> Result<()> {
    fs::create_dir_all(tmp_dir.join(CHUNKS_DIRNAME))?;

    let mut chunks = fs::File::create(tmp_dir.join(CHUNKS_DIRNAME).join("000001"))?;
    for (labels, samples) in series {
        serde_json::to_writer(&mut chunks, &ChunkRecord { labels, samples })?;
        chunks.write_all(b"\n")?;
    }
    chunks.sync_all()?;

    let index: Vec<&Labels> = series.iter().map(|(l, _)| l).collect();
    fs::write(tmp_dir.join(INDEX_FILENAME), serde_json::to_vec(&index)?)?;
    meta.write_to_dir(tmp_dir)?;
    Ok(())
}

fn load_blocks(dir: &Path) -> Result<Vec<BlockMeta>> {
    let mut blocks = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.ends_with(TMP_BLOCK_SUFFIX) {
            warn!(dir = %entry.path().display(), "Removing incomplete block directory");
            fs::remove_dir_all(entry.path())?;
            continue;
        }
        if block::is_block_dir(name).is_none() || !entry.path().is_dir() {
            continue;
        }
        blocks.push(BlockMeta::read_from_dir(&entry.path())?);
    }
    blocks.sort_by_key(|b| b.min_time);
    Ok(blocks)
}
