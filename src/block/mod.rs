//! On-disk block layout and `meta.json` metadata.
//!
//! A block is a directory named by its ULID containing `meta.json`, an `index`
//! file and a `chunks/` directory of segment files. The metadata format is the
//! Prometheus TSDB one, plus an optional `thanos` section that only ever lives
//! in the remote copy of the metadata.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use ulid::Ulid;

pub const META_FILENAME: &str = "meta.json";
pub const INDEX_FILENAME: &str = "index";
pub const CHUNKS_DIRNAME: &str = "chunks";

/// Current `meta.json` format version.
pub const META_VERSION_1: u32 = 1;

/// Compaction hint set on blocks produced from out-of-order samples.
pub const OUT_OF_ORDER_HINT: &str = "from-out-of-order";

/// Block metadata as stored in `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub ulid: Ulid,
    /// Inclusive lower bound in milliseconds.
    pub min_time: i64,
    /// Exclusive upper bound in milliseconds.
    pub max_time: i64,
    #[serde(default)]
    pub stats: BlockStats,
    pub compaction: BlockCompaction,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thanos: Option<ThanosMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    #[serde(default)]
    pub num_samples: u64,
    #[serde(default)]
    pub num_series: u64,
    #[serde(default)]
    pub num_chunks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCompaction {
    pub level: u32,
    #[serde(default)]
    pub sources: Vec<Ulid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

/// Extra metadata attached to blocks when they are uploaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThanosMeta {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub downsample: Downsample,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segment_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downsample {
    pub resolution: i64,
}

impl BlockMeta {
    /// A fresh level-1 block covering `[min_time, max_time)`.
    pub fn new(ulid: Ulid, min_time: i64, max_time: i64, stats: BlockStats) -> Self {
        Self {
            ulid,
            min_time,
            max_time,
            stats,
            compaction: BlockCompaction {
                level: 1,
                sources: vec![ulid],
                hints: Vec::new(),
            },
            version: META_VERSION_1,
            thanos: None,
        }
    }

    /// Whether the block was produced by compacting out-of-order samples.
    pub fn from_out_of_order(&self) -> bool {
        self.compaction.hints.iter().any(|h| h == OUT_OF_ORDER_HINT)
    }

    /// Read `meta.json` from a block directory.
    pub fn read_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(META_FILENAME);
        let bytes = fs::read(&path).map_err(|e| Error::BlockMeta {
            dir: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        let meta: BlockMeta = serde_json::from_slice(&bytes).map_err(|e| Error::BlockMeta {
            dir: dir.to_path_buf(),
            reason: format!("parse {}: {}", META_FILENAME, e),
        })?;
        if meta.version != META_VERSION_1 {
            return Err(Error::BlockMeta {
                dir: dir.to_path_buf(),
                reason: format!("unexpected meta file version {}", meta.version),
            });
        }
        Ok(meta)
    }

    /// Write `meta.json` into a block directory.
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        crate::fsutil::write_json_atomic(&dir.join(META_FILENAME), self)
    }
}

/// Returns the block ID when `name` is a valid block directory name.
pub fn is_block_dir(name: &str) -> Option<Ulid> {
    Ulid::from_string(name).ok()
}

/// Path of a block's directory under `root`.
pub fn block_dir(root: &Path, id: Ulid) -> PathBuf {
    root.join(id.to_string())
}

/// Sorted file names found in the block's `chunks/` directory.
///
/// An unreadable directory yields an empty list; the upload itself will fail
/// later on if the block really is incomplete.
pub fn segment_files(block_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(block_dir.join(CHUNKS_DIRNAME)) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}
