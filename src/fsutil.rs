//! Crash-safe file writes.

use crate::Result;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Serialize `value` as indented JSON and atomically replace `path` with it.
///
/// The data is written to `<path>.tmp`, fsynced, renamed over `path`, and the
/// parent directory is fsynced so the rename survives a crash.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_vec_pretty(value)?;
    buf.push(b'\n');

    let tmp = tmp_path(path);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }

    rename_file(&tmp, path)
}

/// Rename `from` over `to` and fsync the parent directory of `to`.
pub fn rename_file(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to)?;
    if let Some(parent) = to.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Fsync a directory. Platforms that cannot open directories are a no-op.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        match handle.sync_all() {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::Unsupported) => {}
            Err(e) => return Err(e.into()),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}
