// =============================================================================
// Persistence helpers — atomic control files and JSONL side channels
// =============================================================================
//
// Control files (halt flag, readiness snapshot, tail pointer, config) are
// replaced atomically: write a sibling `.tmp`, fsync, rename over the target.
// Readers therefore only ever see the old or the new content.
// =============================================================================

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Sibling temporary path used for atomic replace (`foo.json` -> `foo.json.tmp`).
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("unnamed"));
    name.push(".tmp");
    path.with_file_name(name)
}

/// Create the parent directory of `path` if it has one.
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Serialise `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value).context("failed to serialise JSON")?;
    ensure_parent(path).with_context(|| format!("failed to create parent of {}", path.display()))?;

    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} over {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Read and parse a JSON control file. `Ok(None)` when the file is absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Append one compact JSON line to `path`, creating it if needed.
pub fn append_jsonl<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_string(value).context("failed to serialise JSONL row")?;
    line.push('\n');
    ensure_parent(path).with_context(|| format!("failed to create parent of {}", path.display()))?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {} for append", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}
