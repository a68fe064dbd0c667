use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Hex SHA-256 of everything `reader` yields, read in fixed-size chunks.
pub fn sha256_reader(mut reader: impl Read) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let (digest, _) =
        sha256_reader(file).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(digest)
}

/// Create a temp file next to `path` so the final rename stays on one filesystem.
pub fn staging_file_for(path: &Path) -> Result<NamedTempFile> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create staging file in {}", parent.display()))
}

/// Flush, fsync and rename `staged` over `path`.
pub fn persist_staged(staged: NamedTempFile, path: &Path) -> Result<()> {
    staged
        .as_file()
        .sync_all()
        .with_context(|| format!("failed to sync staging file for {}", path.display()))?;
    staged
        .persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move staging file over {}", path.display()))?;
    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

/// Write and fsync `bytes` into a staging file for `path`. Only the rename is left.
pub fn stage_bytes(path: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let mut staged = staging_file_for(path)?;
    staged
        .write_all(bytes)
        .with_context(|| format!("failed to write staging file for {}", path.display()))?;
    staged
        .as_file()
        .sync_all()
        .with_context(|| format!("failed to sync staging file for {}", path.display()))?;
    Ok(staged)
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    persist_staged(stage_bytes(path, bytes)?, path)
}

pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    write_atomic(path, format!("{data}\n").as_bytes())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
