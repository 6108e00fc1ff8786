//! Bootstrap snapshot of the sync root
//!
//! A snapshot is a gzip-compressed tar of every regular file under the
//! root whose relative path is not ignored. These functions block; callers
//! on the runtime wrap them in `spawn_blocking`.
//!
//! Entry names here are plain `/`-joined strings rather than
//! [`RelativePath`](crate::types::RelativePath)s: a name that cannot travel
//! in a change header can still travel in a snapshot.

use std::fs;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::types::IgnoreList;

fn archive_err(context: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::Archive(format!("{}: {}", context, e))
}

/// `/`-joined name of `path` below `root`
fn entry_name(root: &Path, path: &Path) -> SyncResult<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|e| archive_err(&path.display().to_string(), e))?;
    let parts: Vec<_> = rel.iter().map(|c| c.to_string_lossy()).collect();
    Ok(parts.join("/"))
}

/// Build a compressed snapshot of `root`
pub fn build_snapshot(root: &Path, ignore: &IgnoreList) -> SyncResult<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::best());
    let mut builder = tar::Builder::new(encoder);
    let mut files = 0usize;

    append_dir(&mut builder, root, root, ignore, &mut files)?;

    let encoder = builder
        .into_inner()
        .map_err(|e| archive_err("failed to finish tar archive", e))?;
    let bytes = encoder
        .finish()
        .map_err(|e| archive_err("failed to finish gzip compression", e))?;

    debug!(root = %root.display(), files, len = bytes.len(), "Built snapshot");
    Ok(bytes)
}

fn append_dir<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    dir: &Path,
    ignore: &IgnoreList,
    files: &mut usize,
) -> SyncResult<()> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let rel = entry_name(root, &path)?;
        if ignore.matches(&rel) {
            continue;
        }

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            append_dir(builder, root, &path, ignore, files)?;
        } else if file_type.is_file() {
            builder
                .append_path_with_name(&path, &rel)
                .map_err(|e| archive_err(&format!("failed to add {}", rel), e))?;
            *files += 1;
        } else {
            debug!(path = %rel, "Skipping non-regular file");
        }
    }
    Ok(())
}

/// Unpack a snapshot into `dest`, creating it if absent
pub fn extract_snapshot(snapshot: &[u8], dest: &Path) -> SyncResult<()> {
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(snapshot));
    archive
        .unpack(dest)
        .map_err(|e| archive_err("failed to extract snapshot", e))
}

/// Remove everything under `root` except ignored entries.
///
/// Directories that still hold ignored entries are kept; a missing root is
/// not an error.
pub fn reset_root(root: &Path, ignore: &IgnoreList) -> SyncResult<()> {
    if !root.exists() {
        return Ok(());
    }
    clear_dir(root, root, ignore)?;
    Ok(())
}

/// Returns true if `dir` is empty afterwards
fn clear_dir(root: &Path, dir: &Path, ignore: &IgnoreList) -> SyncResult<bool> {
    let mut kept_any = false;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if ignore.matches(&entry_name(root, &path)?) {
            kept_any = true;
            continue;
        }

        if entry.file_type()?.is_dir() {
            if clear_dir(root, &path, ignore)? {
                fs::remove_dir(&path)?;
            } else {
                kept_any = true;
            }
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(!kept_any)
}
