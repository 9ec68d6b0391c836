//! Tar helpers for volume backups and build contexts.
//!
//! Backups keep ownership, mode and mtime of every entry so a restored volume
//! is indistinguishable from the one that was saved.

use crate::{fsync_dir, StoreError};
use flate2::read::GzDecoder;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Pack the content of `src` (not `src` itself) into a tar file at `dest`.
///
/// Entries are written in sorted order. Symlinks are stored as links.
pub fn pack_dir(src: &Path, dest: &Path) -> Result<(), StoreError> {
    let mut entries = collect_entries(src, src)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let parent = dest
        .parent()
        .ok_or_else(|| StoreError::Archive(format!("{} has no parent", dest.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = NamedTempFile::new_in(parent)?;

    let mut ar = tar::Builder::new(tmp.as_file());
    ar.follow_symlinks(false);
    ar.mode(tar::HeaderMode::Complete);
    for (rel_path, full_path) in &entries {
        let ft = match full_path.symlink_metadata() {
            Ok(m) => m.file_type(),
            Err(e) => {
                warn!("skipping {rel_path}: metadata error: {e}");
                continue;
            }
        };
        if ft.is_file() || ft.is_dir() || ft.is_symlink() {
            ar.append_path_with_name(full_path, rel_path)?;
        } else {
            warn!("skipping unsupported file type: {rel_path}");
        }
    }
    ar.finish()?;
    drop(ar);

    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(parent)?;
    debug!("packed {} entries into {}", entries.len(), dest.display());
    Ok(())
}

/// Unpack a tar file produced by [`pack_dir`] into `target`.
pub fn unpack_into(archive: &Path, target: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(target)?;
    let file = fs::File::open(archive)?;
    let mut ar = tar::Archive::new(file);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(true);
    ar.set_preserve_ownerships(running_as_root());
    ar.set_unpack_xattrs(false);
    ar.unpack(target)?;
    Ok(())
}

/// Extract a gzip-compressed tarball into `target`.
pub fn extract_tar_gz(archive: &Path, target: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(target)?;
    let file = fs::File::open(archive)?;
    let mut ar = tar::Archive::new(GzDecoder::new(file));
    ar.set_preserve_permissions(true);
    ar.unpack(target)
        .map_err(|e| StoreError::Archive(format!("{}: {e}", archive.display())))?;
    Ok(())
}

/// Remove everything inside `dir`, keeping the directory itself.
pub fn clear_dir(dir: &Path) -> Result<(), StoreError> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.symlink_metadata()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// The single subdirectory of `dir`. Anything else is an error.
pub fn sole_directory(dir: &Path) -> Result<PathBuf, StoreError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    match dirs.len() {
        1 => Ok(dirs.remove(0)),
        n => Err(StoreError::Archive(format!(
            "expected exactly one top-level directory in {}, found {n}",
            dir.display()
        ))),
    }
}

fn running_as_root() -> bool {
    fs::metadata("/proc/self").is_ok_and(|m| m.uid() == 0)
}

fn collect_entries(root: &Path, current: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    let mut result = Vec::new();
    if !current.exists() {
        return Ok(result);
    }
    for entry in fs::read_dir(current)? {
        let full = entry?.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| StoreError::Archive(format!("path strip: {e}")))?
            .to_string_lossy()
            .to_string();
        if full.symlink_metadata()?.is_dir() {
            result.push((rel, full.clone()));
            result.extend(collect_entries(root, &full)?);
        } else {
            result.push((rel, full));
        }
    }
    Ok(result)
}
