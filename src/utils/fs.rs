//! File system utilities for leg working trees and staging directories.
//!
//! All helpers are idempotent where that makes sense (removing a missing directory
//! succeeds) and report failures as plain `io::Error`s so callers can attach leg context.

use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;

/// Creates all of the directories of the specified path, erasing it first if specified.
pub async fn create_dir_all(path: &Path, erase: bool) -> io::Result<()> {
    if erase {
        remove_dir_all(path).await?;
    }

    // create_dir_all is already idempotent - succeeds even if dir exists
    fs::create_dir_all(path).await
}

/// Removes the directory and its contents if it exists.
pub async fn remove_dir_all(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()), // Idempotent
        Err(e) => Err(e),
    }
}

/// Removes a single file if it exists.
pub async fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Makes a symbolic link to a directory.
#[cfg(unix)]
fn symlink_dir(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

/// Makes a symbolic link to a directory.
#[cfg(windows)]
fn symlink_dir(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(src, dst)
}

/// Makes a symbolic link to a file.
#[cfg(unix)]
fn symlink_file(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

/// Makes a symbolic link to a file.
#[cfg(windows)]
fn symlink_file(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(src, dst)
}

/// Copies a regular file from one path to another, creating any parent
/// directories of the destination path as necessary.
///
/// Fails if the source path is a directory or doesn't exist.
pub async fn copy_file(from: &Path, to: &Path) -> io::Result<u64> {
    let metadata = fs::metadata(from).await?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{from:?} is not a file"),
        ));
    }
    if let Some(dest_dir) = to.parent() {
        fs::create_dir_all(dest_dir).await?;
    }
    fs::copy(from, to).await
}

/// Recursively copies a directory from one path to another, creating any
/// parent directories of the destination path as necessary.
///
/// Preserves symlinks. Any entry whose path starts with one of `exclude` is skipped
/// together with its subtree, which keeps nested work roots and output directories
/// from being copied into themselves.
pub async fn copy_dir(from: &Path, to: &Path, exclude: &[PathBuf]) -> io::Result<()> {
    if !fs::metadata(from).await?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{from:?} is not a directory"),
        ));
    }

    let from = from.to_path_buf();
    let to = to.to_path_buf();
    let exclude = exclude.to_vec();

    tokio::task::spawn_blocking(move || copy_dir_blocking(&from, &to, &exclude))
        .await
        .map_err(|e| io::Error::other(format!("Directory copy task panicked: {}", e)))?
}

fn copy_dir_blocking(from: &Path, to: &Path, exclude: &[PathBuf]) -> io::Result<()> {
    std::fs::create_dir_all(to)?;

    let walker = walkdir::WalkDir::new(from)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !exclude.iter().any(|ex| entry.path().starts_with(ex)));

    for entry in walker {
        let entry = entry?;
        let rel_path = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let dest_path = to.join(rel_path);

        if entry.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            if entry.path().is_dir() {
                symlink_dir(&target, &dest_path)?;
            } else {
                symlink_file(&target, &dest_path)?;
            }
        } else if entry.file_type().is_dir() {
            std::fs::create_dir_all(dest_path)?;
        } else {
            std::fs::copy(entry.path(), dest_path)?;
        }
    }

    Ok(())
}
