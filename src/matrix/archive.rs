//! Per-leg `.tar.gz` bundles of staged artifacts.

use flate2::{Compression, write::GzEncoder};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Packs every regular file in `staged_dir` into `archive_path`.
///
/// Entries are stored under a top-level directory named after the leg so that
/// unpacking several bundles side by side never collides.
pub async fn bundle_directory(staged_dir: &Path, archive_path: &Path, root_name: &str) -> io::Result<PathBuf> {
    let staged_dir = staged_dir.to_path_buf();
    let archive_path = archive_path.to_path_buf();
    let root_name = root_name.to_string();

    tokio::task::spawn_blocking(move || {
        if let Some(parent) = archive_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&staged_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.path())
            .collect();
        // Deterministic member order
        files.sort();

        let file = File::create(&archive_path)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for path in &files {
            let Some(name) = path.file_name() else {
                continue;
            };
            builder.append_path_with_name(path, Path::new(&root_name).join(name))?;
        }
        builder.into_inner()?.finish()?;

        Ok(archive_path)
    })
    .await
    .map_err(|e| io::Error::other(format!("Archive task panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[tokio::test]
    async fn bundle_contains_staged_files_under_leg_root() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("ubuntu-latest");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join("pkg-1.0-cp39-abi3-linux_x86_64.whl"), "wheel").unwrap();
        std::fs::write(staged.join("SHA256SUMS"), "sums").unwrap();

        let archive = bundle_directory(&staged, &dir.path().join("ubuntu-latest.tar.gz"), "ubuntu-latest")
            .await
            .unwrap();

        let mut reader = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
        let mut names: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "ubuntu-latest/SHA256SUMS",
                "ubuntu-latest/pkg-1.0-cp39-abi3-linux_x86_64.whl"
            ]
        );
    }
}
