//! Content-and-path digest over a directory tree.
//!
//! Directories and files are visited in file-name order. Every file
//! contributes a length-prefixed relative path followed by the BLAKE3 digest
//! of its content, so file boundaries are unambiguous and two trees holding
//! the same bytes under different names hash differently.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::Result;

/// Hex-encoded BLAKE3 digest of the tree under `root`.
///
/// Unreadable files are skipped with a warning; the digest is best effort.
pub fn directory_checksum(root: &Path) -> String {
    let mut hasher = blake3::Hasher::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Skipping unreadable entry in checksum");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let digest = match file_digest(path) {
            Ok(digest) => digest,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Could not read file for checksum");
                continue;
            }
        };

        let relative = path.strip_prefix(root).unwrap_or(path);
        let relative = relative.to_string_lossy();
        hasher.update(&(relative.len() as u64).to_le_bytes());
        hasher.update(relative.as_bytes());
        hasher.update(digest.as_bytes());
    }

    hasher.finalize().to_hex().to_string()
}

/// Run [`directory_checksum`] on the blocking pool.
pub async fn compute_checksum(root: PathBuf) -> Result<String> {
    Ok(tokio::task::spawn_blocking(move || directory_checksum(&root)).await?)
}

/// Total size in bytes of the regular files under `root`.
pub fn directory_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

fn file_digest(path: &Path) -> io::Result<blake3::Hash> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(128 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize())
}
