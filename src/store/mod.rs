//! Durable backup metadata.
//!
//! A single JSON document, `{ "jobs": [...], "created": <iso8601> }`, holding
//! every completed or failed job. Writers take an exclusive lock on a sidecar
//! `.lock` file and replace the document through a temp file + rename, so
//! the file stays valid JSON after every write.

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::core::models::{BackupJob, timestamp};
use crate::error::{BackupError, Result};

pub mod jobs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataDocument {
    #[serde(default)]
    pub jobs: Vec<BackupJob>,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub created: DateTime<Utc>,
}

impl Default for MetadataDocument {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            created: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        with_suffix(&self.path, "lock")
    }

    /// Read the document. A missing file yields an empty document.
    pub async fn load(&self) -> Result<MetadataDocument> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_document(&path)).await?
    }

    /// Read-modify-write under the exclusive lock.
    pub(crate) async fn modify<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut MetadataDocument) + Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path();

        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            let lock_file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;

            // Released when `lock_file` is dropped
            lock_file.lock_exclusive()?;

            // Only an unparseable document is set aside; I/O errors leave it alone
            let mut document = match read_document(&path) {
                Ok(document) => document,
                Err(BackupError::Metadata(e)) => {
                    let quarantine = with_suffix(&path, &format!(
                        "corrupt-{}",
                        Utc::now().format("%Y%m%d%H%M%S")
                    ));
                    error!(
                        path = %path.display(),
                        quarantine = %quarantine.display(),
                        error = %e,
                        "Unreadable backup metadata, starting a new document"
                    );
                    fs::rename(&path, &quarantine)?;
                    MetadataDocument::default()
                }
                Err(e) => return Err(e),
            };

            f(&mut document);
            write_document(&path, &document)?;

            debug!(path = %path.display(), jobs = document.jobs.len(), "Backup metadata written");
            Ok(())
        })
        .await?
    }
}

fn read_document(path: &Path) -> Result<MetadataDocument> {
    if !path.exists() {
        return Ok(MetadataDocument::default());
    }

    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_document(path: &Path, document: &MetadataDocument) -> Result<()> {
    let temp_path = with_suffix(path, "tmp");

    {
        let mut temp_file = File::create(&temp_path)?;
        serde_json::to_writer_pretty(&mut temp_file, document)?;
        temp_file.write_all(b"\n")?;
        temp_file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
