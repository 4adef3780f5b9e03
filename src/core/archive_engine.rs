//! Archive engines copy a source tree into a backup destination.
//!
//! Two implementations exist:
//! - `rsync`: shells out to rsync and parses its `--stats` report
//! - `native-copy`: buffered in-process copy with hard-link reuse of
//!   unchanged files from a previous backup

mod native_copy;
mod rsync;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub use native_copy::NativeCopyEngine;
pub use rsync::{RsyncEngine, parse_rsync_stats};

/// Which archive engine performs the copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveEngineType {
    Rsync,
    NativeCopy,
}

/// One copy of `source` into `destination`.
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub job_id: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Previous backup to link unchanged files against (incremental backups)
    pub link_dest: Option<PathBuf>,
    pub compress: bool,
}

/// Counters recovered from a finished copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files_processed: u64,
    pub bytes_processed: u64,
}

#[async_trait]
pub trait ArchiveEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Copy the request's source into its destination. Errors when the
    /// underlying tool fails; the destination may be left partially written.
    async fn archive(&self, req: &ArchiveRequest) -> Result<ArchiveStats>;
}

pub fn create_engine(engine_type: ArchiveEngineType) -> Arc<dyn ArchiveEngine> {
    match engine_type {
        ArchiveEngineType::Rsync => Arc::new(RsyncEngine),
        ArchiveEngineType::NativeCopy => Arc::new(NativeCopyEngine::default()),
    }
}
