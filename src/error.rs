//! Error types for the backup subsystem.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source path does not exist: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Model path not found for: {0}")]
    ModelNotFound(String),

    #[error("Model directory does not exist: {}", .0.display())]
    ModelDirectoryMissing(PathBuf),

    #[error("Archive failed: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Backup job {job_id} failed: {}", .errors.join("; "))]
    JobFailed { job_id: String, errors: Vec<String> },

    #[error("Backup job {job_id} timed out after {seconds} seconds")]
    Timeout { job_id: String, seconds: u64 },

    #[error("All {attempts} backup attempts failed: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Backup dependencies not met: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<figment::Error> for BackupError {
    fn from(err: figment::Error) -> Self {
        BackupError::Config(err.to_string())
    }
}

impl From<anyhow::Error> for BackupError {
    fn from(err: anyhow::Error) -> Self {
        BackupError::Archive(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
