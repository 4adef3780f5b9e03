//! Model-aware backups on top of [`BackupManager`].
//!
//! Adds a dependency preflight at construction, name-to-directory model
//! resolution, whole-job retry, a reduced test-mode subset and a
//! compensating-action scope around each model backup.

use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::core::archive_engine::{ArchiveEngine, create_engine};
use crate::core::checksum::directory_size;
use crate::core::manager::BackupManager;
use crate::core::models::{
    BackupJob, BackupSchedule, BackupType, EnhancedBackupResult, JobStatus, random_suffix,
};
use crate::core::preflight;
use crate::core::transaction::{self, RollbackActions};
use crate::error::{BackupError, Result};
use crate::logging::LogThrottle;

/// Files copied into a test-mode subset, when present.
const TEST_SUBSET_FILES: [&str; 3] = ["config.json", "tokenizer.json", "tokenizer_config.json"];
const MAX_TEST_SUBSET_FILES: usize = 5;

/// Minimum spacing of "still waiting" messages while polling a job.
const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub struct EnhancedBackupManager {
    base: BackupManager,
}

impl EnhancedBackupManager {
    /// Fails with [`BackupError::MissingDependencies`] when a required tool
    /// is not on `PATH`.
    pub fn new(ctx: AppContext) -> Result<Self> {
        let engine = create_engine(ctx.settings.backup.engine);
        Self::with_engine(ctx, engine)
    }

    pub fn with_engine(ctx: AppContext, engine: Arc<dyn ArchiveEngine>) -> Result<Self> {
        if let Err(e) = preflight::ensure_dependencies(&ctx.settings.backup.required_tools) {
            error!(error = %e, "Dependency validation failed");
            return Err(e);
        }

        Ok(Self {
            base: BackupManager::with_engine(ctx, engine),
        })
    }

    pub fn base(&self) -> &BackupManager {
        &self.base
    }

    /// Map a short name or model key to its directory under `models_active`.
    pub fn resolve_model_path(&self, model_name: &str) -> Result<PathBuf> {
        let settings = self.base.settings();
        let directory = settings
            .models
            .directory_for(model_name)
            .ok_or_else(|| BackupError::ModelNotFound(model_name.to_string()))?;

        let path = settings.paths.models_active.join(directory);
        if !path.is_dir() {
            return Err(BackupError::ModelDirectoryMissing(path));
        }

        Ok(path)
    }

    /// Back up one model. Always returns a result; failures are reported
    /// with `success == false`.
    pub async fn create_model_backup(
        &self,
        model_name: &str,
        schedule: BackupSchedule,
        test_mode: bool,
    ) -> EnhancedBackupResult {
        let start = Instant::now();
        let mut attempts = 0u32;
        let attempts_ref = &mut attempts;

        let transaction_name = format!("backup_{}_{}", model_name, schedule);
        let outcome = transaction::scope(&transaction_name, move |rollback| async move {
            let model_path = self.resolve_model_path(model_name)?;

            let source = if test_mode {
                self.create_test_subset(&model_path, &rollback)?
            } else {
                model_path
            };

            let job = self
                .create_backup_with_retry(model_name, &source, schedule.backup_type(), attempts_ref)
                .await?;

            let ratio = if self.base.settings().backup.compress_backups {
                compression_ratio(&source, &job.destination_path).await
            } else {
                None
            };

            Ok((job, ratio))
        })
        .await;

        let duration_seconds = start.elapsed().as_secs_f64();

        match outcome {
            Ok((job, compression_ratio)) => EnhancedBackupResult {
                success: true,
                message: format!("Backup completed for {}", model_name),
                backup_type: schedule.to_string(),
                model_name: Some(model_name.to_string()),
                backup_path: Some(job.destination_path),
                duration_seconds,
                files_processed: job.files_processed,
                bytes_processed: job.bytes_processed,
                compression_ratio,
                errors: job.errors,
                attempts,
            },
            Err(e) => {
                error!(model = model_name, error = %e, "Model backup failed");
                EnhancedBackupResult {
                    success: false,
                    message: format!("Backup failed for {}: {}", model_name, e),
                    backup_type: schedule.to_string(),
                    model_name: Some(model_name.to_string()),
                    backup_path: None,
                    duration_seconds,
                    files_processed: 0,
                    bytes_processed: 0,
                    compression_ratio: None,
                    errors: vec![e.to_string()],
                    attempts,
                }
            }
        }
    }

    /// Each attempt is a brand-new job with its own destination. `attempts`
    /// tracks how many jobs were created.
    async fn create_backup_with_retry(
        &self,
        model_name: &str,
        source: &Path,
        backup_type: BackupType,
        attempts: &mut u32,
    ) -> Result<BackupJob> {
        let backup = &self.base.settings().backup;
        let max_attempts = backup.max_retry_attempts.max(1);
        let timeout = backup.completion_timeout();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            *attempts = attempt;
            info!(model = model_name, attempt, max_attempts, "Backup attempt");

            let job = self.base.create_backup(source, backup_type).await;

            match self.wait_for_completion(&job.job_id, timeout).await {
                Ok(done) => {
                    info!(model = model_name, attempt, job_id = %done.job_id, "Backup successful");
                    return Ok(done);
                }
                Err(e) => {
                    warn!(model = model_name, attempt, error = %e, "Backup attempt failed");
                    last_error = e.to_string();

                    if attempt < max_attempts {
                        info!(delay_secs = backup.retry_delay_seconds, "Retrying backup");
                        tokio::time::sleep(backup.retry_delay()).await;
                    }
                }
            }
        }

        Err(BackupError::RetriesExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Poll the ledger until the job is terminal or `timeout` passes.
    ///
    /// A timed-out job's worker keeps running in the background.
    pub async fn wait_for_completion(&self, job_id: &str, timeout: Duration) -> Result<BackupJob> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll_interval = self.base.settings().backup.poll_interval();
        let throttle = LogThrottle::new(WAIT_LOG_INTERVAL);

        loop {
            let job = self
                .base
                .job(job_id)
                .await
                .ok_or_else(|| BackupError::UnknownJob(job_id.to_string()))?;

            match job.status {
                JobStatus::Completed => return Ok(job),
                JobStatus::Failed => {
                    return Err(BackupError::JobFailed {
                        job_id: job.job_id,
                        errors: job.errors,
                    });
                }
                JobStatus::Pending | JobStatus::Running => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(BackupError::Timeout {
                    job_id: job_id.to_string(),
                    seconds: timeout.as_secs(),
                });
            }

            if throttle.should_log() {
                debug!(job_id, status = %job.status, "Waiting for backup job");
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Copy the small allow-listed files of a model into a scratch directory
    /// and register its removal as a rollback action.
    fn create_test_subset(&self, model_path: &Path, rollback: &RollbackActions) -> Result<PathBuf> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let test_dir = self
            .base
            .settings()
            .paths
            .models_staging
            .join(format!("test_backup_{}_{}", timestamp, random_suffix()));

        fs::create_dir_all(&test_dir)?;

        let cleanup_dir = test_dir.clone();
        rollback.register(format!("remove {}", test_dir.display()), move || {
            if cleanup_dir.exists() {
                fs::remove_dir_all(&cleanup_dir)
                    .with_context(|| format!("Failed to clean up {}", cleanup_dir.display()))?;
                info!(path = %cleanup_dir.display(), "Cleaned up test subset");
            }
            Ok(())
        });

        let mut copied = 0;
        for name in TEST_SUBSET_FILES {
            if copied >= MAX_TEST_SUBSET_FILES {
                break;
            }
            let src = model_path.join(name);
            if src.is_file() {
                fs::copy(&src, test_dir.join(name))?;
                copied += 1;
            }
        }

        info!(files = copied, path = %test_dir.display(), "Created test subset");
        Ok(test_dir)
    }
}

/// Backup size over source size, `None` when either is unavailable or the
/// source is empty.
pub async fn compression_ratio(source: &Path, backup: &Path) -> Option<f64> {
    if !backup.exists() {
        return None;
    }

    let source = source.to_path_buf();
    let backup = backup.to_path_buf();
    let sizes =
        tokio::task::spawn_blocking(move || (directory_size(&source), directory_size(&backup)))
            .await;

    match sizes {
        Ok((source_size, backup_size)) if source_size > 0 => {
            Some(backup_size as f64 / source_size as f64)
        }
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "Could not calculate compression ratio");
            None
        }
    }
}
