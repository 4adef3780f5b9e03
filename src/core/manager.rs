//! Backup manager: job creation, background execution, verification and
//! retention cleanup.
//!
//! `create_backup` returns as soon as the job is in the ledger. The copy runs
//! on a tracked tokio task that owns the job from then on; callers observe
//! progress by polling [`BackupManager::job`].

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Settings;
use crate::context::AppContext;
use crate::core::archive_engine::{ArchiveEngine, ArchiveRequest, create_engine};
use crate::core::checksum::compute_checksum;
use crate::core::ledger::JobLedger;
use crate::core::models::{BackupJob, BackupStatus, BackupType, JobStatus, VerificationResult};
use crate::core::verifier;
use crate::error::{BackupError, Result};
use crate::store::{MetadataStore, jobs};

const SECONDS_PER_DAY: u64 = 86_400;

pub struct BackupManager {
    ctx: AppContext,
    engine: Arc<dyn ArchiveEngine>,
    ledger: JobLedger,
    tracker: TaskTracker,
}

impl BackupManager {
    /// Manager using the archive engine named in the settings.
    pub fn new(ctx: AppContext) -> Self {
        let engine = create_engine(ctx.settings.backup.engine);
        Self::with_engine(ctx, engine)
    }

    pub fn with_engine(ctx: AppContext, engine: Arc<dyn ArchiveEngine>) -> Self {
        info!(
            engine = engine.name(),
            backup_dir = %ctx.settings.paths.backup_models.display(),
            "Backup manager initialized"
        );

        Self {
            ctx,
            engine,
            ledger: JobLedger::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    /// Register a pending job and start its worker.
    ///
    /// Returns the pending snapshot without waiting for the copy. Problems
    /// with the source are reported through the job's status, not here.
    pub async fn create_backup(&self, source: &Path, backup_type: BackupType) -> BackupJob {
        let job = BackupJob::new(source, backup_type, &self.ctx.settings.paths.backup_models);

        info!(
            job_id = %job.job_id,
            source = %job.source_path.display(),
            destination = %job.destination_path.display(),
            backup_type = %backup_type,
            "Created backup job"
        );

        self.ledger.insert(job.clone()).await;

        let worker = Worker {
            settings: self.ctx.settings.clone(),
            store: self.ctx.store.clone(),
            engine: self.engine.clone(),
            ledger: self.ledger.clone(),
        };
        let span = info_span!("backup_job", job_id = %job.job_id);
        let job_id = job.job_id.clone();
        self.tracker.spawn(async move { worker.run(job_id).await }.instrument(span));

        job
    }

    /// Current snapshot of a job created by this manager.
    pub async fn job(&self, job_id: &str) -> Option<BackupJob> {
        self.ledger.get(job_id).await
    }

    /// Wait until every worker spawned so far has finished.
    pub async fn wait_for_workers(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Audit a backup directory. `None` uses the configured sample rate.
    pub async fn verify_backup(
        &self,
        backup_path: &Path,
        sample_rate: Option<f64>,
    ) -> VerificationResult {
        let rate = sample_rate.unwrap_or(self.ctx.settings.backup.verification_sample_rate);
        verifier::verify_backup(&self.ctx.store, backup_path, rate).await
    }

    /// Delete backup directories last modified at or before the retention
    /// cutoff. `None` uses the configured retention. Returns what was removed.
    pub async fn cleanup_old_backups(&self, retention_days: Option<u32>) -> Vec<PathBuf> {
        let days = retention_days.unwrap_or(self.ctx.settings.backup.retention_days);
        let backup_dir = self.ctx.settings.paths.backup_models.clone();

        info!(retention_days = days, backup_dir = %backup_dir.display(), "Cleaning up old backups");

        let removed = tokio::task::spawn_blocking(move || remove_expired(&backup_dir, days)).await;
        match removed {
            Ok(removed) => {
                info!(removed = removed.len(), "Backup cleanup finished");
                removed
            }
            Err(e) => {
                error!(error = %e, "Backup cleanup failed");
                Vec::new()
            }
        }
    }

    /// Counts and snapshots of every job in the ledger.
    pub async fn get_backup_status(&self) -> BackupStatus {
        self.ledger.status().await
    }
}

/// Newest backup directory of `source` under `backup_dir`, by modification
/// time. Only names of the form `<source name>_<type>_<timestamp>_<suffix>`
/// match, so `phi3` never picks up a backup of `phi3_extra`.
pub fn find_last_backup(backup_dir: &Path, source: &Path) -> Option<PathBuf> {
    let source_name = source.file_name()?.to_string_lossy().to_string();
    let pattern = Regex::new(&format!(
        r"^{}_(full|incremental)_\d{{8}}_\d{{6}}_[0-9a-f]{{8}}$",
        regex::escape(&source_name)
    ))
    .ok()?;

    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(backup_dir = %backup_dir.display(), error = %e, "No previous backups readable");
            return None;
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| pattern.is_match(&entry.file_name().to_string_lossy()))
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_dir() {
                return None;
            }
            Some((metadata.modified().ok()?, entry.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

fn remove_expired(backup_dir: &Path, retention_days: u32) -> Vec<PathBuf> {
    let mut removed = Vec::new();

    let retention = Duration::from_secs(u64::from(retention_days) * SECONDS_PER_DAY);
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(backup_dir = %backup_dir.display(), error = %e, "Nothing to clean up");
            return removed;
        }
    };

    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        let modified = match entry.metadata() {
            Ok(metadata) if metadata.is_dir() => metadata.modified(),
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot stat backup, skipping");
                continue;
            }
        };

        match modified {
            Ok(modified) if modified <= cutoff => match fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "Removed old backup");
                    removed.push(path);
                }
                Err(e) => error!(path = %path.display(), error = %e, "Failed to remove backup"),
            },
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot read backup mtime, skipping"),
        }
    }

    removed
}

/// Everything a background job needs, detached from the manager.
struct Worker {
    settings: Arc<Settings>,
    store: MetadataStore,
    engine: Arc<dyn ArchiveEngine>,
    ledger: JobLedger,
}

impl Worker {
    async fn run(self, job_id: String) {
        let started = self
            .ledger
            .update(&job_id, |job| {
                job.transition(JobStatus::Running);
            })
            .await;

        let Some(job) = started else {
            warn!(job_id = %job_id, "Job vanished from the ledger before it started");
            return;
        };

        info!(source = %job.source_path.display(), "Starting backup job");

        match self.execute(&job).await {
            Ok(finished) => {
                info!(
                    files = finished.files_processed,
                    bytes = finished.bytes_processed,
                    "Backup job completed successfully"
                );
                self.ledger.put(finished).await;
            }
            Err(e) => {
                error!(error = %e, "Backup job failed");
                let failed = self
                    .ledger
                    .update(&job_id, |job| job.fail(e.to_string()))
                    .await;

                if let Some(failed) = failed {
                    if let Err(e) = jobs::append(&self.store, &failed).await {
                        warn!(error = %e, "Could not record failed job in metadata");
                    }
                }
            }
        }
    }

    /// Validate, copy, checksum and persist. Returns the completed job.
    async fn execute(&self, job: &BackupJob) -> Result<BackupJob> {
        if !job.source_path.exists() {
            return Err(BackupError::SourceNotFound(job.source_path.clone()));
        }

        if let Some(parent) = job.destination_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let link_dest = match job.backup_type {
            BackupType::Full => None,
            BackupType::Incremental => {
                let previous =
                    find_last_backup(&self.settings.paths.backup_models, &job.source_path);
                match &previous {
                    Some(path) => info!(link_dest = %path.display(), "Incremental backup against previous"),
                    None => info!("No previous backup found, performing full backup"),
                }
                previous
            }
        };

        let request = ArchiveRequest {
            job_id: job.job_id.clone(),
            source: job.source_path.clone(),
            destination: job.destination_path.clone(),
            link_dest,
            compress: self.settings.backup.compress_backups,
        };

        let stats = self.engine.archive(&request).await?;
        let checksum = compute_checksum(job.destination_path.clone()).await?;

        let mut finished = job.clone();
        finished.files_processed = stats.files_processed;
        finished.bytes_processed = stats.bytes_processed;
        finished.checksum = Some(checksum);
        finished.transition(JobStatus::Completed);

        // Recorded before the ledger shows completion, so an immediate
        // verification finds the checksum
        jobs::append(&self.store, &finished).await?;

        Ok(finished)
    }
}
