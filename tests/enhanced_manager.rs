//! Retry, rollback and test-mode behaviour of the enhanced manager.

use anyhow::bail;
use async_trait::async_trait;
use citadel_backup::BackupError;
use citadel_backup::config::Settings;
use citadel_backup::context::AppContext;
use citadel_backup::core::archive_engine::{
    ArchiveEngine, ArchiveRequest, ArchiveStats, NativeCopyEngine,
};
use citadel_backup::core::{BackupSchedule, EnhancedBackupManager, JobStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::tempdir;

/// Fails the first `failures` archive calls, then copies for real.
struct FlakyEngine {
    failures: u32,
    calls: AtomicU32,
    inner: NativeCopyEngine,
}

impl FlakyEngine {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
            inner: NativeCopyEngine::default(),
        })
    }
}

#[async_trait]
impl ArchiveEngine for FlakyEngine {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn archive(&self, req: &ArchiveRequest) -> anyhow::Result<ArchiveStats> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            bail!("simulated rsync exit 23 on call {}", call);
        }
        self.inner.archive(req).await
    }
}

struct SlowEngine;

#[async_trait]
impl ArchiveEngine for SlowEngine {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn archive(&self, _req: &ArchiveRequest) -> anyhow::Result<ArchiveStats> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(ArchiveStats::default())
    }
}

fn install_model(settings: &Settings, directory: &str) -> PathBuf {
    let dir = settings.paths.models_active.join(directory);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.json"), b"{\"model_type\": \"phi3\"}").unwrap();
    std::fs::write(dir.join("tokenizer.json"), b"{\"vocab\": {}}").unwrap();
    std::fs::write(dir.join("model.safetensors"), vec![9u8; 8192]).unwrap();
    dir
}

fn staging_entries(settings: &Settings) -> Vec<PathBuf> {
    match std::fs::read_dir(&settings.paths.models_staging) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

fn manager(settings: &Settings, engine: Arc<dyn ArchiveEngine>) -> EnhancedBackupManager {
    EnhancedBackupManager::with_engine(AppContext::new(settings.clone()), engine).unwrap()
}

#[tokio::test]
async fn test_model_backup_succeeds() {
    let temp = tempdir().unwrap();
    let settings = Settings::rooted_at(temp.path());
    install_model(&settings, "Phi-3-mini-128k-instruct");
    let manager = manager(&settings, Arc::new(NativeCopyEngine::default()));

    let result = manager
        .create_model_backup("phi3", BackupSchedule::Daily, false)
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.message, "Backup completed for phi3");
    assert_eq!(result.backup_type, "daily");
    assert_eq!(result.model_name.as_deref(), Some("phi3"));
    assert_eq!(result.files_processed, 3);
    assert_eq!(result.attempts, 1);
    assert!(result.errors.is_empty());

    let backup_path = result.backup_path.unwrap();
    assert!(backup_path.starts_with(&settings.paths.backup_models));
    assert!(
        backup_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("Phi-3-mini-128k-instruct_incremental_")
    );

    let ratio = result.compression_ratio.unwrap();
    assert!((ratio - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_retry_recovers_after_transient_failures() {
    let temp = tempdir().unwrap();
    let settings = Settings::rooted_at(temp.path());
    install_model(&settings, "openchat-3.5-1210");
    let engine = FlakyEngine::new(2);
    let manager = manager(&settings, engine.clone());

    let result = manager
        .create_model_backup("openchat", BackupSchedule::Weekly, false)
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.attempts, 3);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 3);

    // Every attempt is its own job
    let ledger = manager.base().ledger();
    assert_eq!(ledger.len().await, 3);
    assert_eq!(ledger.count(JobStatus::Failed).await, 2);
    assert_eq!(ledger.count(JobStatus::Completed).await, 1);
}

#[tokio::test]
async fn test_exhausted_retries_report_failure() {
    let temp = tempdir().unwrap();
    let settings = Settings::rooted_at(temp.path());
    install_model(&settings, "Phi-3-mini-128k-instruct");
    let manager = manager(&settings, FlakyEngine::new(u32::MAX));

    let result = manager
        .create_model_backup("phi3", BackupSchedule::Daily, false)
        .await;

    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    assert!(result.backup_path.is_none());
    assert_eq!(result.model_name.as_deref(), Some("phi3"));
    assert!(
        result
            .message
            .starts_with("Backup failed for phi3: All 3 backup attempts failed"),
        "{}",
        result.message
    );
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("simulated rsync exit 23"));
    assert_eq!(manager.base().ledger().len().await, 3);
}

#[tokio::test]
async fn test_unknown_model_is_not_found() {
    let temp = tempdir().unwrap();
    let settings = Settings::rooted_at(temp.path());
    let manager = manager(&settings, Arc::new(NativeCopyEngine::default()));

    let result = manager
        .create_model_backup("llama-70b", BackupSchedule::Daily, false)
        .await;

    assert!(!result.success);
    assert_eq!(result.model_name.as_deref(), Some("llama-70b"));
    assert!(result.message.contains("not found"), "{}", result.message);
    assert_eq!(result.attempts, 0);
    assert!(manager.base().ledger().is_empty().await);
}

#[tokio::test]
async fn test_missing_model_directory() {
    let temp = tempdir().unwrap();
    let settings = Settings::rooted_at(temp.path());
    let manager = manager(&settings, Arc::new(NativeCopyEngine::default()));

    let result = manager
        .create_model_backup("vision", BackupSchedule::Monthly, false)
        .await;

    assert!(!result.success);
    assert!(result.message.contains("Model directory does not exist"));
    assert!(result.message.contains("imp-v1_5-7b"));
}

#[tokio::test]
async fn test_test_mode_backs_up_subset() {
    let temp = tempdir().unwrap();
    let settings = Settings::rooted_at(temp.path());
    install_model(&settings, "Phi-3-mini-128k-instruct");
    let manager = manager(&settings, Arc::new(NativeCopyEngine::default()));

    let result = manager
        .create_model_backup("phi3", BackupSchedule::Daily, true)
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.files_processed, 2);

    let backup_path = result.backup_path.unwrap();
    assert!(backup_path.join("config.json").exists());
    assert!(!backup_path.join("model.safetensors").exists());

    // Subset stays in staging after a successful run
    assert_eq!(staging_entries(&settings).len(), 1);
}

#[tokio::test]
async fn test_failed_test_mode_rolls_back_subset() {
    let temp = tempdir().unwrap();
    let settings = Settings::rooted_at(temp.path());
    install_model(&settings, "Phi-3-mini-128k-instruct");
    let manager = manager(&settings, FlakyEngine::new(u32::MAX));

    let result = manager
        .create_model_backup("phi3", BackupSchedule::Daily, true)
        .await;

    assert!(!result.success);
    assert!(staging_entries(&settings).is_empty());
}

#[tokio::test]
async fn test_completion_timeout_fails_attempt() {
    let temp = tempdir().unwrap();
    let mut settings = Settings::rooted_at(temp.path());
    settings.backup.max_retry_attempts = 1;
    settings.backup.completion_timeout_seconds = 0;
    install_model(&settings, "Phi-3-mini-128k-instruct");
    let manager = manager(&settings, Arc::new(SlowEngine));

    let result = manager
        .create_model_backup("phi3", BackupSchedule::Daily, false)
        .await;

    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert!(result.message.contains("timed out"), "{}", result.message);
}

#[tokio::test]
async fn test_wait_for_unknown_job() {
    let temp = tempdir().unwrap();
    let settings = Settings::rooted_at(temp.path());
    let manager = manager(&settings, Arc::new(NativeCopyEngine::default()));

    let err = manager
        .wait_for_completion("backup_19700101_000000_deadbeef", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::UnknownJob(_)));
}

#[tokio::test]
async fn test_missing_tool_refuses_construction() {
    let temp = tempdir().unwrap();
    let mut settings = Settings::rooted_at(temp.path());
    settings.backup.required_tools = vec!["sh".to_string(), "citadel-missing-archiver".to_string()];

    let result = EnhancedBackupManager::with_engine(
        AppContext::new(settings),
        Arc::new(NativeCopyEngine::default()),
    );

    match result {
        Err(BackupError::MissingDependencies(missing)) => {
            assert_eq!(
                missing,
                vec!["Required command not found: citadel-missing-archiver".to_string()]
            );
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("construction should fail"),
    }
}

#[test]
fn test_settings_fixture_is_valid() {
    let temp = tempdir().unwrap();
    let settings = Settings::rooted_at(Path::new(temp.path()));
    assert!(settings.validate().is_ok());
}
