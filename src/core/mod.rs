pub mod archive_engine;
pub mod checksum;
pub mod enhanced;
pub mod ledger;
pub mod manager;
pub mod models;
pub mod preflight;
pub mod rollout;
pub mod transaction;
pub mod verifier;

pub use archive_engine::{ArchiveEngine, ArchiveEngineType, ArchiveRequest, ArchiveStats};
pub use enhanced::EnhancedBackupManager;
pub use ledger::JobLedger;
pub use manager::BackupManager;
pub use models::{
    BackupJob, BackupSchedule, BackupStatus, BackupType, EnhancedBackupResult, JobStatus,
    VerificationResult,
};
pub use rollout::{Rollout, RolloutReport};
pub use transaction::RollbackActions;
