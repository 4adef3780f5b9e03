use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::core::enhanced::EnhancedBackupManager;
use crate::core::models::{BackupSchedule, EnhancedBackupResult};

/// Outcome of a rollout, one result per model attempted.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    pub results: Vec<EnhancedBackupResult>,
    /// Set when the first model failed and the rest were skipped
    pub aborted: bool,
}

impl RolloutReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

/// Backs up the configured models one after another, starting with the
/// smallest so that a broken setup is caught early.
pub struct Rollout<'a> {
    manager: &'a EnhancedBackupManager,
    models: Vec<String>,
    pause: Duration,
}

impl<'a> Rollout<'a> {
    pub fn new(manager: &'a EnhancedBackupManager) -> Self {
        let rollout = &manager.base().settings().rollout;
        Self {
            manager,
            models: rollout.models.clone(),
            pause: Duration::from_secs(rollout.pause_seconds),
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    /// Test mode only applies to the first model.
    pub async fn run(&self, schedule: BackupSchedule, test_mode: bool) -> RolloutReport {
        let total = self.models.len();
        let mut report = RolloutReport {
            results: Vec::with_capacity(total),
            aborted: false,
        };

        info!(models = total, schedule = %schedule, test_mode, "Starting backup rollout");

        for (i, model) in self.models.iter().enumerate() {
            info!(step = i + 1, total, model = %model, "Rollout step");

            let result = self
                .manager
                .create_model_backup(model, schedule, i == 0 && test_mode)
                .await;
            let success = result.success;
            report.results.push(result);

            if !success {
                if i == 0 {
                    error!(model = %model, "Stopping rollout due to initial failure");
                    report.aborted = true;
                    return report;
                }
                warn!(model = %model, "Continuing rollout with remaining models");
            }

            if i + 1 < total && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        info!(
            succeeded = report.succeeded(),
            total, "Backup rollout completed"
        );
        report
    }
}
