//! Compensating-action scope for multi-step backups.
//!
//! Steps register undo actions as they create side effects. If the scope's
//! body fails, the actions run last-registered-first and the body's error is
//! returned unchanged. A successful body discards them.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;

type RollbackAction = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Handle passed into a transaction body for registering undo actions.
#[derive(Clone, Default)]
pub struct RollbackActions {
    actions: Arc<Mutex<Vec<(String, RollbackAction)>>>,
}

impl RollbackActions {
    pub fn register<F>(&self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let label = label.into();
        debug!(action = %label, "Registered rollback action");
        self.lock().push((label, Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self) -> Vec<(String, RollbackAction)> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, RollbackAction)>> {
        // A panicking action cannot leave the list half-updated
        self.actions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run every action in reverse registration order. Failures are logged
    /// and do not stop the remaining actions.
    fn run(&self, transaction: &str) {
        for (label, action) in self.take().into_iter().rev() {
            match action() {
                Ok(()) => info!(transaction, action = %label, "Rollback action completed"),
                Err(e) => warn!(
                    transaction,
                    action = %label,
                    error = %format!("{:#}", e),
                    "Rollback action failed"
                ),
            }
        }
    }
}

/// Run `body` as a named transaction.
pub async fn scope<T, F, Fut>(name: &str, body: F) -> Result<T>
where
    F: FnOnce(RollbackActions) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let rollback = RollbackActions::default();

    info!(transaction = name, "Starting backup transaction");

    match body(rollback.clone()).await {
        Ok(value) => {
            let discarded = rollback.take().len();
            info!(
                transaction = name,
                discarded_actions = discarded,
                duration_secs = start.elapsed().as_secs_f64(),
                "Backup transaction completed"
            );
            Ok(value)
        }
        Err(e) => {
            error!(
                transaction = name,
                error = %e,
                actions = rollback.len(),
                "Backup transaction failed, rolling back"
            );
            rollback.run(name);
            info!(
                transaction = name,
                duration_secs = start.elapsed().as_secs_f64(),
                "Backup transaction rolled back"
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackupError;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> RollbackAction) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |tag: &'static str| -> RollbackAction {
                let log = log.clone();
                Box::new(move || {
                    log.lock().unwrap().push(tag);
                    Ok(())
                })
            }
        };
        (log, make)
    }

    #[tokio::test]
    async fn test_failure_runs_actions_in_reverse_order() {
        let (log, make) = recorder();

        let result: Result<()> = scope("reverse", |rollback| async move {
            rollback.register("a", make("A"));
            rollback.register("b", make("B"));
            Err(BackupError::Archive("boom".to_string()))
        })
        .await;

        assert!(matches!(result, Err(BackupError::Archive(ref m)) if m == "boom"));
        assert_eq!(*log.lock().unwrap(), vec!["B", "A"]);
    }

    #[tokio::test]
    async fn test_success_discards_actions() {
        let (log, make) = recorder();

        let value = scope("ok", |rollback| async move {
            rollback.register("a", make("A"));
            Ok(42)
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_action_does_not_stop_the_rest() {
        let (log, make) = recorder();

        let result: Result<()> = scope("partial", |rollback| async move {
            rollback.register("a", make("A"));
            rollback.register("broken", || anyhow::bail!("cannot undo"));
            rollback.register("c", make("C"));
            Err(BackupError::UnknownJob("x".to_string()))
        })
        .await;

        assert!(matches!(result, Err(BackupError::UnknownJob(_))));
        assert_eq!(*log.lock().unwrap(), vec!["C", "A"]);
    }
}
