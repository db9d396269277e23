//! Periodic sync for one user, with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::SyncSettings;
use crate::domain::UserId;
use crate::services::sync_service::SyncService;

/// Timing of the sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Wait after a successful sync.
    pub interval: Duration,
    /// Wait after the first failure.
    pub backoff_base: Duration,
    /// Longest wait after a failure.
    pub backoff_max: Duration,
    /// Failures in a row before giving up. Zero disables the cap.
    pub max_failures: u32,
}

impl From<&SyncSettings> for SchedulerConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            interval: settings.interval(),
            backoff_base: Duration::from_secs(settings.backoff_base_seconds),
            backoff_max: Duration::from_secs(settings.backoff_max_seconds),
            max_failures: settings.max_consecutive_failures,
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    Cancelled,
    /// The mail credential is gone; the user has to reconnect.
    AuthExpired,
    TooManyFailures,
}

/// Wakes a scheduler before its wait is over.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    trigger: Arc<Notify>,
}

impl SchedulerHandle {
    /// Requests a sync now. A trigger that arrives while a sync runs skips
    /// the following wait.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }
}

/// Runs [`SyncService::sync`] for one user until cancelled or stopped.
pub struct SyncScheduler {
    sync: Arc<SyncService>,
    user_id: UserId,
    config: SchedulerConfig,
    trigger: Arc<Notify>,
}

impl SyncScheduler {
    pub fn new(sync: Arc<SyncService>, user_id: UserId, config: SchedulerConfig) -> Self {
        Self {
            sync,
            user_id,
            config,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Returns a handle for triggering syncs from elsewhere.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            trigger: self.trigger.clone(),
        }
    }

    /// Syncs immediately, then after every wait.
    pub async fn run(self, cancel: CancellationToken) -> SchedulerExit {
        let user_id = &self.user_id;
        tracing::info!(user_id = %user_id, interval = ?self.config.interval, "Scheduler started");
        let mut failures: u32 = 0;

        let exit = loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break SchedulerExit::Cancelled,
                outcome = self.sync.sync(user_id) => outcome,
            };

            let wait = match outcome {
                Ok(_) => {
                    failures = 0;
                    self.config.interval
                }
                Err(e) if e.is_auth_expired() => break SchedulerExit::AuthExpired,
                Err(_) => {
                    failures += 1;
                    if self.config.max_failures > 0 && failures >= self.config.max_failures {
                        break SchedulerExit::TooManyFailures;
                    }
                    backoff_delay(self.config.backoff_base, self.config.backoff_max, failures)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break SchedulerExit::Cancelled,
                _ = tokio::time::sleep(wait) => {}
                _ = self.trigger.notified() => {
                    tracing::debug!(user_id = %user_id, "Manual sync requested");
                }
            }
        };

        tracing::info!(user_id = %user_id, exit = ?exit, failures, "Scheduler stopped");
        exit
    }
}

/// `min(base * 2^(failures - 1), max)`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}
