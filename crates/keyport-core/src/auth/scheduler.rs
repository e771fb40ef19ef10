use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::expiry::{self, default_refresh_threshold};
use super::refresh::RefreshCoordinator;

/// How often the credential is checked for upcoming expiry.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Refreshes the credential ahead of expiry, on a timer and whenever the
/// application comes back to the foreground.
#[derive(Clone)]
pub struct ProactiveScheduler {
    coordinator: RefreshCoordinator,
    threshold: chrono::Duration,
}

impl ProactiveScheduler {
    pub fn new(coordinator: RefreshCoordinator) -> Self {
        Self {
            coordinator,
            threshold: default_refresh_threshold(),
        }
    }

    pub fn with_threshold(mut self, threshold: chrono::Duration) -> Self {
        self.threshold = threshold;
        self
    }

    /// Refresh if the stored credential is close to expiry.
    ///
    /// Returns whether a refresh was attempted. The outcome is ignored:
    /// a request that later fails with 401 takes the reactive path.
    pub async fn check_and_refresh(&self) -> bool {
        let Some(credential) = self.coordinator.session().credential() else {
            return false;
        };
        if !expiry::is_near_expiry(&credential, self.threshold) {
            return false;
        }

        debug!("Credential near expiry, refreshing proactively");
        let refreshed = self.coordinator.refresh().await.is_some();
        debug!(refreshed, "Proactive refresh finished");
        true
    }

    /// Run checks every `period` until the returned handle is shut down.
    ///
    /// The first periodic check happens one `period` after starting.
    pub fn start(self, period: Duration) -> SchedulerHandle {
        let foreground = Arc::new(Notify::new());
        let wake = Arc::clone(&foreground);

        let task = tokio::spawn(async move {
            info!(period_secs = period.as_secs(), "Starting proactive credential refresh");
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => debug!("Periodic credential check"),
                    _ = wake.notified() => debug!("Foreground credential check"),
                }
                self.check_and_refresh().await;
            }
        });

        SchedulerHandle { foreground, task }
    }
}

/// Control handle for a running [`ProactiveScheduler`].
///
/// Dropping the handle stops the scheduler. Refreshes already in flight
/// run to completion.
pub struct SchedulerHandle {
    foreground: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal that the application returned to the foreground.
    pub fn notify_foreground(&self) {
        self.foreground.notify_one();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the timer and foreground listener.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
