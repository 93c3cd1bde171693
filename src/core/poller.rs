use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::api::{BalancerApi, GuestLocation, TaskState, TaskStatus};
use crate::core::migration::{GuestId, MigrationProgress};
use crate::errors::BalancerResult;

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_wait: Duration::from_secs(600),
        }
    }
}

/// The single terminal answer a poller produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded(GuestLocation),
    Failed { exit_status: String },
    /// Max wait elapsed. The remote task may still finish either way.
    TimedOut,
    Cancelled,
}

/// Cancels the poller it was created with. Cooperative: a request already in
/// flight completes, its answer is discarded.
#[derive(Debug)]
pub struct PollerHandle {
    cancel: watch::Sender<bool>,
}

impl PollerHandle {
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }
}

pub struct TaskPoller {
    api: Arc<dyn BalancerApi>,
    guest_id: GuestId,
    source_node: String,
    task_id: String,
    config: PollerConfig,
    cancelled: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(
        api: Arc<dyn BalancerApi>,
        guest_id: GuestId,
        source_node: impl Into<String>,
        task_id: impl Into<String>,
        config: PollerConfig,
    ) -> (Self, PollerHandle) {
        let (cancel, cancelled) = watch::channel(false);
        let poller = Self {
            api,
            guest_id,
            source_node: source_node.into(),
            task_id: task_id.into(),
            config,
            cancelled,
        };
        (poller, PollerHandle { cancel })
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Polls until a terminal answer, then stops. Poll N is fully processed
    /// before poll N+1 is issued. Remote calls are bounded by the max-wait
    /// deadline; a call still in flight when it passes is abandoned.
    pub async fn run<F>(mut self, mut on_progress: F) -> PollOutcome
    where
        F: FnMut(MigrationProgress) + Send,
    {
        let deadline = Instant::now() + self.config.max_wait;
        let mut cycle: u32 = 0;

        loop {
            if self.is_cancelled() {
                return self.stopped(cycle);
            }
            if Instant::now() >= deadline {
                return self.timed_out(cycle);
            }
            cycle += 1;

            let (status, migrating) = match timeout_at(deadline, self.poll_cycle()).await {
                Ok(Some(polled)) => polled,
                Ok(None) => return self.stopped(cycle),
                Err(_) => return self.timed_out(cycle),
            };

            match &status {
                Ok(task) if task.status == TaskState::Running => {
                    if let Some(progress) = task.progress.clone() {
                        debug!(guest_id = self.guest_id, percentage = progress.percentage, "Migration progress");
                        on_progress(progress);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(guest_id = self.guest_id, error = %e, "Task status poll failed"),
            }

            match (migrating, &status) {
                // without an exit status an abort is indistinguishable from a clean finish
                (Ok(false), Err(_)) => {
                    debug!(guest_id = self.guest_id, "Guest stopped migrating but exit status unknown, polling again")
                }
                (Ok(false), Ok(task)) => {
                    if let Some(exit) = task.abnormal_exit() {
                        return PollOutcome::Failed {
                            exit_status: exit.to_string(),
                        };
                    }
                    match timeout_at(deadline, self.api.get_guest_location(self.guest_id)).await {
                        Err(_) => return self.timed_out(cycle),
                        Ok(Ok(_)) if self.is_cancelled() => return self.stopped(cycle),
                        Ok(Ok(location)) => {
                            info!(guest_id = self.guest_id, node = %location.node, polls = cycle, "Guest no longer migrating");
                            return PollOutcome::Succeeded(location);
                        }
                        Ok(Err(e)) => {
                            warn!(guest_id = self.guest_id, error = %e, "Guest location lookup failed, polling again")
                        }
                    }
                }
                (Ok(true), _) => {}
                (Err(e), _) => debug!(guest_id = self.guest_id, error = %e, "Migration state poll failed"),
            }

            let next = (Instant::now() + self.config.interval).min(deadline);
            tokio::select! {
                _ = sleep_until(next) => {}
                changed = self.cancelled.changed() => {
                    // handle dropped: nobody is left to report to
                    if changed.is_err() {
                        return self.stopped(cycle);
                    }
                }
            }
        }
    }

    /// Task status then migrating flag. `None` once cancelled; the answer of a
    /// call that was in flight at that point is dropped.
    async fn poll_cycle(&self) -> Option<(BalancerResult<TaskStatus>, BalancerResult<bool>)> {
        let status = self.api.get_task_status(&self.source_node, &self.task_id).await;
        if self.is_cancelled() {
            return None;
        }
        let migrating = self.api.is_guest_migrating(self.guest_id).await;
        if self.is_cancelled() {
            return None;
        }
        Some((status, migrating))
    }

    fn timed_out(&self, cycle: u32) -> PollOutcome {
        warn!(
            guest_id = self.guest_id,
            task_id = %self.task_id,
            waited_secs = self.config.max_wait.as_secs(),
            polls = cycle,
            "Gave up waiting for migration, remote state unknown"
        );
        PollOutcome::TimedOut
    }

    fn stopped(&self, cycle: u32) -> PollOutcome {
        debug!(guest_id = self.guest_id, task_id = %self.task_id, polls = cycle, "Poller cancelled");
        PollOutcome::Cancelled
    }
}
