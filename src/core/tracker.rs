use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::migration::{GuestId, GuestType, MigrationKey, MigrationProgress, MigrationRecord, MigrationStatus};
use super::poller::{PollOutcome, PollerConfig, PollerHandle, TaskPoller};
use crate::api::{BalancerApi, ClusterTopology, GuestLocation};
use crate::cluster::{ClusterMirror, PatchOutcome};
use crate::errors::BalancerResult;

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    /// How long terminal records and the "just completed" marker stick around.
    pub completion_display: Duration,
    /// Undismissed failure indicators kept; the oldest go first.
    pub max_failures: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_wait: Duration::from_secs(600),
            completion_display: Duration::from_secs(5),
            max_failures: 256,
        }
    }
}

/// Shown to the operator for a migration that failed or whose outcome is unknown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureIndicator {
    pub status: MigrationStatus,
    pub message: String,
    pub at: DateTime<Utc>,
}

pub(crate) struct TrackedMigration {
    pub(crate) record: MigrationRecord,
    // bumped on every (re-)registration; stale pollers and timers compare against it
    pub(crate) generation: u64,
    pub(crate) poller: Option<PollerHandle>,
    status_tx: watch::Sender<MigrationStatus>,
}

#[derive(Default)]
pub(crate) struct TrackerState {
    pub(crate) migrations: HashMap<MigrationKey, TrackedMigration>,
    just_completed: HashMap<GuestId, (MigrationKey, u64)>,
    failures: HashMap<MigrationKey, FailureIndicator>,
    pub(crate) mirror: ClusterMirror,
    next_generation: u64,
}

impl TrackerState {
    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// The one place a record turns terminal.
    pub(crate) fn settle(&mut self, key: &MigrationKey, status: MigrationStatus) {
        if let Some(entry) = self.migrations.get_mut(key) {
            entry.poller = None;
            entry.record.status = status;
            entry.record.finished_at = Some(Utc::now());
            entry.status_tx.send_replace(status);
        }
    }

    fn record_failure(&mut self, key: &MigrationKey, failure: FailureIndicator, cap: usize) {
        self.failures.insert(key.clone(), failure);
        while self.failures.len() > cap.max(1) {
            let oldest = self
                .failures
                .iter()
                .min_by(|a, b| a.1.at.cmp(&b.1.at).then_with(|| a.0.cmp(b.0)))
                .map(|(key, _)| key.clone());
            match oldest {
                Some(oldest) => {
                    debug!(key = %oldest, "Evicting oldest failure indicator");
                    self.failures.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn active_guests(&self) -> HashSet<GuestId> {
        self.migrations
            .values()
            .filter(|m| m.record.is_active())
            .map(|m| m.record.key.guest_id)
            .collect()
    }
}

struct Inner {
    api: Arc<dyn BalancerApi>,
    config: TrackerConfig,
    state: Mutex<TrackerState>,
}

/// Owns every piece of migration state plus the cluster mirror.
///
/// Cheap to clone; clones share the same state. All mutations happen under one
/// short, non-suspending lock so readers never see a half-applied patch.
#[derive(Clone)]
pub struct MigrationTracker {
    inner: Arc<Inner>,
}

impl MigrationTracker {
    pub fn new(api: Arc<dyn BalancerApi>, config: TrackerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                config,
                state: Mutex::new(TrackerState::default()),
            }),
        }
    }

    pub fn api(&self) -> &Arc<dyn BalancerApi> {
        &self.inner.api
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking a migration the remote executor already accepted.
    ///
    /// Tracking a key that is already active with the same task id is a no-op.
    /// A different task id replaces the task reference (and its poller) but
    /// keeps the original start time. Must be called from within a tokio runtime.
    pub fn track(
        &self,
        guest_id: GuestId,
        source_node: &str,
        target_node: &str,
        remote_task_id: &str,
        guest_type: GuestType,
    ) -> MigrationKey {
        let key = MigrationKey::new(guest_id, target_node);
        let mut state = self.lock();
        let generation = state.bump_generation();

        if let Some(entry) = state.migrations.get_mut(&key) {
            if entry.record.is_active() {
                if entry.record.remote_task_id == remote_task_id {
                    debug!(%key, task_id = remote_task_id, "Migration already tracked");
                    return key;
                }
                info!(%key, old_task = %entry.record.remote_task_id, new_task = remote_task_id, "Migration re-registered");
                if let Some(old) = entry.poller.take() {
                    old.cancel();
                }
                entry.record.remote_task_id = remote_task_id.to_string();
                entry.record.source_node = source_node.to_string();
                entry.generation = generation;
                entry.poller = Some(self.spawn_poller(key.clone(), generation, source_node, remote_task_id));
                return key;
            }
        }

        info!(%key, source_node, task_id = remote_task_id, %guest_type, "Tracking migration");
        state.failures.remove(&key);
        let (status_tx, _) = watch::channel(MigrationStatus::Running);
        let poller = self.spawn_poller(key.clone(), generation, source_node, remote_task_id);
        state.migrations.insert(
            key.clone(),
            TrackedMigration {
                record: MigrationRecord::new(key.clone(), source_node, remote_task_id, guest_type),
                generation,
                poller: Some(poller),
                status_tx,
            },
        );
        key
    }

    fn spawn_poller(&self, key: MigrationKey, generation: u64, source_node: &str, task_id: &str) -> PollerHandle {
        let config = PollerConfig {
            interval: self.inner.config.poll_interval,
            max_wait: self.inner.config.max_wait,
        };
        let (poller, handle) = TaskPoller::new(self.inner.api.clone(), key.guest_id, source_node, task_id, config);

        let tracker = self.clone();
        tokio::spawn(async move {
            let progress_key = key.clone();
            let progress_tracker = tracker.clone();
            let outcome = poller
                .run(move |progress| progress_tracker.record_progress(&progress_key, generation, progress))
                .await;
            tracker.finish(&key, generation, outcome);
        });
        handle
    }

    fn record_progress(&self, key: &MigrationKey, generation: u64, progress: MigrationProgress) {
        let mut state = self.lock();
        if let Some(entry) = state.migrations.get_mut(key) {
            if entry.generation == generation && entry.record.is_active() {
                entry.record.update_progress(Some(progress));
            }
        }
    }

    fn finish(&self, key: &MigrationKey, generation: u64, outcome: PollOutcome) {
        let mut state = self.lock();
        let source_node = match state.migrations.get(key) {
            Some(entry) if entry.generation == generation && entry.record.is_active() => {
                entry.record.source_node.clone()
            }
            _ => {
                debug!(%key, generation, "Dropping outcome of a superseded poller");
                return;
            }
        };

        match outcome {
            // the cancellation controller owns this transition
            PollOutcome::Cancelled => return,
            PollOutcome::Succeeded(location) => {
                let patched = state
                    .mirror
                    .patch_guest_moved(key.guest_id, &source_node, &location.node, &location.status);
                if patched != PatchOutcome::Moved {
                    warn!(%key, ?patched, "Migration finished but cluster mirror was not patched");
                }
                state.just_completed.insert(key.guest_id, (key.clone(), generation));
                state.settle(key, MigrationStatus::Succeeded);
                info!(%key, node = %location.node, "Migration succeeded");
            }
            PollOutcome::Failed { exit_status } => {
                warn!(%key, exit_status = %exit_status, "Migration failed");
                state.record_failure(
                    key,
                    FailureIndicator {
                        status: MigrationStatus::Failed,
                        message: exit_status,
                        at: Utc::now(),
                    },
                    self.inner.config.max_failures,
                );
                state.settle(key, MigrationStatus::Failed);
            }
            PollOutcome::TimedOut => {
                state.record_failure(
                    key,
                    FailureIndicator {
                        status: MigrationStatus::TimedOut,
                        message: format!(
                            "no result after {}s, migration state unknown",
                            self.inner.config.max_wait.as_secs()
                        ),
                        at: Utc::now(),
                    },
                    self.inner.config.max_failures,
                );
                state.settle(key, MigrationStatus::TimedOut);
            }
        }
        drop(state);
        self.schedule_prune(key.clone(), generation);
    }

    pub(crate) fn schedule_prune(&self, key: MigrationKey, generation: u64) {
        let tracker = self.clone();
        let delay = self.inner.config.completion_display;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracker.prune(&key, generation);
        });
    }

    fn prune(&self, key: &MigrationKey, generation: u64) {
        let mut state = self.lock();
        let expired = state
            .migrations
            .get(key)
            .is_some_and(|entry| entry.generation == generation && !entry.record.is_active());
        if expired {
            state.migrations.remove(key);
        }
        if state.just_completed.get(&key.guest_id) == Some(&(key.clone(), generation)) {
            state.just_completed.remove(&key.guest_id);
        }
    }

    /// Status updates for a tracked key, starting with the current status.
    pub fn subscribe(&self, key: &MigrationKey) -> Option<watch::Receiver<MigrationStatus>> {
        self.lock().migrations.get(key).map(|entry| entry.status_tx.subscribe())
    }

    /// Resolves once the migration is terminal. `None` if the key is not tracked.
    pub async fn wait_terminal(&self, key: &MigrationKey) -> Option<MigrationStatus> {
        let mut rx = self.subscribe(key)?;
        let status = rx.wait_for(|status| status.is_terminal()).await.ok().map(|status| *status);
        status
    }

    pub fn record(&self, key: &MigrationKey) -> Option<MigrationRecord> {
        self.lock().migrations.get(key).map(|entry| entry.record.clone())
    }

    pub fn records(&self) -> Vec<MigrationRecord> {
        let mut records: Vec<_> = self.lock().migrations.values().map(|entry| entry.record.clone()).collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub fn active_count(&self) -> usize {
        self.lock().migrations.values().filter(|m| m.record.is_active()).count()
    }

    /// Whether any migration of this guest is still in flight. Used to disable duplicate actions.
    pub fn is_migrating(&self, guest_id: GuestId) -> bool {
        self.lock()
            .migrations
            .values()
            .any(|m| m.record.key.guest_id == guest_id && m.record.is_active())
    }

    pub fn just_completed(&self, guest_id: GuestId) -> bool {
        self.lock().just_completed.contains_key(&guest_id)
    }

    pub fn failure(&self, key: &MigrationKey) -> Option<FailureIndicator> {
        self.lock().failures.get(key).cloned()
    }

    pub fn failures(&self) -> Vec<(MigrationKey, FailureIndicator)> {
        let mut failures: Vec<_> = self.lock().failures.iter().map(|(k, f)| (k.clone(), f.clone())).collect();
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        failures
    }

    pub fn dismiss_failure(&self, key: &MigrationKey) -> bool {
        self.lock().failures.remove(key).is_some()
    }

    pub fn guest_location(&self, guest_id: GuestId) -> Option<GuestLocation> {
        self.lock().mirror.location(guest_id).cloned()
    }

    /// Copy of the mirror for rendering.
    pub fn mirror(&self) -> ClusterMirror {
        self.lock().mirror.clone()
    }

    /// Full refresh. Guests with a migration in flight keep their mirrored location.
    pub fn apply_snapshot(&self, topology: &ClusterTopology) {
        let mut state = self.lock();
        let protected = state.active_guests();
        state.mirror.replace_snapshot(topology, &protected);
        debug!(guests = state.mirror.guest_count(), protected = protected.len(), "Cluster mirror refreshed");
    }

    pub async fn refresh_from_remote(&self) -> BalancerResult<()> {
        let topology = self.inner.api.refresh_guest_locations().await?;
        self.apply_snapshot(&topology);
        Ok(())
    }

    /// Refreshes the mirror on a fixed cadence until the handle is aborted.
    pub fn spawn_periodic_refresh(&self, every: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = tracker.refresh_from_remote().await {
                    warn!(error = %e, "Periodic guest location refresh failed");
                }
            }
        })
    }
}
