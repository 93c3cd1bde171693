use serde::Serialize;
use tracing::{info, warn};

use super::migration::{MigrationKey, MigrationStatus};
use super::tracker::MigrationTracker;
use crate::api::GuestLocation;
use crate::errors::{BalancerResult, TrackingError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelOutcome {
    pub key: MigrationKey,
    pub status: MigrationStatus,
    /// Where the guest turned out to be after the stop. `None` if the lookup failed.
    pub location: Option<GuestLocation>,
}

impl MigrationTracker {
    /// Best-effort stop of a running migration.
    ///
    /// Nothing changes locally unless the remote stop reports success. After a
    /// successful stop the guest is looked up once and the mirror follows that
    /// answer: a cancelled live migration does not always land back on the source.
    pub async fn cancel(&self, key: &MigrationKey) -> BalancerResult<CancelOutcome> {
        let (source_node, task_id, generation) = {
            let state = self.lock();
            match state.migrations.get(key) {
                Some(entry) if entry.record.is_active() && !entry.record.remote_task_id.is_empty() => (
                    entry.record.source_node.clone(),
                    entry.record.remote_task_id.clone(),
                    entry.generation,
                ),
                _ => {
                    return Err(TrackingError::NotTracked {
                        guest_id: key.guest_id,
                        target_node: key.target_node.clone(),
                    }
                    .into())
                }
            }
        };

        info!(%key, %source_node, %task_id, "Stopping migration");
        if let Err(e) = self.api().stop_task(&source_node, &task_id).await {
            warn!(%key, error = %e, "Stop request failed, migration left running");
            return Err(e);
        }

        let resolved = {
            let mut state = self.lock();
            match state.migrations.get_mut(key) {
                Some(entry) if entry.generation == generation && entry.record.is_active() => {
                    if let Some(poller) = entry.poller.take() {
                        poller.cancel();
                    }
                    state.settle(key, MigrationStatus::Cancelled);
                    None
                }
                // re-registered while the stop was in flight: the stopped task is not the live one
                Some(entry) if entry.record.is_active() => {
                    warn!(%key, stopped_task = %task_id, live_task = %entry.record.remote_task_id, "Migration re-registered during stop");
                    return Err(TrackingError::Superseded {
                        guest_id: key.guest_id,
                        target_node: key.target_node.clone(),
                        stopped_task: task_id,
                    }
                    .into());
                }
                Some(entry) => Some(Ok(entry.record.status)),
                None => Some(Err(TrackingError::NotTracked {
                    guest_id: key.guest_id,
                    target_node: key.target_node.clone(),
                })),
            }
        };
        if let Some(resolved) = resolved {
            let status = resolved?;
            info!(%key, %status, "Migration resolved before the stop landed");
            return Ok(CancelOutcome {
                key: key.clone(),
                status,
                location: None,
            });
        }

        let location = match self.api().get_guest_location(key.guest_id).await {
            Ok(location) => {
                let mut state = self.lock();
                state
                    .mirror
                    .patch_guest_moved(key.guest_id, &source_node, &location.node, &location.status);
                info!(%key, node = %location.node, "Migration cancelled");
                Some(location)
            }
            Err(e) => {
                warn!(%key, error = %e, "Migration cancelled but the guest could not be located");
                None
            }
        };

        self.schedule_prune(key.clone(), generation);
        Ok(CancelOutcome {
            key: key.clone(),
            status: MigrationStatus::Cancelled,
            location,
        })
    }
}
