/*
* Evacuation / batch orchestration
* --------------------------------
* Phase machine per plan:
*
*   Requested -> Reviewing -> Confirmed -> Executing -> Done
*
* - Requested: plan asked for, nothing known yet (a failed request stays here)
* - Reviewing: plan in hand, operator edits targets/actions, no migrations yet
* - Confirmed: queue frozen from the plan + edits
* - Executing: queue drained one migration at a time, each through the tracker
* - Done: power-offs delegated, mirror refreshed, report ready
*
* A failed item never stops the batch. The next item only starts once the
* current one is terminal, so a source node never runs two of our migrations.
*/

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{BalancerApi, EvacuationPlan, EvacuationRequest, GuestAction, PlanItem};
use crate::core::{GuestId, GuestType, MigrationKey, MigrationStatus, MigrationTracker};
use crate::errors::{BalancerResult, EvacuationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvacuationPhase {
    Requested,
    Reviewing,
    Confirmed,
    Executing,
    Done,
}

impl fmt::Display for EvacuationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedMigration {
    pub guest_id: GuestId,
    pub guest_type: GuestType,
    pub target_node: String,
}

/// Accepted migrations in plan order, plus the guests handled outside the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchMigrationQueue {
    pub migrations: VecDeque<QueuedMigration>,
    pub power_offs: Vec<GuestId>,
    pub ignored: Vec<GuestId>,
}

impl BatchMigrationQueue {
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ItemOutcome {
    Finished(MigrationStatus),
    StartFailed(String),
    Ignored,
    PoweredOff,
    PowerOffFailed(String),
}

impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemOutcome::Finished(status) => write!(f, "{}", status),
            ItemOutcome::StartFailed(message) => write!(f, "not started: {}", message),
            ItemOutcome::Ignored => write!(f, "ignored"),
            ItemOutcome::PoweredOff => write!(f, "powered off"),
            ItemOutcome::PowerOffFailed(message) => write!(f, "power-off failed: {}", message),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvacuationReport {
    pub id: Uuid,
    pub node: String,
    pub items: Vec<(GuestId, ItemOutcome)>,
    /// Set when the closing refresh failed; the mirror may be stale.
    pub refresh_error: Option<String>,
}

impl EvacuationReport {
    pub fn outcome(&self, guest_id: GuestId) -> Option<&ItemOutcome> {
        self.items.iter().find(|(id, _)| *id == guest_id).map(|(_, outcome)| outcome)
    }

    pub fn migrated(&self) -> usize {
        self.items
            .iter()
            .filter(|(_, outcome)| *outcome == ItemOutcome::Finished(MigrationStatus::Succeeded))
            .count()
    }
}

/// One operator's evacuation of one node.
#[derive(Debug, Clone)]
pub struct EvacuationSession {
    id: Uuid,
    node: String,
    maintenance_nodes: Vec<String>,
    phase: EvacuationPhase,
    plan: Option<EvacuationPlan>,
    guest_targets: BTreeMap<GuestId, String>,
    guest_actions: BTreeMap<GuestId, GuestAction>,
    queue: Option<BatchMigrationQueue>,
}

impl EvacuationSession {
    pub fn new(node: impl Into<String>, maintenance_nodes: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node: node.into(),
            maintenance_nodes,
            phase: EvacuationPhase::Requested,
            plan: None,
            guest_targets: BTreeMap::new(),
            guest_actions: BTreeMap::new(),
            queue: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn phase(&self) -> EvacuationPhase {
        self.phase
    }

    pub fn plan(&self) -> Option<&EvacuationPlan> {
        self.plan.as_ref()
    }

    pub fn queue(&self) -> Option<&BatchMigrationQueue> {
        self.queue.as_ref()
    }

    fn expect_phase(&self, expected: EvacuationPhase) -> Result<(), EvacuationError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(EvacuationError::InvalidPhase {
                node: self.node.clone(),
                expected: expected.to_string(),
                found: self.phase.to_string(),
            })
        }
    }

    fn reviewed_item(&self, guest_id: GuestId) -> Result<&PlanItem, EvacuationError> {
        self.expect_phase(EvacuationPhase::Reviewing)?;
        self.plan
            .as_ref()
            .and_then(|plan| plan.item(guest_id))
            .ok_or(EvacuationError::UnknownGuest { guest_id })
    }

    /// Overrides the proposed target. Only nodes the planner offered are accepted.
    pub fn set_target(&mut self, guest_id: GuestId, target_node: &str) -> Result<(), EvacuationError> {
        self.reviewed_item(guest_id)?;
        let offered = self
            .plan
            .as_ref()
            .is_some_and(|plan| plan.available_targets.iter().any(|t| t == target_node));
        if !offered {
            return Err(EvacuationError::UnknownTarget {
                target_node: target_node.to_string(),
            });
        }
        self.guest_targets.insert(guest_id, target_node.to_string());
        Ok(())
    }

    pub fn set_action(&mut self, guest_id: GuestId, action: GuestAction) -> Result<(), EvacuationError> {
        self.reviewed_item(guest_id)?;
        self.guest_actions.insert(guest_id, action);
        Ok(())
    }

    /// Operator choice, else `Ignore` for items the planner skipped, else `Migrate`.
    pub fn action_for(&self, item: &PlanItem) -> GuestAction {
        match self.guest_actions.get(&item.guest_id) {
            Some(action) => *action,
            None if item.skipped => GuestAction::Ignore,
            None => GuestAction::Migrate,
        }
    }

    pub fn target_for<'a>(&'a self, item: &'a PlanItem) -> Option<&'a str> {
        self.guest_targets
            .get(&item.guest_id)
            .map(String::as_str)
            .or(item.proposed_target.as_deref())
    }

    /// Freezes the queue: plan order, operator edits overlaid.
    pub fn confirm(&mut self) -> Result<&BatchMigrationQueue, EvacuationError> {
        self.expect_phase(EvacuationPhase::Reviewing)?;
        let plan = self.plan.as_ref().ok_or(EvacuationError::InvalidPhase {
            node: self.node.clone(),
            expected: EvacuationPhase::Reviewing.to_string(),
            found: EvacuationPhase::Requested.to_string(),
        })?;

        let mut queue = BatchMigrationQueue::default();
        for item in &plan.items {
            match self.action_for(item) {
                GuestAction::Migrate => {
                    let target_node = self
                        .target_for(item)
                        .ok_or(EvacuationError::MissingTarget { guest_id: item.guest_id })?;
                    queue.migrations.push_back(QueuedMigration {
                        guest_id: item.guest_id,
                        guest_type: item.guest_type,
                        target_node: target_node.to_string(),
                    });
                }
                GuestAction::Poweroff => queue.power_offs.push(item.guest_id),
                GuestAction::Ignore => queue.ignored.push(item.guest_id),
            }
        }

        info!(
            evacuation = %self.id,
            node = %self.node,
            migrations = queue.migrations.len(),
            power_offs = queue.power_offs.len(),
            ignored = queue.ignored.len(),
            "Evacuation confirmed"
        );
        self.phase = EvacuationPhase::Confirmed;
        Ok(self.queue.insert(queue))
    }
}

pub struct EvacuationOrchestrator {
    api: Arc<dyn BalancerApi>,
    tracker: MigrationTracker,
}

impl EvacuationOrchestrator {
    pub fn new(tracker: MigrationTracker) -> Self {
        Self {
            api: tracker.api().clone(),
            tracker,
        }
    }

    pub fn tracker(&self) -> &MigrationTracker {
        &self.tracker
    }

    /// Single migrate action. An already active migration of the same key is
    /// returned as is, without another remote call.
    pub async fn migrate_guest(
        &self,
        guest_id: GuestId,
        source_node: &str,
        target_node: &str,
        guest_type: GuestType,
    ) -> BalancerResult<MigrationKey> {
        let key = MigrationKey::new(guest_id, target_node);
        if self.tracker.record(&key).is_some_and(|record| record.is_active()) {
            info!(%key, "Migration already in flight");
            return Ok(key);
        }

        let started = self
            .api
            .start_migration(source_node, guest_id, target_node, guest_type)
            .await?;
        Ok(self.tracker.track(
            guest_id,
            &started.source_node,
            &started.target_node,
            &started.task_id,
            guest_type,
        ))
    }

    /// Requested -> Reviewing. On error the session stays in `Requested`.
    pub async fn request_plan(&self, session: &mut EvacuationSession) -> BalancerResult<()> {
        session.expect_phase(EvacuationPhase::Requested)?;
        let plan = self
            .api
            .request_evacuation_plan(&session.node, &session.maintenance_nodes)
            .await?;
        info!(evacuation = %session.id, node = %session.node, items = plan.items.len(), "Evacuation plan received");
        session.plan = Some(plan);
        session.phase = EvacuationPhase::Reviewing;
        Ok(())
    }

    /// Confirmed -> Executing -> Done.
    pub async fn execute(&self, session: &mut EvacuationSession) -> BalancerResult<EvacuationReport> {
        session.expect_phase(EvacuationPhase::Confirmed)?;
        let mut queue = session.queue.take().unwrap_or_default();
        session.phase = EvacuationPhase::Executing;

        let mut report = EvacuationReport {
            id: session.id,
            node: session.node.clone(),
            items: Vec::with_capacity(queue.len() + queue.power_offs.len() + queue.ignored.len()),
            refresh_error: None,
        };

        while let Some(item) = queue.migrations.pop_front() {
            info!(evacuation = %session.id, guest_id = item.guest_id, target = %item.target_node, remaining = queue.len(), "Starting batch migration");
            let outcome = match self
                .migrate_guest(item.guest_id, &session.node, &item.target_node, item.guest_type)
                .await
            {
                // a missing record means it was pruned under us: outcome unknown
                Ok(key) => ItemOutcome::Finished(
                    self.tracker
                        .wait_terminal(&key)
                        .await
                        .unwrap_or(MigrationStatus::TimedOut),
                ),
                Err(e) => {
                    warn!(evacuation = %session.id, guest_id = item.guest_id, error = %e, "Batch migration did not start");
                    ItemOutcome::StartFailed(e.to_string())
                }
            };
            info!(evacuation = %session.id, guest_id = item.guest_id, %outcome, "Batch migration finished");
            report.items.push((item.guest_id, outcome));
        }

        if !queue.power_offs.is_empty() {
            let outcome = match self.power_off(session, &queue.power_offs).await {
                Ok(()) => ItemOutcome::PoweredOff,
                Err(e) => {
                    warn!(evacuation = %session.id, error = %e, "Power-off request failed");
                    ItemOutcome::PowerOffFailed(e.to_string())
                }
            };
            report
                .items
                .extend(queue.power_offs.iter().map(|guest_id| (*guest_id, outcome.clone())));
        }
        report
            .items
            .extend(queue.ignored.iter().map(|guest_id| (*guest_id, ItemOutcome::Ignored)));

        // catches companion guests the remote side moved along with ours
        if let Err(e) = self.tracker.refresh_from_remote().await {
            warn!(evacuation = %session.id, error = %e, "Post-evacuation refresh failed");
            report.refresh_error = Some(e.to_string());
        }

        session.phase = EvacuationPhase::Done;
        info!(evacuation = %session.id, node = %session.node, migrated = report.migrated(), "Evacuation done");
        Ok(report)
    }

    // every other guest is marked ignore so the remote side only powers off
    async fn power_off(&self, session: &EvacuationSession, guests: &[GuestId]) -> BalancerResult<()> {
        let guest_actions = session
            .plan
            .iter()
            .flat_map(|plan| plan.items.iter())
            .map(|item| {
                let action = if guests.contains(&item.guest_id) {
                    GuestAction::Poweroff
                } else {
                    GuestAction::Ignore
                };
                (item.guest_id, action)
            })
            .collect();

        let request = EvacuationRequest {
            node: session.node.clone(),
            maintenance_nodes: session.maintenance_nodes.clone(),
            confirm: true,
            guest_actions,
            guest_targets: BTreeMap::new(),
        };
        self.api.execute_evacuation(&request).await
    }
}
