use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::core::migration::{GuestId, GuestType, MigrationProgress};
use crate::errors::{BalancerError, BalancerResult};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMigrationRequest<'a> {
    pub source_node: &'a str,
    pub vmid: GuestId,
    pub target_node: &'a str,
    #[serde(rename = "type")]
    pub guest_type: GuestType,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStarted {
    pub task_id: String,
    pub source_node: String,
    pub target_node: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub status: TaskState,
    #[serde(default)]
    pub exit_status: Option<String>,
    #[serde(default)]
    pub progress: Option<MigrationProgress>,
}

impl TaskStatus {
    /// Exit status of a task that stopped unexpectedly or was aborted.
    ///
    /// `OK` and warning-only exits are not failures; anything mentioning an
    /// abort, an unexpected stop or an error is.
    pub fn abnormal_exit(&self) -> Option<&str> {
        let exit = self.exit_status.as_deref()?;
        let lowered = exit.to_ascii_lowercase();
        let failed = ["unexpected", "abort", "error", "fail"]
            .iter()
            .any(|needle| lowered.contains(needle));
        failed.then_some(exit)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MigratingResponse {
    pub is_migrating: bool,
}

/// Where a guest lives and what it is doing, as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestLocation {
    pub node: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestAction {
    Migrate,
    Ignore,
    Poweroff,
}

impl fmt::Display for GuestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestAction::Migrate => write!(f, "migrate"),
            GuestAction::Ignore => write!(f, "ignore"),
            GuestAction::Poweroff => write!(f, "poweroff"),
        }
    }
}

impl FromStr for GuestAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "migrate" => Ok(GuestAction::Migrate),
            "ignore" => Ok(GuestAction::Ignore),
            "poweroff" | "power-off" | "shutdown" => Ok(GuestAction::Poweroff),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanItem {
    #[serde(alias = "vmid")]
    pub guest_id: GuestId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default = "default_guest_type")]
    pub guest_type: GuestType,
    #[serde(default, alias = "target")]
    pub proposed_target: Option<String>,
    #[serde(default = "yes")]
    pub storage_compatible: bool,
    #[serde(default = "yes")]
    pub compatible: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub will_restart: bool,
}

fn default_guest_type() -> GuestType {
    GuestType::Vm
}

fn yes() -> bool {
    true
}

/// Immutable plan as produced by the remote planner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvacuationPlan {
    #[serde(rename = "plan", default)]
    pub items: Vec<PlanItem>,
    #[serde(default)]
    pub available_targets: Vec<String>,
}

impl EvacuationPlan {
    pub fn item(&self, guest_id: GuestId) -> Option<&PlanItem> {
        self.items.iter().find(|item| item.guest_id == guest_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvacuationRequest {
    pub node: String,
    pub maintenance_nodes: Vec<String>,
    pub confirm: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub guest_actions: BTreeMap<GuestId, GuestAction>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub guest_targets: BTreeMap<GuestId, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NodeSummary {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub guests: Vec<GuestId>,
}

/// Full topology returned by the guest-locations refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClusterTopology {
    #[serde(default)]
    pub guests: HashMap<GuestId, GuestLocation>,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeSummary>,
}

/// Unwraps the `{success, error}` envelope every endpoint answers with.
pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> BalancerResult<T> {
    let success = value.get("success").and_then(Value::as_bool).unwrap_or(false);
    if !success {
        let message = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed without an error message")
            .to_string();
        return Err(BalancerError::Remote(message));
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_failure_keeps_server_message() {
        let err = decode::<MigrationStarted>(json!({"success": false, "error": "guest is locked"})).unwrap_err();
        assert_eq!(err.to_string(), "guest is locked");
    }

    #[test]
    fn task_status_with_progress() {
        let status: TaskStatus = decode(json!({
            "success": true,
            "status": "running",
            "progress": {"percentage": 37.5, "speed": 120.0, "humanReadable": "120 MiB/s", "totalHumanReadable": "8 GiB"}
        }))
        .unwrap();
        assert_eq!(status.status, TaskState::Running);
        assert_eq!(status.progress.unwrap().human_readable.as_deref(), Some("120 MiB/s"));
    }

    #[test]
    fn abnormal_exit_detection() {
        let stopped = |exit: &str| TaskStatus {
            status: TaskState::Stopped,
            exit_status: Some(exit.to_string()),
            progress: None,
        };
        assert_eq!(stopped("migration aborted").abnormal_exit(), Some("migration aborted"));
        assert!(stopped("unexpected status").abnormal_exit().is_some());
        assert!(stopped("OK").abnormal_exit().is_none());
        assert!(stopped("WARNINGS: 1").abnormal_exit().is_none());
    }

    #[test]
    fn plan_items_default_missing_flags() {
        let plan: EvacuationPlan = decode(json!({
            "success": true,
            "plan": [
                {"vmid": 101, "type": "VM", "target": "nodeB"},
                {"guestId": 102, "type": "CT", "skipped": true, "skipReason": "local storage"}
            ],
            "availableTargets": ["nodeB", "nodeC"]
        }))
        .unwrap();
        assert_eq!(plan.items.len(), 2);
        assert_eq!(plan.items[0].proposed_target.as_deref(), Some("nodeB"));
        assert!(plan.items[0].storage_compatible);
        assert!(plan.items[1].skipped);
        assert_eq!(plan.item(102).unwrap().guest_type, GuestType::Ct);
    }

    #[test]
    fn topology_accepts_string_guest_keys() {
        let topology: ClusterTopology = decode(json!({
            "success": true,
            "guests": {"101": {"node": "nodeA", "status": "running", "name": "web"}},
            "nodes": {"nodeA": {"status": "online", "guests": [101]}, "nodeB": {}}
        }))
        .unwrap();
        assert_eq!(topology.guests[&101].node, "nodeA");
        assert_eq!(topology.nodes.len(), 2);
    }

    #[test]
    fn evacuation_request_wire_shape() {
        let mut guest_actions = BTreeMap::new();
        guest_actions.insert(101, GuestAction::Poweroff);
        let request = EvacuationRequest {
            node: "nodeA".into(),
            maintenance_nodes: vec!["nodeA".into()],
            confirm: true,
            guest_actions,
            guest_targets: BTreeMap::new(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["guestActions"]["101"], "poweroff");
        assert!(value.get("guestTargets").is_none());
    }
}
