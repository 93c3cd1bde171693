use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type GuestId = u32;

// Composite identity of a migration: same guest to a different target is a different migration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MigrationKey {
    pub guest_id: GuestId,
    pub target_node: String,
}

impl MigrationKey {
    pub fn new(guest_id: GuestId, target_node: impl Into<String>) -> Self {
        Self {
            guest_id,
            target_node: target_node.into(),
        }
    }
}

impl fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.guest_id, self.target_node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuestType {
    #[serde(rename = "VM", alias = "qemu", alias = "vm")]
    Vm,
    #[serde(rename = "CT", alias = "lxc", alias = "ct")]
    Ct,
}

impl fmt::Display for GuestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestType::Vm => f.pad("VM"),
            GuestType::Ct => f.pad("CT"),
        }
    }
}

impl FromStr for GuestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vm" | "qemu" => Ok(GuestType::Vm),
            "ct" | "lxc" => Ok(GuestType::Ct),
            other => Err(format!("unknown guest type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl MigrationStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            MigrationStatus::Pending | MigrationStatus::Running => false,
            MigrationStatus::Succeeded
            | MigrationStatus::Failed
            | MigrationStatus::Cancelled
            | MigrationStatus::TimedOut => true,
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Running => "running",
            MigrationStatus::Succeeded => "succeeded",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Cancelled => "cancelled",
            MigrationStatus::TimedOut => "timed out",
        };
        f.pad(s)
    }
}

/// Display-only transfer progress reported by the remote task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    pub percentage: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub human_readable: Option<String>,
    #[serde(default)]
    pub total_human_readable: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    pub key: MigrationKey,
    pub guest_type: GuestType,
    pub source_node: String,
    pub remote_task_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: MigrationStatus,
    pub progress: Option<MigrationProgress>,
}

impl MigrationRecord {
    pub fn new(
        key: MigrationKey,
        source_node: impl Into<String>,
        remote_task_id: impl Into<String>,
        guest_type: GuestType,
    ) -> Self {
        Self {
            key,
            guest_type,
            source_node: source_node.into(),
            remote_task_id: remote_task_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: MigrationStatus::Running,
            progress: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Last value wins; a poll without progress keeps the previous one.
    pub fn update_progress(&mut self, progress: Option<MigrationProgress>) {
        if progress.is_some() {
            self.progress = progress;
        }
    }
}
