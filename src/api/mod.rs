pub mod client;
pub mod types;

use async_trait::async_trait;

use crate::core::migration::{GuestId, GuestType};
use crate::errors::BalancerResult;

pub use client::HttpBalancerApi;
pub use types::{
    ClusterTopology, EvacuationPlan, EvacuationRequest, GuestAction, GuestLocation, MigrationStarted, NodeSummary,
    PlanItem, TaskState, TaskStatus,
};

/// Remote analysis/execution service.
///
/// Every call is a plain request/response; responses may arrive late or out
/// of order relative to operator actions taken after the call was issued.
#[async_trait]
pub trait BalancerApi: Send + Sync {
    async fn start_migration(
        &self,
        source_node: &str,
        guest_id: GuestId,
        target_node: &str,
        guest_type: GuestType,
    ) -> BalancerResult<MigrationStarted>;

    async fn get_task_status(&self, node: &str, task_id: &str) -> BalancerResult<TaskStatus>;

    async fn is_guest_migrating(&self, guest_id: GuestId) -> BalancerResult<bool>;

    async fn get_guest_location(&self, guest_id: GuestId) -> BalancerResult<GuestLocation>;

    async fn stop_task(&self, node: &str, task_id: &str) -> BalancerResult<()>;

    /// Dry run (`confirm = false`) of an evacuation.
    async fn request_evacuation_plan(&self, node: &str, maintenance_nodes: &[String])
        -> BalancerResult<EvacuationPlan>;

    async fn execute_evacuation(&self, request: &EvacuationRequest) -> BalancerResult<()>;

    async fn refresh_guest_locations(&self) -> BalancerResult<ClusterTopology>;
}
