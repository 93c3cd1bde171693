use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::types::{decode, MigratingResponse, StartMigrationRequest};
use super::{BalancerApi, ClusterTopology, EvacuationPlan, EvacuationRequest, GuestLocation, MigrationStarted, TaskStatus};
use crate::core::migration::{GuestId, GuestType};
use crate::errors::{BalancerError, BalancerResult};
use crate::with_context;

/// REST client for the balancer's analysis/execution service.
#[derive(Clone)]
pub struct HttpBalancerApi {
    http_client: Client,
    base_url: Url,
}

impl HttpBalancerApi {
    pub fn new(base_url: &str, request_timeout: Duration) -> BalancerResult<Self> {
        let base_url = Url::parse(base_url).map_err(|e| BalancerError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(BalancerError::InvalidUrl(base_url.to_string()));
        }

        let http_client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http_client, base_url })
    }

    // Segments are percent-encoded, task ids (UPIDs) are full of ':'
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("api").extend(segments);
        }
        url
    }

    async fn get(&self, segments: &[&str]) -> BalancerResult<Value> {
        let url = self.endpoint(segments);
        debug!(%url, "GET");
        let response = self.http_client.get(url).send().await?;
        read_body(response).await
    }

    async fn post(&self, segments: &[&str], body: &impl serde::Serialize) -> BalancerResult<Value> {
        let url = self.endpoint(segments);
        debug!(%url, "POST");
        let response = self.http_client.post(url).json(body).send().await?;
        read_body(response).await
    }
}

async fn read_body(response: Response) -> BalancerResult<Value> {
    let status = response.status();
    match response.json::<Value>().await {
        Ok(value) if status.is_success() || value.get("error").is_some() => Ok(value),
        Ok(_) => Err(BalancerError::Remote(format!("remote service returned {}", status))),
        Err(e) if status.is_success() => Err(e.into()),
        Err(_) => Err(BalancerError::Remote(format!("remote service returned {}", status))),
    }
}

#[async_trait]
impl BalancerApi for HttpBalancerApi {
    async fn start_migration(
        &self,
        source_node: &str,
        guest_id: GuestId,
        target_node: &str,
        guest_type: GuestType,
    ) -> BalancerResult<MigrationStarted> {
        let body = StartMigrationRequest {
            source_node,
            vmid: guest_id,
            target_node,
            guest_type,
        };
        let value = with_context!(self.post(&["migrate"], &body).await, "start_migration")?;
        decode(value)
    }

    async fn get_task_status(&self, node: &str, task_id: &str) -> BalancerResult<TaskStatus> {
        decode(self.get(&["tasks", node, task_id]).await?)
    }

    async fn is_guest_migrating(&self, guest_id: GuestId) -> BalancerResult<bool> {
        let id = guest_id.to_string();
        let response: MigratingResponse = decode(self.get(&["guests", &id, "migration-status"]).await?)?;
        Ok(response.is_migrating)
    }

    async fn get_guest_location(&self, guest_id: GuestId) -> BalancerResult<GuestLocation> {
        let id = guest_id.to_string();
        decode(self.get(&["guests", &id, "location"]).await?)
    }

    async fn stop_task(&self, node: &str, task_id: &str) -> BalancerResult<()> {
        let value = with_context!(self.post(&["tasks", node, task_id, "stop"], &json!({})).await, "stop_task")?;
        decode::<Value>(value).map(|_| ())
    }

    async fn request_evacuation_plan(
        &self,
        node: &str,
        maintenance_nodes: &[String],
    ) -> BalancerResult<EvacuationPlan> {
        let body = json!({
            "maintenanceNodes": maintenance_nodes,
            "confirm": false,
        });
        let value = with_context!(self.post(&["nodes", node, "evacuate"], &body).await, "request_evacuation_plan")?;
        decode(value)
    }

    async fn execute_evacuation(&self, request: &EvacuationRequest) -> BalancerResult<()> {
        let value = with_context!(
            self.post(&["nodes", &request.node, "evacuate"], request).await,
            "execute_evacuation"
        )?;
        decode::<Value>(value).map(|_| ())
    }

    async fn refresh_guest_locations(&self) -> BalancerResult<ClusterTopology> {
        let value = with_context!(self.get(&["guests", "locations"]).await, "refresh_guest_locations")?;
        decode(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_rooted_under_api() {
        let api = HttpBalancerApi::new("http://balancer.local:5000/", Duration::from_secs(5)).unwrap();
        let url = api.endpoint(&["tasks", "nodeA", "UPID:nodeA:0001:qmigrate:101:root@pam:"]);
        assert_eq!(url.path(), "/api/tasks/nodeA/UPID:nodeA:0001:qmigrate:101:root@pam:");
    }

    #[test]
    fn keeps_a_base_path_prefix() {
        let api = HttpBalancerApi::new("https://proxy.local/balancer", Duration::from_secs(5)).unwrap();
        assert_eq!(api.endpoint(&["guests", "locations"]).path(), "/balancer/api/guests/locations");
    }

    #[test]
    fn rejects_garbage_urls() {
        assert!(matches!(
            HttpBalancerApi::new("not a url", Duration::from_secs(5)),
            Err(BalancerError::InvalidUrl(_))
        ));
    }
}
