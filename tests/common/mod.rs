// Scripted in-memory stand-in for the balancer service
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use proxmigrate::api::{
    BalancerApi, ClusterTopology, EvacuationPlan, EvacuationRequest, GuestLocation, MigrationStarted, NodeSummary,
    TaskState, TaskStatus,
};
use proxmigrate::core::{GuestId, GuestType, MigrationProgress, MigrationTracker, TrackerConfig};
use proxmigrate::{BalancerError, BalancerResult};

/// One poll cycle as the remote side answers it.
#[derive(Debug, Clone)]
pub struct FakePoll {
    pub status: TaskStatus,
    pub migrating: bool,
}

impl FakePoll {
    pub fn running(percentage: f64) -> Self {
        Self {
            status: TaskStatus {
                status: TaskState::Running,
                exit_status: None,
                progress: Some(MigrationProgress {
                    percentage,
                    speed: Some(100.0),
                    human_readable: Some("100 MiB/s".into()),
                    total_human_readable: Some("4 GiB".into()),
                }),
            },
            migrating: true,
        }
    }

    pub fn running_without_progress() -> Self {
        Self {
            status: TaskStatus {
                status: TaskState::Running,
                exit_status: None,
                progress: None,
            },
            migrating: true,
        }
    }

    pub fn done() -> Self {
        Self {
            status: TaskStatus {
                status: TaskState::Stopped,
                exit_status: Some("OK".into()),
                progress: None,
            },
            migrating: false,
        }
    }

    pub fn aborted(exit: &str) -> Self {
        Self {
            status: TaskStatus {
                status: TaskState::Stopped,
                exit_status: Some(exit.into()),
                progress: None,
            },
            migrating: false,
        }
    }
}

#[derive(Default)]
struct FakeState {
    // per task; the last entry repeats forever
    scripts: HashMap<String, VecDeque<FakePoll>>,
    // handed to the next task started for that guest
    guest_scripts: HashMap<GuestId, Vec<FakePoll>>,
    current: HashMap<GuestId, FakePoll>,
    tasks: HashMap<String, GuestId>,
    locations: HashMap<GuestId, GuestLocation>,
    topology: ClusterTopology,
    plan: Option<EvacuationPlan>,
    stop_error: Option<String>,
    start_errors: HashMap<GuestId, String>,
    // per operation ("status", "migrating", "location", "stop"): failures left, and latency
    call_failures: HashMap<&'static str, usize>,
    delays: HashMap<&'static str, Duration>,
    in_flight: HashSet<GuestId>,
    max_in_flight: usize,
    calls: Vec<String>,
    poll_times: Vec<Instant>,
    evacuations: Vec<EvacuationRequest>,
}

#[derive(Clone, Default)]
pub struct FakeApi {
    state: Arc<Mutex<FakeState>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Nodes and guests the refresh endpoint reports; also the initial guest locations.
    pub fn with_cluster(self, nodes: &[&str], guests: &[(GuestId, &str)]) -> Self {
        {
            let mut state = self.state();
            state.topology = ClusterTopology {
                guests: guests
                    .iter()
                    .map(|(id, node)| (*id, location(node)))
                    .collect(),
                nodes: nodes
                    .iter()
                    .map(|n| (n.to_string(), NodeSummary::default()))
                    .collect(),
            };
            for (id, node) in guests {
                state.locations.insert(*id, location(node));
            }
        }
        self
    }

    pub fn script(&self, task_id: &str, guest_id: GuestId, polls: Vec<FakePoll>) {
        let mut state = self.state();
        state.tasks.insert(task_id.to_string(), guest_id);
        state.scripts.insert(task_id.to_string(), polls.into());
    }

    pub fn script_guest(&self, guest_id: GuestId, polls: Vec<FakePoll>) {
        self.state().guest_scripts.insert(guest_id, polls);
    }

    pub fn set_location(&self, guest_id: GuestId, node: &str) {
        self.state().locations.insert(guest_id, location(node));
    }

    pub fn move_in_topology(&self, guest_id: GuestId, node: &str) {
        self.state().topology.guests.insert(guest_id, location(node));
    }

    pub fn set_plan(&self, plan: EvacuationPlan) {
        self.state().plan = Some(plan);
    }

    pub fn fail_stop(&self, message: &str) {
        self.state().stop_error = Some(message.to_string());
    }

    pub fn fail_start(&self, guest_id: GuestId, message: &str) {
        self.state().start_errors.insert(guest_id, message.to_string());
    }

    /// Fails the next `times` calls of `op` with a transport-style error.
    pub fn fail_next(&self, op: &'static str, times: usize) {
        self.state().call_failures.insert(op, times);
    }

    /// Every call of `op` takes `delay` before it answers.
    pub fn delay(&self, op: &'static str, delay: Duration) {
        self.state().delays.insert(op, delay);
    }

    /// Overrides what the migrating flag reports until the next successful status poll.
    pub fn set_migrating(&self, guest_id: GuestId, migrating: bool) {
        self.state()
            .current
            .entry(guest_id)
            .or_insert_with(FakePoll::running_without_progress)
            .migrating = migrating;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.state().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn poll_times(&self) -> Vec<Instant> {
        self.state().poll_times.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    pub fn evacuations(&self) -> Vec<EvacuationRequest> {
        self.state().evacuations.clone()
    }
}

pub fn location(node: &str) -> GuestLocation {
    GuestLocation {
        node: node.to_string(),
        status: "running".into(),
    }
}

pub fn test_config() -> TrackerConfig {
    TrackerConfig {
        poll_interval: Duration::from_secs(3),
        max_wait: Duration::from_secs(60),
        completion_display: Duration::from_secs(5),
        max_failures: 16,
    }
}

/// Tracker over `api` with its mirror already loaded from the fake topology.
pub async fn tracker_for(api: &FakeApi) -> MigrationTracker {
    let tracker = MigrationTracker::new(Arc::new(api.clone()), test_config());
    tracker.refresh_from_remote().await.unwrap();
    tracker
}

impl FakeApi {
    // Logs the call as issued, waits out the configured latency, then applies injected failures.
    async fn enter(&self, op: &'static str, call: String) -> BalancerResult<()> {
        let delay = {
            let mut state = self.state();
            state.calls.push(call);
            if op == "status" {
                state.poll_times.push(Instant::now());
            }
            state.delays.get(op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(left) = state.call_failures.get_mut(op).filter(|left| **left > 0) {
            *left -= 1;
            return Err(BalancerError::Remote(format!("{} endpoint unavailable", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl BalancerApi for FakeApi {
    async fn start_migration(
        &self,
        source_node: &str,
        guest_id: GuestId,
        target_node: &str,
        _guest_type: GuestType,
    ) -> BalancerResult<MigrationStarted> {
        let mut state = self.state();
        state.calls.push(format!("start:{}->{}", guest_id, target_node));
        if let Some(message) = state.start_errors.get(&guest_id) {
            return Err(BalancerError::Remote(message.clone()));
        }

        let task_id = format!("UPID:{}:{}:qmigrate", source_node, guest_id);
        state.tasks.insert(task_id.clone(), guest_id);
        if let Some(polls) = state.guest_scripts.remove(&guest_id) {
            state.scripts.insert(task_id.clone(), polls.into());
        }
        state.in_flight.insert(guest_id);
        let in_flight = state.in_flight.len();
        state.max_in_flight = state.max_in_flight.max(in_flight);
        Ok(MigrationStarted {
            task_id,
            source_node: source_node.to_string(),
            target_node: target_node.to_string(),
        })
    }

    async fn get_task_status(&self, _node: &str, task_id: &str) -> BalancerResult<TaskStatus> {
        self.enter("status", format!("status:{}", task_id)).await?;
        let mut state = self.state();
        let guest_id = *state
            .tasks
            .get(task_id)
            .ok_or_else(|| BalancerError::Remote(format!("no such task {}", task_id)))?;

        let poll = match state.scripts.get_mut(task_id) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or_else(FakePoll::done),
            Some(script) => script.front().cloned().unwrap_or_else(FakePoll::done),
            None => FakePoll::done(),
        };
        state.current.insert(guest_id, poll.clone());
        Ok(poll.status)
    }

    async fn is_guest_migrating(&self, guest_id: GuestId) -> BalancerResult<bool> {
        self.enter("migrating", format!("migrating:{}", guest_id)).await?;
        let mut state = self.state();
        let migrating = state.current.get(&guest_id).map_or(true, |poll| poll.migrating);
        if !migrating {
            state.in_flight.remove(&guest_id);
        }
        Ok(migrating)
    }

    async fn get_guest_location(&self, guest_id: GuestId) -> BalancerResult<GuestLocation> {
        self.enter("location", format!("location:{}", guest_id)).await?;
        self.state()
            .locations
            .get(&guest_id)
            .cloned()
            .ok_or_else(|| BalancerError::Remote(format!("guest {} not found", guest_id)))
    }

    async fn stop_task(&self, node: &str, task_id: &str) -> BalancerResult<()> {
        self.enter("stop", format!("stop:{}:{}", node, task_id)).await?;
        match self.state().stop_error.clone() {
            Some(message) => Err(BalancerError::Remote(message)),
            None => Ok(()),
        }
    }

    async fn request_evacuation_plan(
        &self,
        node: &str,
        _maintenance_nodes: &[String],
    ) -> BalancerResult<EvacuationPlan> {
        let mut state = self.state();
        state.calls.push(format!("plan:{}", node));
        state
            .plan
            .clone()
            .ok_or_else(|| BalancerError::Remote("planner unavailable".into()))
    }

    async fn execute_evacuation(&self, request: &EvacuationRequest) -> BalancerResult<()> {
        let mut state = self.state();
        state.calls.push(format!("evacuate:{}", request.node));
        state.evacuations.push(request.clone());
        Ok(())
    }

    async fn refresh_guest_locations(&self) -> BalancerResult<ClusterTopology> {
        let mut state = self.state();
        state.calls.push("refresh".to_string());
        Ok(state.topology.clone())
    }
}
