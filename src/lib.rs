pub mod api;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod errors;
pub mod scheduler;
pub mod utils;

// Re-exports
pub use crate::api::{BalancerApi, HttpBalancerApi};
pub use crate::cluster::ClusterMirror;
pub use crate::core::{MigrationKey, MigrationStatus, MigrationTracker, TrackerConfig};
pub use crate::errors::{BalancerError, BalancerResult};
pub use crate::scheduler::{EvacuationOrchestrator, EvacuationSession};
