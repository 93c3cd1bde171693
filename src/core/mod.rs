pub mod cancel;
pub mod migration;
pub mod poller;
pub mod tracker;

// exports for lazy devs like us
pub use cancel::CancelOutcome;
pub use migration::{GuestId, GuestType, MigrationKey, MigrationProgress, MigrationRecord, MigrationStatus};
pub use poller::{PollOutcome, PollerConfig, PollerHandle, TaskPoller};
pub use tracker::{FailureIndicator, MigrationTracker, TrackerConfig};
