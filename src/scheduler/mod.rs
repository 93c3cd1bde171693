pub mod evacuation;

pub use evacuation::{
    BatchMigrationQueue, EvacuationOrchestrator, EvacuationPhase, EvacuationReport, EvacuationSession, ItemOutcome,
    QueuedMigration,
};
