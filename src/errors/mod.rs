use thiserror::Error;

#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("Tracking Error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Evacuation Error: {0}")]
    Evacuation(#[from] EvacuationError),

    #[error("Transport Error: {0}")]
    Transport(#[from] reqwest::Error),

    // server-provided message, shown verbatim
    #[error("{0}")]
    Remote(String),

    #[error("Unexpected response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Configuration Error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),
}

impl BalancerError {
    /// True when the error was raised locally, before any remote call was made.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            BalancerError::Tracking(TrackingError::NotTracked { .. })
                | BalancerError::Evacuation(_)
                | BalancerError::Config(_)
                | BalancerError::InvalidUrl(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackingError {
    #[error("migration info not found for guest {guest_id} -> {target_node}")]
    NotTracked {
        guest_id: u32,
        target_node: String,
    },

    #[error("migration of guest {guest_id} -> {target_node} was re-registered while task {stopped_task} was being stopped; the new task is still running")]
    Superseded {
        guest_id: u32,
        target_node: String,
        stopped_task: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvacuationError {
    #[error("evacuation of {node} is {found}, expected {expected}")]
    InvalidPhase {
        node: String,
        expected: String,
        found: String,
    },

    #[error("guest {guest_id} is not part of the plan")]
    UnknownGuest {
        guest_id: u32,
    },

    #[error("node {target_node} is not an available target")]
    UnknownTarget {
        target_node: String,
    },

    #[error("guest {guest_id} has no target node to migrate to")]
    MissingTarget {
        guest_id: u32,
    },
}

// Error context for tracking error chain
#[derive(Debug)]
pub struct ErrorContext {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub source_location: &'static str,
    pub operation: String,
}

pub type BalancerResult<T> = Result<T, BalancerError>;

// Logs the failed operation and hands the error back untouched
#[macro_export]
macro_rules! with_context {
    ($result:expr, $operation:expr) => {
        $result.map_err(|e| {
            let context = $crate::errors::ErrorContext {
                timestamp: chrono::Utc::now(),
                source_location: std::file!(),
                operation: $operation.to_string(),
            };
            tracing::error!(
                error = e.to_string(),
                context = ?context,
                "Operation failed"
            );
            e
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_tracked_reads_like_the_operator_message() {
        let err: BalancerError = TrackingError::NotTracked {
            guest_id: 101,
            target_node: "nodeB".into(),
        }
        .into();
        assert!(err.to_string().contains("migration info not found"));
        assert!(err.is_local());
    }

    #[test]
    fn superseded_cancel_is_not_local() {
        let err: BalancerError = TrackingError::Superseded {
            guest_id: 101,
            target_node: "nodeB".into(),
            stopped_task: "task-1".into(),
        }
        .into();
        assert!(!err.is_local());
        assert!(err.to_string().contains("still running"));
    }

    #[test]
    fn remote_errors_are_verbatim() {
        let err = BalancerError::Remote("node is in maintenance".into());
        assert_eq!(err.to_string(), "node is in maintenance");
        assert!(!err.is_local());
    }
}
