//! Instance reporting error types.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while querying the scheduler for instance state.
#[derive(Debug, Error)]
pub enum InstancesError {
    /// The scheduler could not provide instance information. Every other
    /// variant is folded into this one by the reporter.
    #[error("instances information unavailable: {0}")]
    Unavailable(String),

    #[error("scheduler connection failed: {0}")]
    Transport(String),

    #[error("scheduler responded with status {0}")]
    Status(u16),

    #[error("invalid scheduler response: {0}")]
    Decode(String),

    #[error("scheduler request timed out after {0:?}")]
    Timeout(Duration),
}

impl InstancesError {
    /// Convert into `Unavailable`, leaving an existing `Unavailable` untouched.
    pub fn into_unavailable(self) -> Self {
        match self {
            Self::Unavailable(_) => self,
            other => Self::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_passes_through_unchanged() {
        let err = InstancesError::Unavailable("bbs down".to_string()).into_unavailable();
        assert_eq!(err.to_string(), "instances information unavailable: bbs down");
    }

    #[test]
    fn other_errors_wrapped() {
        let err = InstancesError::Status(503).into_unavailable();
        match err {
            InstancesError::Unavailable(msg) => assert!(msg.contains("503")),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }
}
