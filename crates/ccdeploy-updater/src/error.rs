//! Deployment orchestration error types.

use thiserror::Error;

use ccdeploy_state::{DeploymentState, StateError};

/// Errors that can occur while stepping or managing a deployment.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("process not found: {0}")]
    ProcessNotFound(String),

    #[error("app {0} has no web process")]
    NoWebProcess(String),

    #[error("app {0} has no original process to replace")]
    NoOriginalProcess(String),

    #[error("app {0} already has a deployment being canceled")]
    CancelInProgress(String),

    #[error("cannot {action} a deployment in state {from}")]
    InvalidTransition {
        from: DeploymentState,
        action: &'static str,
    },

    #[error("worker pool error: {0}")]
    WorkerPool(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type DeployResult<T> = Result<T, DeployError>;
