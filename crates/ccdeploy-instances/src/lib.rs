//! ccdeploy-instances: live instance status for rolling deployments.
//!
//! Queries the external workload scheduler for the instances of one
//! process and normalizes the scheduler's vocabulary into a small
//! canonical state set.
//!
//! # Architecture
//!
//! ```text
//! InstancesReporter
//!   ├── Arc<dyn InstancesClient> → Vec<ActualInstance>   (scheduler states)
//!   ├── translate_state()        → InstanceState         (canonical states)
//!   └── fill unreported indices with DOWN
//! ```
//!
//! Any client failure surfaces as [`InstancesError::Unavailable`]; callers
//! never see partial data.

pub mod client;
pub mod error;
pub mod reporter;

pub use client::{ActualInstance, HttpInstancesClient, InstancesClient, SchedulerState};
pub use error::InstancesError;
pub use reporter::{translate_state, CrashedInstance, InstanceState, InstanceStatus, InstancesReporter};
