//! ccdeploy-updater: rolling deployments, one instance at a time.
//!
//! This crate advances applications from their running process to a new
//! candidate process. Each control-loop tick loads every in-flight
//! deployment and applies one step of the rollout state machine to each,
//! in parallel, up to a fixed worker cap.
//!
//! # Components
//!
//! - **`manipulator`**: per-deployment state machine (scale, promote, cancel)
//! - **`updater`**: the tick: load, fan out to a bounded pool, drain
//! - **`actions`**: creating deployments and requesting cancellation
//!
//! # Rollout cadence
//!
//! ```text
//! DEPLOYING ──(all candidate instances RUNNING, candidate < target)──▶ candidate +1, original -1
//!     │
//!     ├──(all candidate instances RUNNING, candidate == target)──▶ promote ──▶ DEPLOYED
//!     │
//!     └──(cancel requested)──▶ CANCELING ──▶ restore original, destroy candidate ──▶ CANCELED
//! ```

pub mod actions;
pub mod error;
pub mod manipulator;
pub mod updater;

pub use actions::DeploymentActions;
pub use error::{DeployError, DeployResult};
pub use manipulator::{DeploymentManipulator, StepOutcome};
pub use updater::{DeploymentUpdater, TickSummary, UpdaterConfig, Work};
