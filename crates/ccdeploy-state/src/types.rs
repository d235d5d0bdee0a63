//! Domain types for the deployment record store.
//!
//! These types represent the persisted state of applications, their
//! processes, rolling deployments, and route mappings. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for an application.
pub type AppId = String;

/// Unique identifier for a process.
pub type ProcessId = String;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Process type of the primary web role.
pub const WEB_PROCESS_TYPE: &str = "web";

/// Prefix of the interim process types created for in-flight deployments.
pub const DEPLOYMENT_PROCESS_TYPE_PREFIX: &str = "web-deployment-";

/// Whether a process type serves web traffic: the `web` role itself or an
/// interim deployment process standing in for it.
pub fn is_webish(process_type: &str) -> bool {
    process_type == WEB_PROCESS_TYPE || process_type.starts_with(DEPLOYMENT_PROCESS_TYPE_PREFIX)
}

/// Process type assigned to the candidate process of a deployment.
pub fn deployment_process_type(deployment_id: &str) -> String {
    format!("{DEPLOYMENT_PROCESS_TYPE_PREFIX}{deployment_id}")
}

// ── App ───────────────────────────────────────────────────────────

/// An application owning a set of processes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppRecord {
    pub id: AppId,
    pub name: String,
    /// Release artifact the app currently runs.
    pub droplet_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Process ───────────────────────────────────────────────────────

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Stopped,
    Started,
}

/// A workload unit: a group of identical instances of one process type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub app_id: AppId,
    /// `web`, `worker`, ... or `web-deployment-<deployment id>`.
    pub process_type: String,
    pub state: ProcessState,
    /// Desired instance count.
    pub instances: u32,
    /// Release artifact this process was last started with.
    pub droplet_id: Option<String>,
    pub restart_count: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ProcessRecord {
    pub fn is_web(&self) -> bool {
        self.process_type == WEB_PROCESS_TYPE
    }

    pub fn is_webish(&self) -> bool {
        is_webish(&self.process_type)
    }

    pub fn is_started(&self) -> bool {
        self.state == ProcessState::Started
    }

    /// Ordering key used to find the oldest process of an app.
    pub fn age_key(&self) -> (u64, &str) {
        (self.created_at, self.id.as_str())
    }
}

// ── Deployment ────────────────────────────────────────────────────

/// Rollout state of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    Deploying,
    Deployed,
    Canceling,
    Canceled,
}

impl DeploymentState {
    /// Whether the control loop still has work to do for this state.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Deploying | Self::Canceling)
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deploying => "DEPLOYING",
            Self::Deployed => "DEPLOYED",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// One rollout of an application from its running process to a new one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub app_id: AppId,
    /// The candidate process being scaled up.
    pub deploying_process_id: ProcessId,
    /// Web instance count captured when the rollout started; the scale target.
    pub original_process_instance_count: u32,
    pub droplet_id: Option<String>,
    pub previous_droplet_id: Option<String>,
    pub state: DeploymentState,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Route mapping ─────────────────────────────────────────────────

/// Binds a route to every process of one type within an app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteMapping {
    pub id: String,
    pub app_id: AppId,
    pub route_id: String,
    pub process_type: String,
}

impl RouteMapping {
    pub fn targets(&self, app_id: &str, process_type: &str) -> bool {
        self.app_id == app_id && self.process_type == process_type
    }
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
