//! Instances reporter: canonical per-index status for a process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use ccdeploy_state::ProcessRecord;

use crate::client::{ActualInstance, InstancesClient, SchedulerState};
use crate::error::InstancesError;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Platform-normalized state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Running,
    Starting,
    Crashed,
    Down,
    Unknown,
}

/// Status of one instance index at the time of the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub state: InstanceState,
    /// Seconds since the instance entered its state.
    pub uptime: u64,
    /// Unix seconds at which the instance entered its state.
    pub since: u64,
    /// Placement error reported by the scheduler, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl InstanceStatus {
    fn down() -> Self {
        Self {
            state: InstanceState::Down,
            uptime: 0,
            since: 0,
            details: None,
        }
    }
}

/// A crashed instance, as listed by [`InstancesReporter::crashed_instances`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashedInstance {
    pub index: u32,
    pub instance_id: Option<String>,
    pub uptime: u64,
    pub since: u64,
}

/// Translate a scheduler state into the canonical state set.
pub fn translate_state(instance: &ActualInstance) -> InstanceState {
    match instance.state {
        SchedulerState::Running => InstanceState::Running,
        SchedulerState::Claimed => InstanceState::Starting,
        SchedulerState::Unclaimed => {
            if has_placement_error(instance) {
                InstanceState::Down
            } else {
                InstanceState::Starting
            }
        }
        SchedulerState::Crashed => InstanceState::Crashed,
        SchedulerState::Unknown => InstanceState::Unknown,
    }
}

fn has_placement_error(instance: &ActualInstance) -> bool {
    instance
        .placement_error
        .as_deref()
        .is_some_and(|e| !e.trim().is_empty())
}

/// Reports live instance status for processes via the scheduler client.
#[derive(Clone)]
pub struct InstancesReporter {
    client: Arc<dyn InstancesClient>,
}

impl InstancesReporter {
    pub fn new(client: Arc<dyn InstancesClient>) -> Self {
        Self { client }
    }

    /// Status of every index in `0..process.instances`.
    ///
    /// Indices the scheduler does not report are filled in as `DOWN`;
    /// indices at or beyond the desired count are ignored. Any scheduler
    /// failure is returned as [`InstancesError::Unavailable`].
    pub async fn all_instances_for_process(
        &self,
        process: &ProcessRecord,
    ) -> Result<BTreeMap<u32, InstanceStatus>, InstancesError> {
        let actual = self
            .client
            .actual_instances(process)
            .await
            .map_err(|e| {
                error!(process = %process.id, error = %e, "all_instances_for_process failed");
                e.into_unavailable()
            })?;
        Ok(collect_statuses(process, &actual, now_nanos()))
    }

    /// Count of distinct in-range indices that are running or starting.
    ///
    /// Stopped processes count as zero without asking the scheduler. Returns
    /// `None` when the count cannot be determined.
    pub async fn number_of_starting_and_running_instances(
        &self,
        process: &ProcessRecord,
    ) -> Option<u32> {
        if !process.is_started() {
            return Some(0);
        }

        match self.client.actual_instances(process).await {
            Ok(actual) => {
                let indices: BTreeSet<u32> = actual
                    .iter()
                    .filter(|i| i.index < process.instances)
                    .filter(|i| {
                        matches!(
                            translate_state(i),
                            InstanceState::Running | InstanceState::Starting
                        )
                    })
                    .map(|i| i.index)
                    .collect();
                Some(indices.len() as u32)
            }
            Err(e) => {
                error!(process = %process.id, error = %e, "starting/running count failed");
                None
            }
        }
    }

    /// In-range instances the scheduler reports as crashed.
    pub async fn crashed_instances(
        &self,
        process: &ProcessRecord,
    ) -> Result<Vec<CrashedInstance>, InstancesError> {
        let actual = self
            .client
            .actual_instances(process)
            .await
            .map_err(|e| {
                error!(process = %process.id, error = %e, "crashed_instances failed");
                e.into_unavailable()
            })?;

        Ok(actual
            .into_iter()
            .filter(|i| i.state == SchedulerState::Crashed && i.index < process.instances)
            .map(|i| CrashedInstance {
                index: i.index,
                instance_id: i.instance_id,
                uptime: 0,
                since: i.since / NANOS_PER_SEC,
            })
            .collect())
    }
}

fn collect_statuses(
    process: &ProcessRecord,
    actual: &[ActualInstance],
    now_ns: u64,
) -> BTreeMap<u32, InstanceStatus> {
    let mut statuses = BTreeMap::new();

    for instance in actual.iter().filter(|i| i.index < process.instances) {
        let status = InstanceStatus {
            state: translate_state(instance),
            uptime: now_ns.saturating_sub(instance.since) / NANOS_PER_SEC,
            since: instance.since / NANOS_PER_SEC,
            details: instance
                .placement_error
                .clone()
                .filter(|e| !e.trim().is_empty()),
        };
        statuses.insert(instance.index, status);
    }

    for index in 0..process.instances {
        statuses.entry(index).or_insert_with(|| {
            debug!(process = %process.id, index, "instance unreported, marking down");
            InstanceStatus::down()
        });
    }

    statuses
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}
