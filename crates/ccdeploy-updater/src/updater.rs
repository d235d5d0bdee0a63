//! Deployment updater: the control loop tick.
//!
//! Each call to [`DeploymentUpdater::update`] loads every `DEPLOYING` and
//! `CANCELING` deployment, hands one unit of work per deployment to a
//! worker pool bounded by a semaphore, and drains the pool before
//! returning. No worker outlives the tick that spawned it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use ccdeploy_instances::InstancesReporter;
use ccdeploy_state::{DeploymentId, DeploymentRecord, DeploymentState, LockTable, StateStore};

use crate::error::{DeployError, DeployResult};
use crate::manipulator::{DeploymentManipulator, StepOutcome};

/// Control loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Maximum deployments stepped concurrently within one tick.
    pub max_workers: usize,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self { max_workers: 50 }
    }
}

/// One unit of work for the pool, chosen by deployment state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Work {
    Scale(DeploymentId),
    Cancel(DeploymentId),
}

impl Work {
    /// The work a deployment needs, or `None` once it is terminal.
    pub fn for_deployment(deployment: &DeploymentRecord) -> Option<Self> {
        match deployment.state {
            DeploymentState::Deploying => Some(Self::Scale(deployment.id.clone())),
            DeploymentState::Canceling => Some(Self::Cancel(deployment.id.clone())),
            DeploymentState::Deployed | DeploymentState::Canceled => None,
        }
    }

    pub fn deployment_id(&self) -> &str {
        match self {
            Self::Scale(id) | Self::Cancel(id) => id,
        }
    }

    async fn run(&self, manipulator: &DeploymentManipulator) -> DeployResult<StepOutcome> {
        match self {
            Self::Scale(id) => manipulator.scale(id).await,
            Self::Cancel(id) => manipulator.cancel(id).await,
        }
    }
}

/// What one tick did, by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub scaled: usize,
    pub promoted: usize,
    pub canceled: usize,
    pub not_ready: usize,
    pub unavailable: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::ScaledUp { .. } => self.scaled += 1,
            StepOutcome::Promoted => self.promoted += 1,
            StepOutcome::Canceled => self.canceled += 1,
            StepOutcome::NotReady => self.not_ready += 1,
            StepOutcome::SchedulerUnavailable => self.unavailable += 1,
            StepOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Number of deployments the tick dispatched.
    pub fn total(&self) -> usize {
        self.scaled
            + self.promoted
            + self.canceled
            + self.not_ready
            + self.unavailable
            + self.skipped
            + self.failed
    }
}

/// Drives every in-flight deployment one step per tick.
pub struct DeploymentUpdater {
    store: StateStore,
    manipulator: Arc<DeploymentManipulator>,
    config: UpdaterConfig,
}

impl DeploymentUpdater {
    pub fn new(
        store: StateStore,
        locks: LockTable,
        reporter: InstancesReporter,
        config: UpdaterConfig,
    ) -> Self {
        let manipulator = DeploymentManipulator::new(store.clone(), locks, reporter);
        Self {
            store,
            manipulator: Arc::new(manipulator),
            config,
        }
    }

    /// Run one tick.
    ///
    /// A failing deployment is logged and counted in
    /// [`TickSummary::failed`]; it never stops its siblings. Only a failure
    /// to load the deployment sets fails the tick as a whole.
    pub async fn update(&self) -> DeployResult<TickSummary> {
        info!("run deployment update");

        let to_scale = self.store.list_deployments_in_state(DeploymentState::Deploying)?;
        let to_cancel = self.store.list_deployments_in_state(DeploymentState::Canceling)?;
        info!(
            scaling = to_scale.len(),
            canceling = to_cancel.len(),
            "dispatching deployments"
        );

        let work: Vec<Work> = to_scale
            .iter()
            .chain(to_cancel.iter())
            .filter_map(Work::for_deployment)
            .collect();

        let permits = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut workers = JoinSet::new();

        for item in work {
            // Submission waits here while the pool is saturated.
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| DeployError::WorkerPool(e.to_string()))?;
            let manipulator = Arc::clone(&self.manipulator);
            workers.spawn(async move {
                let result = item.run(&manipulator).await;
                drop(permit);
                (item, result)
            });
        }

        let mut summary = TickSummary::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((item, Ok(outcome))) => {
                    debug!(deployment = %item.deployment_id(), ?outcome, "deployment step finished");
                    summary.record(outcome);
                }
                Ok((item, Err(e))) => {
                    error!(deployment = %item.deployment_id(), error = %e, "deployment step failed");
                    summary.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "deployment worker aborted");
                    summary.failed += 1;
                }
            }
        }

        info!(
            scaled = summary.scaled,
            promoted = summary.promoted,
            canceled = summary.canceled,
            not_ready = summary.not_ready,
            unavailable = summary.unavailable,
            skipped = summary.skipped,
            failed = summary.failed,
            "deployment update finished"
        );
        Ok(summary)
    }

    /// Tick every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "deployment updater started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.update().await {
                        error!(error = %e, "deployment update failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("deployment updater shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(state: DeploymentState) -> DeploymentRecord {
        DeploymentRecord {
            id: "d1".to_string(),
            app_id: "app-1".to_string(),
            deploying_process_id: "p2".to_string(),
            original_process_instance_count: 2,
            droplet_id: None,
            previous_droplet_id: None,
            state,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[test]
    fn work_dispatch_by_state() {
        assert_eq!(
            Work::for_deployment(&deployment(DeploymentState::Deploying)),
            Some(Work::Scale("d1".to_string()))
        );
        assert_eq!(
            Work::for_deployment(&deployment(DeploymentState::Canceling)),
            Some(Work::Cancel("d1".to_string()))
        );
        assert_eq!(Work::for_deployment(&deployment(DeploymentState::Deployed)), None);
        assert_eq!(Work::for_deployment(&deployment(DeploymentState::Canceled)), None);
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut summary = TickSummary::default();
        summary.record(StepOutcome::ScaledUp {
            candidate_instances: 2,
        });
        summary.record(StepOutcome::Promoted);
        summary.record(StepOutcome::NotReady);
        summary.record(StepOutcome::Skipped);
        summary.failed += 1;
        assert_eq!(summary.scaled, 1);
        assert_eq!(summary.promoted, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total(), 5);
    }

    #[test]
    fn default_worker_cap() {
        assert_eq!(UpdaterConfig::default().max_workers, 50);
    }
}
