//! Deployment manipulator: applies one step of the rollout state machine.
//!
//! A step locks the deployment, its app, the original process, and the
//! candidate process (always in that order), reads them fresh, decides,
//! and commits every resulting mutation in a single store transaction.
//! Any error drops the transaction uncommitted, leaving the deployment
//! exactly as it was for the next tick.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use ccdeploy_instances::{InstanceState, InstanceStatus, InstancesReporter};
use ccdeploy_state::*;

use crate::error::{DeployError, DeployResult};

/// What a single step did to its deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The deployment was no longer in the state the step applies to.
    Skipped,
    /// Candidate instances are not all running yet.
    NotReady,
    /// The scheduler could not be queried; retried next tick.
    SchedulerUnavailable,
    /// Candidate grew by one instance and the original shrank by one.
    ScaledUp { candidate_instances: u32 },
    /// Candidate became the web process; deployment is `DEPLOYED`.
    Promoted,
    /// Original restored and candidate destroyed; deployment is `CANCELED`.
    Canceled,
}

/// Steps individual deployments. Shared across workers of a tick.
pub struct DeploymentManipulator {
    store: StateStore,
    locks: LockTable,
    reporter: InstancesReporter,
}

impl DeploymentManipulator {
    pub fn new(store: StateStore, locks: LockTable, reporter: InstancesReporter) -> Self {
        Self {
            store,
            locks,
            reporter,
        }
    }

    /// Advance a `DEPLOYING` deployment by at most one instance, or promote
    /// its candidate once the captured target is reached.
    pub async fn scale(&self, deployment_id: &str) -> DeployResult<StepOutcome> {
        let _deployment_lock = self.locks.lock(deployment_id).await;
        let deployment = self.load_deployment(deployment_id)?;
        if deployment.state != DeploymentState::Deploying {
            debug!(deployment = %deployment_id, state = %deployment.state, "not deploying, skipping scale");
            return Ok(StepOutcome::Skipped);
        }

        let _app_lock = self.locks.lock(&deployment.app_id).await;
        let app = self.load_app(&deployment.app_id)?;
        let processes = self.store.list_processes_for_app(&app.id)?;

        let original_id = oldest_webish_except(&processes, &deployment.deploying_process_id)
            .map(|p| p.id.clone())
            .ok_or_else(|| DeployError::NoOriginalProcess(app.id.clone()))?;
        let _process_locks = self
            .locks
            .lock_in_order(&[original_id.as_str(), deployment.deploying_process_id.as_str()])
            .await;
        let original = self.load_process(&original_id)?;
        let candidate = self.load_process(&deployment.deploying_process_id)?;

        let statuses = match self.reporter.all_instances_for_process(&candidate).await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(
                    deployment = %deployment.id,
                    process = %candidate.id,
                    error = %e,
                    "instances unavailable, retrying next tick"
                );
                return Ok(StepOutcome::SchedulerUnavailable);
            }
        };

        if !ready_to_scale(&candidate, &statuses) {
            debug!(
                deployment = %deployment.id,
                desired = candidate.instances,
                "candidate instances not all running"
            );
            return Ok(StepOutcome::NotReady);
        }

        let target = deployment.original_process_instance_count;
        if candidate.instances < target {
            let candidate_instances = self.store.transaction(|txn| -> DeployResult<u32> {
                scale_down(txn, &original)?;
                let mut candidate = candidate.clone();
                candidate.instances += 1;
                candidate.updated_at = epoch_secs();
                txn.put_process(&candidate)?;
                Ok(candidate.instances)
            })?;

            info!(
                deployment = %deployment.id,
                candidate_instances,
                target,
                original = %original.id,
                "scaled deployment by one instance"
            );
            Ok(StepOutcome::ScaledUp {
                candidate_instances,
            })
        } else {
            self.store.transaction(|txn| {
                promote(txn, &app, &deployment, &candidate, &original, &processes)
            })?;
            info!(
                deployment = %deployment.id,
                app = %app.id,
                process = %candidate.id,
                "deployment promoted"
            );
            Ok(StepOutcome::Promoted)
        }
    }

    /// Roll a `CANCELING` deployment back to its original process.
    ///
    /// Does not consult the scheduler: once requested, cancellation runs to
    /// completion regardless of candidate health.
    pub async fn cancel(&self, deployment_id: &str) -> DeployResult<StepOutcome> {
        let _deployment_lock = self.locks.lock(deployment_id).await;
        let deployment = self.load_deployment(deployment_id)?;
        if deployment.state != DeploymentState::Canceling {
            debug!(deployment = %deployment_id, state = %deployment.state, "not canceling, skipping cancel");
            return Ok(StepOutcome::Skipped);
        }

        let _app_lock = self.locks.lock(&deployment.app_id).await;
        let app = self.load_app(&deployment.app_id)?;
        let processes = self.store.list_processes_for_app(&app.id)?;

        let candidate_id = deployment.deploying_process_id.as_str();
        let original_id = processes
            .iter()
            .find(|p| p.is_web() && p.id != candidate_id)
            .or_else(|| oldest_webish_except(&processes, candidate_id))
            .map(|p| p.id.clone())
            .ok_or_else(|| DeployError::NoOriginalProcess(app.id.clone()))?;
        let _process_locks = self
            .locks
            .lock_in_order(&[original_id.as_str(), candidate_id])
            .await;
        let original = self.load_process(&original_id)?;
        let candidate = self.store.get_process(candidate_id)?;

        self.store.transaction(|txn| -> DeployResult<()> {
            let mut original = original.clone();
            original.instances = deployment.original_process_instance_count;
            original.updated_at = epoch_secs();
            txn.put_process(&original)?;

            if let Some(candidate) = &candidate {
                if !candidate.is_web() {
                    txn.delete_route_mappings(&app.id, &candidate.process_type)?;
                }
                txn.delete_process(&candidate.id)?;
            }

            let mut deployment = deployment.clone();
            deployment.state = DeploymentState::Canceled;
            deployment.updated_at = epoch_secs();
            txn.put_deployment(&deployment)
                .map_err(DeployError::from)
        })?;

        info!(
            deployment = %deployment.id,
            app = %app.id,
            restored_instances = deployment.original_process_instance_count,
            "ran cancel deployment"
        );
        Ok(StepOutcome::Canceled)
    }

    fn load_deployment(&self, id: &str) -> DeployResult<DeploymentRecord> {
        self.store
            .get_deployment(id)?
            .ok_or_else(|| DeployError::DeploymentNotFound(id.to_string()))
    }

    fn load_app(&self, id: &str) -> DeployResult<AppRecord> {
        self.store
            .get_app(id)?
            .ok_or_else(|| DeployError::AppNotFound(id.to_string()))
    }

    fn load_process(&self, id: &str) -> DeployResult<ProcessRecord> {
        self.store
            .get_process(id)?
            .ok_or_else(|| DeployError::ProcessNotFound(id.to_string()))
    }
}

/// Oldest webish process of an app other than `exclude_id`.
///
/// `processes` must be sorted oldest first, as returned by
/// [`StateStore::list_processes_for_app`].
pub(crate) fn oldest_webish_except<'a>(
    processes: &'a [ProcessRecord],
    exclude_id: &str,
) -> Option<&'a ProcessRecord> {
    processes
        .iter()
        .find(|p| p.is_webish() && p.id != exclude_id)
}

/// Every desired candidate instance must report `RUNNING`.
fn ready_to_scale(candidate: &ProcessRecord, statuses: &BTreeMap<u32, InstanceStatus>) -> bool {
    let running = statuses
        .values()
        .filter(|s| s.state == InstanceState::Running)
        .count() as u32;
    running >= candidate.instances && statuses.values().all(|s| s.state == InstanceState::Running)
}

/// Shrink a replaced process by one instance, destroying it at its last one.
fn scale_down(txn: &StoreTxn, process: &ProcessRecord) -> StateResult<()> {
    if process.instances > 1 {
        let mut process = process.clone();
        process.instances -= 1;
        process.updated_at = epoch_secs();
        return txn.put_process(&process);
    }

    destroy_process(txn, process)
}

/// Destroy a process, along with its route mappings unless it holds the
/// `web` role (those mappings pass to whichever process is web next).
fn destroy_process(txn: &StoreTxn, process: &ProcessRecord) -> StateResult<()> {
    txn.delete_process(&process.id)?;
    if !process.is_web() {
        txn.delete_route_mappings(&process.app_id, &process.process_type)?;
    }
    Ok(())
}

fn promote(
    txn: &StoreTxn,
    app: &AppRecord,
    deployment: &DeploymentRecord,
    candidate: &ProcessRecord,
    original: &ProcessRecord,
    processes: &[ProcessRecord],
) -> DeployResult<()> {
    let now = epoch_secs();

    // The candidate takes over the web role and with it the web routes.
    txn.delete_route_mappings(&app.id, &candidate.process_type)?;
    let mut promoted = candidate.clone();
    promoted.process_type = WEB_PROCESS_TYPE.to_string();
    promoted.updated_at = now;
    txn.put_process(&promoted)?;

    destroy_process(txn, original)?;

    for interim in processes
        .iter()
        .filter(|p| p.is_webish() && p.id != candidate.id && p.id != original.id)
    {
        debug!(deployment = %deployment.id, process = %interim.id, "destroying interim process");
        destroy_process(txn, interim)?;
    }

    for process in processes.iter().filter(|p| !p.is_webish()) {
        restart_process(txn, app, process)?;
    }

    let mut deployment = deployment.clone();
    deployment.state = DeploymentState::Deployed;
    deployment.updated_at = now;
    txn.put_deployment(&deployment)?;
    Ok(())
}

/// Restart a started process onto the app's current droplet.
fn restart_process(txn: &StoreTxn, app: &AppRecord, process: &ProcessRecord) -> StateResult<()> {
    if !process.is_started() {
        return Ok(());
    }
    let mut restarted = process.clone();
    restarted.droplet_id = app.droplet_id.clone();
    restarted.restart_count += 1;
    restarted.updated_at = epoch_secs();
    debug!(process = %process.id, process_type = %process.process_type, "restarting process");
    txn.put_process(&restarted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(id: &str, process_type: &str, instances: u32, created_at: u64) -> ProcessRecord {
        ProcessRecord {
            id: id.to_string(),
            app_id: "app-1".to_string(),
            process_type: process_type.to_string(),
            state: ProcessState::Started,
            instances,
            droplet_id: None,
            restart_count: 0,
            created_at,
            updated_at: created_at,
        }
    }

    fn status(state: InstanceState) -> InstanceStatus {
        InstanceStatus {
            state,
            uptime: 50,
            since: 2,
            details: None,
        }
    }

    #[test]
    fn ready_when_every_instance_running() {
        let candidate = process("c", "web-deployment-d", 2, 2);
        let statuses = BTreeMap::from([
            (0, status(InstanceState::Running)),
            (1, status(InstanceState::Running)),
        ]);
        assert!(ready_to_scale(&candidate, &statuses));
    }

    #[test]
    fn not_ready_with_any_non_running_instance() {
        let candidate = process("c", "web-deployment-d", 3, 2);
        for other in [
            InstanceState::Starting,
            InstanceState::Crashed,
            InstanceState::Down,
            InstanceState::Unknown,
        ] {
            let statuses = BTreeMap::from([
                (0, status(InstanceState::Running)),
                (1, status(InstanceState::Running)),
                (2, status(other)),
            ]);
            assert!(!ready_to_scale(&candidate, &statuses), "{other:?} must block");
        }
    }

    #[test]
    fn not_ready_with_fewer_running_than_desired() {
        let candidate = process("c", "web-deployment-d", 3, 2);
        let statuses = BTreeMap::from([(0, status(InstanceState::Running))]);
        assert!(!ready_to_scale(&candidate, &statuses));
    }

    #[test]
    fn oldest_webish_skips_candidate_and_non_web() {
        let processes = vec![
            process("worker", "worker", 1, 1),
            process("c", "web-deployment-d", 1, 2),
            process("web", "web", 2, 3),
        ];
        let oldest = oldest_webish_except(&processes, "c").unwrap();
        assert_eq!(oldest.id, "web");
        assert!(oldest_webish_except(&processes[..2], "c").is_none());
    }

    #[test]
    fn scale_down_decrements_then_destroys() {
        let store = StateStore::open_in_memory().unwrap();
        let interim = process("interim", "web-deployment-old", 2, 1);
        store.put_process(&interim).unwrap();
        store
            .put_route_mapping(&RouteMapping {
                id: "m1".to_string(),
                app_id: "app-1".to_string(),
                route_id: "r1".to_string(),
                process_type: "web-deployment-old".to_string(),
            })
            .unwrap();

        store.transaction(|txn| scale_down(txn, &interim)).unwrap();
        let shrunk = store.get_process("interim").unwrap().unwrap();
        assert_eq!(shrunk.instances, 1);
        assert_eq!(store.list_route_mappings_for_app("app-1").unwrap().len(), 1);

        store.transaction(|txn| scale_down(txn, &shrunk)).unwrap();
        assert!(store.get_process("interim").unwrap().is_none());
        assert!(store.list_route_mappings_for_app("app-1").unwrap().is_empty());
    }

    #[test]
    fn destroying_web_process_keeps_web_routes() {
        let store = StateStore::open_in_memory().unwrap();
        let web = process("web", "web", 1, 1);
        store.put_process(&web).unwrap();
        store
            .put_route_mapping(&RouteMapping {
                id: "m1".to_string(),
                app_id: "app-1".to_string(),
                route_id: "r1".to_string(),
                process_type: "web".to_string(),
            })
            .unwrap();

        store.transaction(|txn| scale_down(txn, &web)).unwrap();
        assert!(store.get_process("web").unwrap().is_none());
        assert_eq!(store.list_route_mappings_for_app("app-1").unwrap().len(), 1);
    }
}
