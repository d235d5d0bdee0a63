//! Deployment actions: starting a rollout and requesting its cancellation.
//!
//! These are the only writers of deployment rows besides the manipulator.
//! They take the same entity locks in the same order, so they serialize
//! cleanly against in-flight ticks.

use tracing::{debug, info};
use uuid::Uuid;

use ccdeploy_state::*;

use crate::error::{DeployError, DeployResult};

/// Creates deployments and requests their cancellation.
#[derive(Clone)]
pub struct DeploymentActions {
    store: StateStore,
    locks: LockTable,
}

impl DeploymentActions {
    pub fn new(store: StateStore, locks: LockTable) -> Self {
        Self { store, locks }
    }

    /// Start rolling `app_id` onto `droplet_id` (or its current droplet).
    ///
    /// A deployment already `DEPLOYING` for the app is superseded: it is
    /// marked `DEPLOYED`, its candidate is left to be cleaned up at the next
    /// promotion, and its captured instance count carries over. The new
    /// candidate process starts with one instance.
    pub async fn create(
        &self,
        app_id: &str,
        droplet_id: Option<&str>,
    ) -> DeployResult<DeploymentRecord> {
        let (previous, _locks) = self.lock_for_create(app_id).await?;

        let app = self
            .store
            .get_app(app_id)?
            .ok_or_else(|| DeployError::AppNotFound(app_id.to_string()))?;
        let processes = self.store.list_processes_for_app(app_id)?;
        let web_process = processes
            .iter()
            .find(|p| p.is_webish())
            .ok_or_else(|| DeployError::NoWebProcess(app_id.to_string()))?;

        let desired_instances = previous
            .as_ref()
            .map(|d| d.original_process_instance_count)
            .unwrap_or(web_process.instances);

        let now = epoch_secs();
        // Keep the candidate strictly younger than every process it replaces.
        let created_at = processes
            .iter()
            .map(|p| p.created_at + 1)
            .max()
            .unwrap_or(now)
            .max(now);

        let mut app = app;
        let previous_droplet_id = app.droplet_id.clone();
        if let Some(droplet_id) = droplet_id {
            app.droplet_id = Some(droplet_id.to_string());
            app.updated_at = now;
        }

        let deployment_id = Uuid::new_v4().to_string();
        let candidate = ProcessRecord {
            id: Uuid::new_v4().to_string(),
            app_id: app.id.clone(),
            process_type: deployment_process_type(&deployment_id),
            state: ProcessState::Started,
            instances: 1,
            droplet_id: app.droplet_id.clone(),
            restart_count: 0,
            created_at,
            updated_at: created_at,
        };
        let deployment = DeploymentRecord {
            id: deployment_id,
            app_id: app.id.clone(),
            deploying_process_id: candidate.id.clone(),
            original_process_instance_count: desired_instances,
            droplet_id: app.droplet_id.clone(),
            previous_droplet_id,
            state: DeploymentState::Deploying,
            created_at: now,
            updated_at: now,
        };

        // The candidate serves the web routes alongside the original.
        let candidate_routes: Vec<RouteMapping> = self
            .store
            .list_route_mappings_for_app(&app.id)?
            .into_iter()
            .filter(|m| m.process_type == web_process.process_type)
            .map(|m| RouteMapping {
                id: Uuid::new_v4().to_string(),
                app_id: m.app_id,
                route_id: m.route_id,
                process_type: candidate.process_type.clone(),
            })
            .collect();

        self.store.transaction(|txn| -> DeployResult<()> {
            txn.put_app(&app)?;
            if let Some(previous) = &previous {
                let mut superseded = previous.clone();
                superseded.state = DeploymentState::Deployed;
                superseded.updated_at = now;
                txn.put_deployment(&superseded)?;
            }
            txn.put_process(&candidate)?;
            for mapping in &candidate_routes {
                txn.put_route_mapping(mapping)?;
            }
            txn.put_deployment(&deployment)?;
            Ok(())
        })?;

        info!(
            deployment = %deployment.id,
            app = %app.id,
            target = desired_instances,
            routes = candidate_routes.len(),
            superseded = previous.is_some(),
            "created deployment"
        );
        Ok(deployment)
    }

    /// Lock the app's `DEPLOYING` deployment (if any) and then the app.
    ///
    /// The set of active deployments is re-read under the locks; if it moved
    /// since the unlocked read, the locks are released and taken again.
    async fn lock_for_create(
        &self,
        app_id: &str,
    ) -> DeployResult<(Option<DeploymentRecord>, Vec<EntityLock>)> {
        let mut seen = self.store.list_deployments_for_app(app_id)?;
        loop {
            let previous_id = seen
                .iter()
                .find(|d| d.state == DeploymentState::Deploying)
                .map(|d| d.id.clone());

            let mut held = Vec::with_capacity(2);
            if let Some(id) = &previous_id {
                held.push(self.locks.lock(id).await);
            }
            held.push(self.locks.lock(app_id).await);

            let current = self.store.list_deployments_for_app(app_id)?;
            if active_ids(&current) != active_ids(&seen) {
                debug!(app = %app_id, "active deployments changed, relocking");
                drop(held);
                seen = current;
                continue;
            }

            if current.iter().any(|d| d.state == DeploymentState::Canceling) {
                return Err(DeployError::CancelInProgress(app_id.to_string()));
            }
            let previous = current
                .into_iter()
                .find(|d| d.state == DeploymentState::Deploying);
            return Ok((previous, held));
        }
    }

    /// Ask the control loop to cancel a deployment on its next tick.
    ///
    /// Only `DEPLOYING` deployments may be canceled; requesting it again
    /// while `CANCELING` is a no-op.
    pub async fn request_cancel(&self, deployment_id: &str) -> DeployResult<DeploymentRecord> {
        let _lock = self.locks.lock(deployment_id).await;
        let mut deployment = self
            .store
            .get_deployment(deployment_id)?
            .ok_or_else(|| DeployError::DeploymentNotFound(deployment_id.to_string()))?;

        match deployment.state {
            DeploymentState::Canceling => Ok(deployment),
            DeploymentState::Deploying => {
                deployment.state = DeploymentState::Canceling;
                deployment.updated_at = epoch_secs();
                self.store.put_deployment(&deployment)?;
                info!(deployment = %deployment.id, app = %deployment.app_id, "cancel requested");
                Ok(deployment)
            }
            from @ (DeploymentState::Deployed | DeploymentState::Canceled) => {
                Err(DeployError::InvalidTransition {
                    from,
                    action: "cancel",
                })
            }
        }
    }
}

fn active_ids(deployments: &[DeploymentRecord]) -> Vec<&str> {
    let mut ids: Vec<&str> = deployments
        .iter()
        .filter(|d| d.state.is_active())
        .map(|d| d.id.as_str())
        .collect();
    ids.sort_unstable();
    ids
}
