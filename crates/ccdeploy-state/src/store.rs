//! StateStore: redb-backed persistence for the deployment orchestrator.
//!
//! Provides typed reads over apps, processes, deployments, and route
//! mappings, plus [`StateStore::transaction`] for all-or-nothing multi-row
//! updates. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(PROCESSES).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(ROUTE_MAPPINGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside a single write transaction.
    ///
    /// Every write made through the [`StoreTxn`] is committed together when
    /// `f` returns `Ok`. If `f` returns an error the transaction is dropped
    /// uncommitted and nothing is written.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&StoreTxn) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let txn = StoreTxn { txn };
        let out = f(&txn)?;
        txn.txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }

    fn get_row<T: DeserializeOwned>(&self, def: RowTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_row(&table, key)
    }

    fn list_rows<T: DeserializeOwned>(
        &self,
        def: RowTable,
        keep: impl Fn(&T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&row) {
                results.push(row);
            }
        }
        Ok(results)
    }

    // ── Apps ───────────────────────────────────────────────────────

    pub fn put_app(&self, app: &AppRecord) -> StateResult<()> {
        self.transaction(|txn| txn.put_app(app))
    }

    pub fn get_app(&self, id: &str) -> StateResult<Option<AppRecord>> {
        self.get_row(APPS, id)
    }

    // ── Processes ──────────────────────────────────────────────────

    pub fn put_process(&self, process: &ProcessRecord) -> StateResult<()> {
        self.transaction(|txn| txn.put_process(process))
    }

    pub fn get_process(&self, id: &str) -> StateResult<Option<ProcessRecord>> {
        self.get_row(PROCESSES, id)
    }

    /// List every process of an app, oldest first.
    pub fn list_processes_for_app(&self, app_id: &str) -> StateResult<Vec<ProcessRecord>> {
        let mut processes = self.list_rows(PROCESSES, |p: &ProcessRecord| p.app_id == app_id)?;
        processes.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
        Ok(processes)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn put_deployment(&self, deployment: &DeploymentRecord) -> StateResult<()> {
        self.transaction(|txn| txn.put_deployment(deployment))
    }

    pub fn get_deployment(&self, id: &str) -> StateResult<Option<DeploymentRecord>> {
        self.get_row(DEPLOYMENTS, id)
    }

    /// List all deployments currently in `state`.
    pub fn list_deployments_in_state(
        &self,
        state: DeploymentState,
    ) -> StateResult<Vec<DeploymentRecord>> {
        self.list_rows(DEPLOYMENTS, |d: &DeploymentRecord| d.state == state)
    }

    pub fn list_deployments_for_app(&self, app_id: &str) -> StateResult<Vec<DeploymentRecord>> {
        self.list_rows(DEPLOYMENTS, |d: &DeploymentRecord| d.app_id == app_id)
    }

    // ── Route mappings ─────────────────────────────────────────────

    pub fn put_route_mapping(&self, mapping: &RouteMapping) -> StateResult<()> {
        self.transaction(|txn| txn.put_route_mapping(mapping))
    }

    pub fn list_route_mappings_for_app(&self, app_id: &str) -> StateResult<Vec<RouteMapping>> {
        self.list_rows(ROUTE_MAPPINGS, |m: &RouteMapping| m.app_id == app_id)
    }
}

/// Handle to an open write transaction, passed to [`StateStore::transaction`].
///
/// Reads through the handle observe the transaction's own uncommitted writes.
pub struct StoreTxn {
    txn: WriteTransaction,
}

impl StoreTxn {
    fn put_row<T: Serialize>(&self, def: RowTable, key: &str, row: &T) -> StateResult<()> {
        let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        table
            .insert(key, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn delete_row(&self, def: RowTable, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    fn get_row<T: DeserializeOwned>(&self, def: RowTable, key: &str) -> StateResult<Option<T>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        read_row(&table, key)
    }

    pub fn put_app(&self, app: &AppRecord) -> StateResult<()> {
        self.put_row(APPS, &app.id, app)
    }

    pub fn put_process(&self, process: &ProcessRecord) -> StateResult<()> {
        self.put_row(PROCESSES, &process.id, process)
    }

    pub fn get_process(&self, id: &str) -> StateResult<Option<ProcessRecord>> {
        self.get_row(PROCESSES, id)
    }

    /// Delete a process. Returns true if it existed.
    pub fn delete_process(&self, id: &str) -> StateResult<bool> {
        let existed = self.delete_row(PROCESSES, id)?;
        debug!(process = %id, existed, "process destroyed");
        Ok(existed)
    }

    pub fn put_deployment(&self, deployment: &DeploymentRecord) -> StateResult<()> {
        self.put_row(DEPLOYMENTS, &deployment.id, deployment)
    }

    pub fn get_deployment(&self, id: &str) -> StateResult<Option<DeploymentRecord>> {
        self.get_row(DEPLOYMENTS, id)
    }

    pub fn put_route_mapping(&self, mapping: &RouteMapping) -> StateResult<()> {
        self.put_row(ROUTE_MAPPINGS, &mapping.id, mapping)
    }

    /// Delete every route mapping of `app_id` bound to `process_type`.
    /// Returns the number deleted.
    pub fn delete_route_mappings(&self, app_id: &str, process_type: &str) -> StateResult<u32> {
        let mut table = self.txn.open_table(ROUTE_MAPPINGS).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let mapping: RouteMapping =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if mapping.targets(app_id, process_type) {
                keys.push(key.value().to_string());
            }
        }
        for key in &keys {
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        debug!(app = %app_id, %process_type, count = keys.len(), "route mappings destroyed");
        Ok(keys.len() as u32)
    }
}

fn read_row<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let row: T = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(row))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_process(id: &str, app_id: &str, process_type: &str, created_at: u64) -> ProcessRecord {
        ProcessRecord {
            id: id.to_string(),
            app_id: app_id.to_string(),
            process_type: process_type.to_string(),
            state: ProcessState::Started,
            instances: 2,
            droplet_id: None,
            restart_count: 0,
            created_at,
            updated_at: created_at,
        }
    }

    fn test_deployment(id: &str, app_id: &str, state: DeploymentState) -> DeploymentRecord {
        DeploymentRecord {
            id: id.to_string(),
            app_id: app_id.to_string(),
            deploying_process_id: format!("{id}-proc"),
            original_process_instance_count: 3,
            droplet_id: Some("droplet-2".to_string()),
            previous_droplet_id: Some("droplet-1".to_string()),
            state,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_mapping(id: &str, app_id: &str, process_type: &str) -> RouteMapping {
        RouteMapping {
            id: id.to_string(),
            app_id: app_id.to_string(),
            route_id: format!("route-{id}"),
            process_type: process_type.to_string(),
        }
    }

    #[test]
    fn app_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let app = AppRecord {
            id: "app-1".to_string(),
            name: "dora".to_string(),
            droplet_id: Some("droplet-1".to_string()),
            created_at: 1000,
            updated_at: 1000,
        };
        store.put_app(&app).unwrap();
        assert_eq!(store.get_app("app-1").unwrap(), Some(app));
        assert!(store.get_app("nope").unwrap().is_none());
    }

    #[test]
    fn processes_listed_oldest_first() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_process(&test_process("p-new", "app-1", "web-deployment-d1", 2000)).unwrap();
        store.put_process(&test_process("p-old", "app-1", "web", 1000)).unwrap();
        store.put_process(&test_process("p-other", "app-2", "web", 500)).unwrap();

        let ids: Vec<_> = store
            .list_processes_for_app("app-1")
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["p-old", "p-new"]);
    }

    #[test]
    fn deployments_filtered_by_state() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&test_deployment("d1", "a1", DeploymentState::Deploying)).unwrap();
        store.put_deployment(&test_deployment("d2", "a2", DeploymentState::Canceling)).unwrap();
        store.put_deployment(&test_deployment("d3", "a3", DeploymentState::Deployed)).unwrap();
        store.put_deployment(&test_deployment("d4", "a4", DeploymentState::Deploying)).unwrap();

        let deploying = store.list_deployments_in_state(DeploymentState::Deploying).unwrap();
        assert_eq!(deploying.len(), 2);
        let canceling = store.list_deployments_in_state(DeploymentState::Canceling).unwrap();
        assert_eq!(canceling.len(), 1);
        assert_eq!(canceling[0].id, "d2");
        assert!(store.list_deployments_in_state(DeploymentState::Canceled).unwrap().is_empty());
    }

    #[test]
    fn transaction_commits_all_writes() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_process(&test_process("p1", "app-1", "web", 1000)).unwrap();

        store
            .transaction(|txn| -> StateResult<()> {
                let mut process = txn.get_process("p1")?.unwrap();
                process.instances = 7;
                txn.put_process(&process)?;
                txn.put_deployment(&test_deployment("d1", "app-1", DeploymentState::Deploying))
            })
            .unwrap();

        assert_eq!(store.get_process("p1").unwrap().unwrap().instances, 7);
        assert!(store.get_deployment("d1").unwrap().is_some());
    }

    #[test]
    fn transaction_error_writes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_process(&test_process("p1", "app-1", "web", 1000)).unwrap();

        let result = store.transaction(|txn| -> StateResult<()> {
            let mut process = txn.get_process("p1")?.unwrap();
            process.instances = 0;
            txn.put_process(&process)?;
            txn.delete_process("p1")?;
            Err(StateError::Write("aborted".to_string()))
        });

        assert!(matches!(result, Err(StateError::Write(_))));
        let process = store.get_process("p1").unwrap().unwrap();
        assert_eq!(process.instances, 2);
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .transaction(|txn| -> StateResult<()> {
                txn.put_process(&test_process("p1", "app-1", "web", 1000))?;
                assert!(txn.get_process("p1")?.is_some());
                assert!(txn.delete_process("p1")?);
                assert!(!txn.delete_process("p1")?);
                Ok(())
            })
            .unwrap();
        assert!(store.get_process("p1").unwrap().is_none());
    }

    #[test]
    fn delete_route_mappings_by_type() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_route_mapping(&test_mapping("m1", "app-1", "web")).unwrap();
        store.put_route_mapping(&test_mapping("m2", "app-1", "web-deployment-d1")).unwrap();
        store.put_route_mapping(&test_mapping("m3", "app-1", "web-deployment-d1")).unwrap();
        store.put_route_mapping(&test_mapping("m4", "app-2", "web-deployment-d1")).unwrap();

        let deleted = store
            .transaction(|txn| txn.delete_route_mappings("app-1", "web-deployment-d1"))
            .unwrap();
        assert_eq!(deleted, 2);

        let remaining = store.list_route_mappings_for_app("app-1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].process_type, "web");
        assert_eq!(store.list_route_mappings_for_app("app-2").unwrap().len(), 1);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .put_deployment(&test_deployment("d1", "app-1", DeploymentState::Deploying))
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let deployment = store.get_deployment("d1").unwrap();
        assert_eq!(deployment.unwrap().state, DeploymentState::Deploying);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_processes_for_app("any").unwrap().is_empty());
        assert!(store.list_deployments_for_app("any").unwrap().is_empty());
        assert!(store.list_route_mappings_for_app("any").unwrap().is_empty());
        assert!(store.get_deployment("nope").unwrap().is_none());
    }
}
