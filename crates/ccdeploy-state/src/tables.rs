//! redb table definitions for the deployment record store.
//!
//! Each table uses `&str` keys (the row id) and `&[u8]` values
//! (JSON-serialized domain types).

use redb::TableDefinition;

/// Shape shared by every row table: id key, JSON value.
pub type RowTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Applications keyed by app id.
pub const APPS: RowTable = TableDefinition::new("apps");

/// Processes keyed by process id.
pub const PROCESSES: RowTable = TableDefinition::new("processes");

/// Deployments keyed by deployment id.
pub const DEPLOYMENTS: RowTable = TableDefinition::new("deployments");

/// Route mappings keyed by mapping id.
pub const ROUTE_MAPPINGS: RowTable = TableDefinition::new("route_mappings");
