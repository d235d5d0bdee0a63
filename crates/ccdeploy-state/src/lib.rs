//! ccdeploy-state: the deployment record store.
//!
//! Backed by [redb](https://docs.rs/redb), holds the apps, processes,
//! deployments, and route mappings the rolling deployment orchestrator
//! reads and mutates.
//!
//! # Architecture
//!
//! All rows are JSON-serialized into redb's `&[u8]` value columns and keyed
//! by their id. Multi-row mutations go through [`StateStore::transaction`],
//! which commits every write of a step or none of them.
//!
//! Row-level pessimistic locking lives outside redb in a [`LockTable`]:
//! callers lock the ids they are about to read and mutate, in a fixed order,
//! and hold the guards until their transaction has committed.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod locks;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use locks::{EntityLock, LockTable};
pub use store::{StateStore, StoreTxn};
pub use types::*;
