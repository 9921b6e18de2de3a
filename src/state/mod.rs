//! State management module for the deployer.
//!
//! This module records the observed application between runs, guards it
//! with an advisory lock, and upgrades records written by older versions.

mod store;
mod local;
mod lock;
mod migrate;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, holder_id};
pub use migrate::{LEGACY_STATE_VERSION, decode_state, migrate_legacy_state, state_version};
pub use types::{
    AppState, BindingRecord, DeploymentHistoryEntry, DeploymentOperation, DeploymentState,
    RouteMapping, STATE_VERSION,
};
