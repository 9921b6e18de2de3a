//! Planning module for deployment operations.
//!
//! This module compares desired and observed application state, classifies
//! the change, and turns the classification into an ordered plan of stages.

mod classify;
mod diff;
mod plan;
mod sync;

pub use classify::{classify, changed_fields, ChangeClass, ChangeSet, ChangedField, Classification};
pub use diff::{
    binding_diff, bindings_equal, current_route_keys, desired_route_keys, diff, route_diff,
    route_key, ListDiff, RouteKey,
};
pub use plan::{lifecycle_of, DeployPlan, StrategySelector};
pub use sync::{inverse_environment, metadata_patch, stale_environment};
