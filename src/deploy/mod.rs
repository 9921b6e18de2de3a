//! Deployment execution module.
//!
//! This module runs deployment plans against the platform:
//! - Stage definitions and their compensations
//! - The executor applying one stage at a time
//! - The runner sequencing stages and rolling back on failure

mod context;
mod executor;
mod runner;
mod stages;

pub use context::DeployContext;
pub use executor::StageExecutor;
pub use runner::StageRunner;
pub use stages::{Compensation, Stage, VENERABLE_SUFFIX, venerable_name};
