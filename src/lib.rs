// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # cf-app-deployer
//!
//! A declarative, idempotent deployer for Cloud Foundry applications.
//!
//! ## Overview
//!
//! cfdeploy converges one application on the Cloud Controller v3 API to the
//! state described in a YAML document:
//!
//! - Bits from a local path, an HTTP archive, a git repository, a release
//!   asset or a docker image
//! - Routes, service bindings, environment, scale and health check
//! - Standard (in place) or blue-green (sibling app) deployments
//! - Rollback of applied stages when a deployment fails
//!
//! ## Architecture
//!
//! Every apply follows the same loop:
//!
//! 1. **Desired State**: the `app` section of `cfdeploy.yaml`
//! 2. **Observed State**: read back from the platform
//! 3. **Plan**: the change is classified and turned into ordered stages
//! 4. **Run**: stages are applied, compensations unwound on failure
//!
//! ## Modules
//!
//! - [`config`]: Deployment document parsing and validation
//! - [`cloudfoundry`]: Platform capability, API client and observer
//! - [`artifact`]: Artifact workspace and resolution
//! - [`planner`]: Change classification and deployment plans
//! - [`deploy`]: Stage execution and rollback
//! - [`reconciler`]: Reconcile, read and delete entry points
//! - [`state`]: Recorded state, locking and legacy migration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! provider:
//!   api_url: https://api.sys.example.com
//!
//! app:
//!   name: shop
//!   space: 5f0c3b6e-space-guid
//!   instances: 2
//!   source:
//!     path: ./build
//!   routes:
//!     - route: 9d1e2a44-route-guid
//!   service_bindings:
//!     - service_instance: 0b7e9c1a-db-guid
//!       params:
//!         role: readonly
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod artifact;
pub mod cli;
pub mod cloudfoundry;
pub mod config;
pub mod deploy;
pub mod error;
pub mod planner;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use artifact::{ArtifactResolver, ResolvedArtifact, Workspace};
pub use cli::{Cli, Commands, OutputFormatter};
pub use cloudfoundry::{AppObserver, CfClient, JobWaiter, Platform};
pub use config::{AppSpec, ConfigHasher, ConfigParser, ConfigValidator, DeployDocument};
pub use deploy::{StageExecutor, StageRunner};
pub use error::{DeployerError, Result};
pub use planner::{ChangeClass, DeployPlan, StrategySelector, classify};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use state::{AppState, DeploymentState, LocalStateStore, StateStore};
