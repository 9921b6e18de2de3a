//! State types for tracking deployments.
//!
//! These types represent the observed/recorded state of the application,
//! used for change classification and idempotent reconciles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{AppSpec, BindingParams};

/// Current version of the state format.
pub const STATE_VERSION: &str = "2.0";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete recorded state of one deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    /// State format version.
    pub version: String,
    /// Observed application, absent before the first successful create.
    #[serde(default)]
    pub app: Option<AppState>,
    /// Hash of the last applied spec.
    #[serde(default)]
    pub spec_hash: String,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Deployment history (recent entries).
    #[serde(default)]
    pub history: Vec<DeploymentHistoryEntry>,
}

/// Observed state of the application.
///
/// `spec` has the same shape as the desired state, so feeding it back as
/// desired state classifies as no change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    /// Application guid.
    pub guid: String,
    /// Desired-shape view of the application.
    pub spec: AppSpec,
    /// Established route mappings.
    #[serde(default)]
    pub route_mappings: Vec<RouteMapping>,
    /// Established service credential bindings.
    #[serde(default)]
    pub service_bindings: Vec<BindingRecord>,
    /// Current droplet guid.
    #[serde(default)]
    pub droplet_guid: Option<String>,
    /// Image of the current droplet, for docker applications.
    #[serde(default)]
    pub droplet_image: Option<String>,
    /// When the platform was last read.
    pub observed_at: DateTime<Utc>,
}

/// One route destination pointing at the application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteMapping {
    /// Route guid.
    pub route: String,
    /// Application port the route targets.
    pub port: u16,
    /// Destination guid.
    pub mapping_id: String,
}

/// One service credential binding of the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    /// Service instance guid.
    pub service_instance: String,
    /// Parameters the binding was created with.
    #[serde(default)]
    pub params: BindingParams,
    /// Binding guid.
    pub binding_id: String,
}

/// A single entry in the deployment history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    /// When the deployment occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: DeploymentOperation,
    /// Spec hash at time of deployment.
    pub spec_hash: String,
    /// Change class that was applied.
    #[serde(default)]
    pub change: Option<String>,
    /// Whether the deployment succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of deployment operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOperation {
    /// Reconcile towards desired state.
    Apply,
    /// Refresh from the platform.
    Refresh,
    /// Destruction.
    Destroy,
}

impl DeploymentState {
    /// Creates a new empty deployment state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            app: None,
            spec_hash: String::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Records the observed application.
    pub fn set_app(&mut self, app: AppState, spec_hash: &str) {
        self.app = Some(app);
        self.spec_hash = spec_hash.to_string();
        self.last_updated = Utc::now();
    }

    /// Forgets the application.
    pub fn clear_app(&mut self) -> Option<AppState> {
        self.last_updated = Utc::now();
        self.spec_hash.clear();
        self.app.take()
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: DeploymentHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl Default for DeploymentState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    /// Returns true if the application is meant to be running.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        !self.spec.stopped
    }

    /// Finds the mapping of a route on a port.
    #[must_use]
    pub fn mapping(&self, route: &str, port: u16) -> Option<&RouteMapping> {
        self.route_mappings
            .iter()
            .find(|m| m.route == route && m.port == port)
    }

    /// Finds the binding of a service instance.
    #[must_use]
    pub fn binding(&self, service_instance: &str) -> Option<&BindingRecord> {
        self.service_bindings
            .iter()
            .find(|b| b.service_instance == service_instance)
    }
}

impl DeploymentHistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: DeploymentOperation, spec_hash: &str, change: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            spec_hash: spec_hash.to_string(),
            change,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(operation: DeploymentOperation, spec_hash: &str, error: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            spec_hash: spec_hash.to_string(),
            change: None,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for DeploymentOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Refresh => "refresh",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
