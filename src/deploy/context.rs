//! Deployment context threaded through the stages.

use crate::artifact::ResolvedArtifact;
use crate::config::AppSpec;
use crate::error::{DeployerError, Result};
use crate::state::AppState;

/// In-memory state of one deployment run.
///
/// Stages read the desired state and the observed starting point from here
/// and record the identifiers the platform assigns as they go.
#[derive(Debug, Clone)]
pub struct DeployContext {
    /// Desired application.
    pub desired: AppSpec,
    /// Application as observed before the run, if it existed.
    pub current: Option<AppState>,
    /// Guid of the application being deployed.
    pub app_guid: Option<String>,
    /// Guid of the application being replaced during blue-green.
    pub venerable_guid: Option<String>,
    /// Package created or copied by this run.
    pub package_guid: Option<String>,
    /// Droplet staged by this run.
    pub droplet_guid: Option<String>,
    /// Resolved bits.
    pub artifact: Option<ResolvedArtifact>,
}

impl DeployContext {
    /// Creates a context for deploying `desired` over `current`.
    #[must_use]
    pub fn new(desired: AppSpec, current: Option<AppState>) -> Self {
        let app_guid = current.as_ref().map(|c| c.guid.clone());
        Self {
            desired,
            current,
            app_guid,
            venerable_guid: None,
            package_guid: None,
            droplet_guid: None,
            artifact: None,
        }
    }

    /// Sets the resolved artifact.
    #[must_use]
    pub fn with_artifact(mut self, artifact: ResolvedArtifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    /// Guid of the application being deployed.
    ///
    /// # Errors
    ///
    /// Returns an internal error when no stage has established it yet.
    pub fn app_guid(&self) -> Result<&str> {
        self.app_guid
            .as_deref()
            .ok_or_else(|| DeployerError::internal("no application guid in deploy context"))
    }

    /// Guid of the replaced application.
    ///
    /// # Errors
    ///
    /// Returns an internal error outside a blue-green replacement.
    pub fn venerable_guid(&self) -> Result<&str> {
        self.venerable_guid
            .as_deref()
            .ok_or_else(|| DeployerError::internal("no venerable application in deploy context"))
    }

    /// Guid of the application as it was before the run.
    ///
    /// # Errors
    ///
    /// Returns an internal error when the application did not exist.
    pub fn current_guid(&self) -> Result<&str> {
        self.current
            .as_ref()
            .map(|c| c.guid.as_str())
            .ok_or_else(|| DeployerError::internal("no current application in deploy context"))
    }

    /// Returns true when `app_guid` is the application that existed before
    /// the run, in which case the observed state describes it.
    #[must_use]
    pub fn is_current(&self, app_guid: &str) -> bool {
        self.current.as_ref().is_some_and(|c| c.guid == app_guid)
    }
}
