//! Cloud Controller v3 resource types.
//!
//! This module defines the resources read from and the request payloads
//! sent to the platform. Only the fields the deployer consumes are modeled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ApiErrorDetail;

/// Reference to another resource by guid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidRef {
    /// Referenced guid.
    pub guid: String,
}

/// To-one relationship wrapper (`{"data": {"guid": ...}}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    /// Related resource, absent when unset.
    #[serde(default)]
    pub data: Option<GuidRef>,
}

impl Relationship {
    /// Returns the related guid, if any.
    #[must_use]
    pub fn guid(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.guid.as_str())
    }
}

/// Labels and annotations of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Metadata update; `None` values delete the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPatch {
    /// Labels to set or delete.
    #[serde(default)]
    pub labels: BTreeMap<String, Option<String>>,
    /// Annotations to set or delete.
    #[serde(default)]
    pub annotations: BTreeMap<String, Option<String>>,
}

impl MetadataPatch {
    /// Returns true when the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

/// Desired run state of an application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AppRunState {
    /// Started.
    Started,
    /// Stopped.
    #[default]
    Stopped,
}

/// Lifecycle type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleType {
    /// Buildpack lifecycle.
    #[default]
    Buildpack,
    /// Docker lifecycle.
    Docker,
}

/// Lifecycle data of a buildpack application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleData {
    /// Buildpacks, in order; `None` resets to auto-detection.
    #[serde(default)]
    pub buildpacks: Option<Vec<String>>,
    /// Stack; `None` resets to the platform default.
    #[serde(default)]
    pub stack: Option<String>,
}

/// Application lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    /// Lifecycle type.
    #[serde(rename = "type")]
    pub kind: LifecycleType,
    /// Lifecycle data.
    #[serde(default)]
    pub data: LifecycleData,
}

impl Lifecycle {
    /// Buildpack lifecycle with explicit nulls for unset values.
    #[must_use]
    pub fn buildpack(buildpack: Option<&str>, stack: Option<&str>) -> Self {
        Self {
            kind: LifecycleType::Buildpack,
            data: LifecycleData {
                buildpacks: buildpack.map(|b| vec![b.to_string()]),
                stack: stack.map(ToString::to_string),
            },
        }
    }

    /// Docker lifecycle.
    #[must_use]
    pub fn docker() -> Self {
        Self {
            kind: LifecycleType::Docker,
            data: LifecycleData::default(),
        }
    }

    /// First buildpack, if any.
    #[must_use]
    pub fn first_buildpack(&self) -> Option<&str> {
        self.data
            .buildpacks
            .as_ref()
            .and_then(|b| b.first())
            .map(String::as_str)
    }
}

/// Relationships of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRelationships {
    /// Owning space.
    #[serde(default)]
    pub space: Relationship,
}

/// An application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    /// Guid.
    pub guid: String,
    /// Name.
    pub name: String,
    /// Run state.
    #[serde(default)]
    pub state: AppRunState,
    /// Lifecycle.
    #[serde(default)]
    pub lifecycle: Lifecycle,
    /// Relationships.
    #[serde(default)]
    pub relationships: AppRelationships,
    /// Labels and annotations.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Package type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    /// Application bits.
    #[default]
    Bits,
    /// Docker image reference.
    Docker,
}

/// Package state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageState {
    /// Waiting for bits.
    #[default]
    AwaitingUpload,
    /// Bits being processed.
    ProcessingUpload,
    /// Ready for staging.
    Ready,
    /// Upload failed.
    Failed,
    /// Being copied from another package.
    Copying,
    /// Expired.
    Expired,
}

/// A package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Guid.
    pub guid: String,
    /// Type.
    #[serde(rename = "type", default)]
    pub kind: PackageType,
    /// State.
    #[serde(default)]
    pub state: PackageState,
    /// Creation time as reported by the platform.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Package creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreatePackageRequest {
    /// A bits package awaiting upload.
    Bits {
        /// Owning application.
        app_guid: String,
    },
    /// A docker package.
    Docker {
        /// Owning application.
        app_guid: String,
        /// Image reference.
        image: String,
        /// Registry user.
        username: Option<String>,
        /// Registry password.
        password: Option<String>,
    },
}

/// Build state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildState {
    /// Staging in progress.
    #[default]
    Staging,
    /// Staged successfully.
    Staged,
    /// Staging failed.
    Failed,
}

/// A build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    /// Guid.
    pub guid: String,
    /// State.
    #[serde(default)]
    pub state: BuildState,
    /// Staging error, when failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Resulting droplet, once staged.
    #[serde(default)]
    pub droplet: Option<GuidRef>,
}

/// A droplet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Droplet {
    /// Guid.
    pub guid: String,
    /// State.
    #[serde(default)]
    pub state: String,
    /// Docker image, for docker droplets.
    #[serde(default)]
    pub image: Option<String>,
    /// Stack the droplet was staged on.
    #[serde(default)]
    pub stack: Option<String>,
}

/// Health check data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckData {
    /// Check timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u32>,
    /// HTTP endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Health check of a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHealthCheck {
    /// Check type.
    #[serde(rename = "type", default = "default_health_type")]
    pub kind: String,
    /// Check data.
    #[serde(default)]
    pub data: HealthCheckData,
}

fn default_health_type() -> String {
    String::from("port")
}

/// A process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    /// Guid.
    pub guid: String,
    /// Process type (`web`, `worker`, ...).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Start command.
    #[serde(default)]
    pub command: Option<String>,
    /// Instance count.
    #[serde(default)]
    pub instances: u32,
    /// Memory in MiB.
    #[serde(default)]
    pub memory_in_mb: u32,
    /// Disk in MiB.
    #[serde(default)]
    pub disk_in_mb: u32,
    /// Health check.
    #[serde(default)]
    pub health_check: ProcessHealthCheck,
}

/// Scale request for a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRequest {
    /// Instance count.
    pub instances: u32,
    /// Memory in MiB.
    pub memory_in_mb: u32,
    /// Disk in MiB.
    pub disk_in_mb: u32,
}

impl ScaleRequest {
    /// Captures the current scale of a process.
    #[must_use]
    pub const fn of(process: &Process) -> Self {
        Self {
            instances: process.instances,
            memory_in_mb: process.memory_in_mb,
            disk_in_mb: process.disk_in_mb,
        }
    }
}

/// Process update request; `command: None` resets to the detected command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessUpdate {
    /// Start command.
    pub command: Option<String>,
    /// Health check.
    pub health_check: ProcessHealthCheck,
}

impl ProcessUpdate {
    /// Captures the current command and health check of a process.
    #[must_use]
    pub fn of(process: &Process) -> Self {
        Self {
            command: process.command.clone(),
            health_check: process.health_check.clone(),
        }
    }
}

/// State of one running instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    /// Serving.
    Running,
    /// Booting.
    #[default]
    Starting,
    /// Crashed.
    Crashed,
    /// Down.
    Down,
}

/// One instance of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Instance index.
    #[serde(default)]
    pub index: u32,
    /// State.
    #[serde(default)]
    pub state: InstanceState,
    /// Platform-supplied details (crash reason).
    #[serde(default)]
    pub details: Option<String>,
}

/// Application reference inside a route destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationApp {
    /// Application guid.
    pub guid: String,
}

/// A route destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Guid of the destination (the mapping id).
    pub guid: String,
    /// Target application.
    pub app: DestinationApp,
    /// Application port.
    #[serde(default)]
    pub port: Option<u16>,
}

/// A route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Guid.
    pub guid: String,
    /// Fully-qualified URL.
    #[serde(default)]
    pub url: String,
    /// Destinations.
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

/// Last operation of an asynchronous resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperation {
    /// Operation type (`create`, `delete`).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// `succeeded`, `in progress` or `failed`.
    #[serde(default)]
    pub state: String,
    /// Broker-supplied description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Relationships of a service credential binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRelationships {
    /// Bound application.
    #[serde(default)]
    pub app: Relationship,
    /// Bound service instance.
    #[serde(default)]
    pub service_instance: Relationship,
}

/// A service credential binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCredentialBinding {
    /// Guid.
    pub guid: String,
    /// Last operation.
    #[serde(default)]
    pub last_operation: Option<LastOperation>,
    /// Relationships.
    #[serde(default)]
    pub relationships: BindingRelationships,
}

impl ServiceCredentialBinding {
    /// Guid of the bound service instance.
    #[must_use]
    pub fn service_instance_guid(&self) -> Option<&str> {
        self.relationships.service_instance.guid()
    }
}

/// Binding creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBindingRequest {
    /// Application guid.
    pub app_guid: String,
    /// Service instance guid.
    pub service_instance_guid: String,
    /// Creation parameters.
    pub parameters: Option<serde_json::Value>,
}

/// Result of a binding creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingCreated {
    /// Created synchronously.
    Ready(ServiceCredentialBinding),
    /// Creation continues in a job.
    Job(String),
}

/// Application creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAppRequest {
    /// Name.
    pub name: String,
    /// Space guid.
    pub space_guid: String,
    /// Lifecycle.
    pub lifecycle: Lifecycle,
    /// Environment variables.
    pub environment: BTreeMap<String, String>,
    /// Labels and annotations.
    pub metadata: Metadata,
}

/// Application update request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateAppRequest {
    /// New name.
    pub name: Option<String>,
    /// New lifecycle.
    pub lifecycle: Option<Lifecycle>,
}

impl UpdateAppRequest {
    /// Rename only.
    #[must_use]
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            lifecycle: None,
        }
    }
}

/// Asynchronous job state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    /// Running.
    #[default]
    Processing,
    /// Waiting on a broker.
    Polling,
    /// Finished.
    Complete,
    /// Failed.
    Failed,
}

impl JobState {
    /// Returns true for `COMPLETE` and `FAILED`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// An asynchronous job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Guid.
    pub guid: String,
    /// Operation name.
    #[serde(default)]
    pub operation: String,
    /// State.
    #[serde(default)]
    pub state: JobState,
    /// Errors, when failed.
    #[serde(default)]
    pub errors: Vec<ApiErrorDetail>,
}
