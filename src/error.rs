//! Error types for the application deployer.
//!
//! This module provides the error hierarchy for every phase of a reconcile:
//! configuration, platform API calls, artifact preparation, stage execution
//! with rollback, and state storage.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for the deployer.
#[derive(Debug, Error)]
pub enum DeployerError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cloud Controller API errors.
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Artifact resolution errors.
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Stage execution errors.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// A single entry of the error list returned by the Cloud Controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    /// Numeric error code.
    #[serde(default)]
    pub code: i64,
    /// Short error title (e.g. `CF-UnprocessableEntity`).
    #[serde(default)]
    pub title: String,
    /// Human readable detail.
    #[serde(default)]
    pub detail: String,
}

impl fmt::Display for ApiErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.title, self.code, self.detail)
    }
}

/// Joins a list of platform errors for display.
fn join_details(details: &[ApiErrorDetail]) -> String {
    if details.is_empty() {
        return String::from("no details");
    }
    details
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Cloud Controller API errors.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The requested resource does not exist.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of resource (app, route, job, ...).
        resource: String,
        /// Identifier or URL of the resource.
        id: String,
    },

    /// Authentication or authorization failed.
    #[error("Not authorized ({status}): {message}")]
    NotAuthorized {
        /// HTTP status code (401 or 403).
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// API request failed with a structured error payload.
    #[error("API request failed with status {status}: {}", join_details(.errors))]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Errors returned by the platform.
        errors: Vec<ApiErrorDetail>,
    },

    /// The requested change collides with a resource owned by someone else.
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the collision.
        message: String,
    },

    /// An asynchronous job finished in the `FAILED` state.
    #[error("Job {job} failed: {}", join_details(.errors))]
    JobFailed {
        /// Job URL or guid.
        job: String,
        /// Errors reported by the job.
        errors: Vec<ApiErrorDetail>,
    },

    /// Polling exceeded its time budget.
    #[error("Timed out after {}s waiting for {operation}", .timeout.as_secs())]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// The budget that was exceeded.
        timeout: Duration,
    },

    /// Waiting was abandoned because the reconcile was cancelled.
    #[error("Cancelled while waiting for {operation}")]
    Cancelled {
        /// What was being waited on.
        operation: String,
    },

    /// Rate limited.
    #[error("API rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network error.
    #[error("Network error communicating with the platform: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
        /// Whether the failure is a server-side 5xx.
        server_error: bool,
    },

    /// Invalid response from API.
    #[error("Invalid response from the platform: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// An application failed to start.
    #[error("Application {app_guid} failed to start: {reason}{}", format_logs(.logs))]
    StartFailed {
        /// Guid of the application.
        app_guid: String,
        /// Why the start was considered failed.
        reason: String,
        /// Recent log lines attached for diagnosis.
        logs: Vec<String>,
    },
}

fn format_logs(logs: &[String]) -> String {
    if logs.is_empty() {
        String::new()
    } else {
        format!("\nRecent logs:\n{}", logs.join("\n"))
    }
}

fn format_rollback(errors: &[String]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!("; rollback incomplete: {}", errors.join("; "))
    }
}

/// Artifact resolution errors.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Download of a remote archive failed.
    #[error("Failed to download {url}: {message}")]
    DownloadFailed {
        /// Source URL.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// Git checkout failed.
    #[error("Git checkout of {url} failed: {message}")]
    GitFailed {
        /// Repository URL.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// Archive creation or conversion failed.
    #[error("Archive error for {path}: {message}")]
    ArchiveFailed {
        /// Path being archived.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// The source specification cannot be resolved.
    #[error("Invalid source: {message}")]
    InvalidSource {
        /// Description of the problem.
        message: String,
    },

    /// The workspace was not initialized or has been torn down.
    #[error("Artifact workspace unavailable: {path}")]
    WorkspaceUnavailable {
        /// Workspace root.
        path: PathBuf,
    },
}

/// Stage execution errors raised by the stage runner.
#[derive(Debug, Error)]
pub enum StageError {
    /// A stage failed and every compensation succeeded.
    #[error("Stage '{stage}' failed: {source}")]
    Failed {
        /// Name of the failing stage.
        stage: String,
        /// The primary error.
        source: Box<DeployerError>,
    },

    /// A stage failed and at least one compensation failed as well.
    #[error("Stage '{stage}' failed: {source}; rollback incomplete: {}", .compensation_errors.join("; "))]
    Rollback {
        /// Name of the failing stage.
        stage: String,
        /// The primary error.
        source: Box<DeployerError>,
        /// Errors raised by compensations, in the order they ran.
        compensation_errors: Vec<String>,
    },

    /// The reconcile was cancelled by the caller and rolled back.
    #[error("Cancelled during stage '{stage}'{}", format_rollback(.compensation_errors))]
    Cancelled {
        /// Stage that was running or about to run.
        stage: String,
        /// Errors raised by compensations, in the order they ran.
        compensation_errors: Vec<String>,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Storage backend error.
    #[error("State storage error: {message}")]
    StorageError {
        /// Description of the storage error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version is not supported.
    #[error("Unsupported state version: {found}")]
    UnsupportedVersion {
        /// Found state version.
        found: String,
    },
}

/// Result type alias for deployer operations.
pub type Result<T> = std::result::Result<T, DeployerError>;

impl DeployerError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the primary error behind stage wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Stage(StageError::Failed { source, .. } | StageError::Rollback { source, .. }) => {
                source.root_cause()
            }
            _ => self,
        }
    }

    /// Returns true if this error is a transient transport failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Platform(PlatformError::RateLimited { .. } | PlatformError::NetworkError { .. })
        )
    }

    /// Returns the delay the platform asked for before retrying, in seconds.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Platform(PlatformError::RateLimited { retry_after_secs }) => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Returns true if the primary error is a not-found response.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), Self::Platform(PlatformError::NotFound { .. }))
    }

    /// Returns true if the primary error is a polling timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Self::Platform(PlatformError::Timeout { .. }))
    }

    /// Returns true if the reconcile was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::Stage(StageError::Cancelled { .. }) | Self::Platform(PlatformError::Cancelled { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a parse error without a location.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location: None,
        }
    }
}

impl PlatformError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
            server_error: false,
        }
    }

    /// Creates an invalid-response error.
    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    /// Creates a cancellation error for an abandoned wait.
    #[must_use]
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }
}

impl ArtifactError {
    /// Creates an archive error.
    #[must_use]
    pub fn archive(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ArchiveFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a git error.
    #[must_use]
    pub fn git(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::GitFailed {
            url: url.into(),
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError {
            message: message.into(),
        }
    }
}
