//! Stage and compensation descriptors.
//!
//! Both are plain data: a plan is a list of [`Stage`] values that can be
//! printed, serialized and compared in tests, and every compensation is a
//! [`Compensation`] value recorded when its stage succeeds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::cloudfoundry::{
    DEFAULT_OPERATION_TIMEOUT, Lifecycle, MetadataPatch, ProcessUpdate, ScaleRequest,
    UpdateAppRequest,
};
use crate::config::{HealthCheck, ServiceBinding};
use crate::planner::RouteKey;

/// Suffix of the application being replaced during blue-green.
pub const VENERABLE_SUFFIX: &str = "-venerable";

/// Name of the replaced application during blue-green.
#[must_use]
pub fn venerable_name(name: &str) -> String {
    format!("{name}{VENERABLE_SUFFIX}")
}

/// One step of a deployment plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "kebab-case")]
pub enum Stage {
    /// Create the application, or adopt one with the same name in the space.
    CreateApp,
    /// Upload the resolved bits, or import the docker image.
    UploadBits {
        /// Budget for package processing, in seconds.
        timeout_secs: u64,
    },
    /// Copy the package of the replaced application.
    CopyBits {
        /// Budget for package processing, in seconds.
        timeout_secs: u64,
    },
    /// Stage the package into a droplet.
    StageBuild {
        /// Staging budget, in seconds.
        timeout_secs: u64,
    },
    /// Make the staged droplet current.
    AssignDroplet,
    /// Apply environment changes; `None` unsets a variable.
    SetEnvironment {
        /// Variables to set or unset.
        changes: BTreeMap<String, Option<String>>,
    },
    /// Enable or disable SSH access.
    ConfigureSsh {
        /// Desired flag.
        enabled: bool,
    },
    /// Update the command and health check of the web process.
    UpdateProcess {
        /// Start command; unset resets to the detected command.
        command: Option<String>,
        /// Health check.
        health_check: HealthCheck,
    },
    /// Scale the web process.
    Scale {
        /// Instance count.
        instances: u32,
        /// Memory in MiB.
        memory_mb: u32,
        /// Disk in MiB.
        disk_mb: u32,
    },
    /// Update application fields in place.
    PatchApp {
        /// New name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rename: Option<String>,
        /// New lifecycle.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lifecycle: Option<Lifecycle>,
    },
    /// Apply label and annotation changes.
    SyncMetadata {
        /// Keys to set or delete.
        patch: MetadataPatch,
    },
    /// Copy labels and annotations of the replaced application.
    CopyMetadata,
    /// Remove route destinations of the application.
    UnmapRoutes {
        /// Mappings to remove.
        routes: Vec<RouteKey>,
    },
    /// Add route destinations for the application.
    MapRoutes {
        /// Mappings to add.
        routes: Vec<RouteKey>,
    },
    /// Delete service bindings.
    UnbindServices {
        /// Service instance guids to unbind.
        service_instances: Vec<String>,
        /// Budget per binding deletion, in seconds.
        timeout_secs: u64,
    },
    /// Create service bindings.
    BindServices {
        /// Bindings to create.
        bindings: Vec<ServiceBinding>,
        /// Budget per binding creation, in seconds.
        timeout_secs: u64,
    },
    /// Stop the application.
    Stop,
    /// Start the application and wait for its instances.
    Start {
        /// Start budget, in seconds.
        timeout_secs: u64,
    },
    /// Rename the current application out of the way.
    RenameVenerable,
    /// Remove every route destination of the replaced application.
    UnmapVenerableRoutes,
    /// Stop the replaced application.
    StopVenerable,
    /// Delete the replaced application.
    DeleteVenerable {
        /// Deletion budget, in seconds.
        timeout_secs: u64,
    },
}

impl Stage {
    /// Stable name used in logs, spans and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateApp => "create-app",
            Self::UploadBits { .. } => "upload-bits",
            Self::CopyBits { .. } => "copy-bits",
            Self::StageBuild { .. } => "stage-build",
            Self::AssignDroplet => "assign-droplet",
            Self::SetEnvironment { .. } => "set-environment",
            Self::ConfigureSsh { .. } => "configure-ssh",
            Self::UpdateProcess { .. } => "update-process",
            Self::Scale { .. } => "scale",
            Self::PatchApp { .. } => "patch-app",
            Self::SyncMetadata { .. } => "sync-metadata",
            Self::CopyMetadata => "copy-metadata",
            Self::UnmapRoutes { .. } => "unmap-routes",
            Self::MapRoutes { .. } => "map-routes",
            Self::UnbindServices { .. } => "unbind-services",
            Self::BindServices { .. } => "bind-services",
            Self::Stop => "stop",
            Self::Start { .. } => "start",
            Self::RenameVenerable => "rename-venerable",
            Self::UnmapVenerableRoutes => "unmap-venerable-routes",
            Self::StopVenerable => "stop-venerable",
            Self::DeleteVenerable { .. } => "delete-venerable",
        }
    }

    /// Time budget of the stage's waits.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        match self {
            Self::UploadBits { timeout_secs }
            | Self::CopyBits { timeout_secs }
            | Self::StageBuild { timeout_secs }
            | Self::UnbindServices { timeout_secs, .. }
            | Self::BindServices { timeout_secs, .. }
            | Self::Start { timeout_secs }
            | Self::DeleteVenerable { timeout_secs } => Duration::from_secs(*timeout_secs),
            _ => DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Returns true when the stage cannot be undone.
    ///
    /// A failure after a forward-only stage leaves its effect in place; the
    /// next reconcile converges from there.
    #[must_use]
    pub const fn is_forward_only(&self) -> bool {
        matches!(
            self,
            Self::UploadBits { .. }
                | Self::CopyBits { .. }
                | Self::StageBuild { .. }
                | Self::UnbindServices { .. }
                | Self::DeleteVenerable { .. }
        )
    }

    /// Returns true when the stage has nothing to apply.
    ///
    /// Only diff-carrying stages can turn out to be empty.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        match self {
            Self::SetEnvironment { changes } => changes.is_empty(),
            Self::SyncMetadata { patch } => patch.is_empty(),
            Self::UnmapRoutes { routes } | Self::MapRoutes { routes } => routes.is_empty(),
            Self::UnbindServices {
                service_instances, ..
            } => service_instances.is_empty(),
            Self::BindServices { bindings, .. } => bindings.is_empty(),
            Self::PatchApp { rename, lifecycle } => rename.is_none() && lifecycle.is_none(),
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Self::SetEnvironment { changes } => {
                let set = changes.values().filter(|v| v.is_some()).count();
                write!(f, " (set {set}, unset {})", changes.len() - set)
            }
            Self::ConfigureSsh { enabled } => write!(f, " ({enabled})"),
            Self::Scale {
                instances,
                memory_mb,
                disk_mb,
            } => write!(f, " ({instances} x {memory_mb}M, disk {disk_mb}M)"),
            Self::PatchApp { rename, lifecycle } => {
                if let Some(name) = rename {
                    write!(f, " (name {name})")?;
                }
                if lifecycle.is_some() {
                    write!(f, " (lifecycle)")?;
                }
                Ok(())
            }
            Self::UnmapRoutes { routes } | Self::MapRoutes { routes } => {
                let keys: Vec<String> = routes.iter().map(ToString::to_string).collect();
                write!(f, " ({})", keys.join(", "))
            }
            Self::UnbindServices {
                service_instances, ..
            } => write!(f, " ({})", service_instances.join(", ")),
            Self::BindServices { bindings, .. } => {
                let names: Vec<&str> = bindings.iter().map(|b| b.service_instance.as_str()).collect();
                write!(f, " ({})", names.join(", "))
            }
            _ => Ok(()),
        }
    }
}

/// An undo action recorded by a successful stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Delete an application created by the failed run.
    DeleteApp {
        /// Application guid.
        app_guid: String,
        /// Deletion budget.
        timeout: Duration,
    },
    /// Restore name and lifecycle.
    PatchApp {
        /// Application guid.
        app_guid: String,
        /// Previous values.
        request: UpdateAppRequest,
    },
    /// Make the previous droplet current again.
    AssignDroplet {
        /// Application guid.
        app_guid: String,
        /// Previous droplet guid.
        droplet_guid: String,
    },
    /// Restore environment variables.
    RestoreEnvironment {
        /// Application guid.
        app_guid: String,
        /// Previous values; `None` unsets.
        vars: BTreeMap<String, Option<String>>,
    },
    /// Restore the SSH flag.
    ConfigureSsh {
        /// Application guid.
        app_guid: String,
        /// Previous flag.
        enabled: bool,
    },
    /// Restore command and health check.
    UpdateProcess {
        /// Application guid.
        app_guid: String,
        /// Web process guid.
        process_guid: String,
        /// Previous values.
        update: ProcessUpdate,
    },
    /// Restore the previous scale.
    Scale {
        /// Application guid.
        app_guid: String,
        /// Previous scale.
        scale: ScaleRequest,
    },
    /// Restore labels and annotations.
    RestoreMetadata {
        /// Application guid.
        app_guid: String,
        /// Previous values; `None` deletes.
        patch: MetadataPatch,
    },
    /// Re-add route destinations.
    MapRoutes {
        /// Application guid.
        app_guid: String,
        /// Mappings to restore.
        routes: Vec<RouteKey>,
    },
    /// Remove destinations added by the failed run.
    RemoveDestinations {
        /// Application guid.
        app_guid: String,
        /// `(route guid, destination guid)` pairs.
        destinations: Vec<(String, String)>,
    },
    /// Delete bindings created by the failed run.
    DeleteBindings {
        /// Application guid.
        app_guid: String,
        /// Binding guids.
        binding_guids: Vec<String>,
        /// Budget per deletion.
        timeout: Duration,
    },
    /// Start an application stopped by the failed run.
    Start {
        /// Application guid.
        app_guid: String,
    },
    /// Stop an application started by the failed run.
    Stop {
        /// Application guid.
        app_guid: String,
    },
}

impl Compensation {
    /// Application the compensation acts on.
    #[must_use]
    pub fn app_guid(&self) -> &str {
        match self {
            Self::DeleteApp { app_guid, .. }
            | Self::PatchApp { app_guid, .. }
            | Self::AssignDroplet { app_guid, .. }
            | Self::RestoreEnvironment { app_guid, .. }
            | Self::ConfigureSsh { app_guid, .. }
            | Self::UpdateProcess { app_guid, .. }
            | Self::Scale { app_guid, .. }
            | Self::RestoreMetadata { app_guid, .. }
            | Self::MapRoutes { app_guid, .. }
            | Self::RemoveDestinations { app_guid, .. }
            | Self::DeleteBindings { app_guid, .. }
            | Self::Start { app_guid }
            | Self::Stop { app_guid } => app_guid,
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DeleteApp { .. } => "delete-app",
            Self::PatchApp { .. } => "patch-app",
            Self::AssignDroplet { .. } => "assign-droplet",
            Self::RestoreEnvironment { .. } => "restore-environment",
            Self::ConfigureSsh { .. } => "configure-ssh",
            Self::UpdateProcess { .. } => "update-process",
            Self::Scale { .. } => "scale",
            Self::RestoreMetadata { .. } => "restore-metadata",
            Self::MapRoutes { .. } => "map-routes",
            Self::RemoveDestinations { .. } => "remove-destinations",
            Self::DeleteBindings { .. } => "delete-bindings",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serializes_with_tag() {
        let stage = Stage::MapRoutes {
            routes: vec![RouteKey::new("r1", 8080)],
        };

        let json = serde_json::to_value(&stage).expect("serialize");

        assert_eq!(json["stage"], "map-routes");
        assert_eq!(json["routes"][0]["port"], 8080);
    }

    #[test]
    fn test_forward_only_stages() {
        assert!(Stage::StageBuild { timeout_secs: 900 }.is_forward_only());
        assert!(Stage::UnbindServices {
            service_instances: vec![],
            timeout_secs: 300
        }
        .is_forward_only());
        assert!(!Stage::MapRoutes { routes: vec![] }.is_forward_only());
        assert!(!Stage::CreateApp.is_forward_only());
    }

    #[test]
    fn test_stage_timeouts() {
        assert_eq!(
            Stage::BindServices {
                bindings: vec![],
                timeout_secs: 300
            }
            .timeout(),
            Duration::from_secs(300)
        );
        assert_eq!(Stage::Stop.timeout(), DEFAULT_OPERATION_TIMEOUT);
    }

    #[test]
    fn test_display_includes_details() {
        let stage = Stage::SetEnvironment {
            changes: BTreeMap::from([
                (String::from("A"), Some(String::from("1"))),
                (String::from("X"), None),
            ]),
        };
        assert_eq!(stage.to_string(), "set-environment (set 1, unset 1)");
        assert_eq!(venerable_name("shop"), "shop-venerable");
    }
}
