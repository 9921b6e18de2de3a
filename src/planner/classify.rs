//! Change classification.
//!
//! Compares the desired application against the observed one and decides
//! how heavy the change is. Classes are ordered: each one implies the work
//! of the lighter ones.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::config::{AppSpec, Source, Strategy};
use crate::state::AppState;

use super::diff::{binding_diff, route_diff};

/// How the running application has to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeClass {
    /// Nothing to do.
    None,
    /// In-place updates that need no restart.
    UpdateOnly,
    /// The application must be restarted.
    Restart,
    /// The application must be staged again.
    Restage,
    /// A sibling application replaces the current one.
    Replace,
    /// The application does not exist yet.
    Create,
}

impl fmt::Display for ChangeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::UpdateOnly => "update-only",
            Self::Restart => "restart",
            Self::Restage => "restage",
            Self::Replace => "replace",
            Self::Create => "create",
        };
        write!(f, "{s}")
    }
}

/// A field group that differs between desired and observed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangedField {
    /// Application name.
    Name,
    /// Instance count.
    Instances,
    /// SSH feature.
    Ssh,
    /// Started or stopped.
    Stopped,
    /// Route mappings.
    Routes,
    /// Declared application ports.
    Ports,
    /// Labels.
    Labels,
    /// Annotations.
    Annotations,
    /// Memory limit.
    Memory,
    /// Disk limit.
    Disk,
    /// Start command.
    Command,
    /// Health check.
    HealthCheck,
    /// Docker image reference.
    DockerImage,
    /// Buildpack.
    Buildpack,
    /// Stack.
    Stack,
    /// Environment variables.
    Environment,
    /// Set of bound service instances.
    ServiceInstances,
    /// Parameters of a binding to an instance that stays bound.
    BindingParams,
    /// Source location.
    Source,
    /// Source content hash.
    SourceHash,
}

impl ChangedField {
    /// Fields whose change requires new bits.
    pub const CODE: &[Self] = &[Self::Source, Self::SourceHash, Self::DockerImage];

    /// Fields whose change requires staging.
    pub const RESTAGE: &[Self] = &[
        Self::Buildpack,
        Self::Stack,
        Self::ServiceInstances,
        Self::BindingParams,
        Self::Environment,
    ];

    /// Fields whose change requires a restart.
    pub const RESTART: &[Self] = &[
        Self::Memory,
        Self::Disk,
        Self::Command,
        Self::HealthCheck,
        Self::DockerImage,
    ];

    /// Name used in plan output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Instances => "instances",
            Self::Ssh => "enable_ssh",
            Self::Stopped => "stopped",
            Self::Routes => "routes",
            Self::Ports => "ports",
            Self::Labels => "labels",
            Self::Annotations => "annotations",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Command => "command",
            Self::HealthCheck => "health_check",
            Self::DockerImage => "docker_image",
            Self::Buildpack => "buildpack",
            Self::Stack => "stack",
            Self::Environment => "environment",
            Self::ServiceInstances => "service_instances",
            Self::BindingParams => "binding_params",
            Self::Source => "source",
            Self::SourceHash => "source_code_hash",
        }
    }
}

impl fmt::Display for ChangedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of changed field groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet(BTreeSet<ChangedField>);

impl ChangeSet {
    /// Returns true when nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true when `field` changed.
    #[must_use]
    pub fn contains(&self, field: ChangedField) -> bool {
        self.0.contains(&field)
    }

    /// Returns true when any of `fields` changed.
    #[must_use]
    pub fn any(&self, fields: &[ChangedField]) -> bool {
        fields.iter().any(|f| self.0.contains(f))
    }

    /// Changed fields in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = ChangedField> + '_ {
        self.0.iter().copied()
    }

    fn flag(&mut self, field: ChangedField, changed: bool) {
        if changed {
            self.0.insert(field);
        }
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(ChangedField::as_str).collect();
        write!(f, "{}", names.join(", "))
    }
}

/// Outcome of classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Change class.
    pub class: ChangeClass,
    /// Whether new bits must be uploaded and staged.
    pub code_changed: bool,
    /// Field groups that differ.
    pub changes: ChangeSet,
}

impl Classification {
    /// Classification of a first deployment.
    #[must_use]
    pub fn create() -> Self {
        Self {
            class: ChangeClass::Create,
            code_changed: true,
            changes: ChangeSet::default(),
        }
    }
}

/// Compares desired and observed state field group by field group.
///
/// Both sides are normalized first, so ports at or below 1024 and empty
/// strings never register as changes.
#[must_use]
pub fn changed_fields(desired: &AppSpec, current: &AppState) -> ChangeSet {
    let desired = desired.clone().normalized();
    let observed = current.spec.clone().normalized();
    let mut changes = ChangeSet::default();

    changes.flag(ChangedField::Name, desired.name != observed.name);
    changes.flag(ChangedField::Instances, desired.instances != observed.instances);
    changes.flag(
        ChangedField::Ssh,
        desired.enable_ssh.is_some() && desired.enable_ssh != observed.enable_ssh,
    );
    changes.flag(ChangedField::Stopped, desired.stopped != observed.stopped);
    changes.flag(ChangedField::Routes, !route_diff(current, &desired).is_empty());
    changes.flag(ChangedField::Ports, desired.ports != observed.ports);
    changes.flag(ChangedField::Labels, desired.labels != observed.labels);
    changes.flag(ChangedField::Annotations, desired.annotations != observed.annotations);

    changes.flag(ChangedField::Memory, desired.memory != observed.memory);
    changes.flag(ChangedField::Disk, desired.disk != observed.disk);
    changes.flag(ChangedField::Command, desired.command != observed.command);
    changes.flag(
        ChangedField::HealthCheck,
        desired.health_check != observed.health_check,
    );

    changes.flag(ChangedField::Buildpack, desired.buildpack != observed.buildpack);
    changes.flag(ChangedField::Stack, desired.stack != observed.stack);
    changes.flag(
        ChangedField::Environment,
        desired.environment != observed.environment,
    );

    let desired_instances: HashSet<&str> = desired
        .service_bindings
        .iter()
        .map(|b| b.service_instance.as_str())
        .collect();
    let observed_instances: HashSet<&str> = observed
        .service_bindings
        .iter()
        .map(|b| b.service_instance.as_str())
        .collect();
    let instances_changed = desired_instances != observed_instances;
    changes.flag(ChangedField::ServiceInstances, instances_changed);
    changes.flag(
        ChangedField::BindingParams,
        !instances_changed && !binding_diff(current, &desired).is_empty(),
    );

    match (&desired.source, &observed.source) {
        (Source::Docker(want), Source::Docker(have)) => {
            changes.flag(ChangedField::DockerImage, want.image != have.image);
        }
        (want, have) => changes.flag(ChangedField::Source, want != have),
    }
    changes.flag(
        ChangedField::SourceHash,
        match (&desired.source_code_hash, &observed.source_code_hash) {
            (Some(want), Some(have)) => want != have,
            (Some(_), None) => true,
            _ => false,
        },
    );

    changes
}

/// Classifies the change from `current` to `desired`.
///
/// `current = None` means the application does not exist and yields
/// [`ChangeClass::Create`]. Under the blue-green strategy, any change that
/// needs new bits or staging becomes [`ChangeClass::Replace`] unless the
/// application is stopped, in which case the standard classes apply. The
/// replace guards force [`ChangeClass::Replace`] under either strategy.
#[must_use]
pub fn classify(desired: &AppSpec, current: Option<&AppState>) -> Classification {
    let Some(current) = current else {
        return Classification::create();
    };

    let changes = changed_fields(desired, current);
    let code_changed = changes.any(ChangedField::CODE);

    let class = if changes.is_empty() {
        ChangeClass::None
    } else if (desired.replace_on_params_change && changes.contains(ChangedField::BindingParams))
        || (desired.replace_on_service_plan_change
            && changes.contains(ChangedField::ServiceInstances))
    {
        ChangeClass::Replace
    } else if desired.strategy == Strategy::BlueGreen
        && current.is_started()
        && (code_changed || changes.any(ChangedField::RESTAGE))
    {
        ChangeClass::Replace
    } else if changes.any(ChangedField::RESTAGE) {
        ChangeClass::Restage
    } else if code_changed || changes.any(ChangedField::RESTART) {
        ChangeClass::Restart
    } else {
        ChangeClass::UpdateOnly
    };

    Classification {
        class,
        code_changed,
        changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BindingParams, DockerSource, RouteSpec, ServiceBinding};
    use crate::state::{BindingRecord, RouteMapping};
    use chrono::Utc;
    use serde_json::json;

    fn desired() -> AppSpec {
        serde_yaml::from_str(
            r"
name: app1
space: space-1
instances: 1
memory: 768
disk: 512
source:
  url: https://example.com/app.zip
source_code_hash: abc
environment:
  A: '1'
routes:
  - route: r1
service_bindings:
  - service_instance: si-1
",
        )
        .expect("app")
    }

    fn observed(spec: &AppSpec) -> AppState {
        AppState {
            guid: String::from("app-guid"),
            spec: spec.clone(),
            route_mappings: spec
                .routes
                .iter()
                .map(|r| RouteMapping {
                    route: r.route.clone(),
                    port: spec.route_port(r),
                    mapping_id: format!("dest-{}", r.route),
                })
                .collect(),
            service_bindings: spec
                .service_bindings
                .iter()
                .map(|b| BindingRecord {
                    service_instance: b.service_instance.clone(),
                    params: b.params.clone(),
                    binding_id: format!("binding-{}", b.service_instance),
                })
                .collect(),
            droplet_guid: Some(String::from("droplet-1")),
            droplet_image: None,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_app_is_create() {
        let result = classify(&desired(), None);
        assert_eq!(result.class, ChangeClass::Create);
        assert!(result.code_changed);
    }

    #[test]
    fn test_observed_state_fed_back_is_none() {
        let spec = desired();
        let current = observed(&spec);

        let result = classify(&current.spec, Some(&current));

        assert_eq!(result.class, ChangeClass::None);
        assert!(result.changes.is_empty());
    }

    #[test]
    fn test_scale_only_is_update_only() {
        let current = observed(&desired());
        let mut next = desired();
        next.instances = 2;

        let result = classify(&next, Some(&current));

        assert_eq!(result.class, ChangeClass::UpdateOnly);
        assert!(result.changes.contains(ChangedField::Instances));
    }

    #[test]
    fn test_memory_is_restart() {
        let current = observed(&desired());
        let mut next = desired();
        next.memory = 1024;

        assert_eq!(classify(&next, Some(&current)).class, ChangeClass::Restart);
    }

    #[test]
    fn test_environment_restage_wins_over_restart() {
        let current = observed(&desired());
        let mut next = desired();
        next.memory = 2048;
        next.environment.insert(String::from("B"), String::from("2"));

        assert_eq!(classify(&next, Some(&current)).class, ChangeClass::Restage);
    }

    #[test]
    fn test_code_change_under_standard_is_restart_with_code() {
        let current = observed(&desired());
        let mut next = desired();
        next.source_code_hash = Some(String::from("def"));

        let result = classify(&next, Some(&current));

        assert_eq!(result.class, ChangeClass::Restart);
        assert!(result.code_changed);
    }

    #[test]
    fn test_code_change_under_blue_green_is_replace() {
        let current = observed(&desired());
        let mut next = desired();
        next.strategy = Strategy::BlueGreen;
        next.source_code_hash = Some(String::from("def"));

        assert_eq!(classify(&next, Some(&current)).class, ChangeClass::Replace);
    }

    #[test]
    fn test_blue_green_on_stopped_app_falls_back() {
        let mut spec = desired();
        spec.stopped = true;
        let current = observed(&spec);
        let mut next = spec.clone();
        next.strategy = Strategy::BlueGreen;
        next.buildpack = Some(String::from("go_buildpack"));

        assert_eq!(classify(&next, Some(&current)).class, ChangeClass::Restage);
    }

    #[test]
    fn test_blue_green_scale_change_stays_in_place() {
        let current = observed(&desired());
        let mut next = desired();
        next.strategy = Strategy::BlueGreen;
        next.instances = 3;

        assert_eq!(classify(&next, Some(&current)).class, ChangeClass::UpdateOnly);
    }

    #[test]
    fn test_reserved_ports_are_not_a_change() {
        let current = observed(&desired());
        let mut next = desired();
        next.ports = vec![80, 443];

        assert_eq!(classify(&next, Some(&current)).class, ChangeClass::None);
    }

    #[test]
    fn test_route_change_is_update_only() {
        let current = observed(&desired());
        let mut next = desired();
        next.routes.push(RouteSpec {
            route: String::from("r2"),
            port: None,
        });

        let result = classify(&next, Some(&current));

        assert_eq!(result.class, ChangeClass::UpdateOnly);
        assert!(result.changes.contains(ChangedField::Routes));
    }

    #[test]
    fn test_params_guard_forces_replace() {
        let current = observed(&desired());
        let mut next = desired();
        next.service_bindings[0].params = BindingParams(json!({"plan": "large"}));

        let plain = classify(&next, Some(&current));
        assert_eq!(plain.class, ChangeClass::Restage);
        assert!(plain.changes.contains(ChangedField::BindingParams));

        next.replace_on_params_change = true;
        assert_eq!(classify(&next, Some(&current)).class, ChangeClass::Replace);
    }

    #[test]
    fn test_service_plan_guard_forces_replace() {
        let current = observed(&desired());
        let mut next = desired();
        next.service_bindings.push(ServiceBinding {
            service_instance: String::from("si-2"),
            params: BindingParams::default(),
        });
        next.replace_on_service_plan_change = true;

        let result = classify(&next, Some(&current));

        assert_eq!(result.class, ChangeClass::Replace);
        assert!(result.changes.contains(ChangedField::ServiceInstances));
        assert!(!result.changes.contains(ChangedField::BindingParams));
    }

    #[test]
    fn test_docker_image_change_is_code_change() {
        let mut spec = desired();
        spec.source = Source::Docker(DockerSource {
            image: String::from("nginx:1.26"),
            username: None,
            password: None,
        });
        spec.source_code_hash = None;
        let current = observed(&spec);
        let mut next = spec.clone();
        next.source = Source::Docker(DockerSource {
            image: String::from("nginx:1.27"),
            username: None,
            password: None,
        });

        let result = classify(&next, Some(&current));

        assert_eq!(result.class, ChangeClass::Restart);
        assert!(result.code_changed);
        assert!(result.changes.contains(ChangedField::DockerImage));
    }

    #[test]
    fn test_unset_ssh_is_not_compared() {
        let mut spec = desired();
        spec.enable_ssh = None;
        let mut current = observed(&spec);
        current.spec.enable_ssh = Some(true);

        assert_eq!(classify(&spec, Some(&current)).class, ChangeClass::None);
    }

    #[test]
    fn test_json_and_map_params_classify_identically() {
        let mut spec = desired();
        spec.service_bindings[0].params = BindingParams(json!({"a": 1}));
        let current = observed(&spec);

        let mut next = spec.clone();
        next.service_bindings[0].params = BindingParams::from_json(r#"{"a": 1}"#).expect("json");

        assert_eq!(classify(&next, Some(&current)).class, ChangeClass::None);
    }
}
