//! Deployment plans and strategy selection.
//!
//! A plan is an ordered list of [`Stage`] values built from the change
//! classification. Nothing here talks to the platform, so plans can be
//! printed by `cfdeploy plan` and inspected in tests.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cloudfoundry::Lifecycle;
use crate::config::{AppSpec, Strategy};
use crate::deploy::Stage;
use crate::state::AppState;

use super::classify::{ChangeClass, ChangeSet, ChangedField, Classification};
use super::diff::{binding_diff, desired_route_keys, route_diff};
use super::sync::{metadata_patch, stale_environment};

/// A complete deployment plan.
#[derive(Debug, Clone, Serialize)]
pub struct DeployPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Change class the plan implements.
    pub class: ChangeClass,
    /// Strategy requested by the desired state.
    pub strategy: Strategy,
    /// Whether new bits are uploaded.
    pub code_changed: bool,
    /// Field groups that differ.
    pub changes: ChangeSet,
    /// Stages in execution order.
    pub stages: Vec<Stage>,
}

impl DeployPlan {
    /// Returns true if the plan has nothing to do.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns the number of stages.
    #[must_use]
    pub const fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the plan starts by creating the application.
    #[must_use]
    pub fn starts_with_create(&self) -> bool {
        matches!(self.stages.first(), Some(Stage::CreateApp))
    }

    /// Returns true if the plan needs the resolved artifact.
    #[must_use]
    pub fn needs_artifact(&self) -> bool {
        self.stages
            .iter()
            .any(|s| matches!(s, Stage::UploadBits { .. }))
    }

    /// Stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }
}

impl std::fmt::Display for DeployPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.stages.is_empty() {
            return write!(f, "No changes required");
        }

        let strategy = match self.strategy {
            Strategy::Standard => "standard",
            Strategy::BlueGreen => "blue-green",
        };
        writeln!(
            f,
            "Deployment Plan: {} ({strategy}, {} stages)",
            self.class,
            self.stages.len()
        )?;
        if !self.changes.is_empty() {
            writeln!(f, "Changed: {}", self.changes)?;
        }
        for (i, stage) in self.stages.iter().enumerate() {
            let marker = if stage.is_forward_only() { " [forward-only]" } else { "" };
            writeln!(f, "  {}. {stage}{marker}", i + 1)?;
        }

        Ok(())
    }
}

/// Lifecycle the application should run with.
#[must_use]
pub fn lifecycle_of(app: &AppSpec) -> Lifecycle {
    if app.docker_image().is_some() {
        Lifecycle::docker()
    } else {
        Lifecycle::buildpack(app.buildpack.as_deref(), app.stack.as_deref())
    }
}

/// Picks the stages implementing a classification.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrategySelector;

impl StrategySelector {
    /// Creates a selector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the plan for `classification`.
    ///
    /// `current` must be present for every class but
    /// [`ChangeClass::Create`]; without it the create plan is returned.
    #[must_use]
    pub fn select(
        &self,
        desired: &AppSpec,
        current: Option<&AppState>,
        classification: &Classification,
    ) -> DeployPlan {
        let desired = desired.clone().normalized();

        let stages = match (classification.class, current) {
            (ChangeClass::None, Some(_)) => Vec::new(),
            (ChangeClass::Create, _) | (_, None) => Self::create_stages(&desired),
            (ChangeClass::Replace, Some(_)) => {
                Self::replace_stages(&desired, classification.code_changed)
            }
            (class, Some(current)) => Self::in_place_stages(&desired, current, class, classification),
        };

        DeployPlan {
            created_at: Utc::now(),
            class: if current.is_none() {
                ChangeClass::Create
            } else {
                classification.class
            },
            strategy: desired.strategy,
            code_changed: classification.code_changed || current.is_none(),
            changes: classification.changes.clone(),
            stages: stages.into_iter().filter(|s| !s.is_noop()).collect(),
        }
    }

    /// create-app, bits, staging, bindings, routes, ssh, scale, start.
    fn create_stages(desired: &AppSpec) -> Vec<Stage> {
        let timeouts = desired.timeouts;
        let mut stages = vec![
            Stage::CreateApp,
            Stage::UploadBits {
                timeout_secs: timeouts.stage,
            },
            Stage::StageBuild {
                timeout_secs: timeouts.stage,
            },
            Stage::AssignDroplet,
            Stage::UpdateProcess {
                command: desired.command.clone(),
                health_check: desired.health_check.clone(),
            },
            Stage::BindServices {
                bindings: desired.service_bindings.clone(),
                timeout_secs: timeouts.bind,
            },
            Stage::MapRoutes {
                routes: desired_route_keys(desired),
            },
        ];
        if let Some(enabled) = desired.enable_ssh {
            stages.push(Stage::ConfigureSsh { enabled });
        }
        stages.push(Self::scale(desired));
        if !desired.stopped {
            stages.push(Stage::Start {
                timeout_secs: timeouts.start,
            });
        }
        stages
    }

    /// Blue-green replacement: build the sibling, move traffic, drop the
    /// venerable application. Routes are mapped to the new application
    /// before they are unmapped from the old one.
    fn replace_stages(desired: &AppSpec, code_changed: bool) -> Vec<Stage> {
        let timeouts = desired.timeouts;
        let mut stages = vec![Stage::RenameVenerable, Stage::CreateApp];

        if code_changed {
            stages.push(Stage::UploadBits {
                timeout_secs: timeouts.stage,
            });
        } else {
            stages.push(Stage::CopyBits {
                timeout_secs: timeouts.stage,
            });
        }
        stages.extend([
            Stage::StageBuild {
                timeout_secs: timeouts.stage,
            },
            Stage::AssignDroplet,
            Stage::CopyMetadata,
        ]);
        if let Some(enabled) = desired.enable_ssh {
            stages.push(Stage::ConfigureSsh { enabled });
        }
        stages.extend([
            Stage::UpdateProcess {
                command: desired.command.clone(),
                health_check: desired.health_check.clone(),
            },
            Stage::BindServices {
                bindings: desired.service_bindings.clone(),
                timeout_secs: timeouts.bind,
            },
            Stage::MapRoutes {
                routes: desired_route_keys(desired),
            },
            Self::scale(desired),
        ]);
        if !desired.stopped {
            stages.push(Stage::Start {
                timeout_secs: timeouts.start,
            });
        }
        stages.extend([
            Stage::UnmapVenerableRoutes,
            Stage::StopVenerable,
            Stage::DeleteVenerable {
                timeout_secs: timeouts.delete,
            },
        ]);
        stages
    }

    /// Mutates the running application. Reversible configuration comes
    /// first, binding deletion and staging after it, and the run-state
    /// change last.
    fn in_place_stages(
        desired: &AppSpec,
        current: &AppState,
        class: ChangeClass,
        classification: &Classification,
    ) -> Vec<Stage> {
        let changes = &classification.changes;
        let timeouts = desired.timeouts;
        let mut stages = Vec::new();

        let lifecycle_changed = changes.any(&[ChangedField::Buildpack, ChangedField::Stack]);
        stages.push(Stage::PatchApp {
            rename: changes
                .contains(ChangedField::Name)
                .then(|| desired.name.clone()),
            lifecycle: lifecycle_changed.then(|| lifecycle_of(desired)),
        });
        stages.push(Stage::SetEnvironment {
            changes: stale_environment(&current.spec.environment, &desired.environment),
        });
        stages.push(Stage::SyncMetadata {
            patch: metadata_patch(
                &current.spec.labels,
                &current.spec.annotations,
                &desired.labels,
                &desired.annotations,
            ),
        });
        if let (true, Some(enabled)) = (changes.contains(ChangedField::Ssh), desired.enable_ssh) {
            stages.push(Stage::ConfigureSsh { enabled });
        }
        if changes.any(&[ChangedField::Command, ChangedField::HealthCheck]) {
            stages.push(Stage::UpdateProcess {
                command: desired.command.clone(),
                health_check: desired.health_check.clone(),
            });
        }

        let bindings = binding_diff(current, desired);
        stages.push(Stage::UnbindServices {
            service_instances: bindings
                .to_remove
                .iter()
                .map(|b| b.service_instance.clone())
                .collect(),
            timeout_secs: timeouts.bind,
        });
        stages.push(Stage::BindServices {
            bindings: bindings.to_add,
            timeout_secs: timeouts.bind,
        });

        if classification.code_changed {
            stages.push(Stage::UploadBits {
                timeout_secs: timeouts.stage,
            });
        }
        if classification.code_changed || class == ChangeClass::Restage {
            stages.push(Stage::StageBuild {
                timeout_secs: timeouts.stage,
            });
            stages.push(Stage::AssignDroplet);
        }

        if changes.any(&[
            ChangedField::Instances,
            ChangedField::Memory,
            ChangedField::Disk,
        ]) {
            stages.push(Self::scale(desired));
        }

        let routes = route_diff(current, desired);
        stages.push(Stage::UnmapRoutes {
            routes: routes.to_remove,
        });
        stages.push(Stage::MapRoutes {
            routes: routes.to_add,
        });

        let start = Stage::Start {
            timeout_secs: timeouts.start,
        };
        match class {
            ChangeClass::Restart | ChangeClass::Restage => {
                stages.push(Stage::Stop);
                if !desired.stopped {
                    stages.push(start);
                }
            }
            _ if changes.contains(ChangedField::Stopped) => {
                stages.push(if desired.stopped { Stage::Stop } else { start });
            }
            _ => {}
        }

        stages
    }

    fn scale(desired: &AppSpec) -> Stage {
        Stage::Scale {
            instances: desired.instances,
            memory_mb: desired.memory,
            disk_mb: desired.disk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::classify;
    use crate::state::{BindingRecord, RouteMapping};

    fn desired() -> AppSpec {
        serde_yaml::from_str(
            r"
name: app1
space: space-1
memory: 768
disk: 512
source:
  url: https://example.com/app.zip
source_code_hash: abc
environment:
  A: '1'
routes:
  - route: r1
    port: 8080
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
            route_mappings: vec![RouteMapping {
                route: String::from("r1"),
                port: 8080,
                mapping_id: String::from("dest-1"),
            }],
            service_bindings: vec![BindingRecord {
                service_instance: String::from("si-1"),
                params: crate::config::BindingParams::default(),
                binding_id: String::from("binding-1"),
            }],
            droplet_guid: Some(String::from("droplet-1")),
            droplet_image: None,
            observed_at: Utc::now(),
        }
    }

    fn plan_for(next: &AppSpec, current: Option<&AppState>) -> DeployPlan {
        StrategySelector::new().select(next, current, &classify(next, current))
    }

    #[test]
    fn test_create_plan_order() {
        let plan = plan_for(&desired(), None);

        assert_eq!(plan.class, ChangeClass::Create);
        assert_eq!(
            plan.stage_names(),
            vec![
                "create-app",
                "upload-bits",
                "stage-build",
                "assign-droplet",
                "update-process",
                "bind-services",
                "map-routes",
                "scale",
                "start",
            ]
        );
        assert!(plan.starts_with_create());
        assert!(plan.needs_artifact());
    }

    #[test]
    fn test_create_plan_for_blue_green_is_the_same() {
        let mut next = desired();
        next.strategy = Strategy::BlueGreen;

        assert_eq!(
            plan_for(&next, None).stage_names(),
            plan_for(&desired(), None).stage_names()
        );
    }

    #[test]
    fn test_no_change_plan_is_empty() {
        let spec = desired();
        let current = observed(&spec);

        let plan = plan_for(&spec, Some(&current));

        assert!(plan.is_empty());
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_scale_only_plan_has_no_restart() {
        let current = observed(&desired());
        let mut next = desired();
        next.instances = 2;

        let plan = plan_for(&next, Some(&current));

        assert_eq!(plan.class, ChangeClass::UpdateOnly);
        assert_eq!(
            plan.stages,
            vec![Stage::Scale {
                instances: 2,
                memory_mb: 768,
                disk_mb: 512
            }]
        );
    }

    #[test]
    fn test_restart_plan_stops_then_starts() {
        let current = observed(&desired());
        let mut next = desired();
        next.command = Some(String::from("./server"));

        let plan = plan_for(&next, Some(&current));

        assert_eq!(plan.stage_names(), vec!["update-process", "stop", "start"]);
    }

    #[test]
    fn test_code_change_plan_uploads_and_restages() {
        let current = observed(&desired());
        let mut next = desired();
        next.source_code_hash = Some(String::from("def"));

        let plan = plan_for(&next, Some(&current));

        assert_eq!(
            plan.stage_names(),
            vec!["upload-bits", "stage-build", "assign-droplet", "stop", "start"]
        );
    }

    #[test]
    fn test_stale_environment_plan() {
        let mut spec = desired();
        spec.environment.insert(String::from("X"), String::from("99"));
        let current = observed(&spec);

        let plan = plan_for(&desired(), Some(&current));

        assert_eq!(plan.class, ChangeClass::Restage);
        let Some(Stage::SetEnvironment { changes }) = plan.stages.first() else {
            panic!("expected set-environment first, got {plan}");
        };
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.get("X"), Some(&None));
    }

    #[test]
    fn test_blue_green_plan_maps_before_unmapping_venerable() {
        let current = observed(&desired());
        let mut next = desired();
        next.strategy = Strategy::BlueGreen;
        next.source_code_hash = Some(String::from("def"));

        let plan = plan_for(&next, Some(&current));
        let names = plan.stage_names();

        assert_eq!(plan.class, ChangeClass::Replace);
        assert_eq!(names.first(), Some(&"rename-venerable"));
        assert_eq!(names.last(), Some(&"delete-venerable"));
        let map = names.iter().position(|n| *n == "map-routes").expect("map-routes");
        let unmap = names
            .iter()
            .position(|n| *n == "unmap-venerable-routes")
            .expect("unmap-venerable-routes");
        assert!(map < unmap);
        assert!(names.contains(&"upload-bits"));
    }

    #[test]
    fn test_guard_replace_without_code_change_copies_bits() {
        let current = observed(&desired());
        let mut next = desired();
        next.replace_on_params_change = true;
        next.service_bindings[0].params =
            crate::config::BindingParams(serde_json::json!({"plan": "large"}));

        let plan = plan_for(&next, Some(&current));

        assert_eq!(plan.class, ChangeClass::Replace);
        assert!(plan.stage_names().contains(&"copy-bits"));
        assert!(!plan.needs_artifact());
    }

    #[test]
    fn test_route_change_unmaps_before_mapping() {
        let current = observed(&desired());
        let mut next = desired();
        next.routes[0].route = String::from("r2");

        let plan = plan_for(&next, Some(&current));

        assert_eq!(plan.stage_names(), vec!["unmap-routes", "map-routes"]);
    }

    #[test]
    fn test_stopping_is_update_only() {
        let current = observed(&desired());
        let mut next = desired();
        next.stopped = true;

        let plan = plan_for(&next, Some(&current));

        assert_eq!(plan.class, ChangeClass::UpdateOnly);
        assert_eq!(plan.stages, vec![Stage::Stop]);
    }
}
