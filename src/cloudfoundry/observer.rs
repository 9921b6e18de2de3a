//! Application observer.
//!
//! Reads an application back from the platform and reports it in the same
//! shape as the desired state, so the classifier can compare the two.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::config::{AppSpec, HealthCheck, HealthCheckType, RouteSpec, ServiceBinding, Source};
use crate::error::Result;
use crate::state::{AppState, BindingRecord, RouteMapping};

use super::platform::Platform;
use super::types::{AppRunState, LifecycleType, Process};

/// Observer producing [`AppState`] records.
#[derive(Clone)]
pub struct AppObserver {
    /// Platform used for reads.
    platform: Arc<dyn Platform>,
}

impl std::fmt::Debug for AppObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppObserver").finish_non_exhaustive()
    }
}

impl AppObserver {
    /// Creates a new observer.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    /// Observes an application.
    ///
    /// `template` is the last known spec of the application. Fields the
    /// platform cannot report (source, ports, binding parameters, knobs) are
    /// carried from it, and fields the platform computes on its own (stack,
    /// command, ssh, health timeout) are only reported when the template sets
    /// them. Labels and annotations are restricted to the template's keys.
    ///
    /// # Errors
    ///
    /// Returns an error if any read fails; a missing application yields
    /// `NotFound`.
    pub async fn observe(&self, app_guid: &str, template: &AppSpec) -> Result<AppState> {
        debug!("Observing app {app_guid}");

        let app = self.platform.get_app(app_guid).await?;
        let process = self.platform.get_web_process(app_guid).await?;
        let environment = self.platform.get_environment(app_guid).await?;
        let enable_ssh = match template.enable_ssh {
            Some(_) => Some(self.platform.get_ssh_enabled(app_guid).await?),
            None => None,
        };
        let route_mappings = self.route_mappings(app_guid).await?;
        let service_bindings = self.binding_records(app_guid, template).await?;
        let droplet = self.platform.get_current_droplet(app_guid).await?;

        let droplet_image = droplet.as_ref().and_then(|d| d.image.clone());
        let source = observed_source(&template.source, droplet_image.as_deref());

        let buildpack = match app.lifecycle.kind {
            LifecycleType::Buildpack => app.lifecycle.first_buildpack().map(ToString::to_string),
            LifecycleType::Docker => None,
        };
        let stack = template
            .stack
            .as_ref()
            .and(app.lifecycle.data.stack.clone());
        let command = template.command.as_ref().and(process.command.clone());

        let spec = AppSpec {
            name: app.name.clone(),
            space: app
                .relationships
                .space
                .guid()
                .map_or_else(|| template.space.clone(), ToString::to_string),
            buildpack,
            stack,
            command,
            enable_ssh,
            instances: process.instances,
            memory: process.memory_in_mb,
            disk: process.disk_in_mb,
            ports: template.ports.clone(),
            health_check: observed_health_check(&process, &template.health_check),
            environment,
            routes: observed_routes(&route_mappings, template),
            service_bindings: service_bindings
                .iter()
                .map(|b| ServiceBinding {
                    service_instance: b.service_instance.clone(),
                    params: b.params.clone(),
                })
                .collect(),
            source,
            source_code_hash: template.source_code_hash.clone(),
            strategy: template.strategy,
            timeouts: template.timeouts,
            stopped: app.state == AppRunState::Stopped,
            replace_on_service_plan_change: template.replace_on_service_plan_change,
            replace_on_params_change: template.replace_on_params_change,
            labels: app
                .metadata
                .labels
                .into_iter()
                .filter(|(k, _)| template.labels.contains_key(k))
                .collect(),
            annotations: app
                .metadata
                .annotations
                .into_iter()
                .filter(|(k, _)| template.annotations.contains_key(k))
                .collect(),
        };

        Ok(AppState {
            guid: app.guid,
            spec,
            route_mappings,
            service_bindings,
            droplet_guid: droplet.map(|d| d.guid),
            droplet_image,
            observed_at: Utc::now(),
        })
    }

    /// Re-reads `state` against a new template without calling the
    /// platform: the fields only the template knows (source, ports, binding
    /// parameters, strategy, timeouts, replace guards) are taken from
    /// `template`, everything observed is kept.
    #[must_use]
    pub fn rebase(state: &AppState, template: &AppSpec) -> AppState {
        let mut rebased = state.clone();
        let spec = &mut rebased.spec;

        spec.source = observed_source(&template.source, state.droplet_image.as_deref());
        spec.source_code_hash.clone_from(&template.source_code_hash);
        spec.ports.clone_from(&template.ports);
        spec.strategy = template.strategy;
        spec.timeouts = template.timeouts;
        spec.replace_on_service_plan_change = template.replace_on_service_plan_change;
        spec.replace_on_params_change = template.replace_on_params_change;

        for record in &mut rebased.service_bindings {
            if let Some(wanted) = template
                .service_bindings
                .iter()
                .find(|t| t.service_instance == record.service_instance)
            {
                record.params = wanted.params.clone();
            }
        }
        for binding in &mut spec.service_bindings {
            if let Some(record) = rebased
                .service_bindings
                .iter()
                .find(|r| r.service_instance == binding.service_instance)
            {
                binding.params = record.params.clone();
            }
        }

        rebased
    }

    /// Reads every route destination that targets the application.
    async fn route_mappings(&self, app_guid: &str) -> Result<Vec<RouteMapping>> {
        let routes = self.platform.list_app_routes(app_guid).await?;

        Ok(routes
            .into_iter()
            .flat_map(|route| {
                let route_guid = route.guid;
                route
                    .destinations
                    .into_iter()
                    .filter(|d| d.app.guid == app_guid)
                    .map(move |d| RouteMapping {
                        route: route_guid.clone(),
                        port: d.port.unwrap_or(crate::config::DEFAULT_APP_PORT),
                        mapping_id: d.guid,
                    })
            })
            .collect())
    }

    /// Reads the app's bindings, ordered like the template.
    async fn binding_records(&self, app_guid: &str, template: &AppSpec) -> Result<Vec<BindingRecord>> {
        let bindings = self.platform.list_bindings(app_guid).await?;

        let mut records: Vec<BindingRecord> = bindings
            .into_iter()
            .filter_map(|b| {
                let service_instance = b.service_instance_guid()?.to_string();
                let params = template
                    .service_bindings
                    .iter()
                    .find(|t| t.service_instance == service_instance)
                    .map(|t| t.params.clone())
                    .unwrap_or_default();
                Some(BindingRecord {
                    service_instance,
                    params,
                    binding_id: b.guid,
                })
            })
            .collect();

        records.sort_by_key(|r| {
            template
                .service_bindings
                .iter()
                .position(|t| t.service_instance == r.service_instance)
                .unwrap_or(usize::MAX)
        });
        Ok(records)
    }
}

/// The template's source, with the image of a docker source replaced by
/// the one the current droplet runs.
fn observed_source(template: &Source, droplet_image: Option<&str>) -> Source {
    match (template, droplet_image) {
        (Source::Docker(docker), Some(image)) if image != docker.image => {
            let mut observed = docker.clone();
            observed.image = image.to_string();
            Source::Docker(observed)
        }
        (source, _) => source.clone(),
    }
}

/// Health check as reported, restricted to what the template declares.
fn observed_health_check(process: &Process, template: &HealthCheck) -> HealthCheck {
    let check_type = match process.health_check.kind.as_str() {
        "process" => HealthCheckType::Process,
        "http" => HealthCheckType::Http,
        "none" => HealthCheckType::None,
        _ => HealthCheckType::Port,
    };

    HealthCheck {
        check_type,
        http_endpoint: template
            .http_endpoint
            .as_ref()
            .and(process.health_check.data.endpoint.clone()),
        timeout: template.timeout.and(process.health_check.data.timeout),
    }
}

/// Routes in template order; a template entry whose resolved port matches is
/// reported verbatim so an unset port stays unset.
fn observed_routes(mappings: &[RouteMapping], template: &AppSpec) -> Vec<RouteSpec> {
    let mut remaining: Vec<&RouteMapping> = mappings.iter().collect();
    let mut routes = Vec::with_capacity(mappings.len());

    for declared in &template.routes {
        let port = template.route_port(declared);
        if let Some(index) = remaining
            .iter()
            .position(|m| m.route == declared.route && m.port == port)
        {
            remaining.remove(index);
            routes.push(declared.clone());
        }
    }

    routes.extend(remaining.into_iter().map(|m| RouteSpec {
        route: m.route.clone(),
        port: Some(m.port),
    }));
    routes
}
