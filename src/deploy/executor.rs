//! Stage execution.
//!
//! [`StageExecutor::forward`] runs one stage against the platform and
//! returns the compensation undoing it; [`StageExecutor::compensate`] runs a
//! compensation. Every stage is written so that replaying it after a failed
//! run converges instead of duplicating work.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloudfoundry::{
    AppRunState, BitsUploader, Build, BuildState, CreateAppRequest, CreateBindingRequest,
    BindingCreated, HealthCheckData, InstanceState, JobWaiter, Metadata, MetadataPatch, Platform,
    ProcessHealthCheck, ProcessUpdate, Route, ScaleRequest, UpdateAppRequest, poll_until,
};
use crate::config::{DEFAULT_APP_PORT, HealthCheck, HealthCheckType, ServiceBinding};
use crate::error::{ApiErrorDetail, DeployerError, PlatformError, Result};
use crate::planner::{RouteKey, inverse_environment, lifecycle_of, metadata_patch, stale_environment};

use super::context::DeployContext;
use super::stages::{Compensation, Stage, venerable_name};

/// Error code the platform uses for staging failures.
const STAGING_ERROR_CODE: i64 = 170_001;

/// Runs stages and compensations against the platform.
#[derive(Clone)]
pub struct StageExecutor {
    /// Platform capability.
    platform: Arc<dyn Platform>,
    /// Job waiter.
    jobs: JobWaiter,
    /// Bits uploader.
    bits: BitsUploader,
    /// Interval between polls.
    interval: Duration,
    /// Recent log lines attached to start failures.
    app_logs_max: i64,
    /// Abandons waits when the run is cancelled.
    cancel: CancellationToken,
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("interval", &self.interval)
            .field("app_logs_max", &self.app_logs_max)
            .finish_non_exhaustive()
    }
}

/// Maps a not-found error to `None`.
fn ignore_not_found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => {
            debug!("Ignoring missing resource: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn destination_port(port: Option<u16>) -> u16 {
    port.filter(|p| *p > 0).unwrap_or(DEFAULT_APP_PORT)
}

fn process_health_check(health_check: &HealthCheck) -> ProcessHealthCheck {
    ProcessHealthCheck {
        kind: health_check.check_type.as_str().to_string(),
        data: HealthCheckData {
            timeout: health_check.timeout,
            endpoint: if health_check.check_type == HealthCheckType::Http {
                health_check.http_endpoint.clone()
            } else {
                None
            },
        },
    }
}

/// Patch restoring `previous` for every key `patch` touches.
fn inverse_metadata(previous: &Metadata, patch: &MetadataPatch) -> MetadataPatch {
    MetadataPatch {
        labels: inverse_environment(&previous.labels, &patch.labels),
        annotations: inverse_environment(&previous.annotations, &patch.annotations),
    }
}

impl StageExecutor {
    /// Creates an executor polling every `interval`.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, interval: Duration) -> Self {
        Self {
            jobs: JobWaiter::new(Arc::clone(&platform)),
            bits: BitsUploader::new(Arc::clone(&platform), interval),
            platform,
            interval,
            app_logs_max: 30,
            cancel: CancellationToken::new(),
        }
    }

    /// Abandons job, package, staging and start waits when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.jobs = self.jobs.with_cancellation(cancel.clone());
        self.bits = self.bits.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    /// Sets how many recent log lines are attached to start failures
    /// (`-1` for all, `0` for none).
    #[must_use]
    pub const fn with_app_logs_max(mut self, app_logs_max: i64) -> Self {
        self.app_logs_max = app_logs_max;
        self
    }

    /// Copy whose waits ignore cancellation; rollbacks run on it.
    fn detached(&self) -> Self {
        self.clone().with_cancellation(CancellationToken::new())
    }

    /// Platform used by this executor.
    #[must_use]
    pub const fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Runs a stage, returning its compensation if it changed anything
    /// that can be undone.
    ///
    /// # Errors
    ///
    /// Returns the first platform error, a `Conflict` when a route or a
    /// binding belongs to someone else, or `Cancelled` when a wait was
    /// abandoned. Partial work of a failed stage is undone before returning.
    pub async fn forward(&self, stage: &Stage, ctx: &mut DeployContext) -> Result<Option<Compensation>> {
        match stage {
            Stage::CreateApp => self.create_app(ctx).await,
            Stage::UploadBits { .. } => self.upload_bits(stage.timeout(), ctx).await,
            Stage::CopyBits { .. } => self.copy_bits(stage.timeout(), ctx).await,
            Stage::StageBuild { .. } => self.stage_build(stage.timeout(), ctx).await,
            Stage::AssignDroplet => self.assign_droplet(ctx).await,
            Stage::SetEnvironment { changes } => self.set_environment(changes, ctx).await,
            Stage::ConfigureSsh { enabled } => self.configure_ssh(*enabled, ctx).await,
            Stage::UpdateProcess {
                command,
                health_check,
            } => self.update_process(command.as_ref(), health_check, ctx).await,
            Stage::Scale {
                instances,
                memory_mb,
                disk_mb,
            } => {
                let scale = ScaleRequest {
                    instances: *instances,
                    memory_in_mb: *memory_mb,
                    disk_in_mb: *disk_mb,
                };
                self.scale(&scale, ctx).await
            }
            Stage::PatchApp { rename, lifecycle } => {
                let request = UpdateAppRequest {
                    name: rename.clone(),
                    lifecycle: lifecycle.clone(),
                };
                self.patch_app(&request, ctx).await
            }
            Stage::SyncMetadata { patch } => self.sync_metadata(patch, ctx).await,
            Stage::CopyMetadata => self.copy_metadata(ctx).await,
            Stage::UnmapRoutes { routes } => {
                let app = ctx.app_guid()?.to_string();
                let removed = self.unmap_routes(&app, routes).await?;
                Ok((!removed.is_empty()).then_some(Compensation::MapRoutes {
                    app_guid: app,
                    routes: removed,
                }))
            }
            Stage::MapRoutes { routes } => self.map_routes(routes, ctx).await,
            Stage::UnbindServices {
                service_instances, ..
            } => {
                let app = ctx.app_guid()?.to_string();
                self.delete_bindings(&app, Some(service_instances), stage.timeout(), false)
                    .await?;
                Ok(None)
            }
            Stage::BindServices { bindings, .. } => {
                self.bind_services(bindings, stage.timeout(), ctx).await
            }
            Stage::Stop => {
                let app = ctx.app_guid()?.to_string();
                self.stop(&app).await
            }
            Stage::Start { .. } => {
                let app = ctx.app_guid()?.to_string();
                self.start(&app, stage.timeout()).await
            }
            Stage::RenameVenerable => self.rename_venerable(ctx).await,
            Stage::UnmapVenerableRoutes => {
                let venerable = ctx.venerable_guid()?.to_string();
                let removed = self.unmap_all_routes(&venerable).await?;
                Ok((!removed.is_empty()).then_some(Compensation::MapRoutes {
                    app_guid: venerable,
                    routes: removed,
                }))
            }
            Stage::StopVenerable => {
                let venerable = ctx.venerable_guid()?.to_string();
                self.stop(&venerable).await
            }
            Stage::DeleteVenerable { .. } => {
                let venerable = ctx.venerable_guid()?.to_string();
                self.delete_app(&venerable, stage.timeout()).await?;
                Ok(None)
            }
        }
    }

    /// Runs a compensation.
    ///
    /// # Errors
    ///
    /// Returns the platform error; missing resources count as already undone.
    pub async fn compensate(&self, compensation: &Compensation) -> Result<()> {
        debug!("Compensating: {}", compensation.name());
        let executor = self.detached();
        let platform = &self.platform;

        match compensation {
            Compensation::DeleteApp { app_guid, timeout } => {
                executor.delete_app(app_guid, *timeout).await?;
            }
            Compensation::PatchApp { app_guid, request } => {
                platform.update_app(app_guid, request).await?;
            }
            Compensation::AssignDroplet {
                app_guid,
                droplet_guid,
            } => platform.set_current_droplet(app_guid, droplet_guid).await?,
            Compensation::RestoreEnvironment { app_guid, vars } => {
                platform.update_environment(app_guid, vars).await?;
            }
            Compensation::ConfigureSsh { app_guid, enabled } => {
                platform.set_ssh_enabled(app_guid, *enabled).await?;
            }
            Compensation::UpdateProcess {
                process_guid,
                update,
                ..
            } => {
                platform.update_process(process_guid, update).await?;
            }
            Compensation::Scale { app_guid, scale } => {
                platform.scale_web_process(app_guid, scale).await?;
            }
            Compensation::RestoreMetadata { app_guid, patch } => {
                platform.update_metadata(app_guid, patch).await?;
            }
            Compensation::MapRoutes { app_guid, routes } => {
                for key in routes {
                    platform
                        .insert_destination(&key.route, app_guid, key.port)
                        .await?;
                }
            }
            Compensation::RemoveDestinations { destinations, .. } => {
                executor.remove_destinations(destinations).await?;
            }
            Compensation::DeleteBindings {
                binding_guids,
                timeout,
                ..
            } => {
                for binding in binding_guids {
                    executor.delete_binding(binding, *timeout).await?;
                }
            }
            Compensation::Start { app_guid } => {
                platform.start_app(app_guid).await?;
            }
            Compensation::Stop { app_guid } => {
                platform.stop_app(app_guid).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Application lifecycle
    // ------------------------------------------------------------------

    async fn create_app(&self, ctx: &mut DeployContext) -> Result<Option<Compensation>> {
        let desired = &ctx.desired;

        if let Some(existing) = self.platform.find_app(&desired.space, &desired.name).await? {
            info!("Adopting existing app {} ({})", existing.name, existing.guid);
            let environment = self.platform.get_environment(&existing.guid).await?;
            let env_changes = stale_environment(&environment, &desired.environment);
            if !env_changes.is_empty() {
                self.platform
                    .update_environment(&existing.guid, &env_changes)
                    .await?;
            }
            let patch = metadata_patch(
                &existing.metadata.labels,
                &existing.metadata.annotations,
                &desired.labels,
                &desired.annotations,
            );
            if !patch.is_empty() {
                self.platform.update_metadata(&existing.guid, &patch).await?;
            }
            ctx.app_guid = Some(existing.guid);
            return Ok(None);
        }

        let request = CreateAppRequest {
            name: desired.name.clone(),
            space_guid: desired.space.clone(),
            lifecycle: lifecycle_of(desired),
            environment: desired.environment.clone(),
            metadata: Metadata {
                labels: desired.labels.clone(),
                annotations: desired.annotations.clone(),
            },
        };
        let app = self.platform.create_app(&request).await?;
        info!("Created app {} ({})", app.name, app.guid);

        let compensation = Compensation::DeleteApp {
            app_guid: app.guid.clone(),
            timeout: desired.timeouts.delete(),
        };
        ctx.app_guid = Some(app.guid);
        Ok(Some(compensation))
    }

    async fn rename_venerable(&self, ctx: &mut DeployContext) -> Result<Option<Compensation>> {
        let current = ctx.current_guid()?.to_string();
        let app = self.platform.get_app(&current).await?;
        let venerable = venerable_name(&ctx.desired.name);

        if app.name != venerable {
            info!("Renaming {} to {venerable}", app.name);
            self.platform
                .update_app(&current, &UpdateAppRequest::rename(&venerable))
                .await?;
        }

        ctx.venerable_guid = Some(current.clone());
        ctx.app_guid = None;

        let original = ctx
            .current
            .as_ref()
            .map_or(app.name, |c| c.spec.name.clone());
        Ok(Some(Compensation::PatchApp {
            app_guid: current,
            request: UpdateAppRequest::rename(original),
        }))
    }

    async fn patch_app(
        &self,
        request: &UpdateAppRequest,
        ctx: &DeployContext,
    ) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?;
        let app = self.platform.get_app(app_guid).await?;

        let previous = UpdateAppRequest {
            name: request.name.as_ref().map(|_| app.name.clone()),
            lifecycle: request.lifecycle.as_ref().map(|_| app.lifecycle.clone()),
        };
        self.platform.update_app(app_guid, request).await?;

        Ok(Some(Compensation::PatchApp {
            app_guid: app_guid.to_string(),
            request: previous,
        }))
    }

    /// Deletes an application and waits for the deletion job.
    ///
    /// # Errors
    ///
    /// Returns the platform error; a missing application counts as deleted.
    pub async fn delete_app(&self, app_guid: &str, timeout: Duration) -> Result<()> {
        info!("Deleting app {app_guid}");
        let Some(job) = ignore_not_found(self.platform.delete_app(app_guid).await)? else {
            return Ok(());
        };
        ignore_not_found(
            self.jobs
                .wait_optional(job.as_deref(), self.interval, timeout)
                .await,
        )?;
        Ok(())
    }

    async fn stop(&self, app_guid: &str) -> Result<Option<Compensation>> {
        let app = self.platform.get_app(app_guid).await?;
        if app.state == AppRunState::Stopped {
            debug!("App {app_guid} already stopped");
            return Ok(None);
        }

        info!("Stopping app {app_guid}");
        self.platform.stop_app(app_guid).await?;
        Ok(Some(Compensation::Start {
            app_guid: app_guid.to_string(),
        }))
    }

    async fn start(&self, app_guid: &str, timeout: Duration) -> Result<Option<Compensation>> {
        let app = self.platform.get_app(app_guid).await?;
        let was_started = app.state == AppRunState::Started;

        info!("Starting app {app_guid}");
        self.platform.start_app(app_guid).await?;
        self.wait_started(app_guid, timeout).await?;

        Ok((!was_started).then(|| Compensation::Stop {
            app_guid: app_guid.to_string(),
        }))
    }

    /// Waits until every web instance runs; a crashed instance fails fast.
    async fn wait_started(&self, app_guid: &str, timeout: Duration) -> Result<()> {
        let process = self.platform.get_web_process(app_guid).await?;
        if process.instances == 0 {
            return Ok(());
        }

        let platform = &self.platform;
        let process_guid = process.guid.as_str();
        let operation = format!("start of app {app_guid}");
        let waited = poll_until(
            &operation,
            self.interval,
            timeout,
            &self.cancel,
            move || async move {
                let instances = platform.get_process_instances(process_guid).await?;
                let crashed = instances.iter().find(|i| i.state == InstanceState::Crashed);
                let outcome: Result<Option<()>> = match crashed {
                    Some(crashed) => Err(PlatformError::StartFailed {
                        app_guid: app_guid.to_string(),
                        reason: format!(
                            "instance {} crashed: {}",
                            crashed.index,
                            crashed.details.as_deref().unwrap_or("no details")
                        ),
                        logs: Vec::new(),
                    }
                    .into()),
                    None => Ok((!instances.is_empty()
                        && instances.iter().all(|i| i.state == InstanceState::Running))
                    .then_some(())),
                };
                outcome
            },
        )
        .await;

        match waited {
            Err(DeployerError::Platform(PlatformError::StartFailed {
                app_guid,
                reason,
                ..
            })) => {
                let logs = self.recent_logs(&app_guid).await;
                Err(PlatformError::StartFailed {
                    app_guid,
                    reason,
                    logs,
                }
                .into())
            }
            Err(e) if e.is_timeout() => {
                for line in self.recent_logs(app_guid).await {
                    warn!("{app_guid}: {line}");
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Recent logs of an application; a failed read yields no lines.
    async fn recent_logs(&self, app_guid: &str) -> Vec<String> {
        if self.app_logs_max == 0 {
            return Vec::new();
        }
        match self.platform.recent_logs(app_guid, self.app_logs_max).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Could not read recent logs of app {app_guid}: {e}");
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // Bits, staging, droplets
    // ------------------------------------------------------------------

    async fn upload_bits(&self, timeout: Duration, ctx: &mut DeployContext) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?.to_string();
        let artifact = ctx
            .artifact
            .as_ref()
            .ok_or_else(|| DeployerError::internal("upload-bits without a resolved artifact"))?;

        let package = match (&artifact.docker, &artifact.path) {
            (Some(docker), _) => self.bits.import_docker(&app_guid, docker, timeout).await?,
            (None, Some(path)) => self.bits.upload(&app_guid, path, timeout).await?,
            (None, None) => {
                return Err(DeployerError::internal("resolved artifact has neither bits nor image"));
            }
        };

        ctx.package_guid = Some(package.guid);
        Ok(None)
    }

    async fn copy_bits(&self, timeout: Duration, ctx: &mut DeployContext) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?.to_string();
        let source = ctx.venerable_guid()?.to_string();

        let package = self.bits.copy_from_app(&source, &app_guid, timeout).await?;
        ctx.package_guid = Some(package.guid);
        Ok(None)
    }

    async fn stage_build(&self, timeout: Duration, ctx: &mut DeployContext) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?.to_string();
        let package_guid = match &ctx.package_guid {
            Some(guid) => guid.clone(),
            None => self.current_package(&app_guid).await?,
        };

        info!("Staging package {package_guid} of app {app_guid}");
        let build = self.platform.create_build(&package_guid).await?;

        let platform = &self.platform;
        let build_guid = build.guid.as_str();
        let operation = format!("staging of app {app_guid}");
        let staged = poll_until(
            &operation,
            self.interval,
            timeout,
            &self.cancel,
            move || async move {
                let build = platform.get_build(build_guid).await?;
                let outcome: Result<Option<Build>> = match build.state {
                    BuildState::Staged => Ok(Some(build)),
                    BuildState::Failed => Err(PlatformError::JobFailed {
                        job: format!("build {build_guid}"),
                        errors: vec![ApiErrorDetail {
                            code: STAGING_ERROR_CODE,
                            title: String::from("CF-StagingError"),
                            detail: build.error.unwrap_or_else(|| String::from("staging failed")),
                        }],
                    }
                    .into()),
                    BuildState::Staging => Ok(None),
                };
                outcome
            },
        )
        .await?;

        let droplet = staged
            .droplet
            .map(|d| d.guid)
            .ok_or_else(|| PlatformError::invalid_response("staged build has no droplet"))?;
        debug!("Build {} produced droplet {droplet}", staged.guid);

        ctx.droplet_guid = Some(droplet);
        Ok(None)
    }

    /// Newest ready package of an application.
    async fn current_package(&self, app_guid: &str) -> Result<String> {
        self.platform
            .list_packages(app_guid)
            .await?
            .into_iter()
            .find(|p| p.state == crate::cloudfoundry::PackageState::Ready)
            .map(|p| p.guid)
            .ok_or_else(|| PlatformError::not_found("package", app_guid).into())
    }

    async fn assign_droplet(&self, ctx: &DeployContext) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?;
        let droplet = ctx
            .droplet_guid
            .as_deref()
            .ok_or_else(|| DeployerError::internal("assign-droplet without a staged droplet"))?;

        let previous = self.platform.get_current_droplet(app_guid).await?;
        if previous.as_ref().is_some_and(|d| d.guid == droplet) {
            return Ok(None);
        }

        self.platform.set_current_droplet(app_guid, droplet).await?;
        Ok(previous.map(|d| Compensation::AssignDroplet {
            app_guid: app_guid.to_string(),
            droplet_guid: d.guid,
        }))
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    async fn set_environment(
        &self,
        changes: &BTreeMap<String, Option<String>>,
        ctx: &DeployContext,
    ) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?;
        let previous = match &ctx.current {
            Some(current) if current.guid == app_guid => current.spec.environment.clone(),
            _ => self.platform.get_environment(app_guid).await?,
        };

        info!("Updating {} environment variables of app {app_guid}", changes.len());
        self.platform.update_environment(app_guid, changes).await?;

        Ok(Some(Compensation::RestoreEnvironment {
            app_guid: app_guid.to_string(),
            vars: inverse_environment(&previous, changes),
        }))
    }

    async fn configure_ssh(&self, enabled: bool, ctx: &DeployContext) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?;
        let previous = self.platform.get_ssh_enabled(app_guid).await?;
        if previous == enabled {
            return Ok(None);
        }

        self.platform.set_ssh_enabled(app_guid, enabled).await?;
        Ok(Some(Compensation::ConfigureSsh {
            app_guid: app_guid.to_string(),
            enabled: previous,
        }))
    }

    async fn update_process(
        &self,
        command: Option<&String>,
        health_check: &HealthCheck,
        ctx: &DeployContext,
    ) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?;
        let process = self.platform.get_web_process(app_guid).await?;

        let update = ProcessUpdate {
            command: command.cloned(),
            health_check: process_health_check(health_check),
        };
        let previous = ProcessUpdate::of(&process);
        if previous == update {
            return Ok(None);
        }

        self.platform.update_process(&process.guid, &update).await?;
        Ok(Some(Compensation::UpdateProcess {
            app_guid: app_guid.to_string(),
            process_guid: process.guid,
            update: previous,
        }))
    }

    async fn scale(&self, scale: &ScaleRequest, ctx: &DeployContext) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?;
        let process = self.platform.get_web_process(app_guid).await?;
        let previous = ScaleRequest::of(&process);
        if previous == *scale {
            return Ok(None);
        }

        info!(
            "Scaling app {app_guid} to {} x {}M",
            scale.instances, scale.memory_in_mb
        );
        self.platform.scale_web_process(app_guid, scale).await?;
        Ok(Some(Compensation::Scale {
            app_guid: app_guid.to_string(),
            scale: previous,
        }))
    }

    async fn sync_metadata(&self, patch: &MetadataPatch, ctx: &DeployContext) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?;
        let app = self.platform.get_app(app_guid).await?;

        self.platform.update_metadata(app_guid, patch).await?;
        Ok(Some(Compensation::RestoreMetadata {
            app_guid: app_guid.to_string(),
            patch: inverse_metadata(&app.metadata, patch),
        }))
    }

    /// Gives the replacement application the desired labels and
    /// annotations. Keys only the replaced application carries stay behind
    /// with it.
    async fn copy_metadata(&self, ctx: &DeployContext) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?;
        let app = self.platform.get_app(app_guid).await?;

        let patch = metadata_patch(
            &app.metadata.labels,
            &app.metadata.annotations,
            &ctx.desired.labels,
            &ctx.desired.annotations,
        );
        if !patch.is_empty() {
            debug!("Syncing metadata of replacement app {app_guid}");
            self.platform.update_metadata(app_guid, &patch).await?;
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------

    async fn map_routes(&self, routes: &[RouteKey], ctx: &DeployContext) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?;
        let venerable = ctx.venerable_guid.as_deref();
        let mut added: Vec<(String, String)> = Vec::new();

        for key in routes {
            match self.map_route(key, app_guid, venerable).await {
                Ok(Some(destination)) => added.push((key.route.clone(), destination)),
                Ok(None) => {}
                Err(e) => {
                    if let Err(undo) = self.remove_destinations(&added).await {
                        warn!("Could not remove partially mapped routes: {undo}");
                    }
                    return Err(e);
                }
            }
        }

        Ok((!added.is_empty()).then(|| Compensation::RemoveDestinations {
            app_guid: app_guid.to_string(),
            destinations: added,
        }))
    }

    /// Maps one route, returning the new destination guid, or `None` when
    /// the mapping already exists.
    async fn map_route(&self, key: &RouteKey, app_guid: &str, venerable: Option<&str>) -> Result<Option<String>> {
        let route = self.platform.get_route(&key.route).await?;

        let exists = route
            .destinations
            .iter()
            .any(|d| d.app.guid == app_guid && destination_port(d.port) == key.port);
        if exists {
            debug!("Route {key} already mapped to app {app_guid}");
            return Ok(None);
        }

        if let Some(other) = route
            .destinations
            .iter()
            .find(|d| d.app.guid != app_guid && Some(d.app.guid.as_str()) != venerable)
        {
            return Err(PlatformError::Conflict {
                message: format!(
                    "route {} ({}) is mapped to application {}",
                    route.guid, route.url, other.app.guid
                ),
            }
            .into());
        }

        let destination = self
            .platform
            .insert_destination(&key.route, app_guid, key.port)
            .await?;
        info!("Mapped route {key} to app {app_guid}");
        Ok(Some(destination.guid))
    }

    async fn unmap_routes(&self, app_guid: &str, routes: &[RouteKey]) -> Result<Vec<RouteKey>> {
        let mut removed = Vec::new();

        for key in routes {
            let Some(route) = ignore_not_found(self.platform.get_route(&key.route).await)? else {
                continue;
            };
            for destination in route
                .destinations
                .iter()
                .filter(|d| d.app.guid == app_guid && destination_port(d.port) == key.port)
            {
                ignore_not_found(
                    self.platform
                        .remove_destination(&route.guid, &destination.guid)
                        .await,
                )?;
                removed.push(key.clone());
            }
        }

        Ok(removed)
    }

    /// Removes every route destination of an application.
    ///
    /// # Errors
    ///
    /// Returns the platform error of the first failed call.
    pub async fn unmap_all_routes(&self, app_guid: &str) -> Result<Vec<RouteKey>> {
        let routes: Vec<Route> = self.platform.list_app_routes(app_guid).await?;
        let mut removed = Vec::new();

        for route in routes {
            for destination in route.destinations.iter().filter(|d| d.app.guid == app_guid) {
                ignore_not_found(
                    self.platform
                        .remove_destination(&route.guid, &destination.guid)
                        .await,
                )?;
                removed.push(RouteKey::new(route.guid.clone(), destination_port(destination.port)));
            }
        }

        if !removed.is_empty() {
            info!("Unmapped {} routes from app {app_guid}", removed.len());
        }
        Ok(removed)
    }

    async fn remove_destinations(&self, destinations: &[(String, String)]) -> Result<()> {
        for (route, destination) in destinations {
            ignore_not_found(self.platform.remove_destination(route, destination).await)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Service bindings
    // ------------------------------------------------------------------

    async fn bind_services(
        &self,
        bindings: &[ServiceBinding],
        timeout: Duration,
        ctx: &DeployContext,
    ) -> Result<Option<Compensation>> {
        let app_guid = ctx.app_guid()?;
        let existing = self.platform.list_bindings(app_guid).await?;
        let mut created: Vec<String> = Vec::new();

        for binding in bindings {
            let si = binding.service_instance.as_str();
            let result = if existing.iter().any(|b| b.service_instance_guid() == Some(si)) {
                let recorded = ctx
                    .current
                    .as_ref()
                    .filter(|c| c.guid == app_guid)
                    .and_then(|c| c.binding(si));
                if recorded.is_some_and(|r| r.params == binding.params) {
                    debug!("Service instance {si} already bound to app {app_guid}");
                    Ok(None)
                } else {
                    Err(PlatformError::Conflict {
                        message: format!(
                            "service instance {si} is already bound to app {app_guid} with other parameters"
                        ),
                    }
                    .into())
                }
            } else {
                self.create_binding(app_guid, binding, timeout).await.map(Some)
            };

            match result {
                Ok(Some(guid)) => created.push(guid),
                Ok(None) => {}
                Err(e) => {
                    let undo_executor = self.detached();
                    for guid in &created {
                        if let Err(undo) = undo_executor.delete_binding(guid, timeout).await {
                            warn!("Could not delete partially created binding {guid}: {undo}");
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok((!created.is_empty()).then(|| Compensation::DeleteBindings {
            app_guid: app_guid.to_string(),
            binding_guids: created,
            timeout,
        }))
    }

    /// Creates one binding and returns its guid once it is usable.
    async fn create_binding(&self, app_guid: &str, binding: &ServiceBinding, timeout: Duration) -> Result<String> {
        let request = CreateBindingRequest {
            app_guid: app_guid.to_string(),
            service_instance_guid: binding.service_instance.clone(),
            parameters: binding.params.to_request(),
        };

        info!("Binding service instance {} to app {app_guid}", binding.service_instance);
        match self.platform.create_binding(&request).await? {
            BindingCreated::Ready(created) => Ok(created.guid),
            BindingCreated::Job(job) => {
                if let Err(e) = self.jobs.wait(&job, self.interval, timeout).await {
                    self.discard_binding(app_guid, &binding.service_instance, timeout).await;
                    return Err(e);
                }
                self.platform
                    .list_bindings(app_guid)
                    .await?
                    .into_iter()
                    .find(|b| b.service_instance_guid() == Some(binding.service_instance.as_str()))
                    .map(|b| b.guid)
                    .ok_or_else(|| {
                        PlatformError::not_found("service credential binding", &binding.service_instance)
                            .into()
                    })
            }
        }
    }

    /// Deletes the binding of `service_instance` whose creation was not
    /// seen through, best effort.
    async fn discard_binding(&self, app_guid: &str, service_instance: &str, timeout: Duration) {
        let bindings = match self.platform.list_bindings(app_guid).await {
            Ok(bindings) => bindings,
            Err(e) => {
                warn!("Could not look up pending binding of {service_instance}: {e}");
                return;
            }
        };

        let pending = bindings
            .iter()
            .filter(|b| b.service_instance_guid() == Some(service_instance));
        let undo = self.detached();
        for binding in pending {
            info!("Discarding pending binding {} of app {app_guid}", binding.guid);
            if let Err(e) = undo.delete_binding(&binding.guid, timeout).await {
                warn!("Could not discard pending binding {}: {e}", binding.guid);
            }
        }
    }

    /// Deletes bindings of an application, all of them when
    /// `service_instances` is `None`.
    ///
    /// With `best_effort`, failures are logged and skipped and deletion jobs
    /// are not awaited.
    ///
    /// # Errors
    ///
    /// Returns the first failure unless `best_effort` is set; missing
    /// bindings count as deleted.
    pub async fn delete_bindings(
        &self,
        app_guid: &str,
        service_instances: Option<&[String]>,
        timeout: Duration,
        best_effort: bool,
    ) -> Result<()> {
        let bindings = self.platform.list_bindings(app_guid).await?;

        for binding in bindings.iter().filter(|b| {
            service_instances.is_none_or(|wanted| {
                b.service_instance_guid()
                    .is_some_and(|si| wanted.iter().any(|w| w == si))
            })
        }) {
            info!("Unbinding {} from app {app_guid}", binding.guid);
            if best_effort {
                if let Err(e) = self.platform.delete_binding(&binding.guid).await {
                    warn!("Ignoring failed deletion of binding {}: {e}", binding.guid);
                }
            } else {
                self.delete_binding(&binding.guid, timeout).await?;
            }
        }
        Ok(())
    }

    async fn delete_binding(&self, binding_guid: &str, timeout: Duration) -> Result<()> {
        let Some(job) = ignore_not_found(self.platform.delete_binding(binding_guid).await)? else {
            return Ok(());
        };
        ignore_not_found(
            self.jobs
                .wait_optional(job.as_deref(), self.interval, timeout)
                .await,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudfoundry::{
        App, AppRelationships, Destination, DestinationApp, GuidRef, Job, JobState, Lifecycle,
        MockPlatform, Process, ProcessInstance, ServiceCredentialBinding,
    };
    use crate::config::{AppSpec, BindingParams};

    const FAST: Duration = Duration::from_millis(5);

    fn spec() -> AppSpec {
        serde_yaml::from_str(
            "name: app1\nspace: space-1\nsource:\n  url: https://example.com/app.zip\nenvironment:\n  A: '1'\n",
        )
        .expect("app")
    }

    fn app(guid: &str, name: &str, state: AppRunState) -> App {
        App {
            guid: guid.to_string(),
            name: name.to_string(),
            state,
            lifecycle: Lifecycle::buildpack(None, None),
            relationships: AppRelationships::default(),
            metadata: Metadata::default(),
        }
    }

    fn process(instances: u32) -> Process {
        Process {
            guid: String::from("proc-1"),
            kind: String::from("web"),
            command: None,
            instances,
            memory_in_mb: 1024,
            disk_in_mb: 1024,
            health_check: ProcessHealthCheck::default(),
        }
    }

    fn route(guid: &str, destinations: Vec<(&str, &str, u16)>) -> Route {
        Route {
            guid: guid.to_string(),
            url: format!("{guid}.apps.example.com"),
            destinations: destinations
                .into_iter()
                .map(|(dest, app, port)| Destination {
                    guid: dest.to_string(),
                    app: DestinationApp {
                        guid: app.to_string(),
                    },
                    port: Some(port),
                })
                .collect(),
        }
    }

    fn binding(guid: &str, si: &str) -> ServiceCredentialBinding {
        serde_json::from_value(serde_json::json!({
            "guid": guid,
            "relationships": {
                "app": {"data": {"guid": "app-1"}},
                "service_instance": {"data": {"guid": si}}
            }
        }))
        .expect("binding")
    }

    fn executor(mock: MockPlatform) -> StageExecutor {
        StageExecutor::new(Arc::new(mock), FAST)
    }

    fn ctx_with_app() -> DeployContext {
        let mut ctx = DeployContext::new(spec(), None);
        ctx.app_guid = Some(String::from("app-1"));
        ctx
    }

    #[tokio::test]
    async fn test_create_app_records_delete_compensation() {
        let mut mock = MockPlatform::new();
        mock.expect_find_app().times(1).returning(|_, _| Ok(None));
        mock.expect_create_app()
            .withf(|req| req.name == "app1" && req.environment.get("A").map(String::as_str) == Some("1"))
            .times(1)
            .returning(|_| Ok(app("app-1", "app1", AppRunState::Stopped)));

        let mut ctx = DeployContext::new(spec(), None);
        let compensation = executor(mock)
            .forward(&Stage::CreateApp, &mut ctx)
            .await
            .expect("create should succeed");

        assert_eq!(ctx.app_guid.as_deref(), Some("app-1"));
        assert!(matches!(
            compensation,
            Some(Compensation::DeleteApp { ref app_guid, .. }) if app_guid == "app-1"
        ));
    }

    #[tokio::test]
    async fn test_create_app_adopts_existing() {
        let mut mock = MockPlatform::new();
        mock.expect_find_app()
            .returning(|_, _| Ok(Some(app("app-9", "app1", AppRunState::Stopped))));
        mock.expect_get_environment().returning(|_| {
            Ok(BTreeMap::from([(String::from("A"), String::from("1"))]))
        });
        mock.expect_create_app().never();
        mock.expect_update_environment().never();
        mock.expect_update_metadata().never();

        let mut ctx = DeployContext::new(spec(), None);
        let compensation = executor(mock)
            .forward(&Stage::CreateApp, &mut ctx)
            .await
            .expect("adopt should succeed");

        assert_eq!(ctx.app_guid.as_deref(), Some("app-9"));
        assert!(compensation.is_none());
    }

    #[tokio::test]
    async fn test_failed_build_surfaces_job_failed() {
        let mut mock = MockPlatform::new();
        mock.expect_create_build().returning(|_| {
            Ok(Build {
                guid: String::from("build-1"),
                state: BuildState::Staging,
                error: None,
                droplet: None,
            })
        });
        mock.expect_get_build().returning(|_| {
            Ok(Build {
                guid: String::from("build-1"),
                state: BuildState::Failed,
                error: Some(String::from("NoAppDetectedError")),
                droplet: None,
            })
        });

        let mut ctx = ctx_with_app();
        ctx.package_guid = Some(String::from("pkg-1"));
        let err = executor(mock)
            .forward(&Stage::StageBuild { timeout_secs: 5 }, &mut ctx)
            .await
            .expect_err("staging should fail");

        match err {
            DeployerError::Platform(PlatformError::JobFailed { errors, .. }) => {
                assert_eq!(errors[0].code, STAGING_ERROR_CODE);
                assert_eq!(errors[0].detail, "NoAppDetectedError");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stage_build_records_droplet() {
        let mut mock = MockPlatform::new();
        mock.expect_list_packages().returning(|_| {
            Ok(vec![serde_json::from_value(serde_json::json!({
                "guid": "pkg-7", "type": "bits", "state": "READY"
            }))
            .expect("package")])
        });
        mock.expect_create_build()
            .withf(|pkg| pkg == "pkg-7")
            .returning(|_| {
                Ok(Build {
                    guid: String::from("build-1"),
                    state: BuildState::Staged,
                    error: None,
                    droplet: Some(GuidRef {
                        guid: String::from("droplet-2"),
                    }),
                })
            });
        mock.expect_get_build().returning(|_| {
            Ok(Build {
                guid: String::from("build-1"),
                state: BuildState::Staged,
                error: None,
                droplet: Some(GuidRef {
                    guid: String::from("droplet-2"),
                }),
            })
        });

        let mut ctx = ctx_with_app();
        executor(mock)
            .forward(&Stage::StageBuild { timeout_secs: 5 }, &mut ctx)
            .await
            .expect("staging should succeed");

        assert_eq!(ctx.droplet_guid.as_deref(), Some("droplet-2"));
    }

    #[tokio::test]
    async fn test_map_routes_skips_existing_mapping() {
        let mut mock = MockPlatform::new();
        mock.expect_get_route()
            .returning(|guid| Ok(route(guid, vec![("dest-1", "app-1", 8080)])));
        mock.expect_insert_destination().never();

        let mut ctx = ctx_with_app();
        let compensation = executor(mock)
            .forward(
                &Stage::MapRoutes {
                    routes: vec![RouteKey::new("r1", 8080)],
                },
                &mut ctx,
            )
            .await
            .expect("map should succeed");

        assert!(compensation.is_none());
    }

    #[tokio::test]
    async fn test_map_routes_conflict_undoes_partial_work() {
        let mut mock = MockPlatform::new();
        mock.expect_get_route().returning(|guid| {
            if guid == "r1" {
                Ok(route("r1", vec![]))
            } else {
                Ok(route("r2", vec![("dest-x", "other-app", 8080)]))
            }
        });
        mock.expect_insert_destination()
            .times(1)
            .returning(|_, app, port| {
                Ok(Destination {
                    guid: String::from("dest-new"),
                    app: DestinationApp {
                        guid: app.to_string(),
                    },
                    port: Some(port),
                })
            });
        mock.expect_remove_destination()
            .withf(|route, dest| route == "r1" && dest == "dest-new")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut ctx = ctx_with_app();
        let err = executor(mock)
            .forward(
                &Stage::MapRoutes {
                    routes: vec![RouteKey::new("r1", 8080), RouteKey::new("r2", 8080)],
                },
                &mut ctx,
            )
            .await
            .expect_err("route r2 belongs to another app");

        assert!(matches!(err, DeployerError::Platform(PlatformError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_map_routes_tolerates_venerable_destination() {
        let mut mock = MockPlatform::new();
        mock.expect_get_route()
            .returning(|guid| Ok(route(guid, vec![("dest-old", "old-app", 8080)])));
        mock.expect_insert_destination().times(1).returning(|_, app, port| {
            Ok(Destination {
                guid: String::from("dest-new"),
                app: DestinationApp {
                    guid: app.to_string(),
                },
                port: Some(port),
            })
        });

        let mut ctx = ctx_with_app();
        ctx.venerable_guid = Some(String::from("old-app"));
        let compensation = executor(mock)
            .forward(
                &Stage::MapRoutes {
                    routes: vec![RouteKey::new("r1", 8080)],
                },
                &mut ctx,
            )
            .await
            .expect("map should succeed");

        assert_eq!(
            compensation,
            Some(Compensation::RemoveDestinations {
                app_guid: String::from("app-1"),
                destinations: vec![(String::from("r1"), String::from("dest-new"))],
            })
        );
    }

    #[tokio::test]
    async fn test_bind_services_waits_for_async_job() {
        let mut mock = MockPlatform::new();
        let mut listed = 0;
        mock.expect_list_bindings().times(2).returning(move |_| {
            listed += 1;
            if listed == 1 {
                Ok(vec![])
            } else {
                Ok(vec![binding("binding-1", "si-1")])
            }
        });
        mock.expect_create_binding()
            .withf(|req| req.service_instance_guid == "si-1" && req.parameters.is_none())
            .returning(|_| Ok(BindingCreated::Job(String::from("job-1"))));
        mock.expect_get_job().returning(|_| {
            Ok(Job {
                guid: String::from("job-1"),
                operation: String::from("service_bindings.create"),
                state: JobState::Complete,
                errors: vec![],
            })
        });

        let mut ctx = ctx_with_app();
        let compensation = executor(mock)
            .forward(
                &Stage::BindServices {
                    bindings: vec![ServiceBinding {
                        service_instance: String::from("si-1"),
                        params: BindingParams::default(),
                    }],
                    timeout_secs: 5,
                },
                &mut ctx,
            )
            .await
            .expect("bind should succeed");

        assert!(matches!(
            compensation,
            Some(Compensation::DeleteBindings { ref binding_guids, .. }) if binding_guids == &vec![String::from("binding-1")]
        ));
    }

    #[tokio::test]
    async fn test_unbind_tolerates_missing_binding() {
        let mut mock = MockPlatform::new();
        mock.expect_list_bindings()
            .returning(|_| Ok(vec![binding("binding-1", "si-1"), binding("binding-2", "si-2")]));
        mock.expect_delete_binding()
            .withf(|guid| guid == "binding-1")
            .times(1)
            .returning(|guid| Err(PlatformError::not_found("service credential binding", guid).into()));

        let mut ctx = ctx_with_app();
        let compensation = executor(mock)
            .forward(
                &Stage::UnbindServices {
                    service_instances: vec![String::from("si-1")],
                    timeout_secs: 5,
                },
                &mut ctx,
            )
            .await
            .expect("unbind should succeed");

        assert!(compensation.is_none());
    }

    #[tokio::test]
    async fn test_start_crash_attaches_logs() {
        let mut mock = MockPlatform::new();
        mock.expect_get_app()
            .returning(|guid| Ok(app(guid, "app1", AppRunState::Stopped)));
        mock.expect_start_app()
            .returning(|guid| Ok(app(guid, "app1", AppRunState::Started)));
        mock.expect_get_web_process().returning(|_| Ok(process(1)));
        mock.expect_get_process_instances().returning(|_| {
            Ok(vec![ProcessInstance {
                index: 0,
                state: InstanceState::Crashed,
                details: Some(String::from("exit status 1")),
            }])
        });
        mock.expect_recent_logs()
            .withf(|_, limit| *limit == 30)
            .returning(|_, _| Ok(vec![String::from("ERR panic: boom")]));

        let mut ctx = ctx_with_app();
        let err = executor(mock)
            .forward(&Stage::Start { timeout_secs: 5 }, &mut ctx)
            .await
            .expect_err("start should fail");

        match err {
            DeployerError::Platform(PlatformError::StartFailed { logs, reason, .. }) => {
                assert_eq!(logs, vec![String::from("ERR panic: boom")]);
                assert!(reason.contains("exit status 1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_start_waits_for_running_instances() {
        let mut mock = MockPlatform::new();
        mock.expect_get_app()
            .returning(|guid| Ok(app(guid, "app1", AppRunState::Stopped)));
        mock.expect_start_app()
            .times(1)
            .returning(|guid| Ok(app(guid, "app1", AppRunState::Started)));
        mock.expect_get_web_process().returning(|_| Ok(process(2)));
        let mut polls = 0;
        mock.expect_get_process_instances().returning(move |_| {
            polls += 1;
            let state = if polls < 3 {
                InstanceState::Starting
            } else {
                InstanceState::Running
            };
            Ok((0..2)
                .map(|index| ProcessInstance {
                    index,
                    state,
                    details: None,
                })
                .collect())
        });

        let mut ctx = ctx_with_app();
        let compensation = executor(mock)
            .forward(&Stage::Start { timeout_secs: 5 }, &mut ctx)
            .await
            .expect("start should succeed");

        assert_eq!(
            compensation,
            Some(Compensation::Stop {
                app_guid: String::from("app-1")
            })
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut mock = MockPlatform::new();
        mock.expect_get_app()
            .returning(|guid| Ok(app(guid, "app1", AppRunState::Stopped)));
        mock.expect_stop_app().never();

        let mut ctx = ctx_with_app();
        let compensation = executor(mock)
            .forward(&Stage::Stop, &mut ctx)
            .await
            .expect("stop should succeed");

        assert!(compensation.is_none());
    }

    #[tokio::test]
    async fn test_scale_compensation_restores_previous() {
        let mut mock = MockPlatform::new();
        mock.expect_get_web_process().returning(|_| Ok(process(1)));
        mock.expect_scale_web_process()
            .withf(|_, scale| scale.instances == 2)
            .times(1)
            .returning(|_, _| Ok(process(2)));

        let mut ctx = ctx_with_app();
        let compensation = executor(mock)
            .forward(
                &Stage::Scale {
                    instances: 2,
                    memory_mb: 1024,
                    disk_mb: 1024,
                },
                &mut ctx,
            )
            .await
            .expect("scale should succeed");

        assert_eq!(
            compensation,
            Some(Compensation::Scale {
                app_guid: String::from("app-1"),
                scale: ScaleRequest {
                    instances: 1,
                    memory_in_mb: 1024,
                    disk_in_mb: 1024
                },
            })
        );
    }

    #[tokio::test]
    async fn test_rename_venerable_moves_app_aside() {
        let mut mock = MockPlatform::new();
        mock.expect_get_app()
            .returning(|guid| Ok(app(guid, "app1", AppRunState::Started)));
        mock.expect_update_app()
            .withf(|guid, req| guid == "old-app" && req.name.as_deref() == Some("app1-venerable"))
            .times(1)
            .returning(|guid, _| Ok(app(guid, "app1-venerable", AppRunState::Started)));

        let current = crate::state::AppState {
            guid: String::from("old-app"),
            spec: spec(),
            route_mappings: vec![],
            service_bindings: vec![],
            droplet_guid: None,
            droplet_image: None,
            observed_at: chrono::Utc::now(),
        };
        let mut ctx = DeployContext::new(spec(), Some(current));
        let compensation = executor(mock)
            .forward(&Stage::RenameVenerable, &mut ctx)
            .await
            .expect("rename should succeed");

        assert_eq!(ctx.venerable_guid.as_deref(), Some("old-app"));
        assert!(ctx.app_guid.is_none());
        assert_eq!(
            compensation,
            Some(Compensation::PatchApp {
                app_guid: String::from("old-app"),
                request: UpdateAppRequest::rename("app1"),
            })
        );
    }

    #[tokio::test]
    async fn test_set_environment_inverse_uses_observed_values() {
        let mut mock = MockPlatform::new();
        mock.expect_update_environment()
            .withf(|_, vars| vars.get("X") == Some(&None))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut observed = spec();
        observed.environment.insert(String::from("X"), String::from("99"));
        let current = crate::state::AppState {
            guid: String::from("app-1"),
            spec: observed,
            route_mappings: vec![],
            service_bindings: vec![],
            droplet_guid: None,
            droplet_image: None,
            observed_at: chrono::Utc::now(),
        };
        let mut ctx = DeployContext::new(spec(), Some(current));
        let changes = BTreeMap::from([(String::from("X"), None)]);

        let compensation = executor(mock)
            .forward(&Stage::SetEnvironment { changes }, &mut ctx)
            .await
            .expect("env update should succeed");

        assert_eq!(
            compensation,
            Some(Compensation::RestoreEnvironment {
                app_guid: String::from("app-1"),
                vars: BTreeMap::from([(String::from("X"), Some(String::from("99")))]),
            })
        );
    }

    #[tokio::test]
    async fn test_delete_app_tolerates_not_found() {
        let mut mock = MockPlatform::new();
        mock.expect_delete_app()
            .returning(|guid| Err(PlatformError::not_found("app", guid).into()));

        executor(mock)
            .compensate(&Compensation::DeleteApp {
                app_guid: String::from("gone"),
                timeout: Duration::from_secs(1),
            })
            .await
            .expect("missing app counts as deleted");
    }

    fn ctx_replacing() -> DeployContext {
        let mut ctx = ctx_with_app();
        ctx.app_guid = Some(String::from("new-app"));
        ctx.venerable_guid = Some(String::from("old-app"));
        ctx
    }

    #[tokio::test]
    async fn test_copy_bits_takes_ready_package_of_venerable() {
        let mut mock = MockPlatform::new();
        mock.expect_list_packages()
            .withf(|app| app == "old-app")
            .times(1)
            .returning(|_| {
                Ok(vec![
                    serde_json::from_value(serde_json::json!({
                        "guid": "pkg-stale", "type": "bits", "state": "FAILED"
                    }))
                    .expect("package"),
                    serde_json::from_value(serde_json::json!({
                        "guid": "pkg-old", "type": "bits", "state": "READY"
                    }))
                    .expect("package"),
                ])
            });
        mock.expect_copy_package()
            .withf(|source, app| source == "pkg-old" && app == "new-app")
            .times(1)
            .returning(|_, _| {
                Ok(serde_json::from_value(serde_json::json!({
                    "guid": "pkg-new", "type": "bits", "state": "READY"
                }))
                .expect("package"))
            });

        let mut ctx = ctx_replacing();
        let compensation = executor(mock)
            .forward(&Stage::CopyBits { timeout_secs: 5 }, &mut ctx)
            .await
            .expect("copy should succeed");

        assert!(compensation.is_none());
        assert_eq!(ctx.package_guid.as_deref(), Some("pkg-new"));
    }

    #[tokio::test]
    async fn test_copy_metadata_applies_desired_keys_only() {
        let mut mock = MockPlatform::new();
        mock.expect_get_app()
            .withf(|guid| guid == "new-app")
            .returning(|_| Ok(app("new-app", "app1", AppRunState::Stopped)));
        mock.expect_get_app()
            .withf(|guid| guid == "old-app")
            .never();
        mock.expect_update_metadata()
            .withf(|guid, patch| {
                guid == "new-app"
                    && patch.labels == BTreeMap::from([(String::from("team"), Some(String::from("a")))])
                    && patch.annotations.is_empty()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut ctx = ctx_replacing();
        ctx.desired
            .labels
            .insert(String::from("team"), String::from("a"));
        let compensation = executor(mock)
            .forward(&Stage::CopyMetadata, &mut ctx)
            .await
            .expect("copy metadata should succeed");

        assert!(compensation.is_none());
    }

    #[tokio::test]
    async fn test_copy_metadata_skips_write_when_nothing_desired() {
        let mut mock = MockPlatform::new();
        mock.expect_get_app()
            .returning(|_| Ok(app("new-app", "app1", AppRunState::Stopped)));
        mock.expect_update_metadata().never();

        let mut ctx = ctx_replacing();
        executor(mock)
            .forward(&Stage::CopyMetadata, &mut ctx)
            .await
            .expect("copy metadata should succeed");
    }

    #[tokio::test]
    async fn test_unmap_venerable_routes_records_remap() {
        let mut mock = MockPlatform::new();
        mock.expect_list_app_routes()
            .withf(|guid| guid == "old-app")
            .returning(|_| {
                Ok(vec![route(
                    "r1",
                    vec![("dest-old", "old-app", 8080), ("dest-new", "new-app", 8080)],
                )])
            });
        mock.expect_remove_destination()
            .withf(|route, dest| route == "r1" && dest == "dest-old")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut ctx = ctx_replacing();
        let compensation = executor(mock)
            .forward(&Stage::UnmapVenerableRoutes, &mut ctx)
            .await
            .expect("unmap should succeed");

        match compensation {
            Some(Compensation::MapRoutes { app_guid, routes }) => {
                assert_eq!(app_guid, "old-app");
                assert_eq!(routes, vec![RouteKey::new("r1", 8080)]);
            }
            other => panic!("unexpected compensation: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_venerable_records_start() {
        let mut mock = MockPlatform::new();
        mock.expect_get_app()
            .withf(|guid| guid == "old-app")
            .returning(|_| Ok(app("old-app", "app1-venerable", AppRunState::Started)));
        mock.expect_stop_app()
            .withf(|guid| guid == "old-app")
            .times(1)
            .returning(|_| Ok(app("old-app", "app1-venerable", AppRunState::Stopped)));

        let mut ctx = ctx_replacing();
        let compensation = executor(mock)
            .forward(&Stage::StopVenerable, &mut ctx)
            .await
            .expect("stop should succeed");

        assert!(matches!(
            compensation,
            Some(Compensation::Start { ref app_guid }) if app_guid == "old-app"
        ));
    }

    #[tokio::test]
    async fn test_delete_venerable_waits_for_job() {
        let mut mock = MockPlatform::new();
        mock.expect_delete_app()
            .withf(|guid| guid == "old-app")
            .times(1)
            .returning(|_| Ok(Some(String::from("job-9"))));
        let mut polls = 0;
        mock.expect_get_job().times(2).returning(move |guid| {
            polls += 1;
            Ok(Job {
                guid: guid.to_string(),
                operation: String::from("app.delete"),
                state: if polls == 1 {
                    JobState::Processing
                } else {
                    JobState::Complete
                },
                errors: vec![],
            })
        });

        let mut ctx = ctx_replacing();
        let compensation = executor(mock)
            .forward(&Stage::DeleteVenerable { timeout_secs: 5 }, &mut ctx)
            .await
            .expect("delete should succeed");

        assert!(compensation.is_none());
    }

    #[tokio::test]
    async fn test_venerable_stage_without_venerable_fails() {
        let mock = MockPlatform::new();

        let mut ctx = ctx_with_app();
        let result = executor(mock).forward(&Stage::StopVenerable, &mut ctx).await;

        assert!(result.is_err());
    }
}
