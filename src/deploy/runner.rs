//! Stage runner with compensations.
//!
//! Stages run strictly in order. Each successful stage may leave behind a
//! compensation; when a later stage fails or the run is cancelled, the
//! recorded compensations run in reverse order, best effort, and the
//! original failure is reported together with any compensation failures.
//!
//! Cancellation is checked between stages and inside every platform wait.
//! A stage is never dropped halfway: an abandoned wait fails the stage,
//! which undoes its own partial work before the rollback starts.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::artifact::ResolvedArtifact;
use crate::error::{DeployerError, Result, StageError};
use crate::planner::DeployPlan;

use super::context::DeployContext;
use super::executor::StageExecutor;
use super::stages::{Compensation, Stage};

/// Name reported when artifact resolution fails.
const RESOLVE_ARTIFACT: &str = "resolve-artifact";

/// Outcome of one stage while running a plan.
enum Step {
    /// The stage completed.
    Done(Option<Compensation>),
    /// The stage failed.
    Failed(DeployerError),
    /// The stage abandoned a wait because the run was cancelled.
    Cancelled,
}

/// Executes deployment plans.
#[derive(Debug, Clone)]
pub struct StageRunner {
    /// Stage executor.
    executor: StageExecutor,
    /// Cancellation signal observed between and during stages.
    cancel: CancellationToken,
}

impl StageRunner {
    /// Creates a runner with its own cancellation token.
    #[must_use]
    pub fn new(executor: StageExecutor) -> Self {
        Self::new_cancellable(executor, CancellationToken::new())
    }

    fn new_cancellable(executor: StageExecutor, cancel: CancellationToken) -> Self {
        Self {
            executor: executor.with_cancellation(cancel.clone()),
            cancel,
        }
    }

    /// Uses `cancel` as the cancellation signal.
    #[must_use]
    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        Self::new_cancellable(self.executor, cancel)
    }

    /// Token that cancels runs of this runner.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stage executor.
    #[must_use]
    pub const fn executor(&self) -> &StageExecutor {
        &self.executor
    }

    /// Runs every stage of `plan`.
    ///
    /// # Errors
    ///
    /// Returns `StageError::Failed` when a stage failed and the rollback
    /// completed, `StageError::Rollback` when compensations failed too, and
    /// `StageError::Cancelled` when the run was cancelled.
    pub async fn run(&self, plan: &DeployPlan, ctx: &mut DeployContext) -> Result<()> {
        let mut compensations = Vec::new();
        self.run_from(plan, 0, ctx, &mut compensations).await
    }

    /// Runs `plan`, resolving the artifact concurrently with application
    /// creation when the plan starts by creating the application.
    ///
    /// # Errors
    ///
    /// See [`StageRunner::run`]; an artifact failure is reported as a
    /// failure of the `resolve-artifact` step.
    pub async fn run_with_artifact<F>(&self, plan: &DeployPlan, ctx: &mut DeployContext, artifact: F) -> Result<()>
    where
        F: Future<Output = Result<ResolvedArtifact>>,
    {
        let mut compensations = Vec::new();

        if !plan.starts_with_create() {
            match artifact.await {
                Ok(resolved) => ctx.artifact = Some(resolved),
                Err(e) => return Err(self.fail(RESOLVE_ARTIFACT, e, &compensations).await),
            }
            return self.run_from(plan, 0, ctx, &mut compensations).await;
        }

        if self.cancel.is_cancelled() {
            return Err(self.cancelled(Stage::CreateApp.name(), &compensations).await);
        }

        let create_stage = Stage::CreateApp;
        info!("[1/{}] {create_stage}", plan.stage_count());
        let create = self
            .executor
            .forward(&create_stage, ctx)
            .instrument(info_span!("stage", stage = create_stage.name()));
        let (created, resolved) = tokio::join!(create, artifact);

        match created {
            Ok(compensation) => compensations.extend(compensation),
            Err(e) if e.is_cancelled() => {
                return Err(self.cancelled(create_stage.name(), &compensations).await);
            }
            Err(e) => return Err(self.fail(create_stage.name(), e, &compensations).await),
        }
        match resolved {
            Ok(resolved) => ctx.artifact = Some(resolved),
            Err(e) => return Err(self.fail(RESOLVE_ARTIFACT, e, &compensations).await),
        }

        self.run_from(plan, 1, ctx, &mut compensations).await
    }

    async fn run_from(
        &self,
        plan: &DeployPlan,
        start: usize,
        ctx: &mut DeployContext,
        compensations: &mut Vec<Compensation>,
    ) -> Result<()> {
        let total = plan.stage_count();

        for (index, stage) in plan.stages.iter().enumerate().skip(start) {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(stage.name(), compensations).await);
            }

            info!("[{}/{total}] {stage}", index + 1);
            match self.step(stage, ctx).await {
                Step::Done(compensation) => {
                    if let Some(compensation) = compensation {
                        debug!("Recorded compensation {}", compensation.name());
                        compensations.push(compensation);
                    }
                }
                Step::Failed(e) => return Err(self.fail(stage.name(), e, compensations).await),
                Step::Cancelled => return Err(self.cancelled(stage.name(), compensations).await),
            }
        }

        Ok(())
    }

    async fn step(&self, stage: &Stage, ctx: &mut DeployContext) -> Step {
        let result = self
            .executor
            .forward(stage, ctx)
            .instrument(info_span!("stage", stage = stage.name()))
            .await;

        match result {
            Ok(compensation) => Step::Done(compensation),
            Err(e) if e.is_cancelled() => Step::Cancelled,
            Err(e) => Step::Failed(e),
        }
    }

    async fn fail(&self, stage: &str, source: DeployerError, compensations: &[Compensation]) -> DeployerError {
        error!("Stage '{stage}' failed: {source}");
        let compensation_errors = self.unwind(compensations).await;

        let source = Box::new(source);
        let stage = stage.to_string();
        if compensation_errors.is_empty() {
            StageError::Failed { stage, source }.into()
        } else {
            StageError::Rollback {
                stage,
                source,
                compensation_errors,
            }
            .into()
        }
    }

    async fn cancelled(&self, stage: &str, compensations: &[Compensation]) -> DeployerError {
        warn!("Cancelled during stage '{stage}', rolling back");
        let compensation_errors = self.unwind(compensations).await;
        StageError::Cancelled {
            stage: stage.to_string(),
            compensation_errors,
        }
        .into()
    }

    /// Runs compensations newest first and collects their failures.
    ///
    /// A compensation is skipped when an older compensation deletes the
    /// application it targets.
    async fn unwind(&self, compensations: &[Compensation]) -> Vec<String> {
        let mut errors = Vec::new();
        if compensations.is_empty() {
            return errors;
        }
        info!("Rolling back {} stages", compensations.len());

        for (index, compensation) in compensations.iter().enumerate().rev() {
            let deleted_later = compensations[..index].iter().any(|c| {
                matches!(c, Compensation::DeleteApp { app_guid, .. } if app_guid == compensation.app_guid())
            });
            if deleted_later {
                debug!("Skipping {}: app is deleted by the rollback", compensation.name());
                continue;
            }

            if let Err(e) = self.executor.compensate(compensation).await {
                warn!("Compensation {} failed: {e}", compensation.name());
                errors.push(format!("{}: {e}", compensation.name()));
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudfoundry::{
        App, AppRelationships, AppRunState, BindingCreated, Build, BuildState, Destination,
        DestinationApp, Job, JobState, Lifecycle, Metadata, MockPlatform, Process,
        ProcessHealthCheck, Route, ServiceCredentialBinding,
    };
    use crate::config::{AppSpec, BindingParams, ServiceBinding, Strategy};
    use crate::error::PlatformError;
    use crate::planner::{ChangeClass, ChangeSet, RouteKey};
    use crate::state::AppState;
    use mockall::Sequence;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn spec() -> AppSpec {
        serde_yaml::from_str("name: app1\nspace: space-1\nsource:\n  path: ./build\n").expect("app")
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

    fn plan(stages: Vec<Stage>) -> DeployPlan {
        DeployPlan {
            created_at: chrono::Utc::now(),
            class: ChangeClass::UpdateOnly,
            strategy: Strategy::Standard,
            code_changed: false,
            changes: ChangeSet::default(),
            stages,
        }
    }

    fn current(guid: &str) -> AppState {
        AppState {
            guid: guid.to_string(),
            spec: spec(),
            route_mappings: vec![],
            service_bindings: vec![],
            droplet_guid: None,
            droplet_image: None,
            observed_at: chrono::Utc::now(),
        }
    }

    fn runner(mock: MockPlatform) -> StageRunner {
        StageRunner::new(StageExecutor::new(Arc::new(mock), Duration::from_millis(5)))
    }

    fn env(key: &str, value: &str) -> BTreeMap<String, Option<String>> {
        BTreeMap::from([(key.to_string(), Some(value.to_string()))])
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let mut mock = MockPlatform::new();
        let mut seq = Sequence::new();
        mock.expect_update_environment()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_get_ssh_enabled()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));
        mock.expect_set_ssh_enabled()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let mut ctx = DeployContext::new(spec(), Some(current("app-1")));
        runner(mock)
            .run(
                &plan(vec![
                    Stage::SetEnvironment {
                        changes: env("A", "1"),
                    },
                    Stage::ConfigureSsh { enabled: true },
                ]),
                &mut ctx,
            )
            .await
            .expect("run should succeed");
    }

    #[tokio::test]
    async fn test_failure_unwinds_in_reverse_order() {
        let mut mock = MockPlatform::new();
        let mut seq = Sequence::new();
        mock.expect_update_environment()
            .withf(|_, vars| vars.contains_key("A"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_get_ssh_enabled()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));
        mock.expect_set_ssh_enabled()
            .withf(|_, enabled| *enabled)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_get_web_process()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(PlatformError::network("connection reset").into()));
        mock.expect_set_ssh_enabled()
            .withf(|_, enabled| !*enabled)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_update_environment()
            .withf(|_, vars| vars.get("A") == Some(&None))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let mut ctx = DeployContext::new(spec(), Some(current("app-1")));
        let err = runner(mock)
            .run(
                &plan(vec![
                    Stage::SetEnvironment {
                        changes: env("A", "1"),
                    },
                    Stage::ConfigureSsh { enabled: true },
                    Stage::Scale {
                        instances: 3,
                        memory_mb: 1024,
                        disk_mb: 1024,
                    },
                ]),
                &mut ctx,
            )
            .await
            .expect_err("scale should fail");

        match err {
            DeployerError::Stage(StageError::Failed { stage, .. }) => assert_eq!(stage, "scale"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_compensation_failures_are_aggregated() {
        let mut mock = MockPlatform::new();
        let mut calls = 0;
        mock.expect_update_environment().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Ok(())
            } else {
                Err(PlatformError::network("connection refused").into())
            }
        });
        mock.expect_get_web_process()
            .returning(|_| Err(PlatformError::not_found("app", "app-1").into()));

        let mut ctx = DeployContext::new(spec(), Some(current("app-1")));
        let err = runner(mock)
            .run(
                &plan(vec![
                    Stage::SetEnvironment {
                        changes: env("A", "1"),
                    },
                    Stage::Scale {
                        instances: 3,
                        memory_mb: 1024,
                        disk_mb: 1024,
                    },
                ]),
                &mut ctx,
            )
            .await
            .expect_err("scale should fail");

        match &err {
            DeployerError::Stage(StageError::Rollback {
                stage,
                compensation_errors,
                ..
            }) => {
                assert_eq!(stage, "scale");
                assert_eq!(compensation_errors.len(), 1);
                assert!(compensation_errors[0].starts_with("restore-environment"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_created_app_is_deleted_without_other_compensations() {
        let mut mock = MockPlatform::new();
        mock.expect_find_app().returning(|_, _| Ok(None));
        mock.expect_create_app()
            .returning(|_| Ok(app("app-new", "app1", AppRunState::Stopped)));
        mock.expect_get_ssh_enabled().returning(|_| Ok(false));
        mock.expect_set_ssh_enabled()
            .withf(|_, enabled| *enabled)
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_get_web_process()
            .returning(|_| Err(PlatformError::network("connection reset").into()));
        mock.expect_delete_app()
            .withf(|guid| guid == "app-new")
            .times(1)
            .returning(|_| Ok(None));

        let mut ctx = DeployContext::new(spec(), None);
        let err = runner(mock)
            .run(
                &plan(vec![
                    Stage::CreateApp,
                    Stage::ConfigureSsh { enabled: true },
                    Stage::Scale {
                        instances: 1,
                        memory_mb: 256,
                        disk_mb: 1024,
                    },
                ]),
                &mut ctx,
            )
            .await
            .expect_err("scale should fail");

        assert!(matches!(err, DeployerError::Stage(StageError::Failed { .. })));
    }

    #[tokio::test]
    async fn test_artifact_failure_rolls_back_created_app() {
        let mut mock = MockPlatform::new();
        mock.expect_find_app().returning(|_, _| Ok(None));
        mock.expect_create_app()
            .returning(|_| Ok(app("app-new", "app1", AppRunState::Stopped)));
        mock.expect_delete_app()
            .withf(|guid| guid == "app-new")
            .times(1)
            .returning(|_| Ok(None));

        let mut ctx = DeployContext::new(spec(), None);
        let artifact = async {
            Err::<ResolvedArtifact, _>(DeployerError::internal("download failed"))
        };
        let err = runner(mock)
            .run_with_artifact(
                &plan(vec![Stage::CreateApp, Stage::UploadBits { timeout_secs: 5 }]),
                &mut ctx,
                artifact,
            )
            .await
            .expect_err("artifact should fail");

        match err {
            DeployerError::Stage(StageError::Failed { stage, .. }) => assert_eq!(stage, RESOLVE_ARTIFACT),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_does_not_start_stages() {
        let mut mock = MockPlatform::new();
        mock.expect_update_environment().never();

        let runner = runner(mock);
        runner.cancellation_token().cancel();

        let mut ctx = DeployContext::new(spec(), Some(current("app-1")));
        let err = runner
            .run(
                &plan(vec![Stage::SetEnvironment {
                    changes: env("A", "1"),
                }]),
                &mut ctx,
            )
            .await
            .expect_err("run should be cancelled");

        assert!(err.is_cancelled());
    }

    fn binding(guid: &str, si: &str) -> ServiceCredentialBinding {
        serde_json::from_value(serde_json::json!({
            "guid": guid,
            "relationships": {"service_instance": {"data": {"guid": si}}}
        }))
        .expect("binding")
    }

    fn staging_build() -> Build {
        Build {
            guid: String::from("build-1"),
            state: BuildState::Staging,
            error: None,
            droplet: None,
        }
    }

    #[tokio::test]
    async fn test_cancel_during_async_bind_discards_binding_and_rolls_back() {
        let cancel = CancellationToken::new();
        let mut mock = MockPlatform::new();
        let mut seq = Sequence::new();
        mock.expect_update_environment()
            .withf(|_, vars| vars.get("A") == Some(&Some(String::from("1"))))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_list_bindings()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![]));
        mock.expect_create_binding()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(BindingCreated::Job(String::from("job-1"))));
        let token = cancel.clone();
        mock.expect_get_job()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| {
                token.cancel();
                Ok(Job {
                    guid: String::from("job-1"),
                    operation: String::from("service_bindings.create"),
                    state: JobState::Processing,
                    errors: vec![],
                })
            });
        mock.expect_list_bindings()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![binding("binding-1", "si-1")]));
        mock.expect_delete_binding()
            .withf(|guid| guid == "binding-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        mock.expect_update_environment()
            .withf(|_, vars| vars.get("A") == Some(&None))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let mut ctx = DeployContext::new(spec(), Some(current("app-1")));
        let err = runner(mock)
            .with_cancellation(cancel)
            .run(
                &plan(vec![
                    Stage::SetEnvironment {
                        changes: env("A", "1"),
                    },
                    Stage::BindServices {
                        bindings: vec![ServiceBinding {
                            service_instance: String::from("si-1"),
                            params: BindingParams::default(),
                        }],
                        timeout_secs: 5,
                    },
                ]),
                &mut ctx,
            )
            .await
            .expect_err("run should be cancelled");

        assert!(err.is_cancelled());
        match err {
            DeployerError::Stage(StageError::Cancelled {
                stage,
                compensation_errors,
            }) => {
                assert_eq!(stage, "bind-services");
                assert!(compensation_errors.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_rollback_reports_compensation_failures() {
        let cancel = CancellationToken::new();
        let mut mock = MockPlatform::new();
        let mut calls = 0;
        mock.expect_update_environment().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Ok(())
            } else {
                Err(PlatformError::network("connection refused").into())
            }
        });
        mock.expect_create_build().returning(|_| Ok(staging_build()));
        let token = cancel.clone();
        mock.expect_get_build().returning(move |_| {
            token.cancel();
            Ok(staging_build())
        });

        let mut ctx = DeployContext::new(spec(), Some(current("app-1")));
        ctx.app_guid = Some(String::from("app-1"));
        ctx.package_guid = Some(String::from("pkg-1"));
        let err = runner(mock)
            .with_cancellation(cancel)
            .run(
                &plan(vec![
                    Stage::SetEnvironment {
                        changes: env("A", "1"),
                    },
                    Stage::StageBuild { timeout_secs: 5 },
                ]),
                &mut ctx,
            )
            .await
            .expect_err("run should be cancelled");

        match &err {
            DeployerError::Stage(StageError::Cancelled {
                stage,
                compensation_errors,
            }) => {
                assert_eq!(stage, "stage-build");
                assert_eq!(compensation_errors.len(), 1);
                assert!(compensation_errors[0].starts_with("restore-environment"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_blue_green_failure_restores_venerable() {
        let mut mock = MockPlatform::new();
        let mut seq = Sequence::new();
        mock.expect_get_app()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|guid| Ok(app(guid, "app1", AppRunState::Started)));
        mock.expect_update_app()
            .withf(|guid, req| guid == "old-app" && req.name.as_deref() == Some("app1-venerable"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|guid, _| Ok(app(guid, "app1-venerable", AppRunState::Started)));
        mock.expect_find_app()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        mock.expect_create_app()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(app("new-app", "app1", AppRunState::Stopped)));
        mock.expect_get_web_process()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(process(1)));
        mock.expect_scale_web_process()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(PlatformError::network("connection reset").into()));
        mock.expect_delete_app()
            .withf(|guid| guid == "new-app")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        mock.expect_update_app()
            .withf(|guid, req| guid == "old-app" && req.name.as_deref() == Some("app1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|guid, _| Ok(app(guid, "app1", AppRunState::Started)));

        let mut ctx = DeployContext::new(spec(), Some(current("old-app")));
        let err = runner(mock)
            .run(
                &plan(vec![
                    Stage::RenameVenerable,
                    Stage::CreateApp,
                    Stage::Scale {
                        instances: 2,
                        memory_mb: 1024,
                        disk_mb: 1024,
                    },
                ]),
                &mut ctx,
            )
            .await
            .expect_err("scale should fail");

        assert!(matches!(err, DeployerError::Stage(StageError::Failed { .. })));
    }

    fn shared_route(destinations: &[(&str, &str)]) -> Route {
        Route {
            guid: String::from("r1"),
            url: String::from("app1.apps.example.com"),
            destinations: destinations
                .iter()
                .map(|(dest, app)| Destination {
                    guid: dest.to_string(),
                    app: DestinationApp {
                        guid: app.to_string(),
                    },
                    port: Some(8080),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_failure_after_route_swap_remaps_venerable() {
        let mut mock = MockPlatform::new();
        let mut seq = Sequence::new();
        mock.expect_get_app()
            .withf(|guid| guid == "old-app")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|guid| Ok(app(guid, "app1", AppRunState::Started)));
        mock.expect_update_app()
            .withf(|guid, req| guid == "old-app" && req.name.as_deref() == Some("app1-venerable"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|guid, _| Ok(app(guid, "app1-venerable", AppRunState::Started)));
        mock.expect_find_app()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        mock.expect_create_app()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(app("new-app", "app1", AppRunState::Stopped)));
        mock.expect_get_route()
            .withf(|route| route == "r1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(shared_route(&[("dest-old", "old-app")])));
        mock.expect_insert_destination()
            .withf(|route, app, port| route == "r1" && app == "new-app" && *port == 8080)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, app, port| {
                Ok(Destination {
                    guid: String::from("dest-new"),
                    app: DestinationApp {
                        guid: app.to_string(),
                    },
                    port: Some(port),
                })
            });
        mock.expect_list_app_routes()
            .withf(|guid| guid == "old-app")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![shared_route(&[("dest-old", "old-app"), ("dest-new", "new-app")])]));
        mock.expect_remove_destination()
            .withf(|route, dest| route == "r1" && dest == "dest-old")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_get_app()
            .withf(|guid| guid == "old-app")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|guid| Ok(app(guid, "app1-venerable", AppRunState::Started)));
        mock.expect_stop_app()
            .withf(|guid| guid == "old-app")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(PlatformError::network("connection reset").into()));
        mock.expect_insert_destination()
            .withf(|route, app, port| route == "r1" && app == "old-app" && *port == 8080)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, app, port| {
                Ok(Destination {
                    guid: String::from("dest-old-2"),
                    app: DestinationApp {
                        guid: app.to_string(),
                    },
                    port: Some(port),
                })
            });
        mock.expect_delete_app()
            .withf(|guid| guid == "new-app")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        mock.expect_update_app()
            .withf(|guid, req| guid == "old-app" && req.name.as_deref() == Some("app1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|guid, _| Ok(app(guid, "app1", AppRunState::Started)));
        mock.expect_remove_destination()
            .withf(|_, dest| dest == "dest-new")
            .never();

        let mut ctx = DeployContext::new(spec(), Some(current("old-app")));
        let err = runner(mock)
            .run(
                &plan(vec![
                    Stage::RenameVenerable,
                    Stage::CreateApp,
                    Stage::MapRoutes {
                        routes: vec![RouteKey::new("r1", 8080)],
                    },
                    Stage::UnmapVenerableRoutes,
                    Stage::StopVenerable,
                ]),
                &mut ctx,
            )
            .await
            .expect_err("stopping the venerable app should fail");

        match err {
            DeployerError::Stage(StageError::Failed { stage, .. }) => assert_eq!(stage, "stop-venerable"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
