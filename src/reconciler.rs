//! Reconciler for maintaining desired state.
//!
//! This module ties the pieces together: it refreshes the application from
//! the platform, classifies the difference with the desired state, selects
//! the plan for it, runs the plan and reports the observed result.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactResolver, ResolvedArtifact};
use crate::cloudfoundry::{AppObserver, Platform};
use crate::config::{AppSpec, ProviderConfig};
use crate::deploy::{DeployContext, StageExecutor, StageRunner};
use crate::error::{DeployerError, Result};
use crate::planner::{ChangeClass, Classification, DeployPlan, StrategySelector, classify};
use crate::state::AppState;

/// Result of a reconcile.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconcileOutcome {
    /// Change class that was applied.
    pub class: ChangeClass,
    /// Plan that ran.
    pub plan: DeployPlan,
    /// Observed application afterwards.
    pub state: AppState,
}

/// Everything known before running a plan.
struct Prepared {
    desired: AppSpec,
    current: Option<AppState>,
    classification: Classification,
    plan: DeployPlan,
    artifact: Option<ResolvedArtifact>,
}

/// Reconciler converging one application.
pub struct Reconciler {
    /// Platform capability.
    platform: Arc<dyn Platform>,
    /// Observer reading the application back.
    observer: AppObserver,
    /// Artifact resolver.
    resolver: ArtifactResolver,
    /// Stage runner.
    runner: StageRunner,
    /// Strategy selector.
    selector: StrategySelector,
    /// Delete bindings best effort on delete.
    purge_when_delete: bool,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("runner", &self.runner)
            .field("purge_when_delete", &self.purge_when_delete)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler polling every `interval`.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, resolver: ArtifactResolver, interval: Duration) -> Self {
        let executor = StageExecutor::new(Arc::clone(&platform), interval);
        Self::with_executor(platform, resolver, executor)
    }

    /// Creates a reconciler from the provider settings.
    #[must_use]
    pub fn from_config(
        platform: Arc<dyn Platform>,
        resolver: ArtifactResolver,
        provider: &ProviderConfig,
    ) -> Self {
        let executor = StageExecutor::new(
            Arc::clone(&platform),
            Duration::from_secs(provider.polling_interval_secs),
        )
        .with_app_logs_max(provider.app_logs_max);

        Self::with_executor(platform, resolver, executor)
            .with_purge_when_delete(provider.purge_when_delete)
    }

    fn with_executor(platform: Arc<dyn Platform>, resolver: ArtifactResolver, executor: StageExecutor) -> Self {
        Self {
            observer: AppObserver::new(Arc::clone(&platform)),
            platform,
            resolver,
            runner: StageRunner::new(executor),
            selector: StrategySelector::new(),
            purge_when_delete: false,
        }
    }

    /// Deletes bindings best effort, without waiting, on delete.
    #[must_use]
    pub const fn with_purge_when_delete(mut self, purge: bool) -> Self {
        self.purge_when_delete = purge;
        self
    }

    /// Uses `cancel` to cancel running plans.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.runner = self.runner.with_cancellation(cancel);
        self
    }

    /// Token cancelling running plans.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.runner.cancellation_token()
    }

    /// Converges the platform to `desired`.
    ///
    /// `previous` is the recorded state of the last run; it identifies the
    /// application and supplies the fields the platform cannot report.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh or artifact resolution fails, or the
    /// stage error of a failed plan after its rollback.
    pub async fn reconcile(&self, desired: &AppSpec, previous: Option<&AppState>) -> Result<ReconcileOutcome> {
        let Prepared {
            desired,
            current,
            plan,
            artifact,
            ..
        } = self.prepare(desired, previous).await?;

        if plan.is_empty() {
            info!("App {} is up to date", desired.name);
            let current = current
                .ok_or_else(|| DeployerError::internal("empty plan without an application"))?;
            // The platform already matches; only the locally known fields move.
            let state = AppObserver::rebase(&current, &desired);
            return Ok(ReconcileOutcome {
                class: plan.class,
                plan,
                state,
            });
        }

        info!("Applying {} plan for app {}", plan.class, desired.name);
        let mut ctx = DeployContext::new(desired.clone(), current);

        match artifact {
            Some(artifact) => {
                ctx.artifact = Some(artifact);
                self.runner.run(&plan, &mut ctx).await?;
            }
            None if plan.needs_artifact() => {
                let resolving = self
                    .resolver
                    .resolve(&desired.source, desired.source_code_hash.as_deref());
                self.runner.run_with_artifact(&plan, &mut ctx, resolving).await?;
            }
            None => self.runner.run(&plan, &mut ctx).await?,
        }

        let mut template = desired;
        if template.source_code_hash.is_none() {
            template.source_code_hash = ctx.artifact.as_ref().and_then(|a| a.hash.clone());
        }
        let state = self.observer.observe(ctx.app_guid()?, &template).await?;

        info!("App {} reconciled ({})", state.spec.name, plan.class);
        Ok(ReconcileOutcome {
            class: plan.class,
            plan,
            state,
        })
    }

    /// Computes the plan a reconcile would run, without running it.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh or artifact resolution fails.
    pub async fn plan(&self, desired: &AppSpec, previous: Option<&AppState>) -> Result<DeployPlan> {
        let prepared = self.prepare(desired, previous).await?;
        debug!(
            "Planned {} with changes [{}]",
            prepared.classification.class, prepared.classification.changes
        );
        Ok(prepared.plan)
    }

    /// Refreshes the recorded application from the platform.
    ///
    /// Returns `None` when the application no longer exists.
    ///
    /// # Errors
    ///
    /// Returns any read error other than not-found.
    pub async fn read(&self, previous: &AppState) -> Result<Option<AppState>> {
        match self.observer.observe(&previous.guid, &previous.spec).await {
            Ok(state) => Ok(Some(state)),
            Err(e) if e.is_not_found() => {
                warn!("App {} no longer exists", previous.guid);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes the recorded application: routes first, then bindings, then
    /// the application itself.
    ///
    /// # Errors
    ///
    /// Returns the first failure; missing resources count as deleted.
    pub async fn delete(&self, previous: &AppState) -> Result<()> {
        let guid = previous.guid.as_str();
        let executor = self.runner.executor();

        match self.platform.get_app(guid).await {
            Ok(app) => info!("Deleting app {} ({guid})", app.name),
            Err(e) if e.is_not_found() => {
                info!("App {guid} is already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        executor.unmap_all_routes(guid).await?;
        executor
            .delete_bindings(guid, None, previous.spec.timeouts.bind(), self.purge_when_delete)
            .await?;
        executor.delete_app(guid, previous.spec.timeouts.delete()).await
    }

    async fn prepare(&self, desired: &AppSpec, previous: Option<&AppState>) -> Result<Prepared> {
        let mut desired = desired.clone().normalized();
        let current = self.refresh(&desired, previous).await?;

        // Existing apps need the content hash before classification.
        let mut artifact = None;
        if current.is_some() && desired.docker_image().is_none() {
            let resolved = self
                .resolver
                .resolve(&desired.source, desired.source_code_hash.as_deref())
                .await?;
            if desired.source_code_hash.is_none() {
                desired.source_code_hash.clone_from(&resolved.hash);
            }
            artifact = Some(resolved);
        }

        let classification = classify(&desired, current.as_ref());
        let plan = self
            .selector
            .select(&desired, current.as_ref(), &classification);

        Ok(Prepared {
            desired,
            current,
            classification,
            plan,
            artifact,
        })
    }

    /// Current state of the application, found through the recorded guid or
    /// by name in the space.
    async fn refresh(&self, desired: &AppSpec, previous: Option<&AppState>) -> Result<Option<AppState>> {
        if let Some(previous) = previous {
            if let Some(state) = self.read(previous).await? {
                return Ok(Some(state));
            }
        }

        match self.platform.find_app(&desired.space, &desired.name).await? {
            Some(app) => {
                info!("Adopting existing app {} ({})", app.name, app.guid);
                self.observer.observe(&app.guid, desired).await.map(Some)
            }
            None => Ok(None),
        }
    }
}
