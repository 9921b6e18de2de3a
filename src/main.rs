//! cfdeploy CLI entrypoint.
//!
//! This is the main entrypoint for the cfdeploy command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use cf_app_deployer::artifact::{ArtifactResolver, Workspace};
use cf_app_deployer::cli::{Cli, Commands, OutputFormatter, StateCommands};
use cf_app_deployer::cloudfoundry::CfClient;
use cf_app_deployer::config::{
    ConfigHasher, ConfigParser, ConfigValidator, DeployDocument, find_config_file,
};
use cf_app_deployer::error::{ConfigError, DeployerError, Result, StateError};
use cf_app_deployer::reconciler::Reconciler;
use cf_app_deployer::state::{
    DeploymentHistoryEntry, DeploymentOperation, LEGACY_STATE_VERSION,
    LocalStateStore, STATE_DIR, StateStore, decode_state, state_version,
};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code of a run cancelled by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancelled() => {
            eprintln!("Cancelled: {e}");
            ExitCode::from(EXIT_CANCELLED)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system; `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Validate => cmd_validate(config, &formatter),
        Commands::Plan => cmd_plan(config, &formatter).await,
        Commands::Apply { yes } => cmd_apply(config, yes, &formatter).await,
        Commands::Status => cmd_status(config, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Validate the deployment document.
fn cmd_validate(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let document = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&document);
    emit(&formatter.format_validation(&result));

    match result.errors.first() {
        Some(first) => Err(ConfigError::validation(first.message.clone(), first.field.clone()).into()),
        None => Ok(()),
    }
}

/// Show what apply would change.
async fn cmd_plan(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (document, store) = load_document_and_state(config_path)?;
    let reconciler = create_reconciler(&document, CancellationToken::new())?;

    let state = store.load().await?;
    let previous = state.as_ref().and_then(|s| s.app.as_ref());

    let plan = reconciler.plan(&document.app, previous).await?;
    emit(&formatter.format_plan(&plan));
    Ok(())
}

/// Apply the deployment document.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (document, store) = load_document_and_state(config_path)?;
    let reconciler = create_reconciler(&document, cancel_on_ctrl_c())?;

    let lock = store.acquire_lock("apply").await?;
    let result = apply_locked(&document, &store, &reconciler, auto_approve, formatter).await;
    release_lock(&store, &lock.lock_id).await;
    result
}

async fn apply_locked(
    document: &DeployDocument,
    store: &LocalStateStore,
    reconciler: &Reconciler,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let mut state = store.load().await?.unwrap_or_default();
    let spec_hash = ConfigHasher::new().hash_app(&document.app);

    if !auto_approve {
        let plan = reconciler.plan(&document.app, state.app.as_ref()).await?;
        emit(&formatter.format_plan(&plan));
        if plan.is_empty() {
            return Ok(());
        }
        if !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(());
        }
    }

    match reconciler.reconcile(&document.app, state.app.as_ref()).await {
        Ok(outcome) => {
            state.set_app(outcome.state.clone(), &spec_hash);
            state.add_history(DeploymentHistoryEntry::new(
                DeploymentOperation::Apply,
                &spec_hash,
                Some(outcome.class.to_string()),
            ));
            store.save(&state).await?;
            emit(&formatter.format_outcome(&outcome));
            Ok(())
        }
        Err(e) => {
            state.add_history(DeploymentHistoryEntry::failed(
                DeploymentOperation::Apply,
                &spec_hash,
                &e.to_string(),
            ));
            if let Err(save_error) = store.save(&state).await {
                warn!("Failed to record the failed apply: {save_error}");
            }
            Err(e)
        }
    }
}

/// Show the recorded and observed application.
async fn cmd_status(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (document, store) = load_document_and_state(config_path)?;

    let state = store.load().await?;
    let recorded = state.as_ref().and_then(|s| s.app.as_ref());

    let observed = match recorded {
        Some(app) => {
            let reconciler = create_reconciler(&document, CancellationToken::new())?;
            reconciler.read(app).await?
        }
        None => None,
    };

    emit(&formatter.format_status(recorded, observed.as_ref()));
    Ok(())
}

/// Destroy the application.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (document, store) = load_document_and_state(config_path)?;
    let reconciler = create_reconciler(&document, cancel_on_ctrl_c())?;

    let lock = store.acquire_lock("destroy").await?;
    let result = destroy_locked(&store, &reconciler, auto_approve, formatter).await;
    release_lock(&store, &lock.lock_id).await;
    result
}

async fn destroy_locked(
    store: &LocalStateStore,
    reconciler: &Reconciler,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let mut state = store.load().await?.unwrap_or_default();
    let Some(app) = state.app.clone() else {
        emit(&formatter.format_message("success", "No application recorded; nothing to destroy."));
        return Ok(());
    };

    if !auto_approve {
        eprintln!("App {} ({}) will be deleted with its routes and bindings.", app.spec.name, app.guid);
        if !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
            eprintln!("Destruction cancelled.");
            return Ok(());
        }
    }

    let spec_hash = state.spec_hash.clone();
    if let Err(e) = reconciler.delete(&app).await {
        state.add_history(DeploymentHistoryEntry::failed(
            DeploymentOperation::Destroy,
            &spec_hash,
            &e.to_string(),
        ));
        if let Err(save_error) = store.save(&state).await {
            warn!("Failed to record the failed destroy: {save_error}");
        }
        return Err(e);
    }

    state.clear_app();
    state.add_history(DeploymentHistoryEntry::new(
        DeploymentOperation::Destroy,
        &spec_hash,
        None,
    ));
    store.save(&state).await?;

    emit(&formatter.format_message(
        "success",
        &format!("App {} ({}) destroyed.", app.spec.name, app.guid),
    ));
    Ok(())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (_document, store) = load_document_and_state(config_path)?;

    match command {
        StateCommands::Show => match store.load().await? {
            Some(state) => emit(&formatter.format_state(&state)),
            None => emit(&formatter.format_message("warning", "No state found.")),
        },
        StateCommands::Unlock { lock_id, force } => {
            let current = store.lock_info().await?;
            match (current, lock_id, force) {
                (None, _, _) => emit(&formatter.format_message("success", "State is not locked.")),
                (Some(_), _, true) => {
                    if let Some(lock) = store.force_unlock().await? {
                        emit(&formatter.format_lock(&lock));
                    }
                    emit(&formatter.format_message("success", "State forcefully unlocked."));
                }
                (Some(lock), Some(id), false) if lock.lock_id == id => {
                    store.release_lock(&id).await?;
                    emit(&formatter.format_message("success", "State unlocked."));
                }
                (Some(lock), _, false) => {
                    emit(&formatter.format_lock(&lock));
                    emit(&formatter.format_message(
                        "error",
                        "Pass the matching --lock-id or use --force.",
                    ));
                }
            }
        }
        StateCommands::Migrate => {
            let Some(raw) = store.read_raw().await? else {
                emit(&formatter.format_message("warning", "No state found."));
                return Ok(());
            };
            let state = decode_state(&raw)?;
            let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                DeployerError::State(StateError::Corrupted {
                    message: format!("Failed to parse state file: {e}"),
                })
            })?;
            if state_version(&value) != LEGACY_STATE_VERSION {
                emit(&formatter.format_message("success", "State is already in the current format."));
                return Ok(());
            }

            store.save(&state).await?;
            emit(&formatter.format_message(
                "success",
                &format!("Migrated {} to version {}.", store.location(), state.version),
            ));
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes command output to stdout.
fn emit(output: &str) {
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = stdout.write_all(output.as_bytes()).and_then(|()| stdout.flush()) {
        debug!("Failed to write output: {e}");
    }
}

/// Asks for confirmation on stderr; true when the answer matches `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Releases the state lock, logging failures.
async fn release_lock(store: &LocalStateStore, lock_id: &str) {
    if let Err(e) = store.release_lock(lock_id).await {
        warn!("Failed to release state lock {lock_id}: {e}");
    }
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, rolling back the running stage");
            cancel.cancel();
        }
    });
    token
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory holding the deployment document.
fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads and validates the deployment document and opens its state store.
fn load_document_and_state(config_path: Option<&PathBuf>) -> Result<(DeployDocument, LocalStateStore)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let base = config_dir(&config_file);
    let parser = ConfigParser::new().with_base_path(base);
    parser.load_dotenv()?;

    let document = parser.load_with_env(&config_file)?;
    ConfigValidator::new().validate(&document)?;

    let store = match document.state.path.as_deref() {
        Some(path) if Path::new(path).is_absolute() => LocalStateStore::with_state_path(path),
        Some(path) => LocalStateStore::with_state_path(base.join(path)),
        None => LocalStateStore::with_base_dir(base.join(STATE_DIR)),
    };
    debug!("Using state at {}", store.location());

    Ok((document, store))
}

/// Creates the reconciler for the document's provider.
fn create_reconciler(document: &DeployDocument, cancel: CancellationToken) -> Result<Reconciler> {
    let provider = &document.provider;
    let token = ConfigParser::resolve_token(document)?;
    let client = CfClient::new(&provider.api_url, &token, provider.skip_ssl_validation)?;

    let root = provider.workspace.clone().unwrap_or_else(Workspace::default_root);
    let resolver = ArtifactResolver::new(Workspace::init(root)?)?;

    Ok(Reconciler::from_config(Arc::new(client), resolver, provider).with_cancellation(cancel))
}
