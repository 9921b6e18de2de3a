//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::planner::{ChangeClass, DeployPlan};
use crate::reconciler::ReconcileOutcome;
use crate::state::{AppState, DeploymentState, LockInfo};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Route row for table display.
#[derive(Tabled)]
struct RouteRow {
    #[tabled(rename = "Route")]
    route: String,
    #[tabled(rename = "Port")]
    port: u16,
    #[tabled(rename = "Destination")]
    mapping: String,
}

/// Binding row for table display.
#[derive(Tabled)]
struct BindingRow {
    #[tabled(rename = "Service Instance")]
    service_instance: String,
    #[tabled(rename = "Binding")]
    binding: String,
    #[tabled(rename = "Params")]
    params: String,
}

/// Plan stage row for table display.
#[derive(Tabled)]
struct StageRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Stage")]
    stage: String,
    #[tabled(rename = "Rollback")]
    rollback: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a deployment plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &DeployPlan) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &DeployPlan) -> String {
        if plan.is_empty() {
            return format!("{} No changes required - the app is up to date.\n", "✓".green());
        }

        let mut output = String::new();
        let _ = writeln!(
            output,
            "\nDeployment plan: {} ({} stages)",
            Self::format_class(plan.class),
            plan.stage_count()
        );
        if !plan.changes.is_empty() {
            let _ = writeln!(output, "   Changed: {}", plan.changes);
        }
        output.push('\n');

        let rows: Vec<StageRow> = plan
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| StageRow {
                index: i + 1,
                stage: stage.to_string(),
                rollback: if stage.is_forward_only() {
                    "forward-only".dimmed().to_string()
                } else {
                    String::from("undo")
                },
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        output
    }

    /// Formats the result of an apply.
    #[must_use]
    pub fn format_outcome(&self, outcome: &ReconcileOutcome) -> String {
        match self.format {
            OutputFormat::Json => to_json(outcome),
            OutputFormat::Text => {
                let mut output = if outcome.plan.is_empty() {
                    format!("{} No changes applied.\n", "✓".green())
                } else {
                    format!(
                        "{} Applied {} ({} stages)\n",
                        "✓".green(),
                        Self::format_class(outcome.class),
                        outcome.plan.stage_count()
                    )
                };
                output.push_str(&Self::format_app_text(&outcome.state));
                output
            }
        }
    }

    /// Formats the recorded and observed application.
    #[must_use]
    pub fn format_status(&self, recorded: Option<&AppState>, observed: Option<&AppState>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&StatusJson {
                recorded_guid: recorded.map(|a| a.guid.as_str()),
                exists: observed.is_some(),
                app: observed,
            }),
            OutputFormat::Text => match (recorded, observed) {
                (None, _) => String::from("No application recorded. Run 'cfdeploy apply' first.\n"),
                (Some(app), None) => format!(
                    "{} App {} ({}) no longer exists on the platform.\n",
                    "✗".red(),
                    app.spec.name,
                    app.guid
                ),
                (Some(_), Some(app)) => Self::format_app_text(app),
            },
        }
    }

    fn format_app_text(app: &AppState) -> String {
        let spec = &app.spec;
        let mut output = String::new();

        let run_state = if spec.stopped {
            "stopped".yellow().to_string()
        } else {
            "started".green().to_string()
        };
        let _ = writeln!(output, "\nApp: {} ({})", spec.name.bold(), app.guid);
        let _ = writeln!(output, "   State: {run_state}");
        let _ = writeln!(output, "   Source: {}", spec.source.describe());
        let _ = writeln!(
            output,
            "   Scale: {} x {}M memory, {}M disk",
            spec.instances, spec.memory, spec.disk
        );
        if let Some(droplet) = &app.droplet_guid {
            let _ = writeln!(output, "   Droplet: {droplet}");
        }
        if let Some(hash) = &spec.source_code_hash {
            let _ = writeln!(output, "   Source hash: {}", &hash[..12.min(hash.len())]);
        }

        if !app.route_mappings.is_empty() {
            let rows: Vec<RouteRow> = app
                .route_mappings
                .iter()
                .map(|m| RouteRow {
                    route: m.route.clone(),
                    port: m.port,
                    mapping: m.mapping_id.clone(),
                })
                .collect();
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if !app.service_bindings.is_empty() {
            let rows: Vec<BindingRow> = app
                .service_bindings
                .iter()
                .map(|b| BindingRow {
                    service_instance: b.service_instance.clone(),
                    binding: b.binding_id.clone(),
                    params: if b.params.is_empty() {
                        String::from("-")
                    } else {
                        truncate(&b.params.0.to_string(), 40)
                    },
                })
                .collect();
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        output
    }

    /// Formats deployment state.
    #[must_use]
    pub fn format_state(&self, state: &DeploymentState) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = writeln!(output, "\nState (version {})", state.version);
                let _ = writeln!(
                    output,
                    "   Spec hash: {}",
                    &state.spec_hash[..12.min(state.spec_hash.len())]
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                match &state.app {
                    Some(app) => {
                        let _ = writeln!(output, "   App: {} ({})", app.spec.name, app.guid);
                        let _ = writeln!(
                            output,
                            "   Routes: {}, bindings: {}",
                            app.route_mappings.len(),
                            app.service_bindings.len()
                        );
                    }
                    None => output.push_str("   App: none\n"),
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let detail = entry
                            .error
                            .as_deref()
                            .or(entry.change.as_deref())
                            .unwrap_or("-");
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({detail})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats validation findings.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ValidationJson {
                valid: result.is_valid(),
                errors: result
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect(),
                warnings: &result.warnings,
            }),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid.\n", "✓".green())
                } else {
                    format!("{} Configuration is invalid:\n", "✗".red())
                };
                for error in &result.errors {
                    let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                }
                if !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats a state lock.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => to_json(lock),
            OutputFormat::Text => format!(
                "Lock {} held by {} for {} since {} ({}s left)\n",
                lock.lock_id,
                lock.holder,
                lock.operation,
                lock.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a one-line message.
    #[must_use]
    pub fn format_message(&self, status: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => {
                let marker = match status {
                    "success" => "✓".green(),
                    "error" => "✗".red(),
                    _ => "⚠".yellow(),
                };
                format!("{marker} {message}\n")
            }
        }
    }

    /// Formats a change class with color.
    fn format_class(class: ChangeClass) -> String {
        let label = class.to_string();
        match class {
            ChangeClass::None => label.dimmed().to_string(),
            ChangeClass::UpdateOnly => label.green().to_string(),
            ChangeClass::Restart | ChangeClass::Restage => label.yellow().to_string(),
            ChangeClass::Replace | ChangeClass::Create => label.cyan().to_string(),
        }
    }
}

/// Truncates a string to at most `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct StatusJson<'a> {
    recorded_guid: Option<&'a str>,
    exists: bool,
    app: Option<&'a AppState>,
}

#[derive(Serialize)]
struct ValidationJson<'a> {
    valid: bool,
    errors: Vec<String>,
    warnings: &'a [String],
}
