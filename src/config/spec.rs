//! Desired-state types for the deployer.
//!
//! This module defines the structs that map to the `cfdeploy.yaml` document:
//! provider settings, the state backend, and the application description.
//! Every type here is declarative; no platform ids appear in desired state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

use crate::error::ConfigError;

/// Default listening port assumed by the platform for web processes.
pub const DEFAULT_APP_PORT: u16 = 8080;

/// Ports at or below this value are treated as platform-chosen defaults.
pub const RESERVED_PORT_MAX: u16 = 1024;

/// The root document for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployDocument {
    /// Platform connection settings.
    pub provider: ProviderConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// The application to deploy.
    pub app: AppSpec,
}

/// Platform connection and deployer-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProviderConfig {
    /// Cloud Controller base URL, without trailing slash.
    #[validate(url)]
    pub api_url: String,
    /// Bearer token used for every API call.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    /// Disables TLS verification of the platform.
    #[serde(default)]
    pub skip_ssl_validation: bool,
    /// Maximum recent log lines attached to a failed start (`-1` means all).
    #[serde(default = "default_app_logs_max")]
    #[validate(range(min = -1))]
    pub app_logs_max: i64,
    /// Quota used by surrounding org and space resources.
    #[serde(default)]
    pub default_quota_name: Option<String>,
    /// Purge service bindings instead of asking brokers on delete.
    #[serde(default)]
    pub purge_when_delete: bool,
    /// Root of the artifact workspace.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    /// Interval between polls of asynchronous operations, in seconds.
    #[serde(default = "default_polling_interval")]
    #[validate(range(min = 1))]
    pub polling_interval_secs: u64,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Local state file path.
    #[serde(default)]
    pub path: Option<String>,
}

/// Deployment strategy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Mutate the running application in place.
    #[default]
    Standard,
    /// Build a sibling application and swap routes.
    BlueGreen,
}

/// Health check type of the web process.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    /// TCP connection to the application port.
    #[default]
    Port,
    /// Process liveness only.
    Process,
    /// HTTP GET against an endpoint.
    Http,
    /// No health check.
    None,
}

impl HealthCheckType {
    /// Returns the wire name used by the platform.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Port => "port",
            Self::Process => "process",
            Self::Http => "http",
            Self::None => "none",
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    /// Type of check.
    #[serde(default, rename = "type")]
    pub check_type: HealthCheckType,
    /// Endpoint for `http` checks.
    #[serde(default)]
    pub http_endpoint: Option<String>,
    /// Seconds the platform waits for the check to pass.
    #[serde(default)]
    pub timeout: Option<u32>,
}

/// Per-operation timeouts, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timeouts {
    /// Start timeout.
    #[serde(default = "default_start_timeout")]
    pub start: u64,
    /// Staging timeout.
    #[serde(default = "default_stage_timeout")]
    pub stage: u64,
    /// Service binding timeout.
    #[serde(default = "default_bind_timeout")]
    pub bind: u64,
    /// Delete timeout.
    #[serde(default = "default_delete_timeout")]
    pub delete: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            start: default_start_timeout(),
            stage: default_stage_timeout(),
            bind: default_bind_timeout(),
            delete: default_delete_timeout(),
        }
    }
}

impl Timeouts {
    /// Start timeout as a duration.
    #[must_use]
    pub const fn start(&self) -> Duration {
        Duration::from_secs(self.start)
    }

    /// Staging timeout as a duration.
    #[must_use]
    pub const fn stage(&self) -> Duration {
        Duration::from_secs(self.stage)
    }

    /// Binding timeout as a duration.
    #[must_use]
    pub const fn bind(&self) -> Duration {
        Duration::from_secs(self.bind)
    }

    /// Delete timeout as a duration.
    #[must_use]
    pub const fn delete(&self) -> Duration {
        Duration::from_secs(self.delete)
    }
}

/// A route the application must answer on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteSpec {
    /// Route guid.
    pub route: String,
    /// Application port; `None` or `0` means the default port.
    #[serde(default)]
    pub port: Option<u16>,
}

/// Canonical service binding parameters.
///
/// Both input forms (a mapping or a JSON string) are parsed into one JSON
/// value, an empty object when nothing was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingParams(pub serde_json::Value);

impl Default for BindingParams {
    fn default() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }
}

impl BindingParams {
    /// Parses parameters given as a JSON string. A blank string and `null`
    /// both mean no parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid JSON.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| ConfigError::validation(format!("invalid params_json: {e}"), "params_json"))?;
        Ok(match value {
            serde_json::Value::Null => Self::default(),
            value => Self(value),
        })
    }

    /// Returns true when no parameters are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Returns the parameters to send on creation, if any.
    #[must_use]
    pub fn to_request(&self) -> Option<serde_json::Value> {
        if self.is_empty() { None } else { Some(self.0.clone()) }
    }
}

/// A service instance the application must be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawServiceBinding", into = "RawServiceBinding")]
pub struct ServiceBinding {
    /// Service instance guid.
    pub service_instance: String,
    /// Canonical creation parameters.
    pub params: BindingParams,
}

/// Wire shape of a service binding, accepting both parameter forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawServiceBinding {
    service_instance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params_json: Option<String>,
}

impl TryFrom<RawServiceBinding> for ServiceBinding {
    type Error = ConfigError;

    fn try_from(raw: RawServiceBinding) -> Result<Self, Self::Error> {
        let params = match (raw.params, raw.params_json) {
            (Some(map), Some(json)) if !map.is_empty() && !json.trim().is_empty() => {
                return Err(ConfigError::validation(
                    format!(
                        "binding to {} sets both params and params_json",
                        raw.service_instance
                    ),
                    "service_bindings",
                ));
            }
            (Some(map), _) if !map.is_empty() => BindingParams(serde_json::Value::Object(map)),
            (_, Some(json)) => BindingParams::from_json(&json)?,
            _ => BindingParams::default(),
        };

        Ok(Self {
            service_instance: raw.service_instance,
            params,
        })
    }
}

impl From<ServiceBinding> for RawServiceBinding {
    fn from(binding: ServiceBinding) -> Self {
        let (params, params_json) = match binding.params.0 {
            serde_json::Value::Object(map) if map.is_empty() => (None, None),
            serde_json::Value::Object(map) => (Some(map), None),
            serde_json::Value::Null => (None, None),
            other => (None, Some(other.to_string())),
        };
        Self {
            service_instance: binding.service_instance,
            params,
            params_json,
        }
    }
}

/// Git checkout source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitSource {
    /// Repository URL.
    pub url: String,
    /// Branch to check out.
    #[serde(default)]
    pub branch: Option<String>,
    /// Tag to check out; wins over `branch`.
    #[serde(default)]
    pub tag: Option<String>,
    /// User for password authentication.
    #[serde(default)]
    pub user: Option<String>,
    /// Password for password authentication.
    #[serde(default)]
    pub password: Option<String>,
    /// Private key material (PEM).
    #[serde(default)]
    pub key: Option<String>,
}

/// Release asset source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseSource {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Release version; latest when unset.
    #[serde(default)]
    pub version: Option<String>,
    /// Asset name, or `zipball` / `tarball`.
    pub filename: String,
    /// User for basic authentication.
    #[serde(default)]
    pub user: Option<String>,
    /// Password or token for basic authentication.
    #[serde(default)]
    pub password: Option<String>,
}

/// Docker image source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DockerSource {
    /// Image reference.
    pub image: String,
    /// Registry user.
    #[serde(default)]
    pub username: Option<String>,
    /// Registry password.
    #[serde(default)]
    pub password: Option<String>,
}

/// Where the application bits come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSource", into = "RawSource")]
pub enum Source {
    /// Local zip file or directory.
    Path(PathBuf),
    /// HTTP(S) zip archive.
    Url(String),
    /// Git repository.
    Git(GitSource),
    /// Release asset.
    Release(ReleaseSource),
    /// Docker image.
    Docker(DockerSource),
}

impl Source {
    /// Returns the docker source when the application runs an image.
    #[must_use]
    pub const fn docker(&self) -> Option<&DockerSource> {
        match self {
            Self::Docker(docker) => Some(docker),
            _ => None,
        }
    }

    /// Short label used in logs and plan output.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => format!("path {}", path.display()),
            Self::Url(url) => format!("url {url}"),
            Self::Git(git) => format!("git {}", git.url),
            Self::Release(release) => format!("release {}/{}", release.owner, release.repo),
            Self::Docker(docker) => format!("docker {}", docker.image),
        }
    }
}

/// Wire shape of a source: exactly one key must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git: Option<GitSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    release: Option<ReleaseSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    docker: Option<DockerSource>,
}

impl TryFrom<RawSource> for Source {
    type Error = ConfigError;

    fn try_from(raw: RawSource) -> Result<Self, Self::Error> {
        let mut found = Vec::new();
        if let Some(path) = raw.path {
            found.push(Self::Path(path));
        }
        if let Some(url) = raw.url {
            found.push(Self::Url(url));
        }
        if let Some(git) = raw.git {
            found.push(Self::Git(git));
        }
        if let Some(release) = raw.release {
            found.push(Self::Release(release));
        }
        if let Some(docker) = raw.docker {
            found.push(Self::Docker(docker));
        }

        match found.len() {
            1 => found
                .pop()
                .ok_or_else(|| ConfigError::validation("source is empty", "source")),
            0 => Err(ConfigError::validation(
                "source must set one of path, url, git, release, docker",
                "source",
            )),
            _ => Err(ConfigError::validation(
                "source must set exactly one of path, url, git, release, docker",
                "source",
            )),
        }
    }
}

impl From<Source> for RawSource {
    fn from(source: Source) -> Self {
        let mut raw = Self::default();
        match source {
            Source::Path(path) => raw.path = Some(path),
            Source::Url(url) => raw.url = Some(url),
            Source::Git(git) => raw.git = Some(git),
            Source::Release(release) => raw.release = Some(release),
            Source::Docker(docker) => raw.docker = Some(docker),
        }
        raw
    }
}

/// Desired state of one application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct AppSpec {
    /// Application name.
    #[validate(length(min = 1, message = "name must not be empty"))]
    pub name: String,
    /// Space guid.
    #[validate(length(min = 1, message = "space must not be empty"))]
    pub space: String,
    /// Buildpack name.
    #[serde(default)]
    pub buildpack: Option<String>,
    /// Stack name.
    #[serde(default)]
    pub stack: Option<String>,
    /// Start command.
    #[serde(default)]
    pub command: Option<String>,
    /// Whether SSH access is enabled; left untouched when unset.
    #[serde(default)]
    pub enable_ssh: Option<bool>,
    /// Number of instances.
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Memory in MiB.
    #[serde(default = "default_memory")]
    #[validate(range(min = 1, message = "memory must be greater than zero"))]
    pub memory: u32,
    /// Disk in MiB.
    #[serde(default = "default_disk")]
    #[validate(range(min = 1, message = "disk must be greater than zero"))]
    pub disk: u32,
    /// Application ports.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Health check.
    #[serde(default)]
    pub health_check: HealthCheck,
    /// Environment variables.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Routes, in declaration order.
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    /// Service bindings, in declaration order.
    #[serde(default)]
    pub service_bindings: Vec<ServiceBinding>,
    /// Where the bits come from.
    pub source: Source,
    /// Opaque content hash; derived from the artifact when unset.
    #[serde(default)]
    pub source_code_hash: Option<String>,
    /// Deployment strategy.
    #[serde(default)]
    pub strategy: Strategy,
    /// Per-operation timeouts.
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Keep the application stopped.
    #[serde(default)]
    pub stopped: bool,
    /// Replace the application when the bound service instances change.
    #[serde(default)]
    pub replace_on_service_plan_change: bool,
    /// Replace the application when binding parameters change.
    #[serde(default)]
    pub replace_on_params_change: bool,
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl AppSpec {
    /// Canonicalizes the spec in place.
    ///
    /// Empty buildpack, stack and command become unset, ports at or below
    /// 1024 are dropped and route port `0` becomes unset.
    pub fn normalize(&mut self) {
        for field in [&mut self.buildpack, &mut self.stack, &mut self.command] {
            if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *field = None;
            }
        }
        self.ports.retain(|p| *p > RESERVED_PORT_MAX);
        for route in &mut self.routes {
            if route.port == Some(0) {
                route.port = None;
            }
        }
        if self
            .health_check
            .http_endpoint
            .as_deref()
            .is_some_and(str::is_empty)
        {
            self.health_check.http_endpoint = None;
        }
    }

    /// Returns a normalized copy.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Returns the docker image reference, if any.
    #[must_use]
    pub fn docker_image(&self) -> Option<&str> {
        self.source.docker().map(|d| d.image.as_str())
    }

    /// Port used when a route does not name one.
    #[must_use]
    pub fn default_route_port(&self) -> u16 {
        self.ports
            .iter()
            .copied()
            .find(|p| *p > RESERVED_PORT_MAX)
            .unwrap_or(DEFAULT_APP_PORT)
    }

    /// Resolves the effective port of a route.
    #[must_use]
    pub fn route_port(&self, route: &RouteSpec) -> u16 {
        match route.port {
            Some(port) if port > 0 => port,
            _ => self.default_route_port(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

const fn default_app_logs_max() -> i64 {
    30
}

const fn default_polling_interval() -> u64 {
    5
}

const fn default_instances() -> u32 {
    1
}

const fn default_memory() -> u32 {
    1024
}

const fn default_disk() -> u32 {
    1024
}

const fn default_start_timeout() -> u64 {
    60
}

const fn default_stage_timeout() -> u64 {
    900
}

const fn default_bind_timeout() -> u64 {
    300
}

const fn default_delete_timeout() -> u64 {
    120
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_app(yaml: &str) -> AppSpec {
        serde_yaml::from_str(yaml).expect("app should parse")
    }

    #[test]
    fn test_defaults_applied() {
        let app = parse_app(
            r"
name: app1
space: space-guid
source:
  url: https://example.com/app.zip
",
        );

        assert_eq!(app.instances, 1);
        assert_eq!(app.memory, 1024);
        assert_eq!(app.disk, 1024);
        assert_eq!(app.strategy, Strategy::Standard);
        assert_eq!(app.timeouts.start, 60);
        assert_eq!(app.timeouts.stage, 900);
        assert_eq!(app.timeouts.bind, 300);
        assert_eq!(app.health_check.check_type, HealthCheckType::Port);
        assert!(!app.stopped);
    }

    #[test]
    fn test_binding_params_forms_are_equivalent() {
        let app = parse_app(
            r#"
name: app1
space: s
source:
  path: ./app.zip
service_bindings:
  - service_instance: si-1
    params:
      plan: small
      replicas: 2
  - service_instance: si-2
    params_json: '{"replicas": 2, "plan": "small"}'
  - service_instance: si-3
    params_json: ""
"#,
        );

        assert_eq!(app.service_bindings[0].params, app.service_bindings[1].params);
        assert!(app.service_bindings[2].params.is_empty());
    }

    #[test]
    fn test_null_params_json_means_no_params() {
        let app = parse_app(
            r#"
name: app1
space: s
source:
  path: ./app.zip
service_bindings:
  - service_instance: si-1
    params_json: "null"
  - service_instance: si-2
"#,
        );

        assert_eq!(app.service_bindings[0].params, BindingParams::default());
        assert_eq!(app.service_bindings[0].params, app.service_bindings[1].params);
    }

    #[test]
    fn test_non_object_params_survive_serialization() {
        let binding = ServiceBinding {
            service_instance: String::from("si-1"),
            params: BindingParams::from_json("[1, 2]").expect("params"),
        };

        let json = serde_json::to_string(&binding).expect("serialize");
        let back: ServiceBinding = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(back, binding);
    }

    #[test]
    fn test_binding_params_both_forms_rejected() {
        let result: Result<AppSpec, _> = serde_yaml::from_str(
            r#"
name: app1
space: s
source:
  path: ./app.zip
service_bindings:
  - service_instance: si-1
    params:
      a: 1
    params_json: '{"a": 1}'
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_source_requires_exactly_one() {
        let none: Result<AppSpec, _> = serde_yaml::from_str("name: a\nspace: s\nsource: {}\n");
        assert!(none.is_err());

        let two: Result<AppSpec, _> = serde_yaml::from_str(
            "name: a\nspace: s\nsource:\n  path: ./x\n  url: https://e.com/x.zip\n",
        );
        assert!(two.is_err());
    }

    #[test]
    fn test_source_round_trips_through_yaml() {
        let app = parse_app(
            r"
name: app1
space: s
source:
  git:
    url: https://github.com/org/repo.git
    tag: v1.2.0
",
        );
        let yaml = serde_yaml::to_string(&app).expect("serialize");
        let back: AppSpec = serde_yaml::from_str(&yaml).expect("parse back");
        assert_eq!(app, back);
    }

    #[test]
    fn test_normalize_strips_reserved_ports_and_empty_strings() {
        let mut app = parse_app(
            r#"
name: app1
space: s
buildpack: ""
command: "  "
ports: [80, 443, 1024]
routes:
  - route: r1
    port: 0
source:
  path: ./app.zip
"#,
        );
        app.normalize();

        assert!(app.ports.is_empty());
        assert_eq!(app.buildpack, None);
        assert_eq!(app.command, None);
        assert_eq!(app.routes[0].port, None);
    }

    #[test]
    fn test_route_port_uses_first_declared_port() {
        let mut app = parse_app(
            "name: a\nspace: s\nports: [9000, 9001]\nsource:\n  path: ./x\nroutes:\n  - route: r1\n",
        );
        app.normalize();
        assert_eq!(app.route_port(&app.routes[0]), 9000);

        app.ports.clear();
        assert_eq!(app.route_port(&app.routes[0]), DEFAULT_APP_PORT);
    }

    #[test]
    fn test_empty_env_value_preserved() {
        let app = parse_app("name: a\nspace: s\nsource:\n  path: ./x\nenvironment:\n  EMPTY: \"\"\n");
        assert_eq!(app.environment.get("EMPTY").map(String::as_str), Some(""));
    }
}
