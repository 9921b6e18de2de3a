//! Upgrade of version-1 state records.
//!
//! Version 1 stored the application in the shape of the first deployer
//! release: the source was one of the top-level `url`, `path`, `git`,
//! `github_release` or `docker_image` fields, routes came either as a single
//! `route` block or as a `routes` list whose port could be omitted, service
//! bindings were a `service_binding` list with a `params` map, and the health
//! check was flattened into `health_check_*` fields.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::config::{AppSpec, RouteSpec};
use crate::error::{Result, StateError};

use super::types::{
    AppState, BindingRecord, DeploymentHistoryEntry, DeploymentState, RouteMapping, STATE_VERSION,
};

/// Version of the legacy state format.
pub const LEGACY_STATE_VERSION: &str = "1";

/// Legacy application fields with no direct counterpart.
const LEGACY_ONLY_FIELDS: &[&str] = &[
    "id",
    "id_bg",
    "url",
    "path",
    "git",
    "github_release",
    "docker_image",
    "docker_credentials",
    "route",
    "service_binding",
    "health_check_type",
    "health_check_http_endpoint",
    "health_check_timeout",
    "timeout",
];

fn corrupted(message: impl Into<String>) -> StateError {
    StateError::Corrupted {
        message: message.into(),
    }
}

/// Version recorded in a raw state document; records without one are
/// version 1.
#[must_use]
pub fn state_version(raw: &Value) -> String {
    match raw.get("version") {
        Some(Value::String(version)) => version.clone(),
        Some(Value::Number(version)) => version.to_string(),
        _ => LEGACY_STATE_VERSION.to_string(),
    }
}

/// Parses a state document of any supported version.
///
/// # Errors
///
/// Returns `Corrupted` when the document cannot be read and
/// `UnsupportedVersion` for unknown versions.
pub fn decode_state(content: &str) -> Result<DeploymentState> {
    let raw: Value = serde_json::from_str(content)
        .map_err(|e| corrupted(format!("Failed to parse state file: {e}")))?;

    match state_version(&raw).as_str() {
        STATE_VERSION => serde_json::from_value(raw)
            .map_err(|e| corrupted(format!("Failed to parse state file: {e}")).into()),
        LEGACY_STATE_VERSION => migrate_legacy_state(raw),
        other => Err(StateError::UnsupportedVersion {
            found: other.to_string(),
        }
        .into()),
    }
}

/// Upgrades a version-1 state document.
///
/// # Errors
///
/// Returns `Corrupted` when the legacy record lacks the application guid or
/// a source, or when the upgraded application is not a valid spec.
pub fn migrate_legacy_state(raw: Value) -> Result<DeploymentState> {
    let Value::Object(mut record) = raw else {
        return Err(corrupted("legacy state is not an object").into());
    };
    info!("Migrating state from version {LEGACY_STATE_VERSION} to {STATE_VERSION}");

    let last_updated = record
        .get("last_updated")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |t| t.with_timezone(&Utc));

    let app = match record.remove("app") {
        Some(Value::Null) | None => None,
        Some(app) => Some(migrate_app(app, last_updated)?),
    };

    let history = match record.remove("history") {
        Some(history) => serde_json::from_value::<Vec<DeploymentHistoryEntry>>(history)
            .unwrap_or_else(|e| {
                warn!("Dropping unreadable legacy history: {e}");
                Vec::new()
            }),
        None => Vec::new(),
    };

    Ok(DeploymentState {
        version: STATE_VERSION.to_string(),
        app,
        spec_hash: record
            .get("spec_hash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        last_updated,
        history,
    })
}

/// Legacy nested blocks were lists of at most one element.
fn single_block(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(block) => Some(block),
        Value::Array(items) => items.into_iter().find_map(|item| match item {
            Value::Object(block) => Some(block),
            _ => None,
        }),
        _ => None,
    }
}

fn non_empty_str<'a>(block: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    block.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn migrate_app(raw: Value, observed_at: DateTime<Utc>) -> Result<AppState> {
    let Value::Object(mut app) = raw else {
        return Err(corrupted("legacy application record is not an object").into());
    };

    let guid = non_empty_str(&app, "id")
        .or_else(|| non_empty_str(&app, "guid"))
        .ok_or_else(|| corrupted("legacy application record has no id"))?
        .to_string();

    let source = legacy_source(&app)?;
    let routes = legacy_routes(&app);
    let bindings = legacy_bindings(&app);
    let health_check = legacy_health_check(&app);
    let start_timeout = app.get("timeout").cloned();

    for field in LEGACY_ONLY_FIELDS {
        app.remove(*field);
    }
    app.remove("guid");
    app.remove("routes");

    app.insert(String::from("source"), source);
    let route_specs: Vec<&RouteSpec> = routes.iter().map(|(route, _)| route).collect();
    app.insert(String::from("routes"), json!(route_specs));
    if !bindings.is_empty() && !app.contains_key("service_bindings") {
        let entries: Vec<Value> = bindings.iter().map(|(entry, _)| entry.clone()).collect();
        app.insert(String::from("service_bindings"), Value::Array(entries));
    }
    if let Some(health_check) = health_check {
        app.insert(String::from("health_check"), health_check);
    }
    if let Some(timeout) = start_timeout.filter(|t| t.as_u64().is_some_and(|t| t > 0)) {
        app.insert(String::from("timeouts"), json!({ "start": timeout }));
    }

    let spec: AppSpec = serde_json::from_value(Value::Object(app))
        .map_err(|e| corrupted(format!("legacy application record is invalid: {e}")))?;
    let spec = spec.normalized();

    let route_mappings = routes
        .iter()
        .filter_map(|(route, mapping_id)| {
            mapping_id.as_ref().map(|id| RouteMapping {
                route: route.route.clone(),
                port: spec.route_port(route),
                mapping_id: id.clone(),
            })
        })
        .collect();

    let service_bindings = bindings
        .iter()
        .filter_map(|(entry, binding_id)| {
            let instance = entry.get("service_instance").and_then(Value::as_str)?;
            let binding_id = binding_id.clone()?;
            let params = spec
                .service_bindings
                .iter()
                .find(|b| b.service_instance == instance)
                .map(|b| b.params.clone())
                .unwrap_or_default();
            Some(BindingRecord {
                service_instance: instance.to_string(),
                params,
                binding_id,
            })
        })
        .collect();

    debug!("Migrated legacy record of app {guid}");
    Ok(AppState {
        guid,
        spec,
        route_mappings,
        service_bindings,
        droplet_guid: None,
        droplet_image: None,
        observed_at,
    })
}

fn legacy_source(app: &Map<String, Value>) -> Result<Value> {
    if let Some(image) = non_empty_str(app, "docker_image") {
        let mut docker = json!({ "image": image });
        if let Some(credentials) = app.get("docker_credentials").cloned().and_then(single_block) {
            for key in ["username", "password"] {
                if let Some(value) = non_empty_str(&credentials, key) {
                    docker[key] = json!(value);
                }
            }
        }
        return Ok(json!({ "docker": docker }));
    }

    if let Some(git) = app.get("git").cloned().and_then(single_block) {
        return Ok(json!({ "git": git }));
    }
    if let Some(release) = app.get("github_release").cloned().and_then(single_block) {
        return Ok(json!({ "release": release }));
    }

    if let Some(url) = non_empty_str(app, "url") {
        let remote = url.starts_with("http://") || url.starts_with("https://");
        return Ok(if remote {
            json!({ "url": url })
        } else {
            json!({ "path": url })
        });
    }
    if let Some(path) = non_empty_str(app, "path") {
        return Ok(json!({ "path": path }));
    }

    Err(corrupted("legacy application record has no source").into())
}

/// Routes with their mapping ids.
fn legacy_routes(app: &Map<String, Value>) -> Vec<(RouteSpec, Option<String>)> {
    let ports: Vec<u16> = app
        .get("ports")
        .and_then(Value::as_array)
        .map(|ports| {
            ports
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|p| u16::try_from(p).ok())
                .collect()
        })
        .unwrap_or_default();
    let mut routes = Vec::new();

    if let Some(block) = app.get("route").cloned().and_then(single_block) {
        if let Some(route) = non_empty_str(&block, "default_route") {
            routes.push((
                RouteSpec {
                    route: route.to_string(),
                    port: ports.first().copied(),
                },
                non_empty_str(&block, "default_route_mapping_id").map(str::to_string),
            ));
        }
    }

    for entry in app
        .get("routes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
    {
        let Some(route) = non_empty_str(entry, "route") else {
            continue;
        };
        let mapping_id = non_empty_str(entry, "mapping_id").map(str::to_string);
        let port = entry
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0);

        match port {
            Some(port) => routes.push((
                RouteSpec {
                    route: route.to_string(),
                    port: Some(port),
                },
                mapping_id,
            )),
            None if ports.is_empty() => routes.push((
                RouteSpec {
                    route: route.to_string(),
                    port: None,
                },
                mapping_id,
            )),
            None => {
                for port in &ports {
                    routes.push((
                        RouteSpec {
                            route: route.to_string(),
                            port: Some(*port),
                        },
                        mapping_id.clone(),
                    ));
                }
            }
        }
    }

    routes
}

/// Binding entries in the current document shape, with their binding ids.
fn legacy_bindings(app: &Map<String, Value>) -> Vec<(Value, Option<String>)> {
    app.get("service_binding")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .filter_map(|entry| {
            let instance = non_empty_str(entry, "service_instance")?;
            let mut binding = json!({ "service_instance": instance });
            match (entry.get("params"), non_empty_str(entry, "params_json")) {
                (Some(Value::Object(params)), _) if !params.is_empty() => {
                    binding["params"] = Value::Object(params.clone());
                }
                (_, Some(params_json)) => binding["params_json"] = json!(params_json),
                _ => {}
            }
            Some((binding, non_empty_str(entry, "binding_id").map(str::to_string)))
        })
        .collect()
}

fn legacy_health_check(app: &Map<String, Value>) -> Option<Value> {
    let check_type = non_empty_str(app, "health_check_type");
    let endpoint = non_empty_str(app, "health_check_http_endpoint");
    let timeout = app
        .get("health_check_timeout")
        .and_then(Value::as_u64)
        .filter(|t| *t > 0);

    if check_type.is_none() && endpoint.is_none() && timeout.is_none() {
        return None;
    }

    let mut health_check = json!({ "type": check_type.unwrap_or("port") });
    if let Some(endpoint) = endpoint {
        health_check["http_endpoint"] = json!(endpoint);
    }
    if let Some(timeout) = timeout {
        health_check["timeout"] = json!(timeout);
    }
    Some(health_check)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthCheckType, Source};

    fn legacy(app: Value) -> Value {
        json!({
            "version": 1,
            "spec_hash": "abc",
            "last_updated": "2021-03-04T10:00:00Z",
            "app": app
        })
    }

    #[test]
    fn test_current_version_is_decoded_directly() {
        let state = DeploymentState::new();
        let content = serde_json::to_string(&state).expect("serialize");

        let decoded = decode_state(&content).expect("decode should succeed");
        assert_eq!(decoded.version, STATE_VERSION);
        assert!(decoded.app.is_none());
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let err = decode_state(r#"{"version": "9"}"#).expect_err("version 9 is unknown");
        assert!(err.to_string().contains("Unsupported state version: 9"));
    }

    #[test]
    fn test_url_becomes_source() {
        let raw = legacy(json!({
            "id": "app-1",
            "name": "web",
            "space": "space-1",
            "url": "https://github.com/org/repo/releases/download/v1/app.zip"
        }));

        let state = migrate_legacy_state(raw).expect("migration should succeed");
        let app = state.app.expect("app");

        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.spec_hash, "abc");
        assert_eq!(app.guid, "app-1");
        assert!(matches!(app.spec.source, Source::Url(ref url) if url.ends_with("app.zip")));
    }

    #[test]
    fn test_local_url_becomes_path() {
        let raw = legacy(json!({
            "id": "app-1", "name": "web", "space": "space-1", "url": "/srv/dummy-app"
        }));

        let app = migrate_legacy_state(raw).expect("migrate").app.expect("app");
        assert!(matches!(app.spec.source, Source::Path(_)));
    }

    #[test]
    fn test_github_release_block_becomes_release_source() {
        let raw = legacy(json!({
            "id": "app-1", "name": "web", "space": "space-1",
            "github_release": [{
                "owner": "cloudfoundry-community",
                "repo": "tomee-buildpack",
                "filename": "tarball"
            }]
        }));

        let app = migrate_legacy_state(raw).expect("migrate").app.expect("app");
        match app.spec.source {
            Source::Release(release) => {
                assert_eq!(release.owner, "cloudfoundry-community");
                assert_eq!(release.filename, "tarball");
                assert!(release.version.is_none());
            }
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn test_single_route_block_uses_first_port() {
        let raw = legacy(json!({
            "id": "app-1", "name": "web", "space": "space-1", "path": "./build",
            "ports": [9090],
            "route": [{"default_route": "route-1", "default_route_mapping_id": "dest-1"}]
        }));

        let app = migrate_legacy_state(raw).expect("migrate").app.expect("app");
        assert_eq!(
            app.spec.routes,
            vec![RouteSpec {
                route: String::from("route-1"),
                port: Some(9090)
            }]
        );
        assert_eq!(
            app.route_mappings,
            vec![RouteMapping {
                route: String::from("route-1"),
                port: 9090,
                mapping_id: String::from("dest-1"),
            }]
        );
    }

    #[test]
    fn test_portless_routes_expand_over_declared_ports() {
        let raw = legacy(json!({
            "id": "app-1", "name": "web", "space": "space-1", "path": "./build",
            "ports": [8080, 9090],
            "routes": [
                {"route": "route-1"},
                {"route": "route-2", "port": 7070, "mapping_id": "dest-2"}
            ]
        }));

        let app = migrate_legacy_state(raw).expect("migrate").app.expect("app");
        let keys: Vec<(String, Option<u16>)> = app
            .spec
            .routes
            .iter()
            .map(|r| (r.route.clone(), r.port))
            .collect();
        assert_eq!(
            keys,
            vec![
                (String::from("route-1"), Some(8080)),
                (String::from("route-1"), Some(9090)),
                (String::from("route-2"), Some(7070)),
            ]
        );
        assert_eq!(app.route_mappings.len(), 1);
    }

    #[test]
    fn test_service_binding_params_map_is_preserved() {
        let raw = legacy(json!({
            "id": "app-1", "name": "web", "space": "space-1", "path": "./build",
            "service_binding": [
                {"service_instance": "si-1", "params": {"foo": "bar"}, "binding_id": "b-1"},
                {"service_instance": "si-2", "params_json": "{\"x\": 1}"}
            ]
        }));

        let app = migrate_legacy_state(raw).expect("migrate").app.expect("app");
        assert_eq!(app.spec.service_bindings.len(), 2);
        assert_eq!(app.spec.service_bindings[0].service_instance, "si-1");
        assert_eq!(app.spec.service_bindings[0].params.0, json!({"foo": "bar"}));
        assert_eq!(app.spec.service_bindings[1].params.0, json!({"x": 1}));

        assert_eq!(app.service_bindings.len(), 1);
        assert_eq!(app.service_bindings[0].binding_id, "b-1");
        assert_eq!(app.service_bindings[0].params.0, json!({"foo": "bar"}));
    }

    #[test]
    fn test_flat_health_check_and_docker_image() {
        let raw = legacy(json!({
            "id": "app-1", "name": "web", "space": "space-1",
            "docker_image": "nginx:1.25",
            "docker_credentials": {"username": "bot", "password": "s3cret"},
            "health_check_type": "http",
            "health_check_http_endpoint": "/health",
            "health_check_timeout": 30,
            "timeout": 120
        }));

        let app = migrate_legacy_state(raw).expect("migrate").app.expect("app");
        assert_eq!(app.spec.docker_image(), Some("nginx:1.25"));
        assert_eq!(app.spec.health_check.check_type, HealthCheckType::Http);
        assert_eq!(app.spec.health_check.http_endpoint.as_deref(), Some("/health"));
        assert_eq!(app.spec.health_check.timeout, Some(30));
        assert_eq!(app.spec.timeouts.start, 120);
    }

    #[test]
    fn test_record_without_source_is_corrupted() {
        let raw = legacy(json!({"id": "app-1", "name": "web", "space": "space-1"}));
        let err = migrate_legacy_state(raw).expect_err("no source");
        assert!(err.to_string().contains("no source"));
    }

    #[test]
    fn test_unversioned_document_is_legacy() {
        let content = json!({
            "app": {"id": "app-1", "name": "web", "space": "space-1", "path": "./build"}
        })
        .to_string();

        let state = decode_state(&content).expect("decode should migrate");
        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.app.expect("app").guid, "app-1");
    }
}
