//! Configuration validation for deployment documents.
//!
//! Field-level rules come from the `validator` derives on the spec types;
//! this module adds the structural checks that span several fields and
//! collects everything into one [`ValidationResult`].

use crate::error::{ConfigError, DeployerError, Result};
use std::collections::HashSet;
use tracing::debug;
use validator::Validate;

use super::spec::{AppSpec, DeployDocument, HealthCheckType, Source, RESERVED_PORT_MAX};

/// Validator for deployment documents.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a deployment document.
    ///
    /// # Errors
    ///
    /// Returns the first error found if validation fails.
    pub fn validate(&self, document: &DeployDocument) -> Result<ValidationResult> {
        let result = self.check(document);

        if let Some(first_error) = result.errors.first() {
            return Err(DeployerError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Runs every check and returns all findings without failing.
    #[must_use]
    pub fn check(&self, document: &DeployDocument) -> ValidationResult {
        let mut result = ValidationResult::default();

        collect_derived("provider", document.provider.validate(), &mut result);
        collect_derived("app", document.app.validate(), &mut result);
        Self::validate_app(&document.app, &mut result);

        result
    }

    /// Structural checks over the application spec.
    fn validate_app(app: &AppSpec, result: &mut ValidationResult) {
        if app.docker_image().is_some() && app.buildpack.is_some() {
            result.push_error("app.buildpack", "buildpack cannot be combined with a docker image");
        }

        if let Source::Docker(docker) = &app.source {
            if docker.image.trim().is_empty() {
                result.push_error("app.source.docker.image", "docker image cannot be empty");
            }
            if docker.username.is_some() != docker.password.is_some() {
                result.push_error(
                    "app.source.docker",
                    "docker username and password must be set together",
                );
            }
        }

        if let Source::Git(git) = &app.source {
            if git.tag.is_some() && git.branch.is_some() {
                result
                    .warnings
                    .push(String::from("git source sets both tag and branch; the tag wins"));
            }
            if git.key.is_some() && git.password.is_some() {
                result.push_error("app.source.git", "use either a private key or a password, not both");
            }
        }

        if let Source::Url(url) = &app.source {
            if url::Url::parse(url).map_or(true, |u| !matches!(u.scheme(), "http" | "https")) {
                result.push_error("app.source.url", format!("'{url}' is not an http(s) URL"));
            }
        }

        match app.health_check.check_type {
            HealthCheckType::Http => {}
            _ if app.health_check.http_endpoint.is_some() => {
                result.push_error(
                    "app.health_check.http_endpoint",
                    "http_endpoint requires health check type http",
                );
            }
            _ => {}
        }

        if app.ports.iter().any(|p| *p <= RESERVED_PORT_MAX) {
            result.warnings.push(format!(
                "ports at or below {RESERVED_PORT_MAX} are platform defaults and are ignored"
            ));
        }

        let mut seen_routes = HashSet::new();
        for (i, route) in app.routes.iter().enumerate() {
            if route.route.is_empty() {
                result.push_error(format!("app.routes[{i}].route"), "route cannot be empty");
            }
            if !seen_routes.insert((route.route.as_str(), app.route_port(route))) {
                result.push_error(
                    format!("app.routes[{i}]"),
                    format!("duplicate route {} on port {}", route.route, app.route_port(route)),
                );
            }
        }

        let mut seen_instances = HashSet::new();
        for (i, binding) in app.service_bindings.iter().enumerate() {
            if !seen_instances.insert(binding.service_instance.as_str()) {
                result.push_error(
                    format!("app.service_bindings[{i}]"),
                    format!("service instance {} is bound twice", binding.service_instance),
                );
            }
        }

        for (key, value) in &app.environment {
            if key.is_empty() {
                result.push_error("app.environment", "environment variable names cannot be empty");
            } else if value.is_empty() {
                result
                    .warnings
                    .push(format!("environment variable {key} is set to an empty string"));
            }
        }

        if app.instances == 0 && !app.stopped {
            result
                .warnings
                .push(String::from("instances is 0; the application will not serve traffic"));
        }
    }
}

/// Converts derive-based validation failures into result entries.
fn collect_derived(
    prefix: &str,
    outcome: std::result::Result<(), validator::ValidationErrors>,
    result: &mut ValidationResult,
) {
    let Err(errors) = outcome else {
        return;
    };

    for (field, field_errors) in errors.field_errors() {
        for error in field_errors {
            let message = error
                .message
                .as_ref()
                .map_or_else(|| format!("invalid value ({})", error.code), ToString::to_string);
            result.push_error(format!("{prefix}.{field}"), message);
        }
    }
}

impl ValidationResult {
    /// Records an error.
    pub fn push_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn document(app_yaml: &str) -> DeployDocument {
        let yaml = format!("provider:\n  api_url: https://api.example.com\napp:\n{app_yaml}");
        ConfigParser::new().parse_yaml(&yaml, None).expect("should parse")
    }

    #[test]
    fn test_valid_document() {
        let doc = document("  name: app1\n  space: s\n  source:\n    url: https://e.com/a.zip\n");
        let result = ConfigValidator::new().validate(&doc).expect("valid");
        assert!(result.is_valid());
    }

    #[test]
    fn test_empty_name_rejected() {
        let doc = document("  name: \"\"\n  space: s\n  source:\n    url: https://e.com/a.zip\n");
        let result = ConfigValidator::new().check(&doc);
        assert!(result.errors.iter().any(|e| e.field == "app.name"));
    }

    #[test]
    fn test_zero_memory_rejected() {
        let doc = document("  name: a\n  space: s\n  memory: 0\n  source:\n    path: ./x.zip\n");
        let result = ConfigValidator::new().check(&doc);
        assert!(result.errors.iter().any(|e| e.field == "app.memory"));
    }

    #[test]
    fn test_docker_with_buildpack_rejected() {
        let doc = document(
            "  name: a\n  space: s\n  buildpack: go_buildpack\n  source:\n    docker:\n      image: nginx\n",
        );
        assert!(ConfigValidator::new().validate(&doc).is_err());
    }

    #[test]
    fn test_duplicate_routes_after_port_resolution() {
        let doc = document(
            "  name: a\n  space: s\n  source:\n    path: ./x\n  routes:\n    - route: r1\n    - route: r1\n      port: 8080\n",
        );
        let result = ConfigValidator::new().check(&doc);
        assert_eq!(result.error_count(), 1);
    }

    #[test]
    fn test_tag_and_branch_warns() {
        let doc = document(
            "  name: a\n  space: s\n  source:\n    git:\n      url: https://g.com/r.git\n      tag: v1\n      branch: main\n",
        );
        let result = ConfigValidator::new().validate(&doc).expect("valid");
        assert_eq!(result.warning_count(), 1);
    }

    #[test]
    fn test_endpoint_without_http_type() {
        let doc = document(
            "  name: a\n  space: s\n  source:\n    path: ./x\n  health_check:\n    type: port\n    http_endpoint: /health\n",
        );
        let result = ConfigValidator::new().check(&doc);
        assert!(!result.is_valid());
    }
}
