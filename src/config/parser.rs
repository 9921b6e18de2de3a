//! Configuration parser for loading deployment documents.
//!
//! This module handles loading the deployment document from YAML and
//! applying environment variable overrides, with proper precedence and
//! error handling.

use crate::error::{ConfigError, DeployerError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::DeployDocument;

/// Configuration parser for loading deployment documents.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a deployment document from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployDocument> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(DeployerError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployerError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a deployment document from a YAML string.
    ///
    /// Relative local source paths are resolved against the base path and
    /// the application spec is normalized.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployDocument> {
        debug!("Parsing YAML configuration");

        let mut document: DeployDocument = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            DeployerError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        document.provider.api_url = document.provider.api_url.trim_end_matches('/').to_string();
        if let (Some(base), super::Source::Path(path)) = (&self.base_path, &mut document.app.source) {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        document.app.normalize();

        debug!("Successfully parsed configuration for app: {}", document.app.name);
        Ok(document)
    }

    /// Loads a deployment document with environment variable overrides.
    ///
    /// Recognized variables: `CF_API_URL`, `CF_TOKEN`,
    /// `CF_SKIP_SSL_VALIDATION`, `CFDEPLOY_APP_LOGS_MAX`, `CFDEPLOY_WORKSPACE`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployDocument> {
        let mut document = self.load_file(path)?;
        Self::apply_env_overrides(&mut document, |name| std::env::var(name).ok());
        Ok(document)
    }

    /// Applies environment variable overrides using the given lookup.
    pub fn apply_env_overrides(document: &mut DeployDocument, lookup: impl Fn(&str) -> Option<String>) {
        let provider = &mut document.provider;

        if let Some(api_url) = lookup("CF_API_URL") {
            debug!("Overriding provider.api_url from environment");
            provider.api_url = api_url.trim_end_matches('/').to_string();
        }

        if let Some(token) = lookup("CF_TOKEN") {
            debug!("Overriding provider.token from environment");
            provider.token = Some(token);
        }

        if let Some(skip) = lookup("CF_SKIP_SSL_VALIDATION") {
            provider.skip_ssl_validation = matches!(skip.as_str(), "1" | "true" | "TRUE" | "yes");
        }

        if let Some(max) = lookup("CFDEPLOY_APP_LOGS_MAX").and_then(|v| v.parse().ok()) {
            debug!("Overriding provider.app_logs_max from environment");
            provider.app_logs_max = max;
        }

        if let Some(workspace) = lookup("CFDEPLOY_WORKSPACE") {
            debug!("Overriding provider.workspace from environment");
            provider.workspace = Some(PathBuf::from(workspace));
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                DeployerError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Returns the API token from the document or the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if no token is configured.
    pub fn resolve_token(document: &DeployDocument) -> Result<String> {
        document
            .provider
            .token
            .clone()
            .or_else(|| std::env::var("CF_TOKEN").ok())
            .ok_or_else(|| {
                DeployerError::Config(ConfigError::MissingEnvVar {
                    name: String::from("CF_TOKEN"),
                })
            })
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "cfdeploy.yaml",
    "cfdeploy.yml",
    "deploy.yaml",
    "deploy.yml",
];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(DeployerError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
