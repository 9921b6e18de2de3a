//! Configuration module for the deployer.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `cfdeploy.yaml`
//! - Validation of configuration values
//! - Computing hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    AppSpec, BindingParams, DEFAULT_APP_PORT, DeployDocument, DockerSource, GitSource,
    HealthCheck, HealthCheckType, ProviderConfig, RESERVED_PORT_MAX, ReleaseSource, RouteSpec,
    ServiceBinding, Source, StateConfig, Strategy, Timeouts,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
