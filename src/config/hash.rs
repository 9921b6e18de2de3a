//! Hashing for change detection.
//!
//! This module provides deterministic hashing of application specs, used to
//! record what was last applied, and content hashing of artifacts, used to
//! detect code changes between reconciles.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

use super::spec::{AppSpec, Source};

/// Read buffer used when hashing files.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Hasher for specs and artifact contents.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of an application spec.
    ///
    /// Maps are ordered, so the result does not depend on declaration order
    /// of environment keys, labels or annotations.
    #[must_use]
    pub fn hash_app(&self, app: &AppSpec) -> String {
        let mut hasher = Sha256::new();

        hasher.update(app.name.as_bytes());
        hasher.update(app.space.as_bytes());
        for field in [&app.buildpack, &app.stack, &app.command] {
            hasher.update(field.as_deref().unwrap_or_default().as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([u8::from(app.enable_ssh.unwrap_or_default()), u8::from(app.stopped)]);
        hasher.update(app.instances.to_be_bytes());
        hasher.update(app.memory.to_be_bytes());
        hasher.update(app.disk.to_be_bytes());

        let mut ports = app.ports.clone();
        ports.sort_unstable();
        for port in ports {
            hasher.update(port.to_be_bytes());
        }

        hasher.update(app.health_check.check_type.as_str().as_bytes());
        if let Some(endpoint) = &app.health_check.http_endpoint {
            hasher.update(endpoint.as_bytes());
        }
        if let Some(timeout) = app.health_check.timeout {
            hasher.update(timeout.to_be_bytes());
        }

        for (key, value) in &app.environment {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }

        for route in &app.routes {
            hasher.update(route.route.as_bytes());
            hasher.update(app.route_port(route).to_be_bytes());
        }

        for binding in &app.service_bindings {
            hasher.update(binding.service_instance.as_bytes());
            hasher.update(binding.params.0.to_string().as_bytes());
        }

        hasher.update(Self::source_fingerprint(&app.source).as_bytes());
        if let Some(hash) = &app.source_code_hash {
            hasher.update(hash.as_bytes());
        }

        for (key, value) in app.labels.iter().chain(app.annotations.iter()) {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Identity of a source, without credentials.
    fn source_fingerprint(source: &Source) -> String {
        match source {
            Source::Path(path) => format!("path:{}", path.display()),
            Source::Url(url) => format!("url:{url}"),
            Source::Git(git) => format!(
                "git:{}#{}",
                git.url,
                git.tag.as_deref().or(git.branch.as_deref()).unwrap_or_default()
            ),
            Source::Release(release) => format!(
                "release:{}/{}@{}:{}",
                release.owner,
                release.repo,
                release.version.as_deref().unwrap_or("latest"),
                release.filename
            ),
            Source::Docker(docker) => format!("docker:{}", docker.image),
        }
    }

    /// Computes the sha256 of a byte slice.
    #[must_use]
    pub fn hash_bytes(&self, bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Computes the sha256 of a file's contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn hash_file(&self, path: &Path) -> std::io::Result<String> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
