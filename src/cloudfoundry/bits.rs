//! Bits upload and package preparation.
//!
//! Produces a `READY` package for an application from a local zip archive,
//! a docker image reference, or the current package of another application.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DockerSource;
use crate::error::{PlatformError, Result};

use super::jobs::poll_until;
use super::platform::Platform;
use super::types::{CreatePackageRequest, Package, PackageState};

/// Uploads application bits and waits for the resulting package.
#[derive(Clone)]
pub struct BitsUploader {
    /// Platform used for package calls.
    platform: Arc<dyn Platform>,
    /// Interval between package polls.
    interval: Duration,
    /// Stops package polling.
    cancel: CancellationToken,
}

impl std::fmt::Debug for BitsUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitsUploader")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl BitsUploader {
    /// Creates a new uploader.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, interval: Duration) -> Self {
        Self {
            platform,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops waiting for packages when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Creates a bits package, streams `archive` into it and waits for `READY`.
    ///
    /// # Errors
    ///
    /// Returns an error if the package cannot be created or uploaded, if the
    /// platform reports the upload as failed, or on timeout.
    pub async fn upload(&self, app_guid: &str, archive: &Path, timeout: Duration) -> Result<Package> {
        info!("Uploading bits for app {app_guid} from {}", archive.display());

        let package = self
            .platform
            .create_package(&CreatePackageRequest::Bits {
                app_guid: app_guid.to_string(),
            })
            .await?;
        debug!("Created package {}", package.guid);

        let uploaded = self
            .platform
            .upload_package_bits(&package.guid, archive)
            .await?;

        self.wait_ready(uploaded, timeout).await
    }

    /// Creates a docker package for an image.
    ///
    /// # Errors
    ///
    /// Returns an error if the package cannot be created or never becomes
    /// ready.
    pub async fn import_docker(
        &self,
        app_guid: &str,
        docker: &DockerSource,
        timeout: Duration,
    ) -> Result<Package> {
        info!("Creating docker package for app {app_guid} from {}", docker.image);

        let package = self
            .platform
            .create_package(&CreatePackageRequest::Docker {
                app_guid: app_guid.to_string(),
                image: docker.image.clone(),
                username: docker.username.clone(),
                password: docker.password.clone(),
            })
            .await?;

        self.wait_ready(package, timeout).await
    }

    /// Copies the newest ready package of `source_app_guid` into `app_guid`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the source application has no ready package,
    /// or any error of the copy itself.
    pub async fn copy_from_app(
        &self,
        source_app_guid: &str,
        app_guid: &str,
        timeout: Duration,
    ) -> Result<Package> {
        let packages = self.platform.list_packages(source_app_guid).await?;
        let source = packages
            .into_iter()
            .find(|p| p.state == PackageState::Ready)
            .ok_or_else(|| PlatformError::not_found("ready package of app", source_app_guid))?;

        info!("Copying package {} from app {source_app_guid} to {app_guid}", source.guid);

        let package = self.platform.copy_package(&source.guid, app_guid).await?;
        self.wait_ready(package, timeout).await
    }

    /// Polls a package until it is `READY`.
    async fn wait_ready(&self, package: Package, timeout: Duration) -> Result<Package> {
        if package.state == PackageState::Ready {
            return Ok(package);
        }

        let platform = &self.platform;
        let guid = package.guid.as_str();

        let operation = format!("package {guid}");
        poll_until(&operation, self.interval, timeout, &self.cancel, move || async move {
            let current = platform.get_package(guid).await?;
            let outcome: Result<Option<Package>> = match current.state {
                PackageState::Ready => Ok(Some(current)),
                PackageState::Failed | PackageState::Expired => Err(PlatformError::invalid_response(
                    format!("package {guid} is {:?}", current.state),
                )
                .into()),
                _ => Ok(None),
            };
            outcome
        })
        .await
    }
}
