//! The platform capability consumed by the deploy stages.
//!
//! Every Cloud Controller call the deployer makes goes through this trait,
//! so stages, the runner and the reconciler can be exercised against a mock.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;

use super::types::{
    App, BindingCreated, Build, CreateAppRequest, CreateBindingRequest, CreatePackageRequest,
    Destination, Droplet, Job, MetadataPatch, Package, Process, ProcessInstance, ProcessUpdate,
    Route, ScaleRequest, ServiceCredentialBinding, UpdateAppRequest,
};

/// Typed operations over the Cloud Controller v3 API.
///
/// Implementations perform single calls and carry no business logic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    /// Finds an application by name in a space.
    async fn find_app(&self, space_guid: &str, name: &str) -> Result<Option<App>>;

    /// Gets an application.
    async fn get_app(&self, app_guid: &str) -> Result<App>;

    /// Creates an application.
    async fn create_app(&self, request: &CreateAppRequest) -> Result<App>;

    /// Updates name or lifecycle of an application.
    async fn update_app(&self, app_guid: &str, request: &UpdateAppRequest) -> Result<App>;

    /// Deletes an application, returning the deletion job URL if any.
    async fn delete_app(&self, app_guid: &str) -> Result<Option<String>>;

    /// Starts an application.
    async fn start_app(&self, app_guid: &str) -> Result<App>;

    /// Stops an application.
    async fn stop_app(&self, app_guid: &str) -> Result<App>;

    /// Reads the user-provided environment variables.
    async fn get_environment(&self, app_guid: &str) -> Result<BTreeMap<String, String>>;

    /// Updates environment variables; `None` values unset the key.
    async fn update_environment(
        &self,
        app_guid: &str,
        vars: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    /// Reads the ssh feature flag.
    async fn get_ssh_enabled(&self, app_guid: &str) -> Result<bool>;

    /// Sets the ssh feature flag.
    async fn set_ssh_enabled(&self, app_guid: &str, enabled: bool) -> Result<()>;

    /// Patches labels and annotations.
    async fn update_metadata(&self, app_guid: &str, patch: &MetadataPatch) -> Result<()>;

    /// Creates a bits or docker package.
    async fn create_package(&self, request: &CreatePackageRequest) -> Result<Package>;

    /// Copies a package into another application.
    async fn copy_package(&self, source_package_guid: &str, app_guid: &str) -> Result<Package>;

    /// Uploads a zip archive into a bits package.
    async fn upload_package_bits(&self, package_guid: &str, archive: &Path) -> Result<Package>;

    /// Gets a package.
    async fn get_package(&self, package_guid: &str) -> Result<Package>;

    /// Lists the packages of an application, newest first.
    async fn list_packages(&self, app_guid: &str) -> Result<Vec<Package>>;

    /// Starts staging a package.
    async fn create_build(&self, package_guid: &str) -> Result<Build>;

    /// Gets a build.
    async fn get_build(&self, build_guid: &str) -> Result<Build>;

    /// Gets the current droplet, if one is assigned.
    async fn get_current_droplet(&self, app_guid: &str) -> Result<Option<Droplet>>;

    /// Assigns the current droplet.
    async fn set_current_droplet(&self, app_guid: &str, droplet_guid: &str) -> Result<()>;

    /// Gets the web process of an application.
    async fn get_web_process(&self, app_guid: &str) -> Result<Process>;

    /// Scales the web process.
    async fn scale_web_process(&self, app_guid: &str, scale: &ScaleRequest) -> Result<Process>;

    /// Updates command and health check of a process.
    async fn update_process(&self, process_guid: &str, update: &ProcessUpdate) -> Result<Process>;

    /// Reads the instance states of a process.
    async fn get_process_instances(&self, process_guid: &str) -> Result<Vec<ProcessInstance>>;

    /// Lists routes with a destination pointing at the application.
    async fn list_app_routes(&self, app_guid: &str) -> Result<Vec<Route>>;

    /// Gets a route with its destinations.
    async fn get_route(&self, route_guid: &str) -> Result<Route>;

    /// Adds a destination for the application's web process to a route.
    async fn insert_destination(
        &self,
        route_guid: &str,
        app_guid: &str,
        port: u16,
    ) -> Result<Destination>;

    /// Removes a destination from a route.
    async fn remove_destination(&self, route_guid: &str, destination_guid: &str) -> Result<()>;

    /// Lists the app credential bindings of an application.
    async fn list_bindings(&self, app_guid: &str) -> Result<Vec<ServiceCredentialBinding>>;

    /// Gets a credential binding.
    async fn get_binding(&self, binding_guid: &str) -> Result<ServiceCredentialBinding>;

    /// Creates an app credential binding.
    async fn create_binding(&self, request: &CreateBindingRequest) -> Result<BindingCreated>;

    /// Deletes a credential binding, returning the deletion job URL if any.
    async fn delete_binding(&self, binding_guid: &str) -> Result<Option<String>>;

    /// Gets an asynchronous job by URL or guid.
    async fn get_job(&self, job: &str) -> Result<Job>;

    /// Reads recent log lines, oldest first; a negative limit reads all available.
    async fn recent_logs(&self, app_guid: &str, limit: i64) -> Result<Vec<String>>;
}
