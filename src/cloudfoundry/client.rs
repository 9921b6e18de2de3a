//! Cloud Controller v3 API client implementation.
//!
//! This module provides the HTTP client for the platform's v3 REST surface.
//! Each method is a single call; retries cover transient transport failures
//! only.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::{debug, trace};

use crate::config::ProviderConfig;
use crate::error::{ApiErrorDetail, ConfigError, DeployerError, PlatformError, Result};

use super::platform::Platform;
use super::types::{
    App, BindingCreated, Build, CreateAppRequest, CreateBindingRequest, CreatePackageRequest,
    Destination, Droplet, Job, Lifecycle, LifecycleType, MetadataPatch, Package, Process,
    ProcessInstance, ProcessUpdate, Route, ScaleRequest, ServiceCredentialBinding,
    UpdateAppRequest,
};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// Longest `Retry-After` the client is willing to sleep.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// Page size requested for list endpoints.
const PAGE_SIZE: &str = "5000";

/// Largest batch the log cache returns in one read.
const LOG_CACHE_MAX: i64 = 1000;

/// Cloud Controller v3 client.
#[derive(Debug)]
pub struct CfClient {
    /// HTTP client.
    client: Client,
    /// API base URL without trailing slash.
    api_url: String,
    /// Bearer token.
    token: String,
    /// Delay unit between retries.
    retry_delay: Duration,
    /// Log cache base URL, discovered from the root document.
    log_cache_url: OnceCell<String>,
}

/// A successful response, kept raw so callers can branch on status.
#[derive(Debug)]
struct RawResponse {
    status: StatusCode,
    location: Option<String>,
    body: String,
}

impl RawResponse {
    fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            PlatformError::invalid_response(format!("Failed to parse response: {e}")).into()
        })
    }
}

/// Paginated list envelope.
#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default)]
    pagination: Option<Pagination>,
    resources: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    next: Option<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

/// Error envelope returned on 4xx and 5xx responses.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

impl CfClient {
    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(api_url: &str, token: &str, skip_ssl_validation: bool) -> Result<Self> {
        Self::with_timeout(api_url, token, skip_ssl_validation, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(
        api_url: &str,
        token: &str,
        skip_ssl_validation: bool,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .danger_accept_invalid_certs(skip_ssl_validation)
            .build()
            .map_err(|e| PlatformError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
            log_cache_url: OnceCell::new(),
        })
    }

    /// Creates a client from provider settings.
    ///
    /// # Errors
    ///
    /// Returns an error if no token is configured or the HTTP client cannot
    /// be created.
    pub fn from_config(provider: &ProviderConfig) -> Result<Self> {
        let token = provider.token.as_deref().ok_or_else(|| ConfigError::MissingEnvVar {
            name: String::from("CF_TOKEN"),
        })?;
        Self::new(&provider.api_url, token, provider.skip_ssl_validation)
    }

    /// Overrides the delay unit between retries.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Returns the API base URL.
    #[must_use]
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Resolves a path or absolute URL against the API base.
    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{path}", self.api_url)
        }
    }

    /// Builds an API URL with encoded query parameters.
    fn query_url(&self, path: &str, pairs: &[(&str, &str)]) -> Result<String> {
        let mut url = url::Url::parse(&self.url(path))
            .map_err(|e| PlatformError::invalid_response(format!("Invalid URL {path}: {e}")))?;
        url.query_pairs_mut().extend_pairs(pairs);
        Ok(url.into())
    }

    /// Executes a JSON request with bounded retries.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<RawResponse> {
        let url = self.url(path);
        let mut last_error = None;
        let mut wait = Duration::ZERO;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!("Retry attempt {attempt} of {MAX_RETRIES} for {method} {url} in {wait:?}");
                tokio::time::sleep(wait).await;
            }

            let mut request = self.client.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }

            match self.send(request, &url).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    // Rate limits carry their own delay; other failures back off linearly.
                    wait = e.retry_delay_secs().map_or(self.retry_delay * (attempt + 1), |secs| {
                        Duration::from_secs(secs).min(MAX_RETRY_AFTER)
                    });
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| PlatformError::network("Max retries exceeded").into()))
    }

    /// Sends a single request and maps error statuses.
    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<RawResponse> {
        trace!("Sending request to {url}");

        let response = request
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| PlatformError::network(format!("Request failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            let retry_after = if retry_after == 0 { 60 } else { retry_after };

            return Err(PlatformError::RateLimited {
                retry_after_secs: retry_after,
            }
            .into());
        }

        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| PlatformError::network(format!("Failed to read response: {e}")))?;

        if status.is_success() {
            return Ok(RawResponse {
                status,
                location,
                body,
            });
        }

        Err(Self::status_error(status, &body, url))
    }

    /// Maps an error status and v3 error body to a platform error.
    fn status_error(status: StatusCode, body: &str, url: &str) -> DeployerError {
        let errors = serde_json::from_str::<ErrorBody>(body)
            .unwrap_or_default()
            .errors;
        let code = status.as_u16();

        let error = match code {
            404 => PlatformError::not_found(resource_of(url), url),
            401 | 403 => PlatformError::NotAuthorized {
                status: code,
                message: errors
                    .first()
                    .map_or_else(|| body.to_string(), |e| e.detail.clone()),
            },
            500..=599 => PlatformError::NetworkError {
                message: format!("server returned {code}: {body}"),
                server_error: true,
            },
            _ => PlatformError::ApiRequestFailed {
                status: code,
                errors: if errors.is_empty() {
                    vec![ApiErrorDetail {
                        code: 0,
                        title: String::from("UnknownError"),
                        detail: body.to_string(),
                    }]
                } else {
                    errors
                },
            },
        };
        error.into()
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.execute(Method::GET, path, None).await?.json()
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        self.execute(Method::POST, path, Some(body)).await?.json()
    }

    async fn patch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        self.execute(Method::PATCH, path, Some(body)).await?.json()
    }

    /// Issues a DELETE, returning the job URL of an asynchronous deletion.
    async fn delete(&self, path: &str) -> Result<Option<String>> {
        let response = self.execute(Method::DELETE, path, None).await?;
        Ok(if response.status == StatusCode::ACCEPTED {
            response.location
        } else {
            None
        })
    }

    /// Reads every page of a list endpoint.
    async fn list<T: DeserializeOwned>(&self, url: String) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(url);

        while let Some(url) = next {
            let page: ListResponse<T> = self.get_json(&url).await?;
            items.extend(page.resources);
            next = page.pagination.and_then(|p| p.next).map(|l| l.href);
        }

        Ok(items)
    }

    /// Discovers the log cache URL from the root document.
    async fn log_cache_url(&self) -> Result<&str> {
        #[derive(Deserialize)]
        struct Root {
            links: RootLinks,
        }
        #[derive(Deserialize)]
        struct RootLinks {
            log_cache: Option<Link>,
        }

        let url = self
            .log_cache_url
            .get_or_try_init(|| async {
                let root: Root = self.get_json("/").await?;
                root.links
                    .log_cache
                    .map(|l| l.href.trim_end_matches('/').to_string())
                    .ok_or_else(|| {
                        DeployerError::from(PlatformError::invalid_response(
                            "root document has no log_cache link",
                        ))
                    })
            })
            .await?;
        Ok(url.as_str())
    }
}

/// Extracts the resource kind from a v3 URL (`/v3/apps/..` yields `apps`).
fn resource_of(url: &str) -> String {
    url.split("/v3/")
        .nth(1)
        .and_then(|rest| rest.split(['/', '?']).next())
        .filter(|s| !s.is_empty())
        .unwrap_or("resource")
        .to_string()
}

/// JSON body of a lifecycle; docker lifecycles carry no data.
fn lifecycle_body(lifecycle: &Lifecycle) -> serde_json::Value {
    match lifecycle.kind {
        LifecycleType::Docker => serde_json::json!({ "type": "docker", "data": {} }),
        LifecycleType::Buildpack => serde_json::json!({
            "type": "buildpack",
            "data": {
                "buildpacks": lifecycle.data.buildpacks,
                "stack": lifecycle.data.stack,
            }
        }),
    }
}

/// JSON body of a process update; the endpoint only applies to http checks.
fn process_update_body(update: &ProcessUpdate) -> serde_json::Value {
    let mut data = serde_json::Map::new();
    if let Some(timeout) = update.health_check.data.timeout {
        data.insert(String::from("timeout"), serde_json::json!(timeout));
    }
    if update.health_check.kind == "http" {
        data.insert(
            String::from("endpoint"),
            serde_json::json!(update.health_check.data.endpoint),
        );
    }

    serde_json::json!({
        "command": update.command,
        "health_check": {
            "type": update.health_check.kind,
            "data": data,
        }
    })
}

#[async_trait]
impl Platform for CfClient {
    async fn find_app(&self, space_guid: &str, name: &str) -> Result<Option<App>> {
        let url = self.query_url(
            "/v3/apps",
            &[("names", name), ("space_guids", space_guid), ("per_page", PAGE_SIZE)],
        )?;
        let apps: Vec<App> = self.list(url).await?;
        Ok(apps.into_iter().find(|a| a.name == name))
    }

    async fn get_app(&self, app_guid: &str) -> Result<App> {
        self.get_json(&format!("/v3/apps/{app_guid}")).await
    }

    async fn create_app(&self, request: &CreateAppRequest) -> Result<App> {
        let body = serde_json::json!({
            "name": request.name,
            "relationships": { "space": { "data": { "guid": request.space_guid } } },
            "lifecycle": lifecycle_body(&request.lifecycle),
            "environment_variables": request.environment,
            "metadata": request.metadata,
        });
        self.post_json("/v3/apps", &body).await
    }

    async fn update_app(&self, app_guid: &str, request: &UpdateAppRequest) -> Result<App> {
        let mut body = serde_json::Map::new();
        if let Some(name) = &request.name {
            body.insert(String::from("name"), serde_json::json!(name));
        }
        if let Some(lifecycle) = &request.lifecycle {
            body.insert(String::from("lifecycle"), lifecycle_body(lifecycle));
        }
        self.patch_json(&format!("/v3/apps/{app_guid}"), &serde_json::Value::Object(body))
            .await
    }

    async fn delete_app(&self, app_guid: &str) -> Result<Option<String>> {
        self.delete(&format!("/v3/apps/{app_guid}")).await
    }

    async fn start_app(&self, app_guid: &str) -> Result<App> {
        self.post_json(&format!("/v3/apps/{app_guid}/actions/start"), &serde_json::json!({}))
            .await
    }

    async fn stop_app(&self, app_guid: &str) -> Result<App> {
        self.post_json(&format!("/v3/apps/{app_guid}/actions/stop"), &serde_json::json!({}))
            .await
    }

    async fn get_environment(&self, app_guid: &str) -> Result<BTreeMap<String, String>> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            var: BTreeMap<String, serde_json::Value>,
        }

        let response: Response = self
            .get_json(&format!("/v3/apps/{app_guid}/environment_variables"))
            .await?;

        Ok(response
            .var
            .into_iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(s) => (key, s),
                other => (key, other.to_string()),
            })
            .collect())
    }

    async fn update_environment(
        &self,
        app_guid: &str,
        vars: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let body = serde_json::json!({ "var": vars });
        self.execute(
            Method::PATCH,
            &format!("/v3/apps/{app_guid}/environment_variables"),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn get_ssh_enabled(&self, app_guid: &str) -> Result<bool> {
        #[derive(Deserialize)]
        struct Response {
            enabled: bool,
        }

        let response: Response = self
            .get_json(&format!("/v3/apps/{app_guid}/features/ssh"))
            .await?;
        Ok(response.enabled)
    }

    async fn set_ssh_enabled(&self, app_guid: &str, enabled: bool) -> Result<()> {
        let body = serde_json::json!({ "enabled": enabled });
        self.execute(
            Method::PATCH,
            &format!("/v3/apps/{app_guid}/features/ssh"),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn update_metadata(&self, app_guid: &str, patch: &MetadataPatch) -> Result<()> {
        let body = serde_json::json!({ "metadata": patch });
        self.execute(Method::PATCH, &format!("/v3/apps/{app_guid}"), Some(&body))
            .await?;
        Ok(())
    }

    async fn create_package(&self, request: &CreatePackageRequest) -> Result<Package> {
        let body = match request {
            CreatePackageRequest::Bits { app_guid } => serde_json::json!({
                "type": "bits",
                "relationships": { "app": { "data": { "guid": app_guid } } },
            }),
            CreatePackageRequest::Docker {
                app_guid,
                image,
                username,
                password,
            } => {
                let mut data = serde_json::json!({ "image": image });
                if let (Some(username), Some(password)) = (username, password) {
                    data["username"] = serde_json::json!(username);
                    data["password"] = serde_json::json!(password);
                }
                serde_json::json!({
                    "type": "docker",
                    "relationships": { "app": { "data": { "guid": app_guid } } },
                    "data": data,
                })
            }
        };
        self.post_json("/v3/packages", &body).await
    }

    async fn copy_package(&self, source_package_guid: &str, app_guid: &str) -> Result<Package> {
        let url = self.query_url("/v3/packages", &[("source_guid", source_package_guid)])?;
        let body = serde_json::json!({
            "relationships": { "app": { "data": { "guid": app_guid } } },
        });
        self.post_json(&url, &body).await
    }

    async fn upload_package_bits(&self, package_guid: &str, archive: &Path) -> Result<Package> {
        let file = tokio::fs::File::open(archive).await?;
        let length = file.metadata().await?.len();
        let file_name = archive
            .file_name()
            .map_or_else(|| String::from("bits.zip"), |n| n.to_string_lossy().into_owned());

        debug!("Uploading {length} bytes from {} to package {package_guid}", archive.display());

        let part = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(ReaderStream::new(file)),
            length,
        )
        .file_name(file_name)
        .mime_str("application/zip")
        .map_err(|e| PlatformError::network(format!("Invalid upload part: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("resources", "[]")
            .part("bits", part);

        let url = self.url(&format!("/v3/packages/{package_guid}/upload"));
        let request = self.client.post(&url).multipart(form);
        self.send(request, &url).await?.json()
    }

    async fn get_package(&self, package_guid: &str) -> Result<Package> {
        self.get_json(&format!("/v3/packages/{package_guid}")).await
    }

    async fn list_packages(&self, app_guid: &str) -> Result<Vec<Package>> {
        let url = self.query_url(
            &format!("/v3/apps/{app_guid}/packages"),
            &[("order_by", "-created_at"), ("per_page", PAGE_SIZE)],
        )?;
        self.list(url).await
    }

    async fn create_build(&self, package_guid: &str) -> Result<Build> {
        let body = serde_json::json!({ "package": { "guid": package_guid } });
        self.post_json("/v3/builds", &body).await
    }

    async fn get_build(&self, build_guid: &str) -> Result<Build> {
        self.get_json(&format!("/v3/builds/{build_guid}")).await
    }

    async fn get_current_droplet(&self, app_guid: &str) -> Result<Option<Droplet>> {
        match self
            .get_json(&format!("/v3/apps/{app_guid}/droplets/current"))
            .await
        {
            Ok(droplet) => Ok(Some(droplet)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_current_droplet(&self, app_guid: &str, droplet_guid: &str) -> Result<()> {
        let body = serde_json::json!({ "data": { "guid": droplet_guid } });
        self.execute(
            Method::PATCH,
            &format!("/v3/apps/{app_guid}/relationships/current_droplet"),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn get_web_process(&self, app_guid: &str) -> Result<Process> {
        self.get_json(&format!("/v3/apps/{app_guid}/processes/web"))
            .await
    }

    async fn scale_web_process(&self, app_guid: &str, scale: &ScaleRequest) -> Result<Process> {
        let body = serde_json::json!({
            "instances": scale.instances,
            "memory_in_mb": scale.memory_in_mb,
            "disk_in_mb": scale.disk_in_mb,
        });
        self.post_json(
            &format!("/v3/apps/{app_guid}/processes/web/actions/scale"),
            &body,
        )
        .await
    }

    async fn update_process(&self, process_guid: &str, update: &ProcessUpdate) -> Result<Process> {
        self.patch_json(
            &format!("/v3/processes/{process_guid}"),
            &process_update_body(update),
        )
        .await
    }

    async fn get_process_instances(&self, process_guid: &str) -> Result<Vec<ProcessInstance>> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            resources: Vec<ProcessInstance>,
        }

        let response: Response = self
            .get_json(&format!("/v3/processes/{process_guid}/stats"))
            .await?;
        Ok(response.resources)
    }

    async fn list_app_routes(&self, app_guid: &str) -> Result<Vec<Route>> {
        let url = self.query_url(
            &format!("/v3/apps/{app_guid}/routes"),
            &[("per_page", PAGE_SIZE)],
        )?;
        self.list(url).await
    }

    async fn get_route(&self, route_guid: &str) -> Result<Route> {
        self.get_json(&format!("/v3/routes/{route_guid}")).await
    }

    async fn insert_destination(
        &self,
        route_guid: &str,
        app_guid: &str,
        port: u16,
    ) -> Result<Destination> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            destinations: Vec<Destination>,
        }

        let body = serde_json::json!({
            "destinations": [{
                "app": { "guid": app_guid, "process": { "type": "web" } },
                "port": port,
            }]
        });
        let response: Response = self
            .post_json(&format!("/v3/routes/{route_guid}/destinations"), &body)
            .await?;

        response
            .destinations
            .into_iter()
            .find(|d| d.app.guid == app_guid && d.port.unwrap_or(port) == port)
            .ok_or_else(|| {
                PlatformError::invalid_response(format!(
                    "route {route_guid} has no destination for app {app_guid} on port {port}"
                ))
                .into()
            })
    }

    async fn remove_destination(&self, route_guid: &str, destination_guid: &str) -> Result<()> {
        self.execute(
            Method::DELETE,
            &format!("/v3/routes/{route_guid}/destinations/{destination_guid}"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn list_bindings(&self, app_guid: &str) -> Result<Vec<ServiceCredentialBinding>> {
        let url = self.query_url(
            "/v3/service_credential_bindings",
            &[("app_guids", app_guid), ("type", "app"), ("per_page", PAGE_SIZE)],
        )?;
        self.list(url).await
    }

    async fn get_binding(&self, binding_guid: &str) -> Result<ServiceCredentialBinding> {
        self.get_json(&format!("/v3/service_credential_bindings/{binding_guid}"))
            .await
    }

    async fn create_binding(&self, request: &CreateBindingRequest) -> Result<BindingCreated> {
        let mut body = serde_json::json!({
            "type": "app",
            "relationships": {
                "service_instance": { "data": { "guid": request.service_instance_guid } },
                "app": { "data": { "guid": request.app_guid } },
            },
        });
        if let Some(parameters) = &request.parameters {
            body["parameters"] = parameters.clone();
        }

        let response = self
            .execute(Method::POST, "/v3/service_credential_bindings", Some(&body))
            .await?;

        if response.status == StatusCode::ACCEPTED {
            let job = response.location.ok_or_else(|| {
                PlatformError::invalid_response("asynchronous binding without job location")
            })?;
            return Ok(BindingCreated::Job(job));
        }
        Ok(BindingCreated::Ready(response.json()?))
    }

    async fn delete_binding(&self, binding_guid: &str) -> Result<Option<String>> {
        self.delete(&format!("/v3/service_credential_bindings/{binding_guid}"))
            .await
    }

    async fn get_job(&self, job: &str) -> Result<Job> {
        if job.starts_with("http://") || job.starts_with("https://") {
            self.get_json(job).await
        } else {
            self.get_json(&format!("/v3/jobs/{job}")).await
        }
    }

    async fn recent_logs(&self, app_guid: &str, limit: i64) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Response {
            envelopes: Envelopes,
        }
        #[derive(Deserialize)]
        struct Envelopes {
            #[serde(default)]
            batch: Vec<Envelope>,
        }
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(default)]
            log: Option<LogPayload>,
        }
        #[derive(Deserialize)]
        struct LogPayload {
            #[serde(default)]
            payload: String,
            #[serde(rename = "type", default)]
            kind: String,
        }

        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = if limit < 0 { LOG_CACHE_MAX } else { limit.min(LOG_CACHE_MAX) };

        let base = self.log_cache_url().await?.to_string();
        let limit = limit.to_string();
        let url = self.query_url(
            &format!("{base}/api/v1/read/{app_guid}"),
            &[
                ("envelope_types", "LOG"),
                ("descending", "true"),
                ("limit", &limit),
            ],
        )?;
        let response: Response = self.get_json(&url).await?;

        let engine = base64::engine::general_purpose::STANDARD;
        let mut lines: Vec<String> = response
            .envelopes
            .batch
            .into_iter()
            .filter_map(|e| e.log)
            .map(|log| {
                let text = engine
                    .decode(log.payload.as_bytes())
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or(log.payload);
                format!("{} {}", log.kind, text.trim_end())
            })
            .collect();
        lines.reverse();

        Ok(lines)
    }
}
