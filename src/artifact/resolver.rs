//! Artifact resolution.
//!
//! Maps a source to a local zip ready for upload, plus the content hash used
//! to detect code changes between reconciles.

use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::config::{ConfigHasher, DockerSource, GitSource, ReleaseSource, Source};
use crate::error::{ArtifactError, DeployerError, Result};

use super::archive::{is_zip, rezip_stripped, staging_path, tarball_to_zip, zip_directory};
use super::git::checkout_to_zip;
use super::release::{release_asset, AssetKind};
use super::workspace::{parse_source_url, Workspace};

/// Timeout of a single artifact download.
const DOWNLOAD_TIMEOUT_SECS: u64 = 600;

/// A source resolved to uploadable bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// Zip archive to upload; `None` for docker images.
    pub path: Option<PathBuf>,
    /// sha256 of the archive; `None` for docker images.
    pub hash: Option<String>,
    /// Image reference for docker sources.
    pub docker: Option<DockerSource>,
}

impl ResolvedArtifact {
    fn bits(path: PathBuf, hash: String) -> Self {
        Self {
            path: Some(path),
            hash: Some(hash),
            docker: None,
        }
    }
}

/// Resolves sources into the workspace.
#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    /// Workspace receiving the resolved archives.
    workspace: Workspace,
    /// HTTP client for downloads.
    http: reqwest::Client,
}

impl ArtifactResolver {
    /// Creates a resolver over an initialized workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(workspace: Workspace) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .user_agent(concat!("cfdeploy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeployerError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { workspace, http })
    }

    /// Workspace used by this resolver.
    #[must_use]
    pub const fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Resolves a source.
    ///
    /// `declared_hash` is the hash the desired state supplies; when the
    /// archive already in the workspace has that hash, remote sources are
    /// not fetched again.
    ///
    /// # Errors
    ///
    /// Returns an error if the workspace is gone, the source cannot be
    /// fetched, or the archive cannot be produced.
    pub async fn resolve(&self, source: &Source, declared_hash: Option<&str>) -> Result<ResolvedArtifact> {
        if let Source::Docker(docker) = source {
            return Ok(ResolvedArtifact {
                path: None,
                hash: None,
                docker: Some(docker.clone()),
            });
        }

        self.workspace.ensure_available()?;
        info!("Resolving artifact from {}", source.describe());

        match source {
            Source::Path(path) => self.resolve_path(path).await,
            Source::Url(url) => self.resolve_url(url, declared_hash).await,
            Source::Git(git) => self.resolve_git(git).await,
            Source::Release(release) => self.resolve_release(release, declared_hash).await,
            Source::Docker(_) => Err(ArtifactError::InvalidSource {
                message: String::from("docker images have no bits"),
            }
            .into()),
        }
    }

    async fn resolve_path(&self, path: &Path) -> Result<ResolvedArtifact> {
        let path = tokio::fs::canonicalize(path).await.map_err(|e| ArtifactError::InvalidSource {
            message: format!("{}: {e}", path.display()),
        })?;

        if !path.is_dir() {
            let hash = hash_file(path.clone()).await?;
            return Ok(ResolvedArtifact::bits(path, hash));
        }

        let url = Url::from_directory_path(&path).map_err(|()| ArtifactError::InvalidSource {
            message: format!("{} is not an absolute path", path.display()),
        })?;
        let dest = self.workspace.artifact_path(&url);
        debug!("Zipping {} into {}", path.display(), dest.display());

        let (src, out) = (path.clone(), dest.clone());
        blocking(move || zip_directory(&src, &out)).await?;

        let hash = hash_file(dest.clone()).await?;
        Ok(ResolvedArtifact::bits(dest, hash))
    }

    async fn resolve_url(&self, raw: &str, declared_hash: Option<&str>) -> Result<ResolvedArtifact> {
        let url = parse_source_url(raw)?;
        let dest = self.workspace.artifact_path(&url);

        if let Some(artifact) = cached(&dest, declared_hash).await? {
            return Ok(artifact);
        }

        let hash = self.download(raw, &dest, None).await?;

        let check = dest.clone();
        if !blocking(move || is_zip(&check)).await? {
            return Err(ArtifactError::archive(&dest, "downloaded file is not a zip archive").into());
        }

        Ok(ResolvedArtifact::bits(dest, hash))
    }

    async fn resolve_git(&self, git: &GitSource) -> Result<ResolvedArtifact> {
        let url = parse_source_url(&git.url)?;
        let dest = self.workspace.artifact_path(&url);

        let key_file = match &git.key {
            Some(key) => Some(
                self.workspace
                    .write_key(url.host_str().unwrap_or("local"), key)
                    .await?,
            ),
            None => None,
        };

        let (source, out) = (git.clone(), dest.clone());
        blocking(move || checkout_to_zip(&source, key_file.as_deref(), &out)).await?;

        let hash = hash_file(dest.clone()).await?;
        Ok(ResolvedArtifact::bits(dest, hash))
    }

    async fn resolve_release(
        &self,
        release: &ReleaseSource,
        declared_hash: Option<&str>,
    ) -> Result<ResolvedArtifact> {
        let asset = release_asset(release);
        let url = parse_source_url(&asset.url)?;
        let dest = self.workspace.artifact_path(&url);

        if let Some(artifact) = cached(&dest, declared_hash).await? {
            return Ok(artifact);
        }

        let auth = release.user.as_deref().zip(release.password.as_deref());

        if asset.kind == AssetKind::File {
            let hash = self.download(&asset.url, &dest, auth).await?;
            return Ok(ResolvedArtifact::bits(dest, hash));
        }

        let original = staging_path(&dest, ".orig");
        self.download(&asset.url, &original, auth).await?;

        let (src, out, kind) = (original.clone(), dest.clone(), asset.kind);
        let converted = blocking(move || match kind {
            AssetKind::Tarball => tarball_to_zip(&src, &out),
            _ => rezip_stripped(&src, &out),
        })
        .await;
        if let Err(e) = tokio::fs::remove_file(&original).await {
            debug!("Could not remove {}: {e}", original.display());
        }
        converted?;

        let hash = hash_file(dest.clone()).await?;
        Ok(ResolvedArtifact::bits(dest, hash))
    }

    /// Streams `url` into `dest`, returning the sha256 of the bytes.
    async fn download(&self, url: &str, dest: &Path, auth: Option<(&str, &str)>) -> Result<String> {
        let failed = |message: String| ArtifactError::DownloadFailed {
            url: url.to_string(),
            message,
        };

        debug!("Downloading {url} to {}", dest.display());

        let mut request = self.http.get(url);
        if let Some((user, password)) = auth {
            request = request.basic_auth(user, Some(password));
        }
        let response = request.send().await.map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")).into());
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = staging_path(dest, ".part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| failed(e.to_string()))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, dest).await?;
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Returns the archive already at `dest` when it matches the declared hash.
async fn cached(dest: &Path, declared_hash: Option<&str>) -> Result<Option<ResolvedArtifact>> {
    let Some(declared) = declared_hash else {
        return Ok(None);
    };
    if !tokio::fs::try_exists(dest).await.unwrap_or(false) {
        return Ok(None);
    }

    let hash = hash_file(dest.to_path_buf()).await?;
    if ConfigHasher::hashes_match(&hash, declared) {
        debug!("Reusing {} (hash unchanged)", dest.display());
        Ok(Some(ResolvedArtifact::bits(dest.to_path_buf(), hash)))
    } else {
        Ok(None)
    }
}

async fn hash_file(path: PathBuf) -> Result<String> {
    blocking(move || Ok(ConfigHasher::new().hash_file(&path)?)).await
}

/// Runs blocking archive or git work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DeployerError::internal(format!("blocking task failed: {e}")))?
}
