//! Artifact workspace on disk.
//!
//! The workspace is an explicit capability: it is created with
//! [`Workspace::init`], handed to the resolver, and removed with
//! [`Workspace::teardown`]. Paths are partitioned by source host and path so
//! reconciles of distinct applications never share files.

use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;
use url::Url;

use crate::error::{ArtifactError, Result};

/// Name of the bits directory below the workspace root.
const BITS_DIR: &str = "bits";

/// Directory name used when no workspace root is configured.
const DEFAULT_WORKSPACE_DIR: &str = ".cfdeploy";

/// An initialized artifact workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Workspace root.
    root: PathBuf,
}

impl Workspace {
    /// Creates `root/bits` and returns the workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(BITS_DIR))?;
        debug!("Initialized artifact workspace at {}", root.display());
        Ok(Self { root })
    }

    /// Default workspace root (`~/.cfdeploy`), falling back to the current
    /// directory when no home directory is known.
    #[must_use]
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_WORKSPACE_DIR)
    }

    /// Workspace root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding resolved bits.
    #[must_use]
    pub fn bits_dir(&self) -> PathBuf {
        self.root.join(BITS_DIR)
    }

    /// Fails when the workspace has been torn down.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceUnavailable` if the bits directory is missing.
    pub fn ensure_available(&self) -> Result<()> {
        if self.bits_dir().is_dir() {
            Ok(())
        } else {
            Err(ArtifactError::WorkspaceUnavailable {
                path: self.root.clone(),
            }
            .into())
        }
    }

    /// Location of the zip resolved from a source URL.
    ///
    /// The URL path is kept below the host directory with its extension
    /// replaced by `.zip`; a final component named `zip` or `tar` becomes
    /// `archive.zip`.
    #[must_use]
    pub fn artifact_path(&self, url: &Url) -> PathBuf {
        let mut path = self.bits_dir().join(url.host_str().unwrap_or("local"));

        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| is_safe_segment(seg)).collect())
            .unwrap_or_default();
        let last = segments.pop().unwrap_or("archive");

        for segment in segments {
            path.push(segment);
        }

        let stem = Path::new(last)
            .file_stem()
            .map_or_else(|| last.to_string(), |s| s.to_string_lossy().into_owned());
        let stem = match stem.as_str() {
            "zip" | "tar" | "" => String::from("archive"),
            _ => stem,
        };
        path.push(format!("{stem}.zip"));
        path
    }

    /// Location of the private key file for a git host.
    #[must_use]
    pub fn key_path(&self, host: &str) -> PathBuf {
        self.bits_dir()
            .join(format!("{}_key.pem", host.replace(['.', ':'], "_")))
    }

    /// Writes private key material for a git host with mode `0644`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn write_key(&self, host: &str, material: &str) -> Result<PathBuf> {
        self.ensure_available()?;
        let path = self.key_path(host);
        fs::write(&path, material).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(path)
    }

    /// Removes the bits directory and everything in it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    pub fn teardown(&self) -> Result<()> {
        let bits = self.bits_dir();
        if bits.exists() {
            std::fs::remove_dir_all(&bits)?;
        }
        debug!("Tore down artifact workspace at {}", self.root.display());
        Ok(())
    }
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty() && matches!(Path::new(segment).components().next(), Some(Component::Normal(_)))
}

/// Parses a source URL, accepting scp-like git addresses
/// (`git@host:owner/repo.git`).
///
/// # Errors
///
/// Returns `InvalidSource` if the address cannot be parsed.
pub fn parse_source_url(raw: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(raw) {
        return Ok(url);
    }

    if let Some((authority, path)) = raw.split_once(':') {
        if !authority.contains('/') && !path.starts_with("//") {
            let candidate = format!("ssh://{authority}/{}", path.trim_start_matches('/'));
            if let Ok(url) = Url::parse(&candidate) {
                return Ok(url);
            }
        }
    }

    Err(ArtifactError::InvalidSource {
        message: format!("cannot parse source address {raw}"),
    }
    .into())
}
