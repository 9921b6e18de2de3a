//! Release asset URL translation.

use crate::config::ReleaseSource;

/// Asset name selecting the source zip archive of a release.
pub const ZIPBALL: &str = "zipball";

/// Asset name selecting the source tarball of a release.
pub const TARBALL: &str = "tarball";

/// Base URL for release downloads.
const GITHUB_URL: &str = "https://github.com";

/// Base URL of the releases API.
const GITHUB_API_URL: &str = "https://api.github.com";

/// What a release URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// Source archive as zip, rooted in a single top-level directory.
    Zipball,
    /// Source archive as tar.gz, rooted in a single top-level directory.
    Tarball,
    /// A named release asset, used as-is.
    File,
}

/// A release asset resolved to a download URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
    /// Download URL.
    pub url: String,
    /// Kind of payload.
    pub kind: AssetKind,
}

/// Translates a release source into its download URL.
#[must_use]
pub fn release_asset(release: &ReleaseSource) -> ReleaseAsset {
    let owner = &release.owner;
    let repo = &release.repo;
    let kind = match release.filename.as_str() {
        ZIPBALL => AssetKind::Zipball,
        TARBALL => AssetKind::Tarball,
        _ => AssetKind::File,
    };

    let version = release.version.as_deref().filter(|v| !v.is_empty() && *v != "latest");
    let url = match (version, kind) {
        (Some(v), AssetKind::Zipball) => format!("{GITHUB_URL}/{owner}/{repo}/archive/{v}.zip"),
        (Some(v), AssetKind::Tarball) => format!("{GITHUB_URL}/{owner}/{repo}/archive/{v}.tar.gz"),
        (Some(v), AssetKind::File) => format!(
            "{GITHUB_URL}/{owner}/{repo}/releases/download/{v}/{}",
            release.filename
        ),
        (None, AssetKind::Zipball) => format!("{GITHUB_API_URL}/repos/{owner}/{repo}/zipball"),
        (None, AssetKind::Tarball) => format!("{GITHUB_API_URL}/repos/{owner}/{repo}/tarball"),
        (None, AssetKind::File) => format!(
            "{GITHUB_URL}/{owner}/{repo}/releases/latest/download/{}",
            release.filename
        ),
    };

    ReleaseAsset { url, kind }
}
