//! Artifact pipeline.
//!
//! Turns an application source (local path, URL, git repository, release
//! asset or docker image) into a zip in the workspace plus its content hash:
//! - `workspace`: the on-disk workspace and its path layout
//! - `archive`: zip, re-root and tarball conversion helpers
//! - `git`: shallow checkouts
//! - `release`: release asset URL translation
//! - `resolver`: the entry point tying them together

mod archive;
mod git;
mod release;
mod resolver;
mod workspace;

pub use archive::{is_zip, rezip_stripped, staging_path, tarball_to_zip, zip_directory};
pub use git::{DEFAULT_BRANCH, GitRef, checkout_to_zip};
pub use release::{AssetKind, ReleaseAsset, TARBALL, ZIPBALL, release_asset};
pub use resolver::{ArtifactResolver, ResolvedArtifact};
pub use workspace::{Workspace, parse_source_url};
