//! Shallow git checkouts packaged as zip archives.

use git2::build::CheckoutBuilder;
use git2::{Cred, CredentialType, FetchOptions, ObjectType, RemoteCallbacks, Repository};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::GitSource;
use crate::error::{ArtifactError, Result};

use super::archive::{staging_path, zip_directory};

/// Branch checked out when neither tag nor branch is given.
pub const DEFAULT_BRANCH: &str = "master";

/// The reference a git source resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitRef {
    /// A tag.
    Tag(String),
    /// A branch.
    Branch(String),
}

impl GitRef {
    /// Picks the reference of a source; a tag wins over a branch.
    #[must_use]
    pub fn of(source: &GitSource) -> Self {
        match (&source.tag, &source.branch) {
            (Some(tag), _) if !tag.is_empty() => Self::Tag(tag.clone()),
            (_, Some(branch)) if !branch.is_empty() => Self::Branch(branch.clone()),
            _ => Self::Branch(DEFAULT_BRANCH.to_string()),
        }
    }

    /// Refspec fetching the reference into its local name.
    #[must_use]
    pub fn refspec(&self) -> String {
        format!("+{}:{}", self.remote_name(), self.local_name())
    }

    fn remote_name(&self) -> String {
        match self {
            Self::Tag(tag) => format!("refs/tags/{tag}"),
            Self::Branch(branch) => format!("refs/heads/{branch}"),
        }
    }

    fn local_name(&self) -> String {
        match self {
            Self::Tag(tag) => format!("refs/tags/{tag}"),
            Self::Branch(branch) => format!("refs/remotes/origin/{branch}"),
        }
    }
}

/// Checks out `source` with depth 1 and zips the working tree into `dest`.
///
/// `key_file` is the private key written to the workspace for this host,
/// if the source carries one. The intermediate checkout is removed once the
/// archive is written.
///
/// # Errors
///
/// Returns `GitFailed` for any fetch or checkout failure, or an archive
/// error if the tree cannot be zipped.
pub fn checkout_to_zip(source: &GitSource, key_file: Option<&Path>, dest: &Path) -> Result<()> {
    let checkout_dir = staging_path(dest, ".checkout");
    if checkout_dir.exists() {
        std::fs::remove_dir_all(&checkout_dir)?;
    }
    std::fs::create_dir_all(&checkout_dir)?;

    let result = fetch_and_checkout(source, key_file, &checkout_dir)
        .and_then(|()| zip_directory(&checkout_dir, dest));

    if let Err(e) = std::fs::remove_dir_all(&checkout_dir) {
        debug!("Could not remove checkout {}: {e}", checkout_dir.display());
    }
    result
}

fn fetch_and_checkout(source: &GitSource, key_file: Option<&Path>, dir: &Path) -> Result<()> {
    let git_ref = GitRef::of(source);
    info!("Fetching {} at {:?}", source.url, git_ref);

    let git_err = |e: git2::Error| ArtifactError::git(&source.url, e.message());

    let repo = Repository::init(dir).map_err(git_err)?;
    let mut remote = repo.remote_anonymous(&source.url).map_err(git_err)?;

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(credentials(source, key_file.map(Path::to_path_buf)));
    // the local transport rejects shallow fetches
    if !source.url.starts_with("file://") {
        fetch_options.depth(1);
    }

    remote
        .fetch(&[git_ref.refspec().as_str()], Some(&mut fetch_options), None)
        .map_err(git_err)?;

    let reference = repo.find_reference(&git_ref.local_name()).map_err(git_err)?;
    let target = reference.peel(ObjectType::Commit).map_err(git_err)?;

    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.checkout_tree(&target, Some(&mut checkout))
        .map_err(git_err)?;
    repo.set_head_detached(target.id()).map_err(git_err)?;

    debug!("Checked out {} at {}", source.url, target.id());
    Ok(())
}

fn credentials(source: &GitSource, key_file: Option<PathBuf>) -> RemoteCallbacks<'static> {
    let user = source.user.clone();
    let password = source.password.clone();

    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, allowed| {
        if let Some(key) = &key_file {
            if allowed.contains(CredentialType::SSH_KEY) {
                let username = user.as_deref().or(username_from_url).unwrap_or("git");
                return Cred::ssh_key(username, None, key, None);
            }
        }
        if let (Some(user), Some(password)) = (&user, &password) {
            if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                return Cred::userpass_plaintext(user, password);
            }
        }
        Cred::default()
    });
    callbacks
}
