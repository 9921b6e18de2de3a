//! Local file-based state storage backend.
//!
//! The state lives in `.cfdeploy/state.json` next to the deployment
//! document, guarded by `.cfdeploy/state.lock`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{DeployerError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_id};
use super::migrate::decode_state;
use super::store::StateStore;
use super::types::DeploymentState;

/// Default state directory name.
pub const STATE_DIR: &str = ".cfdeploy";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    /// Directory holding the state and lock files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

fn storage(message: String) -> DeployerError {
    StateError::storage(message).into()
}

impl LocalStateStore {
    /// Creates a store in `.cfdeploy` under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| DeployerError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store in `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            state_path: base_dir.join(STATE_FILE),
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
        }
    }

    /// Creates a store for an explicit state file; the lock sits beside it.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        Self {
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
            state_path,
        }
    }

    /// Path to the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Reads the raw state file, if present.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the file exists but cannot be read.
    pub async fn read_raw(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.state_path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage(format!("Failed to read state file: {e}"))),
        }
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| storage(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a temporary file and a rename.
    async fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.ensure_dir().await?;
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| storage(format!("Failed to create {}: {e}", temp_path.display())))?;
        file.write_all(content)
            .await
            .map_err(|e| storage(format!("Failed to write {}: {e}", temp_path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| storage(format!("Failed to sync {}: {e}", temp_path.display())))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| storage(format!("Failed to rename {}: {e}", temp_path.display())))
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to read lock file: {e}"),
                }
                .into());
            }
        };

        let lock: LockInfo = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse lock file: {e}"),
        })?;
        Ok(Some(lock))
    }

    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            }
            .into()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<DeploymentState>> {
        let Some(content) = self.read_raw().await? else {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        };

        debug!("Loading state from: {}", self.state_path.display());
        decode_state(&content).map(Some)
    }

    async fn save(&self, state: &DeploymentState) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        self.write_atomic(&self.state_path, &content).await?;
        debug!("State saved to: {}", self.state_path.display());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.state_path).await {
            Ok(()) => info!("Deleted state file: {}", self.state_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(storage(format!("Failed to delete state file: {e}"))),
        }
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.state_path).await.unwrap_or(false))
    }

    async fn acquire_lock(&self, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            warn!("Taking over expired lock of {}", existing.holder);
        }

        let lock = LockInfo::new(&holder_id(), operation);
        let content = serde_json::to_vec_pretty(&lock)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.write_atomic(&self.lock_path, &content).await?;

        debug!(
            "Acquired state lock {} (expires in {LOCK_EXPIRY_SECS}s)",
            lock.lock_id
        );
        Ok(lock)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_lock_file().await?;
                debug!("Released state lock {lock_id}");
            }
            Some(existing) => warn!(
                "Not releasing lock {lock_id}: the state is now locked by {}",
                existing.holder
            ),
            None => {}
        }
        Ok(())
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let existing = self.read_lock_file().await?;
        self.delete_lock_file().await?;
        if let Some(lock) = &existing {
            info!("Removed state lock held by {}", lock.holder);
        }
        Ok(existing)
    }

    fn location(&self) -> String {
        self.state_path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut state = DeploymentState::new();
        state.spec_hash = String::from("abc");
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.spec_hash, "abc");
        assert!(store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_load_migrates_legacy_file() {
        let (store, temp) = create_test_store();
        std::fs::create_dir_all(temp.path().join(STATE_DIR)).expect("mkdir");
        std::fs::write(
            store.state_path(),
            r#"{"version": "1", "app": {"id": "app-1", "name": "web", "space": "s", "path": "./build"}}"#,
        )
        .expect("write legacy state");

        let loaded = store.load().await.expect("load").expect("state");
        assert_eq!(loaded.app.expect("app").guid, "app-1");
    }

    #[tokio::test]
    async fn test_corrupted_file_is_reported() {
        let (store, temp) = create_test_store();
        std::fs::create_dir_all(temp.path().join(STATE_DIR)).expect("mkdir");
        std::fs::write(store.state_path(), "{not json").expect("write");

        let err = store.load().await.expect_err("corrupted state");
        assert!(err.to_string().contains("corrupted"));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("apply")
            .await
            .expect("Failed to acquire lock");
        assert_eq!(
            store.lock_info().await.expect("lock info").map(|l| l.lock_id),
            Some(lock.lock_id.clone())
        );

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");
        assert!(store.lock_info().await.expect("lock info").is_none());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _first = store
            .acquire_lock("apply")
            .await
            .expect("Failed to acquire first lock");

        let err = store.acquire_lock("destroy").await.expect_err("state is locked");
        assert!(matches!(
            err,
            DeployerError::State(StateError::LockedByOther { .. })
        ));
    }

    #[tokio::test]
    async fn test_force_unlock_removes_foreign_lock() {
        let (store, _temp) = create_test_store();
        store.acquire_lock("apply").await.expect("lock");

        let removed = store.force_unlock().await.expect("unlock");
        assert_eq!(removed.map(|l| l.operation), Some(String::from("apply")));
        store.acquire_lock("apply").await.expect("lock after unlock");
    }

    #[test]
    fn test_state_path_constructor_places_lock_beside_state() {
        let store = LocalStateStore::with_state_path("/tmp/deploy/custom.json");
        assert_eq!(store.location(), "/tmp/deploy/custom.json");
        assert_eq!(store.lock_path, PathBuf::from("/tmp/deploy/state.lock"));
    }
}
