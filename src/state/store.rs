//! State store trait definition.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::DeploymentState;
use crate::error::Result;

/// Persistent storage of the recorded deployment state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the recorded state, upgrading legacy records in memory.
    ///
    /// Returns `None` if nothing was recorded yet.
    async fn load(&self) -> Result<Option<DeploymentState>>;

    /// Saves the state atomically.
    async fn save(&self, state: &DeploymentState) -> Result<()>;

    /// Deletes the recorded state.
    async fn delete(&self) -> Result<()>;

    /// Returns true if a state was recorded.
    async fn exists(&self) -> Result<bool>;

    /// Takes the lock for `operation`.
    ///
    /// Fails with `LockedByOther` while another holder's lock is live.
    async fn acquire_lock(&self, operation: &str) -> Result<LockInfo>;

    /// Releases a lock previously returned by `acquire_lock`.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Returns the current lock, expired or not.
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Removes the lock regardless of its holder.
    async fn force_unlock(&self) -> Result<Option<LockInfo>>;

    /// Human-readable location of the state.
    fn location(&self) -> String;
}
