//! Advisory lock guarding the state file.
//!
//! A lock records who holds it and for which operation, and expires so that
//! a crashed run never blocks the state forever.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lock lifetime in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 3600;

/// Information about a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Holder identifier (`host-pid-nonce`).
    pub holder: String,
    /// Operation the holder runs.
    #[serde(default)]
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a lock held by `holder` for `operation`.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Returns true once the lock may be taken over.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Seconds left before expiry.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Identifier of the current process: hostname, pid and a random nonce.
#[must_use]
pub fn holder_id() -> String {
    let host = hostname::get().map_or_else(
        |_| String::from("unknown"),
        |h| h.to_string_lossy().into_owned(),
    );
    let nonce = Uuid::new_v4().simple().to_string();

    format!("{host}-{}-{}", std::process::id(), &nonce[..8])
}
