use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Tunable security policy. Every field falls back to its default when absent
/// from the config file so older files keep loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardConfig {
    /// PBKDF2-HMAC-SHA256 rounds for the credential hash.
    pub pbkdf2_iterations: u32,
    /// PBKDF2-HMAC-SHA256 rounds for the per-blob content key.
    pub content_kdf_iterations: u32,
    pub min_password_len: usize,
    pub max_failed_attempts: u32,
    pub lockout_secs: i64,
    /// Idle time after which the failure counter starts over.
    pub idle_reset_secs: i64,
    pub attempt_history_len: usize,
    pub session_ttl_secs: i64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: 100_000,
            content_kdf_iterations: 100_000,
            min_password_len: 8,
            max_failed_attempts: 5,
            lockout_secs: 15 * 60,
            idle_reset_secs: 30 * 60,
            attempt_history_len: 10,
            session_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl GuardConfig {
    /// Same policy with cheap key derivation, for test builds.
    pub fn for_tests() -> Self {
        Self {
            pbkdf2_iterations: 1_000,
            content_kdf_iterations: 1_000,
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
