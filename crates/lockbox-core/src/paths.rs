use directories::ProjectDirs;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{LockboxError, Result};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "lockbox";

pub const STORE_FILE: &str = "store.json";
pub const DEVICE_FILE: &str = "device.json";
pub const CONFIG_FILE: &str = "lockbox.json";
/// Overrides the device identifier file location.
pub const DEVICE_FILE_ENV: &str = "LOCKBOX_DEVICE_FILE";

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or_else(|| {
        LockboxError::StorageUnavailable("cannot determine data directory".into())
    })
}

pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Every file one vault uses, derived from its data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPaths {
    pub data_dir: PathBuf,
    /// Durable key-value file backing the main store.
    pub store: PathBuf,
    /// Device identifier. Kept apart from the store so wiping the store keeps it.
    pub device: PathBuf,
    pub config: PathBuf,
    /// Ephemeral domain of this vault.
    pub session: PathBuf,
}

impl VaultPaths {
    pub fn default_location() -> Result<Self> {
        Ok(Self::in_dir(data_dir()?))
    }

    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let device = match std::env::var_os(DEVICE_FILE_ENV) {
            Some(path) => PathBuf::from(path),
            None => data_dir.join(DEVICE_FILE),
        };
        let session_dir = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
            .and_then(|dirs| dirs.runtime_dir().map(Path::to_path_buf));
        Self {
            store: data_dir.join(STORE_FILE),
            config: data_dir.join(CONFIG_FILE),
            session: session_path(&data_dir, session_dir.as_deref()),
            device,
            data_dir,
        }
    }
}

/// Session file for the vault in `data_dir`. Lives in the per-user runtime
/// directory when there is one (cleared at logout), else in the owner-only
/// data directory. The name is keyed on the data directory so vaults never
/// share a session.
pub fn session_path(data_dir: &Path, runtime_dir: Option<&Path>) -> PathBuf {
    let resolved = std::fs::canonicalize(data_dir).unwrap_or_else(|_| data_dir.to_path_buf());
    let digest = Sha256::digest(resolved.to_string_lossy().as_bytes());
    let name = format!("session-{}.json", &hex::encode(digest)[..16]);
    runtime_dir.unwrap_or(data_dir).join(name)
}
