//! Async key-value seam.
//!
//! All persistent state goes through one injected [`KvStore`] with two
//! namespaces: [`Domain::Durable`] survives restarts, [`Domain::Ephemeral`]
//! only lives as long as the current session. Values are opaque bytes; the
//! JSON helpers below are what the components actually use.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{LockboxError, Result};

/// Storage keys owned by this crate.
pub mod keys {
    pub const CREDENTIAL: &str = "credential";
    pub const INTEGRITY_PRIMARY: &str = "integrity-primary";
    pub const INTEGRITY_BACKUP: &str = "integrity-backup";
    pub const SECURITY_CHECKSUM: &str = "security-checksum";
    pub const RATE_LIMIT_PRIMARY: &str = "rate-limit-primary";
    pub const RATE_LIMIT_BACKUP: &str = "rate-limit-backup";
    pub const ENCRYPTION_ENABLED: &str = "encryption-enabled";
    pub const FOLDERS: &str = "folders";
    pub const SESSION_AUTHENTICATED: &str = "session-authenticated";
    pub const SESSION_CHALLENGE: &str = "session-challenge";
    pub const DEVICE_ID: &str = "device-id";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Durable,
    Ephemeral,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// `Ok(None)` when the key is absent.
    async fn get(&self, domain: Domain, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, domain: Domain, key: &str, value: Vec<u8>) -> Result<()>;

    /// Deleting an absent key is not an error.
    async fn delete(&self, domain: Domain, key: &str) -> Result<()>;
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    domain: Domain,
    key: &str,
) -> Result<Option<T>> {
    match store.get(domain, key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Like [`get_json`], but a value that no longer parses is reported as absent.
/// Used for redundantly stored records where one damaged copy is expected
/// and handled by the caller.
pub async fn get_json_lenient<T: DeserializeOwned>(
    store: &dyn KvStore,
    domain: Domain,
    key: &str,
) -> Result<Option<T>> {
    match store.get(domain, key).await? {
        Some(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "stored record is unreadable, treating as missing");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    domain: Domain,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(domain, key, bytes).await
}

// ── In-memory store ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(Domain, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every ephemeral entry, as happens when a session ends.
    pub fn end_session(&self) {
        self.entries
            .lock()
            .retain(|(domain, _), _| *domain == Domain::Durable);
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, domain: Domain, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(&(domain, key.to_string())).cloned())
    }

    async fn set(&self, domain: Domain, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().insert((domain, key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, domain: Domain, key: &str) -> Result<()> {
        self.entries.lock().remove(&(domain, key.to_string()));
        Ok(())
    }
}

// ── File-backed store ───────────────────────────────────────────────────────

/// One JSON file per persisted domain, values base64 encoded. Writes go to a
/// synced staging file that is renamed into place, then the directory is
/// synced, so a reader never observes a half-written file. Directories the
/// store creates are owner-only, as are the files it writes.
pub struct FileStore {
    durable: FileDomain,
    ephemeral: FileDomain,
}

struct FileDomain {
    path: Option<PathBuf>,
    // tokio mutex: held across the file write so persists are serialized
    map: tokio::sync::Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// `ephemeral` = `None` keeps the ephemeral domain in memory only.
    pub async fn open(durable: impl AsRef<Path>, ephemeral: Option<PathBuf>) -> Result<Self> {
        let durable = durable.as_ref().to_path_buf();
        Ok(Self {
            durable: FileDomain::load(Some(durable)).await?,
            ephemeral: FileDomain::load(ephemeral).await?,
        })
    }

    fn domain(&self, domain: Domain) -> &FileDomain {
        match domain {
            Domain::Durable => &self.durable,
            Domain::Ephemeral => &self.ephemeral,
        }
    }
}

impl FileDomain {
    async fn load(path: Option<PathBuf>) -> Result<Self> {
        let map = match &path {
            Some(p) if tokio::fs::try_exists(p).await? => {
                let bytes = tokio::fs::read(p).await?;
                serde_json::from_slice(&bytes).map_err(|e| {
                    LockboxError::StorageUnavailable(format!("parse {}: {e}", p.display()))
                })?
            }
            _ => BTreeMap::new(),
        };
        Ok(Self {
            path,
            map: tokio::sync::Mutex::new(map),
        })
    }

    async fn persist(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !tokio::fs::try_exists(&dir).await? {
            tokio::fs::create_dir_all(&dir).await?;
            restrict_dir_permissions(&dir).await;
        }

        let staging = dir.join(format!(".{}.staging", Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(map)?;
        if let Err(e) = write_synced(&staging, &json).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&staging, path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        fsync_dir(&dir).await?;
        debug!(path = %path.display(), entries = map.len(), "store persisted");
        Ok(())
    }
}

/// Owner-only file, flushed to disk before returning.
async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

async fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    tokio::fs::File::open(path).await?.sync_all().await?;
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

async fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        if let Err(e) = tokio::fs::set_permissions(path, perms).await {
            warn!(path = %path.display(), error = %e, "cannot restrict directory permissions");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, domain: Domain, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.domain(domain).map.lock().await;
        match map.get(key) {
            Some(encoded) => Ok(Some(general_purpose::STANDARD.decode(encoded)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, domain: Domain, key: &str, value: Vec<u8>) -> Result<()> {
        let file = self.domain(domain);
        let mut map = file.map.lock().await;
        let previous = map.insert(key.to_string(), general_purpose::STANDARD.encode(value));
        if let Err(e) = file.persist(&map).await {
            // keep memory consistent with what is on disk
            match previous {
                Some(old) => map.insert(key.to_string(), old),
                None => map.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, domain: Domain, key: &str) -> Result<()> {
        let file = self.domain(domain);
        let mut map = file.map.lock().await;
        if let Some(old) = map.remove(key) {
            if let Err(e) = file.persist(&map).await {
                map.insert(key.to_string(), old);
                return Err(e);
            }
        }
        Ok(())
    }
}
