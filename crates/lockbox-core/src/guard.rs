//! Facade wiring the components into the boot and login flows.
//!
//! Login order: rate limiter status, credential load, integrity, password
//! compare, then session issuance. Password changes derive everything first
//! and commit in a fixed order: session cleared, credential, integrity
//! primary, integrity backup, folder content, checksum.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditReport, SecurityAuditor, SecuritySnapshot};
use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::credential::{CredentialManager, CredentialRecord};
use crate::crypto::CryptoProvider;
use crate::device::load_or_create_device_id;
use crate::error::{LockboxError, Result};
use crate::folders::FolderStore;
use crate::integrity::{IntegrityCopy, IntegrityVerifier};
use crate::rate_limit::{FailureOutcome, LockStatus, RateLimiter};
use crate::session::SessionManager;
use crate::store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReport {
    pub audit: AuditReport,
    pub protected: bool,
    /// A remembered session was still valid; no password prompt needed.
    pub session_restored: bool,
}

#[derive(Clone)]
pub struct Guard {
    credentials: CredentialManager,
    integrity: IntegrityVerifier,
    auditor: SecurityAuditor,
    sessions: SessionManager,
    limiter: RateLimiter,
    folders: FolderStore,
    device_id: String,
}

impl Guard {
    /// `device_store` only holds the device identifier and must outlive
    /// wipes of `store`.
    pub async fn open(
        store: Arc<dyn KvStore>,
        device_store: &dyn KvStore,
        crypto: Arc<dyn CryptoProvider>,
        clock: Arc<dyn Clock>,
        config: &GuardConfig,
    ) -> Result<Self> {
        let device_id = load_or_create_device_id(device_store).await?;
        Ok(Self {
            credentials: CredentialManager::new(store.clone(), crypto.clone(), config),
            integrity: IntegrityVerifier::new(
                store.clone(),
                crypto.clone(),
                clock.clone(),
                device_id.clone(),
            ),
            auditor: SecurityAuditor::new(
                store.clone(),
                crypto.clone(),
                clock.clone(),
                device_id.clone(),
            ),
            sessions: SessionManager::new(store.clone(), crypto.clone(), clock.clone(), config),
            limiter: RateLimiter::new(store.clone(), clock, config),
            folders: FolderStore::new(store, crypto, config),
            device_id,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub fn integrity(&self) -> &IntegrityVerifier {
        &self.integrity
    }

    pub fn auditor(&self) -> &SecurityAuditor {
        &self.auditor
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn folders(&self) -> &FolderStore {
        &self.folders
    }

    /// Audit first, then try to restore a remembered session.
    pub async fn boot(&self) -> Result<BootReport> {
        let audit = self.auditor.boot_check(&self.snapshot().await?).await?;
        let protected = self.is_protected().await?;
        let session_restored = protected && self.restore_session().await?;
        info!(
            boot_count = audit.boot_count,
            protected, session_restored, "boot complete"
        );
        Ok(BootReport {
            audit,
            protected,
            session_restored,
        })
    }

    /// A damaged credential still counts: protection is never dropped because
    /// the record stopped parsing.
    pub async fn is_protected(&self) -> Result<bool> {
        self.credentials.exists().await
    }

    /// Enable protection. Replacing an existing password goes through
    /// [`Guard::change_password`].
    pub async fn set_password(&self, password: &str) -> Result<()> {
        if self.is_protected().await? {
            return Err(LockboxError::AlreadyProtected);
        }
        let record = self.credentials.derive_record(password)?;
        self.commit_credential(&record).await?;
        self.refresh_audit().await?;
        info!("password protection enabled");
        Ok(())
    }

    /// Rate-limited, integrity-checked password check.
    pub async fn verify_password(&self, password: &str) -> Result<()> {
        self.authenticate(password).await.map(|_| ())
    }

    pub async fn login(&self, password: &str, remember: bool) -> Result<()> {
        let record = self.authenticate(password).await?;
        self.sessions.mark_authenticated().await?;
        if remember {
            self.sessions.create_challenge(&record).await?;
        } else {
            self.sessions.clear_challenge().await?;
        }
        info!(remember, "login succeeded");
        Ok(())
    }

    /// `true` when the current session may skip the password prompt.
    pub async fn restore_session(&self) -> Result<bool> {
        let record = match self.credentials.load().await {
            Ok(Some(record)) => record,
            Ok(None) | Err(LockboxError::IntegrityFailure) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.sessions
            .verify_authentication_state(&record, &self.integrity)
            .await
    }

    pub async fn logout(&self) -> Result<()> {
        self.sessions.clear().await?;
        info!("logged out");
        Ok(())
    }

    pub async fn change_password(&self, current: &str, new: &str) -> Result<()> {
        self.credentials.check_strength(new)?;
        let old = self.authenticate(current).await?;
        let record = self.credentials.derive_record(new)?;
        let rekeyed = self.folders.rekey(&old, &record).await?;

        self.sessions.clear().await?;
        self.commit_credential(&record).await?;
        if let Some(blob) = rekeyed {
            self.folders.write_blob(&blob).await?;
        }
        self.refresh_audit().await?;
        info!("password changed, sessions invalidated");
        Ok(())
    }

    /// Disable protection entirely. Encrypted content is decrypted first; if
    /// that fails nothing is removed.
    pub async fn remove_password(&self, current: &str) -> Result<()> {
        self.authenticate(current).await?;
        self.folders.migrate_to_plain().await?;

        self.credentials.remove().await?;
        self.integrity.clear().await?;
        self.limiter.reset().await?;
        self.sessions.clear().await?;
        self.refresh_audit().await?;
        warn!("password protection removed");
        Ok(())
    }

    pub async fn load_folders(&self) -> Result<Vec<Value>> {
        self.folders.load().await
    }

    pub async fn save_folders(&self, folders: &[Value]) -> Result<()> {
        self.folders.save(folders).await
    }

    pub async fn set_encryption_enabled(&self, enabled: bool) -> Result<()> {
        self.folders.set_encryption_enabled(enabled).await
    }

    /// Current stored security state, as the auditor sees it.
    pub async fn snapshot(&self) -> Result<SecuritySnapshot> {
        let integrity = match self.integrity.load(IntegrityCopy::Primary).await? {
            Some(record) => Some(record),
            None => self.integrity.load(IntegrityCopy::Backup).await?,
        };
        Ok(SecuritySnapshot {
            credential: self.credentials.load_lenient().await?,
            integrity,
            rate_limit: self.limiter.load().await?,
        })
    }

    async fn authenticate(&self, password: &str) -> Result<CredentialRecord> {
        if let LockStatus::Locked { wait_secs } = self.limiter.status().await? {
            return Err(LockboxError::RateLimited { wait_secs });
        }
        let record = self
            .credentials
            .load()
            .await?
            .ok_or(LockboxError::NoCredential)?;
        if !self.integrity.verify_integrity(&record).await? {
            return Err(LockboxError::IntegrityFailure);
        }

        if self.credentials.verify_password(password, &record)? {
            if self.limiter.load().await?.is_some() {
                self.limiter.reset().await?;
                self.refresh_audit().await?;
            }
            return Ok(record);
        }

        let outcome = self.limiter.record_failure().await?;
        self.refresh_audit().await?;
        match outcome {
            FailureOutcome::Counted { remaining, .. } => Err(LockboxError::AuthFailure {
                remaining_attempts: remaining,
            }),
            FailureOutcome::Locked { .. } => Err(LockboxError::AuthFailure {
                remaining_attempts: 0,
            }),
        }
    }

    async fn commit_credential(&self, record: &CredentialRecord) -> Result<()> {
        self.credentials.persist(record).await?;
        self.integrity.store_integrity(record).await
    }

    async fn refresh_audit(&self) -> Result<()> {
        self.auditor.refresh(&self.snapshot().await?).await
    }
}
