use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, info};
use zeroize::Zeroizing;

use crate::config::GuardConfig;
use crate::crypto::{CryptoProvider, HashAlg};
use crate::error::{LockboxError, Result};
use crate::store::{get_json, get_json_lenient, keys, put_json, Domain, KvStore};

pub const SALT_LEN: usize = 16;
pub const HASH_BITS: usize = 256;

/// Password verifier. `hash` is hex PBKDF2-HMAC-SHA256 (256 bits) of the
/// password under `salt`; both are lowercase hex.
///
/// Field order is part of the canonical serialization the integrity
/// fingerprints are computed over.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub hash: String,
    pub salt: String,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("hash", &"<redacted>")
            .field("salt", &"<redacted>")
            .finish()
    }
}

impl CredentialRecord {
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Clone)]
pub struct CredentialManager {
    store: Arc<dyn KvStore>,
    crypto: Arc<dyn CryptoProvider>,
    iterations: u32,
    min_len: usize,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        crypto: Arc<dyn CryptoProvider>,
        config: &GuardConfig,
    ) -> Self {
        Self {
            store,
            crypto,
            iterations: config.pbkdf2_iterations,
            min_len: config.min_password_len,
        }
    }

    /// Stored record. An unparseable record is an [`LockboxError::IntegrityFailure`].
    pub async fn load(&self) -> Result<Option<CredentialRecord>> {
        load_record(self.store.as_ref()).await
    }

    /// Stored record, with an unparseable one reported as absent. For audit
    /// snapshots only: never base an access decision on it.
    pub async fn load_lenient(&self) -> Result<Option<CredentialRecord>> {
        get_json_lenient(self.store.as_ref(), Domain::Durable, keys::CREDENTIAL).await
    }

    /// Whether anything is stored under the credential key, readable or not.
    pub async fn exists(&self) -> Result<bool> {
        Ok(self
            .store
            .get(Domain::Durable, keys::CREDENTIAL)
            .await?
            .is_some())
    }

    pub fn check_strength(&self, password: &str) -> Result<()> {
        if password.is_empty() || password.chars().count() < self.min_len {
            return Err(LockboxError::WeakPassword {
                min_len: self.min_len,
            });
        }
        Ok(())
    }

    /// Build a fresh record for `password` without persisting it.
    pub fn derive_record(&self, password: &str) -> Result<CredentialRecord> {
        self.check_strength(password)?;
        let salt = self.crypto.random_bytes(SALT_LEN);
        let hash = self.hash_with_salt(password, &salt)?;
        Ok(CredentialRecord {
            hash: hex::encode(hash.as_slice()),
            salt: hex::encode(salt),
        })
    }

    /// Replace the stored record wholesale. The store writes the whole value
    /// in one call, so readers see either the old or the new record.
    pub async fn persist(&self, record: &CredentialRecord) -> Result<()> {
        put_json(self.store.as_ref(), Domain::Durable, keys::CREDENTIAL, record).await
    }

    /// Derive and store a new record. Callers are responsible for refreshing
    /// integrity data before the record is used for session issuance.
    pub async fn set_password(&self, password: &str) -> Result<CredentialRecord> {
        let record = self.derive_record(password)?;
        self.persist(&record).await?;
        info!("credential record written");
        Ok(record)
    }

    /// Recompute the hash under `record.salt` and compare in constant time.
    pub fn verify_password(&self, password: &str, record: &CredentialRecord) -> Result<bool> {
        let (Ok(salt), Ok(stored)) = (hex::decode(&record.salt), hex::decode(&record.hash)) else {
            return Ok(false);
        };
        let computed = self.hash_with_salt(password, &salt)?;
        Ok(bool::from(computed.as_slice().ct_eq(stored.as_slice())))
    }

    pub async fn remove(&self) -> Result<()> {
        self.store.delete(Domain::Durable, keys::CREDENTIAL).await
    }

    fn hash_with_salt(&self, password: &str, salt: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let out = self.crypto.pbkdf2(
            password.as_bytes(),
            salt,
            self.iterations,
            HashAlg::Sha256,
            HASH_BITS,
        )?;
        Ok(Zeroizing::new(out))
    }
}

/// Read the stored credential record, if any. A record that no longer parses
/// cannot be vouched for and is reported as an integrity failure.
pub async fn load_record(store: &dyn KvStore) -> Result<Option<CredentialRecord>> {
    match get_json(store, Domain::Durable, keys::CREDENTIAL).await {
        Err(LockboxError::Serialization(e)) => {
            error!(error = %e, "security alert: stored credential record is unreadable");
            Err(LockboxError::IntegrityFailure)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoProvider;
    use crate::store::MemoryStore;

    fn manager() -> CredentialManager {
        CredentialManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RustCryptoProvider),
            &GuardConfig::for_tests(),
        )
    }

    #[tokio::test]
    async fn set_then_verify() {
        let creds = manager();
        let record = creds.set_password("correcthorse1").await.unwrap();
        assert_eq!(record.hash.len(), 64);
        assert_eq!(record.salt.len(), 32);
        assert!(creds.verify_password("correcthorse1", &record).unwrap());
        assert!(!creds.verify_password("correcthorse2", &record).unwrap());
        assert_eq!(creds.load().await.unwrap(), Some(record));
    }

    #[test]
    fn weak_passwords_rejected() {
        let creds = manager();
        for pw in ["", "short", "1234567"] {
            assert!(matches!(
                creds.derive_record(pw),
                Err(LockboxError::WeakPassword { min_len: 8 })
            ));
        }
        assert!(creds.derive_record("12345678").is_ok());
    }

    #[test]
    fn same_password_different_salt() {
        let creds = manager();
        let a = creds.derive_record("correcthorse1").unwrap();
        let b = creds.derive_record("correcthorse1").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn debug_output_is_redacted() {
        let record = CredentialRecord {
            hash: "ab".repeat(32),
            salt: "cd".repeat(16),
        };
        let rendered = format!("{record:?}");
        assert!(!rendered.contains("abab"));
        assert!(!rendered.contains("cdcd"));
    }

    #[test]
    fn canonical_form_is_stable() {
        let record = CredentialRecord {
            hash: "h".into(),
            salt: "s".into(),
        };
        assert_eq!(
            record.canonical_bytes().unwrap(),
            br#"{"hash":"h","salt":"s"}"#.to_vec()
        );
    }

    #[test]
    fn malformed_hash_never_verifies() {
        let creds = manager();
        let mut record = creds.derive_record("correcthorse1").unwrap();
        record.hash.push('0');
        assert!(!creds.verify_password("correcthorse1", &record).unwrap());
        record.hash = "zz".repeat(32);
        assert!(!creds.verify_password("correcthorse1", &record).unwrap());
    }

    #[tokio::test]
    async fn unreadable_record_is_integrity_failure() {
        let store = Arc::new(MemoryStore::new());
        let creds = CredentialManager::new(
            store.clone(),
            Arc::new(RustCryptoProvider),
            &GuardConfig::for_tests(),
        );
        store
            .set(Domain::Durable, keys::CREDENTIAL, b"X\"hash\":\"00\"}".to_vec())
            .await
            .unwrap();
        assert!(matches!(creds.load().await, Err(LockboxError::IntegrityFailure)));
        assert!(creds.load_lenient().await.unwrap().is_none());
        assert!(creds.exists().await.unwrap());
    }

    #[tokio::test]
    async fn remove_clears_record() {
        let creds = manager();
        creds.set_password("correcthorse1").await.unwrap();
        creds.remove().await.unwrap();
        assert!(creds.load().await.unwrap().is_none());
    }
}
