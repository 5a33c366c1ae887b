//! Encryption at rest for the protected folder payload.
//!
//! Blob wire format (base64 of):
//!   [ salt (16 bytes) | iv (12 bytes) | AES-256-GCM ciphertext + tag ]
//!
//! The AES key is PBKDF2-HMAC-SHA256(secret, salt) with a fresh salt and iv per
//! call. For stored folders the secret is the content key, which is derived
//! from the credential record through HKDF with its own domain label, so it is
//! never a literal slice of the stored password hash.
//!
//! The folder model itself belongs to the caller; folders are carried as
//! opaque JSON values. Encryption failures never fall back to plaintext.

use base64::{engine::general_purpose, Engine as _};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::config::GuardConfig;
use crate::credential::{load_record, CredentialRecord};
use crate::crypto::{CryptoProvider, HashAlg, AES_KEY_LEN, GCM_IV_LEN};
use crate::error::{LockboxError, Result};
use crate::store::{get_json_lenient, keys, put_json, Domain, KvStore};

pub const BLOB_SALT_LEN: usize = 16;
const GCM_TAG_LEN: usize = 16;
const CONTENT_KEY_INFO: &[u8] = b"lockbox/content-key/v1";

/// What is currently stored under the folders key.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredFolders {
    Empty,
    Plain(Vec<Value>),
    Encrypted(String),
}

#[derive(Clone)]
pub struct FolderStore {
    store: Arc<dyn KvStore>,
    crypto: Arc<dyn CryptoProvider>,
    iterations: u32,
}

impl FolderStore {
    pub fn new(
        store: Arc<dyn KvStore>,
        crypto: Arc<dyn CryptoProvider>,
        config: &GuardConfig,
    ) -> Self {
        Self {
            store,
            crypto,
            iterations: config.content_kdf_iterations,
        }
    }

    // ── Key material ────────────────────────────────────────────────────────

    pub fn derive_content_key(&self, record: &CredentialRecord) -> Result<Zeroizing<Vec<u8>>> {
        let ikm = Zeroizing::new(
            hex::decode(&record.hash)
                .map_err(|_| LockboxError::Crypto("credential hash is not hex".into()))?,
        );
        let salt = hex::decode(&record.salt)
            .map_err(|_| LockboxError::Crypto("credential salt is not hex".into()))?;
        Ok(Zeroizing::new(self.crypto.hkdf(
            &ikm,
            &salt,
            CONTENT_KEY_INFO,
            AES_KEY_LEN,
        )?))
    }

    // ── Blob codec ──────────────────────────────────────────────────────────

    pub fn encrypt_with_secret<T: Serialize + ?Sized>(
        &self,
        value: &T,
        secret: &[u8],
    ) -> Result<String> {
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        let salt = self.crypto.random_bytes(BLOB_SALT_LEN);
        let iv = self.crypto.random_bytes(GCM_IV_LEN);
        let key = self.blob_key(secret, &salt)?;
        let ciphertext = self
            .crypto
            .aes_gcm_encrypt(&key, &iv, &plaintext)
            .map_err(|e| match e {
                LockboxError::EncryptionFailure(_) => e,
                other => LockboxError::EncryptionFailure(other.to_string()),
            })?;

        let mut out = Vec::with_capacity(BLOB_SALT_LEN + GCM_IV_LEN + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(out))
    }

    pub fn decrypt_with_secret<T: DeserializeOwned>(&self, blob: &str, secret: &[u8]) -> Result<T> {
        let raw = general_purpose::STANDARD
            .decode(blob)
            .map_err(|_| LockboxError::DecryptionFailure)?;
        if raw.len() < BLOB_SALT_LEN + GCM_IV_LEN + GCM_TAG_LEN {
            return Err(LockboxError::DecryptionFailure);
        }
        let (salt, rest) = raw.split_at(BLOB_SALT_LEN);
        let (iv, ciphertext) = rest.split_at(GCM_IV_LEN);
        let key = self.blob_key(secret, salt)?;
        let plaintext = Zeroizing::new(self.crypto.aes_gcm_decrypt(&key, iv, ciphertext)?);
        serde_json::from_slice(&plaintext).map_err(|_| LockboxError::DecryptionFailure)
    }

    pub fn encrypt(&self, folders: &[Value], record: &CredentialRecord) -> Result<String> {
        let key = self.derive_content_key(record)?;
        self.encrypt_with_secret(folders, &key)
    }

    pub fn decrypt(&self, blob: &str, record: &CredentialRecord) -> Result<Vec<Value>> {
        let key = self.derive_content_key(record)?;
        self.decrypt_with_secret(blob, &key)
    }

    // ── Stored representation ───────────────────────────────────────────────

    pub async fn is_encryption_enabled(&self) -> Result<bool> {
        let flag: Option<bool> =
            get_json_lenient(self.store.as_ref(), Domain::Durable, keys::ENCRYPTION_ENABLED).await?;
        Ok(flag.unwrap_or(false))
    }

    pub async fn read_stored(&self) -> Result<StoredFolders> {
        let Some(bytes) = self.store.get(Domain::Durable, keys::FOLDERS).await? else {
            return Ok(StoredFolders::Empty);
        };
        match serde_json::from_slice::<Value>(&bytes)? {
            Value::Array(items) => Ok(StoredFolders::Plain(items)),
            Value::String(blob) => Ok(StoredFolders::Encrypted(blob)),
            Value::Null => Ok(StoredFolders::Empty),
            _ => Err(LockboxError::StorageUnavailable(
                "folders value is neither a list nor an encrypted blob".into(),
            )),
        }
    }

    /// Plaintext folders, decrypting with the stored credential when needed.
    pub async fn load(&self) -> Result<Vec<Value>> {
        match self.read_stored().await? {
            StoredFolders::Empty => Ok(Vec::new()),
            StoredFolders::Plain(items) => Ok(items),
            StoredFolders::Encrypted(blob) => {
                let record = self.require_record().await?;
                self.decrypt(&blob, &record)
            }
        }
    }

    /// Write folders in the representation the encryption flag asks for.
    /// With encryption on, any failure refuses the write.
    pub async fn save(&self, folders: &[Value]) -> Result<()> {
        if !self.is_encryption_enabled().await? {
            return self.write_plain(folders).await;
        }
        let record = match self.require_record().await {
            Ok(record) => record,
            Err(e) => {
                error!(error = %e, "refusing to save folders: encryption on but no credential");
                return Err(e);
            }
        };
        match self.encrypt(folders, &record) {
            Ok(blob) => self.write_blob(&blob).await,
            Err(e) => {
                error!(error = %e, "refusing to save folders unencrypted");
                Err(e)
            }
        }
    }

    /// Turn encryption on or off, converting stored content accordingly.
    pub async fn set_encryption_enabled(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.migrate_to_encrypted().await
        } else {
            self.migrate_to_plain().await
        }
    }

    /// Encrypt plaintext content in place and set the flag. Existing content
    /// is only replaced once the new blob has been produced.
    pub async fn migrate_to_encrypted(&self) -> Result<()> {
        let record = self.require_record().await?;
        match self.read_stored().await? {
            StoredFolders::Encrypted(_) => {}
            StoredFolders::Empty => {}
            StoredFolders::Plain(items) => {
                let blob = self.encrypt(&items, &record).map_err(|e| {
                    warn!(error = %e, "encryption migration failed, content left as plaintext");
                    e
                })?;
                self.write_blob(&blob).await?;
            }
        }
        self.write_flag(true).await?;
        info!("folder encryption enabled");
        Ok(())
    }

    /// Decrypt content in place and clear the flag. On failure the encrypted
    /// content stays where it is.
    pub async fn migrate_to_plain(&self) -> Result<()> {
        if let StoredFolders::Encrypted(blob) = self.read_stored().await? {
            let record = self.require_record().await?;
            let items = self.decrypt(&blob, &record).map_err(|e| {
                warn!(error = %e, "decryption migration failed, content left encrypted");
                e
            })?;
            self.write_plain(&items).await?;
        }
        self.write_flag(false).await?;
        info!("folder encryption disabled");
        Ok(())
    }

    /// Encrypted content re-keyed for `new`, or `None` when content is not
    /// encrypted. Nothing is written.
    pub async fn rekey(
        &self,
        old: &CredentialRecord,
        new: &CredentialRecord,
    ) -> Result<Option<String>> {
        match self.read_stored().await? {
            StoredFolders::Encrypted(blob) => {
                let items = self.decrypt(&blob, old)?;
                Ok(Some(self.encrypt(&items, new)?))
            }
            _ => Ok(None),
        }
    }

    pub async fn write_blob(&self, blob: &str) -> Result<()> {
        put_json(self.store.as_ref(), Domain::Durable, keys::FOLDERS, blob).await
    }

    async fn write_plain(&self, folders: &[Value]) -> Result<()> {
        put_json(self.store.as_ref(), Domain::Durable, keys::FOLDERS, folders).await
    }

    async fn write_flag(&self, enabled: bool) -> Result<()> {
        put_json(
            self.store.as_ref(),
            Domain::Durable,
            keys::ENCRYPTION_ENABLED,
            &enabled,
        )
        .await
    }

    async fn require_record(&self) -> Result<CredentialRecord> {
        load_record(self.store.as_ref())
            .await?
            .ok_or(LockboxError::NoCredential)
    }

    fn blob_key(&self, secret: &[u8], salt: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(self.crypto.pbkdf2(
            secret,
            salt,
            self.iterations,
            HashAlg::Sha256,
            AES_KEY_LEN * 8,
        )?))
    }
}
