//! Redundant fingerprints of the credential record.
//!
//! Two identical copies are written under independent keys. Verification
//! recomputes the fingerprints from the *current* record and accepts when at
//! least one copy matches (quorum of 1 out of 2); a missing or mismatching
//! copy next to a valid one is rewritten from the valid one.
//!
//! Damage to a single storage location therefore never locks the user out.
//! Editing the credential still fails unless some copy carries hashes that
//! match the recomputed ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::credential::CredentialRecord;
use crate::crypto::{CryptoProvider, HashAlg};
use crate::error::Result;
use crate::store::{get_json_lenient, keys, put_json, Domain, KvStore};

pub const INTEGRITY_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityRecord {
    /// SHA-256 of the canonical credential serialization.
    pub primary_hash: String,
    /// SHA-512 of the canonical serialization followed by the device id.
    pub secondary_hash: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub version: u32,
}

impl IntegrityRecord {
    fn fingerprints_match(&self, expected: &Fingerprints) -> bool {
        self.primary_hash == expected.primary && self.secondary_hash == expected.secondary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityCopy {
    Primary,
    Backup,
}

impl IntegrityCopy {
    fn key(self) -> &'static str {
        match self {
            IntegrityCopy::Primary => keys::INTEGRITY_PRIMARY,
            IntegrityCopy::Backup => keys::INTEGRITY_BACKUP,
        }
    }

    fn other(self) -> Self {
        match self {
            IntegrityCopy::Primary => IntegrityCopy::Backup,
            IntegrityCopy::Backup => IntegrityCopy::Primary,
        }
    }
}

impl fmt::Display for IntegrityCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityVerdict {
    /// Both copies match.
    Intact,
    /// One copy matched; the other was missing or wrong and has been rewritten.
    Repaired(IntegrityCopy),
    /// Neither copy exists: nothing to anchor trust to.
    Missing,
    /// No copy matches the current record.
    Mismatch,
}

impl IntegrityVerdict {
    pub fn is_trusted(&self) -> bool {
        matches!(self, IntegrityVerdict::Intact | IntegrityVerdict::Repaired(_))
    }
}

struct Fingerprints {
    primary: String,
    secondary: String,
}

#[derive(Clone)]
pub struct IntegrityVerifier {
    store: Arc<dyn KvStore>,
    crypto: Arc<dyn CryptoProvider>,
    clock: Arc<dyn Clock>,
    device_id: String,
}

impl IntegrityVerifier {
    pub fn new(
        store: Arc<dyn KvStore>,
        crypto: Arc<dyn CryptoProvider>,
        clock: Arc<dyn Clock>,
        device_id: String,
    ) -> Self {
        Self {
            store,
            crypto,
            clock,
            device_id,
        }
    }

    /// Write fresh fingerprints for `record` to both copies, primary first.
    pub async fn store_integrity(&self, record: &CredentialRecord) -> Result<()> {
        let fp = self.fingerprints(record)?;
        for copy in [IntegrityCopy::Primary, IntegrityCopy::Backup] {
            let entry = IntegrityRecord {
                primary_hash: fp.primary.clone(),
                secondary_hash: fp.secondary.clone(),
                timestamp: self.clock.now(),
                device_id: self.device_id.clone(),
                version: INTEGRITY_VERSION,
            };
            put_json(self.store.as_ref(), Domain::Durable, copy.key(), &entry).await?;
        }
        debug!("integrity fingerprints stored");
        Ok(())
    }

    /// `true` when at least one copy vouches for `record`.
    pub async fn verify_integrity(&self, record: &CredentialRecord) -> Result<bool> {
        Ok(self.check(record).await?.is_trusted())
    }

    /// Full verdict, repairing a weak copy as a side effect.
    pub async fn check(&self, record: &CredentialRecord) -> Result<IntegrityVerdict> {
        let primary = self.load(IntegrityCopy::Primary).await?;
        let backup = self.load(IntegrityCopy::Backup).await?;
        if primary.is_none() && backup.is_none() {
            error!("security alert: no integrity data for the credential record");
            return Ok(IntegrityVerdict::Missing);
        }

        let expected = self.fingerprints(record)?;
        let primary_ok = primary.as_ref().is_some_and(|r| r.fingerprints_match(&expected));
        let backup_ok = backup.as_ref().is_some_and(|r| r.fingerprints_match(&expected));

        match (primary_ok, backup_ok, primary, backup) {
            (true, true, _, _) => Ok(IntegrityVerdict::Intact),
            (true, false, Some(valid), _) => self.repair(IntegrityCopy::Backup, &valid).await,
            (false, true, _, Some(valid)) => self.repair(IntegrityCopy::Primary, &valid).await,
            _ => {
                error!("security alert: credential record does not match any integrity copy");
                Ok(IntegrityVerdict::Mismatch)
            }
        }
    }

    pub async fn load(&self, copy: IntegrityCopy) -> Result<Option<IntegrityRecord>> {
        get_json_lenient(self.store.as_ref(), Domain::Durable, copy.key()).await
    }

    pub async fn clear(&self) -> Result<()> {
        for copy in [IntegrityCopy::Primary, IntegrityCopy::Backup] {
            self.store.delete(Domain::Durable, copy.key()).await?;
        }
        Ok(())
    }

    async fn repair(
        &self,
        weak: IntegrityCopy,
        valid: &IntegrityRecord,
    ) -> Result<IntegrityVerdict> {
        warn!(copy = %weak, source = %weak.other(), "integrity copy damaged, restoring");
        put_json(self.store.as_ref(), Domain::Durable, weak.key(), valid).await?;
        Ok(IntegrityVerdict::Repaired(weak))
    }

    fn fingerprints(&self, record: &CredentialRecord) -> Result<Fingerprints> {
        let canonical = record.canonical_bytes()?;
        let primary = hex::encode(self.crypto.digest(HashAlg::Sha256, &canonical));

        let mut bound = canonical;
        bound.extend_from_slice(self.device_id.as_bytes());
        let secondary = hex::encode(self.crypto.digest(HashAlg::Sha512, &bound));
        Ok(Fingerprints { primary, secondary })
    }
}
