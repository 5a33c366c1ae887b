//! Boot-time audit of the aggregate security state.
//!
//! The checksum covers only stored, non-volatile inputs (credential record,
//! integrity fingerprints, rate-limit record, device id, security version), so
//! an untouched state always replays to the same value. A mismatch is a
//! detection signal: it is logged and reported, never used to deny access.
//! Every legitimate write to security state is followed by [`SecurityAuditor::refresh`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::credential::CredentialRecord;
use crate::crypto::{CryptoProvider, HashAlg};
use crate::error::Result;
use crate::integrity::IntegrityRecord;
use crate::rate_limit::RateLimitRecord;
use crate::store::{get_json_lenient, keys, put_json, Domain, KvStore};

pub const SECURITY_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityChecksum {
    pub checksum: String,
    pub last_verified: DateTime<Utc>,
    pub security_version: u32,
    pub boot_count: u64,
}

/// Stored security state the checksum is computed over.
#[derive(Debug, Clone, Default)]
pub struct SecuritySnapshot {
    pub credential: Option<CredentialRecord>,
    pub integrity: Option<IntegrityRecord>,
    pub rate_limit: Option<RateLimitRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    /// First run; state initialised.
    Initialized,
    Intact,
    /// Stored state changed outside this crate since the last audit.
    Anomaly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditReport {
    pub status: AuditStatus,
    pub boot_count: u64,
}

impl AuditReport {
    pub fn is_intact(&self) -> bool {
        self.status != AuditStatus::Anomaly
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChecksumInput<'a> {
    credential: Option<&'a CredentialRecord>,
    // fingerprints only: copy timestamps change on repair
    integrity: Option<(&'a str, &'a str)>,
    rate_limit: Option<&'a RateLimitRecord>,
    device_id: &'a str,
    security_version: u32,
}

#[derive(Clone)]
pub struct SecurityAuditor {
    store: Arc<dyn KvStore>,
    crypto: Arc<dyn CryptoProvider>,
    clock: Arc<dyn Clock>,
    device_id: String,
}

impl SecurityAuditor {
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

    /// Compare `snapshot` with the stored checksum, bump the boot counter and
    /// store the fresh checksum regardless of the outcome.
    pub async fn boot_check(&self, snapshot: &SecuritySnapshot) -> Result<AuditReport> {
        let checksum = self.compute(snapshot)?;
        let (status, boot_count) = match self.load().await? {
            None => {
                info!("no security checksum yet, initialising");
                (AuditStatus::Initialized, 1)
            }
            Some(stored) if stored.checksum == checksum => {
                (AuditStatus::Intact, stored.boot_count.saturating_add(1))
            }
            Some(stored) => {
                warn!(
                    boot_count = stored.boot_count + 1,
                    last_verified = %stored.last_verified,
                    "security alert: security state changed since last audit"
                );
                (AuditStatus::Anomaly, stored.boot_count.saturating_add(1))
            }
        };
        self.write(checksum, boot_count).await?;
        Ok(AuditReport { status, boot_count })
    }

    /// Re-baseline after a legitimate change. Keeps the boot counter.
    pub async fn refresh(&self, snapshot: &SecuritySnapshot) -> Result<()> {
        let checksum = self.compute(snapshot)?;
        let boot_count = self.load().await?.map_or(0, |s| s.boot_count);
        self.write(checksum, boot_count).await
    }

    pub async fn load(&self) -> Result<Option<SecurityChecksum>> {
        get_json_lenient(self.store.as_ref(), Domain::Durable, keys::SECURITY_CHECKSUM).await
    }

    pub fn compute(&self, snapshot: &SecuritySnapshot) -> Result<String> {
        let input = ChecksumInput {
            credential: snapshot.credential.as_ref(),
            integrity: snapshot
                .integrity
                .as_ref()
                .map(|r| (r.primary_hash.as_str(), r.secondary_hash.as_str())),
            rate_limit: snapshot.rate_limit.as_ref(),
            device_id: &self.device_id,
            security_version: SECURITY_VERSION,
        };
        let bytes = serde_json::to_vec(&input)?;
        Ok(hex::encode(self.crypto.digest(HashAlg::Sha256, &bytes)))
    }

    async fn write(&self, checksum: String, boot_count: u64) -> Result<()> {
        let entry = SecurityChecksum {
            checksum,
            last_verified: self.clock.now(),
            security_version: SECURITY_VERSION,
            boot_count,
        };
        put_json(self.store.as_ref(), Domain::Durable, keys::SECURITY_CHECKSUM, &entry).await
    }
}
