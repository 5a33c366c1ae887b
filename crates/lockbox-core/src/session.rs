//! "Remember me" challenge-response.
//!
//! A remembered session is a random challenge and nonce plus the response
//! `SHA256(salt || challenge || hash || nonce)` computed over the credential
//! record at issue time. Validation recomputes the response from the current
//! record, so any password change silently invalidates outstanding sessions.
//! Everything lives in the ephemeral domain.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::credential::CredentialRecord;
use crate::crypto::{CryptoProvider, HashAlg};
use crate::error::{LockboxError, Result};
use crate::integrity::IntegrityVerifier;
use crate::store::{get_json_lenient, keys, put_json, Domain, KvStore};

pub const CHALLENGE_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionChallenge {
    pub challenge: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
    pub nonce: String,
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn KvStore>,
    crypto: Arc<dyn CryptoProvider>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        crypto: Arc<dyn CryptoProvider>,
        clock: Arc<dyn Clock>,
        config: &GuardConfig,
    ) -> Self {
        Self {
            store,
            crypto,
            clock,
            ttl: Duration::seconds(config.session_ttl_secs),
        }
    }

    /// Issue a challenge bound to `record`, replacing any previous one.
    pub async fn create_challenge(&self, record: &CredentialRecord) -> Result<SessionChallenge> {
        let challenge = hex::encode(self.crypto.random_bytes(CHALLENGE_LEN));
        let nonce = hex::encode(self.crypto.random_bytes(NONCE_LEN));
        let response = hex::encode(self.response(record, &challenge, &nonce));
        let session = SessionChallenge {
            challenge,
            response,
            timestamp: self.clock.now(),
            nonce,
        };
        put_json(
            self.store.as_ref(),
            Domain::Ephemeral,
            keys::SESSION_CHALLENGE,
            &session,
        )
        .await?;
        info!("remembered session issued");
        Ok(session)
    }

    /// `Ok(())` when a live challenge exists and answers for `record`.
    /// An expired challenge is deleted, and so is one stamped in the future.
    pub async fn verify_challenge(&self, record: &CredentialRecord) -> Result<()> {
        let stored: Option<SessionChallenge> = get_json_lenient(
            self.store.as_ref(),
            Domain::Ephemeral,
            keys::SESSION_CHALLENGE,
        )
        .await?;
        let Some(session) = stored else {
            return Err(LockboxError::SessionInvalid);
        };

        let now = self.clock.now();
        if session.timestamp > now {
            self.clear_challenge().await?;
            warn!(issued = %session.timestamp, "remembered session is stamped in the future");
            return Err(LockboxError::SessionInvalid);
        }
        if now - session.timestamp > self.ttl {
            self.store
                .delete(Domain::Ephemeral, keys::SESSION_CHALLENGE)
                .await?;
            info!("remembered session expired");
            return Err(LockboxError::SessionExpired);
        }

        let expected = self.response(record, &session.challenge, &session.nonce);
        let answers = match hex::decode(&session.response) {
            Ok(given) => bool::from(expected.as_slice().ct_eq(given.as_slice())),
            Err(_) => false,
        };
        if !answers {
            warn!("remembered session does not answer for the current credential");
            return Err(LockboxError::SessionInvalid);
        }
        Ok(())
    }

    /// All of: the session flag is set, integrity vouches for `record`, and
    /// the challenge validates. Session problems map to `false` so the caller
    /// falls back to the password prompt; storage errors propagate.
    pub async fn verify_authentication_state(
        &self,
        record: &CredentialRecord,
        integrity: &IntegrityVerifier,
    ) -> Result<bool> {
        if !self.is_authenticated().await? {
            debug!("no authenticated flag in this session");
            return Ok(false);
        }
        if !integrity.verify_integrity(record).await? {
            return Ok(false);
        }
        match self.verify_challenge(record).await {
            Ok(()) => Ok(true),
            Err(LockboxError::SessionExpired | LockboxError::SessionInvalid) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn mark_authenticated(&self) -> Result<()> {
        put_json(
            self.store.as_ref(),
            Domain::Ephemeral,
            keys::SESSION_AUTHENTICATED,
            &true,
        )
        .await
    }

    pub async fn is_authenticated(&self) -> Result<bool> {
        let flag: Option<bool> = get_json_lenient(
            self.store.as_ref(),
            Domain::Ephemeral,
            keys::SESSION_AUTHENTICATED,
        )
        .await?;
        Ok(flag.unwrap_or(false))
    }

    pub async fn clear_challenge(&self) -> Result<()> {
        self.store
            .delete(Domain::Ephemeral, keys::SESSION_CHALLENGE)
            .await
    }

    /// Drop both the flag and the challenge.
    pub async fn clear(&self) -> Result<()> {
        self.store
            .delete(Domain::Ephemeral, keys::SESSION_AUTHENTICATED)
            .await?;
        self.clear_challenge().await
    }

    fn response(&self, record: &CredentialRecord, challenge: &str, nonce: &str) -> Vec<u8> {
        let mut input = Vec::with_capacity(
            record.salt.len() + challenge.len() + record.hash.len() + nonce.len(),
        );
        input.extend_from_slice(record.salt.as_bytes());
        input.extend_from_slice(challenge.as_bytes());
        input.extend_from_slice(record.hash.as_bytes());
        input.extend_from_slice(nonce.as_bytes());
        self.crypto.digest(HashAlg::Sha256, &input)
    }
}
