//! Failed login accounting with temporary lockout.
//!
//! The record is written to two keys on every change; reads prefer the
//! primary copy and fall back to the backup.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::error::Result;
use crate::store::{get_json_lenient, keys, put_json, Domain, KvStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRecord {
    pub count: u32,
    pub last_attempt: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt_history: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Open,
    Locked { wait_secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Failure counted; `remaining` further failures trigger the lockout.
    Counted { attempts: u32, remaining: u32 },
    /// A lockout is active (either already, or triggered by this failure).
    Locked { wait_secs: u64 },
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    lockout: Duration,
    idle_reset: Duration,
    history_len: usize,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: &GuardConfig) -> Self {
        Self {
            store,
            clock,
            max_attempts: config.max_failed_attempts.max(1),
            lockout: Duration::seconds(config.lockout_secs),
            idle_reset: Duration::seconds(config.idle_reset_secs),
            history_len: config.attempt_history_len,
        }
    }

    /// Primary copy, else backup copy, else `None`.
    pub async fn load(&self) -> Result<Option<RateLimitRecord>> {
        let store = self.store.as_ref();
        let primary = get_json_lenient(store, Domain::Durable, keys::RATE_LIMIT_PRIMARY).await?;
        if let Some(record) = primary {
            return Ok(Some(record));
        }
        let backup = get_json_lenient(store, Domain::Durable, keys::RATE_LIMIT_BACKUP).await?;
        if backup.is_some() {
            warn!("rate-limit primary copy unreadable, using backup");
        }
        Ok(backup)
    }

    /// Cheap pre-check: callers must not compute a password hash while locked.
    pub async fn status(&self) -> Result<LockStatus> {
        let now = self.clock.now();
        Ok(match self.load().await? {
            Some(record) => lock_status(&record, now),
            None => LockStatus::Open,
        })
    }

    pub async fn record_failure(&self) -> Result<FailureOutcome> {
        let now = self.clock.now();
        let mut record = self.load().await?.unwrap_or_else(|| fresh(now));

        if let LockStatus::Locked { wait_secs } = lock_status(&record, now) {
            return Ok(FailureOutcome::Locked { wait_secs });
        }
        if record.locked_until.is_some() || now - record.last_attempt > self.idle_reset {
            // lockout served or idle long enough: start over
            record = fresh(now);
        }

        record.count += 1;
        record.last_attempt = now;
        record.attempt_history.push(now);
        if record.attempt_history.len() > self.history_len {
            let excess = record.attempt_history.len() - self.history_len;
            record.attempt_history.drain(..excess);
        }

        let outcome = if record.count >= self.max_attempts {
            record.locked_until = Some(now + self.lockout);
            warn!(
                attempts = record.count,
                lockout_secs = self.lockout.num_seconds(),
                "too many failed logins, locking"
            );
            FailureOutcome::Locked {
                wait_secs: self.lockout.num_seconds().max(0) as u64,
            }
        } else {
            FailureOutcome::Counted {
                attempts: record.count,
                remaining: self.max_attempts - record.count,
            }
        };

        self.write(&record).await?;
        Ok(outcome)
    }

    /// Forget all failures (successful authentication or password removal).
    pub async fn reset(&self) -> Result<()> {
        for key in [keys::RATE_LIMIT_PRIMARY, keys::RATE_LIMIT_BACKUP] {
            self.store.delete(Domain::Durable, key).await?;
        }
        info!("failed login counter reset");
        Ok(())
    }

    async fn write(&self, record: &RateLimitRecord) -> Result<()> {
        let store = self.store.as_ref();
        put_json(store, Domain::Durable, keys::RATE_LIMIT_PRIMARY, record).await?;
        put_json(store, Domain::Durable, keys::RATE_LIMIT_BACKUP, record).await
    }
}

fn fresh(now: DateTime<Utc>) -> RateLimitRecord {
    RateLimitRecord {
        count: 0,
        last_attempt: now,
        locked_until: None,
        attempt_history: Vec::new(),
    }
}

fn lock_status(record: &RateLimitRecord, now: DateTime<Utc>) -> LockStatus {
    match record.locked_until {
        Some(until) if now < until => {
            let millis = (until - now).num_milliseconds();
            LockStatus::Locked {
                wait_secs: ((millis + 999) / 1000) as u64,
            }
        }
        _ => LockStatus::Open,
    }
}
