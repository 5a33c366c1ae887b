use async_trait::async_trait;
use chrono::Duration;
use lockbox_core::audit::AuditStatus;
use lockbox_core::clock::ManualClock;
use lockbox_core::crypto::RustCryptoProvider;
use lockbox_core::integrity::IntegrityRecord;
use lockbox_core::store::{get_json, keys, put_json, Domain, KvStore, MemoryStore};
use lockbox_core::{Guard, GuardConfig, LockboxError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

struct Harness {
    store: Arc<MemoryStore>,
    device: MemoryStore,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            device: MemoryStore::new(),
            clock: Arc::new(ManualClock::default()),
        }
    }

    /// A fresh `Guard` over the same storage, like an application relaunch.
    async fn guard(&self) -> Guard {
        self.guard_on(self.store.clone()).await
    }

    async fn guard_on(&self, store: Arc<dyn KvStore>) -> Guard {
        Guard::open(
            store,
            &self.device,
            Arc::new(RustCryptoProvider),
            self.clock.clone(),
            &GuardConfig::for_tests(),
        )
        .await
        .unwrap()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    Reads,
    Writes,
    /// Writes to this key only.
    WritesTo(&'static str),
}

/// Wraps the harness store and fails the selected operations.
struct FlakyStore {
    inner: Arc<MemoryStore>,
    fault: Mutex<Fault>,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fault: Mutex::new(Fault::None),
        })
    }

    fn fail(&self, fault: Fault) {
        *self.fault.lock() = fault;
    }

    fn check_write(&self, key: &str) -> Result<()> {
        match *self.fault.lock() {
            Fault::Writes => Err(LockboxError::StorageUnavailable("disk full".into())),
            Fault::WritesTo(k) if k == key => {
                Err(LockboxError::StorageUnavailable("disk full".into()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, domain: Domain, key: &str) -> Result<Option<Vec<u8>>> {
        if *self.fault.lock() == Fault::Reads {
            return Err(LockboxError::StorageUnavailable("read error".into()));
        }
        self.inner.get(domain, key).await
    }

    async fn set(&self, domain: Domain, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_write(key)?;
        self.inner.set(domain, key, value).await
    }

    async fn delete(&self, domain: Domain, key: &str) -> Result<()> {
        self.check_write(key)?;
        self.inner.delete(domain, key).await
    }
}

#[tokio::test]
async fn correct_and_wrong_password() {
    let h = Harness::new();
    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();

    guard.verify_password("correcthorse1").await.unwrap();
    assert!(matches!(
        guard.verify_password("wrong").await,
        Err(LockboxError::AuthFailure {
            remaining_attempts: 4
        })
    ));
    let limits = guard.rate_limiter().load().await.unwrap().unwrap();
    assert_eq!(limits.count, 1);
}

#[tokio::test]
async fn weak_password_refused() {
    let h = Harness::new();
    let guard = h.guard().await;
    assert!(matches!(
        guard.set_password("short").await,
        Err(LockboxError::WeakPassword { .. })
    ));
    assert!(!guard.is_protected().await.unwrap());
}

#[tokio::test]
async fn lockout_after_five_failures_then_recovers() {
    let h = Harness::new();
    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();

    for expected_remaining in (0..5).rev() {
        match guard.verify_password("nope-nope").await {
            Err(LockboxError::AuthFailure { remaining_attempts }) => {
                assert_eq!(remaining_attempts, expected_remaining)
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    // locked: even the right password is not checked
    assert!(matches!(
        guard.verify_password("correcthorse1").await,
        Err(LockboxError::RateLimited { wait_secs: 900 })
    ));

    h.clock.advance(Duration::minutes(15));
    guard.verify_password("correcthorse1").await.unwrap();
    assert!(guard.rate_limiter().load().await.unwrap().is_none());
}

#[tokio::test]
async fn tampered_credential_is_an_integrity_failure() {
    let h = Harness::new();
    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();

    // an attacker swaps in their own record
    let forged = guard.credentials().derive_record("attacker-pass").unwrap();
    guard.credentials().persist(&forged).await.unwrap();

    assert!(matches!(
        guard.verify_password("attacker-pass").await,
        Err(LockboxError::IntegrityFailure)
    ));
    // integrity failures do not feed the lockout counter
    assert!(guard.rate_limiter().load().await.unwrap().is_none());
}

#[tokio::test]
async fn one_damaged_integrity_copy_is_tolerated() {
    let h = Harness::new();
    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();

    let mut backup: IntegrityRecord =
        get_json(h.store.as_ref(), Domain::Durable, keys::INTEGRITY_BACKUP)
            .await
            .unwrap()
            .unwrap();
    backup.primary_hash = "0".repeat(64);
    put_json(h.store.as_ref(), Domain::Durable, keys::INTEGRITY_BACKUP, &backup)
        .await
        .unwrap();

    guard.verify_password("correcthorse1").await.unwrap();
    let repaired: IntegrityRecord =
        get_json(h.store.as_ref(), Domain::Durable, keys::INTEGRITY_BACKUP)
            .await
            .unwrap()
            .unwrap();
    assert_ne!(repaired.primary_hash, "0".repeat(64));
}

#[tokio::test]
async fn remembered_session_survives_relaunch_until_expiry() {
    let h = Harness::new();
    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();
    guard.login("correcthorse1", true).await.unwrap();

    h.clock.advance(Duration::hours(23) + Duration::minutes(59));
    let report = h.guard().await.boot().await.unwrap();
    assert!(report.protected);
    assert!(report.session_restored);

    h.clock.advance(Duration::minutes(2));
    let report = h.guard().await.boot().await.unwrap();
    assert!(!report.session_restored);
    assert!(h
        .store
        .get(Domain::Ephemeral, keys::SESSION_CHALLENGE)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn login_without_remember_does_not_restore() {
    let h = Harness::new();
    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();
    guard.login("correcthorse1", false).await.unwrap();
    assert!(guard.sessions().is_authenticated().await.unwrap());
    assert!(!guard.restore_session().await.unwrap());
}

#[tokio::test]
async fn session_ends_with_ephemeral_domain_or_logout() {
    let h = Harness::new();
    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();

    guard.login("correcthorse1", true).await.unwrap();
    h.store.end_session();
    assert!(!guard.restore_session().await.unwrap());

    guard.login("correcthorse1", true).await.unwrap();
    guard.logout().await.unwrap();
    assert!(!guard.restore_session().await.unwrap());
}

#[tokio::test]
async fn change_password_invalidates_sessions() {
    let h = Harness::new();
    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();
    guard.login("correcthorse1", true).await.unwrap();

    assert!(matches!(
        guard.change_password("wrong-current", "batterystaple2").await,
        Err(LockboxError::AuthFailure { .. })
    ));
    assert!(guard.restore_session().await.unwrap());

    guard
        .change_password("correcthorse1", "batterystaple2")
        .await
        .unwrap();
    assert!(!guard.restore_session().await.unwrap());
    assert!(guard.verify_password("correcthorse1").await.is_err());
    guard.verify_password("batterystaple2").await.unwrap();
}

#[tokio::test]
async fn change_to_weak_password_checks_nothing() {
    let h = Harness::new();
    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();
    assert!(matches!(
        guard.change_password("wrong-current", "short").await,
        Err(LockboxError::WeakPassword { .. })
    ));
    assert!(guard.rate_limiter().load().await.unwrap().is_none());
}

#[tokio::test]
async fn remove_password_clears_security_state() {
    let h = Harness::new();
    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();
    guard.login("correcthorse1", true).await.unwrap();
    let _ = guard.verify_password("wrong-pass").await;

    guard.remove_password("correcthorse1").await.unwrap();
    assert!(!guard.is_protected().await.unwrap());
    for key in [
        keys::CREDENTIAL,
        keys::INTEGRITY_PRIMARY,
        keys::INTEGRITY_BACKUP,
        keys::RATE_LIMIT_PRIMARY,
        keys::RATE_LIMIT_BACKUP,
    ] {
        assert!(h.store.get(Domain::Durable, key).await.unwrap().is_none(), "{key}");
    }
    assert!(h
        .store
        .get(Domain::Ephemeral, keys::SESSION_CHALLENGE)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn legitimate_changes_keep_audit_intact() {
    let h = Harness::new();
    let first = h.guard().await.boot().await.unwrap();
    assert_eq!(first.audit.status, AuditStatus::Initialized);
    assert!(!first.protected);

    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();
    let _ = guard.verify_password("wrong-pass").await;
    guard.login("correcthorse1", false).await.unwrap();

    let report = h.guard().await.boot().await.unwrap();
    assert_eq!(report.audit.status, AuditStatus::Intact);
    assert_eq!(report.audit.boot_count, 2);
}

#[tokio::test]
async fn out_of_band_write_is_flagged_once() {
    let h = Harness::new();
    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();
    guard.boot().await.unwrap();

    // rate-limit record rewritten behind the guard's back
    put_json(
        h.store.as_ref(),
        Domain::Durable,
        keys::RATE_LIMIT_PRIMARY,
        &serde_json::json!({"count": 4, "lastAttempt": "2020-01-01T00:00:00Z"}),
    )
    .await
    .unwrap();

    let report = h.guard().await.boot().await.unwrap();
    assert_eq!(report.audit.status, AuditStatus::Anomaly);
    assert!(!report.audit.is_intact());

    let report = h.guard().await.boot().await.unwrap();
    assert_eq!(report.audit.status, AuditStatus::Intact);
}

#[tokio::test]
async fn device_id_is_stable_across_relaunch() {
    let h = Harness::new();
    let a = h.guard().await;
    let b = h.guard().await;
    assert_eq!(a.device_id(), b.device_id());
}

#[tokio::test]
async fn storage_failures_surface_as_storage_unavailable() {
    let h = Harness::new();
    let flaky = FlakyStore::new(h.store.clone());
    let guard = h.guard_on(flaky.clone()).await;
    guard.set_password("correcthorse1").await.unwrap();

    flaky.fail(Fault::Writes);
    assert!(matches!(
        guard.login("correcthorse1", true).await,
        Err(LockboxError::StorageUnavailable(_))
    ));
    assert!(matches!(
        guard.save_folders(&[serde_json::json!({"id": 1})]).await,
        Err(LockboxError::StorageUnavailable(_))
    ));

    flaky.fail(Fault::Reads);
    assert!(matches!(
        guard.login("correcthorse1", false).await,
        Err(LockboxError::StorageUnavailable(_))
    ));

    flaky.fail(Fault::None);
    assert!(!guard.restore_session().await.unwrap());
    assert!(guard.load_folders().await.unwrap().is_empty());
    guard.login("correcthorse1", false).await.unwrap();
}

#[tokio::test]
async fn failed_credential_write_keeps_old_password() {
    let h = Harness::new();
    let flaky = FlakyStore::new(h.store.clone());
    let guard = h.guard_on(flaky.clone()).await;
    guard.set_password("correcthorse1").await.unwrap();

    flaky.fail(Fault::WritesTo(keys::CREDENTIAL));
    assert!(matches!(
        guard.change_password("correcthorse1", "batterystaple2").await,
        Err(LockboxError::StorageUnavailable(_))
    ));
    flaky.fail(Fault::None);
    guard.verify_password("correcthorse1").await.unwrap();
}

#[tokio::test]
async fn failed_backup_write_leaves_a_consistent_pair() {
    let h = Harness::new();
    let flaky = FlakyStore::new(h.store.clone());
    let guard = h.guard_on(flaky.clone()).await;
    guard.set_password("correcthorse1").await.unwrap();

    flaky.fail(Fault::WritesTo(keys::INTEGRITY_BACKUP));
    assert!(matches!(
        guard.change_password("correcthorse1", "batterystaple2").await,
        Err(LockboxError::StorageUnavailable(_))
    ));
    flaky.fail(Fault::None);

    // credential and primary copy were committed together; the stale backup
    // is outvoted and repaired on the next check
    guard.verify_password("batterystaple2").await.unwrap();
    let read = |key| get_json::<IntegrityRecord>(h.store.as_ref(), Domain::Durable, key);
    let primary = read(keys::INTEGRITY_PRIMARY).await.unwrap().unwrap();
    let backup = read(keys::INTEGRITY_BACKUP).await.unwrap().unwrap();
    assert_eq!(primary.primary_hash, backup.primary_hash);
    assert_eq!(primary.secondary_hash, backup.secondary_hash);
}

#[tokio::test]
async fn unreadable_credential_stays_protected() {
    let h = Harness::new();
    let guard = h.guard().await;
    guard.set_password("correcthorse1").await.unwrap();
    let before = guard.boot().await.unwrap();

    h.store
        .set(Domain::Durable, keys::CREDENTIAL, b"{\"hash\":".to_vec())
        .await
        .unwrap();

    let guard = h.guard().await;
    let report = guard.boot().await.unwrap();
    assert_eq!(report.audit.status, AuditStatus::Anomaly);
    assert_eq!(report.audit.boot_count, before.audit.boot_count + 1);
    assert!(report.protected);
    assert!(!report.session_restored);

    assert!(matches!(
        guard.verify_password("correcthorse1").await,
        Err(LockboxError::IntegrityFailure)
    ));
    assert!(matches!(
        guard.login("correcthorse1", false).await,
        Err(LockboxError::IntegrityFailure)
    ));
    assert!(matches!(
        guard.remove_password("correcthorse1").await,
        Err(LockboxError::IntegrityFailure)
    ));
    assert!(matches!(
        guard.set_password("batterystaple2").await,
        Err(LockboxError::AlreadyProtected)
    ));
    assert!(guard.rate_limiter().load().await.unwrap().is_none());
}
