//! lockbox-core: password gate and tamper-evident security state for a local
//! data vault.
//!
//! # Module layout
//! - `credential` : password hash + salt record (set / verify / replace)
//! - `integrity`  : redundant SHA-256 / SHA-512 fingerprints of the credential
//! - `audit`      : boot-time checksum over the aggregate security state
//! - `session`    : "remember me" challenge-response in the ephemeral domain
//! - `rate_limit` : failed attempt counter and temporary lockout
//! - `folders`    : AES-GCM encryption of the protected folder payload
//! - `guard`      : facade wiring the components into login / boot flows
//! - `store`      : async key-value seam with durable and ephemeral domains
//! - `crypto`     : crypto provider seam and its RustCrypto implementation

pub mod audit;
pub mod clock;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod device;
pub mod error;
pub mod folders;
pub mod guard;
pub mod integrity;
pub mod paths;
pub mod rate_limit;
pub mod session;
pub mod store;

pub use config::GuardConfig;
pub use error::{LockboxError, Result};
pub use guard::{BootReport, Guard};
