use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockboxError {
    #[error("password must be at least {min_len} characters")]
    WeakPassword { min_len: usize },

    #[error("incorrect password ({remaining_attempts} attempts left before lockout)")]
    AuthFailure { remaining_attempts: u32 },

    #[error("too many failed attempts, try again in {wait_secs}s")]
    RateLimited { wait_secs: u64 },

    #[error("security alert: credential integrity check failed")]
    IntegrityFailure,

    #[error("remembered session expired")]
    SessionExpired,

    #[error("remembered session invalid")]
    SessionInvalid,

    #[error("content decryption failed (wrong key or corrupted data)")]
    DecryptionFailure,

    #[error("content encryption failed: {0}")]
    EncryptionFailure(String),

    #[error("no password is set")]
    NoCredential,

    #[error("a password is already set")]
    AlreadyProtected,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("crypto provider error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<std::io::Error> for LockboxError {
    fn from(e: std::io::Error) -> Self {
        LockboxError::StorageUnavailable(e.to_string())
    }
}

impl From<base64::DecodeError> for LockboxError {
    fn from(e: base64::DecodeError) -> Self {
        LockboxError::StorageUnavailable(format!("decode stored value: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, LockboxError>;
