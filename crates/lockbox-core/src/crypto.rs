//! Cryptographic provider seam.
//!
//! The core never implements primitives itself. Everything goes through
//! [`CryptoProvider`]; [`RustCryptoProvider`] backs it with audited RustCrypto
//! crates. Callers treat returned key material as sensitive and wrap it in
//! `Zeroizing` where it outlives a single call.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{LockboxError, Result};

pub const AES_KEY_LEN: usize = 32;
pub const GCM_IV_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha256,
    Sha512,
}

pub trait CryptoProvider: Send + Sync {
    fn pbkdf2(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        alg: HashAlg,
        output_bits: usize,
    ) -> Result<Vec<u8>>;

    fn digest(&self, alg: HashAlg, data: &[u8]) -> Vec<u8>;

    /// HKDF-SHA256 extract + expand.
    fn hkdf(&self, ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>>;

    /// Returns ciphertext with the 16-byte tag appended.
    fn aes_gcm_encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Fails with [`LockboxError::DecryptionFailure`] on tag mismatch.
    fn aes_gcm_decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;

    fn random_bytes(&self, n: usize) -> Vec<u8>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RustCryptoProvider;

impl CryptoProvider for RustCryptoProvider {
    fn pbkdf2(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        alg: HashAlg,
        output_bits: usize,
    ) -> Result<Vec<u8>> {
        if output_bits == 0 || output_bits % 8 != 0 {
            return Err(LockboxError::Crypto(format!(
                "pbkdf2 output must be whole bytes, got {output_bits} bits"
            )));
        }
        let mut out = vec![0u8; output_bits / 8];
        match alg {
            HashAlg::Sha256 => pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out),
            HashAlg::Sha512 => pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut out),
        }
        Ok(out)
    }

    fn digest(&self, alg: HashAlg, data: &[u8]) -> Vec<u8> {
        match alg {
            HashAlg::Sha256 => Sha256::digest(data).to_vec(),
            HashAlg::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn hkdf(&self, ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
        let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = vec![0u8; len];
        hk.expand(info, &mut okm)
            .map_err(|e| LockboxError::Crypto(format!("hkdf expand: {e}")))?;
        Ok(okm)
    }

    fn aes_gcm_encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != GCM_IV_LEN {
            return Err(LockboxError::Crypto("invalid iv length".into()));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| LockboxError::Crypto("invalid aes key length".into()))?;
        cipher
            .encrypt(Nonce::from_slice(iv), plaintext)
            .map_err(|e| LockboxError::EncryptionFailure(e.to_string()))
    }

    fn aes_gcm_decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != GCM_IV_LEN {
            return Err(LockboxError::DecryptionFailure);
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| LockboxError::DecryptionFailure)?;
        cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| LockboxError::DecryptionFailure)
    }

    fn random_bytes(&self, n: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; n];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }
}
