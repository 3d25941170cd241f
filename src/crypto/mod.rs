//! Cryptographic primitives for the pre-shared key transport
//!
//! This module provides:
//! - AES-256-GCM and ChaCha20-Poly1305 AEAD with counter nonces
//! - HKDF-SHA256 key derivation from the configured key string
//! - Random salts from the system source

mod aead;
mod kdf;

pub use aead::{Cipher, CipherKind};
pub use kdf::{derive_master_key, derive_subkey};

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Length of the per-direction salt that prefixes a cipher stream
pub const SALT_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Unknown cipher: {0}")]
    UnknownCipher(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Nonce space exhausted")]
    NonceExhausted,

    #[error("Random source failure")]
    Random,
}

impl From<CryptoError> for std::io::Error {
    fn from(e: CryptoError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a random salt
pub fn generate_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    random_bytes(&mut salt)?;
    Ok(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1).unwrap();
        random_bytes(&mut buf2).unwrap();
        assert_ne!(buf1, buf2);
    }
}
