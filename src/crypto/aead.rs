//! AEAD encryption/decryption utilities
//!
//! Each direction of a cipher stream owns one [`Cipher`]; nonces are a
//! monotonic counter so nothing but ciphertext goes on the wire.

use super::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use bytes::BytesMut;
use ring::aead::{Aad, Algorithm, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};

/// Supported symmetric ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    /// AES-256-GCM (default)
    Aes256Gcm,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
}

impl CipherKind {
    /// Look up a cipher by its configuration name
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        match name.to_lowercase().as_str() {
            "" | "aes" | "aes256" | "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            other => Err(CryptoError::UnknownCipher(other.to_string())),
        }
    }

    fn algorithm(&self) -> &'static Algorithm {
        match self {
            CipherKind::Aes256Gcm => &AES_256_GCM,
            CipherKind::ChaCha20Poly1305 => &CHACHA20_POLY1305,
        }
    }
}

/// AEAD cipher for one direction of a stream
pub struct Cipher {
    key: LessSafeKey,
    nonce_counter: u64,
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(kind: CipherKind, key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(kind.algorithm(), key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
            nonce_counter: 0,
        })
    }

    /// Encrypt `plaintext` and append ciphertext plus tag to `out`
    pub fn seal_append(&mut self, plaintext: &[u8], out: &mut BytesMut) -> Result<(), CryptoError> {
        let nonce = self.next_nonce()?;
        let start = out.len();
        out.extend_from_slice(plaintext);

        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::empty(), &mut out[start..])
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        out.extend_from_slice(tag.as_ref());
        Ok(())
    }

    /// Decrypt `buffer` (ciphertext plus tag) in place, returning the plaintext slice
    pub fn open_in_place<'a>(&mut self, buffer: &'a mut [u8]) -> Result<&'a mut [u8], CryptoError> {
        if buffer.len() < TAG_LEN {
            return Err(CryptoError::Decryption("short ciphertext".to_string()));
        }
        let nonce = self.next_nonce()?;

        self.key
            .open_in_place(nonce, Aad::empty(), buffer)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))
    }

    /// Generate the next nonce (monotonic counter)
    fn next_nonce(&mut self) -> Result<Nonce, CryptoError> {
        if self.nonce_counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let mut nonce = [0u8; NONCE_LEN];
        // Use counter in little-endian in the last 8 bytes
        nonce[4..12].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter += 1;
        Ok(Nonce::assume_unique_for_key(nonce))
    }

    /// Get current nonce counter value
    pub fn nonce_counter(&self) -> u64 {
        self.nonce_counter
    }
}
