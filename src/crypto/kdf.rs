//! HKDF-SHA256 key derivation
//!
//! The configured key string is stretched once into a master key; every
//! direction of every cipher connection then derives its own key from the
//! master and a random salt.

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{KeyType, Salt, HKDF_SHA256};

const MASTER_SALT: &[u8] = b"tunnelmux master key";
const MASTER_INFO: &[u8] = b"tunnelmux psk";
const SUBKEY_INFO: &[u8] = b"tunnelmux subkey";

struct KeyLen;

impl KeyType for KeyLen {
    fn len(&self) -> usize {
        KEY_LEN
    }
}

/// Extract-then-expand a single key
fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let prk = Salt::new(HKDF_SHA256, salt).extract(ikm);
    let info = [info];
    let okm = prk
        .expand(&info, KeyLen)
        .map_err(|_| CryptoError::KeyGeneration("HKDF expand failed".to_string()))?;

    let mut key = [0u8; KEY_LEN];
    okm.fill(&mut key)
        .map_err(|_| CryptoError::KeyGeneration("HKDF fill failed".to_string()))?;
    Ok(key)
}

/// Stretch a configured key string into a master key
pub fn derive_master_key(secret: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::InvalidKeyLength);
    }
    hkdf_sha256(MASTER_SALT, secret.as_bytes(), MASTER_INFO)
}

/// Derive the key for one direction of one connection
pub fn derive_subkey(master: &[u8; KEY_LEN], salt: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    hkdf_sha256(salt, master, SUBKEY_INFO)
}
