//! AES-256-GCM authenticated encryption for PHI fields
//!
//! Sealed layout: [12-byte nonce][ciphertext with 16-byte auth tag].
//! The caller supplies associated data that binds the ciphertext to the key id
//! and field label it was produced for.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{PhiError, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Raw symmetric key bytes. Wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            PhiError::Storage(format!(
                "Key material must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn to_base64(&self) -> String {
        URL_SAFE.encode(self.0)
    }

    pub(crate) fn from_base64(encoded: &str) -> Result<Self> {
        let mut decoded = URL_SAFE
            .decode(encoded)
            .map_err(|e| PhiError::Storage(format!("Invalid key encoding: {}", e)))?;
        let material = Self::from_slice(&decoded);
        decoded.zeroize();
        material
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

/// Encrypt `plaintext` under `key`, binding `aad`. Output is base64 (URL-safe).
pub fn seal(key: &KeyMaterial, plaintext: &[u8], aad: &[u8]) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| PhiError::Encryption(format!("Failed to create cipher: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let sealed = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| PhiError::Encryption(format!("Encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(URL_SAFE.encode(out))
}

/// Reverse of [`seal`]. Any decoding or authentication failure is a
/// [`PhiError::Decryption`]; partial plaintext is never returned.
pub fn open(key: &KeyMaterial, encoded: &str, aad: &[u8]) -> Result<Vec<u8>> {
    let raw = URL_SAFE
        .decode(encoded)
        .map_err(|e| PhiError::Decryption(format!("Ciphertext is not valid base64: {}", e)))?;

    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(PhiError::Decryption(
            "Ciphertext too short (missing nonce or tag)".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| PhiError::Decryption(format!("Failed to create cipher: {}", e)))?;

    let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), Payload { msg: sealed, aad })
        .map_err(|_| PhiError::Decryption("Authentication failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = KeyMaterial::generate();
        let sealed = seal(&key, b"123-45-6789", b"aad").unwrap();
        assert_eq!(open(&key, &sealed, b"aad").unwrap(), b"123-45-6789");
    }

    #[test]
    fn test_sealing_is_randomised() {
        let key = KeyMaterial::generate();
        let a = seal(&key, b"Jane Doe", b"").unwrap();
        let b = seal(&key, b"Jane Doe", b"").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_or_aad_fails() {
        let key = KeyMaterial::generate();
        let other = KeyMaterial::generate();
        let sealed = seal(&key, b"secret", b"ssn").unwrap();

        assert!(matches!(open(&other, &sealed, b"ssn"), Err(PhiError::Decryption(_))));
        assert!(matches!(open(&key, &sealed, b"mrn"), Err(PhiError::Decryption(_))));
    }

    #[test]
    fn test_truncated_input_rejected() {
        let key = KeyMaterial::generate();
        let short = URL_SAFE.encode([0u8; 8]);
        assert!(matches!(open(&key, &short, b""), Err(PhiError::Decryption(_))));
        assert!(matches!(open(&key, "not base64!!", b""), Err(PhiError::Decryption(_))));
    }

    #[test]
    fn test_key_material_debug_is_redacted() {
        let key = KeyMaterial::generate();
        assert_eq!(format!("{:?}", key), "KeyMaterial([REDACTED])");
    }

    #[test]
    fn test_key_material_base64_round_trip() {
        let key = KeyMaterial::generate();
        let restored = KeyMaterial::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, restored);
        assert!(KeyMaterial::from_slice(&[1u8; 16]).is_err());
    }
}
