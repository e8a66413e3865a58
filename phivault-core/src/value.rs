use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PhiError, Result};
use crate::fields::PhiFieldType;

/// Ciphertext format version written by this crate
pub const ENCRYPTION_VERSION: u32 = 1;

/// A self-describing encrypted field. Never mutated; re-encryption yields a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    /// base64 (URL-safe) of nonce || ciphertext || tag
    pub ciphertext: String,
    pub key_id: String,
    pub field_type: PhiFieldType,
    pub encrypted_at: DateTime<Utc>,
    pub version: u32,
}

impl EncryptedValue {
    /// Associated data binding the ciphertext to its key and field label
    pub(crate) fn associated_data(key_id: &str, field_type: PhiFieldType, version: u32) -> Vec<u8> {
        format!("{}|{}|v{}", key_id, field_type.as_str(), version).into_bytes()
    }

    pub(crate) fn aad(&self) -> Vec<u8> {
        Self::associated_data(&self.key_id, self.field_type, self.version)
    }

    /// Compact JSON form for storage next to other record fields
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let value: Self = serde_json::from_str(encoded)
            .map_err(|e| PhiError::InvalidEncryptedValue(e.to_string()))?;
        if value.version == 0 || value.version > ENCRYPTION_VERSION {
            return Err(PhiError::InvalidEncryptedValue(format!(
                "Unsupported version {}",
                value.version
            )));
        }
        if value.ciphertext.is_empty() || value.key_id.is_empty() {
            return Err(PhiError::InvalidEncryptedValue(
                "Missing ciphertext or key id".to_string(),
            ));
        }
        Ok(value)
    }

    /// Cheap check used by dictionary decryption to tell ciphertext from legacy plaintext
    pub fn looks_encrypted(candidate: &str) -> bool {
        candidate.trim_start().starts_with('{') && Self::decode(candidate).is_ok()
    }
}

/// Ciphertext plus the search token a caller stores alongside it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchableEncryptedValue {
    /// Encoded [`EncryptedValue`]
    pub encrypted_value: String,
    pub search_token: String,
    pub field_type: PhiFieldType,
    pub created_at: DateTime<Utc>,
}

impl SearchableEncryptedValue {
    pub fn encrypted(&self) -> Result<EncryptedValue> {
        EncryptedValue::decode(&self.encrypted_value)
    }
}
