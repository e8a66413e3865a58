use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::crypto::KeyMaterial;
use crate::error::Result;

/// A data-encryption key and its lifecycle state
#[derive(Debug, Clone)]
pub struct EncryptionKey {
    pub key_id: String,
    pub key_material: KeyMaterial,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub rotation_count: u32,
}

impl EncryptionKey {
    /// Create a fresh, inactive key valid for `validity_days`
    pub fn generate(validity_days: u32, rotation_count: u32) -> Self {
        let now = Utc::now();
        Self {
            key_id: format!("phk_{}", Uuid::new_v4().simple()),
            key_material: KeyMaterial::generate(),
            created_at: now,
            expires_at: ChronoDuration::try_days(validity_days as i64)
                .and_then(|validity| now.checked_add_signed(validity))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            is_active: false,
            rotation_count,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn metadata(&self) -> KeyMetadata {
        KeyMetadata {
            key_id: self.key_id.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            is_active: self.is_active,
            rotation_count: self.rotation_count,
            is_expired: self.is_expired(),
        }
    }
}

/// Listing view of a key; carries no key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub rotation_count: u32,
    pub is_expired: bool,
}

/// Persisted form of a single key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKey {
    pub key_id: String,
    /// base64 (URL-safe) of the raw key bytes
    pub key_material: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub rotation_count: u32,
}

impl From<&EncryptionKey> for StoredKey {
    fn from(key: &EncryptionKey) -> Self {
        Self {
            key_id: key.key_id.clone(),
            key_material: key.key_material.to_base64(),
            created_at: key.created_at,
            expires_at: key.expires_at,
            is_active: key.is_active,
            rotation_count: key.rotation_count,
        }
    }
}

impl StoredKey {
    pub fn to_key(&self) -> Result<EncryptionKey> {
        Ok(EncryptionKey {
            key_id: self.key_id.clone(),
            key_material: KeyMaterial::from_base64(&self.key_material)?,
            created_at: self.created_at,
            expires_at: self.expires_at,
            is_active: self.is_active,
            rotation_count: self.rotation_count,
        })
    }
}

/// On-disk key file: `{keys, active_key_id, last_updated}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub keys: BTreeMap<String, StoredKey>,
    pub active_key_id: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Operator-facing summary of the key ring
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub active_key_id: Option<String>,
    pub active_created_at: Option<DateTime<Utc>>,
    pub active_expires_at: Option<DateTime<Utc>>,
    pub days_until_expiry: Option<i64>,
    pub rotation_count: u32,
    pub total_keys: usize,
    pub retired_keys: usize,
    pub needs_rotation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_expires_after_validity() {
        let key = EncryptionKey::generate(90, 0);
        assert_eq!((key.expires_at - key.created_at).num_days(), 90);
        assert!(!key.is_active);
        assert!(!key.is_expired());
    }

    #[test]
    fn test_unrepresentable_validity_saturates() {
        let key = EncryptionKey::generate(u32::MAX, 0);
        assert_eq!(key.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!key.is_expired());
    }
}
