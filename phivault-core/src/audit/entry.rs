use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::fields::PhiFieldType;

/// One decryption attempt. Written once, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionAuditEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub field_type: PhiFieldType,
    pub key_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DecryptionAuditEntry {
    pub fn success(
        user_id: &str,
        field_type: PhiFieldType,
        key_id: &str,
        record_id: Option<&str>,
        client_ip: Option<&str>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            field_type,
            key_id: key_id.to_string(),
            record_id: record_id.map(str::to_string),
            client_ip: client_ip.map(str::to_string),
            success: true,
            error_message: None,
        }
    }

    pub fn failure(
        user_id: &str,
        field_type: PhiFieldType,
        key_id: &str,
        record_id: Option<&str>,
        client_ip: Option<&str>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error_message: Some(error_message.into()),
            ..Self::success(user_id, field_type, key_id, record_id, client_ip)
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserActivity {
    pub user_id: String,
    pub decryptions: usize,
}

/// Aggregates over a trailing window of audit entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub hours: u32,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub by_user: BTreeMap<String, usize>,
    pub by_field_type: BTreeMap<String, usize>,
    pub top_users: Vec<UserActivity>,
}
