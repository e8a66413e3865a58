use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhiError {
    /// The ciphertext references a key the store does not hold.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Authentication or decoding of the ciphertext failed.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// The key set could not be persisted; in-memory state is unchanged.
    #[error("Key rotation failed: {0}")]
    KeyRotation(String),

    #[error("Decryption rate limit exceeded for {user_id}: {limit} per {window}")]
    RateLimitExceeded {
        user_id: String,
        window: String,
        limit: u32,
    },

    #[error("Refusing to encrypt an empty value")]
    EmptyPlaintext,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Unknown PHI field type: {0}")]
    InvalidFieldType(String),

    #[error("Malformed encrypted value: {0}")]
    InvalidEncryptedValue(String),

    #[error("Key storage error: {0}")]
    Storage(String),

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PhiError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::KeyNotFound(_) => ErrorSeverity::Critical,
            Self::KeyRotation(_) => ErrorSeverity::Critical,
            Self::Audit(_) => ErrorSeverity::Critical,
            Self::Decryption(_) => ErrorSeverity::High,
            Self::RateLimitExceeded { .. } => ErrorSeverity::High,
            Self::Encryption(_) => ErrorSeverity::High,
            Self::Storage(_) => ErrorSeverity::High,
            Self::InvalidEncryptedValue(_) => ErrorSeverity::Medium,
            Self::Io(_) => ErrorSeverity::Medium,
            Self::Json(_) => ErrorSeverity::Medium,
            Self::Config(_) => ErrorSeverity::Medium,
            Self::EmptyPlaintext => ErrorSeverity::Low,
            Self::InvalidFieldType(_) => ErrorSeverity::Low,
        }
    }

    /// Short machine-readable label, used as the audit `error_message` prefix.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KeyNotFound(_) => "key_not_found",
            Self::Decryption(_) => "decryption_failed",
            Self::KeyRotation(_) => "key_rotation_failed",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::EmptyPlaintext => "empty_plaintext",
            Self::Encryption(_) => "encryption_failed",
            Self::InvalidFieldType(_) => "invalid_field_type",
            Self::InvalidEncryptedValue(_) => "invalid_encrypted_value",
            Self::Storage(_) => "storage_error",
            Self::Audit(_) => "audit_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::Low => write!(f, "LOW"),
        }
    }
}

pub type Result<T> = std::result::Result<T, PhiError>;
