pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fields;
pub mod security;
pub mod service;
pub mod value;

// Re-export error types
pub use error::{ErrorSeverity, PhiError, Result};

// Re-export common types and traits
pub use audit::{AuditSink, AuditStats, DecryptionAuditEntry, DecryptionAuditLog};
pub use config::PhiConfig;
pub use fields::{PhiFieldType, SensitivityTier};
pub use security::{
    DecryptionRateLimiter, FileKeyStore, HmacSearchService, KeyManager, KeyPolicy, KeyStatus,
    KeyStore, MemoryKeyStore, RateLimitConfig,
};
pub use service::{PhiEncryptionService, RotationOutcome, REENCRYPT_PRINCIPAL};
pub use value::{EncryptedValue, SearchableEncryptedValue};
