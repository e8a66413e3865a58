mod types;
pub mod key_manager;
pub mod key_store;
pub mod rate_limiter;
pub mod search;

// Re-export common types
pub use key_manager::{KeyManager, KeyPolicy};
pub use key_store::{FileKeyStore, KeyStore, MemoryKeyStore};
pub use rate_limiter::{DecryptionRateLimiter, RateLimitConfig, RateLimitDenial, RateLimitSlot, RateLimitStats};
pub use search::{generate_search_secret, HmacSearchService};
pub use types::{EncryptionKey, KeyFile, KeyMetadata, KeyStatus, StoredKey};
