//! phivault
//!
//! Operator tooling around the field-level PHI encryption core: logging
//! setup with PHI-safe sanitising and the key rotation watcher.

pub mod logging;
pub mod watcher;

// Re-export commonly used types
pub use phivault_core::{PhiConfig, PhiEncryptionService, PhiError};
pub use watcher::RotationWatcher;
