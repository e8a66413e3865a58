use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::DEFAULT_BUFFER_SIZE;
use crate::error::{PhiError, Result};
use crate::security::{KeyPolicy, RateLimitConfig};

/// Longest key lifetime accepted from configuration (ten years)
pub const MAX_VALIDITY_DAYS: u32 = 3650;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhiConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub rate_limits: RateLimitSettings,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub key_file: PathBuf,
    pub search_secret_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    pub validity_days: u32,
    pub rotation_warning_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub burst_window_secs: u64,
    pub burst_limit: u32,
    pub minute_limit: u32,
    pub hour_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub log_file: PathBuf,
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub level: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        let policy = KeyPolicy::default();
        Self {
            validity_days: policy.validity_days,
            rotation_warning_days: policy.rotation_warning_days,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            burst_window_secs: 5,
            burst_limit: 20,
            minute_limit: 100,
            hour_limit: 1000,
        }
    }
}

impl From<&KeyConfig> for KeyPolicy {
    fn from(config: &KeyConfig) -> Self {
        KeyPolicy {
            validity_days: config.validity_days,
            rotation_warning_days: config.rotation_warning_days,
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        RateLimitConfig {
            burst_window: Duration::from_secs(settings.burst_window_secs),
            burst_limit: settings.burst_limit,
            minute_limit: settings.minute_limit,
            hour_limit: settings.hour_limit,
            ..RateLimitConfig::default()
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("org", "phivault", "phivault")
}

/// Default location of the configuration file
pub fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("phivault.toml"))
}

fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl PhiConfig {
    /// Configuration with every file placed under `data_dir`
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            storage: StorageConfig {
                key_file: data_dir.join("keys").join("encryption_keys.json"),
                search_secret_file: data_dir.join("keys").join("search_secret.key"),
            },
            keys: KeyConfig::default(),
            rate_limits: RateLimitSettings::default(),
            audit: AuditConfig {
                log_file: data_dir.join("audit").join("decryptions.jsonl"),
                buffer_size: DEFAULT_BUFFER_SIZE,
            },
            logging: LoggingConfig {
                log_dir: data_dir.join("logs"),
                level: "info".to_string(),
            },
        }
    }

    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(default_config_path);

        let config_str = std::fs::read_to_string(&path).map_err(|e| {
            PhiError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: Self = toml::from_str(&config_str)
            .map_err(|e| PhiError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: Option<PathBuf>) -> Result<()> {
        let path = path.unwrap_or_else(default_config_path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                PhiError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config_str = toml::to_string_pretty(self)
            .map_err(|e| PhiError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&path, config_str)
            .map_err(|e| PhiError::Config(format!("Failed to write config file: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        let limits = &self.rate_limits;
        if limits.burst_window_secs == 0 {
            return Err(PhiError::Config("burst_window_secs must be positive".to_string()));
        }
        if limits.burst_limit == 0 || limits.minute_limit == 0 || limits.hour_limit == 0 {
            return Err(PhiError::Config("Rate limits must be positive".to_string()));
        }
        if limits.burst_limit > limits.minute_limit || limits.minute_limit > limits.hour_limit {
            return Err(PhiError::Config(
                "Rate limits must satisfy burst <= minute <= hour".to_string(),
            ));
        }

        if self.keys.validity_days == 0 {
            return Err(PhiError::Config("Key validity must be at least one day".to_string()));
        }
        if self.keys.validity_days > MAX_VALIDITY_DAYS {
            return Err(PhiError::Config(format!(
                "Key validity must not exceed {} days",
                MAX_VALIDITY_DAYS
            )));
        }
        if self.keys.rotation_warning_days >= self.keys.validity_days {
            return Err(PhiError::Config(
                "rotation_warning_days must be shorter than validity_days".to_string(),
            ));
        }

        if self.audit.buffer_size == 0 {
            return Err(PhiError::Config("Audit buffer size must be positive".to_string()));
        }
        if self.storage.key_file == self.storage.search_secret_file {
            return Err(PhiError::Config(
                "Key file and search secret file must differ".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for PhiConfig {
    fn default() -> Self {
        Self::with_data_dir(&default_data_dir())
    }
}
