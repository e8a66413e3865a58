use anyhow::Result;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging: a JSON file layer under `log_dir` plus a human console layer on stderr.
///
/// PHI never reaches these sinks from the core; anything the CLI formats
/// itself goes through [`sanitize_for_logging`] via the `phi_*` macros.
///
/// The returned guard flushes the file writer on drop and must be kept
/// alive for the duration of the program.
pub fn init_logging(log_dir: PathBuf, log_level: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("phivault")
        .filename_suffix("log")
        .max_log_files(14)
        .build(log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let level = parse_level(log_level);

    // RUST_LOG wins over the configured level
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // stdout is reserved for command output
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    tracing::info!("Logging initialized at level: {}", level);

    Ok(guard)
}

pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn redaction_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            // Secret-bearing fields in key=value or JSON form
            (
                r#"(?i)"?\b(key_material|encryption_key|api_key|search_token|secret|token|password)"?\s*[:=]\s*"?[^",\s}]+"?"#,
                "$1=[REDACTED]",
            ),
            // Base64 / hex blobs long enough to be key material or tokens
            (r"[A-Za-z0-9+/_-]{32,}={0,2}", "[REDACTED_KEY]"),
            (r"\b\d{3}-\d{2}-\d{4}\b", "[REDACTED_SSN]"),
            (
                r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b",
                "[REDACTED_EMAIL]",
            ),
            (
                r"(?:\+\d{1,3}[\s.-]?)?\(?\b\d{3}\)?[\s.-]?\d{3}[\s.-]\d{4}\b",
                "[REDACTED_PHONE]",
            ),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(pattern).ok().map(|re| (re, replacement))
        })
        .collect()
    })
}

/// Mask PHI and secrets in a message before it is logged
///
/// Masked: secret-bearing fields (`key`, `secret`, `token`, `password`),
/// base64 or hex blobs of 32+ characters, SSNs, e-mail addresses and
/// North-American style phone numbers.
pub fn sanitize_for_logging(input: &str) -> String {
    redaction_rules()
        .iter()
        .fold(input.to_string(), |text, (re, replacement)| {
            re.replace_all(&text, *replacement).into_owned()
        })
}

/// Macro to log with automatic sanitization
///
/// Usage: `phi_info!("Decrypted record for {}", user_id);`
#[macro_export]
macro_rules! phi_info {
    ($($arg:tt)*) => {
        tracing::info!("{}", $crate::logging::sanitize_for_logging(&format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! phi_debug {
    ($($arg:tt)*) => {
        tracing::debug!("{}", $crate::logging::sanitize_for_logging(&format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! phi_warn {
    ($($arg:tt)*) => {
        tracing::warn!("{}", $crate::logging::sanitize_for_logging(&format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! phi_error {
    ($($arg:tt)*) => {
        tracing::error!("{}", $crate::logging::sanitize_for_logging(&format!($($arg)*)))
    };
}
