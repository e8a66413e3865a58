use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use phivault::logging::init_logging;
use phivault::{phi_error, phi_info, RotationWatcher};
use phivault_core::config::default_config_path;
use phivault_core::security::{generate_search_secret, FileKeyStore, KeyStore};
use phivault_core::{EncryptedValue, PhiConfig, PhiEncryptionService, PhiFieldType};

#[derive(Parser)]
#[command(author, version, about = "Field-level PHI encryption operator tool")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and generate the first key
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },
    /// Generate a default configuration file
    Config {
        /// Output path (defaults to the platform config dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Encrypt a value and print the encoded ciphertext
    Encrypt {
        /// Field type, e.g. ssn, email, clinical_note
        #[arg(short, long)]
        field: PhiFieldType,
        /// Also print a search token
        #[arg(long)]
        searchable: bool,
        value: String,
    },
    /// Decrypt an encoded value (audited and rate limited)
    Decrypt {
        /// Principal the decryption is performed for
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        record: Option<String>,
        #[arg(long)]
        ip: Option<String>,
        /// Encoded value as printed by `encrypt`
        encrypted: String,
    },
    /// Print the search token for a value
    Token {
        #[arg(short, long)]
        field: PhiFieldType,
        value: String,
    },
    /// Check a value against a search token
    VerifyToken {
        #[arg(short, long)]
        field: PhiFieldType,
        value: String,
        token: String,
    },
    /// Retire the active key and activate a new one
    Rotate,
    /// Show active key status
    Status,
    /// List key metadata
    Keys,
    /// Summarise recent decryptions
    AuditStats {
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Replace the search-token secret. Every stored token becomes useless.
    RotateSearchSecret {
        /// Confirm that all existing search tokens will be invalidated
        #[arg(long)]
        invalidate_tokens: bool,
    },
    /// Rotate the key whenever it enters its warning window, until Ctrl-C
    Watch {
        #[arg(long, default_value_t = 3600)]
        interval_secs: u64,
    },
}

fn setup_logging(config: &PhiConfig, override_level: Option<&str>) -> Option<WorkerGuard> {
    let level = override_level.unwrap_or(&config.logging.level);
    match init_logging(config.logging.log_dir.clone(), level) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: Failed to initialize file logging: {}", e);
            eprintln!("Continuing with console-only logging...");
            let _ = tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(tracing_subscriber::EnvFilter::new(level))
                .try_init();
            None
        }
    }
}

fn load_config(path: &Option<PathBuf>) -> Result<PhiConfig> {
    PhiConfig::load(path.clone()).with_context(|| {
        format!(
            "Failed to load configuration (run `phivault init` to create {})",
            path.clone().unwrap_or_else(default_config_path).display()
        )
    })
}

fn open_service(config: &PhiConfig) -> Result<Arc<PhiEncryptionService>> {
    let service = PhiEncryptionService::from_config(config)
        .context("Failed to initialise the PHI encryption service")?;
    Ok(Arc::new(service))
}

fn warn_per_process_state() {
    warn!(
        "Rate-limit and audit-statistics state is held per process; \
         multi-instance deployments must share it externally"
    );
}

async fn handle_command(command: Commands, config_path: Option<PathBuf>, config: PhiConfig) -> Result<()> {
    match command {
        Commands::Init { force } => init(config_path, config, force),
        Commands::Config { output } => {
            let path = output.unwrap_or_else(default_config_path);
            config.save(Some(path.clone()))?;
            println!("📝 Configuration file created at: {}", path.display());
            Ok(())
        }
        Commands::Encrypt { field, searchable, value } => {
            let service = open_service(&config)?;
            if searchable {
                let sealed = service.encrypt_searchable_value(&value, field)?;
                println!("{}", serde_json::to_string_pretty(&sealed)?);
            } else {
                println!("{}", service.encrypt_phi(&value, field)?.encode()?);
            }
            Ok(())
        }
        Commands::Decrypt { user, record, ip, encrypted } => {
            warn_per_process_state();
            let service = open_service(&config)?;
            let value = EncryptedValue::decode(&encrypted)?;
            match service.decrypt_phi(&value, &user, record.as_deref(), ip.as_deref()) {
                Ok(plaintext) => {
                    println!("{}", plaintext);
                    Ok(())
                }
                Err(e) => {
                    phi_error!("Decryption for {} failed: {}", user, e);
                    Err(e.into())
                }
            }
        }
        Commands::Token { field, value } => {
            let service = open_service(&config)?;
            println!("{}", service.create_search_token(&value, field)?);
            Ok(())
        }
        Commands::VerifyToken { field, value, token } => {
            let service = open_service(&config)?;
            if service.verify_search_token(&value, &token, field) {
                println!("{}", "✅ Token matches".bright_green());
                Ok(())
            } else {
                bail!("Token does not match");
            }
        }
        Commands::Rotate => {
            let service = open_service(&config)?;
            let outcome = service.rotate_key()?;
            println!("🔄 {}", "Key rotated".bright_green().bold());
            println!(
                "   Old key: {}",
                outcome.old_key_id.as_deref().unwrap_or("none").dimmed()
            );
            println!("   New key: {}", outcome.new_key_id.bright_cyan());
            println!("   Rotation #{}", outcome.rotation_count);
            Ok(())
        }
        Commands::Status => {
            let service = open_service(&config)?;
            print_status(&service);
            Ok(())
        }
        Commands::Keys => {
            let service = open_service(&config)?;
            for key in service.list_keys() {
                let state = if key.is_active {
                    "active".bright_green()
                } else if key.is_expired {
                    "expired".bright_red()
                } else {
                    "retired".yellow()
                };
                println!(
                    "{}  {:8}  created {}  expires {}",
                    key.key_id,
                    state,
                    key.created_at.format("%Y-%m-%d"),
                    key.expires_at.format("%Y-%m-%d")
                );
            }
            Ok(())
        }
        Commands::AuditStats { hours } => {
            warn_per_process_state();
            let service = open_service(&config)?;
            let stats = service.get_audit_stats(hours);
            println!("📊 {} (last {}h)", "Decryption audit".bright_blue().bold(), stats.hours);
            println!("   Total:      {}", stats.total);
            println!("   Successful: {}", stats.successful.to_string().bright_green());
            println!("   Failed:     {}", stats.failed.to_string().bright_red());
            for (field, count) in &stats.by_field_type {
                println!("   {:<18} {}", field, count);
            }
            if !stats.top_users.is_empty() {
                println!("   Top users:");
                for user in &stats.top_users {
                    println!("     {:<24} {}", user.user_id, user.decryptions);
                }
            }
            Ok(())
        }
        Commands::RotateSearchSecret { invalidate_tokens } => {
            if !invalidate_tokens {
                bail!(
                    "Rotating the search secret invalidates every stored search token; \
                     re-run with --invalidate-tokens and re-tokenize all records afterwards"
                );
            }
            let store = FileKeyStore::new(
                config.storage.key_file.clone(),
                config.storage.search_secret_file.clone(),
            );
            store.save_search_secret(&generate_search_secret())?;
            warn!("Search secret rotated; existing search tokens no longer match");
            println!("{}", "⚠️  Search secret replaced. Re-tokenize all searchable fields.".yellow());
            Ok(())
        }
        Commands::Watch { interval_secs } => {
            if interval_secs == 0 {
                bail!("--interval-secs must be positive");
            }
            warn_per_process_state();
            let service = open_service(&config)?;
            let watcher = RotationWatcher::new(service, Duration::from_secs(interval_secs));
            info!(interval_secs, "Rotation watcher started");

            let rotations = watcher
                .run(async {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received shutdown signal");
                    }
                })
                .await;
            phi_info!("Rotation watcher stopped after {} rotation(s)", rotations);
            Ok(())
        }
    }
}

fn init(config_path: Option<PathBuf>, config: PhiConfig, force: bool) -> Result<()> {
    println!("🚀 Initializing phivault...");
    let path = config_path.unwrap_or_else(default_config_path);
    if path.exists() && !force {
        println!("   Using existing configuration at {}", path.display());
    } else {
        config.save(Some(path.clone()))?;
        println!("📝 Configuration file created at: {}", path.display());
    }

    let service = open_service(&config)?;
    if service.get_key_status().active_key_id.is_none() {
        let outcome = service.rotate_key()?;
        println!("🔐 Generated encryption key {}", outcome.new_key_id.bright_cyan());
    }
    print_status(&service);
    Ok(())
}

fn print_status(service: &PhiEncryptionService) {
    let status = service.get_key_status();
    println!("🔑 {}", "Key status".bright_blue().bold());
    match &status.active_key_id {
        Some(id) => println!("   Active key:   {}", id.bright_cyan()),
        None => println!("   Active key:   {}", "none".bright_red()),
    }
    if let Some(expires) = status.active_expires_at {
        println!(
            "   Expires:      {} ({} days)",
            expires.format("%Y-%m-%d %H:%M:%S UTC"),
            status.days_until_expiry.unwrap_or(0)
        );
    }
    println!("   Rotations:    {}", status.rotation_count);
    println!("   Keys held:    {} ({} retired)", status.total_keys, status.retired_keys);
    if status.needs_rotation {
        println!("   {}", "⚠️  Rotation due".yellow());
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // init and config create the file, everything else needs it
    let config = match &cli.command {
        Commands::Init { .. } | Commands::Config { .. } => match &cli.config {
            Some(path) if path.exists() => load_config(&cli.config)?,
            None if default_config_path().exists() => load_config(&None)?,
            _ => PhiConfig::default(),
        },
        _ => load_config(&cli.config)?,
    };

    // Keep guard alive for duration of program
    let _log_guard = setup_logging(&config, cli.log_level.as_deref());
    info!("phivault starting up...");

    handle_command(cli.command, cli.config, config).await
}
