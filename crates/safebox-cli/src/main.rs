use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use safebox_core::headers::{content_security_policy, security_headers, CspOptions};
use safebox_core::paths::{data_dir, rate_limit_dir};
use safebox_core::rate_limit::{now_ms, FileBackend, RateLimiter};
use safebox_core::sanitize::{
    contains_xss, sanitize_html, sanitize_text, sanitize_value, validate_url, BASIC_ATTRIBUTES,
    BASIC_TAGS,
};
use safebox_core::{EncryptedStore, SafeboxConfig, SafeboxError};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const PASSWORD_ENV: &str = "SAFEBOX_PASSWORD";

#[derive(Parser, Debug)]
#[command(author, version, about = "Safebox encrypted local storage", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// User id; also the key-derivation salt
    #[arg(long, short, global = true, default_value = "default")]
    user: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt and store a value (JSON, or taken as a plain string)
    Set {
        key: String,
        value: String,
        #[arg(long = "type")]
        item_type: Option<String>,
        /// Strip markup from string fields before storing
        #[arg(long)]
        sanitize: bool,
    },
    /// Decrypt and print a value
    Get { key: String },
    /// Remove a value
    Rm { key: String },
    /// List keys
    Keys {
        #[arg(long = "type")]
        item_type: Option<String>,
    },
    /// Item count and plaintext sizes
    Stats,
    /// Remove every value
    Clear,
    /// Remove values not written for N days
    Prune {
        #[arg(long)]
        older_than_days: u32,
    },
    /// Validate a URL against the scheme allow-list
    CheckUrl { url: String },
    /// Sanitize text or HTML
    Sanitize {
        input: String,
        #[arg(long)]
        html: bool,
        #[arg(long)]
        max_length: Option<usize>,
    },
    /// Print the Content-Security-Policy
    Csp {
        #[arg(long)]
        allow_inline: bool,
        #[arg(long)]
        allow_eval: bool,
        /// Print the full security header set instead
        #[arg(long)]
        headers: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::CheckUrl { url } => check_url_command(&url),
        Commands::Sanitize {
            input,
            html,
            max_length,
        } => sanitize_command(&input, html, max_length),
        Commands::Csp {
            allow_inline,
            allow_eval,
            headers,
        } => csp_command(allow_inline, allow_eval, headers),
        command => store_command(cli.data_dir, &cli.user, command).await,
    }
}

async fn store_command(data_dir_override: Option<PathBuf>, user: &str, command: Commands) -> Result<()> {
    let data = match data_dir_override {
        Some(dir) => dir,
        None => data_dir()?,
    };
    std::fs::create_dir_all(&data)?;
    let config = SafeboxConfig::load_or_default(&data)?;
    let limiter = auth_limiter(&data, &config)?;
    ensure_not_locked(&limiter, user)?;

    let password = prompt_password("Safebox password: ")?;
    unlock_and_run(config, &limiter, user, &password, command).await
}

fn auth_limiter(data: &Path, config: &SafeboxConfig) -> Result<RateLimiter<FileBackend>> {
    Ok(RateLimiter::new(
        config.rate_limits.auth,
        FileBackend::new(rate_limit_dir(data))?,
    ))
}

/// Only failed decryptions count against the user; looking does not.
fn ensure_not_locked(limiter: &RateLimiter<FileBackend>, user: &str) -> Result<()> {
    let status = limiter.status(user);
    if !status.allowed {
        let wait_secs = status.reset_at.saturating_sub(now_ms()) / 1000 + 1;
        bail!("too many failed unlock attempts for {user}; retry in {wait_secs}s");
    }
    Ok(())
}

async fn unlock_and_run(
    config: SafeboxConfig,
    limiter: &RateLimiter<FileBackend>,
    user: &str,
    password: &str,
    command: Commands,
) -> Result<()> {
    let store = EncryptedStore::with_file_device(config.store);
    store.initialize(password, user).await?;
    let outcome = run_store_command(&store, limiter, user, command).await;
    store.close().await;
    outcome
}

async fn run_store_command(
    store: &EncryptedStore,
    limiter: &RateLimiter<FileBackend>,
    user: &str,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Set {
            key,
            value,
            item_type,
            sanitize,
        } => {
            let mut value: Value =
                serde_json::from_str(&value).unwrap_or(Value::String(value));
            if sanitize {
                value = sanitize_value(&value, None);
            }
            store.set_item(&key, &value, item_type.as_deref()).await?;
            info!(key = %key, "stored");
        }
        Commands::Get { key } => match store.get_item(&key).await {
            Ok(Some(value)) => {
                limiter.record_success(user)?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Ok(None) => bail!("no item named {key}"),
            Err(SafeboxError::Decryption(_)) => {
                limiter.check(user)?;
                warn!(user, "decryption failed; wrong password or different device");
                bail!("cannot decrypt {key}: wrong password or different device");
            }
            Err(e) => return Err(e.into()),
        },
        Commands::Rm { key } => store.remove_item(&key).await?,
        Commands::Keys { item_type } => {
            let keys = match item_type {
                Some(item_type) => store.keys_by_type(&item_type).await?,
                None => store.keys().await?,
            };
            for key in keys {
                println!("{key}");
            }
        }
        Commands::Stats => {
            let stats = store.get_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Clear => store.clear().await?,
        Commands::Prune { older_than_days } => {
            let cutoff =
                cutoff_ms(older_than_days).ok_or_else(|| anyhow!("cutoff out of range"))?;
            let removed = store.remove_updated_before(cutoff).await?;
            println!("removed {removed} item(s)");
        }
        other => bail!("{other:?} does not use the store"),
    }
    Ok(())
}

fn cutoff_ms(days: u32) -> Option<i64> {
    let window = i64::from(days).checked_mul(24 * 60 * 60 * 1000)?;
    i64::try_from(now_ms()).ok()?.checked_sub(window)
}

fn check_url_command(url: &str) -> Result<()> {
    let normalized = validate_url(url)?;
    println!("{normalized}");
    Ok(())
}

fn sanitize_command(input: &str, html: bool, max_length: Option<usize>) -> Result<()> {
    if contains_xss(input) {
        warn!("input matches an XSS pattern");
    }
    let output = if html {
        sanitize_html(input, BASIC_TAGS, BASIC_ATTRIBUTES, max_length)
    } else {
        sanitize_text(input, max_length)
    };
    println!("{output}");
    Ok(())
}

fn csp_command(allow_inline: bool, allow_eval: bool, headers: bool) -> Result<()> {
    let options = CspOptions {
        allow_unsafe_inline: allow_inline,
        allow_unsafe_eval: allow_eval,
        ..CspOptions::default()
    };
    if !headers {
        println!("{}", content_security_policy(&options));
        return Ok(());
    }
    for (name, value) in security_headers(&options) {
        println!("{name}: {value}");
    }
    Ok(())
}

fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    if pw.is_empty() {
        bail!("password must not be empty");
    }
    Ok(Zeroizing::new(pw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn run(data: &Path, user: &str, password: &str, command: Commands) -> Result<()> {
        let config = SafeboxConfig::load_or_default(data)?;
        let limiter = auth_limiter(data, &config)?;
        ensure_not_locked(&limiter, user)?;
        unlock_and_run(config, &limiter, user, password, command).await
    }

    fn set(key: &str, value: &str) -> Commands {
        Commands::Set {
            key: key.into(),
            value: value.into(),
            item_type: None,
            sanitize: false,
        }
    }

    fn get(key: &str) -> Commands {
        Commands::Get { key: key.into() }
    }

    #[tokio::test]
    async fn correct_password_is_never_locked_out() {
        let dir = tempdir().unwrap();
        run(dir.path(), "alice", "correct-horse", set("k", "1")).await.unwrap();
        for _ in 0..8 {
            run(dir.path(), "alice", "correct-horse", Commands::Stats).await.unwrap();
        }
        run(dir.path(), "alice", "correct-horse", Commands::Keys { item_type: None })
            .await
            .unwrap();
        run(dir.path(), "alice", "correct-horse", get("k")).await.unwrap();
    }

    #[tokio::test]
    async fn failed_decryptions_lock_the_user() {
        let dir = tempdir().unwrap();
        run(dir.path(), "alice", "correct-horse", set("k", "1")).await.unwrap();

        for _ in 0..5 {
            let err = run(dir.path(), "alice", "wrong", get("k")).await.unwrap_err();
            assert!(err.to_string().contains("cannot decrypt"), "{err}");
        }
        let locked = run(dir.path(), "alice", "correct-horse", get("k")).await.unwrap_err();
        assert!(locked.to_string().contains("too many failed unlock attempts"), "{locked}");

        // other users are unaffected
        run(dir.path(), "bob", "pw", Commands::Stats).await.unwrap();
    }

    #[tokio::test]
    async fn successful_read_forgives_earlier_failures() {
        let dir = tempdir().unwrap();
        run(dir.path(), "alice", "correct-horse", set("k", "1")).await.unwrap();
        for _ in 0..4 {
            assert!(run(dir.path(), "alice", "wrong", get("k")).await.is_err());
        }
        run(dir.path(), "alice", "correct-horse", get("k")).await.unwrap();
        for _ in 0..4 {
            assert!(run(dir.path(), "alice", "wrong", get("k")).await.is_err());
        }
        run(dir.path(), "alice", "correct-horse", get("k")).await.unwrap();
    }

    #[test]
    fn prune_cutoff() {
        let cutoff = cutoff_ms(1).unwrap();
        let now = i64::try_from(now_ms()).unwrap();
        assert!((now - cutoff - 86_400_000).abs() < 1_000);
    }
}
