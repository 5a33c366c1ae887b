use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lockbox_core::audit::AuditStatus;
use lockbox_core::clock::SystemClock;
use lockbox_core::crypto::RustCryptoProvider;
use lockbox_core::paths::VaultPaths;
use lockbox_core::rate_limit::LockStatus;
use lockbox_core::store::FileStore;
use lockbox_core::{BootReport, Guard, GuardConfig, LockboxError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(
    name = "lockbox",
    version,
    about = "Password gate for the local lockbox vault",
    long_about = None
)]
struct Cli {
    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show protection, lockout and session state
    Status,
    /// Protect the vault with a password
    SetPassword,
    /// Log in, optionally remembering the session for 24h
    Login {
        #[arg(long)]
        remember: bool,
    },
    /// Forget the current session
    Logout,
    /// Replace the password; remembered sessions are signed out
    ChangePassword,
    /// Disable password protection
    RemovePassword,
    /// Turn folder encryption at rest on or off
    Encryption {
        #[arg(value_enum)]
        state: Toggle,
    },
    #[command(subcommand)]
    Folders(FolderCommands),
}

#[derive(Subcommand, Debug)]
enum FolderCommands {
    /// Print stored folders as JSON
    Show,
    /// Replace stored folders with the JSON array in FILE
    Import { file: PathBuf },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    On,
    Off,
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
    let guard = open_guard(cli.data_dir.as_deref()).await?;
    let report = guard.boot().await?;
    if report.audit.status == AuditStatus::Anomaly {
        eprintln!("warning: security state changed since the last run; check the logs");
    }

    match cli.command {
        Commands::Status => status(&guard, &report).await,
        Commands::SetPassword => {
            let password = prompt_password_twice("New password: ", PASSWORD_ENV)?;
            guard.set_password(&password).await?;
            println!("Password protection enabled");
            Ok(())
        }
        Commands::Login { remember } => {
            let password = prompt_password_once("Password: ")?;
            guard.login(&password, remember).await.map_err(explain)?;
            println!("Logged in{}", if remember { " (remembered for 24h)" } else { "" });
            Ok(())
        }
        Commands::Logout => {
            guard.logout().await?;
            println!("Logged out");
            Ok(())
        }
        Commands::ChangePassword => {
            let current = prompt_password_once("Current password: ")?;
            let new = prompt_password_twice("New password: ", NEW_PASSWORD_ENV)?;
            guard
                .change_password(&current, &new)
                .await
                .map_err(explain)?;
            println!("Password changed; remembered sessions were signed out");
            Ok(())
        }
        Commands::RemovePassword => {
            let current = prompt_password_once("Current password: ")?;
            guard.remove_password(&current).await.map_err(explain)?;
            println!("Password protection removed");
            Ok(())
        }
        Commands::Encryption { state } => {
            unlock(&guard, &report).await?;
            let enabled = matches!(state, Toggle::On);
            guard.set_encryption_enabled(enabled).await?;
            println!("Folder encryption {}", if enabled { "on" } else { "off" });
            Ok(())
        }
        Commands::Folders(FolderCommands::Show) => {
            unlock(&guard, &report).await?;
            let folders = guard.load_folders().await?;
            println!("{}", serde_json::to_string_pretty(&folders)?);
            Ok(())
        }
        Commands::Folders(FolderCommands::Import { file }) => {
            unlock(&guard, &report).await?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("read {}", file.display()))?;
            let folders: Vec<serde_json::Value> =
                serde_json::from_slice(&bytes).context("expected a JSON array of folders")?;
            guard.save_folders(&folders).await?;
            println!("Imported {} folders", folders.len());
            Ok(())
        }
    }
}

async fn open_guard(data_dir: Option<&Path>) -> Result<Guard> {
    let paths = match data_dir {
        Some(dir) => VaultPaths::in_dir(dir),
        None => VaultPaths::default_location()?,
    };
    debug!(
        store = %paths.store.display(),
        session = %paths.session.display(),
        "opening lockbox"
    );
    let store = FileStore::open(paths.store, Some(paths.session)).await?;
    let device = FileStore::open(paths.device, None).await?;
    let config = GuardConfig::load(&paths.config)?;
    Ok(Guard::open(
        Arc::new(store),
        &device,
        Arc::new(RustCryptoProvider),
        Arc::new(SystemClock),
        &config,
    )
    .await?)
}

async fn status(guard: &Guard, report: &BootReport) -> Result<()> {
    println!("Device ID:   {}", guard.device_id());
    println!("Boot count:  {}", report.audit.boot_count);
    println!("Protected:   {}", report.protected);
    println!(
        "Encryption:  {}",
        if guard.folders().is_encryption_enabled().await? { "on" } else { "off" }
    );
    match guard.rate_limiter().status().await? {
        LockStatus::Open => println!("Lockout:     none"),
        LockStatus::Locked { wait_secs } => println!("Lockout:     {wait_secs}s remaining"),
    }
    println!("Session:     {}", if report.session_restored { "remembered" } else { "none" });
    Ok(())
}

/// Prompt for the password unless the vault is open or a remembered session
/// is still valid.
async fn unlock(guard: &Guard, report: &BootReport) -> Result<()> {
    if !report.protected || report.session_restored {
        return Ok(());
    }
    let password = prompt_password_once("Password: ")?;
    guard.verify_password(&password).await.map_err(explain)
}

fn explain(err: LockboxError) -> anyhow::Error {
    match err {
        LockboxError::AuthFailure { remaining_attempts: 0 } => {
            anyhow!("incorrect password; too many failures, login is now locked")
        }
        LockboxError::IntegrityFailure => anyhow!(
            "security alert: stored credential failed its integrity check; access denied"
        ),
        other => other.into(),
    }
}

/// Current password for non-interactive use.
const PASSWORD_ENV: &str = "LOCKBOX_PASSWORD";
/// Replacement password for `change-password`.
const NEW_PASSWORD_ENV: &str = "LOCKBOX_NEW_PASSWORD";

/// Reads `var`, and `{var}_CONFIRM` when set, which must match.
fn password_from_env(var: &str) -> Result<Option<Zeroizing<String>>> {
    let Some(pw) = std::env::var(var).ok().filter(|pw| !pw.is_empty()) else {
        return Ok(None);
    };
    let pw = Zeroizing::new(pw);
    check_confirmation(&pw, std::env::var(format!("{var}_CONFIRM")).ok())?;
    Ok(Some(pw))
}

fn check_confirmation(pw: &str, confirm: Option<String>) -> Result<()> {
    match confirm.map(Zeroizing::new) {
        Some(confirm) if *confirm != pw => Err(anyhow!("password confirmation mismatch")),
        _ => Ok(()),
    }
}

fn prompt_password_once(prompt: &str) -> Result<Zeroizing<String>> {
    if let Some(pw) = password_from_env(PASSWORD_ENV)? {
        return Ok(pw);
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    Ok(Zeroizing::new(pw))
}

/// `env` names the variable that answers this prompt non-interactively.
fn prompt_password_twice(prompt: &str, env: &str) -> Result<Zeroizing<String>> {
    if let Some(pw) = password_from_env(env)? {
        return Ok(pw);
    }
    let first = Zeroizing::new(
        rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?,
    );
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm password: ")
            .map_err(|e| anyhow!("password prompt: {e}"))?,
    );
    if *first != *second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}
