use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trustvault_core::migration::{stored_version, CURRENT_VERSION};
use trustvault_core::paths::data_dir;
use trustvault_core::{KeyManager, KeyStoreConfig, StoreWatcher};
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(author, version, about = "OTR identity key and trust store", long_about = None)]
struct Cli {
    /// Directory holding the key store (defaults to the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or open the store and bring its schema up to date
    Init,
    /// Generate a local identity key pair for an account
    Keygen { account: String },
    /// Print the local fingerprint of an account
    Fingerprint { account: String },
    /// Show the fingerprint and trust state of a remote endpoint
    Remote {
        /// user@host/resource
        user: String,
    },
    /// Mark a remote endpoint's current key as verified
    Verify { user: String },
    /// Withdraw verification of a remote endpoint's current key
    Unverify { user: String },
    /// Re-encrypt the whole store under a transfer password
    Export { path: PathBuf },
    /// Merge a transferred store into this one
    Import {
        path: PathBuf,
        /// Replace entries that already exist locally
        #[arg(long)]
        overwrite: bool,
        /// Delete the source file after a successful import
        #[arg(long)]
        delete: bool,
    },
    /// Keep the store open and follow changes made by other processes
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let dir = match cli.data_dir {
        Some(dir) => dir,
        None => data_dir()?,
    };
    std::fs::create_dir_all(&dir)?;

    let password = prompt_password("Key store password: ")?;
    let config = KeyStoreConfig::load(&dir, &password)?;
    let manager = KeyManager::open(&config)?;

    match cli.command {
        Commands::Init => {
            let version = stored_version(manager.store())
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".into());
            println!("Key store: {}", manager.store().path().display());
            println!("Schema version: {version} (current {CURRENT_VERSION})");
        }
        Commands::Keygen { account } => match manager.generate_local_key_pair(&account)? {
            Some(fp) => println!("{account}: {}", fp.to_human()),
            None => return Err(anyhow!("key generation unavailable")),
        },
        Commands::Fingerprint { account } => match manager.local_fingerprint(&account) {
            Some(fp) => println!("{account}: {}", fp.to_human()),
            None => return Err(anyhow!("no local key for {account}")),
        },
        Commands::Remote { user } => match manager.remote_fingerprint(&user) {
            Some(fp) => {
                let state = if manager.is_verified_user(&user) {
                    "verified"
                } else {
                    "unverified"
                };
                println!("{user}: {} ({state})", fp.to_human());
            }
            None => return Err(anyhow!("no known key for {user}")),
        },
        Commands::Verify { user } => report_change(&user, manager.verify_user(&user)?, "verified"),
        Commands::Unverify { user } => {
            report_change(&user, manager.unverify_user(&user)?, "unverified")
        }
        Commands::Export { path } => {
            let transfer = prompt_password("Transfer password: ")?;
            let confirm = prompt_password("Confirm transfer password: ")?;
            if *transfer != *confirm {
                return Err(anyhow!("passwords do not match"));
            }
            manager.store().export(&transfer, &path)?;
            println!("Exported to {}", path.display());
        }
        Commands::Import {
            path,
            overwrite,
            delete,
        } => {
            let transfer = prompt_password("Transfer password: ")?;
            let summary = manager.store().import(&path, &transfer, overwrite, delete)?;
            println!(
                "Imported {} entries, kept {} existing",
                summary.imported, summary.skipped
            );
        }
        Commands::Watch => {
            let _watcher = StoreWatcher::spawn(Arc::clone(manager.store()))?;
            info!("watching {}, Ctrl-C to stop", manager.store().path().display());
            signal::ctrl_c().await?;
            info!("stopping");
        }
    }
    Ok(())
}

fn report_change(user: &str, changed: bool, state: &str) {
    if changed {
        println!("{user}: now {state}");
    } else {
        println!("{user}: unchanged");
    }
}

fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("TRUSTVAULT_PASSWORD") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    Ok(Zeroizing::new(pw))
}
