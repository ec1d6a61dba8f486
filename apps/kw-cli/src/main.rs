use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use kw_vault::items::NewItem;
use kw_vault::{
    logging, Field, FieldType, ItemCategory, VaultConfig, VaultError, VaultService, VaultSettings,
    DEFAULT_VAULT_ID,
};
use tracing::debug;

#[derive(Parser)]
#[command(name = "kw")]
#[command(about = "Keyward local vault", long_about = None)]
struct Cli {
    /// Vault id to operate on
    #[arg(long, global = true, default_value = DEFAULT_VAULT_ID)]
    vault: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known vaults
    Vaults,

    /// Create a new vault
    Create {
        /// Display name
        #[arg(long, default_value = "My Vault")]
        name: String,
    },

    /// Show vault status
    Status,

    /// Export all items as CSV (contains plaintext secrets)
    Export {
        /// Output file; stdout when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Import items from a CSV file
    Import {
        file: PathBuf,
    },

    /// Add a login item; the item password is prompted for
    AddLogin {
        title: String,
        domain: String,
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Print decrypted logins matching a domain
    Autofill {
        domain: String,
    },

    /// Set the auto-lock timeout in minutes (0 disables)
    AutoLock {
        minutes: u32,
    },

    /// Permanently delete the vault
    Delete {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

fn prompt_password(prompt: &str) -> Result<String> {
    if let Ok(pw) = std::env::var("KW_VAULT_PASSWORD") {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    read_hidden(prompt)
}

fn read_hidden(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))
}

fn prompt_new_password() -> Result<String> {
    if let Ok(pw) = std::env::var("KW_VAULT_PASSWORD") {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    let first = read_hidden("New master password: ")?;
    if first.len() < 12 {
        bail!("password too short; minimum 12 characters");
    }
    let second = read_hidden("Confirm password: ")?;
    if first != second {
        bail!("passwords do not match");
    }
    Ok(first)
}

async fn unlock(service: &VaultService, vault_id: &str) -> Result<()> {
    let password = prompt_password("Master password: ")?;
    service.unlock(&password, vault_id).await?;
    Ok(())
}

/// Unlock, run one operation, lock again whatever the outcome.
async fn with_vault<T, F, Fut>(service: &VaultService, vault_id: &str, op: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, VaultError>>,
{
    unlock(service, vault_id).await?;
    let result = op().await;
    service.lock().await;
    Ok(result?)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let config = VaultConfig::from_env()?;
    debug!("data dir: {}", config.data_dir().display());
    let service = VaultService::new(config)?;
    let vault_id = cli.vault.as_str();

    match cli.command {
        Commands::Vaults => {
            println!("{}", serde_json::to_string_pretty(&service.list_vaults()?)?);
        }
        Commands::Create { name } => {
            let password = prompt_new_password()?;
            let created = service.create_vault(&password, &name, Some(vault_id)).await?;
            service.lock().await;
            println!("created vault '{}'", created.vault_id);
        }
        Commands::Status => {
            let status = service.get_status(Some(vault_id)).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Export { out } => {
            let csv = with_vault(&service, vault_id, || service.export_csv()).await?;
            match out {
                Some(path) => {
                    std::fs::write(&path, csv.as_bytes())
                        .with_context(|| format!("writing {}", path.display()))?;
                    eprintln!("exported to {}", path.display());
                }
                None => print!("{csv}"),
            }
        }
        Commands::Import { file } => {
            let csv = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let summary = with_vault(&service, vault_id, || service.import_csv(&csv)).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::AddLogin { title, domain, username } => {
            let secret = read_hidden("Item password: ")?;
            let mut fields = Vec::new();
            if let Some(username) = username {
                fields.push(Field {
                    key: "username".into(),
                    value: username,
                    encrypted: false,
                    field_type: FieldType::Text,
                });
            }
            fields.push(Field {
                key: "password".into(),
                value: secret,
                encrypted: true,
                field_type: FieldType::Password,
            });
            let input = NewItem {
                container_id: None,
                category: ItemCategory::Password,
                title,
                domain: Some(domain),
                fields,
                favorite: false,
            };
            let item = with_vault(&service, vault_id, || service.create_item(input)).await?;
            println!("added item {}", item.id);
        }
        Commands::Autofill { domain } => {
            let items =
                with_vault(&service, vault_id, || service.get_autofill_candidates(&domain)).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        Commands::AutoLock { minutes } => {
            let settings = with_vault(&service, vault_id, || {
                service.update_settings(VaultSettings { auto_lock_minutes: minutes })
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::Delete { yes } => {
            if !yes {
                bail!("refusing to delete vault '{vault_id}' without --yes");
            }
            unlock(&service, vault_id).await?;
            service.delete_vault(Some(vault_id)).await?;
            println!("deleted vault '{vault_id}'");
        }
    }
    Ok(())
}
