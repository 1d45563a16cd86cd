//! gpt-meter CLI binary.
//!
//! Metering proxy for OpenAI-compatible completion APIs.
//!
//! # Commands
//!
//! - `serve` - Run the metering proxy
//! - `list-users` - List users and their keys
//! - `set-user-key` - Create a user or rotate their key
//! - `delete-user` - Delete a user without recorded usage
//! - `list-projects` - List a user's projects
//! - `list-models` - List models seen by the proxy
//! - `get-usage` - Monthly token usage report

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gpt_meter::{Config, ProxyServer, RequestKind, SqliteStore, StoreError, VERSION};

#[derive(Parser)]
#[command(name = "gpt-meter")]
#[command(version = VERSION)]
#[command(about = "Metering proxy for OpenAI-compatible completion APIs", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite usage database (overrides config and GPT_METER_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the metering proxy until Ctrl-C
    Serve {
        /// Listen host
        #[arg(long)]
        host: Option<String>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Upstream API base URL
        #[arg(short, long)]
        upstream: Option<String>,

        /// Upstream API key (or set OPENAI_KEY)
        #[arg(long)]
        api_key: Option<String>,

        /// Request kind (chat, completion)
        #[arg(short, long)]
        kind: Option<String>,

        /// Per-call deadline in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// List users and their keys
    ListUsers,

    /// Create a user or rotate their key
    SetUserKey {
        /// User name
        name: String,

        /// API key the user will send
        key: String,
    },

    /// Delete a user that has no projects
    DeleteUser {
        /// User name
        name: String,
    },

    /// List a user's projects
    ListProjects {
        /// User name
        name: String,
    },

    /// List models seen by the proxy
    ListModels,

    /// Monthly token usage per user, project and model
    GetUsage {
        /// Print individual ledger records instead of monthly totals
        #[arg(long)]
        records: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env();
    if let Some(db) = cli.db {
        config.store.path = db;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match cli.command {
            Commands::Serve {
                host,
                port,
                upstream,
                api_key,
                kind,
                timeout,
            } => cmd_serve(config, host, port, upstream, api_key, kind, timeout).await,
            Commands::ListUsers => cmd_list_users(&config).await,
            Commands::SetUserKey { name, key } => cmd_set_user_key(&config, &name, &key).await,
            Commands::DeleteUser { name } => cmd_delete_user(&config, &name).await,
            Commands::ListProjects { name } => cmd_list_projects(&config, &name).await,
            Commands::ListModels => cmd_list_models(&config).await,
            Commands::GetUsage { records, json } => cmd_get_usage(&config, records, json).await,
        }
    })
}

async fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    let path = &config.store.path;
    SqliteStore::open(path)
        .await
        .with_context(|| format!("Failed to open usage database {}", path.display()))
}

async fn cmd_serve(
    mut config: Config,
    host: Option<String>,
    port: Option<u16>,
    upstream: Option<String>,
    api_key: Option<String>,
    kind: Option<String>,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let proxy = &mut config.proxy;
    if let Some(host) = host {
        proxy.host = host;
    }
    if let Some(port) = port {
        proxy.port = port;
    }
    if let Some(upstream) = upstream {
        proxy.upstream_url = upstream;
    }
    if let Some(api_key) = api_key {
        proxy.api_key = Some(api_key);
    }
    if let Some(kind) = kind {
        proxy.request_kind = kind
            .parse::<RequestKind>()
            .map_err(|e| anyhow::anyhow!("{}. Use: chat, completion", e))?;
    }
    if let Some(timeout) = timeout {
        proxy.timeout_secs = timeout;
    }

    let store = open_store(&config).await?;
    let server = ProxyServer::new(config.proxy, store)?;
    server.run().await?;
    Ok(())
}

async fn cmd_list_users(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    for user in store.list_users().await? {
        println!("{}\t{}", user.name, user.key);
    }
    Ok(())
}

async fn cmd_set_user_key(config: &Config, name: &str, key: &str) -> anyhow::Result<()> {
    if key.trim().is_empty() {
        anyhow::bail!("Key must not be empty");
    }

    let store = open_store(config).await?;
    match store.set_user_key(name, key).await {
        Ok(()) => {
            println!("Key set for {name}");
            Ok(())
        },
        Err(StoreError::DuplicateKey) => anyhow::bail!("Key is already assigned to another user"),
        Err(e) => Err(e.into()),
    }
}

async fn cmd_delete_user(config: &Config, name: &str) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    if store.delete_user(name).await? {
        println!("Deleted {name}");
    } else {
        anyhow::bail!("No such user: {name}");
    }
    Ok(())
}

async fn cmd_list_projects(config: &Config, name: &str) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    for project in store.list_projects(name).await? {
        println!("{project}");
    }
    Ok(())
}

async fn cmd_list_models(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    for model in store.list_models().await? {
        println!("{model}");
    }
    Ok(())
}

async fn cmd_get_usage(config: &Config, records: bool, json: bool) -> anyhow::Result<()> {
    let store = open_store(config).await?;

    if records {
        let records = store.usage_records().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&records)?);
            return Ok(());
        }

        println!("{:<20} {:<16} {:<24} {:<24} {:>10}", "TIME", "USER", "PROJECT", "MODEL", "TOKENS");
        for r in records {
            println!(
                "{:<20} {:<16} {:<24} {:<24} {:>10}",
                r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                r.user,
                r.project,
                r.model,
                r.tokens
            );
        }
        return Ok(());
    }

    let months = store.monthly_usage().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&months)?);
        return Ok(());
    }

    if months.is_empty() {
        println!("No usage recorded");
        return Ok(());
    }

    for month in months {
        println!("{}", month.month);
        println!("  {:<16} {:<24} {:<24} {:>12}", "USER", "PROJECT", "MODEL", "TOKENS");
        for row in &month.rows {
            println!(
                "  {:<16} {:<24} {:<24} {:>12}",
                row.user, row.project, row.model, row.tokens
            );
        }
        let total: u64 = month.rows.iter().map(|r| r.tokens).sum();
        println!("  {:<66} {:>12}", "TOTAL", total);
        println!();
    }
    Ok(())
}
