use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use weixin::storage::{create_storage, spawn_purge_task};
use weixin::{Dispatcher, Reply, WeixinConfig, WeixinRequest};

/// WeChat official-account callback server and storage tools.
#[derive(Parser, Debug)]
#[command(name = "weixin", version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "weixin.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the callback gateway
    Serve {
        /// Override `gateway.bind`
        #[arg(long)]
        bind: Option<String>,
    },

    /// List live storage keys
    Keys {
        /// Glob pattern (`*` and `?`)
        #[arg(default_value = "*")]
        pattern: String,
    },

    /// Remove expired storage records
    Purge,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(err) = run(cli).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = WeixinConfig::load(&cli.config)?;
    match cli.command {
        Commands::Serve { bind } => cmd_serve(config, bind).await,
        Commands::Keys { pattern } => cmd_keys(&config, &pattern).await,
        Commands::Purge => cmd_purge(&config).await,
    }
}

async fn echo_text(req: WeixinRequest) -> Result<Reply> {
    let message = req.message()?;
    Ok(Reply::text(message.content_or_empty().to_string()))
}

async fn greet_subscriber(_req: WeixinRequest) -> Result<Reply> {
    Ok(Reply::text("Thanks for following!"))
}

async fn cmd_serve(config: WeixinConfig, bind: Option<String>) -> Result<()> {
    let storage = create_storage(&config.storage)
        .await
        .context("failed to open storage")?;

    let mut builder = Dispatcher::builder(config.token.clone())
        .storage(Arc::clone(&storage))
        .on_message("text", echo_text)
        .on_event("subscribe", greet_subscriber);
    if let Some(key) = &config.encoding_aes_key {
        builder = builder.credential(config.app_id.clone(), key.clone());
    }
    let dispatcher = builder.build().context("invalid dispatcher settings")?;
    info!(
        "dispatcher ready (encryption {}, storage {})",
        if dispatcher.is_encrypted() { "on" } else { "off" },
        storage.name()
    );

    let purge = (config.storage.purge_interval_secs > 0).then(|| {
        spawn_purge_task(
            Arc::clone(&storage),
            Duration::from_secs(config.storage.purge_interval_secs),
        )
    });

    let bind = bind.unwrap_or_else(|| config.gateway.bind.clone());
    let app = weixin::gateway::router(Arc::new(dispatcher), &config.gateway.path);
    let served = weixin::gateway::serve(&bind, app).await;

    if let Some(task) = purge {
        task.abort();
    }
    served
}

async fn cmd_keys(config: &WeixinConfig, pattern: &str) -> Result<()> {
    let storage = create_storage(&config.storage)
        .await
        .context("failed to open storage")?;
    let keys = storage.list_keys(pattern).await?;
    for key in &keys {
        println!("{key}\t{}", storage.ttl(key).await?.as_secs());
    }
    info!("{} key(s) match {pattern}", keys.len());
    Ok(())
}

async fn cmd_purge(config: &WeixinConfig) -> Result<()> {
    let storage = create_storage(&config.storage)
        .await
        .context("failed to open storage")?;
    let removed = storage.purge_expired().await?;
    info!("purged {removed} expired record(s) from {}", storage.name());
    Ok(())
}
