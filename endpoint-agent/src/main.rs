//! Endpoint Agent - host telemetry agent
//!
//! Commands:
//! - `start`: register when key material is missing, then run every input
//!   and the stream transport until killed
//! - `register`: save a registration key handed out by the collector
//! - `version`: print the agent version

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use endpoint_agent::check::CheckRunner;
use endpoint_agent::config::ConfigStore;
use endpoint_agent::input::Scheduler;
use endpoint_agent::metrics::{
    DiskInput, DiskIoInput, KmsgInput, LoadInput, NetworkInput, SystemInput,
};
use endpoint_agent::nonce::NonceValidator;
use endpoint_agent::registration::{self, RegistrationKey};
use endpoint_agent::stream::{ActiveConf, Stream};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "endpoint-agent")]
#[command(version)]
#[command(about = "Host telemetry agent", long_about = None)]
struct Cli {
    /// Config file path, overrides ENDPOINT_AGENT_CONFIG
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start endpoint service
    Start,
    /// Save a registration key
    Register {
        /// Registration URI, https://<host>/<id>_<secret>
        uri: Option<String>,

        /// Collector hostname
        #[arg(long, conflicts_with = "uri")]
        host: Option<String>,

        /// Registration key, <id>_<secret>
        #[arg(long, conflicts_with = "uri")]
        key: Option<String>,
    },
    /// Show version
    Version,
}

async fn open_store(path: Option<PathBuf>) -> Result<ConfigStore> {
    let store = match path {
        Some(path) => ConfigStore::load(path).await,
        None => ConfigStore::init().await,
    };
    store.context("Failed to load config")
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("Failed to read input")?;
    Ok(line.trim().to_string())
}

async fn start(store: ConfigStore) -> Result<()> {
    let store = Arc::new(store);
    let nonces = NonceValidator::new();

    registration::init(&store, &nonces)
        .await
        .context("Failed to register endpoint")?;

    let data = store.get();
    data.identity().context("Config incomplete after registration")?;
    info!(endpoint_id = %data.id, "Endpoint agent starting");

    let stream = Stream::new(store.clone(), ActiveConf::new());
    let mut scheduler = Scheduler::new(stream.clone());
    scheduler.register(SystemInput::new());
    scheduler.register(LoadInput);
    scheduler.register(DiskInput::new(data.disk.ignores.clone()));
    scheduler.register(DiskIoInput::default());
    scheduler.register(NetworkInput::new());
    if cfg!(target_os = "linux") {
        scheduler.register(KmsgInput::new());
    }
    scheduler.register(CheckRunner::new(stream, data.checks.max_concurrent));

    scheduler.run().await;
    Ok(())
}

async fn register(
    store: ConfigStore,
    uri: Option<String>,
    host: Option<String>,
    key: Option<String>,
) -> Result<()> {
    let key = match uri {
        Some(uri) => RegistrationKey::from_uri(&uri)?,
        None => {
            let host = match host {
                Some(host) => host,
                None => prompt("Enter collector hostname: ")?,
            };
            let key = match key {
                Some(key) => key,
                None => prompt("Enter registration key: ")?,
            };
            RegistrationKey::from_parts(&host, &key)?
        }
    };

    registration::save_registration_key(&store, &key)
        .await
        .context("Failed to save registration key")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("endpoint_agent=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("endpoint-agent v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Start => start(open_store(cli.config).await?).await,
        Command::Register { uri, host, key } => {
            register(open_store(cli.config).await?, uri, host, key).await
        }
    }
}
