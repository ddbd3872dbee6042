use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use serde::Serialize;

use mopsos_gateway::{
    config::Config,
    credential::SystemClock,
    proxy::DatasetCatalog,
    server::{directory_from_config, run_server, ServerConfig, ServerState},
    GatewayError, KeyIssuer, PrivilegedAccess,
};

#[derive(Parser)]
#[command(
    name = "mopsos-gateway",
    about = "Authenticated HTTP gateway for mopsos analytical datasets and per-address API keys."
)]
struct Cli {
    /// Config file (default: ~/.config/mopsos-gateway/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to
        #[arg(long)]
        bind: Option<String>,

        /// JSON file of credential records to use as the key directory
        #[arg(long)]
        directory_file: Option<PathBuf>,
    },

    /// Look up the active key for an address in the configured directory
    Lookup {
        /// Wallet address
        #[arg(long)]
        address: String,

        /// JSON file of credential records to use as the key directory
        #[arg(long)]
        directory_file: Option<PathBuf>,
    },

    /// List the datasets served by the gateway
    Datasets,
}

#[derive(Serialize)]
struct LookupResult {
    address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let cfg = match path {
        Some(p) => Config::load_from(&p)?,
        None => Config::load(),
    };
    Ok(cfg.with_env_secrets())
}

fn with_directory_file(mut cfg: Config, file: Option<PathBuf>) -> Config {
    if let Some(file) = file {
        cfg.directory.get_or_insert_with(Default::default).file = Some(file);
    }
    cfg
}

fn cmd_serve(cfg: Config, bind: Option<String>, directory_file: Option<PathBuf>) -> Result<()> {
    let cfg = with_directory_file(cfg, directory_file);

    let bind_str = bind
        .or(cfg.bind.clone())
        .unwrap_or_else(|| "127.0.0.1:8000".to_string());
    let bind_addr = bind_str
        .parse()
        .wrap_err_with(|| format!("Invalid bind address: {}", bind_str))?;

    let server_config = ServerConfig {
        bind_addr,
        allowed_origins: cfg.allowed_origins.clone(),
    };
    let state = ServerState::from_config(&cfg)?;

    tracing::info!("starting mopsos-gateway");
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_server(server_config, state))?;

    Ok(())
}

/// Offline lookup. Runs with operator privileges, so no secret is presented.
fn cmd_lookup(cfg: Config, address: String, directory_file: Option<PathBuf>) -> Result<i32> {
    let cfg = with_directory_file(cfg, directory_file);
    let directory = directory_from_config(&cfg)?;
    let issuer = KeyIssuer::new(directory, Arc::new(SystemClock));
    let operator = PrivilegedAccess::operator();

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(issuer.find_key_for_identity(operator, &address));

    let (output, code) = match result {
        Ok(key) => (
            LookupResult {
                address,
                api_key: Some(key.api_key),
                error: None,
            },
            0,
        ),
        Err(e @ GatewayError::ServiceUnavailable) => return Err(eyre::eyre!(e)),
        Err(e) => (
            LookupResult {
                address,
                api_key: None,
                error: Some(e.to_string()),
            },
            1,
        ),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(code)
}

fn cmd_datasets(cfg: Config) -> Result<()> {
    let catalog = match cfg.datasets {
        Some(datasets) => DatasetCatalog::new(datasets)?,
        None => DatasetCatalog::default(),
    };
    for ds in catalog.iter() {
        println!("/{:<16} {}", ds.name, ds.table);
    }
    Ok(())
}

fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mopsos_gateway=info")),
        )
        .init();

    let cli = Cli::parse();

    let result = load_config(cli.config).and_then(|cfg| match cli.command {
        Commands::Serve {
            bind,
            directory_file,
        } => cmd_serve(cfg, bind, directory_file),
        Commands::Lookup {
            address,
            directory_file,
        } => match cmd_lookup(cfg, address, directory_file) {
            Ok(0) => Ok(()),
            Ok(code) => std::process::exit(code),
            Err(e) => Err(e),
        },
        Commands::Datasets => cmd_datasets(cfg),
    });

    if let Err(e) = result {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}
