use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use hub_relay::adaptors::mask_api_key;
use hub_relay::cli::AppConfig;
use hub_relay::server;
use hub_relay::store::JsonStore;

#[derive(Parser)]
#[command(name = "hubr")]
#[command(about = "Hub Relay - multi-vendor AI relay built in Rust", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults to ~/.hub-relay/config.toml)
    #[arg(short, long, env = "HUB_RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Start {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the resolved configuration with secrets masked
    Config,
    /// List channels in the state store
    Channels,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::default_path().unwrap_or_else(|_| PathBuf::from("config/default.toml")),
    };
    let config = AppConfig::from_file(&config_path)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Start { port } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }

            tracing::info!("Starting Hub Relay on port {}", config.server.port);
            println!("🚀 Hub Relay v{}", env!("CARGO_PKG_VERSION"));
            println!("📡 Starting server on {}:{}", config.server.host, config.server.port);
            println!("🗄️  State: {}", config.storage.state_path.display());
            println!();
            println!("Press Ctrl+C to stop");

            server::start_server(config).await?;
        }
        Commands::Config => {
            println!("# {}", config_path.display());
            println!("{}", config.to_toml()?);
        }
        Commands::Channels => {
            let store = JsonStore::open(config.storage.state_path.clone()).await?;
            let channels = store.list_channels().await;
            if channels.is_empty() {
                println!("No channels in {}", config.storage.state_path.display());
            }
            for channel in channels {
                println!(
                    "  • #{} {} [{}] tenant={} priority={} key={} models={}",
                    channel.id,
                    channel.name,
                    channel.vendor,
                    channel.tenant_id,
                    channel.priority,
                    mask_api_key(channel.key.expose_secret()),
                    channel.models.join(",")
                );
            }
        }
    }

    Ok(())
}
