use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use evernode_enhanced::api::run_server;
use evernode_enhanced::client::{render_table, DiscoveryClient};
use evernode_enhanced::hosts::HostFilter;
use evernode_enhanced::Config;

/// Evernode Enhanced - host discovery, pricing and licensing backend
#[derive(Parser, Debug)]
#[command(name = "evernode-enhanced", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the API server and the background refresh loop
    Serve(ServeArgs),
    /// List hosts known to a running instance
    Discover(DiscoverArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address, overriding the configured host and port
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

#[derive(Args, Debug)]
struct DiscoverArgs {
    /// API endpoint of a running instance
    #[arg(long, default_value = "http://localhost:8080/api")]
    api: String,

    /// Country code or location substring
    #[arg(short, long)]
    location: Option<String>,

    /// Only hosts with free instance slots
    #[arg(short, long)]
    available_only: bool,

    /// Only hosts running Evernode Enhanced
    #[arg(short, long)]
    enhanced_only: bool,

    /// Maximum number of hosts
    #[arg(short = 'n', long)]
    limit: Option<usize>,

    /// Print raw JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 15)]
    timeout: u64,
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).map_err(|e| e.to_string())?,
        None => {
            info!("no config file given, using defaults");
            Config::default()
        }
    };
    if let Some(addr) = args.bind {
        config.server.host = addr.ip().to_string();
        config.server.port = addr.port();
    }

    info!(
        domain = ?config.identity.domain,
        port = config.server.port,
        "🌐 Evernode Enhanced starting"
    );
    run_server(config).await
}

async fn discover(args: DiscoverArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = HostFilter {
        location: args.location,
        available_only: args.available_only,
        enhanced_only: args.enhanced_only,
        limit: args.limit,
    };

    let page = DiscoveryClient::new(args.api, args.timeout)
        .hosts(&filter)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&page.hosts)?);
    } else {
        print!("{}", render_table(&page.hosts));
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Discover(args) => discover(args).await,
    };

    if let Err(e) = result {
        error!(error = %e, "exiting");
        std::process::exit(1);
    }
}
