//! Chatrelay — authenticated WebSocket chat relay

use chatrelay_core::{ConnectionLimits, GatewayConfig, TransportConfig};
use chatrelay_gateway::start_gateway;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chatrelay", about = "Chatrelay — authenticated WebSocket chat relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat gateway
    Serve(ServeArgs),
    /// Show version
    Version,
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
    /// Environment profile; `.<profile>` is loaded as an env file
    #[arg(short, long, env = "CHATRELAY_ENV", default_value = "dev")]
    profile: String,
    /// Identity provider base URL (read after the profile file is loaded)
    #[arg(long)]
    identity_url: Option<String>,
    /// PEM public key used to verify login tokens
    #[arg(long, env = "CHATRELAY_PUBLIC_KEY", default_value = "pub.pem")]
    public_key: PathBuf,
    #[arg(long, default_value = "60")]
    pong_wait_secs: u64,
    #[arg(long, default_value = "10")]
    write_wait_secs: u64,
    #[arg(long, default_value = "2048")]
    max_message_size: usize,
    #[arg(long, default_value = "256")]
    queue_capacity: usize,
    #[arg(long, default_value = "10")]
    identity_timeout_secs: u64,
    /// Answer undecodable frames with an explicit error notice
    #[arg(long)]
    strict_decoding: bool,
    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chatrelay=info,chatrelay_gateway=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(args: ServeArgs) -> anyhow::Result<GatewayConfig> {
    let env_file = format!(".{}", args.profile);
    dotenvy::from_filename(&env_file)
        .map_err(|e| anyhow::anyhow!("error loading {} file: {}", env_file, e))?;
    tracing::info!(profile = %args.profile, file = %env_file, "loaded environment profile");

    let identity_url = args
        .identity_url
        .or_else(|| std::env::var("CHATRELAY_IDENTITY_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("CHATRELAY_IDENTITY_URL not set"))?;

    let limits = ConnectionLimits {
        write_wait: Duration::from_secs(args.write_wait_secs),
        max_message_size: args.max_message_size,
        queue_capacity: args.queue_capacity,
        identity_timeout: Duration::from_secs(args.identity_timeout_secs),
        ..ConnectionLimits::default()
    }
    .with_pong_wait(Duration::from_secs(args.pong_wait_secs));

    Ok(GatewayConfig {
        listen: args.listen,
        profile: args.profile,
        identity_url,
        public_key_path: args.public_key,
        limits,
        transport: TransportConfig {
            max_frame_size: args.max_message_size,
            ..TransportConfig::default()
        },
        strict_decoding: args.strict_decoding,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            init_tracing(args.log_json);
            let config = load_config(args)?;
            start_gateway(config).await?;
        }

        Commands::Version => {
            println!("chatrelay v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
