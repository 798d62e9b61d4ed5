//! burrow-admin
//!
//! Reach private services (databases, caches, internal APIs) through a
//! management server that can dial them.
//!
//! - `serve` runs the server endpoint next to the private services
//! - `tunnel` binds local ports and forwards each connection over its own
//!   channel to the server
//! - `services` shows the named forwarding rules

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod error;
mod protocol;
mod tunnel;

use config::Config;
use protocol::{ForwardSpec, TargetDescriptor};
use tunnel::{ServerSettings, StdioConn, TunnelClient, TunnelServer};

#[derive(Parser, Debug)]
#[command(name = "burrow-admin")]
#[command(author, version, about = "Tunnel admin access to private services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server endpoint
    Serve(ServeArgs),

    /// Forward local ports to services behind the server
    Tunnel(TunnelArgs),

    /// Show the named services
    Services {
        /// Write the effective table into the config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to accept tunnel channels on
    #[arg(short, long, env = "BURROW_ADMIN_LISTEN")]
    listen: Option<String>,

    /// Seconds to wait when dialing a target
    #[arg(long)]
    dial_timeout: Option<u64>,

    /// Maximum session lifetime in seconds (0 for unlimited)
    #[arg(long)]
    max_session: Option<u64>,
}

#[derive(Parser, Debug)]
struct TunnelArgs {
    /// Named services to forward (see `burrow-admin services`)
    services: Vec<String>,

    /// Forwarding rule, `[bind_address:]port:host:hostport`
    #[arg(short = 'L', value_name = "SPEC")]
    forwards: Vec<String>,

    /// Management server, `host:port` or a ws:// / wss:// URL
    #[arg(short, long, env = "BURROW_ADMIN_ADDRESS")]
    address: Option<String>,

    /// Seconds to wait when opening a channel
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Tunnel stdin/stdout to TARGET instead of listening
    #[arg(long, value_name = "TARGET", conflicts_with_all = ["services", "forwards"])]
    stdio: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(args) => run_serve(args, &config).await,
        Commands::Tunnel(args) => run_tunnel(args, &config).await,
        Commands::Services { save } => run_services(save, cli.config, config),
    }
}

async fn run_serve(args: ServeArgs, config: &Config) -> Result<()> {
    let settings = ServerSettings {
        listen: config.server_listen(args.listen),
        dial_timeout: config.dial_timeout(args.dial_timeout),
        handshake_timeout: config.handshake_timeout(),
        max_session: config.max_session(args.max_session),
    };

    let server = TunnelServer::bind(settings.clone())
        .await
        .with_context(|| format!("Failed to listen on {}", settings.listen))?;

    server.run(shutdown_on_ctrl_c()).await?;
    Ok(())
}

async fn run_tunnel(args: TunnelArgs, config: &Config) -> Result<()> {
    let address = config.client_address(args.address);
    let client = TunnelClient::new(&address, config.client_timeout(args.timeout))?;
    let shutdown = shutdown_on_ctrl_c();

    if let Some(target) = args.stdio {
        let target: TargetDescriptor = target.parse()?;
        let outcome = client
            .forward_connection(StdioConn::new(), &target, shutdown)
            .await;
        // A blocking stdin read cannot be cancelled and would keep the
        // runtime alive, so leave without waiting for it.
        std::process::exit(if outcome.is_ok() { 0 } else { 1 });
    }

    let mut specs = config.service_table()?.resolve(&args.services)?;
    for forward in &args.forwards {
        let spec: ForwardSpec = forward.parse()?;
        specs.push(spec);
    }
    if specs.is_empty() {
        anyhow::bail!("Nothing to forward. Name a service or pass -L [bind:]port:host:hostport");
    }

    client.run(&specs, shutdown).await?;
    Ok(())
}

fn run_services(save: bool, path: Option<PathBuf>, mut config: Config) -> Result<()> {
    let table = config.service_table()?;

    println!("{:<12} {:<22} TARGET", "SERVICE", "LOCAL");
    for (name, spec) in table.iter() {
        println!("{:<12} {:<22} {}", name, spec.bind_addr(), spec.target);
    }

    if save {
        let path = match path {
            Some(path) => path,
            None => Config::config_path()?,
        };
        config.services = table
            .iter()
            .map(|(name, spec)| (name.clone(), spec.to_string()))
            .collect();
        config.save(&path)?;
        println!();
        println!("Saved to {}", path.display());
    }

    Ok(())
}

/// Root cancellation token, cancelled on the first Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down"),
            Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
        }
        trigger.cancel();
    });
    token
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
