//! iap-tunnel CLI - forward a local port to a private VM through the relay
//!
//! Opens one tunnel and keeps it up until Ctrl+C.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::{CliConfig, ConfigCredentialSource, ConfigManager};
use iap_proto::{ConnectionLimitClass, InstanceLocator, RelayPolicy, TunnelDestination};
use iap_relay::RelayError;
use iap_transport_websocket::{WebSocketConfig, WebSocketConnector};
use iap_tunnel::{BrokerEvent, TunnelBroker, TunnelError, TunnelSettings};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// iap-tunnel - Reach RDP and SSH on instances without a public IP
#[derive(Parser, Debug)]
#[command(name = "iap-tunnel")]
#[command(about = "Forward a local port to a private instance through an identity-aware relay")]
#[command(version, long_version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_TIME"), ")"))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a tunnel and print the local endpoint
    #[command(long_about = r#"
Open a tunnel to a port on a private instance and expose it on a local
loopback port. Point an RDP or SSH client at the printed address. The relay
connection resumes by itself after network drops.

EXAMPLES:
  # RDP to a Windows VM
  iap-tunnel connect projects/my-proj/zones/us-central1-a/instances/win-1

  # SSH, with the token taken from the environment
  IAP_TUNNEL_TOKEN=$(gcloud auth print-access-token) \
    iap-tunnel connect projects/my-proj/zones/us-central1-a/instances/vm-1 --port 22

ENVIRONMENT VARIABLES:
  IAP_TUNNEL_TOKEN     Access token (falls back to the config file)
  IAP_TUNNEL_ENDPOINT  Relay endpoint (falls back to the config file)
    "#)]
    Connect {
        /// Instance, as projects/<project>/zones/<zone>/instances/<name>
        instance: String,

        /// Remote port on the instance
        #[arg(long, default_value = "3389")]
        port: u16,

        /// Access token
        #[arg(long, env = "IAP_TUNNEL_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Relay endpoint (e.g., wss://tunnel.cloudproxy.app)
        #[arg(long, env = "IAP_TUNNEL_ENDPOINT")]
        endpoint: Option<String>,

        /// Local address to bind (the port is always picked by the OS)
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Relay audience requested for the token
        #[arg(long)]
        audience: Option<String>,

        /// Use the bulk connection-limit class (file transfers)
        #[arg(long)]
        bulk: bool,

        /// Maximum concurrent local connections
        #[arg(long)]
        max_connections: Option<usize>,
    },

    /// Show or edit ~/.iap-tunnel/config.json
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the current configuration (token hidden)
    Show,

    /// Store the access token
    SetToken { token: String },

    /// Remove the stored access token
    ClearToken,

    /// Store the relay endpoint
    SetEndpoint { endpoint: String },
}

/// Setup logging with the specified log level
///
/// RUST_LOG takes precedence over --verbose.
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

struct ConnectArgs {
    instance: String,
    port: u16,
    token: Option<String>,
    endpoint: Option<String>,
    bind: Option<IpAddr>,
    audience: Option<String>,
    bulk: bool,
    max_connections: Option<usize>,
}

fn tunnel_settings(config: &CliConfig, args: &ConnectArgs) -> TunnelSettings {
    let mut settings = TunnelSettings::resolve(config, TunnelSettings::default());
    if let Some(bind) = args.bind.or(config.bind_address) {
        settings.bind_address = bind;
    }
    if let Some(limit) = args.max_connections {
        settings.max_local_connections = limit;
    }
    settings
}

fn relay_policy(args: &ConnectArgs) -> RelayPolicy {
    let mut policy = RelayPolicy::default();
    if let Some(audience) = &args.audience {
        policy = policy.with_audience(audience.clone());
    }
    if args.bulk {
        policy = policy.with_connection_limit_class(ConnectionLimitClass::Bulk);
    }
    policy
}

async fn connect(manager: ConfigManager, args: ConnectArgs) -> Result<()> {
    let config = manager.load()?;

    let instance: InstanceLocator = args.instance.parse().context("Invalid instance")?;
    let destination = TunnelDestination::new(instance, args.port);

    let ws_config = match args.endpoint.clone().or_else(|| config.endpoint.clone()) {
        Some(endpoint) => WebSocketConfig::new(endpoint),
        None => WebSocketConfig::default(),
    };
    info!("Using relay endpoint {}", ws_config.endpoint);
    let connector = WebSocketConnector::new(ws_config).context("Invalid relay endpoint")?;

    let credentials = Arc::new(ConfigCredentialSource::new(manager, args.token.clone()));
    let broker = TunnelBroker::new(
        Arc::new(connector),
        credentials,
        tunnel_settings(&config, &args),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down...");
                cancel.cancel();
            }
        }
    });

    let handle = match broker
        .get_or_create(destination.clone(), relay_policy(&args), &cancel)
        .await
    {
        Ok(handle) => handle,
        Err(TunnelError::Relay(RelayError::Cancelled)) => return Ok(()),
        Err(e) => return Err(e).context(format!("Failed to open tunnel to {}", destination)),
    };

    println!();
    println!("Tunnel to {} is listening on {}", destination, handle.local_endpoint());
    println!("Press Ctrl+C to close it.");
    println!();

    let mut events = broker.subscribe();
    let mut relay_state = handle.tunnel().relay().watch_state();

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        _ = relay_state.wait_for(|state| state.is_terminal()) => {
            match handle.tunnel().relay().failure() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        _ = async {
            while let Ok(event) = events.recv().await {
                if let BrokerEvent::TunnelClosed { id, .. } = event {
                    warn!(tunnel_id = %id, "Tunnel closed");
                }
            }
        } => Ok(()),
    };

    broker.release(handle).await;
    broker.shutdown().await;

    if let Err(e) = outcome {
        error!("Relay connection failed: {}", e);
        bail!("Tunnel to {} failed: {}", destination, e);
    }

    info!("Tunnel closed");
    Ok(())
}

fn config_command(manager: &ConfigManager, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let mut config = manager.load()?;
            if config.access_token.is_some() {
                config.access_token = Some("<hidden>".to_string());
            }
            println!("# {}", manager.path().display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::SetToken { token } => {
            manager.set_token(token)?;
            println!("✅ Access token saved to {}", manager.path().display());
        }
        ConfigCommands::ClearToken => {
            manager.clear_token()?;
            println!("✅ Access token removed");
        }
        ConfigCommands::SetEndpoint { endpoint } => {
            manager.set_endpoint(endpoint)?;
            println!("✅ Relay endpoint saved to {}", manager.path().display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let manager = ConfigManager::from_home()?;

    match cli.command {
        Commands::Connect {
            instance,
            port,
            token,
            endpoint,
            bind,
            audience,
            bulk,
            max_connections,
        } => {
            connect(
                manager,
                ConnectArgs {
                    instance,
                    port,
                    token,
                    endpoint,
                    bind,
                    audience,
                    bulk,
                    max_connections,
                },
            )
            .await
        }
        Commands::Config { command } => config_command(&manager, command),
    }
}
