mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peerlink_protocol::pairing::{AuthEvent, AuthRequest, AuthState};
use peerlink_protocol::{
    DeviceInfo, DeviceManager, DeviceManagerEvent, DeviceRegistry, EventHandler, EventKind,
    LoopbackHub, ManagerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use config::Config;

/// Package name the command registers with the device service
const PACKAGE_NAME: &str = "org.peerlink.cli";

/// How long to wait for a simulated peer to reach PIN entry
const PEER_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(about = "Peer discovery and PIN pairing", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $XDG_CONFIG_HOME/peerlink/peerlink.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover simulated peers on a loopback hub
    Discover {
        /// Number of simulated peers
        #[arg(short, long, default_value_t = 3)]
        peers: usize,
    },

    /// Pair with a simulated peer over a loopback hub
    Pair {
        /// Name of the simulated peer
        #[arg(long, default_value = "Printer-42")]
        peer: String,

        /// Use this PIN instead of a random one
        #[arg(long)]
        pin: Option<String>,

        /// Record the simulated peer in the trusted device registry
        #[arg(long)]
        save: bool,
    },

    /// List trusted devices
    Devices,

    /// Remove a device from the trusted device registry
    Forget {
        /// Device ID
        device_id: String,
    },

    /// Print the effective configuration
    Config,
}

fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn local_device(config: &Config) -> DeviceInfo {
    match &config.device.device_id {
        Some(device_id) => DeviceInfo::new(
            device_id,
            &config.device.name,
            config.device.device_type_id,
        ),
        None => DeviceInfo::generate(&config.device.name, config.device.device_type_id),
    }
}

async fn create_manager(
    hub: &LoopbackHub,
    device: DeviceInfo,
    config: ManagerConfig,
) -> Result<Arc<DeviceManager>> {
    let name = device.device_name.clone();
    let manager = DeviceManager::create(PACKAGE_NAME, hub.endpoint(device), config)
        .await
        .with_context(|| format!("Failed to create device manager for {}", name))?;
    Ok(Arc::new(manager))
}

/// Forward discovered devices into a channel
fn found_devices(manager: &DeviceManager) -> mpsc::UnboundedReceiver<DeviceInfo> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: EventHandler = Arc::new(move |event: &DeviceManagerEvent| {
        if let DeviceManagerEvent::DeviceFound { device, .. } = event {
            let _ = tx.send(device.clone());
        }
    });
    manager.on(EventKind::DeviceFound, handler);
    rx
}

async fn run_discover(config: &Config, peers: usize) -> Result<()> {
    let hub = LoopbackHub::new();
    let local = local_device(config);
    let manager = create_manager(&hub, local, ManagerConfig::default()).await?;

    let mut simulated = Vec::with_capacity(peers);
    for index in 0..peers {
        let peer = DeviceInfo::generate(format!("Peer-{}", index + 1), 7);
        simulated.push(create_manager(&hub, peer, ManagerConfig::default()).await?);
    }

    if let Some(own) = manager.get_local_device_info_sync() {
        info!("Discovering from {} ({})", own.device_name, own.device_id);
    }

    let mut found = found_devices(&manager);
    let subscribe_id = manager.next_subscribe_id()?;
    let info = config.subscribe_info(subscribe_id)?;
    info!("Starting {}", info);
    manager.start_device_discovery(info).await?;

    for _ in 0..peers {
        let device = found.recv().await.context("Discovery ended early")?;
        println!(
            "{}  {}  (type {})",
            device.device_id, device.device_name, device.device_type_id
        );
    }

    manager.stop_device_discovery(subscribe_id).await?;
    manager.release().await?;
    for peer in simulated {
        peer.release().await?;
    }
    Ok(())
}

async fn run_pair(config: &Config, peer_name: String, pin: Option<String>, save: bool) -> Result<()> {
    let mut hub = LoopbackHub::new();
    if let Some(pin) = &pin {
        hub = hub.fixed_pin(pin).context("Invalid --pin")?;
    }

    let local = local_device(config);
    let local_id = local.device_id.clone();
    let mut local_config = config.manager_config();
    if !save {
        local_config.registry_path = None;
    }

    let local_manager = create_manager(&hub, local, local_config).await?;
    let peer_manager = create_manager(
        &hub,
        DeviceInfo::generate(&peer_name, 7),
        ManagerConfig::default(),
    )
    .await?;

    let mut found = found_devices(&local_manager);
    let subscribe_id = local_manager.next_subscribe_id()?;
    local_manager
        .start_device_discovery(config.subscribe_info(subscribe_id)?)
        .await?;
    let target = found.recv().await.context("No peer discovered")?;
    info!("Discovered {} ({})", target.device_name, target.device_id);

    let mut local_events = local_manager
        .auth_events()
        .context("Auth events already taken")?;
    let local_poller = local_manager.spawn_auth_param_poller()?;
    let peer_poller = peer_manager.spawn_auth_param_poller()?;

    // The simulated peer types whatever PIN the local side displays
    let typist = {
        let peer_manager = peer_manager.clone();
        let local_id = local_id.clone();
        tokio::spawn(async move {
            while let Some(event) = local_events.recv().await {
                debug!("Auth event: {:?}", event);
                let AuthEvent::ShowPin { pin: Some(pin), .. } = event else {
                    continue;
                };
                println!("PIN: {}", pin.as_str());

                let ready = tokio::time::timeout(PEER_READY_TIMEOUT, async {
                    while peer_manager.auth_state(&local_id).await != AuthState::PinEntry {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                })
                .await;
                if ready.is_err() {
                    warn!("Simulated peer never asked for the PIN");
                    return;
                }

                for digit in pin.as_str().chars() {
                    if let Err(e) = peer_manager.enter_pin_digit(&local_id, digit).await {
                        warn!("Simulated peer failed to type the PIN: {}", e);
                        return;
                    }
                }
                break;
            }
        })
    };

    let request = AuthRequest::pin(&config.pairing.app_name);
    let result = local_manager.authenticate_device(target, request).await;

    typist.abort();
    local_poller.stop().await;
    peer_poller.stop().await;
    local_manager.stop_device_discovery(subscribe_id).await?;

    match &result {
        Ok(outcome) => {
            println!("Paired with {} (pin token {})", outcome.device_id, outcome.pin_token);
            for device in local_manager.get_trusted_device_list_sync().unwrap_or_default() {
                println!("  trusted: {}  {}", device.device_id, device.device_name);
            }
        }
        Err(e) => println!("Pairing failed: {}", e.user_message()),
    }

    local_manager.release().await?;
    peer_manager.release().await?;
    result.map(|_| ()).context("Pairing failed")
}

fn run_devices(config: &Config) -> Result<()> {
    let registry = DeviceRegistry::new(config.registry_path())
        .context("Failed to load trusted device registry")?;

    let mut devices: Vec<_> = registry.trusted_devices().collect();
    if devices.is_empty() {
        println!("No trusted devices");
        return Ok(());
    }

    devices.sort_by(|a, b| a.id().cmp(b.id()));
    for device in devices {
        let since = device
            .trusted_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {}  (type {}, trusted {})",
            device.id(),
            device.name(),
            device.info.device_type_id,
            since
        );
    }
    Ok(())
}

fn run_forget(config: &Config, device_id: &str) -> Result<()> {
    let mut registry = DeviceRegistry::new(config.registry_path())
        .context("Failed to load trusted device registry")?;
    registry
        .untrust(device_id)
        .with_context(|| format!("Failed to forget {}", device_id))?;
    println!("Forgot {}", device_id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path).context("Failed to load configuration")?;
    config
        .ensure_directories()
        .context("Failed to create directories")?;
    debug!("Configuration loaded from {}", config_path.display());

    match cli.command {
        Commands::Discover { peers } => run_discover(&config, peers).await,
        Commands::Pair { peer, pin, save } => run_pair(&config, peer, pin, save).await,
        Commands::Devices => run_devices(&config),
        Commands::Forget { device_id } => run_forget(&config, &device_id),
        Commands::Config => {
            let contents =
                toml::to_string_pretty(&config).context("Failed to serialize config")?;
            println!("# {}", config_path.display());
            print!("{}", contents);
            Ok(())
        }
    }
}
