//! BLE gateway tool for myIoTGrid sensor nodes
//!
//! Scans for nodes, provisions them over the config protocol, and runs the
//! gateway loop that relays sensor data.

mod files;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use grid_ble_controller::ble::BtleAdapter;
use grid_ble_controller::{
    Advertisement, BleAdapter, ConnectionRegistry, DeviceSession, GatewayConfig, LogStatus,
    ProvisioningRequest, Scanner, grid_home, provision,
};
use grid_proto::ResponseCode;
use grid_proto::ble::is_node_name;

use files::{JsonDeviceDirectory, StdoutSink, read_wifi_credentials};

#[derive(Parser)]
#[command(name = "grid-ble")]
#[command(about = "BLE gateway tool for myIoTGrid sensor nodes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for nearby nodes
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Assign a node id, WiFi and hub settings to a node, then reboot it
    Provision {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        /// Node id to assign
        #[arg(short, long)]
        node_id: String,
        /// Node id the device currently answers to, if different
        #[arg(long)]
        auth_node_id: Option<String>,
        #[arg(long, requires = "password")]
        ssid: Option<String>,
        #[arg(long, requires = "ssid")]
        password: Option<String>,
        /// WiFi credentials file (SSID on line 1, password on line 2)
        #[arg(short, long, default_value = "wifi_credentials.txt")]
        file: PathBuf,
        /// Hub URL the node reports to
        #[arg(long)]
        hub_url: String,
        #[arg(long, default_value = "5001")]
        hub_port: u16,
        /// Sensor reporting interval in seconds
        #[arg(long)]
        interval: Option<u32>,
    },
    /// Factory-reset a node (clear all settings)
    Reset {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        /// Node id the device currently answers to
        #[arg(short, long)]
        node_id: String,
    },
    /// Print the authentication hash for a node id
    Hash { node_id: String },
    /// Run the gateway: scan, connect registered nodes, relay sensor data
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Commands::Hash { node_id } = &cli.command {
        let hash = grid_proto::node_id_hash(node_id);
        println!("{node_id}: {:02x}{:02x}{:02x}{:02x}", hash[0], hash[1], hash[2], hash[3]);
        return Ok(());
    }

    let home = grid_home()?;
    let config = GatewayConfig::load_or_init(&home)?;
    let adapter = BtleAdapter::first(config.adapter.as_deref())
        .await
        .context("no usable bluetooth adapter")?;

    match cli.command {
        Commands::Scan { duration } => scan_devices(&adapter, duration).await,
        Commands::Provision {
            device,
            node_id,
            auth_node_id,
            ssid,
            password,
            file,
            hub_url,
            hub_port,
            interval,
        } => {
            let (ssid, password) = match (ssid, password) {
                (Some(ssid), Some(password)) => (ssid, password),
                _ => read_wifi_credentials(&file)?,
            };
            let request = ProvisioningRequest {
                node_id,
                auth_node_id,
                ssid,
                password,
                hub_url,
                hub_port,
                interval,
            };
            provision_device(&adapter, &config, device.as_deref(), &request).await
        }
        Commands::Reset { device, node_id } => {
            reset_device(&adapter, &config, device.as_deref(), &node_id).await
        }
        Commands::Hash { .. } => Ok(()),
        Commands::Run => run_gateway(adapter, &config, &home).await,
    }
}

async fn scan_devices(adapter: &BtleAdapter, duration: u64) -> anyhow::Result<()> {
    println!("Scanning for nodes ({duration} seconds)...");
    let seen = adapter.scan(Duration::from_secs(duration)).await?;

    println!("\nFound {} devices:", seen.len());
    for Advertisement { identity, rssi } in seen {
        let name = identity.advertised_name().unwrap_or("Unknown");
        let rssi = rssi.map_or_else(|| "N/A".to_string(), |r| format!("{r} dBm"));
        let marker = if is_node_name(name) { " [NODE]" } else { "" };
        println!("  {name} ({}) RSSI: {rssi}{marker}", identity.mac());
    }
    Ok(())
}

/// Scan once and open a session to the first matching node.
async fn open_node(
    adapter: &BtleAdapter,
    config: &GatewayConfig,
    target: Option<&str>,
) -> anyhow::Result<DeviceSession> {
    println!("Scanning for nodes...");
    let seen = adapter
        .scan(Duration::from_secs(config.scan_duration_secs))
        .await?;
    let Some(found) = seen.into_iter().find(|adv| {
        let name = adv.identity.advertised_name().unwrap_or_default();
        match target {
            Some(t) => {
                name.contains(t) || adv.identity.mac().to_string().contains(&t.to_uppercase())
            }
            None => is_node_name(name),
        }
    }) else {
        bail!("no matching node found");
    };
    println!("Found device: {}", found.identity);

    let mut session = DeviceSession::new(found.identity, config.session_settings());
    println!("Connecting...");
    session.open(adapter).await?;
    println!("Connected!");
    Ok(session)
}

async fn provision_device(
    adapter: &BtleAdapter,
    config: &GatewayConfig,
    target: Option<&str>,
    request: &ProvisioningRequest,
) -> anyhow::Result<()> {
    let mut session = open_node(adapter, config, target).await?;

    println!("Provisioning as {}...", request.node_id);
    println!("  SSID: {}", request.ssid);
    println!("  Hub:  {}:{}", request.hub_url, request.hub_port);
    let result = provision(&mut session, request).await;
    session.disconnect().await;

    let report = result?;
    for step in report.completed {
        println!("  {step}: ok");
    }
    println!("Node provisioned! It will restart and connect to WiFi.");
    Ok(())
}

async fn reset_device(
    adapter: &BtleAdapter,
    config: &GatewayConfig,
    target: Option<&str>,
    node_id: &str,
) -> anyhow::Result<()> {
    let mut session = open_node(adapter, config, target).await?;

    let result = async {
        expect_ok("authenticate", session.authenticate(node_id).await?)?;
        println!("Sending reset command...");
        expect_ok("factory reset", session.factory_reset().await?)
    }
    .await;
    session.disconnect().await;
    result?;

    println!("Reset command sent! Node will clear all settings and restart.");
    Ok(())
}

fn expect_ok(step: &str, code: ResponseCode) -> anyhow::Result<()> {
    if !code.is_ok() {
        bail!("{step} failed: node answered {code}");
    }
    Ok(())
}

async fn run_gateway(
    adapter: BtleAdapter,
    config: &GatewayConfig,
    home: &std::path::Path,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("shutting down");
                    cancel.cancel();
                }
                Err(e) => log::warn!("cannot listen for ctrl-c: {e}"),
            }
        }
    });

    let scanner = Scanner::new(
        Arc::new(adapter),
        Arc::new(ConnectionRegistry::new()),
        Arc::new(JsonDeviceDirectory::new(home)),
        Arc::new(StdoutSink),
        Arc::new(LogStatus),
        config.scanner_settings(),
    );
    scanner.run(cancel).await;
    Ok(())
}
