//! BLE commissioning tool for Good Sleep bed sensors
//!
//! Scans for sensors, sends Wi-Fi credentials over BLE, follows the
//! connection status and then watches the sensor through the status service.

mod nmcli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use goodsleep_commission::{
    BtleplugAdapter, ChosenNetwork, CommissionConfig, Commissioner, DiscoveredDevice,
    HttpLivenessEndpoint, JsonFileStore, LivenessEndpoint, LivenessError, LivenessReport, NetworkSelector,
    PairedDevice, ResolvedAddress, StatusEvent, goodsleep_home,
};
use nmcli::NmcliNetwork;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

type Ctx = Commissioner<BtleplugAdapter, NmcliNetwork, dyn LivenessEndpoint, JsonFileStore>;
type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "goodsleep-ble")]
#[command(about = "BLE commissioning tool for Good Sleep bed sensors")]
struct Cli {
    /// State directory (defaults to $GOODSLEEP_HOME or ~/.goodsleep)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Device name pattern to scan for
    #[arg(long, global = true)]
    pattern: Option<String>,

    /// Base URL of the device status service
    #[arg(long, global = true)]
    liveness_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for Good Sleep sensors
    Scan,
    /// Show the host's Wi-Fi and the networks a sensor can join
    Networks,
    /// Send Wi-Fi credentials to a sensor and wait for it to come online
    Provision {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        /// WiFi credentials file (SSID on line 1, password on line 2)
        #[arg(short, long, default_value = "wifi_credentials.txt")]
        file: String,
        /// Network name, instead of the credentials file
        #[arg(long, requires = "password")]
        ssid: Option<String>,
        /// Network password, instead of the credentials file
        #[arg(long, requires = "ssid")]
        password: Option<String>,
        /// Seconds to wait for each status frame
        #[arg(long)]
        timeout: Option<u64>,
        /// Keep watching the sensor after it comes online
        #[arg(short, long)]
        watch: bool,
    },
    /// Ask the status service once whether a sensor is online
    Check {
        /// Address to check (defaults to the paired sensor)
        address: Option<String>,
    },
    /// Poll the status service until interrupted
    Watch {
        /// Address to watch (defaults to the paired sensor)
        address: Option<String>,
        /// Seconds between checks
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Forget the paired sensor
    Unpair,
}

/// Used when no status service is configured
struct Unconfigured;

#[async_trait::async_trait]
impl LivenessEndpoint for Unconfigured {
    async fn query(&self, _address: &ResolvedAddress) -> Result<LivenessReport, LivenessError> {
        Err(LivenessError::Transport("no liveness_url configured".to_string()))
    }
}

#[tokio::main]
async fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let home = match cli.home {
        Some(home) => {
            std::fs::create_dir_all(&home)?;
            home
        }
        None => goodsleep_home()?,
    };
    let mut config = CommissionConfig::load_or_default(&home)?;
    if let Some(pattern) = cli.pattern {
        config.name_pattern = pattern;
    }
    if let Some(url) = cli.liveness_url {
        config.liveness_url = Some(url);
    }
    log::debug!("state directory {}", home.display());

    let endpoint: Arc<dyn LivenessEndpoint> = match &config.liveness_url {
        Some(url) => Arc::new(HttpLivenessEndpoint::new(url)),
        None => Arc::new(Unconfigured),
    };
    let store = Arc::new(JsonFileStore::open(&home)?);

    match &cli.command {
        Commands::Check { .. } | Commands::Watch { .. } if config.liveness_url.is_none() => {
            return Err("no status service configured, set liveness_url or pass --liveness-url".into());
        }
        Commands::Provision { timeout: Some(0), .. } => return Err("--timeout must be at least one second".into()),
        Commands::Provision { timeout: Some(secs), .. } => config.status_timeout = Duration::from_secs(*secs),
        Commands::Watch { interval: Some(secs), .. } => config.liveness_interval = Duration::from_secs((*secs).max(1)),
        _ => {}
    }

    let ctx: Ctx = Commissioner::new(
        Arc::new(BtleplugAdapter::new()),
        Arc::new(NmcliNetwork),
        endpoint,
        store,
        config,
    );

    match cli.command {
        Commands::Scan => scan_devices(&ctx).await?,
        Commands::Networks => show_networks(&ctx).await?,
        Commands::Provision {
            device,
            file,
            ssid,
            password,
            watch,
            ..
        } => {
            let (ssid, password) = match (ssid, password) {
                (Some(ssid), Some(password)) => (ssid, password),
                _ => read_wifi_credentials(&file)?,
            };
            provision_device(&ctx, device, &ssid, &password, watch).await?;
        }
        Commands::Check { address } => {
            let address = target_address(&ctx, address)?;
            let state = ctx.liveness_monitor().check(&address).await;
            println!("{address}: {state:?}");
        }
        Commands::Watch { address, .. } => {
            let address = target_address(&ctx, address)?;
            watch_liveness(&ctx, address).await;
        }
        Commands::Unpair => match ctx.remembered_device()? {
            Some(remembered) => {
                println!("Forgetting {} ({})", remembered.transport_id, remembered.resolved_address);
                ctx.unpair(None).await?;
            }
            None => println!("No paired device."),
        },
    }

    Ok(())
}

fn read_wifi_credentials(file: &str) -> CliResult<(String, String)> {
    let content = std::fs::read_to_string(file)?;
    let mut lines = content.lines();
    let ssid = lines.next().ok_or("Missing SSID in credentials file")?.trim().to_string();
    let password = lines.next().ok_or("Missing password in credentials file")?.trim().to_string();
    Ok((ssid, password))
}

fn describe(device: &DiscoveredDevice) -> String {
    let rssi = device
        .signal_strength
        .map(|r| format!("{r} dBm"))
        .unwrap_or_else(|| "N/A".to_string());
    format!(
        "{} [{}] ({}) RSSI: {}",
        device.advertised_name,
        device.display_label(),
        device.resolved_address,
        rssi
    )
}

async fn scan_devices(ctx: &Ctx) -> CliResult<()> {
    let window = ctx.config().scan_window.as_secs();
    println!("Scanning for {} devices ({window} seconds)...", ctx.config().name_pattern);

    let mut handle = ctx.scan().await?;
    let mut seen = 0;
    loop {
        tokio::select! {
            tick = handle.next() => match tick {
                Some(devices) => {
                    for device in devices.iter().skip(seen) {
                        println!("  {}", describe(device));
                    }
                    seen = seen.max(devices.len());
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                let devices = handle.stop().await?;
                println!("\nStopped, {} devices found", devices.len());
                return Ok(());
            }
        }
    }

    let devices = handle.finish().await?;
    println!("\nFound {} devices:", devices.len());
    for device in &devices {
        println!("  {}", describe(device));
    }
    Ok(())
}

async fn show_networks(ctx: &Ctx) -> CliResult<()> {
    let mut selector = ctx.network_selector();
    match selector.current_network().await {
        Ok(current) => println!(
            "Connected to {} ({:?}){}",
            current.name(),
            current.candidate.band,
            if current.band_unsupported { ", not usable by the sensor" } else { "" }
        ),
        Err(e) => println!("Not connected: {e}"),
    }

    let candidates = selector.scan().await?;
    println!("\n{} networks the sensor can join:", candidates.len());
    for candidate in candidates {
        let rssi = candidate
            .signal_strength
            .map(|r| format!("{r} dBm"))
            .unwrap_or_else(|| "N/A".to_string());
        println!("  {} ({:?}, {:?}) RSSI: {}", candidate.name, candidate.band, candidate.evidence, rssi);
    }
    Ok(())
}

async fn find_device(ctx: &Ctx, target: Option<String>) -> CliResult<PairedDevice> {
    if target.is_none() {
        match ctx.reconnect().await {
            Ok(Some(paired)) => {
                println!("Reconnected to {}", paired.resolved_address());
                return Ok(paired);
            }
            Ok(None) => {}
            Err(e) => log::warn!("remembered device unreachable: {e}"),
        }
    }

    println!("Scanning for {} devices...", ctx.config().name_pattern);
    let devices = ctx.scan().await?.finish().await?;
    let device = devices
        .iter()
        .find(|d| match &target {
            Some(t) => {
                d.advertised_name.contains(t.as_str())
                    || d.transport_id.contains(t.as_str())
                    || d.resolved_address.as_str().contains(t.as_str())
            }
            None => !d.synthesized,
        })
        .ok_or("No matching device found")?;

    println!("Found device: {}", describe(device));
    println!("Connecting...");
    let paired = ctx.negotiator().connect_device(device).await?;
    println!("Connected!");
    Ok(paired)
}

async fn choose_network(selector: &mut NetworkSelector<NmcliNetwork>, ssid: &str) -> ChosenNetwork {
    if let Err(e) = selector.scan().await {
        log::warn!("wifi scan failed: {e}");
    }
    match selector.select(ssid) {
        Ok(chosen) => chosen,
        Err(_) => {
            log::info!("{ssid} not seen nearby, sending it anyway");
            selector.select_manual(ssid)
        }
    }
}

async fn provision_device(
    ctx: &Ctx,
    target: Option<String>,
    ssid: &str,
    password: &str,
    watch: bool,
) -> CliResult<()> {
    let mut selector = ctx.network_selector();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let enabled = tokio::select! {
        result = selector.wait_until_enabled(ctx.config().network_poll_interval, cancel_rx) => result,
        _ = tokio::signal::ctrl_c() => {
            let _ = cancel_tx.send(true);
            return Err("interrupted while waiting for Wi-Fi".into());
        }
    };
    if let Err(e) = enabled {
        log::warn!("host wifi unavailable, band check skipped: {e}");
    }
    let chosen = choose_network(&mut selector, ssid).await;

    let paired = find_device(ctx, target).await?;
    if !ctx.negotiator().probe(&paired).await {
        return Err("device stopped responding".into());
    }

    let (events_tx, mut events) = mpsc::channel(16);
    let monitor = ctx.status_monitor().with_events(events_tx);
    let abandon = monitor.abandon_handle();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                StatusEvent::Phase(phase) => log::debug!("phase {phase:?}"),
                StatusEvent::Status(code) => println!("  device: {code}"),
                StatusEvent::Text(text) => println!("  device says: {text}"),
                StatusEvent::Stalled(after) => println!("  no answer for {}s", after.as_secs()),
            }
        }
    });

    println!("Sending WiFi credentials...");
    println!("  SSID: {}", chosen.name());
    let commission = ctx.commission(&paired, &chosen, password, monitor);
    tokio::pin!(commission);
    let outcome = tokio::select! {
        outcome = &mut commission => outcome,
        _ = tokio::signal::ctrl_c() => {
            println!("Abandoning...");
            abandon.abandon();
            commission.await
        }
    };

    let mut done = match outcome {
        Ok(done) => done,
        Err(e) => {
            let _ = paired.teardown(ctx.adapter().as_ref()).await;
            printer.abort();
            return Err(e.into());
        }
    };
    println!("Sensor is online, watching {}", done.liveness_address);

    if watch {
        let _ = tokio::signal::ctrl_c().await;
    }
    done.liveness.stop().await;
    done.monitor.close().await;
    paired.teardown(ctx.adapter().as_ref()).await?;
    printer.abort();
    Ok(())
}

fn target_address(ctx: &Ctx, address: Option<String>) -> CliResult<ResolvedAddress> {
    if let Some(address) = address {
        return Ok(goodsleep_commission::identity::resolve(&address, &[]));
    }
    let remembered = ctx.remembered_device()?.ok_or("No paired device, pass an address")?;
    Ok(remembered.resolved_address)
}

async fn watch_liveness(ctx: &Ctx, address: ResolvedAddress) {
    println!("Watching {address} every {}s", ctx.config().liveness_interval.as_secs());
    let mut liveness = ctx.liveness_monitor();
    liveness
        .start(address, ctx.config().liveness_interval, |record| {
            println!(
                "  {:?} (failures: {}, last online: {})",
                record.current_state,
                record.consecutive_failures,
                record
                    .last_online_timestamp
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
        })
        .await;
    let _ = tokio::signal::ctrl_c().await;
    liveness.stop().await;
}
