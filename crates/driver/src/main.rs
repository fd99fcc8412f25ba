//! osrfx2
//!
//! Binds OSR USB-FX2 learning kits through libusb and exercises them from
//! the command line.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use common::setup_logging;
use driver::config::{DriverConfig, expand_path};
use driver::usb::UsbHost;
use driver::{DeviceManager, Minor, Session, SwitchState};
use std::collections::HashMap;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// How long shutdown waits for in-flight writes to finish
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "osrfx2")]
#[command(author, version, about = "OSR USB-FX2 learning kit driver")]
#[command(long_about = "
Binds OSR USB-FX2 boards through libusb and gives access to their bulk
loopback pipe and DIP switches.

EXAMPLES:
    # Show bound boards
    osrfx2 list

    # Loop data through the first board
    osrfx2 write hello
    osrfx2 read --len 5

    # Print switch changes until Ctrl+C
    osrfx2 monitor

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/osrfx2/driver.toml
    3. /etc/osrfx2/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Minor of the board to use (defaults to the first bound)
    #[arg(short, long, global = true)]
    minor: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List bound boards
    List,
    /// Read one packet from the bulk-in pipe
    Read {
        /// Bytes to request
        #[arg(long, default_value_t = 512)]
        len: usize,
    },
    /// Write DATA to the bulk-out pipe
    Write { data: String },
    /// Print the current switch state
    Switches,
    /// Follow hot-plug and print switch changes until Ctrl+C
    Monitor {
        /// Sampling period in milliseconds
        #[arg(long, default_value_t = 50)]
        period_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        DriverConfig::load(Some(expand_path(path))).context("Failed to load configuration")?
    } else {
        DriverConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("osrfx2 v{}", env!("CARGO_PKG_VERSION"));

    let manager = DeviceManager::new(config.manager_options())
        .context("Failed to start completion worker")?;
    let host = UsbHost::new(manager.clone(), config.usb.clone())
        .context("Failed to initialize USB")?;
    host.scan().context("Failed to scan for devices")?;

    let result = match args.command {
        Command::List => list(&manager),
        Command::Read { len } => read(&manager, args.minor, len).await,
        Command::Write { data } => write(&manager, args.minor, data.as_bytes()),
        Command::Switches => switches(&manager, args.minor),
        Command::Monitor { period_ms } => {
            monitor(&host, Duration::from_millis(period_ms)).await
        }
    };

    // Unbind everything and let queued writes drain before the process exits
    manager.detach_all();
    if !manager.wait_idle(SHUTDOWN_GRACE) {
        warn!(
            "{} device(s) still busy after {:?}",
            manager.live_devices(),
            SHUTDOWN_GRACE
        );
    }

    result
}

fn open(manager: &DeviceManager, minor: Option<u32>) -> Result<Session> {
    let minor = match minor {
        Some(minor) => Minor(minor),
        None => manager
            .bound_devices()
            .first()
            .map(|device| device.minor)
            .ok_or_else(|| anyhow!("No OSR USB-FX2 board found"))?,
    };
    Ok(manager.open(minor)?)
}

fn list(manager: &DeviceManager) -> Result<()> {
    let devices = manager.bound_devices();
    if devices.is_empty() {
        println!("No OSR USB-FX2 boards bound.");
        return Ok(());
    }

    println!("Found {} board(s):\n", devices.len());
    for device in devices {
        println!("  [{}] {} ({})", device.minor, device.node_name, device.identity);
        for (role, endpoint) in [
            ("bulk-in", device.endpoints.bulk_in),
            ("bulk-out", device.endpoints.bulk_out),
            ("interrupt", device.endpoints.interrupt),
        ] {
            match endpoint {
                Some(ep) => println!(
                    "      {:<9} {:#04x} max packet {}",
                    role, ep.address, ep.max_packet_size
                ),
                None => println!("      {:<9} -", role),
            }
        }
        println!();
    }
    Ok(())
}

async fn read(manager: &DeviceManager, minor: Option<u32>, len: usize) -> Result<()> {
    let mut session = open(manager, minor)?;

    let data = tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        let count = session.read(&mut buf)?;
        buf.truncate(count);
        Ok::<_, driver::IoError>(buf)
    })
    .await
    .context("Read task failed")??;

    println!("{} byte(s): {}", data.len(), hex(&data));
    Ok(())
}

fn write(manager: &DeviceManager, minor: Option<u32>, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        bail!("Nothing to write");
    }
    let mut session = open(manager, minor)?;
    let count = session.write(data)?;
    println!("Queued {} byte(s)", count);
    Ok(())
}

fn switches(manager: &DeviceManager, minor: Option<u32>) -> Result<()> {
    let session = open(manager, minor)?;
    if !session.device().is_polling() {
        warn!("Switch endpoint is not being polled, state may be stale");
    }
    println!("{}", session.switches());
    Ok(())
}

async fn monitor(host: &UsbHost, period: Duration) -> Result<()> {
    let events = host.spawn_event_loop().context("Failed to start hot-plug")?;
    let manager = host.manager();
    let mut seen: HashMap<Minor, (u64, SwitchState)> = HashMap::new();
    let mut ticker = tokio::time::interval(period);

    println!("Monitoring switches, press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let bound = manager.bound_devices();
                seen.retain(|minor, _| bound.iter().any(|device| device.minor == *minor));

                for device in bound {
                    let session = match manager.open(device.minor) {
                        Ok(session) => session,
                        // Unplugged between listing and opening
                        Err(_) => continue,
                    };
                    let current = (session.device().switch_generation(), session.switches());
                    if seen.insert(device.minor, current) != Some(current) && current.0 > 0 {
                        println!("{} {}", device.node_name, current.1);
                    }
                }
            }
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                break;
            }
        }
    }

    events.stop();
    Ok(())
}

fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}
