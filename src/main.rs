use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use foc_motion_runtime::bus::slcan::DEFAULT_BAUDRATE;
use foc_motion_runtime::bus::{Bitrate, CanBus, LoopbackBus, SlcanBus};
use foc_motion_runtime::config::{BUS_BITRATE, BUS_PORT};
use foc_motion_runtime::drive::{DriveController, SimulatedDrives};

/// Drive FOC motor controllers on a CAN bus, commanded over zenoh
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Serial port of the slcan adapter
    #[arg(short, long, default_value = BUS_PORT)]
    port: String,

    /// Serial baud rate of the adapter
    #[arg(long, default_value_t = DEFAULT_BAUDRATE)]
    baud: u32,

    /// CAN bitrate in bit/s (10000 .. 1000000)
    #[arg(long, default_value_t = BUS_BITRATE)]
    bitrate: u32,

    /// Run against simulated drives with these ids instead of hardware (e.g. 1,2,3)
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    simulate: Option<Vec<u8>>,

    /// Skip the discovery scan at startup
    #[arg(long)]
    no_scan: bool,
}

fn open_bus(args: &Args) -> Result<Arc<dyn CanBus>, Box<dyn std::error::Error + Send + Sync>> {
    if let Some(ids) = &args.simulate {
        info!("Using loopback bus with simulated drives {:?}", ids);
        return Ok(Arc::new(LoopbackBus::with_responder(SimulatedDrives::new(
            ids.iter().copied(),
        ))));
    }

    let bitrate = Bitrate::from_bps(args.bitrate)
        .ok_or_else(|| format!("Unsupported CAN bitrate: {}", args.bitrate))?;
    info!("Opening slcan adapter on {} ({} bit/s)", args.port, args.bitrate);
    Ok(Arc::new(SlcanBus::open_with_baudrate(
        &args.port, args.baud, bitrate,
    )?))
}

async fn start(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bus = open_bus(&args)?;
    let controller = Arc::new(DriveController::start(bus)?);
    if !args.no_scan {
        controller.scan()?;
    }
    foc_motion_runtime::runtime::run(controller).await
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if let Err(e) = start(args).await {
        error!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
