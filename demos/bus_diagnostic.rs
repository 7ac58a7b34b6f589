// Bus diagnostic: READ-ONLY scan of every drive on the bus
//
// Sends a discovery broadcast and register read requests only. Nothing is
// written to the drives and nothing moves.
//
// Usage: cargo run --example bus_diagnostic -- [port] [bitrate]
// Example: cargo run --example bus_diagnostic -- /dev/ttyACM0 1000000
//          cargo run --example bus_diagnostic -- sim

use foc_motion_runtime::bus::{Bitrate, CanBus, LoopbackBus, SlcanBus};
use foc_motion_runtime::config::{BUS_BITRATE, BUS_PORT};
use foc_motion_runtime::drive::{DriveController, SimulatedDrives};
use foc_motion_runtime::protocol::{PARAMETER_REGISTERS, Register};
use std::sync::Arc;
use std::time::Duration;

// How long to collect discovery replies
const DISCOVERY_WINDOW: Duration = Duration::from_millis(500);

// Extra time for the last parameter echoes to arrive
const ECHO_WINDOW: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| BUS_PORT.to_string());
    let bitrate_bps = match args.next() {
        Some(raw) => raw.parse::<u32>()?,
        None => BUS_BITRATE,
    };

    println!("FOC Bus Diagnostic (READ-ONLY)");
    println!("  Discovery and register reads only, no writes, no movement");
    println!();

    // Step 1: open the bus
    println!("Step 1: Opening bus...");
    let bus: Arc<dyn CanBus> = if port == "sim" {
        println!("  Using simulated drives 1, 2");
        Arc::new(LoopbackBus::with_responder(SimulatedDrives::new([1, 2])))
    } else {
        let bitrate = Bitrate::from_bps(bitrate_bps)
            .ok_or_else(|| format!("Unsupported CAN bitrate: {}", bitrate_bps))?;
        match SlcanBus::open(&port, bitrate) {
            Ok(bus) => {
                println!("  OK: {} at {} bit/s", port, bitrate_bps);
                Arc::new(bus)
            }
            Err(e) => {
                println!("  FAILED to open {}: {}", port, e);
                println!();
                println!("Troubleshooting:");
                println!("  - Check the port path is correct");
                println!("  - Verify the adapter speaks slcan and the bus is terminated");
                println!("  - All drives must use the same bitrate");
                return Err(e.into());
            }
        }
    };
    let controller = DriveController::start(bus)?;
    println!();

    // Step 2: discovery
    println!("Step 2: Scanning for drives...");
    controller.scan()?;
    tokio::time::sleep(DISCOVERY_WINDOW).await;
    let devices = controller.devices();
    if devices.is_empty() {
        println!("  No drives answered.");
        println!("  - Check drive power and CAN wiring");
        println!("  - Check CANH/CANL are not swapped");
        return Ok(());
    }
    for device in &devices {
        println!(
            "  Drive {:3}: angle {:8.3} rad, velocity {:7.2} rad/s, Iq {:6.3} A",
            device.id, device.angle, device.velocity, device.current_q
        );
    }
    println!();

    // Step 3: parameters
    println!("Step 3: Reading parameters...");
    for device in &devices {
        controller.request_register(device.id, Register::Status)?;
        controller.request_all_parameters(device.id).await?;
    }
    tokio::time::sleep(ECHO_WINDOW).await;
    println!();

    for device in controller.devices() {
        println!("  === Drive {} ===", device.id);
        println!(
            "    Enabled:       {}",
            if device.enabled { "YES" } else { "no" }
        );
        println!("    Control mode:  {:?}", device.control_mode);
        println!("    State:         {:?}", device.state);
        for register in PARAMETER_REGISTERS {
            match device.parameter(register) {
                Some(value) => println!("    {:<20} {:>12.6}", format!("{:?}", register), value),
                None => println!("    {:<20} {:>12}", format!("{:?}", register), "no reply"),
            }
        }
        println!();
    }

    println!("Diagnostic complete.");
    Ok(())
}
