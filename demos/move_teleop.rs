// Keyboard move teleop: A/D jog, 1/2/3 step size, S scan, Space cancel, Q quit
//
// Publishes move commands to a running foc-motion-runtime over zenoh.
//
// Usage: cargo run --example move_teleop -- [device ids, e.g. 1,2]
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use foc_motion_runtime::config::{DEFAULT_MAX_ACCELERATION, DEFAULT_MAX_VELOCITY, TOPIC_CMD};
use foc_motion_runtime::messages::RuntimeCommand;
use foc_motion_runtime::protocol::DeviceId;
use std::time::Duration;
use tracing::info;

const STEPS: [f64; 3] = [0.1, std::f64::consts::FRAC_PI_2, std::f64::consts::TAU]; // rad

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let devices = match std::env::args().nth(1) {
        Some(raw) => raw
            .split(',')
            .map(|id| id.trim().parse::<DeviceId>())
            .collect::<Result<Vec<_>, _>>()?,
        None => vec![1],
    };

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD).await?;

    info!("Moving devices {:?}", devices);
    info!("Controls: A/D=jog, 1/2/3=step, S=scan, Space=cancel, Q=quit");
    print_step(0);

    enable_raw_mode()?;
    let result = run_teleop(&publisher, devices).await;
    disable_raw_mode()?;

    result
}

async fn send(
    publisher: &zenoh::pubsub::Publisher<'_>,
    cmd: &RuntimeCommand,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    publisher.put(serde_json::to_string(cmd)?).await?;
    Ok(())
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
    devices: Vec<DeviceId>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut step_idx: usize = 0;

    // Absolute target angle, starting from zero
    let mut target = 0.0;

    loop {
        if !event::poll(Duration::from_millis(20))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        // Moves are one-shot, so ignore key repeat
        if kind != KeyEventKind::Press {
            continue;
        }

        let cmd = match code {
            KeyCode::Char('a') | KeyCode::Char('d') => {
                let step = STEPS[step_idx];
                target += if code == KeyCode::Char('a') { -step } else { step };
                info!("Target: {:.3} rad", target);
                RuntimeCommand::Move {
                    devices: devices.clone(),
                    target,
                    max_velocity: DEFAULT_MAX_VELOCITY,
                    max_acceleration: DEFAULT_MAX_ACCELERATION,
                }
            }
            KeyCode::Char(c @ '1'..='3') => {
                step_idx = (c as usize) - ('1' as usize);
                print_step(step_idx);
                continue;
            }
            KeyCode::Char('s') => RuntimeCommand::Scan,
            KeyCode::Char(' ') => RuntimeCommand::Cancel,
            KeyCode::Char('q') | KeyCode::Esc => break,
            _ => continue,
        };
        send(publisher, &cmd).await?;
    }

    // Leave the drives still on exit
    send(publisher, &RuntimeCommand::Cancel).await?;
    Ok(())
}

fn print_step(idx: usize) {
    info!("Step: {:.3} rad", STEPS[idx]);
}
