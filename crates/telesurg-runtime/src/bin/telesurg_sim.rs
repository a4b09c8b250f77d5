//! Closed-loop teleoperation simulator
//!
//! Drives simulated arms from a synthetic surgeon: each console channel traces
//! a slow figure-eight while the gripper opens and closes. With `--loopback`
//! the session also streams its instrument states to a second transport on
//! localhost, whose pongs keep the heartbeat watchdog fed.
//!
//! Usage:
//!   telesurg-sim --duration-ms 3000
//!   telesurg-sim --arms 3 --loopback --log-format json
//!   RUST_LOG=telesurg_runtime=debug telesurg-sim --config session.json

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use telesurg_core::{
    ButtonStates, Clock, MasterSample, MonotonicClock, Quaternion, RobotConfiguration, ScriptedConsole, StreamProtocol,
    Vec3,
};
use telesurg_runtime::{
    forward_transport_events, init_tracing, ControlEvent, ControlLoop, ControlSession, LogFormat, SessionCommand,
    SessionConfig,
};
use telesurg_transport::{StreamingTransport, TransportConfig, TransportEvent};

/// Samples queued per channel before the synthetic surgeon waits
const MAX_PENDING: usize = 4;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Session configuration (JSON); defaults are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of arms when no configuration file is given (2 or 3)
    #[arg(long, default_value = "2")]
    arms: usize,

    /// How long the procedure runs
    #[arg(long, default_value = "2000")]
    duration_ms: u64,

    /// Figure-eight amplitude at the console, mm
    #[arg(long, default_value = "30.0")]
    amplitude: f32,

    /// Stream instrument states to a local peer transport
    #[arg(long)]
    loopback: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Default)]
struct Summary {
    updates: u64,
    haptics: u64,
    latency_warnings: u64,
    faults: u64,
    emergency_stops: u64,
    remote_states: u64,
}

fn load_config(args: &Args) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    if let Some(path) = &args.config {
        return Ok(SessionConfig::from_json_file(path)?);
    }
    let mut config = SessionConfig::default();
    match args.arms {
        2 => {}
        3 => config.robot = RobotConfiguration::three_arm(),
        n => return Err(format!("unsupported arm count {}", n).into()),
    }
    if args.loopback {
        config.streaming.protocol = StreamProtocol::Datagram;
    }
    config.validate()?;
    Ok(config)
}

/// Synthetic surgeon hand motion for one channel at time `t` seconds
fn surgeon_sample(channel: usize, t: f32, amplitude: f32, clock: &dyn Clock) -> MasterSample {
    let phase = channel as f32 * std::f32::consts::FRAC_PI_2;
    let w = std::f32::consts::TAU * 0.25;
    let angle = w * t + phase;
    MasterSample {
        timestamp: clock.now(),
        position: Vec3::new(amplitude * angle.sin(), 0.5 * amplitude * (2.0 * angle).sin(), 0.0),
        orientation: Quaternion::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), 0.2 * angle.sin()),
        gripper: 0.5 + 0.5 * (0.5 * angle).sin(),
        buttons: ButtonStates::NONE,
    }
}

fn spawn_surgeon(
    console: ScriptedConsole,
    channels: usize,
    amplitude: f32,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<u64>> {
    thread::Builder::new().name("telesurg-surgeon".into()).spawn(move || {
        let start = clock.now();
        let mut pushed = 0u64;
        while running.load(Ordering::Relaxed) {
            let t = clock.now().since(start).as_secs_f32();
            for channel in 0..channels {
                if console.pending(channel) < MAX_PENDING {
                    console.push_sample(channel, surgeon_sample(channel, t, amplitude, clock.as_ref()));
                    pushed += 1;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
        pushed
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_format)?;

    let config = load_config(&args)?;
    let arm_count = config.robot.arm_count;
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());

    let console = ScriptedConsole::new(arm_count);
    let mut session = ControlSession::simulated(config.clone(), console.clone())?;

    let mut remote_events = None;
    let mut remote_handle = None;
    let mut transport_events = None;
    if args.loopback {
        let remote_config = TransportConfig {
            bind: "127.0.0.1:0".parse()?,
            prediction: config.prediction_config(),
            ..TransportConfig::new(config.streaming.clone(), arm_count)
        };
        let (remote, handle, remote_rx) = StreamingTransport::bind(remote_config, Arc::clone(&clock)).await?;
        let remote_addr = remote.datagram_addr().ok_or("remote transport has no datagram channel")?;
        tokio::spawn(remote.run());
        remote_handle = Some(handle);

        let local_config = TransportConfig {
            bind: "127.0.0.1:0".parse()?,
            peer: Some(remote_addr),
            prediction: config.prediction_config(),
            ..TransportConfig::new(config.streaming.clone(), arm_count)
        };
        let (local, handle, local_rx) = StreamingTransport::bind(local_config, Arc::clone(&clock)).await?;
        tokio::spawn(local.run());

        info!(%remote_addr, "loopback transport up");
        session.attach_transport(handle);
        remote_events = Some(remote_rx);
        transport_events = Some(local_rx);
    }

    session.connect(clock.now())?;
    info!(session = %session.session_id(), arms = arm_count, "session ready");

    let (control, mut events) = ControlLoop::spawn(session, Arc::clone(&clock), 256, 8192)?;
    let commands = control.commands();

    match transport_events {
        // pongs from the peer feed the watchdog
        Some(rx) => {
            tokio::spawn(forward_transport_events(rx, commands.clone()));
        }
        None => {
            let heartbeat = commands.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(20));
                loop {
                    ticker.tick().await;
                    if heartbeat.send(SessionCommand::Heartbeat).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    let remote_states = Arc::new(AtomicU64::new(0));
    if let Some(mut rx) = remote_events {
        let remote_states = Arc::clone(&remote_states);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, TransportEvent::RemoteState(_)) {
                    remote_states.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }

    let running = Arc::new(AtomicBool::new(true));
    let surgeon = spawn_surgeon(console, arm_count, args.amplitude, Arc::clone(&clock), Arc::clone(&running))?;
    control.send(SessionCommand::StartProcedure)?;

    let mut summary = Summary::default();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(args.duration_ms);
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            event = events.recv() => match event {
                Some(ControlEvent::InstrumentUpdate(_)) => summary.updates += 1,
                Some(ControlEvent::HapticFeedback(_)) => summary.haptics += 1,
                Some(ControlEvent::LatencyWarning(ms)) => {
                    summary.latency_warnings += 1;
                    warn!(latency_ms = ms, "latency warning");
                }
                Some(ControlEvent::InstrumentFault { instrument, reason }) => {
                    summary.faults += 1;
                    warn!(%instrument, %reason, "instrument fault");
                }
                Some(ControlEvent::EmergencyStop) => {
                    summary.emergency_stops += 1;
                    warn!("emergency stop");
                }
                Some(ControlEvent::StateChanged { from, to }) => info!(%from, %to, "session state changed"),
                None => break,
            },
        }
    }

    running.store(false, Ordering::Relaxed);
    let pushed = surgeon.join().map_err(|_| "surgeon thread panicked")?;
    let outcome = tokio::task::spawn_blocking(move || control.shutdown()).await??;
    summary.remote_states = remote_states.load(Ordering::Relaxed);
    drop(remote_handle);

    let stats = outcome.session.engine().stats();
    info!(
        ticks = outcome.stats.ticks,
        overruns = outcome.stats.overruns,
        longest_tick = ?outcome.stats.longest_tick,
        samples = pushed,
        commands = stats.commands,
        holds = stats.holds,
        updates = summary.updates,
        haptics = summary.haptics,
        latency_warnings = summary.latency_warnings,
        faults = summary.faults,
        emergency_stops = summary.emergency_stops,
        remote_states = summary.remote_states,
        final_state = %outcome.session.state(),
        "simulation finished"
    );
    Ok(())
}
