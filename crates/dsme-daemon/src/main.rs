//! Daemon entry point.
//!
//! Loads configuration, classifies the boot state once, constructs the
//! module registry in dependency order, starts the dedicated watchdog
//! threads, binds the control socket, and runs the cooperative event loop
//! until a shutdown signal arrives.

mod diagnostics;
mod signals;
mod socket;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use dsme_bus::{Bus, IphbBroker, Message, SharedModule};
use dsme_common::config::RuntimeConfig;
use dsme_common::time::Timebase;
use dsme_policy::{diskmon, powertimer, DiskmonModule, PowertimerModule, ReaperModule, ThermalModule};
use dsme_state::bootstate::{classify_boot_state, cmdline_path, LoopThresholds};
use dsme_state::{RuntimeState, StateMachine};
use dsme_watchdog::{HwwdModule, ProcesswdModule};

use crate::diagnostics::{format_prometheus_metrics, DiagnosticsCollector, DiagnosticsState};
use crate::signals::SignalHandler;
use crate::socket::SocketServer;

/// Thermal objects this board exposes. Sensor transport is out of scope;
/// external callers report readings that flow in as thermal messages, so
/// this is the fixed object set diagnostics and the state machine's veto
/// logic know about.
const THERMAL_OBJECTS: &[&str] = &["battery"];

/// Module load priorities (ascending dispatch order). The watchdogs load
/// first so diagnostics wiring is live from the daemon's first dispatched
/// message; the state machine loads before the policy modules that react
/// to its `StateChangeInd`/`ChangeRunlevel` broadcasts.
mod priority {
    pub const HWWD: i32 = 10;
    pub const STATE: i32 = 20;
    pub const PROCESSWD: i32 = 30;
    pub const DISKMON: i32 = 40;
    pub const THERMAL: i32 = 41;
    pub const POWERTIMER: i32 = 42;
    pub const REAPER: i32 = 43;
}

/// Device state management daemon: boot-state arbitration, watchdog
/// supervision, and periodic policy enforcement.
#[derive(Parser, Debug)]
#[command(name = "dsme", about = "Device state management daemon", version, long_about = None)]
struct Args {
    /// Path to a runtime configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the control socket path from the configuration file.
    #[arg(long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "starting dsme");

    let config = load_config(&args)?;

    run(&config)
}

/// Initialize logging with the specified log level, applied to every
/// crate in the workspace unless `RUST_LOG` overrides it.
fn init_logging(level: &str) {
    let filter = format!(
        "dsme_daemon={level},dsme_bus={level},dsme_state={level},dsme_watchdog={level},dsme_policy={level},dsme_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .init();
}

/// Load configuration from file or use defaults, applying any
/// command-line overrides on top.
fn load_config(args: &Args) -> Result<RuntimeConfig> {
    let mut config = if let Some(config_path) = &args.config {
        RuntimeConfig::from_file(config_path).with_context(|| format!("failed to load config from {config_path:?}"))?
    } else {
        let default_path = PathBuf::from("config/default.toml");
        if default_path.exists() {
            info!(?default_path, "using default configuration file");
            RuntimeConfig::from_file(&default_path)
                .with_context(|| format!("failed to load default config from {default_path:?}"))?
        } else {
            info!("no config file found, using built-in defaults");
            RuntimeConfig::default()
        }
    };

    if let Some(socket_path) = &args.socket_path {
        config.socket_path = socket_path.clone();
    }

    Ok(config)
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Classify the boot reason against `/proc/cmdline` (or `$CMDLINE_PATH`)
/// and fold in the reboot-loop / watchdog-reset-loop detectors, producing
/// the state the daemon should start in.
fn resolve_initial_state(config: &RuntimeConfig) -> Result<RuntimeState> {
    let cmdline = std::fs::read_to_string(cmdline_path()).unwrap_or_default();
    let previous_saved_state = dsme_common::persist::read_to_string_if_exists(&config.bootstate.saved_state_path)
        .context("reading saved_state")?
        .and_then(|token| RuntimeState::parse(&token));

    let thresholds = LoopThresholds::from_config(&config.bootstate);
    let classification = classify_boot_state(
        &cmdline,
        previous_saved_state,
        unix_now(),
        &config.bootstate.counter_path,
        &thresholds,
    )
    .map_err(|e| anyhow::anyhow!("classifying boot state: {e}"))?;

    if let Some(detail) = &classification.detail {
        warn!(state = %classification.state, %detail, "boot-state selector forced MALF");
    } else {
        info!(state = %classification.state, "boot-state selector classification");
    }
    Ok(classification.state)
}

/// Window `(min, max)` an IPHB subscriber offers around a configured
/// period, giving the broker room to coalesce wake-ups (§4.3).
fn iphb_window(period: Duration) -> (Duration, Duration) {
    let slack = period / 10;
    (period.saturating_sub(slack), period + slack)
}

/// Reap any exited children (the reaper's sandboxed sweep child) via a
/// non-blocking `waitpid` loop, translating each into
/// [`Message::ProcessExited`] so [`ReaperModule`] can clear its tracked PID.
fn reap_children(bus: &mut Bus) {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: -1 waits for any child of this process; WNOHANG never
        // blocks, and `status` is a valid out-parameter for the call.
        let pid = unsafe { libc::waitpid(-1, std::ptr::addr_of_mut!(status), libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        debug!(pid, "reaped exited child");
        bus.post(Message::ProcessExited { pid });
    }
}

fn run(config: &RuntimeConfig) -> Result<()> {
    let initial_state = resolve_initial_state(config)?;

    let timebase = Timebase::capture();
    let mut bus = Bus::new();
    let diagnostics_state = Arc::new(DiagnosticsState::new());

    let hwwd = Arc::new(Mutex::new(
        HwwdModule::new(&config.hwwd, &config.realtime, bus.sender())
            .map_err(|e| anyhow::anyhow!("starting hardware watchdog kicker: {e}"))?,
    ));
    bus.load(priority::HWWD, Box::new(SharedModule::new("hwwd", hwwd.clone())));

    let state_machine = Arc::new(Mutex::new(StateMachine::with_initial_state(
        config.bootstate.saved_state_path.clone(),
        config.thermal.force_shutdown_flag_path.clone(),
        initial_state,
    )));
    bus.load(priority::STATE, Box::new(SharedModule::new("state", state_machine.clone())));

    let processwd = ProcesswdModule::new(&config.processwd, bus.sender())
        .map_err(|e| anyhow::anyhow!("starting process watchdog: {e}"))?;
    bus.load(priority::PROCESSWD, Box::new(processwd));

    bus.load(priority::DISKMON, Box::new(DiskmonModule::new(config.diskmon.clone())));

    let thermal = Arc::new(Mutex::new(ThermalModule::new(config.thermal.clone(), THERMAL_OBJECTS)));
    bus.load(priority::THERMAL, Box::new(SharedModule::new("thermal", thermal.clone())));

    let powertimer = Arc::new(Mutex::new(
        PowertimerModule::new(config.powertimer.clone(), timebase)
            .map_err(|e| anyhow::anyhow!("starting power-on timer: {e}"))?,
    ));
    bus.load(priority::POWERTIMER, Box::new(SharedModule::new("powertimer", powertimer.clone())));

    bus.load(priority::REAPER, Box::new(ReaperModule::new(config.reaper.clone())));

    let diagnostics = DiagnosticsCollector::new(
        diagnostics_state.clone(),
        state_machine.clone(),
        hwwd.clone(),
        powertimer.clone(),
        thermal.clone(),
    );

    let socket_server = SocketServer::bind(&config.socket_path).context("binding control socket")?;
    let _socket_thread = socket_server.spawn_accept_loop(bus.sender());

    let signal_handler = SignalHandler::new().context("installing signal handlers")?;

    let mut iphb = IphbBroker::new();
    let now = Instant::now();
    let (diskmon_min, diskmon_max) = iphb_window(config.diskmon.scan_interval);
    let (powertimer_min, powertimer_max) = iphb_window(config.powertimer.save_interval);
    iphb.subscribe(now, diskmon_min, diskmon_max, diskmon::OWNER_ID);
    iphb.subscribe(now, powertimer_min, powertimer_max, powertimer::OWNER_ID);

    info!(socket = %config.socket_path.display(), state = %initial_state, "dsme entering main loop");

    while !signal_handler.shutdown_requested() {
        bus.drain_external();
        reap_children(&mut bus);
        bus.dispatch_pending_with_sink(|msg| diagnostics_state.observe(msg));

        let now = Instant::now();
        let due = iphb.fire_due(now);
        for (_id, owner) in due {
            bus.post(Message::WakeupTimer { timer_id: u64::from(owner) });
            if owner == diskmon::OWNER_ID {
                iphb.subscribe(now, diskmon_min, diskmon_max, owner);
            } else if owner == powertimer::OWNER_ID {
                iphb.subscribe(now, powertimer_min, powertimer_max, owner);
            }
        }
        bus.dispatch_pending_with_sink(|msg| diagnostics_state.observe(msg));

        if signal_handler.take_reload_request() {
            info!("reload signal received (config reload not yet implemented)");
        }

        let sleep_for = iphb
            .next_fire()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_millis(200))
            .min(Duration::from_millis(200));
        std::thread::sleep(sleep_for);
    }

    info!("shutdown signal received, exiting");
    let snapshot = diagnostics.snapshot(THERMAL_OBJECTS);
    info!(
        state = %snapshot.state,
        health = %snapshot.health,
        uptime_secs = snapshot.uptime.as_secs(),
        "dsme shutdown complete"
    );
    debug!(metrics = %format_prometheus_metrics(&snapshot), "final diagnostics snapshot");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parsing_defaults() {
        let args = Args::parse_from(["dsme"]);
        assert!(args.config.is_none());
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn args_with_config_and_socket_override() {
        let args = Args::parse_from(["dsme", "-c", "test.toml", "--socket-path", "/tmp/sock"]);
        assert_eq!(args.config, Some(PathBuf::from("test.toml")));
        assert_eq!(args.socket_path, Some(PathBuf::from("/tmp/sock")));
    }

    #[test]
    fn load_config_without_file_uses_defaults() {
        let args = Args::parse_from(["dsme"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/dsme_sock"));
    }

    #[test]
    fn load_config_socket_override_wins_over_default() {
        let args = Args::parse_from(["dsme", "--socket-path", "/tmp/override_sock"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/override_sock"));
    }

    #[test]
    fn iphb_window_brackets_the_configured_period() {
        let (min, max) = iphb_window(Duration::from_secs(100));
        assert_eq!(min, Duration::from_secs(90));
        assert_eq!(max, Duration::from_secs(110));
    }

    #[test]
    fn resolve_initial_state_malfs_without_a_recognizable_cmdline() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.bootstate.saved_state_path = dir.path().join("saved_state");
        config.bootstate.counter_path = dir.path().join("boot_count");

        std::env::set_var("CMDLINE_PATH", dir.path().join("missing_cmdline"));
        let state = resolve_initial_state(&config).unwrap();
        std::env::remove_var("CMDLINE_PATH");

        assert_eq!(state, RuntimeState::Malf);
    }
}
