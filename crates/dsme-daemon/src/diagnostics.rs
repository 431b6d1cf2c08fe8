//! Diagnostics and health snapshot for the device state management daemon.
//!
//! Most of what a snapshot reports is read straight off the live module
//! state (the state machine, the power-on timer, the hardware watchdog
//! kicker). Process-watchdog client count and last-seen disk usage have no
//! dedicated query method on their modules, so [`DiagnosticsState`] derives
//! them by observing bus traffic through [`dsme_bus::Bus::dispatch_pending_with_sink`]
//! instead -- the same mechanism the control socket uses to relay replies.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dsme_bus::Message;
use dsme_policy::{PowertimerModule, ThermalModule};
use dsme_state::{RuntimeState, StateMachine};
use dsme_watchdog::HwwdModule;

/// Coarse-grained health derived from the current [`RuntimeState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Booting, not yet classified into a stable runlevel.
    Starting,
    /// `USER`: fully operational.
    Healthy,
    /// `ACTDEAD`, `LOCAL`, `TEST`: powered but not in full user mode.
    Degraded,
    /// `SHUTDOWN` or `REBOOT` in progress.
    ShuttingDown,
    /// `MALF`: malfunction runlevel.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::ShuttingDown => write!(f, "shutting_down"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[must_use]
fn health_from_state(state: RuntimeState) -> HealthStatus {
    match state {
        RuntimeState::Boot | RuntimeState::Flash => HealthStatus::Starting,
        RuntimeState::User => HealthStatus::Healthy,
        RuntimeState::ActDead | RuntimeState::Local | RuntimeState::Test => HealthStatus::Degraded,
        RuntimeState::Shutdown | RuntimeState::Reboot => HealthStatus::ShuttingDown,
        RuntimeState::Malf => HealthStatus::Unhealthy,
    }
}

/// One thermal object's last-known status, for a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThermalStatus {
    /// Object name, e.g. `battery`.
    pub object: String,
    /// Current status bucket name, e.g. `warning`.
    pub bucket: String,
    /// Whether the object is in its terminal (overheated) bucket.
    pub fatal: bool,
}

/// Snapshot of daemon diagnostics at a point in time.
#[derive(Debug, Clone)]
pub struct DiagnosticsSnapshot {
    /// Derived health.
    pub health: HealthStatus,
    /// Current operating state.
    pub state: RuntimeState,
    /// Reason given for the most recent `MALF` entry, if any.
    pub malf_reason: Option<String>,
    /// Daemon process uptime.
    pub uptime: Duration,
    /// Time since the hardware watchdog was last kicked internally. `None`
    /// before the first kick, or while an external kicker holds permission.
    pub hwwd_kick_age: Option<Duration>,
    /// Currently registered process-watchdog clients.
    pub processwd_clients: u32,
    /// Last mount path/used-percent pair reported by the disk monitor.
    pub last_disk: Option<(String, u8)>,
    /// Last-known status of every monitored thermal object.
    pub thermal: Vec<ThermalStatus>,
    /// Accumulated `USER`-mode power-on seconds.
    pub poweron_seconds: u64,
    /// Reboots observed by the power-on timer's CAL block.
    pub reboots: u32,
}

/// Bus-traffic-derived counters updated by [`DiagnosticsState::observe`],
/// called from the sink passed to `Bus::dispatch_pending_with_sink`.
#[derive(Debug)]
pub struct DiagnosticsState {
    processwd_clients: AtomicU32,
    /// Packed `(used_percent << 1) | 1` so 0 can mean "never reported",
    /// avoiding a mutex on the hot message-observation path. The mount path
    /// itself changes rarely enough that a `Mutex<Option<String>>` is fine.
    last_disk_percent: AtomicI64,
    last_disk_mount: Mutex<Option<String>>,
    start_time: Instant,
}

impl Default for DiagnosticsState {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsState {
    /// Create a fresh diagnostics state, uptime measured from now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            processwd_clients: AtomicU32::new(0),
            last_disk_percent: AtomicI64::new(-1),
            last_disk_mount: Mutex::new(None),
            start_time: Instant::now(),
        }
    }

    /// Fold one bus message into the running counters. Safe to call for
    /// every message, including ones this module doesn't care about.
    pub fn observe(&self, msg: &Message) {
        match msg {
            Message::ProcesswdCreate { .. } => {
                self.processwd_clients.fetch_add(1, Ordering::Relaxed);
            }
            Message::ProcesswdDelete { .. } | Message::ProcessExited { .. } => {
                // Only ever decremented below zero if Delete/Exited arrives
                // without a matching Create, which the process watchdog
                // itself guards against; saturating keeps this module
                // robust regardless.
                let _ = self
                    .processwd_clients
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
            }
            Message::DiskSpace { mount_path, used_percent } => {
                self.last_disk_percent.store(i64::from(*used_percent), Ordering::Relaxed);
                *self.last_disk_mount.lock().unwrap() = Some(mount_path.clone());
            }
            _ => {}
        }
    }

    fn processwd_clients(&self) -> u32 {
        self.processwd_clients.load(Ordering::Relaxed)
    }

    fn last_disk(&self) -> Option<(String, u8)> {
        let percent = self.last_disk_percent.load(Ordering::Relaxed);
        if percent < 0 {
            return None;
        }
        let mount = self.last_disk_mount.lock().unwrap().clone()?;
        Some((mount, percent as u8))
    }

    fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Aggregates live module state and bus-observed counters into a
/// [`DiagnosticsSnapshot`].
pub struct DiagnosticsCollector {
    state: Arc<DiagnosticsState>,
    state_machine: Arc<Mutex<StateMachine>>,
    hwwd: Arc<Mutex<HwwdModule>>,
    powertimer: Arc<Mutex<PowertimerModule>>,
    thermal: Arc<Mutex<ThermalModule>>,
}

impl DiagnosticsCollector {
    /// Build a collector over the daemon's shared live modules.
    #[must_use]
    pub fn new(
        state: Arc<DiagnosticsState>,
        state_machine: Arc<Mutex<StateMachine>>,
        hwwd: Arc<Mutex<HwwdModule>>,
        powertimer: Arc<Mutex<PowertimerModule>>,
        thermal: Arc<Mutex<ThermalModule>>,
    ) -> Self {
        Self { state, state_machine, hwwd, powertimer, thermal }
    }

    /// The bus-traffic counters, so callers can feed `Bus::dispatch_pending_with_sink`.
    #[must_use]
    pub fn state(&self) -> &Arc<DiagnosticsState> {
        &self.state
    }

    /// Take a diagnostics snapshot.
    pub fn snapshot(&self, thermal_objects: &[&str]) -> DiagnosticsSnapshot {
        let (runtime_state, malf_reason) = {
            let machine = self.state_machine.lock().unwrap();
            (machine.state(), machine.malf_reason().map(str::to_string))
        };
        let hwwd_kick_age = self.hwwd.lock().unwrap().last_kick_age();
        let (poweron_seconds, reboots) = {
            let timer = self.powertimer.lock().unwrap();
            (timer.poweron_seconds(), timer.reboots())
        };
        let thermal = {
            let thermal = self.thermal.lock().unwrap();
            thermal_objects
                .iter()
                .filter_map(|&object| {
                    thermal.status(object).map(|(bucket, fatal)| ThermalStatus {
                        object: object.to_string(),
                        bucket: bucket.to_string(),
                        fatal,
                    })
                })
                .collect()
        };

        DiagnosticsSnapshot {
            health: health_from_state(runtime_state),
            state: runtime_state,
            malf_reason,
            uptime: self.state.uptime(),
            hwwd_kick_age,
            processwd_clients: self.state.processwd_clients(),
            last_disk: self.state.last_disk(),
            thermal,
            poweron_seconds,
            reboots,
        }
    }
}

/// Format a snapshot as Prometheus text exposition format.
#[must_use]
pub fn format_prometheus_metrics(snapshot: &DiagnosticsSnapshot) -> String {
    let mut out = String::new();

    out.push_str("# HELP dsme_health daemon health (1=healthy, 0=not healthy)\n");
    out.push_str("# TYPE dsme_health gauge\n");
    out.push_str(&format!(
        "dsme_health{{status=\"{}\"}} {}\n",
        snapshot.health,
        i32::from(snapshot.health == HealthStatus::Healthy)
    ));

    out.push_str("# HELP dsme_state current operating state\n");
    out.push_str("# TYPE dsme_state gauge\n");
    out.push_str(&format!("dsme_state{{state=\"{}\"}} 1\n", snapshot.state));

    out.push_str("# HELP dsme_uptime_seconds daemon process uptime\n");
    out.push_str("# TYPE dsme_uptime_seconds gauge\n");
    out.push_str(&format!("dsme_uptime_seconds {:.3}\n", snapshot.uptime.as_secs_f64()));

    if let Some(age) = snapshot.hwwd_kick_age {
        out.push_str("# HELP dsme_hwwd_kick_age_seconds time since the hardware watchdog was last kicked\n");
        out.push_str("# TYPE dsme_hwwd_kick_age_seconds gauge\n");
        out.push_str(&format!("dsme_hwwd_kick_age_seconds {:.3}\n", age.as_secs_f64()));
    }

    out.push_str("# HELP dsme_processwd_clients registered process-watchdog clients\n");
    out.push_str("# TYPE dsme_processwd_clients gauge\n");
    out.push_str(&format!("dsme_processwd_clients {}\n", snapshot.processwd_clients));

    if let Some((mount, percent)) = &snapshot.last_disk {
        out.push_str("# HELP dsme_disk_used_percent last-reported mount usage\n");
        out.push_str("# TYPE dsme_disk_used_percent gauge\n");
        out.push_str(&format!("dsme_disk_used_percent{{mount=\"{mount}\"}} {percent}\n"));
    }

    if !snapshot.thermal.is_empty() {
        out.push_str("# HELP dsme_thermal_fatal whether a thermal object is in its terminal bucket\n");
        out.push_str("# TYPE dsme_thermal_fatal gauge\n");
        for t in &snapshot.thermal {
            out.push_str(&format!(
                "dsme_thermal_fatal{{object=\"{}\",bucket=\"{}\"}} {}\n",
                t.object,
                t.bucket,
                i32::from(t.fatal)
            ));
        }
    }

    out.push_str("# HELP dsme_poweron_seconds accumulated USER-mode power-on seconds\n");
    out.push_str("# TYPE dsme_poweron_seconds counter\n");
    out.push_str(&format!("dsme_poweron_seconds {}\n", snapshot.poweron_seconds));

    out.push_str("# HELP dsme_reboots_total reboots observed by the power-on timer\n");
    out.push_str("# TYPE dsme_reboots_total counter\n");
    out.push_str(&format!("dsme_reboots_total {}\n", snapshot.reboots));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsme_common::config::{PowertimerConfig, ThermalConfig};
    use dsme_common::time::Timebase;
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn collector(dir: &std::path::Path) -> DiagnosticsCollector {
        let state_machine = Arc::new(Mutex::new(StateMachine::with_initial_state(
            dir.join("saved_state"),
            dir.join("force_shutdown"),
            RuntimeState::User,
        )));
        let (tx, _rx) = mpsc::channel();
        let hwwd_config = dsme_common::config::HwwdConfig { devices: vec![], ..Default::default() };
        let realtime_config = dsme_common::config::RealtimeConfig { enabled: false, ..Default::default() };
        let hwwd = Arc::new(Mutex::new(HwwdModule::new(&hwwd_config, &realtime_config, tx).unwrap()));
        let powertimer_config = PowertimerConfig { cal_path: dir.join("power_on_timer"), ..Default::default() };
        let powertimer =
            Arc::new(Mutex::new(PowertimerModule::new(powertimer_config, Timebase::with_uptime(Duration::ZERO)).unwrap()));
        let thermal_config = ThermalConfig { force_shutdown_flag_path: dir.join("force_shutdown"), ..Default::default() };
        let thermal = Arc::new(Mutex::new(ThermalModule::new(thermal_config, &["battery"])));

        DiagnosticsCollector::new(Arc::new(DiagnosticsState::new()), state_machine, hwwd, powertimer, thermal)
    }

    #[test]
    fn health_from_state_maps_every_runtime_state() {
        assert_eq!(health_from_state(RuntimeState::Boot), HealthStatus::Starting);
        assert_eq!(health_from_state(RuntimeState::User), HealthStatus::Healthy);
        assert_eq!(health_from_state(RuntimeState::ActDead), HealthStatus::Degraded);
        assert_eq!(health_from_state(RuntimeState::Shutdown), HealthStatus::ShuttingDown);
        assert_eq!(health_from_state(RuntimeState::Malf), HealthStatus::Unhealthy);
    }

    #[test]
    fn observe_tracks_processwd_client_count() {
        let state = DiagnosticsState::new();
        let endpoint = dsme_bus::Endpoint::broadcast();
        state.observe(&Message::ProcesswdCreate { pid: 1, endpoint: endpoint.clone() });
        state.observe(&Message::ProcesswdCreate { pid: 2, endpoint });
        assert_eq!(state.processwd_clients(), 2);

        state.observe(&Message::ProcesswdDelete { pid: 1 });
        assert_eq!(state.processwd_clients(), 1);
    }

    #[test]
    fn observe_tracks_last_disk_report() {
        let state = DiagnosticsState::new();
        assert!(state.last_disk().is_none());

        state.observe(&Message::DiskSpace { mount_path: "/".into(), used_percent: 95 });
        assert_eq!(state.last_disk(), Some(("/".to_string(), 95)));
    }

    #[test]
    fn snapshot_reflects_live_state_machine() {
        let dir = tempdir().unwrap();
        let collector = collector(dir.path());
        let snapshot = collector.snapshot(&["battery"]);
        assert_eq!(snapshot.state, RuntimeState::User);
        assert_eq!(snapshot.health, HealthStatus::Healthy);
        assert_eq!(snapshot.thermal.len(), 1);
        assert_eq!(snapshot.thermal[0].bucket, "normal");
    }

    #[test]
    fn prometheus_output_contains_core_series() {
        let dir = tempdir().unwrap();
        let collector = collector(dir.path());
        let snapshot = collector.snapshot(&["battery"]);
        let output = format_prometheus_metrics(&snapshot);

        assert!(output.contains("dsme_health"));
        assert!(output.contains("dsme_state{state=\"USER\"}"));
        assert!(output.contains("dsme_processwd_clients 0"));
        assert!(output.contains("dsme_poweron_seconds"));
        assert!(output.contains("dsme_reboots_total"));
    }

    #[test]
    fn empty_outgoing_sink_loop() {
        // Demonstrates the sink pattern main.rs uses: observe() is called
        // for every message, unconditionally, as `Bus::dispatch_pending_with_sink`'s sink.
        let state = DiagnosticsState::new();
        let mut outgoing = VecDeque::new();
        outgoing.push_back(Message::BaseBootDone);
        for msg in &outgoing {
            state.observe(msg);
        }
        assert_eq!(state.processwd_clients(), 0);
    }
}
