//! Power-on timer: durable accumulation of seconds spent in `USER` mode.
//!
//! Backed by a small versioned CAL ("calibration area") block rather than
//! the ordinary filesystem counter files the boot-state selector uses,
//! since the original value must survive both reboots and a factory
//! re-flash. The in-memory clock source is `CLOCK_MONOTONIC` (via
//! [`dsme_common::time::Timebase`]) plus the one-time `/proc/uptime` offset
//! it captures at startup, so accumulated seconds never depend on a
//! wall-clock that can jump underneath the daemon.

use std::path::Path;
use std::time::Duration;

use dsme_bus::{BusContext, Message, Module};
use dsme_common::config::PowertimerConfig;
use dsme_common::error::DsmeResult;
use dsme_common::persist;
use dsme_common::time::Timebase;
use dsme_state::RuntimeState;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// IPHB owner id / [`Message::WakeupTimer`] correlation id for this module.
pub const OWNER_ID: u32 = 3;

const CAL_VERSION: u32 = 1;

/// The persisted power-on-timer CAL block. `#[serde(default)]` on every
/// field but `version` lets a v0, header-only record (just
/// `version = 0`, written by an ancestor of this module that never
/// allocated the data fields) still parse instead of being rejected and
/// losing the CAL slot; it comes back as a v0 block with all-zero
/// counters, which [`load_cal`] then upgrades to [`CAL_VERSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CalBlock {
    version: u32,
    #[serde(default)]
    poweron_secs: u64,
    #[serde(default)]
    reboots: u32,
    #[serde(default)]
    uptime_at_last_write_secs: u64,
    /// Number of times this CAL block has been written to disk.
    #[serde(default)]
    updates: u32,
}

impl Default for CalBlock {
    fn default() -> Self {
        Self { version: CAL_VERSION, poweron_secs: 0, reboots: 0, uptime_at_last_write_secs: 0, updates: 0 }
    }
}

fn load_cal(path: &Path) -> DsmeResult<CalBlock> {
    match persist::read_to_string_if_exists(path)? {
        Some(text) => {
            let mut cal: CalBlock = toml::from_str(&text)
                .map_err(|e| dsme_common::error::DsmeError::IoError(format!("parsing CAL block: {e}")))?;
            if cal.version < CAL_VERSION {
                debug!(from_version = cal.version, to_version = CAL_VERSION, "upgrading CAL block");
                cal.version = CAL_VERSION;
            }
            Ok(cal)
        }
        None => Ok(CalBlock::default()),
    }
}

fn save_cal(path: &Path, cal: &CalBlock) -> DsmeResult<()> {
    let text = toml::to_string(cal)
        .map_err(|e| dsme_common::error::DsmeError::IoError(format!("serializing CAL block: {e}")))?;
    persist::write_atomic(path, text.as_bytes())
}

/// `limit(x)`: how large the accumulated `delta` must grow before it is
/// flushed to the CAL block, as a function of total accumulated power-on
/// time so far. Preserved verbatim from the original's step function.
#[must_use]
pub fn limit(poweron_secs: u64) -> Duration {
    const EIGHT_HOURS: u64 = 8 * 3600;
    const SEVEN_DAYS: u64 = 7 * 24 * 3600;
    const THIRTY_DAYS: u64 = 30 * 24 * 3600;

    if poweron_secs < EIGHT_HOURS {
        Duration::from_secs(15 * 60)
    } else if poweron_secs < SEVEN_DAYS {
        Duration::from_secs(3600)
    } else if poweron_secs < THIRTY_DAYS {
        Duration::from_secs(6 * 3600)
    } else {
        Duration::from_secs(24 * 3600)
    }
}

/// Module-kernel participant accumulating `USER`-mode power-on seconds.
pub struct PowertimerModule {
    config: PowertimerConfig,
    cal: CalBlock,
    timebase: Timebase,
    current_state: Option<RuntimeState>,
}

impl PowertimerModule {
    /// Load the CAL block (or start a fresh one) and begin tracking from
    /// `timebase`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing CAL block fails to parse.
    pub fn new(config: PowertimerConfig, timebase: Timebase) -> DsmeResult<Self> {
        let cal = load_cal(&config.cal_path)?;
        Ok(Self { config, cal, timebase, current_state: None })
    }

    /// `cal.poweron + current_delta_if_user_mode_else_0`, the power-on
    /// timer query.
    #[must_use]
    pub fn poweron_seconds(&self) -> u64 {
        self.cal.poweron_secs + self.pending_delta()
    }

    /// Reboots observed since this CAL block was first created.
    #[must_use]
    pub fn reboots(&self) -> u32 {
        self.cal.reboots
    }

    fn pending_delta(&self) -> u64 {
        if self.current_state != Some(RuntimeState::User) {
            return 0;
        }
        self.timebase.uptime_now().as_secs().saturating_sub(self.cal.uptime_at_last_write_secs)
    }

    fn tick(&mut self) {
        let uptime_now = self.timebase.uptime_now().as_secs();
        let mut delta = uptime_now.saturating_sub(self.cal.uptime_at_last_write_secs);

        let rebooted = uptime_now < self.cal.uptime_at_last_write_secs;
        if rebooted {
            self.cal.reboots += 1;
            delta = uptime_now;
        }
        if self.current_state != Some(RuntimeState::User) {
            delta = 0;
        }

        let threshold = limit(self.cal.poweron_secs).as_secs();
        if rebooted || delta >= threshold {
            self.flush(uptime_now, delta);
        }
    }

    fn flush(&mut self, uptime_now: u64, delta: u64) {
        self.cal.poweron_secs += delta;
        self.cal.uptime_at_last_write_secs = uptime_now;
        self.cal.updates += 1;
        if let Err(e) = save_cal(&self.config.cal_path, &self.cal) {
            warn!(error = %e, "failed to persist power-on-timer CAL block");
        } else {
            debug!(poweron_secs = self.cal.poweron_secs, reboots = self.cal.reboots, "power-on timer flushed");
        }
    }

    fn on_state_change(&mut self, state: RuntimeState) {
        let entering_user = state == RuntimeState::User && self.current_state != Some(RuntimeState::User);
        let forced = entering_user
            || matches!(state, RuntimeState::Shutdown | RuntimeState::Reboot | RuntimeState::Malf);

        self.current_state = Some(state);

        if forced {
            let uptime_now = self.timebase.uptime_now().as_secs();
            let delta = self.pending_delta();
            self.flush(uptime_now, delta);
        }
    }
}

impl Module for PowertimerModule {
    fn name(&self) -> &str {
        "powertimer"
    }

    fn handle(&mut self, msg: &Message, _ctx: &mut BusContext<'_>) {
        match msg {
            Message::StateChangeInd { state_code } => {
                if let Some(state) = RuntimeState::from_code(*state_code) {
                    self.on_state_change(state);
                }
            }
            Message::WakeupTimer { timer_id } if *timer_id as u32 == OWNER_ID => {
                self.tick();
            }
            _ => {}
        }
    }
}
