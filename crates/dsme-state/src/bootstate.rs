//! Boot-state selector and reboot/watchdog-reset loop detector.
//!
//! Run once per boot (conceptually by the external `bootstate` CLI, which
//! this crate only supplies the decision logic for): classify `/proc/cmdline`
//! against the normative table, then fold in loop detection against the
//! persisted `<last_time> <boots> <wd_resets>` counter file so a device
//! stuck rebooting (or stuck tripping its hardware watchdog) escalates to
//! `MALF` instead of looping forever.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dsme_common::error::{DsmeError, DsmeResult};
use dsme_common::persist;

use crate::machine::RuntimeState;

/// The two cmdline keys the boot-state selector reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootReason {
    /// Value of `bootmode=`, if present.
    pub bootmode: Option<String>,
    /// Value of `bootreason=`, if present.
    pub bootreason: Option<String>,
}

/// A reentrant tokenizer over a borrowed `/proc/cmdline` string, replacing
/// the original's `strtok` parsing (§9 REDESIGN FLAGS).
#[must_use]
pub fn parse_cmdline(cmdline: &str) -> BootReason {
    let mut reason = BootReason::default();
    for token in cmdline.split_whitespace() {
        if let Some(value) = token.strip_prefix("bootmode=") {
            reason.bootmode = Some(value.to_string());
        } else if let Some(value) = token.strip_prefix("bootreason=") {
            reason.bootreason = Some(value.to_string());
        }
    }
    reason
}

/// Kind of boot cause, collapsing the many literal `bootreason=` strings
/// into the groups the decision table actually distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonKind {
    /// `por`: plain power-on reset.
    PowerOnReset,
    /// `swdg_to` or `32wd_to`: hardware-watchdog-induced reset.
    WatchdogReset,
    /// `sw_rst`: software-initiated reset.
    SoftwareReset,
    /// `pwr_key`: power key held.
    PowerKey,
    /// `nsu`: normal startup.
    NormalStartup,
    /// `charger`, `usb`, or `rtc_alarm`: ACT_DEAD wake sources.
    ActDeadWake,
    /// `sec_vio`: security violation.
    SecurityViolation,
    /// Any other (or missing) bootreason.
    Other,
}

impl ReasonKind {
    fn classify(bootreason: Option<&str>) -> Self {
        match bootreason {
            Some("por") => Self::PowerOnReset,
            Some("swdg_to" | "32wd_to") => Self::WatchdogReset,
            Some("sw_rst") => Self::SoftwareReset,
            Some("pwr_key") => Self::PowerKey,
            Some("nsu") => Self::NormalStartup,
            Some("charger" | "usb" | "rtc_alarm") => Self::ActDeadWake,
            Some("sec_vio") => Self::SecurityViolation,
            _ => Self::Other,
        }
    }
}

/// Result of running the boot-state decision table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootClassification {
    /// The selected operating state.
    pub state: RuntimeState,
    /// Human-readable explanation, populated for `MALF` outcomes and
    /// surfaced as the `bootstate` tool's second token in force mode.
    pub detail: Option<String>,
}

impl BootClassification {
    fn malf(detail: &str) -> Self {
        Self { state: RuntimeState::Malf, detail: Some(detail.to_string()) }
    }

    fn plain(state: RuntimeState) -> Self {
        Self { state, detail: None }
    }
}

/// Classify a boot against the normative decision table (§4.7), given the
/// previously saved state (read from `saved_state`, if any).
#[must_use]
pub fn classify(reason: &BootReason, previous_saved_state: Option<RuntimeState>) -> BootClassification {
    if reason.bootmode.as_deref() == Some("update") {
        return BootClassification::plain(RuntimeState::Flash);
    }
    if reason.bootmode.as_deref() == Some("local") {
        return BootClassification::plain(RuntimeState::Local);
    }
    if reason.bootmode.as_deref() == Some("test") {
        return BootClassification::plain(RuntimeState::Test);
    }

    match ReasonKind::classify(reason.bootreason.as_deref()) {
        ReasonKind::SecurityViolation => BootClassification::malf("security violation"),
        ReasonKind::Other if reason.bootreason.is_none() => BootClassification::malf("no bootreason"),
        ReasonKind::PowerOnReset | ReasonKind::WatchdogReset => {
            let saved = previous_saved_state.unwrap_or(RuntimeState::User);
            let resolved = if saved == RuntimeState::ActDead { RuntimeState::User } else { saved };
            BootClassification::plain(resolved)
        }
        ReasonKind::SoftwareReset => {
            let saved = previous_saved_state.unwrap_or(RuntimeState::User);
            let normal_mode = matches!(reason.bootmode.as_deref(), Some("normal") | None);
            if normal_mode && !matches!(saved, RuntimeState::User | RuntimeState::ActDead) {
                BootClassification::plain(RuntimeState::User)
            } else {
                BootClassification::plain(saved)
            }
        }
        ReasonKind::PowerKey | ReasonKind::NormalStartup => BootClassification::plain(RuntimeState::User),
        ReasonKind::ActDeadWake => BootClassification::plain(RuntimeState::ActDead),
        ReasonKind::Other => BootClassification::malf(&format!(
            "unknown bootreason: {}",
            reason.bootreason.as_deref().unwrap_or("")
        )),
    }
}

/// Path the boot-state selector reads, honoring the `CMDLINE_PATH`
/// override environment variable.
#[must_use]
pub fn cmdline_path() -> PathBuf {
    std::env::var_os("CMDLINE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/proc/cmdline"))
}

/// The persisted `<last_time> <boots> <wd_resets>` triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootCounters {
    /// Monotonic (wall-clock) time of the last classification run.
    pub last_time: u64,
    /// Consecutive too-fast boots observed.
    pub boots: u32,
    /// Consecutive too-fast watchdog-induced resets observed.
    pub wd_resets: u32,
}

impl BootCounters {
    fn parse(text: &str) -> DsmeResult<Self> {
        let mut fields = text.split_whitespace();
        let last_time = fields
            .next()
            .ok_or_else(|| DsmeError::IoError("counter file missing last_time".into()))?
            .parse::<u64>()
            .map_err(|e| DsmeError::IoError(format!("bad last_time: {e}")))?;
        let boots = fields
            .next()
            .ok_or_else(|| DsmeError::IoError("counter file missing boots".into()))?
            .parse::<u32>()
            .map_err(|e| DsmeError::IoError(format!("bad boots: {e}")))?;
        let wd_resets = fields
            .next()
            .ok_or_else(|| DsmeError::IoError("counter file missing wd_resets".into()))?
            .parse::<u32>()
            .map_err(|e| DsmeError::IoError(format!("bad wd_resets: {e}")))?;
        Ok(Self { last_time, boots, wd_resets })
    }

    fn format(self) -> String {
        format!("{} {} {}", self.last_time, self.boots, self.wd_resets)
    }
}

/// Read the boot counter file, defaulting to all-zero counters if absent.
///
/// # Errors
///
/// Returns an error if the file exists but fails to parse as three
/// non-negative integers.
pub fn read_counters(path: &Path) -> DsmeResult<BootCounters> {
    match persist::read_to_string_if_exists(path)? {
        Some(text) => BootCounters::parse(&text),
        None => Ok(BootCounters::default()),
    }
}

/// Atomically persist the boot counter file.
///
/// # Errors
///
/// Returns an error if the write-temp/fsync/rename sequence fails.
pub fn write_counters(path: &Path, counters: BootCounters) -> DsmeResult<()> {
    persist::write_atomic(path, counters.format().as_bytes())
}

/// Reboot-loop / watchdog-reset-loop thresholds, overridable by
/// environment variable per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopThresholds {
    /// `GETBOOTSTATE_MIN_BOOT_TIME`, default 120s.
    pub min_boot_time: Duration,
    /// `GETBOOTSTATE_MAX_BOOTS`, default 5.
    pub max_boots: u32,
    /// `GETBOOTSTATE_MIN_WD_RESET_TIME`, default 600s.
    pub min_wd_reset_time: Duration,
    /// `GETBOOTSTATE_MAX_WD_RESETS`, default 6.
    pub max_wd_resets: u32,
}

impl Default for LoopThresholds {
    fn default() -> Self {
        Self {
            min_boot_time: Duration::from_secs(120),
            max_boots: 5,
            min_wd_reset_time: Duration::from_secs(600),
            max_wd_resets: 6,
        }
    }
}

impl LoopThresholds {
    /// Build thresholds from a [`dsme_common::config::BootstateConfig`],
    /// with any of the four `GETBOOTSTATE_*` environment variables
    /// overriding the configured value.
    #[must_use]
    pub fn from_config(config: &dsme_common::config::BootstateConfig) -> Self {
        let mut thresholds = Self {
            min_boot_time: Duration::from_secs(config.min_boot_time_secs),
            max_boots: config.max_boots,
            min_wd_reset_time: Duration::from_secs(config.min_wd_reset_time_secs),
            max_wd_resets: config.max_wd_resets,
        };

        if let Some(v) = env_u64("GETBOOTSTATE_MIN_BOOT_TIME") {
            thresholds.min_boot_time = Duration::from_secs(v);
        }
        if let Some(v) = env_u32("GETBOOTSTATE_MAX_BOOTS") {
            thresholds.max_boots = v;
        }
        if let Some(v) = env_u64("GETBOOTSTATE_MIN_WD_RESET_TIME") {
            thresholds.min_wd_reset_time = Duration::from_secs(v);
        }
        if let Some(v) = env_u32("GETBOOTSTATE_MAX_WD_RESETS") {
            thresholds.max_wd_resets = v;
        }
        thresholds
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.parse().ok()
}

/// Outcome of folding loop detection into a classification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVerdict {
    /// No loop detected.
    Ok,
    /// Too many boots within `min_boot_time`.
    BootLoop,
    /// Too many watchdog-induced resets within `min_wd_reset_time`.
    WatchdogResetLoop,
}

/// Update `counters` in place for this classification run and return
/// whether a loop was detected. `now` is a monotonic-ish wall-clock
/// reading (seconds); callers normally pass `/proc/uptime`-derived or
/// `SystemTime`-derived seconds.
///
/// `por` and `pwr_key` unconditionally reset both counters and never
/// report a loop themselves (preserved from the original: a clean
/// power-on or a deliberate power-key boot is evidence the device is not
/// stuck, even if prior counters were elevated).
pub fn update_loop_counters(
    bootreason: Option<&str>,
    now: u64,
    counters: &mut BootCounters,
    thresholds: &LoopThresholds,
) -> LoopVerdict {
    if counters.last_time > now {
        // Backward clock jump: the persisted last_time can no longer be
        // trusted as a baseline, so pretend this is effectively the first
        // reboot rather than computing a nonsensical negative elapsed time.
        counters.last_time = now.saturating_sub(1);
    }

    if matches!(bootreason, Some("por") | Some("pwr_key")) {
        counters.boots = 0;
        counters.wd_resets = 0;
        counters.last_time = now;
        return LoopVerdict::Ok;
    }

    let elapsed = now.saturating_sub(counters.last_time);
    let is_wd_reset = matches!(bootreason, Some("swdg_to") | Some("32wd_to"));

    let verdict = if is_wd_reset {
        if elapsed < thresholds.min_wd_reset_time.as_secs() {
            counters.wd_resets += 1;
        } else {
            counters.wd_resets = 0;
        }
        if counters.wd_resets > thresholds.max_wd_resets {
            LoopVerdict::WatchdogResetLoop
        } else {
            LoopVerdict::Ok
        }
    } else {
        if elapsed < thresholds.min_boot_time.as_secs() {
            counters.boots += 1;
        } else {
            counters.boots = 0;
        }
        if counters.boots > thresholds.max_boots {
            LoopVerdict::BootLoop
        } else {
            LoopVerdict::Ok
        }
    };

    counters.last_time = now;

    if matches!(verdict, LoopVerdict::BootLoop | LoopVerdict::WatchdogResetLoop) {
        counters.boots = 0;
        counters.wd_resets = 0;
    }

    verdict
}

/// Run the full boot-state selector: classify the cmdline, fold in loop
/// detection, and persist the updated counters. This is the decision logic
/// behind the (out-of-scope) `bootstate` CLI.
///
/// # Errors
///
/// Returns an error if the counter file exists but cannot be parsed, or if
/// persisting the updated counters fails.
pub fn classify_boot_state(
    cmdline: &str,
    previous_saved_state: Option<RuntimeState>,
    now: u64,
    counter_path: &Path,
    thresholds: &LoopThresholds,
) -> DsmeResult<BootClassification> {
    let reason = parse_cmdline(cmdline);
    let base = classify(&reason, previous_saved_state);

    let mut counters = read_counters(counter_path)?;
    let verdict = update_loop_counters(reason.bootreason.as_deref(), now, &mut counters, thresholds);
    write_counters(counter_path, counters)?;

    Ok(match verdict {
        LoopVerdict::Ok => base,
        LoopVerdict::BootLoop => BootClassification::malf("unknown too frequent reboots"),
        LoopVerdict::WatchdogResetLoop => BootClassification::malf("watchdog too frequent resets"),
    })
}
