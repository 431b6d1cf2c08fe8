//! Operating-state machine.
//!
//! States: `BOOT` (initial), `USER`, `ACTDEAD`, `SHUTDOWN`, `REBOOT`,
//! `MALF`, `TEST`, `LOCAL`. Every committed transition broadcasts
//! [`Message::StateChangeInd`] and [`Message::ChangeRunlevel`] so the
//! (out-of-scope) init-transport module can select a runlevel; reaching a
//! final state from `USER` or `ACT_DEAD` persists the state name to
//! `saved_state` so the boot-state selector can recover it across a
//! watchdog-induced reset.

use std::path::PathBuf;

use dsme_bus::{BusContext, Message, Module};
use dsme_common::error::{DsmeError, DsmeResult};
use dsme_common::persist;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// The daemon's current operating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeState {
    /// Initial state before any classification has run.
    Boot,
    /// Full user mode.
    User,
    /// Active-dead: powered (charging/alarm) but not in full user mode.
    ActDead,
    /// Shutting down.
    Shutdown,
    /// Rebooting.
    Reboot,
    /// Malfunction / recovery runlevel.
    Malf,
    /// Factory/test runlevel.
    Test,
    /// Local (R&D) runlevel.
    Local,
    /// Flashing/update runlevel, selected by `bootmode=update` before the
    /// daemon proper ever starts. Never entered by a running [`StateMachine`]
    /// transition; present so [`crate::bootstate`] classification can name
    /// it as a boot-state-selector outcome (§6).
    Flash,
}

impl RuntimeState {
    /// Parse a saved-state token (as written to the `saved_state` file).
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        Some(match token.trim() {
            "USER" => Self::User,
            "ACTDEAD" | "ACT_DEAD" => Self::ActDead,
            "SHUTDOWN" => Self::Shutdown,
            "REBOOT" => Self::Reboot,
            "MALF" => Self::Malf,
            "TEST" => Self::Test,
            "LOCAL" => Self::Local,
            "FLASH" => Self::Flash,
            "BOOT" => Self::Boot,
            _ => return None,
        })
    }

    /// The token persisted to `saved_state` and emitted as a runlevel name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "BOOT",
            Self::User => "USER",
            Self::ActDead => "ACTDEAD",
            Self::Shutdown => "SHUTDOWN",
            Self::Reboot => "REBOOT",
            Self::Malf => "MALF",
            Self::Test => "TEST",
            Self::Local => "LOCAL",
            Self::Flash => "FLASH",
        }
    }

    /// Whether a transition into this state should be persisted to
    /// `saved_state` (§4.6: "when a final state is reached in USER or
    /// ACT_DEAD paths").
    #[must_use]
    pub fn is_saved_state(self) -> bool {
        matches!(self, Self::User | Self::ActDead)
    }

    /// The discriminant carried by [`Message::StateChangeInd`], so other
    /// crates can recover a [`RuntimeState`] from the broadcast without
    /// depending on `dsme-state`'s internal transition logic.
    #[must_use]
    pub fn code(self) -> u8 {
        state_code(self)
    }

    /// Inverse of [`RuntimeState::code`].
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Boot,
            1 => Self::User,
            2 => Self::ActDead,
            3 => Self::Shutdown,
            4 => Self::Reboot,
            5 => Self::Malf,
            6 => Self::Test,
            7 => Self::Local,
            8 => Self::Flash,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pending or committed shutdown was requested. Kept alongside the
/// flag-file veto so the reason is visible to diagnostics even though the
/// veto itself only ever consults the flag file, per the original design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownReason {
    /// Plain `SHUTDOWN_REQ` from an admin client.
    Requested,
    /// Battery reported empty while in `USER` mode.
    BatteryEmpty,
    /// A thermal object reached its fatal/overheated bucket.
    Thermal,
}

/// Why a reboot was requested or substituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebootReason {
    /// Plain `REBOOT_REQ` from an admin client.
    Requested,
    /// A pending shutdown was converted to a reboot.
    ConvertedFromShutdown,
}

/// The operating-state machine as a bus module.
pub struct StateMachine {
    state: RuntimeState,
    saved_state_path: PathBuf,
    force_shutdown_flag_path: PathBuf,
    malf_reason: Option<String>,
    last_shutdown_reason: Option<ShutdownReason>,
    last_reboot_reason: Option<RebootReason>,
}

impl StateMachine {
    /// Build a state machine starting in [`RuntimeState::Boot`].
    #[must_use]
    pub fn new(saved_state_path: PathBuf, force_shutdown_flag_path: PathBuf) -> Self {
        Self {
            state: RuntimeState::Boot,
            saved_state_path,
            force_shutdown_flag_path,
            malf_reason: None,
            last_shutdown_reason: None,
            last_reboot_reason: None,
        }
    }

    /// Build a state machine starting from an already-classified state,
    /// as happens at daemon startup once `getbootstate` has run.
    #[must_use]
    pub fn with_initial_state(
        saved_state_path: PathBuf,
        force_shutdown_flag_path: PathBuf,
        initial: RuntimeState,
    ) -> Self {
        let mut machine = Self::new(saved_state_path, force_shutdown_flag_path);
        machine.state = initial;
        machine
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> RuntimeState {
        self.state
    }

    /// The human-readable detail string accompanying the most recent
    /// `MALF` entry, if any.
    #[must_use]
    pub fn malf_reason(&self) -> Option<&str> {
        self.malf_reason.as_deref()
    }

    /// Whether the thermal-flag file currently vetoes reboot substitution.
    fn reboot_substitution_vetoed(&self) -> bool {
        self.force_shutdown_flag_path.exists()
    }

    /// Commit a transition: update state, persist `saved_state` if this is
    /// a final USER/ACT_DEAD state, and broadcast the two outbound
    /// messages every transition produces.
    fn commit(&mut self, new_state: RuntimeState, ctx: &mut BusContext<'_>) -> DsmeResult<()> {
        info!(from = %self.state, to = %new_state, "state transition");
        self.state = new_state;

        if new_state.is_saved_state() {
            persist::write_atomic(&self.saved_state_path, new_state.as_str().as_bytes())?;
        }

        ctx.send(Message::StateChangeInd { state_code: state_code(new_state) });
        ctx.send(Message::ChangeRunlevel { runlevel: new_state.as_str().to_string() });
        Ok(())
    }

    fn enter_malf(&mut self, reason: String, ctx: &mut BusContext<'_>) {
        warn!(%reason, "entering MALF");
        self.malf_reason = Some(reason);
        if let Err(e) = self.commit(RuntimeState::Malf, ctx) {
            warn!(error = %e, "failed to persist saved_state on MALF entry");
        }
    }

    fn request_shutdown(&mut self, reason: ShutdownReason, ctx: &mut BusContext<'_>) {
        if self.state == RuntimeState::Shutdown {
            return;
        }
        self.last_shutdown_reason = Some(reason);
        if let Err(e) = self.commit(RuntimeState::Shutdown, ctx) {
            warn!(error = %e, "failed to persist saved_state on shutdown");
        }
    }

    fn request_reboot(&mut self, ctx: &mut BusContext<'_>) {
        if self.state == RuntimeState::Shutdown {
            if self.reboot_substitution_vetoed() {
                info!("reboot substitution vetoed by force_shutdown flag, staying in SHUTDOWN");
                return;
            }
            self.last_reboot_reason = Some(RebootReason::ConvertedFromShutdown);
        } else {
            self.last_reboot_reason = Some(RebootReason::Requested);
        }

        if let Err(e) = self.commit(RuntimeState::Reboot, ctx) {
            warn!(error = %e, "failed to persist saved_state on reboot");
        }
    }
}

fn state_code(state: RuntimeState) -> u8 {
    match state {
        RuntimeState::Boot => 0,
        RuntimeState::User => 1,
        RuntimeState::ActDead => 2,
        RuntimeState::Shutdown => 3,
        RuntimeState::Reboot => 4,
        RuntimeState::Malf => 5,
        RuntimeState::Test => 6,
        RuntimeState::Local => 7,
        RuntimeState::Flash => 8,
    }
}

impl Module for StateMachine {
    fn name(&self) -> &str {
        "state"
    }

    fn handle(&mut self, msg: &Message, ctx: &mut BusContext<'_>) {
        match msg {
            Message::ShutdownReq => self.request_shutdown(ShutdownReason::Requested, ctx),
            Message::RebootReq => self.request_reboot(ctx),
            Message::PowerupReq => {
                if self.state == RuntimeState::ActDead {
                    if let Err(e) = self.commit(RuntimeState::User, ctx) {
                        warn!(error = %e, "failed to persist saved_state on powerup");
                    }
                }
            }
            Message::BatteryEmpty => {
                if self.state == RuntimeState::User {
                    self.request_shutdown(ShutdownReason::BatteryEmpty, ctx);
                }
            }
            Message::SetThermalStatus { fatal: true, object, .. } => {
                if self.state == RuntimeState::User {
                    debug!(%object, "fatal thermal status triggers shutdown");
                    self.request_shutdown(ShutdownReason::Thermal, ctx);
                }
            }
            Message::EnterMalf { reason } => self.enter_malf(reason.clone(), ctx),
            _ => {}
        }
    }
}

/// Construct a [`DsmeError`] for an attempted transition the caller's
/// invariants should have prevented. Exposed for module tests elsewhere
/// that want to assert a transition was rejected rather than silently
/// ignored.
#[must_use]
pub fn invalid_transition(from: RuntimeState, to: RuntimeState) -> DsmeError {
    DsmeError::InvalidStateTransition { from: from.to_string(), to: to.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    fn machine(dir: &std::path::Path) -> StateMachine {
        StateMachine::new(dir.join("saved_state"), dir.join("force_shutdown"))
    }

    #[test]
    fn shutdown_req_transitions_and_persists() {
        let dir = tempdir().unwrap();
        let mut m = machine(dir.path());
        m.state = RuntimeState::User;

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        m.handle(&Message::ShutdownReq, &mut ctx);

        assert_eq!(m.state(), RuntimeState::Shutdown);
        let saved = persist::read_to_string_if_exists(&dir.path().join("saved_state")).unwrap();
        // SHUTDOWN is not a saved state per §4.6; only USER/ACT_DEAD persist.
        assert!(saved.is_none());
        assert!(outgoing.iter().any(|m| matches!(m, Message::ChangeRunlevel { runlevel } if runlevel == "SHUTDOWN")));
    }

    #[test]
    fn powerup_from_actdead_persists_user() {
        let dir = tempdir().unwrap();
        let mut m = machine(dir.path());
        m.state = RuntimeState::ActDead;

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        m.handle(&Message::PowerupReq, &mut ctx);

        assert_eq!(m.state(), RuntimeState::User);
        let saved = persist::read_to_string_if_exists(&dir.path().join("saved_state")).unwrap();
        assert_eq!(saved.unwrap(), "USER");
    }

    #[test]
    fn powerup_ignored_outside_actdead() {
        let dir = tempdir().unwrap();
        let mut m = machine(dir.path());
        m.state = RuntimeState::User;

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        m.handle(&Message::PowerupReq, &mut ctx);

        assert_eq!(m.state(), RuntimeState::User);
        assert!(outgoing.is_empty());
    }

    #[test]
    fn enter_malf_is_unconditional() {
        let dir = tempdir().unwrap();
        let mut m = machine(dir.path());
        m.state = RuntimeState::Test;

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        m.handle(&Message::EnterMalf { reason: "security violation".into() }, &mut ctx);

        assert_eq!(m.state(), RuntimeState::Malf);
        assert_eq!(m.malf_reason(), Some("security violation"));
    }

    #[test]
    fn reboot_req_converts_pending_shutdown() {
        let dir = tempdir().unwrap();
        let mut m = machine(dir.path());
        m.state = RuntimeState::User;

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        m.handle(&Message::ShutdownReq, &mut ctx);
        assert_eq!(m.state(), RuntimeState::Shutdown);

        m.handle(&Message::RebootReq, &mut ctx);
        assert_eq!(m.state(), RuntimeState::Reboot);
        assert_eq!(m.last_reboot_reason, Some(RebootReason::ConvertedFromShutdown));
    }

    #[test]
    fn force_shutdown_flag_vetoes_reboot_substitution() {
        let dir = tempdir().unwrap();
        let mut m = machine(dir.path());
        m.state = RuntimeState::User;

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        m.handle(&Message::ShutdownReq, &mut ctx);

        std::fs::write(dir.path().join("force_shutdown"), b"").unwrap();

        m.handle(&Message::RebootReq, &mut ctx);
        assert_eq!(m.state(), RuntimeState::Shutdown);
    }

    #[test]
    fn battery_empty_triggers_shutdown_only_from_user() {
        let dir = tempdir().unwrap();
        let mut m = machine(dir.path());
        m.state = RuntimeState::ActDead;

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        m.handle(&Message::BatteryEmpty, &mut ctx);
        assert_eq!(m.state(), RuntimeState::ActDead);

        m.state = RuntimeState::User;
        m.handle(&Message::BatteryEmpty, &mut ctx);
        assert_eq!(m.state(), RuntimeState::Shutdown);
    }

    #[test]
    fn fatal_thermal_status_triggers_shutdown() {
        let dir = tempdir().unwrap();
        let mut m = machine(dir.path());
        m.state = RuntimeState::User;

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        m.handle(
            &Message::SetThermalStatus { object: "battery".into(), status_code: 3, fatal: true },
            &mut ctx,
        );
        assert_eq!(m.state(), RuntimeState::Shutdown);
        assert_eq!(m.last_shutdown_reason, Some(ShutdownReason::Thermal));
    }

    #[test]
    fn non_fatal_thermal_status_does_not_trigger_shutdown() {
        let dir = tempdir().unwrap();
        let mut m = machine(dir.path());
        m.state = RuntimeState::User;

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        m.handle(
            &Message::SetThermalStatus { object: "battery".into(), status_code: 1, fatal: false },
            &mut ctx,
        );
        assert_eq!(m.state(), RuntimeState::User);
    }

    #[test]
    fn parse_round_trips_every_state() {
        for state in [
            RuntimeState::Boot,
            RuntimeState::User,
            RuntimeState::ActDead,
            RuntimeState::Shutdown,
            RuntimeState::Reboot,
            RuntimeState::Malf,
            RuntimeState::Test,
            RuntimeState::Local,
            RuntimeState::Flash,
        ] {
            assert_eq!(RuntimeState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn code_round_trips_every_state() {
        for state in [
            RuntimeState::Boot,
            RuntimeState::User,
            RuntimeState::ActDead,
            RuntimeState::Shutdown,
            RuntimeState::Reboot,
            RuntimeState::Malf,
            RuntimeState::Test,
            RuntimeState::Local,
            RuntimeState::Flash,
        ] {
            assert_eq!(RuntimeState::from_code(state.code()), Some(state));
        }
        assert_eq!(RuntimeState::from_code(255), None);
    }
}
