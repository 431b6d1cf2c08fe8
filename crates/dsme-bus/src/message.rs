//! In-process message representation for the dsme bus.
//!
//! The bus dispatches a small, fixed catalog of message kinds between
//! modules. Each `MessageKind` discriminant is also the wire `type_id` used
//! by the control socket frame `{line_size, payload_size, type_id}` (see
//! `dsme-daemon::socket`, the only place that ever sees raw bytes).

use crate::endpoint::Endpoint;

/// Wire/dispatch discriminant for a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    /// Broadcast after the state machine commits a transition.
    StateChangeInd = 1,
    /// Request a transition toward `REBOOT`.
    RebootReq = 2,
    /// Request a transition toward `SHUTDOWN`.
    ShutdownReq = 3,
    /// Request a transition out of `ACTDEAD` back to `USER`.
    PowerupReq = 4,
    /// A thermal object's status changed.
    SetThermalStatus = 5,
    /// A monitored mount crossed its usage threshold.
    DiskSpace = 6,
    /// The battery reported an empty condition.
    BatteryEmpty = 7,
    /// Register a PID with the process watchdog.
    ProcesswdCreate = 8,
    /// Unregister a PID from the process watchdog.
    ProcesswdDelete = 9,
    /// Ping sent to a registered client.
    ProcesswdPing = 10,
    /// Pong received from a registered client.
    ProcesswdPong = 11,
    /// A registered process exited on its own.
    ProcessExited = 12,
    /// Adjust logging verbosity at runtime.
    SetLoglevel = 13,
    /// A timer or IPHB wakeup fired.
    WakeupTimer = 14,
    /// Unconditional transition to `MALF`.
    EnterMalf = 15,
    /// Request the init system change runlevel.
    ChangeRunlevel = 16,
    /// An endpoint (client connection) closed.
    Close = 17,
    /// An external process registers itself as the hardware watchdog
    /// kicker, superseding the internal kicker thread.
    HwwdKickerRegister = 18,
    /// Permission-to-kick delivered to the registered external kicker.
    HwwdKick = 19,
    /// The external `base_boot_done` signal gating the disk monitor.
    BaseBootDone = 20,
}

impl MessageKind {
    /// Recover a `MessageKind` from a wire `type_id`.
    #[must_use]
    pub fn from_type_id(id: u32) -> Option<Self> {
        Some(match id {
            1 => Self::StateChangeInd,
            2 => Self::RebootReq,
            3 => Self::ShutdownReq,
            4 => Self::PowerupReq,
            5 => Self::SetThermalStatus,
            6 => Self::DiskSpace,
            7 => Self::BatteryEmpty,
            8 => Self::ProcesswdCreate,
            9 => Self::ProcesswdDelete,
            10 => Self::ProcesswdPing,
            11 => Self::ProcesswdPong,
            12 => Self::ProcessExited,
            13 => Self::SetLoglevel,
            14 => Self::WakeupTimer,
            15 => Self::EnterMalf,
            16 => Self::ChangeRunlevel,
            17 => Self::Close,
            18 => Self::HwwdKickerRegister,
            19 => Self::HwwdKick,
            20 => Self::BaseBootDone,
            _ => return None,
        })
    }

    /// The wire `type_id` for this kind.
    #[must_use]
    pub fn type_id(self) -> u32 {
        self as u32
    }
}

/// A message moving through the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Broadcast after the state machine commits a transition. `state_code`
    /// is the `RuntimeState` discriminant defined in `dsme-state`.
    StateChangeInd {
        /// `RuntimeState` discriminant.
        state_code: u8,
    },
    /// Request a transition toward `REBOOT`.
    RebootReq,
    /// Request a transition toward `SHUTDOWN`.
    ShutdownReq,
    /// Request a transition out of `ACTDEAD` back to `USER`.
    PowerupReq,
    /// A thermal object's status changed.
    SetThermalStatus {
        /// Thermal object name.
        object: String,
        /// New status bucket index.
        status_code: u8,
        /// Whether the new status is the terminal `FATAL`/overheated
        /// bucket, so the state machine can trigger a shutdown without
        /// depending on thermal configuration to know which index that is.
        fatal: bool,
    },
    /// A monitored mount crossed its usage threshold.
    DiskSpace {
        /// Mount path, e.g. `/`.
        mount_path: String,
        /// Used-space percentage observed.
        used_percent: u8,
    },
    /// The battery reported an empty condition.
    BatteryEmpty,
    /// Register a PID with the process watchdog.
    ProcesswdCreate {
        /// Client process id.
        pid: i32,
        /// The registering client's endpoint, held ("copied") by the
        /// process-watchdog entry for the lifetime of its supervision.
        endpoint: Endpoint,
    },
    /// Unregister a PID from the process watchdog.
    ProcesswdDelete {
        /// Client process id.
        pid: i32,
    },
    /// Ping sent to a registered client.
    ProcesswdPing {
        /// Client process id.
        pid: i32,
    },
    /// Pong received from a registered client.
    ProcesswdPong {
        /// Client process id.
        pid: i32,
    },
    /// A registered process exited on its own.
    ProcessExited {
        /// Client process id.
        pid: i32,
    },
    /// Adjust logging verbosity at runtime.
    SetLoglevel {
        /// New verbosity level.
        level: u8,
    },
    /// A timer or IPHB wakeup fired.
    WakeupTimer {
        /// Identifier of the timer that fired.
        timer_id: u64,
    },
    /// Unconditional transition to `MALF`.
    EnterMalf {
        /// Human-readable reason, persisted alongside the MALF state.
        reason: String,
    },
    /// Request the init system change runlevel.
    ChangeRunlevel {
        /// Target runlevel name.
        runlevel: String,
    },
    /// An endpoint (client connection) closed.
    Close {
        /// The endpoint that closed.
        endpoint: Endpoint,
    },
    /// An external process registers itself as the hardware watchdog
    /// kicker, superseding the internal kicker thread.
    HwwdKickerRegister {
        /// The registering process's endpoint.
        endpoint: Endpoint,
    },
    /// Permission-to-kick delivered to the registered external kicker.
    HwwdKick,
    /// The external `base_boot_done` signal gating the disk monitor.
    BaseBootDone,
}

impl Message {
    /// The [`MessageKind`] discriminant for this message.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::StateChangeInd { .. } => MessageKind::StateChangeInd,
            Message::RebootReq => MessageKind::RebootReq,
            Message::ShutdownReq => MessageKind::ShutdownReq,
            Message::PowerupReq => MessageKind::PowerupReq,
            Message::SetThermalStatus { .. } => MessageKind::SetThermalStatus,
            Message::DiskSpace { .. } => MessageKind::DiskSpace,
            Message::BatteryEmpty => MessageKind::BatteryEmpty,
            Message::ProcesswdCreate { .. } => MessageKind::ProcesswdCreate,
            Message::ProcesswdDelete { .. } => MessageKind::ProcesswdDelete,
            Message::ProcesswdPing { .. } => MessageKind::ProcesswdPing,
            Message::ProcesswdPong { .. } => MessageKind::ProcesswdPong,
            Message::ProcessExited { .. } => MessageKind::ProcessExited,
            Message::SetLoglevel { .. } => MessageKind::SetLoglevel,
            Message::WakeupTimer { .. } => MessageKind::WakeupTimer,
            Message::EnterMalf { .. } => MessageKind::EnterMalf,
            Message::ChangeRunlevel { .. } => MessageKind::ChangeRunlevel,
            Message::Close { .. } => MessageKind::Close,
            Message::HwwdKickerRegister { .. } => MessageKind::HwwdKickerRegister,
            Message::HwwdKick => MessageKind::HwwdKick,
            Message::BaseBootDone => MessageKind::BaseBootDone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_id_roundtrip() {
        for id in 1..=20u32 {
            let kind = MessageKind::from_type_id(id).expect("known discriminant");
            assert_eq!(kind.type_id(), id);
        }
        assert!(MessageKind::from_type_id(0).is_none());
        assert!(MessageKind::from_type_id(999).is_none());
    }

    #[test]
    fn message_kind_matches_variant() {
        let msg = Message::DiskSpace { mount_path: "/".into(), used_percent: 91 };
        assert_eq!(msg.kind(), MessageKind::DiskSpace);
    }

    #[test]
    fn thermal_status_carries_fatal_flag() {
        let msg = Message::SetThermalStatus {
            object: "battery".into(),
            status_code: 3,
            fatal: true,
        };
        assert_eq!(msg.kind(), MessageKind::SetThermalStatus);
    }
}
