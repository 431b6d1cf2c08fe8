#![doc = "Operating-state machine and boot-state/reboot-loop arbitration for dsme."]

pub mod bootstate;
pub mod machine;

pub use bootstate::{classify_boot_state, BootClassification, BootReason, ReasonKind};
pub use machine::{RebootReason, RuntimeState, ShutdownReason, StateMachine};
