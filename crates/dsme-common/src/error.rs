use thiserror::Error;

/// Error types covering configuration, the message bus, watchdog supervision,
/// and state arbitration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DsmeError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic runtime fault raised by a module handler.
    #[error("runtime fault: {0}")]
    Fault(String),

    /// A hardware or process watchdog timer expired without being kicked.
    #[error("watchdog timeout: {0}")]
    WatchdogTimeout(String),

    /// A message exceeded the bus's maximum frame size or failed to decode.
    #[error("message bus error: {0}")]
    BusError(String),

    /// I/O operation error (device node, counter file, CAL block, socket).
    #[error("I/O error: {0}")]
    IoError(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Boot reason could not be classified against the decision table.
    #[error("unrecognized boot reason: {0}")]
    UnknownBootReason(String),
}

impl From<std::io::Error> for DsmeError {
    fn from(err: std::io::Error) -> Self {
        DsmeError::IoError(err.to_string())
    }
}

/// Convenience type alias for DSME operations.
pub type DsmeResult<T> = Result<T, DsmeError>;
