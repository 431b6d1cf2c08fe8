#![doc = "Common types shared across the device state management workspace."]

pub mod config;
pub mod error;
pub mod logring;
pub mod metrics;
pub mod persist;
pub mod time;

pub use config::*;
pub use error::*;
pub use logring::{LogEntry, LogRing};
pub use metrics::*;
pub use time::*;
