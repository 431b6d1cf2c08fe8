#![doc = "Hardware watchdog kicker, process-watchdog supervision, and real-time scheduling glue for dsme."]

pub mod hwwd;
pub mod processwd;
pub mod realtime;

pub use hwwd::HwwdModule;
pub use processwd::ProcesswdModule;
