//! Periodic device policy: disk usage monitoring, stale-file reaping,
//! thermal status tracking, and durable power-on time accumulation.
//!
//! Unlike [`dsme_watchdog`]'s kicker and process-watchdog loops, these
//! modules are driven by the cooperative main loop through
//! [`dsme_bus::IphbBroker`] wake-ups rather than dedicated threads — none of
//! them need real-time guarantees, only a coalesced periodic tick.

pub mod diskmon;
pub mod powertimer;
pub mod reaper;
pub mod thermal;

pub use diskmon::DiskmonModule;
pub use powertimer::PowertimerModule;
pub use reaper::ReaperModule;
pub use thermal::ThermalModule;
