//! Thermal manager & objects.
//!
//! Each thermal object (e.g. `battery`, `surface`) is sampled on an
//! interval that depends on its *current* status bucket — hotter buckets
//! poll faster, so a runaway temperature is caught sooner. Each bucket
//! publishes a `(min, max)` poll window rather than a single interval, so
//! the IPHB broker can coalesce this object's wake-up with other
//! subscribers instead of waking the device on its own schedule. A transition
//! between buckets only takes effect after [`ThermalConfig::hysteresis_samples`]
//! consecutive confirming samples, so a single noisy reading can't flap the
//! status. Reaching the terminal (`fatal`) bucket writes the force-shutdown
//! flag file the state machine consults to veto reboot-substitution.

use std::path::PathBuf;
use std::time::Duration;

use dsme_bus::{BusContext, Message, Module};
use dsme_common::config::{ThermalBucket, ThermalConfig};
use dsme_common::persist;
use tracing::{debug, info, warn};

/// Sentinel reported when a sensor read fails.
pub const SENTINEL_READ_FAILURE: i32 = -1;

/// Empirical calibration: device surface temperature tracks battery
/// temperature minus 7 °C, preserved verbatim from the original.
pub const SURFACE_FROM_BATTERY_OFFSET_C: i32 = -7;

/// Derive the surface-object reading from a battery-object reading.
#[must_use]
pub fn surface_temperature_from_battery(battery_temp_c: i32) -> i32 {
    battery_temp_c + SURFACE_FROM_BATTERY_OFFSET_C
}

/// Reads a named thermal object's current temperature, abstracted so tests
/// (and the `surface` object, which is derived rather than measured) don't
/// need a real sensor.
pub trait SensorReader: Send {
    /// Current temperature in degrees Celsius, or [`SENTINEL_READ_FAILURE`]
    /// if the read failed.
    fn read_temperature_c(&self, object: &str) -> i32;
}

/// Reads Linux `/sys/class/thermal/thermal_zone*/temp` nodes, which report
/// millidegrees Celsius.
#[derive(Debug, Default)]
pub struct SysfsSensorReader {
    /// Object name to sysfs node path.
    pub paths: std::collections::HashMap<String, PathBuf>,
}

impl SensorReader for SysfsSensorReader {
    fn read_temperature_c(&self, object: &str) -> i32 {
        let Some(path) = self.paths.get(object) else {
            return SENTINEL_READ_FAILURE;
        };
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .map(|millidegrees| millidegrees / 1000)
            .unwrap_or(SENTINEL_READ_FAILURE)
    }
}

fn bucket_for(buckets: &[ThermalBucket], temp_c: i32) -> Option<usize> {
    buckets.iter().position(|b| temp_c >= b.min && temp_c < b.max)
}

fn is_fatal(buckets: &[ThermalBucket], index: usize) -> bool {
    buckets.get(index).is_some_and(|b| b.name == "fatal")
}

/// One monitored thermal object's hysteresis state.
struct ObjectState {
    name: String,
    buckets: Vec<ThermalBucket>,
    current_index: usize,
    pending_index: Option<usize>,
    transition_count: u32,
}

impl ObjectState {
    fn new(name: String, buckets: Vec<ThermalBucket>) -> Self {
        Self { name, buckets, current_index: 0, pending_index: None, transition_count: 0 }
    }

    /// The `(min, max)` window the current bucket wants its next poll
    /// scheduled in, handed to the IPHB broker so it can coalesce this
    /// object's wake-up with other subscribers.
    fn poll_window(&self) -> (Duration, Duration) {
        self.buckets
            .get(self.current_index)
            .map_or((Duration::from_secs(30), Duration::from_secs(30)), |b| {
                (b.min_poll_interval, b.max_poll_interval)
            })
    }

    /// Fold in one sample, returning `Some(new_index)` if a confirmed
    /// transition just occurred.
    fn sample(&mut self, temp_c: i32, hysteresis: u32) -> Option<usize> {
        if temp_c == SENTINEL_READ_FAILURE {
            warn!(object = %self.name, "thermal sensor read failed");
            return None;
        }

        let Some(new_index) = bucket_for(&self.buckets, temp_c) else {
            warn!(object = %self.name, temp_c, "temperature outside all configured buckets");
            return None;
        };

        if new_index == self.current_index {
            self.transition_count = 0;
            self.pending_index = None;
            return None;
        }

        if self.pending_index == Some(new_index) {
            self.transition_count += 1;
        } else {
            self.pending_index = Some(new_index);
            self.transition_count = 1;
        }

        if self.transition_count >= hysteresis.max(1) {
            self.current_index = new_index;
            self.pending_index = None;
            self.transition_count = 0;
            Some(new_index)
        } else {
            None
        }
    }
}

/// Module-kernel participant tracking one or more thermal objects.
pub struct ThermalModule {
    config: ThermalConfig,
    objects: Vec<ObjectState>,
}

impl ThermalModule {
    /// Build a thermal manager watching `object_names`, all sharing
    /// `config.default_buckets`.
    #[must_use]
    pub fn new(config: ThermalConfig, object_names: &[&str]) -> Self {
        let objects = object_names
            .iter()
            .map(|name| ObjectState::new((*name).to_string(), config.default_buckets.clone()))
            .collect();
        Self { config, objects }
    }

    /// Record a sample for `object` and broadcast
    /// [`Message::SetThermalStatus`] if hysteresis confirms a transition.
    /// Returns the `(min, max)` window the object should next be sampled in,
    /// for the caller to hand to the IPHB broker.
    pub fn record_sample(
        &mut self,
        object: &str,
        temp_c: i32,
        ctx: &mut BusContext<'_>,
    ) -> Option<(Duration, Duration)> {
        let hysteresis = self.config.hysteresis_samples;
        let flag_path = self.config.force_shutdown_flag_path.clone();

        let state = self.objects.iter_mut().find(|o| o.name == object)?;
        if let Some(new_index) = state.sample(temp_c, hysteresis) {
            let fatal = is_fatal(&state.buckets, new_index);
            info!(object, status = %state.buckets[new_index].name, fatal, "thermal status transition");

            ctx.send(Message::SetThermalStatus {
                object: object.to_string(),
                status_code: new_index as u8,
                fatal,
            });

            if fatal {
                if let Err(e) = write_force_shutdown_flag(&flag_path) {
                    warn!(error = %e, "failed to write force_shutdown flag");
                }
            }
        }
        Some(state.poll_window())
    }

    /// Current `(bucket name, fatal)` for a monitored object, for
    /// diagnostics. `None` if `object` isn't one of the names this module
    /// was built with.
    #[must_use]
    pub fn status(&self, object: &str) -> Option<(&str, bool)> {
        let state = self.objects.iter().find(|o| o.name == object)?;
        let bucket = state.buckets.get(state.current_index)?;
        Some((bucket.name.as_str(), is_fatal(&state.buckets, state.current_index)))
    }

    /// Names of every thermal object this module monitors.
    pub fn object_names(&self) -> impl Iterator<Item = &str> {
        self.objects.iter().map(|o| o.name.as_str())
    }
}

fn write_force_shutdown_flag(path: &PathBuf) -> DsmeResultUnit {
    persist::write_atomic(path, b"overheated")
}

type DsmeResultUnit = dsme_common::error::DsmeResult<()>;

impl Module for ThermalModule {
    fn name(&self) -> &str {
        "thermal"
    }

    fn handle(&mut self, msg: &Message, _ctx: &mut BusContext<'_>) {
        if let Message::Close { .. } = msg {
            debug!("thermal module ignores connection close, no client state held");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    fn buckets() -> Vec<ThermalBucket> {
        vec![
            ThermalBucket {
                name: "normal".into(),
                min: i32::MIN,
                max: 55,
                min_poll_interval: Duration::from_secs(54),
                max_poll_interval: Duration::from_secs(66),
            },
            ThermalBucket {
                name: "warning".into(),
                min: 55,
                max: 60,
                min_poll_interval: Duration::from_secs(40),
                max_poll_interval: Duration::from_secs(50),
            },
            ThermalBucket {
                name: "alert".into(),
                min: 60,
                max: 65,
                min_poll_interval: Duration::from_secs(27),
                max_poll_interval: Duration::from_secs(33),
            },
            ThermalBucket {
                name: "fatal".into(),
                min: 65,
                max: i32::MAX,
                min_poll_interval: Duration::from_secs(13),
                max_poll_interval: Duration::from_secs(17),
            },
        ]
    }

    fn config(flag_path: PathBuf) -> ThermalConfig {
        ThermalConfig {
            default_buckets: buckets(),
            hysteresis_samples: 2,
            sample_interval: Duration::from_secs(30),
            force_shutdown_flag_path: flag_path,
        }
    }

    #[test]
    fn single_outlier_sample_does_not_flap() {
        let dir = tempdir().unwrap();
        let mut module = ThermalModule::new(config(dir.path().join("force_shutdown")), &["battery"]);
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);

        module.record_sample("battery", 58, &mut ctx);
        assert!(outgoing.is_empty());
    }

    #[test]
    fn two_confirming_samples_transition_status() {
        let dir = tempdir().unwrap();
        let mut module = ThermalModule::new(config(dir.path().join("force_shutdown")), &["battery"]);
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);

        module.record_sample("battery", 58, &mut ctx);
        module.record_sample("battery", 58, &mut ctx);

        assert_eq!(outgoing.len(), 1);
        assert!(matches!(
            &outgoing[0],
            Message::SetThermalStatus { status_code: 1, fatal: false, .. }
        ));
    }

    #[test]
    fn reaching_fatal_bucket_sets_fatal_flag_and_writes_file() {
        let dir = tempdir().unwrap();
        let flag_path = dir.path().join("force_shutdown");
        let mut module = ThermalModule::new(config(flag_path.clone()), &["battery"]);
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);

        module.record_sample("battery", 70, &mut ctx);
        module.record_sample("battery", 70, &mut ctx);

        assert!(matches!(
            outgoing.back(),
            Some(Message::SetThermalStatus { fatal: true, .. })
        ));
        assert!(flag_path.exists());
    }

    #[test]
    fn sensor_failure_sentinel_does_not_transition() {
        let dir = tempdir().unwrap();
        let mut module = ThermalModule::new(config(dir.path().join("force_shutdown")), &["battery"]);
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);

        module.record_sample("battery", SENTINEL_READ_FAILURE, &mut ctx);
        module.record_sample("battery", SENTINEL_READ_FAILURE, &mut ctx);

        assert!(outgoing.is_empty());
    }

    #[test]
    fn returning_to_prior_bucket_resets_pending_transition() {
        let dir = tempdir().unwrap();
        let mut module = ThermalModule::new(config(dir.path().join("force_shutdown")), &["battery"]);
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);

        module.record_sample("battery", 58, &mut ctx); // pending warning, count=1
        module.record_sample("battery", 40, &mut ctx); // back to normal, resets
        module.record_sample("battery", 58, &mut ctx); // pending warning, count=1 again

        assert!(outgoing.is_empty());
    }

    #[test]
    fn surface_temperature_applies_calibration_offset() {
        assert_eq!(surface_temperature_from_battery(30), 23);
    }

    #[test]
    fn status_reports_current_bucket_and_fatal_flag() {
        let dir = tempdir().unwrap();
        let mut module = ThermalModule::new(config(dir.path().join("force_shutdown")), &["battery"]);
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);

        assert_eq!(module.status("battery"), Some(("normal", false)));

        module.record_sample("battery", 70, &mut ctx);
        module.record_sample("battery", 70, &mut ctx);
        assert_eq!(module.status("battery"), Some(("fatal", true)));

        assert_eq!(module.status("unknown"), None);
    }

    #[test]
    fn hotter_bucket_polls_faster() {
        let dir = tempdir().unwrap();
        let mut module = ThermalModule::new(config(dir.path().join("force_shutdown")), &["battery"]);
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);

        module.record_sample("battery", 20, &mut ctx);
        module.record_sample("battery", 70, &mut ctx);
        let (fatal_min, fatal_max) = module.record_sample("battery", 70, &mut ctx).unwrap();

        let normal = &buckets()[0];
        assert!(fatal_min < normal.min_poll_interval);
        assert!(fatal_max < normal.max_poll_interval);
    }
}
