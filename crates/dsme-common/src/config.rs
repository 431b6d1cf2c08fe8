//! Configuration structures for the device state management daemon.
//!
//! Supports TOML deserialization with sensible defaults so the daemon can
//! run unconfigured on a development host and be fully pinned down on a
//! production image.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Path to the control socket the daemon listens on.
    pub socket_path: PathBuf,

    /// Real-time scheduling for the hardware watchdog kicker thread.
    pub realtime: RealtimeConfig,

    /// Hardware watchdog device configuration.
    pub hwwd: HwwdConfig,

    /// Process watchdog configuration.
    pub processwd: ProcesswdConfig,

    /// Boot-state selection and reboot-loop detection thresholds.
    pub bootstate: BootstateConfig,

    /// Disk usage monitor configuration.
    pub diskmon: DiskmonConfig,

    /// Stale-file reaper configuration.
    pub reaper: ReaperConfig,

    /// Thermal management configuration.
    pub thermal: ThermalConfig,

    /// Power-on timer (CAL) configuration.
    pub powertimer: PowertimerConfig,

    /// Metrics and diagnostics configuration.
    pub metrics: MetricsConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/dsme_sock"),
            realtime: RealtimeConfig::default(),
            hwwd: HwwdConfig::default(),
            processwd: ProcesswdConfig::default(),
            bootstate: BootstateConfig::default(),
            diskmon: DiskmonConfig::default(),
            reaper: ReaperConfig::default(),
            thermal: ThermalConfig::default(),
            powertimer: PowertimerConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Real-time scheduling configuration for the hardware watchdog kicker thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Enable real-time scheduling (requires privileges).
    pub enabled: bool,

    /// Scheduler policy: "fifo" or "rr" (round-robin).
    pub policy: SchedPolicy,

    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,

    /// CPU affinity for the RT thread.
    pub cpu_affinity: CpuAffinity,

    /// Lock all memory pages (mlockall) so the kicker thread never pages.
    pub lock_memory: bool,

    /// Pre-fault stack size in bytes.
    pub prefault_stack_size: usize,

    /// Fail immediately at startup if RT requirements cannot be met.
    pub fail_fast: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: SchedPolicy::Fifo,
            priority: 99,
            cpu_affinity: CpuAffinity::None,
            lock_memory: true,
            prefault_stack_size: 512 * 1024,
            fail_fast: false,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: first-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: round-robin real-time.
    Rr,
    /// SCHED_OTHER: normal time-sharing (non-RT).
    Other,
}

/// CPU affinity specification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CpuAffinity {
    /// No affinity set (OS chooses).
    #[default]
    None,
    /// Pin to a single CPU core.
    Single(usize),
    /// Pin to a set of CPU cores.
    Set(Vec<usize>),
}

impl Serialize for CpuAffinity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            CpuAffinity::None => serializer.serialize_none(),
            CpuAffinity::Single(cpu) => serializer.serialize_u64(*cpu as u64),
            CpuAffinity::Set(cpus) => cpus.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CpuAffinity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct CpuAffinityVisitor;

        impl<'de> Visitor<'de> for CpuAffinityVisitor {
            type Value = CpuAffinity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, an integer, or an array of integers")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(de::Error::custom("CPU index cannot be negative"));
                }
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut cpus = Vec::new();
                while let Some(cpu) = seq.next_element::<usize>()? {
                    cpus.push(cpu);
                }
                Ok(CpuAffinity::Set(cpus))
            }
        }

        deserializer.deserialize_any(CpuAffinityVisitor)
    }
}

/// One hardware watchdog device in the fixed kick order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogDevice {
    /// Device node, e.g. `/dev/watchdog0`.
    pub path: PathBuf,
    /// Human-readable name used in R&D disable flags and logs.
    pub name: String,
}

/// Hardware watchdog kicker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HwwdConfig {
    /// Ordered list of watchdog devices to kick. Kicking stops at the first
    /// device that fails to open or ioctl, per the normative ordering rule.
    pub devices: Vec<WatchdogDevice>,

    /// Watchdog expiry timeout programmed via `WDIOC_SETTIMEOUT`.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Interval between kicks (must be well under `timeout`).
    #[serde(with = "humantime_serde")]
    pub kick_interval: Duration,

    /// R&D disable flags read from the CAL block; device names present here
    /// are skipped entirely rather than kicked.
    pub rd_disabled: Vec<String>,
}

impl Default for HwwdConfig {
    fn default() -> Self {
        Self {
            devices: vec![WatchdogDevice {
                path: PathBuf::from("/dev/watchdog"),
                name: String::from("omap-wd"),
            }],
            timeout: Duration::from_secs(12),
            kick_interval: Duration::from_secs(4),
            rd_disabled: Vec::new(),
        }
    }
}

/// Process watchdog (ping/pong client supervision) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcesswdConfig {
    /// Number of unanswered pings before a client is sent `SIGABRT`.
    pub max_ping: u32,

    /// Interval between pings sent to registered clients.
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,

    /// Grace period between `SIGABRT` and the follow-up `SIGKILL`.
    #[serde(with = "humantime_serde")]
    pub kill_timeout: Duration,
}

impl Default for ProcesswdConfig {
    fn default() -> Self {
        Self {
            max_ping: 3,
            ping_interval: Duration::from_secs(4),
            kill_timeout: Duration::from_secs(2),
        }
    }
}

/// Boot-state selection and reboot/watchdog-reset loop thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstateConfig {
    /// Path to the persisted `saved_state` file.
    pub saved_state_path: PathBuf,

    /// Path to the boot/reset counter file.
    pub counter_path: PathBuf,

    /// Minimum uptime, in seconds, for a boot to not count toward the
    /// reboot-loop counter.
    pub min_boot_time_secs: u64,

    /// Maximum boots within `min_boot_time_secs` before the loop is MALF'd.
    pub max_boots: u32,

    /// Minimum uptime, in seconds, for a boot to not count toward the
    /// watchdog-reset-loop counter.
    pub min_wd_reset_time_secs: u64,

    /// Maximum watchdog resets within `min_wd_reset_time_secs` before MALF.
    pub max_wd_resets: u32,
}

impl Default for BootstateConfig {
    fn default() -> Self {
        Self {
            saved_state_path: PathBuf::from("/var/lib/dsme/saved_state"),
            counter_path: PathBuf::from("/var/lib/dsme/boot_count"),
            min_boot_time_secs: 120,
            max_boots: 5,
            min_wd_reset_time_secs: 600,
            max_wd_resets: 6,
        }
    }
}

/// One monitored mount point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountLimit {
    /// Mount path to `statfs`.
    pub mount_path: PathBuf,
    /// Used-space percentage at or above which `DISK_SPACE` is broadcast.
    pub max_percent: u8,
}

/// Disk usage monitor and reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskmonConfig {
    /// Mount points to monitor, in scan order.
    pub mounts: Vec<MountLimit>,

    /// Mount paths excluded from monitoring without needing a rebuild.
    pub excluded_mounts: Vec<PathBuf>,

    /// How often the monitor samples `statfs` for each mount.
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
}

impl Default for DiskmonConfig {
    fn default() -> Self {
        Self {
            mounts: vec![MountLimit {
                mount_path: PathBuf::from("/"),
                max_percent: 90,
            }],
            excluded_mounts: Vec::new(),
            scan_interval: Duration::from_secs(60),
        }
    }
}

/// Stale-file reaper configuration, consulted when the disk monitor reports
/// a mount over threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Directories swept for reapable files when triggered.
    pub temp_dirs: Vec<PathBuf>,

    /// Mounts whose `DISK_SPACE` report triggers a sweep.
    pub trigger_mounts: Vec<PathBuf>,

    /// Unprivileged user the reaper child drops to before sweeping.
    pub user: String,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            temp_dirs: vec![PathBuf::from("/tmp"), PathBuf::from("/home/user/MyDocs")],
            trigger_mounts: vec![PathBuf::from("/"), PathBuf::from("/tmp")],
            user: "nobody".to_string(),
        }
    }
}

/// Thermal status bucket boundaries, shared by every thermal object unless
/// overridden per-object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalBucket {
    /// Status name (e.g. "normal", "warning", "alert", "fatal").
    pub name: String,
    /// Inclusive lower bound, degrees Celsius.
    pub min: i32,
    /// Exclusive upper bound, degrees Celsius.
    pub max: i32,
    /// Shortest interval an object should wait before its next poll while in
    /// this bucket. Published to the IPHB broker as the window's lower edge
    /// so the broker can pull a wake-up earlier to coalesce with another
    /// subscriber, but never sooner than this.
    #[serde(with = "humantime_serde")]
    pub min_poll_interval: Duration,
    /// Longest interval an object should wait before its next poll while in
    /// this bucket. Published to the IPHB broker as the window's upper edge;
    /// hotter buckets set both bounds lower so a runaway temperature is
    /// caught sooner.
    #[serde(with = "humantime_serde")]
    pub max_poll_interval: Duration,
}

/// Thermal management configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalConfig {
    /// Status buckets shared by objects that don't override them.
    pub default_buckets: Vec<ThermalBucket>,

    /// Consecutive confirming samples required before a status transition
    /// is accepted (hysteresis).
    pub hysteresis_samples: u32,

    /// Sampling interval.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,

    /// Path to the flag file that vetoes reboot-substitution after an
    /// overheat-triggered shutdown.
    pub force_shutdown_flag_path: PathBuf,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            default_buckets: vec![
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
            ],
            hysteresis_samples: 2,
            sample_interval: Duration::from_secs(30),
            force_shutdown_flag_path: PathBuf::from("/var/lib/dsme/force_shutdown"),
        }
    }
}

/// Power-on timer (CAL-backed) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowertimerConfig {
    /// Path to the versioned CAL block backing store.
    pub cal_path: PathBuf,

    /// How often accumulated USER-mode seconds are flushed to the CAL block.
    #[serde(with = "humantime_serde")]
    pub save_interval: Duration,
}

impl Default for PowertimerConfig {
    fn default() -> Self {
        Self {
            cal_path: PathBuf::from("/var/lib/dsme/power_on_timer"),
            save_interval: Duration::from_secs(900),
        }
    }
}

/// Metrics and diagnostics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics collection.
    pub enabled: bool,

    /// Size of the kick-interval / heartbeat histogram ring buffer.
    pub histogram_size: usize,

    /// Percentiles to compute (e.g., [50, 90, 99, 99.9]).
    pub percentiles: Vec<f64>,

    /// Export metrics via an HTTP endpoint in Prometheus text format.
    pub http_export: bool,

    /// HTTP export port.
    pub http_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            histogram_size: 1024,
            percentiles: vec![50.0, 90.0, 99.0],
            http_export: false,
            http_port: 9191,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RuntimeConfig::default();
        assert!(config.realtime.enabled);
        assert_eq!(config.realtime.priority, 99);
        assert_eq!(config.bootstate.max_boots, 5);
        assert_eq!(config.bootstate.max_wd_resets, 6);
    }

    #[test]
    fn parse_toml() {
        let toml = r#"
            [hwwd]
            timeout = "12s"
            kick_interval = "4s"

            [[hwwd.devices]]
            path = "/dev/watchdog0"
            name = "omap-wd"

            [bootstate]
            max_boots = 5
            max_wd_resets = 6
        "#;

        let config = RuntimeConfig::from_toml(toml).unwrap();
        assert_eq!(config.hwwd.devices.len(), 1);
        assert_eq!(config.hwwd.devices[0].name, "omap-wd");
        assert_eq!(config.bootstate.max_boots, 5);
    }

    #[test]
    fn cpu_affinity_variants() {
        let single: CpuAffinity = serde_json::from_str("3").unwrap();
        assert_eq!(single, CpuAffinity::Single(3));

        let set: CpuAffinity = serde_json::from_str("[1, 2, 3]").unwrap();
        assert_eq!(set, CpuAffinity::Set(vec![1, 2, 3]));
    }

    #[test]
    fn roundtrip_toml() {
        let config = RuntimeConfig::default();
        let toml = config.to_toml().unwrap();
        let parsed = RuntimeConfig::from_toml(&toml).unwrap();
        assert_eq!(config.hwwd.timeout, parsed.hwwd.timeout);
        assert_eq!(config.bootstate.max_boots, parsed.bootstate.max_boots);
    }

    #[test]
    fn disk_mount_defaults_to_root() {
        let config = RuntimeConfig::default();
        assert_eq!(config.diskmon.mounts.len(), 1);
        assert_eq!(config.diskmon.mounts[0].mount_path, PathBuf::from("/"));
    }
}
