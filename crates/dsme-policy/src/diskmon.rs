//! Disk usage monitor.
//!
//! Each tick, `statfs`-samples every configured mount in order and
//! broadcasts [`Message::DiskSpace`] for (and stops scanning at) the first
//! one at or above its configured threshold — a full `/tmp` matters more
//! than a merely full `/home/user/MyDocs`, so the table's order is the
//! priority order. Disabled until [`Message::BaseBootDone`] arrives, since
//! sampling before the filesystem layout has settled produces noise.

use std::path::Path;

use dsme_bus::{BusContext, Message, Module};
use dsme_common::config::DiskmonConfig;
use tracing::{debug, warn};

/// IPHB owner id / [`Message::WakeupTimer`] correlation id for this module.
pub const OWNER_ID: u32 = 1;

/// Abstracts the `statfs` sampling so tests can supply canned readings
/// without a real filesystem.
pub trait MountStats: Send {
    /// Used-space percentage for `mount_path`, or `None` if it cannot be
    /// sampled (not mounted, permission denied, ...).
    fn used_percent(&self, mount_path: &Path) -> Option<u8>;
}

/// Real `statvfs(2)`-backed implementation.
#[derive(Debug, Default)]
pub struct StatvfsStats;

impl MountStats for StatvfsStats {
    fn used_percent(&self, mount_path: &Path) -> Option<u8> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(mount_path.as_os_str().as_bytes()).ok()?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is NUL-terminated and `stat` is a valid, correctly
        // sized out-parameter for the duration of the call.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), std::ptr::addr_of_mut!(stat)) };
        if rc != 0 {
            return None;
        }
        if stat.f_blocks == 0 {
            return Some(0);
        }

        let used = stat.f_blocks.saturating_sub(stat.f_bfree);
        let percent = (used as f64 * 100.0 / stat.f_blocks as f64).round();
        Some(percent.clamp(0.0, 100.0) as u8)
    }
}

/// Module-kernel participant sampling configured mounts on each wake-up.
pub struct DiskmonModule {
    config: DiskmonConfig,
    stats: Box<dyn MountStats>,
    base_boot_done: bool,
}

impl DiskmonModule {
    /// Build a disk monitor backed by real `statvfs` sampling.
    #[must_use]
    pub fn new(config: DiskmonConfig) -> Self {
        Self::with_stats(config, Box::new(StatvfsStats))
    }

    /// Build a disk monitor with an injected stats source, for tests.
    #[must_use]
    pub fn with_stats(config: DiskmonConfig, stats: Box<dyn MountStats>) -> Self {
        Self { config, stats, base_boot_done: false }
    }

    fn scan(&self, ctx: &mut BusContext<'_>) {
        for mount in &self.config.mounts {
            if self.config.excluded_mounts.iter().any(|p| p == &mount.mount_path) {
                continue;
            }

            match self.stats.used_percent(&mount.mount_path) {
                Some(percent) if percent >= mount.max_percent => {
                    debug!(mount = %mount.mount_path.display(), percent, "mount over threshold");
                    ctx.send(Message::DiskSpace {
                        mount_path: mount.mount_path.display().to_string(),
                        used_percent: percent,
                    });
                    // Stop scanning further entries this cycle: only the
                    // highest-priority offender is reported per tick.
                    break;
                }
                Some(_) => {}
                None => {
                    warn!(mount = %mount.mount_path.display(), "failed to sample mount usage");
                }
            }
        }
    }
}

impl Module for DiskmonModule {
    fn name(&self) -> &str {
        "diskmon"
    }

    fn handle(&mut self, msg: &Message, ctx: &mut BusContext<'_>) {
        match msg {
            Message::BaseBootDone => {
                debug!("disk monitor enabled by base_boot_done");
                self.base_boot_done = true;
            }
            Message::WakeupTimer { timer_id } if *timer_id as u32 == OWNER_ID => {
                if self.base_boot_done {
                    self.scan(ctx);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsme_common::config::MountLimit;
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    struct FakeStats(HashMap<PathBuf, u8>);

    impl MountStats for FakeStats {
        fn used_percent(&self, mount_path: &Path) -> Option<u8> {
            self.0.get(mount_path).copied()
        }
    }

    fn config(mounts: Vec<(&str, u8)>) -> DiskmonConfig {
        DiskmonConfig {
            mounts: mounts
                .into_iter()
                .map(|(path, max_percent)| MountLimit { mount_path: PathBuf::from(path), max_percent })
                .collect(),
            excluded_mounts: Vec::new(),
            scan_interval: std::time::Duration::from_secs(60),
        }
    }

    fn wakeup(module: &mut DiskmonModule) -> VecDeque<Message> {
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        module.handle(&Message::WakeupTimer { timer_id: OWNER_ID as u64 }, &mut ctx);
        outgoing
    }

    #[test]
    fn disabled_until_base_boot_done() {
        let mut stats = HashMap::new();
        stats.insert(PathBuf::from("/"), 95);
        let mut module = DiskmonModule::with_stats(config(vec![("/", 90)]), Box::new(FakeStats(stats)));

        assert!(wakeup(&mut module).is_empty());
    }

    #[test]
    fn over_threshold_mount_broadcasts_and_stops_scan() {
        let mut stats = HashMap::new();
        stats.insert(PathBuf::from("/"), 95);
        stats.insert(PathBuf::from("/tmp"), 99);
        let mut module = DiskmonModule::with_stats(
            config(vec![("/", 90), ("/tmp", 90)]),
            Box::new(FakeStats(stats)),
        );

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        module.handle(&Message::BaseBootDone, &mut ctx);
        module.handle(&Message::WakeupTimer { timer_id: OWNER_ID as u64 }, &mut ctx);

        assert_eq!(outgoing.len(), 1);
        assert!(matches!(
            &outgoing[0],
            Message::DiskSpace { mount_path, used_percent: 95 } if mount_path == "/"
        ));
    }

    #[test]
    fn at_exactly_threshold_still_fires() {
        let mut stats = HashMap::new();
        stats.insert(PathBuf::from("/"), 90);
        let mut module = DiskmonModule::with_stats(config(vec![("/", 90)]), Box::new(FakeStats(stats)));

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        module.handle(&Message::BaseBootDone, &mut ctx);
        module.handle(&Message::WakeupTimer { timer_id: OWNER_ID as u64 }, &mut ctx);

        assert_eq!(outgoing.len(), 1);
    }

    #[test]
    fn excluded_mount_is_skipped() {
        let mut stats = HashMap::new();
        stats.insert(PathBuf::from("/"), 99);
        let mut cfg = config(vec![("/", 90)]);
        cfg.excluded_mounts.push(PathBuf::from("/"));
        let mut module = DiskmonModule::with_stats(cfg, Box::new(FakeStats(stats)));

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        module.handle(&Message::BaseBootDone, &mut ctx);
        module.handle(&Message::WakeupTimer { timer_id: OWNER_ID as u64 }, &mut ctx);

        assert!(outgoing.is_empty());
    }

    #[test]
    fn unchanged_filesystem_emits_same_event_set_across_cycles() {
        let mut stats = HashMap::new();
        stats.insert(PathBuf::from("/"), 95);
        let mut module = DiskmonModule::with_stats(config(vec![("/", 90)]), Box::new(FakeStats(stats)));

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        module.handle(&Message::BaseBootDone, &mut ctx);
        module.handle(&Message::WakeupTimer { timer_id: OWNER_ID as u64 }, &mut ctx);
        let first = outgoing.len();
        outgoing.clear();
        module.handle(&Message::WakeupTimer { timer_id: OWNER_ID as u64 }, &mut ctx);
        assert_eq!(outgoing.len(), first);
    }

    #[test]
    fn unrelated_wakeup_id_is_ignored() {
        let mut stats = HashMap::new();
        stats.insert(PathBuf::from("/"), 99);
        let mut module = DiskmonModule::with_stats(config(vec![("/", 90)]), Box::new(FakeStats(stats)));

        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        module.handle(&Message::BaseBootDone, &mut ctx);
        module.handle(&Message::WakeupTimer { timer_id: 999 }, &mut ctx);

        assert!(outgoing.is_empty());
    }
}
