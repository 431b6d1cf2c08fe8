//! Stale-file reaper.
//!
//! Reacts to [`Message::DiskSpace`] for a trigger mount by forking a
//! sandboxed child that sweeps the configured temp directories and exits.
//! The sweep policy itself (size/age/open-file checks) is a plain function
//! so it can be exercised without forking; only [`ReaperModule::handle`]
//! needs a real process, since dropping privileges and closing inherited
//! file descriptors only make sense in a child that is about to exit.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use dsme_bus::{BusContext, Message, Module};
use dsme_common::config::ReaperConfig;
use dsme_common::error::{DsmeError, DsmeResult};
use tracing::{debug, info, warn};

/// Minimum file size considered for reaping.
pub const MIN_REAP_SIZE_BYTES: u64 = 16 * 1024;

/// Minimum mtime/atime age before a file is considered for reaping.
pub const MIN_REAP_AGE: Duration = Duration::from_secs(30 * 60);

/// Tallies a single [`sweep`] pass, returned for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Regular files examined.
    pub scanned: u64,
    /// Regular files removed.
    pub deleted: u64,
}

/// Checks whether a file currently has an open file descriptor, abstracted
/// so tests can fake the answer instead of shelling out to `lsof`.
pub trait FileProbe: Send + Sync {
    /// Whether any process currently holds `path` open.
    fn is_open(&self, path: &Path) -> bool;
}

/// Shells out to `lsof` to answer [`FileProbe::is_open`].
#[derive(Debug, Default)]
pub struct LsofProbe;

impl FileProbe for LsofProbe {
    fn is_open(&self, path: &Path) -> bool {
        std::process::Command::new("lsof")
            .arg(path)
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}

/// Recursively walk `dirs`, deleting every regular file whose size exceeds
/// [`MIN_REAP_SIZE_BYTES`], whose mtime and atime are both older than
/// [`MIN_REAP_AGE`], and which `probe` reports as unopened. Directory
/// entries and small/young/open files are left untouched.
#[must_use]
pub fn sweep(dirs: &[PathBuf], probe: &dyn FileProbe) -> SweepReport {
    let mut report = SweepReport::default();
    for dir in dirs {
        sweep_dir(dir, probe, &mut report);
    }
    report
}

fn sweep_dir(dir: &Path, probe: &dyn FileProbe, report: &mut SweepReport) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            sweep_dir(&path, probe, report);
            continue;
        }
        if !metadata.is_file() {
            continue;
        }

        report.scanned += 1;
        if is_reapable(&path, &metadata, probe) && std::fs::remove_file(&path).is_ok() {
            report.deleted += 1;
        }
    }
}

fn is_reapable(path: &Path, metadata: &Metadata, probe: &dyn FileProbe) -> bool {
    if metadata.len() <= MIN_REAP_SIZE_BYTES {
        return false;
    }

    let old_enough = |reading: std::io::Result<SystemTime>| {
        reading
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .is_some_and(|age| age >= MIN_REAP_AGE)
    };

    if !old_enough(metadata.modified()) || !old_enough(metadata.accessed()) {
        return false;
    }

    !probe.is_open(path)
}

/// Module-kernel participant tracking (at most) one live reaper child.
pub struct ReaperModule {
    config: ReaperConfig,
    active_child: Option<i32>,
}

impl ReaperModule {
    /// Build a reaper with no child currently running.
    #[must_use]
    pub fn new(config: ReaperConfig) -> Self {
        Self { config, active_child: None }
    }

    fn should_trigger(&self, mount_path: &str) -> bool {
        self.config.trigger_mounts.iter().any(|p| p.as_os_str() == mount_path)
    }

    fn spawn_child(&self) -> DsmeResult<i32> {
        let dirs = self.config.temp_dirs.clone();
        let user = self.config.user.clone();

        // SAFETY: fork() duplicates the calling process. The child branch
        // below performs only the fd/privilege setup and the sweep itself
        // before exiting; it never returns across the call boundary into
        // Rust code that assumed a single-threaded parent.
        let pid = unsafe { libc::fork() };
        match pid.cmp(&0) {
            std::cmp::Ordering::Less => {
                Err(DsmeError::Fault(format!("reaper fork failed: {}", std::io::Error::last_os_error())))
            }
            std::cmp::Ordering::Equal => child_main(&dirs, &user),
            std::cmp::Ordering::Greater => Ok(pid as i32),
        }
    }
}

/// Runs only in the forked child: close inherited fds, drop privileges,
/// lower priority, sweep, then exit. Never returns.
fn child_main(dirs: &[PathBuf], user: &str) -> ! {
    close_inherited_fds();
    drop_privileges(user);
    // SAFETY: nice() takes a plain integer increment and has no
    // preconditions; called once, early, before any other work.
    unsafe {
        libc::nice(5);
    }

    let report = sweep(dirs, &LsofProbe);
    info!(scanned = report.scanned, deleted = report.deleted, "reaper sweep complete");
    std::process::exit(0);
}

fn close_inherited_fds() {
    // SAFETY: sysconf's result is read-only process metadata; close() on an
    // fd number that happens not to be open simply returns EBADF, which is
    // ignored here since the goal is "closed or never open" either way.
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    for fd in 3..max_fd {
        unsafe {
            libc::close(fd as libc::c_int);
        }
    }
}

fn drop_privileges(user: &str) {
    let Ok(c_user) = std::ffi::CString::new(user) else {
        return;
    };
    // SAFETY: c_user is NUL-terminated and alive for the call; the
    // returned pointer (if non-null) is read immediately, before any other
    // libc call that might reuse getpwnam's static buffer.
    let pw = unsafe { libc::getpwnam(c_user.as_ptr()) };
    if pw.is_null() {
        return;
    }
    // SAFETY: pw was just checked non-null and points to a valid passwd
    // struct owned by libc's static buffer.
    let (uid, gid) = unsafe { ((*pw).pw_uid, (*pw).pw_gid) };
    // SAFETY: setgid before setuid, standard privilege-drop order so the
    // process retains permission to change its group.
    unsafe {
        libc::setgid(gid);
        libc::setuid(uid);
    }
}

impl Module for ReaperModule {
    fn name(&self) -> &str {
        "reaper"
    }

    fn handle(&mut self, msg: &Message, _ctx: &mut BusContext<'_>) {
        match msg {
            Message::DiskSpace { mount_path, .. } => {
                if !self.should_trigger(mount_path) {
                    return;
                }
                if self.active_child.is_some() {
                    debug!("reaper already running, skipping trigger");
                    return;
                }
                match self.spawn_child() {
                    Ok(pid) => {
                        info!(pid, "reaper child spawned");
                        self.active_child = Some(pid);
                    }
                    Err(e) => warn!(error = %e, "failed to spawn reaper child"),
                }
            }
            Message::ProcessExited { pid } => {
                if self.active_child == Some(*pid) {
                    debug!(pid, "reaper child exited");
                    self.active_child = None;
                }
            }
            _ => {}
        }
    }
}

impl Drop for ReaperModule {
    fn drop(&mut self) {
        if let Some(pid) = self.active_child.take() {
            // SAFETY: pid is a plain integer; kill()'s only effect is
            // delivering the signal, harmless if the child already exited.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::fs;
    use std::time::{Duration as StdDuration, SystemTime};
    use tempfile::tempdir;

    struct AlwaysClosed;
    impl FileProbe for AlwaysClosed {
        fn is_open(&self, _path: &Path) -> bool {
            false
        }
    }

    struct AlwaysOpen;
    impl FileProbe for AlwaysOpen {
        fn is_open(&self, _path: &Path) -> bool {
            true
        }
    }

    fn set_age(path: &Path, age: StdDuration) {
        let when = SystemTime::now() - age;
        let times = fs::FileTimes::new().set_modified(when).set_accessed(when);
        fs::File::options().write(true).open(path).unwrap().set_times(times).unwrap();
    }

    #[test]
    fn small_files_are_never_reaped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.bin");
        fs::write(&path, vec![0u8; 100]).unwrap();
        set_age(&path, StdDuration::from_secs(3600));

        let report = sweep(&[dir.path().to_path_buf()], &AlwaysClosed);
        assert_eq!(report.deleted, 0);
        assert!(path.exists());
    }

    #[test]
    fn young_large_files_are_not_reaped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        fs::write(&path, vec![0u8; 20 * 1024]).unwrap();

        let report = sweep(&[dir.path().to_path_buf()], &AlwaysClosed);
        assert_eq!(report.deleted, 0);
        assert!(path.exists());
    }

    #[test]
    fn open_files_are_never_reaped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("open.bin");
        fs::write(&path, vec![0u8; 20 * 1024]).unwrap();
        set_age(&path, StdDuration::from_secs(3600));

        let report = sweep(&[dir.path().to_path_buf()], &AlwaysOpen);
        assert_eq!(report.deleted, 0);
        assert!(path.exists());
    }

    #[test]
    fn old_large_unopened_files_are_reaped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.bin");
        fs::write(&path, vec![0u8; 20 * 1024]).unwrap();
        set_age(&path, StdDuration::from_secs(3600));

        let report = sweep(&[dir.path().to_path_buf()], &AlwaysClosed);
        assert_eq!(report.deleted, 1);
        assert!(!path.exists());
    }

    #[test]
    fn recurses_into_subdirectories() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let path = sub.join("stale.bin");
        fs::write(&path, vec![0u8; 20 * 1024]).unwrap();
        set_age(&path, StdDuration::from_secs(3600));

        let report = sweep(&[dir.path().to_path_buf()], &AlwaysClosed);
        assert_eq!(report.deleted, 1);
    }

    fn config() -> ReaperConfig {
        ReaperConfig {
            temp_dirs: vec![PathBuf::from("/tmp")],
            trigger_mounts: vec![PathBuf::from("/"), PathBuf::from("/tmp")],
            user: "nobody".into(),
        }
    }

    #[test]
    fn non_trigger_mount_is_ignored() {
        let mut module = ReaperModule::new(config());
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        module.handle(
            &Message::DiskSpace { mount_path: "/home/user/MyDocs".into(), used_percent: 95 },
            &mut ctx,
        );
        assert!(module.active_child.is_none());
    }

    #[test]
    fn process_exited_clears_tracked_child() {
        let mut module = ReaperModule::new(config());
        module.active_child = Some(4242);
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        module.handle(&Message::ProcessExited { pid: 4242 }, &mut ctx);
        assert!(module.active_child.is_none());
    }

    #[test]
    fn unrelated_exit_does_not_clear_tracked_child() {
        let mut module = ReaperModule::new(config());
        module.active_child = Some(4242);
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);
        module.handle(&Message::ProcessExited { pid: 1 }, &mut ctx);
        assert_eq!(module.active_child, Some(4242));
    }
}
