//! Hardware watchdog kicker.
//!
//! Kicks an ordered, fixed list of `/dev/watchdog*` nodes on a timer so a
//! hung or killed daemon still reboots the board. Devices are opened once,
//! in the order given by configuration, and every kick round walks that
//! same order; the first device that fails to kick aborts the round rather
//! than skipping ahead, since a watchdog that silently stopped being kicked
//! is exactly the failure this module exists to prevent.
//!
//! A device whose name appears in the R&D disable list (sourced from the
//! CAL `r&d_mode` block) is never opened at all -- this is how test and
//! development images avoid reboots while still exercising the rest of the
//! daemon.
//!
//! Kicking is normally done by an internal thread. If an external process
//! registers itself with [`Message::HwwdKickerRegister`], this module stops
//! kicking the devices directly and instead forwards kick *permission* to
//! that process (`Message::HwwdKick`, relayed over the control socket by
//! `dsme-daemon::socket`), trusting it to perform the real kick before the
//! configured interval elapses. The registration is released on
//! `Message::Close` for the same endpoint, at which point internal kicking
//! resumes.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::io::AsRawFd;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dsme_bus::{BusContext, Endpoint, Message, Module};
use dsme_common::config::{HwwdConfig, RealtimeConfig, WatchdogDevice};
use dsme_common::error::{DsmeError, DsmeResult};
use tracing::{debug, error, info, warn};

use crate::realtime;

const WDIOC_SETTIMEOUT: libc::c_ulong = 0xC004_5706;

struct OpenDevice {
    name: String,
    file: File,
}

impl OpenDevice {
    fn open(device: &WatchdogDevice, timeout: Duration) -> DsmeResult<Self> {
        let file = OpenOptions::new().write(true).open(&device.path).map_err(|e| {
            DsmeError::IoError(format!("open {}: {e}", device.path.display()))
        })?;

        let mut secs = timeout.as_secs().max(1) as libc::c_int;
        // SAFETY: fd is a freshly opened, owned watchdog device and `secs`
        // is a valid stack value alive for the duration of the call.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), WDIOC_SETTIMEOUT, &mut secs) };
        if rc < 0 {
            return Err(DsmeError::IoError(format!(
                "SETTIMEOUT on {}: {}",
                device.name,
                std::io::Error::last_os_error()
            )));
        }

        info!(device = %device.name, timeout_secs = secs, "watchdog device opened");
        Ok(Self { name: device.name.clone(), file })
    }

    fn kick(&self) -> DsmeResult<()> {
        let mut f = &self.file;
        loop {
            match f.write_all(b"*") {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    return Err(DsmeError::WatchdogTimeout(format!(
                        "kick {} failed: {e}",
                        self.name
                    )))
                }
            }
        }
    }

    fn disable(&self) {
        let mut f = &self.file;
        if let Err(e) = f.write_all(b"V") {
            warn!(device = %self.name, error = %e, "magic close write failed");
        }
    }
}

/// The ordered set of watchdog devices actually kicked, after R&D disable
/// flags have removed whichever names they name.
struct HwwdDevices {
    devices: Vec<OpenDevice>,
}

impl HwwdDevices {
    fn open(config: &HwwdConfig) -> DsmeResult<Self> {
        let mut devices = Vec::new();
        for device in &config.devices {
            if config.rd_disabled.iter().any(|n| n == &device.name) {
                info!(device = %device.name, "watchdog device disabled by R&D flag");
                continue;
            }
            devices.push(OpenDevice::open(device, config.timeout)?);
        }
        Ok(Self { devices })
    }

    /// Kick every device in order. Stops at, and returns, the first
    /// failure rather than kicking the remaining devices out of order.
    fn kick_all(&self) -> DsmeResult<()> {
        for device in &self.devices {
            device.kick()?;
        }
        Ok(())
    }

    fn disable_all(&self) {
        for device in &self.devices {
            device.disable();
        }
    }

    fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

enum KickMode {
    Internal,
    External(Endpoint),
}

struct Shared {
    mode: KickMode,
    stop: bool,
}

/// Module-kernel participant that owns the hardware watchdog devices and
/// their kicker thread.
pub struct HwwdModule {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    last_kick: Arc<Mutex<Option<Instant>>>,
    thread: Option<JoinHandle<()>>,
}

impl HwwdModule {
    /// Open the configured devices and start the kicker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if any non-R&D-disabled device fails to open or
    /// accept `WDIOC_SETTIMEOUT`.
    pub fn new(
        config: &HwwdConfig,
        realtime_config: &RealtimeConfig,
        bus_sender: Sender<Message>,
    ) -> DsmeResult<Self> {
        let devices = HwwdDevices::open(config)?;
        if devices.is_empty() {
            warn!("no hardware watchdog devices active; board will not reset on hang");
        }

        let shared = Arc::new((
            Mutex::new(Shared { mode: KickMode::Internal, stop: false }),
            Condvar::new(),
        ));
        let last_kick = Arc::new(Mutex::new(None));

        let thread_shared = Arc::clone(&shared);
        let thread_last_kick = Arc::clone(&last_kick);
        let kick_interval = config.kick_interval;
        let realtime_config = realtime_config.clone();
        let thread = thread::Builder::new()
            .name("dsme-hwwd".into())
            .spawn(move || {
                kicker_loop(thread_shared, thread_last_kick, devices, kick_interval, realtime_config, bus_sender)
            })
            .map_err(|e| DsmeError::Fault(format!("failed to spawn hwwd kicker thread: {e}")))?;

        Ok(Self { shared, last_kick, thread: Some(thread) })
    }

    /// How long ago the internal kicker last kicked every device
    /// successfully, for diagnostics. `None` before the first kick, or
    /// while an external kicker holds permission (see [`Message::HwwdKickerRegister`]).
    #[must_use]
    pub fn last_kick_age(&self) -> Option<Duration> {
        self.last_kick.lock().unwrap().map(|at| at.elapsed())
    }
}

fn kicker_loop(
    shared: Arc<(Mutex<Shared>, Condvar)>,
    last_kick: Arc<Mutex<Option<Instant>>>,
    devices: HwwdDevices,
    kick_interval: Duration,
    realtime_config: RealtimeConfig,
    bus_sender: Sender<Message>,
) {
    match realtime::init_realtime(&realtime_config) {
        Ok(status) => info!(?status, "hwwd kicker thread real-time environment initialized"),
        Err(e) => error!(error = %e, "hwwd kicker thread failed to initialize real-time environment"),
    }

    let (lock, cvar) = &*shared;
    let mut guard = lock.lock().unwrap();
    loop {
        if guard.stop {
            break;
        }

        match &guard.mode {
            KickMode::Internal => {
                if let Err(e) = devices.kick_all() {
                    error!(error = %e, "hardware watchdog kick failed, entering MALF");
                    let _ = bus_sender.send(Message::EnterMalf {
                        reason: format!("hwwd kick failed: {e}"),
                    });
                } else {
                    *last_kick.lock().unwrap() = Some(Instant::now());
                }
            }
            KickMode::External(_) => {
                debug!("delegating kick permission to registered external kicker");
                let _ = bus_sender.send(Message::HwwdKick);
            }
        }

        let (g, timeout_result) = cvar.wait_timeout(guard, kick_interval).unwrap();
        guard = g;
        let _ = timeout_result;
    }

    devices.disable_all();
}

impl Module for HwwdModule {
    fn name(&self) -> &str {
        "hwwd"
    }

    fn handle(&mut self, msg: &Message, _ctx: &mut BusContext<'_>) {
        let (lock, cvar) = &*self.shared;
        match msg {
            Message::HwwdKickerRegister { endpoint } => {
                info!("external process registered as hardware watchdog kicker");
                lock.lock().unwrap().mode = KickMode::External(endpoint.clone());
                cvar.notify_all();
            }
            Message::Close { endpoint } => {
                let mut guard = lock.lock().unwrap();
                if matches!(&guard.mode, KickMode::External(e) if e == endpoint) {
                    info!("external kicker disconnected, resuming internal kicking");
                    guard.mode = KickMode::Internal;
                    cvar.notify_all();
                }
            }
            _ => {}
        }
    }
}

impl Drop for HwwdModule {
    fn drop(&mut self) {
        {
            let (lock, cvar) = &*self.shared;
            lock.lock().unwrap().stop = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("hwwd kicker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::mpsc;

    fn config_with(devices: Vec<WatchdogDevice>, rd_disabled: Vec<String>) -> HwwdConfig {
        HwwdConfig {
            devices,
            timeout: Duration::from_secs(30),
            kick_interval: Duration::from_millis(20),
            rd_disabled,
        }
    }

    #[test]
    fn rd_disabled_device_is_never_opened() {
        let config = config_with(
            vec![WatchdogDevice { path: PathBuf::from("/dev/watchdog0"), name: "wd0".into() }],
            vec!["wd0".into()],
        );
        let devices = HwwdDevices::open(&config).unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn empty_device_list_opens_cleanly() {
        let config = config_with(vec![], vec![]);
        let devices = HwwdDevices::open(&config).unwrap();
        assert!(devices.is_empty());
        assert!(devices.kick_all().is_ok());
    }

    #[test]
    fn external_registration_switches_mode_and_close_reverts_it() {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new((
            Mutex::new(Shared { mode: KickMode::Internal, stop: false }),
            Condvar::new(),
        ));
        let mut module =
            HwwdModule { shared: shared.clone(), last_kick: Arc::new(Mutex::new(None)), thread: None };
        let mut outgoing = std::collections::VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);

        let endpoint = Endpoint::broadcast();
        module.handle(&Message::HwwdKickerRegister { endpoint: endpoint.clone() }, &mut ctx);
        assert!(matches!(shared.0.lock().unwrap().mode, KickMode::External(_)));

        module.handle(&Message::Close { endpoint }, &mut ctx);
        assert!(matches!(shared.0.lock().unwrap().mode, KickMode::Internal));

        drop(tx);
        drop(rx);
    }
}
