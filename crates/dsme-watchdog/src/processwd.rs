//! Process watchdog: pid supervision via ping/pong.
//!
//! A client registers a pid with [`Message::ProcesswdCreate`] and from then
//! on is expected to answer a periodic ping with
//! [`Message::ProcesswdPong`]. A client that misses `max_ping` consecutive
//! pings is sent `SIGABRT`; if it hasn't exited or answered within
//! `kill_timeout`, it is sent `SIGKILL`. A pong at any point resets the
//! missed-ping count to zero and cancels any pending kill.
//!
//! Supervision runs on its own tick thread rather than through the bus's
//! cooperative timer wheel, the same way [`crate::hwwd`] kicks its devices
//! independently of the event loop -- a stalled daemon loop must not be
//! able to starve either watchdog.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dsme_bus::{BusContext, Endpoint, Message, Module};
use dsme_common::config::ProcesswdConfig;
use dsme_common::error::{DsmeError, DsmeResult};
use tracing::{debug, info, warn};

/// Granularity of the supervision tick. Independent of `ping_interval` and
/// `kill_timeout`, which are timed against wall-clock `Instant`s rather than
/// tick counts, so this only bounds how promptly a deadline is noticed.
const TICK: Duration = Duration::from_millis(250);

struct ClientEntry {
    endpoint: Endpoint,
    ping_count: u32,
    last_ping_at: Instant,
    abort_sent_at: Option<Instant>,
}

struct Shared {
    clients: HashMap<i32, ClientEntry>,
    stop: bool,
}

/// Module-kernel participant supervising registered client pids.
pub struct ProcesswdModule {
    shared: Arc<Mutex<Shared>>,
    thread: Option<JoinHandle<()>>,
}

impl ProcesswdModule {
    /// Start the supervision tick thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the tick thread fails to spawn.
    pub fn new(config: &ProcesswdConfig, bus_sender: Sender<Message>) -> DsmeResult<Self> {
        let shared = Arc::new(Mutex::new(Shared { clients: HashMap::new(), stop: false }));

        let thread_shared = Arc::clone(&shared);
        let config = config.clone();
        let thread = thread::Builder::new()
            .name("dsme-processwd".into())
            .spawn(move || tick_loop(thread_shared, config, bus_sender))
            .map_err(|e| {
                DsmeError::Fault(format!("failed to spawn processwd tick thread: {e}"))
            })?;

        Ok(Self { shared, thread: Some(thread) })
    }
}

fn tick_loop(shared: Arc<Mutex<Shared>>, config: ProcesswdConfig, bus_sender: Sender<Message>) {
    loop {
        thread::sleep(TICK);

        let mut guard = shared.lock().unwrap();
        if guard.stop {
            break;
        }

        let now = Instant::now();
        let mut to_kill = Vec::new();
        let mut to_ping = Vec::new();

        for (&pid, client) in &mut guard.clients {
            if let Some(abort_at) = client.abort_sent_at {
                if now.duration_since(abort_at) >= config.kill_timeout {
                    to_kill.push(pid);
                }
                continue;
            }

            if now.duration_since(client.last_ping_at) < config.ping_interval {
                continue;
            }
            client.last_ping_at = now;
            client.ping_count += 1;

            if client.ping_count >= config.max_ping {
                warn!(pid, "process watchdog client missed too many pings, sending SIGABRT");
                // SAFETY: pid is a plain integer argument; kill() is always
                // safe to call, its only effect is delivering the signal.
                unsafe {
                    libc::kill(pid, libc::SIGABRT);
                }
                client.abort_sent_at = Some(now);
            } else {
                to_ping.push(pid);
            }
        }

        for pid in to_kill {
            warn!(pid, "process watchdog client missed kill_timeout, sending SIGKILL");
            // SAFETY: see above.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
            guard.clients.remove(&pid);
        }

        drop(guard);

        for pid in to_ping {
            let _ = bus_sender.send(Message::ProcesswdPing { pid });
        }
    }
}

impl Module for ProcesswdModule {
    fn name(&self) -> &str {
        "processwd"
    }

    fn handle(&mut self, msg: &Message, _ctx: &mut BusContext<'_>) {
        let mut guard = self.shared.lock().unwrap();
        match msg {
            Message::ProcesswdCreate { pid, endpoint } => {
                guard.clients.entry(*pid).or_insert_with(|| {
                    info!(pid, "process watchdog client registered");
                    ClientEntry {
                        endpoint: endpoint.clone(),
                        ping_count: 0,
                        last_ping_at: Instant::now(),
                        abort_sent_at: None,
                    }
                });
            }
            Message::ProcesswdDelete { pid } | Message::ProcessExited { pid } => {
                if guard.clients.remove(pid).is_some() {
                    debug!(pid, "process watchdog client unregistered");
                }
            }
            Message::ProcesswdPong { pid } => {
                if let Some(client) = guard.clients.get_mut(pid) {
                    client.ping_count = 0;
                    client.abort_sent_at = None;
                    client.last_ping_at = Instant::now();
                }
            }
            Message::Close { endpoint } => {
                let dead: Vec<i32> = guard
                    .clients
                    .iter()
                    .filter(|(_, c)| &c.endpoint == endpoint)
                    .map(|(&pid, _)| pid)
                    .collect();
                for pid in dead {
                    warn!(pid, "process watchdog client's connection closed, sending SIGKILL");
                    // SAFETY: see tick_loop.
                    unsafe {
                        libc::kill(pid, libc::SIGKILL);
                    }
                    guard.clients.remove(&pid);
                }
            }
            _ => {}
        }
    }
}

impl Drop for ProcesswdModule {
    fn drop(&mut self) {
        self.shared.lock().unwrap().stop = true;
        if let Some(handle) = self.thread.take() {
            // The tick thread wakes at most every TICK; a short join wait
            // keeps shutdown snappy without forcibly detaching it.
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn module() -> ProcesswdModule {
        ProcesswdModule {
            shared: Arc::new(Mutex::new(Shared { clients: HashMap::new(), stop: false })),
            thread: None,
        }
    }

    #[test]
    fn duplicate_pid_registration_is_ignored() {
        let mut m = module();
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);

        let ep_a = Endpoint::broadcast();
        let ep_b = Endpoint::broadcast();
        m.handle(&Message::ProcesswdCreate { pid: 42, endpoint: ep_a }, &mut ctx);
        m.handle(&Message::ProcesswdCreate { pid: 42, endpoint: ep_b }, &mut ctx);

        assert_eq!(m.shared.lock().unwrap().clients.len(), 1);
    }

    #[test]
    fn pong_resets_ping_count_and_clears_abort() {
        let mut m = module();
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);

        m.handle(
            &Message::ProcesswdCreate { pid: 7, endpoint: Endpoint::broadcast() },
            &mut ctx,
        );
        {
            let mut guard = m.shared.lock().unwrap();
            let client = guard.clients.get_mut(&7).unwrap();
            client.ping_count = 3;
            client.abort_sent_at = Some(Instant::now());
        }

        m.handle(&Message::ProcesswdPong { pid: 7 }, &mut ctx);

        let guard = m.shared.lock().unwrap();
        let client = guard.clients.get(&7).unwrap();
        assert_eq!(client.ping_count, 0);
        assert!(client.abort_sent_at.is_none());
    }

    #[test]
    fn process_exited_removes_entry() {
        let mut m = module();
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);

        m.handle(
            &Message::ProcesswdCreate { pid: 9, endpoint: Endpoint::broadcast() },
            &mut ctx,
        );
        m.handle(&Message::ProcessExited { pid: 9 }, &mut ctx);

        assert!(m.shared.lock().unwrap().clients.is_empty());
    }

    #[test]
    fn close_removes_only_that_endpoints_entries() {
        let mut m = module();
        let mut outgoing = VecDeque::new();
        let mut ctx = BusContext::new(&mut outgoing);

        let ep1 = Endpoint::broadcast();
        let ep2 = Endpoint::broadcast();
        m.handle(
            &Message::ProcesswdCreate { pid: 1, endpoint: ep1.clone() },
            &mut ctx,
        );
        m.handle(
            &Message::ProcesswdCreate { pid: 2, endpoint: ep2.clone() },
            &mut ctx,
        );

        m.handle(&Message::Close { endpoint: ep1 }, &mut ctx);

        let guard = m.shared.lock().unwrap();
        assert!(!guard.clients.contains_key(&1));
        assert!(guard.clients.contains_key(&2));
    }
}
