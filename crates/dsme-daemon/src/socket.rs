//! Control socket: the external, client-facing wire protocol.
//!
//! Frames are `{u32 line_size, u32 payload_size, u32 type_id, payload,
//! extra}`, all integers little-endian (§6). Every accepted connection gets
//! its own [`Endpoint`] and its own reader thread; decoded messages are fed
//! into the bus through its cross-thread [`Sender`] so the socket layer
//! never touches module state directly, matching the hardware-watchdog
//! kicker thread's relationship to the bus.
//!
//! Only a handful of message kinds make sense arriving *from* a client
//! (`dsmetool`-equivalent callers): reboot/shutdown/powerup requests,
//! loglevel changes, process-watchdog registration and pong, hardware
//! watchdog kicker registration, and the external `base_boot_done` signal.
//! Anything else read off the wire is logged and dropped rather than
//! forwarded, since a malformed or hostile client should not be able to
//! forge messages (`StateChangeInd`, `DiskSpace`, ...) that only the daemon
//! itself is supposed to produce.

use std::io::{Read, Write};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::thread;

use dsme_bus::{Endpoint, Message, MessageKind};
use dsme_common::error::{DsmeError, DsmeResult};
use tracing::{debug, info, warn};

/// Size of the fixed `{line_size, payload_size, type_id}` header, in bytes.
const HEADER_LEN: usize = 12;

/// A bound, not-yet-accepting control socket.
pub struct SocketServer {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketServer {
    /// Bind the control socket at `path`, removing a stale socket file left
    /// behind by a previous, uncleanly terminated run.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// socket cannot be bound.
    pub fn bind(path: &Path) -> DsmeResult<Self> {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DsmeError::IoError(format!("create {}: {e}", parent.display())))?;
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| DsmeError::IoError(format!("bind {}: {e}", path.display())))?;
        info!(path = %path.display(), "control socket listening");
        Ok(Self { listener, path: path.to_path_buf() })
    }

    /// Spawn the accept loop on a background thread. Every accepted
    /// connection gets its own reader thread that decodes frames and
    /// forwards the resulting messages to `bus_sender`.
    #[must_use]
    pub fn spawn_accept_loop(self, bus_sender: Sender<Message>) -> thread::JoinHandle<()> {
        let path = self.path.clone();
        thread::Builder::new()
            .name("dsme-socket".into())
            .spawn(move || accept_loop(self.listener, bus_sender))
            .unwrap_or_else(|e| panic!("failed to spawn socket accept thread for {}: {e}", path.display()))
    }
}

fn accept_loop(listener: UnixListener, bus_sender: Sender<Message>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let sender = bus_sender.clone();
                let spawned = thread::Builder::new()
                    .name("dsme-socket-conn".into())
                    .spawn(move || handle_connection(stream, sender));
                if let Err(e) = spawned {
                    warn!(error = %e, "failed to spawn connection handler thread");
                }
            }
            Err(e) => warn!(error = %e, "control socket accept failed"),
        }
    }
}

fn handle_connection(mut stream: UnixStream, bus_sender: Sender<Message>) {
    let endpoint = match stream.try_clone() {
        Ok(dup) => {
            // SAFETY: `into_raw_fd` transfers ownership of a freshly
            // duplicated, valid fd to the `OwnedFd` the endpoint holds.
            let fd = unsafe { OwnedFd::from_raw_fd(dup.into_raw_fd()) };
            Endpoint::from_fd(fd)
        }
        Err(e) => {
            warn!(error = %e, "failed to duplicate client fd for endpoint identity");
            return;
        }
    };
    debug!(endpoint = ?endpoint, "control socket client connected");

    loop {
        match read_frame(&mut stream) {
            Ok(Some((kind, payload, extra))) => {
                match frame_to_message(kind, &payload, &extra, &endpoint) {
                    Some(msg) => {
                        if kind == MessageKind::SetLoglevel {
                            ack(&mut stream, kind);
                        }
                        if bus_sender.send(msg).is_err() {
                            debug!("bus receiver gone, dropping connection");
                            break;
                        }
                    }
                    None => warn!(?kind, "dropping message of a kind clients may not send"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "control socket frame decode error, closing connection");
                break;
            }
        }
    }

    let _ = bus_sender.send(Message::Close { endpoint });
}

/// Read one frame, returning `Ok(None)` on a clean EOF between frames.
fn read_frame(stream: &mut UnixStream) -> std::io::Result<Option<(MessageKind, Vec<u8>, Vec<u8>)>> {
    let mut header = [0u8; HEADER_LEN];
    match read_exact_or_eof(stream, &mut header)? {
        false => return Ok(None),
        true => {}
    }

    let line_size = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
    let payload_size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    let type_id = u32::from_le_bytes(header[8..12].try_into().unwrap());

    let Some(kind) = MessageKind::from_type_id(type_id) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown type_id {type_id}"),
        ));
    };

    if line_size < HEADER_LEN + payload_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "line_size smaller than header plus payload_size",
        ));
    }

    let mut payload = vec![0u8; payload_size];
    stream.read_exact(&mut payload)?;

    let extra_len = line_size - HEADER_LEN - payload_size;
    let mut extra = vec![0u8; extra_len];
    stream.read_exact(&mut extra)?;

    Ok(Some((kind, payload, extra)))
}

/// Like `read_exact`, but returns `Ok(false)` instead of erroring if the
/// stream is closed before any byte of `buf` is read.
fn read_exact_or_eof(stream: &mut UnixStream, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn frame_to_message(kind: MessageKind, payload: &[u8], extra: &[u8], endpoint: &Endpoint) -> Option<Message> {
    match kind {
        MessageKind::RebootReq => Some(Message::RebootReq),
        MessageKind::ShutdownReq => Some(Message::ShutdownReq),
        MessageKind::PowerupReq => Some(Message::PowerupReq),
        MessageKind::BaseBootDone => Some(Message::BaseBootDone),
        MessageKind::HwwdKickerRegister => Some(Message::HwwdKickerRegister { endpoint: endpoint.clone() }),
        MessageKind::HwwdKick => Some(Message::HwwdKick),
        MessageKind::SetLoglevel => {
            let level = *payload.first()?;
            Some(Message::SetLoglevel { level })
        }
        MessageKind::ProcesswdCreate => {
            let pid = i32::from_le_bytes(payload.get(0..4)?.try_into().ok()?);
            Some(Message::ProcesswdCreate { pid, endpoint: endpoint.clone() })
        }
        MessageKind::ProcesswdDelete => {
            let pid = i32::from_le_bytes(payload.get(0..4)?.try_into().ok()?);
            Some(Message::ProcesswdDelete { pid })
        }
        MessageKind::ProcesswdPong => {
            let pid = i32::from_le_bytes(payload.get(0..4)?.try_into().ok()?);
            Some(Message::ProcesswdPong { pid })
        }
        MessageKind::EnterMalf => {
            let reason = String::from_utf8_lossy(extra).into_owned();
            Some(Message::EnterMalf { reason })
        }
        MessageKind::ChangeRunlevel => {
            let runlevel = String::from_utf8_lossy(extra).into_owned();
            Some(Message::ChangeRunlevel { runlevel })
        }
        // Daemon-internal-only message kinds: never honored from a client.
        MessageKind::StateChangeInd
        | MessageKind::SetThermalStatus
        | MessageKind::DiskSpace
        | MessageKind::BatteryEmpty
        | MessageKind::ProcesswdPing
        | MessageKind::ProcessExited
        | MessageKind::WakeupTimer
        | MessageKind::Close => None,
    }
}

/// Write back a zero-payload acknowledgement frame for message kinds whose
/// protocol defines one (currently only the loglevel change).
fn ack(stream: &mut UnixStream, kind: MessageKind) {
    let mut frame = Vec::with_capacity(HEADER_LEN);
    frame.extend_from_slice(&(HEADER_LEN as u32).to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.extend_from_slice(&kind.type_id().to_le_bytes());
    if let Err(e) = stream.write_all(&frame) {
        debug!(error = %e, "failed to write ack frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(line_size: u32, payload_size: u32, type_id: u32) -> Vec<u8> {
        let mut h = Vec::with_capacity(HEADER_LEN);
        h.extend_from_slice(&line_size.to_le_bytes());
        h.extend_from_slice(&payload_size.to_le_bytes());
        h.extend_from_slice(&type_id.to_le_bytes());
        h
    }

    #[test]
    fn reboot_frame_has_no_payload() {
        let endpoint = Endpoint::broadcast();
        let msg = frame_to_message(MessageKind::RebootReq, &[], &[], &endpoint).unwrap();
        assert_eq!(msg, Message::RebootReq);
    }

    #[test]
    fn loglevel_frame_decodes_byte_payload() {
        let endpoint = Endpoint::broadcast();
        let msg = frame_to_message(MessageKind::SetLoglevel, &[5u8], &[], &endpoint).unwrap();
        assert_eq!(msg, Message::SetLoglevel { level: 5 });
    }

    #[test]
    fn processwd_create_decodes_pid_and_copies_endpoint() {
        let endpoint = Endpoint::broadcast();
        let payload = 4242i32.to_le_bytes();
        let msg = frame_to_message(MessageKind::ProcesswdCreate, &payload, &[], &endpoint).unwrap();
        match msg {
            Message::ProcesswdCreate { pid, endpoint: ep } => {
                assert_eq!(pid, 4242);
                assert_eq!(ep, endpoint);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn enter_malf_decodes_reason_from_extra_bytes() {
        let endpoint = Endpoint::broadcast();
        let msg = frame_to_message(MessageKind::EnterMalf, &[], b"disk failure", &endpoint).unwrap();
        assert_eq!(msg, Message::EnterMalf { reason: "disk failure".into() });
    }

    #[test]
    fn daemon_internal_kinds_are_never_accepted_from_a_client() {
        let endpoint = Endpoint::broadcast();
        assert!(frame_to_message(MessageKind::StateChangeInd, &[], &[], &endpoint).is_none());
        assert!(frame_to_message(MessageKind::DiskSpace, &[], &[], &endpoint).is_none());
        assert!(frame_to_message(MessageKind::Close, &[], &[], &endpoint).is_none());
    }

    #[test]
    fn header_round_trip_fields() {
        let h = header(20, 4, MessageKind::SetLoglevel.type_id());
        let line_size = u32::from_le_bytes(h[0..4].try_into().unwrap());
        let payload_size = u32::from_le_bytes(h[4..8].try_into().unwrap());
        let type_id = u32::from_le_bytes(h[8..12].try_into().unwrap());
        assert_eq!(line_size, 20);
        assert_eq!(payload_size, 4);
        assert_eq!(MessageKind::from_type_id(type_id), Some(MessageKind::SetLoglevel));
    }
}
