//! Listening-socket hand-off from the coordinator.
//!
//! # Wire Format
//! ```text
//! worker connects to the coordinator's Unix socket
//! coordinator sends one message:
//!     u32 little-endian n | n bytes JSON {"master_fds":[...]}
//!     + one SCM_RIGHTS control message carrying the fds in the same order
//! coordinator closes the connection
//! ```
//!
//! # Design Decisions
//! - The exchange is blocking and runs on the governing thread while the
//!   network loop is suspended
//! - Waiting is sliced by a poll interval so a reload or shutdown arriving
//!   mid-handshake interrupts it instead of blocking forever
//! - Received descriptors are `OwnedFd` from the moment they leave the
//!   control message, so every error path closes them

use std::io::{self, IoSlice, IoSliceMut, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{
    connect, recvmsg, sendmsg, socket, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixAddr,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::schema::CoordinatorConfig;
use crate::lifecycle::control::LoopControl;
use crate::net::listener::{ListenerFd, MasterFd};
use crate::resilience::backoff::Backoff;

/// Upper bound on descriptors in one hand-off (Linux `SCM_MAX_FD`).
pub const MAX_HANDOFF_FDS: usize = 253;

const HEADER_LEN: usize = 4;
const MAX_PAYLOAD: usize = 64 * 1024;

/// Result of one hand-off attempt.
#[derive(Debug)]
pub enum Handoff {
    /// The coordinator's current set. May be empty.
    Received(Vec<ListenerFd>),
    /// A reload or shutdown was requested before the set arrived.
    Interrupted,
}

/// Error type for the hand-off exchange.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("failed to create coordination socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to connect to coordinator at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("coordinator I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed hand-off: {0}")]
    Protocol(String),
}

impl HandoffError {
    /// Startup-level failures the worker cannot continue from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandoffError::Socket(_))
    }
}

/// Source of listening sockets for a reload cycle.
pub trait FdSource: Send {
    fn receive(&mut self, control: &LoopControl) -> Result<Handoff, HandoffError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct HandoffHeader {
    master_fds: Vec<i32>,
}

/// Unix-socket client for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    path: PathBuf,
    retry_base: Duration,
    retry_max: Duration,
    poll_interval: Duration,
}

impl CoordinatorClient {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            path: PathBuf::from(&config.socket_path),
            retry_base: Duration::from_millis(config.retry_base_delay_ms),
            retry_max: Duration::from_millis(config.retry_max_delay_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self, control: &LoopControl) -> Result<Option<UnixStream>, HandoffError> {
        let addr = UnixAddr::new(self.path.as_path())
            .map_err(|e| HandoffError::Socket(io::Error::from(e)))?;
        let mut backoff = Backoff::new(self.retry_base, self.retry_max);

        loop {
            if control.handoff_interrupted() {
                return Ok(None);
            }

            let fd = socket(
                AddressFamily::Unix,
                SockType::Stream,
                SockFlag::SOCK_CLOEXEC,
                None,
            )
            .map_err(|e| HandoffError::Socket(io::Error::from(e)))?;

            match connect(fd.as_raw_fd(), &addr) {
                Ok(()) => return Ok(Some(UnixStream::from(fd))),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNREFUSED | Errno::ENOENT | Errno::EAGAIN) => {
                    let delay = backoff.next_delay();
                    tracing::debug!(
                        path = ?self.path,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Coordinator not ready, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    return Err(HandoffError::Connect {
                        path: self.path.clone(),
                        source: io::Error::from(e),
                    })
                }
            }
        }
    }
}

impl FdSource for CoordinatorClient {
    fn receive(&mut self, control: &LoopControl) -> Result<Handoff, HandoffError> {
        let Some(stream) = self.connect(control)? else {
            return Ok(Handoff::Interrupted);
        };
        stream.set_read_timeout(Some(self.poll_interval))?;
        read_handoff(&stream, control)
    }
}

/// Receive the listener set from the coordinator at `path` with default settings.
pub fn receive_listener_fds(path: &Path, control: &LoopControl) -> Result<Handoff, HandoffError> {
    let mut client = CoordinatorClient::new(&CoordinatorConfig {
        socket_path: path.to_string_lossy().into_owned(),
        ..CoordinatorConfig::default()
    });
    client.receive(control)
}

/// Read one hand-off message. The stream must have a read timeout set.
pub fn read_handoff(stream: &UnixStream, control: &LoopControl) -> Result<Handoff, HandoffError> {
    let mut data = Vec::with_capacity(256);
    let mut fds: Vec<OwnedFd> = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(total) = expected_len(&data)? {
            if data.len() >= total {
                break;
            }
        }

        match recv_chunk(stream, &mut chunk, &mut fds) {
            Ok(0) => {
                return Err(HandoffError::Protocol(format!(
                    "connection closed after {} bytes",
                    data.len()
                )))
            }
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                if control.handoff_interrupted() {
                    return Ok(Handoff::Interrupted);
                }
            }
            Err(e) => return Err(HandoffError::Io(e)),
        }
    }

    let header: HandoffHeader = serde_json::from_slice(&data[HEADER_LEN..])
        .map_err(|e| HandoffError::Protocol(e.to_string()))?;

    if header.master_fds.len() != fds.len() {
        return Err(HandoffError::Protocol(format!(
            "{} master fds announced but {} descriptors received",
            header.master_fds.len(),
            fds.len()
        )));
    }

    Ok(Handoff::Received(
        fds.into_iter()
            .zip(header.master_fds)
            .map(|(fd, master)| ListenerFd::new(fd, MasterFd::new(master)))
            .collect(),
    ))
}

fn expected_len(data: &[u8]) -> Result<Option<usize>, HandoffError> {
    let Some(prefix) = data.get(..HEADER_LEN) else {
        return Ok(None);
    };
    let mut len = [0u8; HEADER_LEN];
    len.copy_from_slice(prefix);
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_PAYLOAD {
        return Err(HandoffError::Protocol(format!("payload of {len} bytes too large")));
    }
    Ok(Some(HEADER_LEN + len))
}

fn recv_chunk(stream: &UnixStream, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_HANDOFF_FDS]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            // SAFETY: SCM_RIGHTS installs fresh descriptors owned by this process.
            fds.extend(received.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }

    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control data truncated",
        ));
    }

    Ok(msg.bytes)
}

/// Serve one hand-off message on an accepted coordinator connection.
pub fn send_listener_fds(
    stream: &UnixStream,
    listeners: &[(BorrowedFd<'_>, MasterFd)],
) -> Result<(), HandoffError> {
    if listeners.len() > MAX_HANDOFF_FDS {
        return Err(HandoffError::Protocol(format!(
            "{} listeners exceed the limit of {MAX_HANDOFF_FDS}",
            listeners.len()
        )));
    }

    let header = HandoffHeader {
        master_fds: listeners.iter().map(|(_, m)| m.get()).collect(),
    };
    let json = serde_json::to_vec(&header).map_err(|e| HandoffError::Protocol(e.to_string()))?;
    let mut payload = Vec::with_capacity(HEADER_LEN + json.len());
    payload.extend_from_slice(&(json.len() as u32).to_le_bytes());
    payload.extend_from_slice(&json);

    let raw: Vec<RawFd> = listeners.iter().map(|(fd, _)| fd.as_raw_fd()).collect();
    let rights = [ControlMessage::ScmRights(&raw)];
    let cmsgs: &[ControlMessage<'_>] = if raw.is_empty() { &[] } else { &rights };

    let sent = loop {
        match sendmsg::<()>(
            stream.as_raw_fd(),
            &[IoSlice::new(&payload)],
            cmsgs,
            MsgFlags::empty(),
            None,
        ) {
            Ok(n) => break n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(HandoffError::Io(io::Error::from(e))),
        }
    };

    // Control data rides with the first bytes only.
    if sent < payload.len() {
        let mut rest = stream;
        rest.write_all(&payload[sent..])?;
    }
    Ok(())
}
