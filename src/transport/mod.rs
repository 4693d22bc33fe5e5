//! Compositor connection.
//!
//! [`Connection`] owns the Unix socket and the [`ObjectRegistry`]. It is
//! not thread-safe by construction: once a manager starts, the connection
//! is moved into the actor's worker state and every read, write and
//! dispatch happens on that one thread.
//!
//! # Reading
//!
//! Messages are read header first, then body, with `recvmsg` so that any
//! SCM_RIGHTS descriptors arriving with those bytes end up in
//! [`Message::fds`]. A short read at EOF is [`TransportError::Closed`].
//!
//! # Dispatch loop
//!
//! ```text
//! dispatch() ── read_message() ── registry.lookup(sender)
//!                                      │
//!                 ┌────────────────────┼──────────────────────┐
//!             not found             zombie                 active
//!          SenderNotFound       dropped (Ok)        handler.dispatch(conn, msg)
//! ```
//!
//! Rust guideline compliant 2026-02

pub mod ancillary;

use std::ffi::OsString;
use std::io::Write;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{DispatchError, Error, TransportError};
use crate::protocol::display::DisplayHandler;
use crate::registry::{Liveness, ObjectRegistry, DISPLAY_ID};
use crate::wire::{self, Arg, Header, Message, HEADER_SIZE};

/// Display name used when neither an address nor `WAYLAND_DISPLAY` is set.
pub const DEFAULT_DISPLAY: &str = "wayland-0";

/// Resolve the socket path from an explicit address and the environment.
///
/// An absolute `address` (or absolute `WAYLAND_DISPLAY`) is used as is.
/// Otherwise the display name is joined onto `XDG_RUNTIME_DIR`.
pub fn resolve_socket_path(address: Option<&str>) -> Result<PathBuf, TransportError> {
    socket_path_from(
        address,
        std::env::var_os("XDG_RUNTIME_DIR"),
        std::env::var_os("WAYLAND_DISPLAY"),
    )
}

fn socket_path_from(
    address: Option<&str>,
    runtime_dir: Option<OsString>,
    display: Option<OsString>,
) -> Result<PathBuf, TransportError> {
    let name = match address.filter(|a| !a.is_empty()) {
        Some(address) => PathBuf::from(address),
        None => display
            .filter(|d| !d.is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_DISPLAY), PathBuf::from),
    };
    if name.is_absolute() {
        return Ok(name);
    }
    let runtime_dir = runtime_dir
        .filter(|d| !d.is_empty())
        .ok_or(TransportError::NoRuntimeDir)?;
    Ok(PathBuf::from(runtime_dir).join(name))
}

/// A live connection to the compositor.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    registry: Arc<ObjectRegistry>,
}

impl Connection {
    /// Connect to the compositor socket.
    ///
    /// `address` is a display name or absolute socket path; `None` uses
    /// `WAYLAND_DISPLAY`, then `wayland-0`.
    pub fn connect(address: Option<&str>) -> Result<Self, TransportError> {
        let path = resolve_socket_path(address)?;
        let stream = UnixStream::connect(&path)
            .map_err(|source| TransportError::Connect { path: path.clone(), source })?;
        log::info!("[Transport] connected to {}", path.display());
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected socket and register `wl_display`.
    pub fn from_stream(stream: UnixStream) -> Self {
        let registry = Arc::new(ObjectRegistry::new());
        let display = registry.register("wl_display", Arc::new(DisplayHandler));
        debug_assert_eq!(display, DISPLAY_ID);
        Self { stream, registry }
    }

    /// The object registry.
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    // ─── Writing ───────────────────────────────────────────────────────────

    /// Encode and send a request.
    pub fn send(&self, object_id: u32, opcode: u16, args: &[Arg<'_>]) -> Result<(), TransportError> {
        let bytes = wire::encode(object_id, opcode, args)?;
        self.write_message(&bytes, None)
    }

    /// Encode and send a request carrying one descriptor.
    pub fn send_with_fd(
        &self,
        object_id: u32,
        opcode: u16,
        args: &[Arg<'_>],
        fd: BorrowedFd<'_>,
    ) -> Result<(), TransportError> {
        let bytes = wire::encode(object_id, opcode, args)?;
        self.write_message(&bytes, Some(fd))
    }

    /// Write one encoded message.
    ///
    /// Bytes and descriptor go out in a single `sendmsg`; a short write is
    /// finished with plain writes (the descriptor has been delivered by then).
    pub fn write_message(&self, bytes: &[u8], fd: Option<BorrowedFd<'_>>) -> Result<(), TransportError> {
        let fds: Vec<_> = fd.iter().map(AsRawFd::as_raw_fd).collect();
        let sent = ancillary::send_with_fds(&self.stream, bytes, &fds)?;
        if sent < bytes.len() {
            (&self.stream).write_all(&bytes[sent..])?;
        }
        Ok(())
    }

    // ─── Reading ───────────────────────────────────────────────────────────

    fn read_exact(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = ancillary::recv_with_fds(&self.stream, &mut buf[filled..], fds)?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Block until one complete message has been read.
    pub fn read_message(&mut self) -> Result<Message, TransportError> {
        let mut fds = Vec::new();
        let mut head = [0u8; HEADER_SIZE];
        self.read_exact(&mut head, &mut fds)?;
        let header = Header::decode(&head)?;

        let mut payload = vec![0u8; header.payload_len()];
        self.read_exact(&mut payload, &mut fds)?;

        Ok(Message {
            object_id: header.object_id,
            opcode: header.opcode,
            payload,
            fds,
        })
    }

    /// Wait until the socket is readable.
    ///
    /// `None` waits forever. Returns `false` on timeout.
    pub fn poll_readable(&self, timeout: Option<Duration>) -> Result<bool, TransportError> {
        // Round up so a sub-millisecond remainder still waits.
        let timeout_ms = timeout.map_or(-1, |t| {
            i32::try_from(t.as_nanos().div_ceil(1_000_000)).unwrap_or(i32::MAX)
        });
        let mut pfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: pfd is a valid pollfd for the duration of the call.
            let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if n >= 0 {
                return Ok(n > 0);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }

    // ─── Dispatch ──────────────────────────────────────────────────────────

    /// Read one message and route it to its handler.
    pub fn dispatch(&mut self) -> Result<(), DispatchError> {
        let msg = self.read_message()?;
        self.route(msg)
    }

    fn route(&mut self, msg: Message) -> Result<(), DispatchError> {
        let handle = self
            .registry
            .lookup(msg.object_id)
            .ok_or(DispatchError::SenderNotFound(msg.object_id))?;

        if handle.liveness() == Liveness::Zombie {
            log::trace!(
                "[Transport] dropping event {} for zombie {}@{}",
                msg.opcode,
                handle.interface(),
                handle.id()
            );
            return Ok(());
        }

        let handler = handle.handler().cloned().ok_or(DispatchError::SenderUnsupported {
            object_id: handle.id(),
            interface: handle.interface(),
        })?;
        handler.dispatch(self, msg)
    }

    /// Dispatch every message that is readable without blocking.
    ///
    /// Returns the number of messages dispatched.
    pub fn dispatch_pending(&mut self) -> Result<usize, DispatchError> {
        let mut count = 0;
        while self.poll_readable(Some(Duration::ZERO))? {
            self.dispatch()?;
            count += 1;
        }
        Ok(count)
    }

    /// Dispatch until `done` returns true or `timeout` elapses.
    ///
    /// `done` is checked before every read. Exceeding the deadline is
    /// [`Error::Timeout`], distinct from any dispatch failure.
    pub fn dispatch_until(&mut self, timeout: Duration, mut done: impl FnMut() -> bool) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(timeout));
            }
            if self.poll_readable(Some(remaining))? {
                self.dispatch()?;
            }
        }
    }

    // ─── Object lifetime ───────────────────────────────────────────────────

    /// Send a destructor request and mark the object as a zombie.
    ///
    /// The id stays reserved until the compositor's `delete_id`.
    pub fn destroy(&self, object_id: u32, opcode: u16) -> Result<(), TransportError> {
        self.send(object_id, opcode, &[])?;
        self.registry.mark_zombie(object_id);
        Ok(())
    }
}
