//! Scripted compositor for integration tests.
//!
//! Serves the client end of a `UnixStream::pair` from a background thread:
//! answers `get_registry`, `sync` and `bind`, announces one output with two
//! modes when the output manager is bound, and replies to configurations
//! according to [`Script::reply`].

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::HashSet;
use std::io::Read;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use wlbroker::protocol::display::{display_event, display_request, registry_op, CALLBACK_DONE};
use wlbroker::protocol::output_management::{
    configuration_op, head_op, manager_op, mode_op, MANAGER_INTERFACE,
};
use wlbroker::wire::{self, Arg, ArgReader, Fixed, Header, HEADER_SIZE};
use wlbroker::Connection;

pub const HEAD_ID: u32 = 0xFF00_0000;
pub const MODE_FHD: u32 = 0xFF00_0001;
pub const MODE_HD: u32 = 0xFF00_0002;

/// How the fake answers configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    Failed,
    Cancelled,
    Silent,
    /// Answer with an event from an object the client never created.
    Stray,
}

/// Sender id used by [`Reply::Stray`].
pub const STRAY_ID: u32 = 0x4242;

#[derive(Debug, Clone, Copy)]
pub struct Script {
    pub advertise_manager: bool,
    pub manager_version: u32,
    pub reply: Reply,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            advertise_manager: true,
            manager_version: 4,
            reply: Reply::Succeeded,
        }
    }
}

/// One request the client sent.
#[derive(Debug, Clone)]
pub struct Request {
    pub object_id: u32,
    pub opcode: u16,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn args(&self) -> ArgReader<'_> {
        ArgReader::new(&self.payload)
    }
}

#[derive(Default)]
struct Seen {
    requests: Vec<Request>,
    manager_id: Option<u32>,
    configurations: HashSet<u32>,
}

pub struct FakeCompositor {
    writer: Arc<Mutex<UnixStream>>,
    seen: Arc<Mutex<Seen>>,
    handle: Option<JoinHandle<()>>,
}

impl FakeCompositor {
    pub fn spawn(script: Script) -> (Connection, Self) {
        let (client, server) = UnixStream::pair().unwrap();
        let writer = Arc::new(Mutex::new(server.try_clone().unwrap()));
        let seen = Arc::new(Mutex::new(Seen::default()));

        let handle = {
            let writer = Arc::clone(&writer);
            let seen = Arc::clone(&seen);
            thread::spawn(move || serve(server, &writer, &seen, script))
        };

        let fake = Self {
            writer,
            seen,
            handle: Some(handle),
        };
        (Connection::from_stream(client), fake)
    }

    /// Send an event to the client.
    pub fn send(&self, object_id: u32, opcode: u16, args: &[Arg<'_>]) {
        send(&self.writer, object_id, opcode, args);
    }

    pub fn manager_id(&self) -> u32 {
        self.seen.lock().unwrap().manager_id.expect("manager not bound")
    }

    pub fn requests(&self) -> Vec<Request> {
        self.seen.lock().unwrap().requests.clone()
    }

    /// Wait until a request matching `pred` has been seen.
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&Request) -> bool) -> Option<Request> {
        let deadline = Instant::now() + timeout;
        loop {
            // Snapshot first so `pred` may call back into `self` without deadlocking.
            let requests = self.requests();
            if let Some(found) = requests.iter().find(|r| pred(r)) {
                return Some(found.clone());
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Move the output and finish the batch with `serial`.
    pub fn move_output(&self, x: i32, y: i32, serial: u32) {
        self.send(HEAD_ID, head_op::POSITION, &[Arg::Int(x), Arg::Int(y)]);
        self.send(self.manager_id(), manager_op::DONE, &[Arg::Uint(serial)]);
    }

    /// Close the compositor end of the socket.
    pub fn disconnect(&self) {
        let _ = self.writer.lock().unwrap().shutdown(Shutdown::Both);
    }
}

impl Drop for FakeCompositor {
    fn drop(&mut self) {
        self.disconnect();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn send(writer: &Mutex<UnixStream>, object_id: u32, opcode: u16, args: &[Arg<'_>]) {
    use std::io::Write;
    let bytes = wire::encode(object_id, opcode, args).unwrap();
    // Ignore failures: the client may already be gone.
    let _ = writer.lock().unwrap().write_all(&bytes);
}

fn read_request(stream: &mut UnixStream) -> Option<Request> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).ok()?;
    let header = Header::decode(&header).ok()?;
    let mut payload = vec![0u8; header.payload_len()];
    stream.read_exact(&mut payload).ok()?;
    Some(Request {
        object_id: header.object_id,
        opcode: header.opcode,
        payload,
    })
}

fn serve(mut stream: UnixStream, writer: &Mutex<UnixStream>, seen: &Mutex<Seen>, script: Script) {
    let mut registry_id = None;

    while let Some(request) = read_request(&mut stream) {
        let (manager_id, is_configuration) = {
            let mut seen = seen.lock().unwrap();
            seen.requests.push(request.clone());
            (seen.manager_id, seen.configurations.contains(&request.object_id))
        };
        let mut args = request.args();

        match (request.object_id, request.opcode) {
            (1, display_request::SYNC) => {
                let callback = args.new_id().unwrap();
                send(writer, callback, CALLBACK_DONE, &[Arg::Uint(0)]);
                send(writer, 1, display_event::DELETE_ID, &[Arg::Uint(callback)]);
            }
            (1, display_request::GET_REGISTRY) => {
                let id = args.new_id().unwrap();
                registry_id = Some(id);
                send(
                    writer,
                    id,
                    registry_op::GLOBAL,
                    &[Arg::Uint(1), Arg::String(Some("wl_compositor")), Arg::Uint(6)],
                );
                if script.advertise_manager {
                    send(
                        writer,
                        id,
                        registry_op::GLOBAL,
                        &[
                            Arg::Uint(7),
                            Arg::String(Some(MANAGER_INTERFACE)),
                            Arg::Uint(script.manager_version),
                        ],
                    );
                }
            }
            (id, registry_op::BIND) if Some(id) == registry_id => {
                let _name = args.uint().unwrap();
                let interface = args.string().unwrap().to_owned();
                let version = args.uint().unwrap();
                let new_id = args.new_id().unwrap();
                if interface == MANAGER_INTERFACE {
                    seen.lock().unwrap().manager_id = Some(new_id);
                    announce_output(writer, new_id, version);
                }
            }
            (id, manager_op::CREATE_CONFIGURATION) if Some(id) == manager_id => {
                let config = args.new_id().unwrap();
                seen.lock().unwrap().configurations.insert(config);
            }
            (id, op) if is_configuration => match op {
                configuration_op::APPLY | configuration_op::TEST => {
                    let event = match script.reply {
                        Reply::Succeeded => Some(configuration_op::SUCCEEDED),
                        Reply::Failed => Some(configuration_op::FAILED),
                        Reply::Cancelled => Some(configuration_op::CANCELLED),
                        Reply::Silent => None,
                        Reply::Stray => {
                            send(writer, STRAY_ID, 0, &[]);
                            None
                        }
                    };
                    if let Some(event) = event {
                        send(writer, id, event, &[]);
                    }
                }
                configuration_op::DESTROY => {
                    seen.lock().unwrap().configurations.remove(&id);
                    send(writer, 1, display_event::DELETE_ID, &[Arg::Uint(id)]);
                }
                _ => {}
            },
            _ => {}
        }
    }
}

fn announce_output(writer: &Mutex<UnixStream>, manager: u32, version: u32) {
    send(writer, manager, manager_op::HEAD, &[Arg::NewId(HEAD_ID)]);
    send(writer, HEAD_ID, head_op::NAME, &[Arg::String(Some("DP-1"))]);
    send(writer, HEAD_ID, head_op::DESCRIPTION, &[Arg::String(Some("Dell U2720Q (DP-1)"))]);
    send(writer, HEAD_ID, head_op::PHYSICAL_SIZE, &[Arg::Int(600), Arg::Int(340)]);

    send(writer, HEAD_ID, head_op::MODE, &[Arg::NewId(MODE_FHD)]);
    send(writer, MODE_FHD, mode_op::SIZE, &[Arg::Int(1920), Arg::Int(1080)]);
    send(writer, MODE_FHD, mode_op::REFRESH, &[Arg::Int(60000)]);
    send(writer, MODE_FHD, mode_op::PREFERRED, &[]);

    send(writer, HEAD_ID, head_op::MODE, &[Arg::NewId(MODE_HD)]);
    send(writer, MODE_HD, mode_op::SIZE, &[Arg::Int(1280), Arg::Int(720)]);
    send(writer, MODE_HD, mode_op::REFRESH, &[Arg::Int(60000)]);

    send(writer, HEAD_ID, head_op::ENABLED, &[Arg::Int(1)]);
    send(writer, HEAD_ID, head_op::CURRENT_MODE, &[Arg::Object(MODE_FHD)]);
    send(writer, HEAD_ID, head_op::POSITION, &[Arg::Int(0), Arg::Int(0)]);
    send(writer, HEAD_ID, head_op::TRANSFORM, &[Arg::Int(0)]);
    send(writer, HEAD_ID, head_op::SCALE, &[Arg::Fixed(Fixed::from_f64(1.5))]);
    send(writer, HEAD_ID, head_op::MAKE, &[Arg::String(Some("Dell"))]);
    send(writer, HEAD_ID, head_op::MODEL, &[Arg::String(Some("U2720Q"))]);
    send(writer, HEAD_ID, head_op::SERIAL_NUMBER, &[Arg::String(Some("ABC123"))]);
    if version >= 4 {
        send(writer, HEAD_ID, head_op::ADAPTIVE_SYNC, &[Arg::Uint(0)]);
    }
    send(writer, manager, manager_op::DONE, &[Arg::Uint(1)]);
}
