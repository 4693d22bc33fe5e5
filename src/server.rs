//! Unix domain socket server exposing managers to local clients.
//!
//! Requests are newline-delimited JSON objects:
//!
//! ```text
//! {"id": 1, "method": "outputs.getState"}
//! {"id": 2, "method": "outputs.subscribe"}
//! {"id": 3, "method": "outputs.unsubscribe", "params": {"subscription": 2}}
//! ```
//!
//! Every reply carries the request's `id` plus either `result` or `error`.
//! A subscription replies once with the current state and then once per
//! broadcast, all under the subscribing request's `id`. Closing the socket
//! unsubscribes everything the client registered.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actor::Worker;
use crate::constants::MAX_SOCKET_PATH;
use crate::manager::Manager;
use crate::store::Snapshot;
use crate::stream::{stream_subscription, write_json_line};

/// A subscription already registered with its store, waiting for a sink.
///
/// Calling it streams the current state and every broadcast into the sink
/// until the subscription is closed or the sink fails.
pub type StateStream = Box<dyn FnOnce(&mut dyn FnMut(Value) -> io::Result<()>) -> io::Result<()> + Send>;

/// A manager as seen by the socket server.
pub trait Service: Send + Sync {
    /// Current state as JSON.
    fn snapshot(&self) -> serde_json::Result<Value>;

    /// Register subscriber `id` and return its stream.
    fn subscribe(&self, id: &str) -> StateStream;

    /// Drop the subscription `id`.
    fn unsubscribe(&self, id: &str);
}

impl<S: Worker, T: Snapshot + Serialize> Service for Manager<S, T> {
    fn snapshot(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self.get_state())
    }

    fn subscribe(&self, id: &str) -> StateStream {
        let store = self.store().clone();
        let subscription = store.subscribe(id);
        Box::new(move |emit: &mut dyn FnMut(Value) -> io::Result<()>| {
            stream_subscription(&store, subscription, |state| emit(serde_json::to_value(state)?))
        })
    }

    fn unsubscribe(&self, id: &str) {
        Manager::unsubscribe(self, id);
    }
}

/// Services keyed by the prefix used in method names.
pub type Services = HashMap<String, Arc<dyn Service>>;

type Clients = Arc<Mutex<HashMap<String, UnixStream>>>;

/// Listening socket plus its accept thread.
#[derive(Debug)]
pub struct SocketServer {
    socket_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    clients: Clients,
    accept_handle: Option<JoinHandle<()>>,
}

impl SocketServer {
    /// Bind `socket_path` and start accepting clients.
    ///
    /// Removes a stale socket file, creates the parent directory and
    /// restricts the socket to its owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is too long or the socket cannot be bound.
    pub fn start(socket_path: PathBuf, services: Services) -> Result<Self> {
        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            anyhow::bail!(
                "Socket path too long ({path_len} bytes, max {}): {}",
                MAX_SOCKET_PATH - 1,
                socket_path.display()
            );
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("Failed to remove stale socket: {}", socket_path.display()))?;
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&socket_path, perms)?;
        }

        log::info!("Socket server listening on {}", socket_path.display());

        let shutdown = Arc::new(AtomicBool::new(false));
        let clients: Clients = Arc::default();
        let accept_handle = {
            let shutdown = Arc::clone(&shutdown);
            let clients = Arc::clone(&clients);
            let services = Arc::new(services);
            let path = socket_path.clone();
            thread::Builder::new()
                .name("socket-accept".into())
                .spawn(move || accept_loop(&listener, &services, &clients, &shutdown, &path))?
        };

        Ok(Self {
            socket_path,
            shutdown,
            clients,
            accept_handle: Some(accept_handle),
        })
    }

    /// Path to the socket file.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting, disconnect clients and remove the socket file.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.accept_handle.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = UnixStream::connect(&self.socket_path);
        if handle.join().is_err() {
            log::error!("[Socket] Accept thread panicked");
        }

        let clients = std::mem::take(&mut *self.clients.lock().unwrap_or_else(PoisonError::into_inner));
        for stream in clients.values() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("[Socket] Failed to remove {}: {e}", self.socket_path.display());
            }
        }
        log::info!("[Socket] Server stopped");
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: &UnixListener,
    services: &Arc<Services>,
    clients: &Clients,
    shutdown: &AtomicBool,
    socket_path: &Path,
) {
    for incoming in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match incoming {
            Ok(stream) => {
                let client_id = generate_client_id();
                log::info!("[Socket] Client connected: {client_id}");
                if let Err(e) = spawn_client(client_id, stream, services, clients) {
                    log::error!("[Socket] Failed to start client thread: {e}");
                }
            }
            Err(e) => {
                if !socket_path.exists() {
                    log::info!("[Socket] Socket file removed, stopping accept loop");
                    break;
                }
                log::error!("[Socket] Accept error: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn spawn_client(
    client_id: String,
    stream: UnixStream,
    services: &Arc<Services>,
    clients: &Clients,
) -> io::Result<()> {
    let writer = Arc::new(Mutex::new(stream.try_clone()?));
    clients
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(client_id.clone(), stream.try_clone()?);

    let mut session = ClientSession {
        client_id,
        writer,
        services: Arc::clone(services),
        subscriptions: HashMap::new(),
    };
    let clients = Arc::clone(clients);
    thread::Builder::new()
        .name(format!("client-{}", session.client_id))
        .spawn(move || {
            session.read_loop(stream);
            clients
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&session.client_id);
        })?;
    Ok(())
}

/// Generate a unique client ID from a monotonic counter.
fn generate_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("socket:{seq:x}")
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

struct ClientSession {
    client_id: String,
    writer: Arc<Mutex<UnixStream>>,
    services: Arc<Services>,
    /// Subscriber id to the service it was registered with.
    subscriptions: HashMap<String, Arc<dyn Service>>,
}

impl ClientSession {
    fn read_loop(&mut self, stream: UnixStream) {
        for line in BufReader::new(stream).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::debug!("[Socket] Read error for {}: {e}", self.client_id);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let reply = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.handle(request),
                Err(e) => Some(json!({ "id": Value::Null, "error": format!("invalid request: {e}") })),
            };
            if let Some(reply) = reply {
                if let Err(e) = send(&self.writer, &reply) {
                    log::debug!("[Socket] Write error for {}: {e}", self.client_id);
                    break;
                }
            }
        }

        for (id, service) in self.subscriptions.drain() {
            service.unsubscribe(&id);
        }
        log::info!("[Socket] Client disconnected: {}", self.client_id);
    }

    fn handle(&mut self, request: Request) -> Option<Value> {
        let Some((name, op)) = request.method.split_once('.') else {
            return Some(error_reply(&request.id, format!("invalid method: {}", request.method)));
        };
        let Some(service) = self.services.get(name).cloned() else {
            return Some(error_reply(&request.id, format!("unknown service: {name}")));
        };

        match op {
            "getState" => Some(match service.snapshot() {
                Ok(state) => json!({ "id": request.id, "result": state }),
                Err(e) => error_reply(&request.id, e.to_string()),
            }),
            "subscribe" => {
                let subscriber_id = self.subscriber_id(&request.id);
                let stream = service.subscribe(&subscriber_id);
                match self.spawn_stream(&subscriber_id, request.id.clone(), stream) {
                    Ok(()) => {
                        self.subscriptions.insert(subscriber_id, service);
                        None
                    }
                    Err(e) => {
                        service.unsubscribe(&subscriber_id);
                        Some(error_reply(&request.id, e.to_string()))
                    }
                }
            }
            "unsubscribe" => {
                let target = request.params.get("subscription");
                let ids: Vec<String> = match target {
                    Some(sub) => vec![self.subscriber_id(sub)],
                    None => self
                        .subscriptions
                        .iter()
                        .filter(|(_, s)| Arc::ptr_eq(s, &service))
                        .map(|(id, _)| id.clone())
                        .collect(),
                };
                for id in ids {
                    // Unsubscribe where the subscription was made.
                    if let Some(owner) = self.subscriptions.remove(&id) {
                        owner.unsubscribe(&id);
                    }
                }
                Some(json!({ "id": request.id, "result": true }))
            }
            _ => Some(error_reply(&request.id, format!("unknown method: {}", request.method))),
        }
    }

    fn subscriber_id(&self, request_id: &Value) -> String {
        format!("{}:{request_id}", self.client_id)
    }

    fn spawn_stream(&self, subscriber_id: &str, request_id: Value, stream: StateStream) -> io::Result<()> {
        let writer = Arc::clone(&self.writer);
        let id = subscriber_id.to_owned();
        thread::Builder::new()
            .name(format!("stream-{id}"))
            .spawn(move || {
                let result = stream(&mut |state: Value| send(&writer, &json!({ "id": request_id, "result": state })));
                if let Err(e) = result {
                    log::debug!("[Socket] Stream {id} ended: {e}");
                }
            })?;
        Ok(())
    }
}

fn error_reply(id: &Value, message: String) -> Value {
    json!({ "id": id, "error": message })
}

fn send(writer: &Mutex<UnixStream>, value: &Value) -> io::Result<()> {
    let mut stream = writer.lock().unwrap_or_else(PoisonError::into_inner);
    write_json_line(&mut *stream, value)
}

/// Line-oriented client for [`SocketServer`].
#[derive(Debug)]
pub struct SocketClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    next_id: u64,
}

impl SocketClient {
    /// Connect to the server at `socket_path`.
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let writer = UnixStream::connect(socket_path)
            .with_context(|| format!("Failed to connect to {}", socket_path.display()))?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Self {
            writer,
            reader,
            next_id: 1,
        })
    }

    /// Send a request and return its id.
    pub fn send(&mut self, method: &str, params: Option<Value>) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let mut request = json!({ "id": id, "method": method });
        if let Some(params) = params {
            request["params"] = params;
        }
        write_json_line(&mut self.writer, &request)?;
        Ok(id)
    }

    /// Next reply, or `None` once the server closes the connection.
    pub fn recv(&mut self) -> Result<Option<Value>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&line).context("Malformed reply")?))
    }

    /// Bound how long [`recv`](Self::recv) blocks.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.writer.set_read_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_unique() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert!(a.starts_with("socket:"));
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_overlong_socket_path() {
        let path = PathBuf::from(format!("/tmp/{}", "x".repeat(MAX_SOCKET_PATH)));
        let err = SocketServer::start(path, Services::new()).unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn unknown_service_is_an_error_reply() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("t.sock");
        let server = SocketServer::start(path.clone(), Services::new()).unwrap();

        let mut client = SocketClient::connect(&path).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let id = client.send("audio.getState", None).unwrap();
        let reply = client.recv().unwrap().unwrap();
        assert_eq!(reply["id"], id);
        assert!(reply["error"].as_str().unwrap().contains("unknown service"));

        server.shutdown();
        assert!(!path.exists());
    }
}
