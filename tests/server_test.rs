//! Socket server streaming contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use wlbroker::server::{Service, SocketClient, SocketServer};
use wlbroker::store::StoreSettings;
use wlbroker::{Manager, ManagerSettings, Snapshot, StateStore, Worker};

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Brightness {
    percent: u32,
}

impl Snapshot for Brightness {
    fn differs_from(&self, previous: &Self) -> bool {
        self != previous
    }
}

struct Backlight;

impl Worker for Backlight {}

type BacklightManager = Manager<Backlight, Brightness>;

fn backlight(name: &str, percent: u32) -> Arc<BacklightManager> {
    let settings = ManagerSettings {
        debounce: Duration::from_millis(5),
        ..ManagerSettings::default()
    };
    let store = StateStore::new(
        name,
        Brightness { percent },
        StoreSettings {
            subscriber_capacity: 8,
            min_gap: settings.debounce,
        },
    )
    .unwrap();
    Arc::new(Manager::start(name, Backlight, store, &settings).unwrap())
}

fn serve(managers: &[&Arc<BacklightManager>]) -> (tempfile::TempDir, SocketServer) {
    let services = managers
        .iter()
        .map(|manager| {
            let service: Arc<dyn Service> = (*manager).clone();
            (manager.name().to_string(), service)
        })
        .collect::<HashMap<_, _>>();
    let tmp = tempfile::TempDir::new().unwrap();
    let server = SocketServer::start(tmp.path().join("broker.sock"), services).unwrap();
    (tmp, server)
}

fn start() -> (tempfile::TempDir, Arc<BacklightManager>, SocketServer) {
    let manager = backlight("backlight", 40);
    let (tmp, server) = serve(&[&manager]);
    (tmp, manager, server)
}

fn client(server: &SocketServer) -> SocketClient {
    let client = SocketClient::connect(server.socket_path()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let started = Instant::now();
    while !cond() {
        assert!(started.elapsed() < Duration::from_secs(2), "condition not reached");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_get_state_returns_snapshot() {
    let (_tmp, _manager, server) = start();
    let mut client = client(&server);

    let id = client.send("backlight.getState", None).unwrap();
    let reply = client.recv().unwrap().unwrap();
    assert_eq!(reply, json!({ "id": id, "result": { "percent": 40 } }));
}

#[test]
fn test_subscribe_streams_current_then_changes() {
    let (_tmp, manager, server) = start();
    let mut client = client(&server);

    let id = client.send("backlight.subscribe", None).unwrap();
    let first = client.recv().unwrap().unwrap();
    assert_eq!(first, json!({ "id": id, "result": { "percent": 40 } }));

    manager.store().set_state(Brightness { percent: 75 });
    manager.store().mark_dirty();

    // The first broadcast after start may repeat the current state.
    loop {
        let reply = client.recv().unwrap().unwrap();
        assert_eq!(reply["id"], id);
        if reply["result"]["percent"] == 75 {
            break;
        }
    }
}

#[test]
fn test_unsubscribe_stops_stream() {
    let (_tmp, manager, server) = start();
    let mut client = client(&server);

    let sub = client.send("backlight.subscribe", None).unwrap();
    client.recv().unwrap().unwrap();
    assert_eq!(manager.store().subscriber_count(), 1);

    let id = client
        .send("backlight.unsubscribe", Some(json!({ "subscription": sub })))
        .unwrap();
    let reply = client.recv().unwrap().unwrap();
    assert_eq!(reply, json!({ "id": id, "result": true }));
    wait_until(|| manager.store().subscriber_count() == 0);
}

#[test]
fn test_unsubscribe_reaches_the_subscribed_service() {
    let screen = backlight("screen", 40);
    let keyboard = backlight("keyboard", 10);
    let (_tmp, server) = serve(&[&screen, &keyboard]);
    let mut client = client(&server);

    let sub = client.send("screen.subscribe", None).unwrap();
    client.recv().unwrap().unwrap();
    assert_eq!(screen.store().subscriber_count(), 1);

    // Named on the wrong service, the subscription is still released.
    client
        .send("keyboard.unsubscribe", Some(json!({ "subscription": sub })))
        .unwrap();
    let reply = client.recv().unwrap().unwrap();
    assert_eq!(reply["result"], true);
    wait_until(|| screen.store().subscriber_count() == 0);
    assert_eq!(keyboard.store().subscriber_count(), 0);
}

#[test]
fn test_disconnect_drops_subscriptions() {
    let (_tmp, manager, server) = start();
    let mut client = client(&server);

    client.send("backlight.subscribe", None).unwrap();
    client.send("backlight.subscribe", None).unwrap();
    client.recv().unwrap().unwrap();
    client.recv().unwrap().unwrap();
    assert_eq!(manager.store().subscriber_count(), 2);

    drop(client);
    wait_until(|| manager.store().subscriber_count() == 0);
}

#[test]
fn test_unknown_method_is_rejected() {
    let (_tmp, _manager, server) = start();
    let mut client = client(&server);

    let id = client.send("backlight.setState", None).unwrap();
    let reply = client.recv().unwrap().unwrap();
    assert_eq!(reply["id"], id);
    assert!(reply["error"].as_str().unwrap().contains("unknown method"));
}
