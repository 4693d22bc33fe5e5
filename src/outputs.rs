//! Output manager: live mirror of the compositor's display configuration.
//!
//! Built from the core pieces: an [`OutputSession`] owns the
//! [`Connection`] inside a [`Manager`]'s actor, the protocol handlers publish
//! an [`OutputState`] on every `done`, and [`OutputManager::apply`] pushes a
//! configuration back through [`Manager::post`].
//!
//! # Lifecycle
//!
//! ```text
//! start() ── Connection::connect ── get_registry + roundtrip
//!              │
//!        bind zwlr_output_manager_v1 ── roundtrip (heads, modes, done)
//!              │
//!        Manager::start(OutputSession) ── idle: dispatch_pending()
//! ```
//!
//! Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::actor::Worker;
use crate::error::{Error, TransportError};
use crate::manager::{Manager, ManagerSettings};
use crate::protocol::display::Global;
use crate::protocol::output_management::{
    configuration_head_op, configuration_op, manager_op, ConfigurationHandler, ConfigurationOutcome,
    HeadState, ManagerHandler, ModeState, OutputMirror, SharedMirror, ADAPTIVE_SYNC_SINCE,
    CONFIGURATION_HEAD_INTERFACE, CONFIGURATION_INTERFACE, MANAGER_INTERFACE, MAX_VERSION,
};
use crate::store::{Snapshot, StateStore};
use crate::transport::Connection;
use crate::wire::{Arg, Fixed};

// ─── State ─────────────────────────────────────────────────────────────────

/// One mode of an output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMode {
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
    /// Refresh rate in mHz.
    pub refresh: i32,
    /// Preferred by the display.
    pub preferred: bool,
    /// Protocol object id.
    pub id: u32,
}

/// One output (head).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    /// Connector name, e.g. `DP-1`.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Manufacturer.
    pub make: String,
    /// Model.
    pub model: String,
    /// Serial number.
    pub serial_number: String,
    /// Physical width in millimetres.
    pub physical_width: i32,
    /// Physical height in millimetres.
    pub physical_height: i32,
    /// Whether the output is enabled.
    pub enabled: bool,
    /// Layout x position.
    pub x: i32,
    /// Layout y position.
    pub y: i32,
    /// `wl_output.transform` value.
    pub transform: i32,
    /// Scale factor.
    pub scale: f64,
    /// Active mode.
    pub current_mode: Option<OutputMode>,
    /// Every advertised mode.
    pub modes: Vec<OutputMode>,
    /// Adaptive sync state.
    pub adaptive_sync: u32,
    /// Whether the compositor reports adaptive sync.
    pub adaptive_sync_supported: bool,
    /// Protocol object id.
    pub id: u32,
}

/// Published state of the output manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputState {
    /// Outputs ordered by object id.
    pub outputs: Vec<Output>,
    /// Serial of the last `done`.
    pub serial: u32,
}

impl Snapshot for OutputState {
    // Description, make, model, serial number and physical size never
    // change for a live head and are left out of the comparison.
    fn differs_from(&self, previous: &Self) -> bool {
        if self.serial != previous.serial || self.outputs.len() != previous.outputs.len() {
            return true;
        }
        self.outputs.iter().zip(&previous.outputs).any(|(new, old)| {
            new.name != old.name
                || new.enabled != old.enabled
                || new.x != old.x
                || new.y != old.y
                || new.transform != old.transform
                || (new.scale - old.scale).abs() > f64::EPSILON
                || new.adaptive_sync != old.adaptive_sync
                || new.adaptive_sync_supported != old.adaptive_sync_supported
                || mode_differs(new.current_mode.as_ref(), old.current_mode.as_ref())
                || new.modes.len() != old.modes.len()
        })
    }
}

fn mode_differs(new: Option<&OutputMode>, old: Option<&OutputMode>) -> bool {
    match (new, old) {
        (None, None) => false,
        (Some(n), Some(o)) => n.width != o.width || n.height != o.height || n.refresh != o.refresh,
        _ => true,
    }
}

// ─── Configuration requests ────────────────────────────────────────────────

/// Requested mode. `refresh` of `None` picks the fastest matching mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeRequest {
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
    /// Refresh rate in mHz.
    #[serde(default)]
    pub refresh: Option<i32>,
}

/// Changes to one output. Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChange {
    /// Connector name of the output to change.
    pub name: String,
    /// Enable or disable.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Mode to switch to; custom if no advertised mode matches.
    #[serde(default)]
    pub mode: Option<ModeRequest>,
    /// New x position.
    #[serde(default)]
    pub x: Option<i32>,
    /// New y position.
    #[serde(default)]
    pub y: Option<i32>,
    /// New transform.
    #[serde(default)]
    pub transform: Option<i32>,
    /// New scale.
    #[serde(default)]
    pub scale: Option<f64>,
    /// Adaptive sync on or off.
    #[serde(default)]
    pub adaptive_sync: Option<bool>,
}

// ─── Session ───────────────────────────────────────────────────────────────

/// Worker state: the connection and the bound output manager.
#[derive(Debug)]
pub struct OutputSession {
    conn: Connection,
    mirror: SharedMirror,
    manager_id: u32,
    version: u32,
    ack_timeout: Duration,
    /// Set when a request broke the connection.
    fatal: Option<Error>,
}

impl Worker for OutputSession {
    fn idle(&mut self) -> Result<(), Error> {
        self.conn.dispatch_pending()?;
        if self.finished() {
            return Err(Error::Finished(MANAGER_INTERFACE));
        }
        Ok(())
    }

    fn take_fatal(&mut self) -> Option<Error> {
        if let Some(err) = self.fatal.take() {
            return Some(err);
        }
        self.finished().then_some(Error::Finished(MANAGER_INTERFACE))
    }
}

impl OutputSession {
    /// Discover and bind the output manager on `conn`, then wait for the
    /// initial output list.
    pub fn bind(mut conn: Connection, store: &StateStore<OutputState>, ack_timeout: Duration) -> Result<Self, Error> {
        let (registry_id, globals) = conn.get_registry()?;
        conn.roundtrip(ack_timeout)?;

        let global: Global = globals
            .find(MANAGER_INTERFACE)
            .ok_or(Error::MissingGlobal(MANAGER_INTERFACE))?;
        let version = global.version.min(MAX_VERSION);
        let mirror: SharedMirror = Arc::new(Mutex::new(OutputMirror::default()));
        let handler = ManagerHandler::new(Arc::clone(&mirror), store.clone(), version);
        let manager_id = conn.bind(registry_id, &global, MANAGER_INTERFACE, version, Arc::new(handler))?;

        let mut session = Self {
            conn,
            mirror,
            manager_id,
            version,
            ack_timeout,
            fatal: None,
        };
        session.wait_initialized()?;
        log::info!(
            "[Outputs] bound {MANAGER_INTERFACE} v{version}, {} outputs",
            store.get_state().outputs.len()
        );
        Ok(session)
    }

    fn wait_initialized(&mut self) -> Result<(), Error> {
        let mirror = Arc::clone(&self.mirror);
        self.conn.dispatch_until(self.ack_timeout, move || {
            mirror.lock().unwrap_or_else(PoisonError::into_inner).initialized
        })
    }

    fn finished(&self) -> bool {
        self.mirror.lock().unwrap_or_else(PoisonError::into_inner).finished
    }

    /// Apply `changes`, leaving outputs not mentioned as they are.
    ///
    /// Blocks until the compositor answers or the acknowledgement deadline
    /// passes. With `test_only` the configuration is validated but not
    /// applied. A connection failure is returned here and also recorded
    /// for [`Worker::take_fatal`], which stops the manager.
    pub fn apply(&mut self, changes: &[OutputChange], test_only: bool) -> Result<(), Error> {
        let result = self.send_configuration(changes, test_only);
        if let Err(err) = &result {
            if err.is_fatal() {
                self.fatal = Some(Error::ConnectionLost(err.to_string()));
            }
        }
        result
    }

    fn send_configuration(&mut self, changes: &[OutputChange], test_only: bool) -> Result<(), Error> {
        let (serial, heads) = {
            let mirror = self.mirror.lock().unwrap_or_else(PoisonError::into_inner);
            for change in changes {
                if !mirror.heads.values().any(|h| h.name == change.name) {
                    return Err(Error::Failed(format!("unknown output {}", change.name)));
                }
            }
            let heads: Vec<_> = mirror
                .heads
                .iter()
                .filter(|(_, head)| head.ready)
                .map(|(&id, head)| {
                    let change = changes.iter().find(|c| c.name == head.name);
                    let modes: Vec<_> = head
                        .modes
                        .iter()
                        .filter_map(|&m| mirror.modes.get(&m).map(|s| (m, *s)))
                        .collect();
                    (id, head.clone(), modes, change.cloned())
                })
                .collect();
            (mirror.serial, heads)
        };

        let handler = Arc::new(ConfigurationHandler::default());
        let dispatch = Arc::clone(&handler);
        let config_id = self.conn.registry().register(CONFIGURATION_INTERFACE, dispatch);
        self.conn.send(
            self.manager_id,
            manager_op::CREATE_CONFIGURATION,
            &[Arg::NewId(config_id), Arg::Uint(serial)],
        )?;

        for (head_id, head, modes, change) in &heads {
            let change = change.clone().unwrap_or_default();
            if !change.enabled.unwrap_or(head.enabled) {
                self.conn.send(config_id, configuration_op::DISABLE_HEAD, &[Arg::Object(*head_id)])?;
                continue;
            }
            let config_head = self.conn.registry().register_inert(CONFIGURATION_HEAD_INTERFACE);
            self.conn.send(
                config_id,
                configuration_op::ENABLE_HEAD,
                &[Arg::NewId(config_head), Arg::Object(*head_id)],
            )?;
            self.configure_head(config_head, head, modes, &change)?;
        }

        let request = if test_only { configuration_op::TEST } else { configuration_op::APPLY };
        self.conn.send(config_id, request, &[])?;

        let waiter = Arc::clone(&handler);
        let waited = self.conn.dispatch_until(self.ack_timeout, move || waiter.outcome().is_some());
        self.conn.destroy(config_id, configuration_op::DESTROY)?;
        waited?;

        match handler.outcome() {
            Some(ConfigurationOutcome::Succeeded) => {
                log::info!("[Outputs] configuration for serial {serial} applied");
                Ok(())
            }
            Some(ConfigurationOutcome::Cancelled) => Err(Error::Cancelled),
            Some(ConfigurationOutcome::Failed) | None => {
                Err(Error::Failed("compositor rejected the output configuration".into()))
            }
        }
    }

    fn configure_head(
        &self,
        config_head: u32,
        head: &HeadState,
        modes: &[(u32, ModeState)],
        change: &OutputChange,
    ) -> Result<(), TransportError> {
        match change.mode {
            Some(request) => {
                let matching = modes
                    .iter()
                    .filter(|(_, m)| m.width == request.width && m.height == request.height)
                    .filter(|(_, m)| request.refresh.is_none_or(|r| r == m.refresh))
                    .max_by_key(|(_, m)| m.refresh);
                match matching {
                    Some((mode_id, _)) => {
                        self.conn
                            .send(config_head, configuration_head_op::SET_MODE, &[Arg::Object(*mode_id)])?;
                    }
                    None => self.conn.send(
                        config_head,
                        configuration_head_op::SET_CUSTOM_MODE,
                        &[
                            Arg::Int(request.width),
                            Arg::Int(request.height),
                            Arg::Int(request.refresh.unwrap_or(0)),
                        ],
                    )?,
                }
            }
            None => {
                if let Some(current) = head.current_mode {
                    self.conn
                        .send(config_head, configuration_head_op::SET_MODE, &[Arg::Object(current)])?;
                }
            }
        }

        let x = change.x.unwrap_or(head.x);
        let y = change.y.unwrap_or(head.y);
        self.conn
            .send(config_head, configuration_head_op::SET_POSITION, &[Arg::Int(x), Arg::Int(y)])?;
        self.conn.send(
            config_head,
            configuration_head_op::SET_TRANSFORM,
            &[Arg::Int(change.transform.unwrap_or(head.transform))],
        )?;
        let scale = change.scale.unwrap_or(head.scale);
        if scale > 0.0 {
            self.conn.send(
                config_head,
                configuration_head_op::SET_SCALE,
                &[Arg::Fixed(Fixed::from_f64(scale))],
            )?;
        }
        if let Some(adaptive) = change.adaptive_sync {
            if self.version >= ADAPTIVE_SYNC_SINCE {
                self.conn.send(
                    config_head,
                    configuration_head_op::SET_ADAPTIVE_SYNC,
                    &[Arg::Uint(u32::from(adaptive))],
                )?;
            }
        }
        Ok(())
    }
}

impl Drop for OutputSession {
    fn drop(&mut self) {
        // After `finished` the manager object is gone.
        if self.finished() {
            return;
        }
        if let Err(e) = self.conn.send(self.manager_id, manager_op::STOP, &[]) {
            log::debug!("[Outputs] stop request not sent: {e}");
        }
    }
}

// ─── Manager ───────────────────────────────────────────────────────────────

/// The running output manager.
pub type OutputManager = Manager<OutputSession, OutputState>;

/// Connect to the compositor and start the output manager.
///
/// `address` is a display name or socket path; `None` uses the environment.
pub fn start(address: Option<&str>, settings: &ManagerSettings) -> Result<OutputManager, Error> {
    let conn = Connection::connect(address)?;
    start_with_connection(conn, settings)
}

/// Start the output manager on an existing connection.
pub fn start_with_connection(conn: Connection, settings: &ManagerSettings) -> Result<OutputManager, Error> {
    let store = StateStore::new("outputs", OutputState::default(), settings.store_settings())?;
    let session = OutputSession::bind(conn, &store, settings.ack_timeout)?;
    Ok(Manager::start("outputs", session, store, settings)?)
}

impl Manager<OutputSession, OutputState> {
    /// Apply `changes` on the worker; see [`OutputSession::apply`].
    pub fn apply(&self, changes: Vec<OutputChange>, test_only: bool) -> Result<(), Error> {
        self.post(move |session| session.apply(&changes, test_only))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(width: i32, height: i32, refresh: i32) -> OutputMode {
        OutputMode {
            width,
            height,
            refresh,
            preferred: false,
            id: 0,
        }
    }

    fn output(name: &str) -> Output {
        Output {
            name: name.into(),
            description: "Dell U2720Q".into(),
            make: "Dell".into(),
            model: "U2720Q".into(),
            serial_number: "ABC".into(),
            physical_width: 600,
            physical_height: 340,
            enabled: true,
            x: 0,
            y: 0,
            transform: 0,
            scale: 1.0,
            current_mode: Some(mode(3840, 2160, 60_000)),
            modes: vec![mode(3840, 2160, 60_000), mode(1920, 1080, 60_000)],
            adaptive_sync: 0,
            adaptive_sync_supported: false,
            id: 0xFF00_0000,
        }
    }

    fn state(outputs: Vec<Output>) -> OutputState {
        OutputState { outputs, serial: 1 }
    }

    #[test]
    fn identical_states_do_not_differ() {
        let a = state(vec![output("DP-1")]);
        assert!(!a.differs_from(&a.clone()));
    }

    #[test]
    fn presentation_fields_are_ignored() {
        let a = state(vec![output("DP-1")]);
        let mut b = a.clone();
        b.outputs[0].description = "Other".into();
        b.outputs[0].make = "Other".into();
        b.outputs[0].model = "Other".into();
        assert!(!b.differs_from(&a));
    }

    #[test]
    fn relevant_fields_differ() {
        let base = state(vec![output("DP-1")]);
        let cases: [fn(&mut OutputState); 12] = [
            |s| s.serial = 2,
            |s| s.outputs.push(output("HDMI-A-1")),
            |s| s.outputs[0].name = "DP-2".into(),
            |s| s.outputs[0].enabled = false,
            |s| s.outputs[0].x = 1920,
            |s| s.outputs[0].transform = 1,
            |s| s.outputs[0].scale = 1.5,
            |s| s.outputs[0].adaptive_sync = 1,
            |s| s.outputs[0].adaptive_sync_supported = true,
            |s| s.outputs[0].current_mode = None,
            |s| s.outputs[0].current_mode = Some(mode(1920, 1080, 60_000)),
            |s| {
                s.outputs[0].modes.pop();
            },
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut changed = base.clone();
            mutate(&mut changed);
            assert!(changed.differs_from(&base), "case {i} should differ");
        }
    }

    #[test]
    fn state_serializes_camel_case() {
        let json = serde_json::to_value(state(vec![output("DP-1")])).unwrap();
        let out = &json["outputs"][0];
        assert_eq!(out["serialNumber"], "ABC");
        assert_eq!(out["adaptiveSyncSupported"], false);
        assert_eq!(out["currentMode"]["refresh"], 60_000);
    }

    #[test]
    fn change_deserializes_with_defaults() {
        let change: OutputChange =
            serde_json::from_str(r#"{"name":"DP-1","mode":{"width":1920,"height":1080},"adaptiveSync":true}"#)
                .unwrap();
        assert_eq!(change.name, "DP-1");
        assert_eq!(change.mode.unwrap().refresh, None);
        assert_eq!(change.adaptive_sync, Some(true));
        assert_eq!(change.enabled, None);
    }
}
