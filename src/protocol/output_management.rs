//! `zwlr_output_manager_v1` client objects.
//!
//! The compositor announces each output as a head object (created by the
//! compositor, so it carries a server-allocated id), each head announces
//! its modes the same way, and a `done(serial)` on the manager marks the
//! end of an atomic batch of changes. Handlers here fold those events into
//! an [`OutputMirror`]; on every `done` the mirror is converted into an
//! [`OutputState`] and published.
//!
//! Configuration objects are client-created. A configuration reports its
//! outcome with exactly one of `succeeded`, `failed` or `cancelled`.
//!
//! Rust guideline compliant 2026-02

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::DispatchError;
use crate::outputs::{Output, OutputMode, OutputState};
use crate::registry::Dispatch;
use crate::store::StateStore;
use crate::transport::Connection;
use crate::wire::Message;

/// Global interface name.
pub const MANAGER_INTERFACE: &str = "zwlr_output_manager_v1";
/// Head interface name.
pub const HEAD_INTERFACE: &str = "zwlr_output_head_v1";
/// Mode interface name.
pub const MODE_INTERFACE: &str = "zwlr_output_mode_v1";
/// Configuration interface name.
pub const CONFIGURATION_INTERFACE: &str = "zwlr_output_configuration_v1";
/// Configuration head interface name.
pub const CONFIGURATION_HEAD_INTERFACE: &str = "zwlr_output_configuration_head_v1";

/// Highest protocol version this client speaks.
pub const MAX_VERSION: u32 = 4;

/// Version that introduced `release` on heads and modes.
pub const RELEASE_SINCE: u32 = 3;

/// Version that introduced adaptive sync.
pub const ADAPTIVE_SYNC_SINCE: u32 = 4;

/// `zwlr_output_manager_v1` opcodes.
pub mod manager_op {
    /// Request `create_configuration(id: new_id, serial: uint)`.
    pub const CREATE_CONFIGURATION: u16 = 0;
    /// Request `stop()`.
    pub const STOP: u16 = 1;
    /// Event `head(head: new_id)`.
    pub const HEAD: u16 = 0;
    /// Event `done(serial: uint)`.
    pub const DONE: u16 = 1;
    /// Event `finished()`.
    pub const FINISHED: u16 = 2;
}

/// `zwlr_output_head_v1` opcodes.
pub mod head_op {
    /// Request `release()` (v3).
    pub const RELEASE: u16 = 0;
    /// Event `name(string)`.
    pub const NAME: u16 = 0;
    /// Event `description(string)`.
    pub const DESCRIPTION: u16 = 1;
    /// Event `physical_size(width: int, height: int)`.
    pub const PHYSICAL_SIZE: u16 = 2;
    /// Event `mode(mode: new_id)`.
    pub const MODE: u16 = 3;
    /// Event `enabled(int)`.
    pub const ENABLED: u16 = 4;
    /// Event `current_mode(mode: object)`.
    pub const CURRENT_MODE: u16 = 5;
    /// Event `position(x: int, y: int)`.
    pub const POSITION: u16 = 6;
    /// Event `transform(int)`.
    pub const TRANSFORM: u16 = 7;
    /// Event `scale(fixed)`.
    pub const SCALE: u16 = 8;
    /// Event `finished()`.
    pub const FINISHED: u16 = 9;
    /// Event `make(string)`.
    pub const MAKE: u16 = 10;
    /// Event `model(string)`.
    pub const MODEL: u16 = 11;
    /// Event `serial_number(string)`.
    pub const SERIAL_NUMBER: u16 = 12;
    /// Event `adaptive_sync(uint)`.
    pub const ADAPTIVE_SYNC: u16 = 13;
}

/// `zwlr_output_mode_v1` opcodes.
pub mod mode_op {
    /// Request `release()` (v3).
    pub const RELEASE: u16 = 0;
    /// Event `size(width: int, height: int)`.
    pub const SIZE: u16 = 0;
    /// Event `refresh(mHz: int)`.
    pub const REFRESH: u16 = 1;
    /// Event `preferred()`.
    pub const PREFERRED: u16 = 2;
    /// Event `finished()`.
    pub const FINISHED: u16 = 3;
}

/// `zwlr_output_configuration_v1` opcodes.
pub mod configuration_op {
    /// Request `enable_head(id: new_id, head: object)`.
    pub const ENABLE_HEAD: u16 = 0;
    /// Request `disable_head(head: object)`.
    pub const DISABLE_HEAD: u16 = 1;
    /// Request `apply()`.
    pub const APPLY: u16 = 2;
    /// Request `test()`.
    pub const TEST: u16 = 3;
    /// Request `destroy()`.
    pub const DESTROY: u16 = 4;
    /// Event `succeeded()`.
    pub const SUCCEEDED: u16 = 0;
    /// Event `failed()`.
    pub const FAILED: u16 = 1;
    /// Event `cancelled()`.
    pub const CANCELLED: u16 = 2;
}

/// `zwlr_output_configuration_head_v1` request opcodes.
pub mod configuration_head_op {
    /// `set_mode(mode: object)`.
    pub const SET_MODE: u16 = 0;
    /// `set_custom_mode(width: int, height: int, refresh: int)`.
    pub const SET_CUSTOM_MODE: u16 = 1;
    /// `set_position(x: int, y: int)`.
    pub const SET_POSITION: u16 = 2;
    /// `set_transform(transform: int)`.
    pub const SET_TRANSFORM: u16 = 3;
    /// `set_scale(scale: fixed)`.
    pub const SET_SCALE: u16 = 4;
    /// `set_adaptive_sync(state: uint)` (v4).
    pub const SET_ADAPTIVE_SYNC: u16 = 5;
}

// ─── Mirror ────────────────────────────────────────────────────────────────

/// Accumulated head properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadState {
    /// Connector name.
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
    /// Whether the head is enabled.
    pub enabled: bool,
    /// Layout x position.
    pub x: i32,
    /// Layout y position.
    pub y: i32,
    /// `wl_output.transform` value.
    pub transform: i32,
    /// Scale factor.
    pub scale: f64,
    /// Current mode object, if any.
    pub current_mode: Option<u32>,
    /// Mode objects in announcement order.
    pub modes: Vec<u32>,
    /// Adaptive sync state (0 disabled, 1 enabled).
    pub adaptive_sync: u32,
    /// Whether the compositor reported adaptive sync at all.
    pub adaptive_sync_supported: bool,
    /// Whether a `done` has covered this head.
    pub ready: bool,
}

/// Accumulated mode properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeState {
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
    /// Refresh rate in mHz.
    pub refresh: i32,
    /// Whether this is the head's preferred mode.
    pub preferred: bool,
}

/// Client-side copy of the compositor's output topology.
#[derive(Debug, Default)]
pub struct OutputMirror {
    /// Heads by object id.
    pub heads: BTreeMap<u32, HeadState>,
    /// Modes by object id.
    pub modes: BTreeMap<u32, ModeState>,
    /// Serial from the last `done`.
    pub serial: u32,
    /// Whether at least one `done` has arrived.
    pub initialized: bool,
    /// Whether the manager sent `finished`.
    pub finished: bool,
}

impl OutputMirror {
    fn mode(&self, id: u32) -> Option<OutputMode> {
        self.modes.get(&id).map(|m| OutputMode {
            width: m.width,
            height: m.height,
            refresh: m.refresh,
            preferred: m.preferred,
            id,
        })
    }

    /// Snapshot of every head covered by a `done`.
    pub fn snapshot(&self) -> OutputState {
        let outputs = self
            .heads
            .iter()
            .filter(|(_, head)| head.ready)
            .map(|(&id, head)| Output {
                name: head.name.clone(),
                description: head.description.clone(),
                make: head.make.clone(),
                model: head.model.clone(),
                serial_number: head.serial_number.clone(),
                physical_width: head.physical_width,
                physical_height: head.physical_height,
                enabled: head.enabled,
                x: head.x,
                y: head.y,
                transform: head.transform,
                scale: head.scale,
                current_mode: head.current_mode.and_then(|m| self.mode(m)),
                modes: head.modes.iter().filter_map(|&m| self.mode(m)).collect(),
                adaptive_sync: head.adaptive_sync,
                adaptive_sync_supported: head.adaptive_sync_supported,
                id,
            })
            .collect();
        OutputState {
            outputs,
            serial: self.serial,
        }
    }
}

/// Mirror shared between the handlers and the owning session.
pub type SharedMirror = Arc<Mutex<OutputMirror>>;

fn lock(mirror: &SharedMirror) -> std::sync::MutexGuard<'_, OutputMirror> {
    mirror.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Manager ───────────────────────────────────────────────────────────────

/// Handler for the bound `zwlr_output_manager_v1`.
#[derive(Debug)]
pub struct ManagerHandler {
    mirror: SharedMirror,
    store: StateStore<OutputState>,
    version: u32,
}

impl ManagerHandler {
    /// Handler publishing into `store`.
    pub fn new(mirror: SharedMirror, store: StateStore<OutputState>, version: u32) -> Self {
        Self { mirror, store, version }
    }
}

impl Dispatch for ManagerHandler {
    fn dispatch(&self, conn: &mut Connection, msg: Message) -> Result<(), DispatchError> {
        let mut args = msg.args();
        match msg.opcode {
            manager_op::HEAD => {
                let id = args.new_id()?;
                let handler = HeadHandler {
                    mirror: Arc::clone(&self.mirror),
                    version: self.version,
                };
                conn.registry().register_with_id(id, HEAD_INTERFACE, Arc::new(handler))?;
                lock(&self.mirror).heads.insert(id, HeadState::default());
                log::debug!("[Outputs] new head {id}");
            }
            manager_op::DONE => {
                let serial = args.uint()?;
                let snapshot = {
                    let mut mirror = lock(&self.mirror);
                    mirror.serial = serial;
                    mirror.initialized = true;
                    for head in mirror.heads.values_mut() {
                        head.ready = true;
                    }
                    mirror.snapshot()
                };
                log::debug!("[Outputs] done serial={serial} outputs={}", snapshot.outputs.len());
                self.store.set_state(snapshot);
                self.store.mark_dirty();
            }
            manager_op::FINISHED => {
                log::warn!("[Outputs] output manager finished by compositor");
                lock(&self.mirror).finished = true;
                conn.registry().mark_zombie(msg.object_id);
            }
            other => log::debug!("[Outputs] ignoring manager event {other}"),
        }
        Ok(())
    }
}

// ─── Head ──────────────────────────────────────────────────────────────────

struct HeadHandler {
    mirror: SharedMirror,
    version: u32,
}

impl Dispatch for HeadHandler {
    fn dispatch(&self, conn: &mut Connection, msg: Message) -> Result<(), DispatchError> {
        let id = msg.object_id;
        let mut args = msg.args();

        if msg.opcode == head_op::FINISHED {
            lock(&self.mirror).heads.remove(&id);
            if self.version >= RELEASE_SINCE {
                conn.destroy(id, head_op::RELEASE).map_err(DispatchError::Write)?;
            } else {
                conn.registry().mark_zombie(id);
            }
            log::debug!("[Outputs] head {id} finished");
            return Ok(());
        }

        if msg.opcode == head_op::MODE {
            let mode_id = args.new_id()?;
            let handler = ModeHandler {
                mirror: Arc::clone(&self.mirror),
                version: self.version,
            };
            conn.registry().register_with_id(mode_id, MODE_INTERFACE, Arc::new(handler))?;
            let mut mirror = lock(&self.mirror);
            mirror.modes.insert(mode_id, ModeState::default());
            if let Some(head) = mirror.heads.get_mut(&id) {
                head.modes.push(mode_id);
            }
            return Ok(());
        }

        let mut mirror = lock(&self.mirror);
        let Some(head) = mirror.heads.get_mut(&id) else {
            return Ok(());
        };
        match msg.opcode {
            head_op::NAME => head.name = args.string()?.to_owned(),
            head_op::DESCRIPTION => head.description = args.string()?.to_owned(),
            head_op::PHYSICAL_SIZE => {
                head.physical_width = args.int()?;
                head.physical_height = args.int()?;
            }
            head_op::ENABLED => head.enabled = args.int()? != 0,
            head_op::CURRENT_MODE => head.current_mode = Some(args.object()?),
            head_op::POSITION => {
                head.x = args.int()?;
                head.y = args.int()?;
            }
            head_op::TRANSFORM => head.transform = args.int()?,
            head_op::SCALE => head.scale = args.fixed()?.to_f64(),
            head_op::MAKE => head.make = args.string()?.to_owned(),
            head_op::MODEL => head.model = args.string()?.to_owned(),
            head_op::SERIAL_NUMBER => head.serial_number = args.string()?.to_owned(),
            head_op::ADAPTIVE_SYNC => {
                head.adaptive_sync = args.uint()?;
                head.adaptive_sync_supported = true;
            }
            other => log::debug!("[Outputs] ignoring head event {other}"),
        }
        Ok(())
    }
}

// ─── Mode ──────────────────────────────────────────────────────────────────

struct ModeHandler {
    mirror: SharedMirror,
    version: u32,
}

impl Dispatch for ModeHandler {
    fn dispatch(&self, conn: &mut Connection, msg: Message) -> Result<(), DispatchError> {
        let id = msg.object_id;
        let mut args = msg.args();
        let mut mirror = lock(&self.mirror);

        if msg.opcode == mode_op::FINISHED {
            mirror.modes.remove(&id);
            for head in mirror.heads.values_mut() {
                head.modes.retain(|&m| m != id);
                if head.current_mode == Some(id) {
                    head.current_mode = None;
                }
            }
            drop(mirror);
            if self.version >= RELEASE_SINCE {
                conn.destroy(id, mode_op::RELEASE).map_err(DispatchError::Write)?;
            } else {
                conn.registry().mark_zombie(id);
            }
            return Ok(());
        }

        let Some(mode) = mirror.modes.get_mut(&id) else {
            return Ok(());
        };
        match msg.opcode {
            mode_op::SIZE => {
                mode.width = args.int()?;
                mode.height = args.int()?;
            }
            mode_op::REFRESH => mode.refresh = args.int()?,
            mode_op::PREFERRED => mode.preferred = true,
            other => log::debug!("[Outputs] ignoring mode event {other}"),
        }
        Ok(())
    }
}

// ─── Configuration ─────────────────────────────────────────────────────────

/// How the compositor answered a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationOutcome {
    /// Applied (or, for `test`, would apply).
    Succeeded,
    /// Rejected.
    Failed,
    /// Superseded by a newer output state; retry with the new serial.
    Cancelled,
}

/// Handler for one `zwlr_output_configuration_v1`.
#[derive(Debug, Default)]
pub struct ConfigurationHandler {
    outcome: Mutex<Option<ConfigurationOutcome>>,
}

impl ConfigurationHandler {
    /// The outcome, once it has arrived.
    pub fn outcome(&self) -> Option<ConfigurationOutcome> {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Dispatch for ConfigurationHandler {
    fn dispatch(&self, _conn: &mut Connection, msg: Message) -> Result<(), DispatchError> {
        let outcome = match msg.opcode {
            configuration_op::SUCCEEDED => ConfigurationOutcome::Succeeded,
            configuration_op::FAILED => ConfigurationOutcome::Failed,
            configuration_op::CANCELLED => ConfigurationOutcome::Cancelled,
            other => {
                log::debug!("[Outputs] ignoring configuration event {other}");
                return Ok(());
            }
        };
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        Ok(())
    }
}
