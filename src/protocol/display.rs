//! Core objects: `wl_display`, `wl_callback` and `wl_registry`.
//!
//! These are the only objects every connection needs. `wl_display` carries
//! fatal protocol errors and the `delete_id` acknowledgements that reclaim
//! zombie ids; `wl_callback` backs [`Connection::roundtrip`];
//! `wl_registry` advertises the globals a manager binds to.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{DispatchError, Error, TransportError};
use crate::registry::{Dispatch, DISPLAY_ID};
use crate::transport::Connection;
use crate::wire::{Arg, Message};

/// `wl_display` request opcodes.
pub mod display_request {
    /// `sync(callback: new_id<wl_callback>)`
    pub const SYNC: u16 = 0;
    /// `get_registry(registry: new_id<wl_registry>)`
    pub const GET_REGISTRY: u16 = 1;
}

/// `wl_display` event opcodes.
pub mod display_event {
    /// `error(object_id: object, code: uint, message: string)`
    pub const ERROR: u16 = 0;
    /// `delete_id(id: uint)`
    pub const DELETE_ID: u16 = 1;
}

/// `wl_registry` opcodes.
pub mod registry_op {
    /// Request `bind(name: uint, id: new_id)` (untyped new_id).
    pub const BIND: u16 = 0;
    /// Event `global(name: uint, interface: string, version: uint)`
    pub const GLOBAL: u16 = 0;
    /// Event `global_remove(name: uint)`
    pub const GLOBAL_REMOVE: u16 = 1;
}

/// `wl_callback.done` opcode.
pub const CALLBACK_DONE: u16 = 0;

// ─── wl_display ────────────────────────────────────────────────────────────

/// Handler for object 1.
#[derive(Debug)]
pub struct DisplayHandler;

impl Dispatch for DisplayHandler {
    fn dispatch(&self, conn: &mut Connection, msg: Message) -> Result<(), DispatchError> {
        let mut args = msg.args();
        match msg.opcode {
            display_event::ERROR => {
                let object_id = args.object()?;
                let code = args.uint()?;
                let message = args.string()?.to_owned();
                log::error!("[Display] protocol error on object {object_id} (code {code}): {message}");
                Err(DispatchError::Protocol {
                    object_id,
                    code,
                    message,
                })
            }
            display_event::DELETE_ID => {
                let id = args.uint()?;
                if conn.registry().unregister(id).is_none() {
                    log::debug!("[Display] delete_id for unknown object {id}");
                }
                Ok(())
            }
            other => {
                log::debug!("[Display] ignoring unknown event {other}");
                Ok(())
            }
        }
    }
}

// ─── wl_callback ───────────────────────────────────────────────────────────

/// One-shot `wl_callback`.
#[derive(Debug, Default)]
pub struct CallbackHandler {
    done: AtomicBool,
    data: AtomicU32,
}

impl CallbackHandler {
    /// Whether `done` has arrived.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Event data from `done` (the serial for `wl_display.sync`).
    pub fn data(&self) -> u32 {
        self.data.load(Ordering::Acquire)
    }
}

impl Dispatch for CallbackHandler {
    fn dispatch(&self, conn: &mut Connection, msg: Message) -> Result<(), DispatchError> {
        if msg.opcode == CALLBACK_DONE {
            self.data.store(msg.args().uint()?, Ordering::Release);
            self.done.store(true, Ordering::Release);
            // The compositor destroys the callback; its delete_id follows.
            conn.registry().mark_zombie(msg.object_id);
        }
        Ok(())
    }
}

// ─── wl_registry ───────────────────────────────────────────────────────────

/// An advertised global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    /// Numeric name used by `bind`.
    pub name: u32,
    /// Interface name.
    pub interface: String,
    /// Highest version the compositor supports.
    pub version: u32,
}

/// Mirror of the compositor's global list.
#[derive(Debug, Default)]
pub struct RegistryHandler {
    globals: Mutex<BTreeMap<u32, Global>>,
}

impl RegistryHandler {
    /// First global implementing `interface`.
    pub fn find(&self, interface: &str) -> Option<Global> {
        self.globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|g| g.interface == interface)
            .cloned()
    }

    /// All globals ordered by name.
    pub fn globals(&self) -> Vec<Global> {
        self.globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl Dispatch for RegistryHandler {
    fn dispatch(&self, _conn: &mut Connection, msg: Message) -> Result<(), DispatchError> {
        let mut args = msg.args();
        let mut globals = self.globals.lock().unwrap_or_else(PoisonError::into_inner);
        match msg.opcode {
            registry_op::GLOBAL => {
                let name = args.uint()?;
                let interface = args.string()?.to_owned();
                let version = args.uint()?;
                log::trace!("[Registry] global {name}: {interface} v{version}");
                globals.insert(
                    name,
                    Global {
                        name,
                        interface,
                        version,
                    },
                );
            }
            registry_op::GLOBAL_REMOVE => {
                let name = args.uint()?;
                if let Some(global) = globals.remove(&name) {
                    log::debug!("[Registry] global {name} ({}) removed", global.interface);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

// ─── Connection helpers ────────────────────────────────────────────────────

impl Connection {
    /// Send `wl_display.sync` and return the callback to watch.
    pub fn sync(&self) -> Result<Arc<CallbackHandler>, TransportError> {
        let callback = Arc::new(CallbackHandler::default());
        let dispatch = Arc::clone(&callback);
        let id = self.registry().register("wl_callback", dispatch);
        self.send(DISPLAY_ID, display_request::SYNC, &[Arg::NewId(id)])?;
        Ok(callback)
    }

    /// Block until the compositor has processed every request sent so far.
    ///
    /// Fails with [`Error::Timeout`] if `done` does not arrive in time.
    pub fn roundtrip(&mut self, timeout: Duration) -> Result<(), Error> {
        let callback = self.sync()?;
        self.dispatch_until(timeout, || callback.is_done())
    }

    /// Create the `wl_registry` object; globals arrive as events.
    pub fn get_registry(&self) -> Result<(u32, Arc<RegistryHandler>), TransportError> {
        let handler = Arc::new(RegistryHandler::default());
        let dispatch = Arc::clone(&handler);
        let id = self.registry().register("wl_registry", dispatch);
        self.send(DISPLAY_ID, display_request::GET_REGISTRY, &[Arg::NewId(id)])?;
        Ok((id, handler))
    }

    /// Bind `global` at `version` and register `handler` for its events.
    pub fn bind(
        &self,
        registry_id: u32,
        global: &Global,
        interface: &'static str,
        version: u32,
        handler: Arc<dyn Dispatch>,
    ) -> Result<u32, TransportError> {
        let id = self.registry().register(interface, handler);
        self.send(
            registry_id,
            registry_op::BIND,
            &[
                Arg::Uint(global.name),
                Arg::String(Some(interface)),
                Arg::Uint(version),
                Arg::NewId(id),
            ],
        )?;
        log::debug!("[Registry] bound {interface} v{version} as object {id}");
        Ok(id)
    }
}
