//! wlbroker - desktop session broker core.
//!
//! This crate talks to a Wayland compositor over its Unix socket, mirrors
//! compositor state into per-subsystem stores, and streams debounced
//! snapshots to local subscribers.
//!
//! # Architecture
//!
//! Each subsystem is a [`Manager`]:
//!
//! - **Actor** - single worker thread that owns the compositor
//!   [`Connection`]; all mutations are posted to it and run in order
//! - **State store** - snapshot readable from any thread, with a debounced
//!   diff-and-broadcast notifier feeding bounded subscriber queues
//! - **Transport** - wire codec, object registry and fd passing
//!
//! # Modules
//!
//! - [`wire`] - Wayland wire format
//! - [`registry`] - object id allocation and handler lookup
//! - [`transport`] - socket connection and event dispatch
//! - [`actor`] - single-writer worker with blocking hand-off
//! - [`store`] - snapshot store and notifier
//! - [`manager`] - actor plus store
//! - [`outputs`] - output configuration manager
//! - [`server`] - local socket server for subscribers
//! - [`config`] - configuration loading/saving

// Library modules
pub mod actor;
pub mod manager;
pub mod outputs;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;
pub mod stream;
pub mod transport;
pub mod wire;

pub mod config;
pub mod constants;
pub mod error;

// Re-export commonly used types
pub use actor::{Actor, Worker};
pub use config::Config;
pub use error::{ActorError, DispatchError, Error, Result, TransportError, WireError};
pub use manager::{Manager, ManagerSettings};
pub use outputs::{Output, OutputChange, OutputManager, OutputState};
pub use registry::{Dispatch, ObjectRegistry};
pub use store::{Snapshot, StateStore, Subscription};
pub use transport::Connection;
