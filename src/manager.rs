//! Subsystem manager: an [`Actor`] that owns the connection plus the
//! [`StateStore`] it publishes into.
//!
//! Consumers see only four operations: [`post`](Manager::post),
//! [`get_state`](Manager::get_state), [`subscribe`](Manager::subscribe) and
//! [`unsubscribe`](Manager::unsubscribe). Reads never touch the actor, so a
//! slow compositor cannot stall `get_state`.

use std::fmt;
use std::time::Duration;

use crossbeam::channel::Receiver;

use crate::actor::{Actor, Worker};
use crate::constants;
use crate::error::{ActorError, Error};
use crate::store::{Snapshot, StateStore, StoreSettings, Subscription};

/// Tuning shared by every manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Actor queue length.
    pub queue_capacity: usize,
    /// Per-subscriber queue length.
    pub subscriber_capacity: usize,
    /// Minimum gap between broadcasts.
    pub debounce: Duration,
    /// How long the worker waits for a task before polling the connection.
    pub idle_interval: Duration,
    /// Bound on waits for compositor acknowledgements.
    pub ack_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: constants::DEFAULT_QUEUE_CAPACITY,
            subscriber_capacity: constants::DEFAULT_SUBSCRIBER_CAPACITY,
            debounce: constants::DEFAULT_DEBOUNCE,
            idle_interval: constants::DEFAULT_IDLE_INTERVAL,
            ack_timeout: constants::DEFAULT_ACK_TIMEOUT,
        }
    }
}

impl ManagerSettings {
    /// Settings for the manager's [`StateStore`].
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            subscriber_capacity: self.subscriber_capacity,
            min_gap: self.debounce,
        }
    }
}

/// A running subsystem manager.
pub struct Manager<S: Worker, T: Snapshot> {
    name: String,
    actor: Actor<S>,
    store: StateStore<T>,
}

impl<S: Worker, T: Snapshot> fmt::Debug for Manager<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("name", &self.name)
            .field("actor", &self.actor)
            .field("store", &self.store)
            .finish()
    }
}

impl<S: Worker, T: Snapshot> Manager<S, T> {
    /// Start `worker` on its own thread, publishing into `store`.
    ///
    /// The worker normally holds a clone of `store` so its event handlers
    /// can call `set_state` and `mark_dirty`.
    pub fn start(
        name: impl Into<String>,
        worker: S,
        store: StateStore<T>,
        settings: &ManagerSettings,
    ) -> std::io::Result<Self> {
        let name = name.into();
        let actor = Actor::new(name.clone(), worker, settings.queue_capacity, settings.idle_interval);
        actor.start()?;
        log::info!("[Manager] {name} started");
        Ok(Self { name, actor, store })
    }

    /// Manager name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` on the worker thread; see [`Actor::post`].
    pub fn post<F, R>(&self, f: F) -> Result<R, ActorError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.actor.post(f)
    }

    /// Clone of the current state.
    pub fn get_state(&self) -> T {
        self.store.get_state()
    }

    /// Subscribe to future state broadcasts.
    pub fn subscribe(&self, id: impl Into<String>) -> Subscription<T> {
        self.store.subscribe(id)
    }

    /// Remove a subscriber and close its queue.
    pub fn unsubscribe(&self, id: &str) {
        self.store.unsubscribe(id);
    }

    /// The manager's store.
    pub fn store(&self) -> &StateStore<T> {
        &self.store
    }

    /// Receiver for the transport-fatal error that stopped the worker.
    pub fn fatal_error(&self) -> Receiver<Error> {
        self.actor.fatal_error()
    }

    /// Whether the worker is gone.
    pub fn is_stopped(&self) -> bool {
        self.actor.is_stopped()
    }

    /// Stop the worker and close every subscription.
    pub fn shutdown(&self) {
        self.actor.stop();
        self.store.close();
        log::info!("[Manager] {} shut down", self.name);
    }
}

impl<S: Worker, T: Snapshot> Drop for Manager<S, T> {
    fn drop(&mut self) {
        self.actor.stop();
        self.store.close();
    }
}
