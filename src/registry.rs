//! Object registry: id allocation and handler lookup.
//!
//! Every protocol object the client knows about lives here under its
//! numeric id. Client-created objects get sequential ids from a dedicated
//! allocation lock; objects the compositor creates (announced through a
//! `new_id` event argument) are inserted under the id it chose.
//!
//! Destroying an object does not free its id. The entry is flagged as a
//! zombie and stays until the compositor acknowledges with
//! `wl_display.delete_id`, so events already in flight for it are dropped
//! instead of being reported as unknown.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::DispatchError;
use crate::transport::Connection;
use crate::wire::Message;

/// Id of `wl_display`, the first client object.
pub const DISPLAY_ID: u32 = 1;

/// Highest id in the client-allocated range.
pub const CLIENT_ID_MAX: u32 = 0xFEFF_FFFF;

/// Lowest id in the compositor-allocated range.
pub const SERVER_ID_MIN: u32 = 0xFF00_0000;

/// Event sink for one protocol object.
///
/// Handlers run on the thread that owns the [`Connection`], so they may
/// issue requests through `conn` while handling an event.
pub trait Dispatch: Send + Sync {
    /// Handle one event addressed to this object.
    fn dispatch(&self, conn: &mut Connection, msg: Message) -> Result<(), DispatchError>;
}

/// Whether an object still accepts events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Normal object.
    Active,
    /// Destroy requested; events are ignored until the id is reclaimed.
    Zombie,
}

/// A registered protocol object.
pub struct ObjectHandle {
    id: u32,
    interface: &'static str,
    handler: Option<Arc<dyn Dispatch>>,
    zombie: AtomicBool,
}

impl ObjectHandle {
    /// Numeric id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Interface name, e.g. `"wl_registry"`.
    pub fn interface(&self) -> &'static str {
        self.interface
    }

    /// Event handler, if the object receives events.
    pub fn handler(&self) -> Option<&Arc<dyn Dispatch>> {
        self.handler.as_ref()
    }

    /// Current liveness.
    pub fn liveness(&self) -> Liveness {
        if self.zombie.load(Ordering::Acquire) {
            Liveness::Zombie
        } else {
            Liveness::Active
        }
    }

    /// Flag the object as destroyed.
    pub fn mark_zombie(&self) {
        self.zombie.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("id", &self.id)
            .field("interface", &self.interface)
            .field("dispatches", &self.handler.is_some())
            .field("liveness", &self.liveness())
            .finish()
    }
}

/// Concurrent id → object map.
#[derive(Debug)]
pub struct ObjectRegistry {
    next_id: Mutex<u32>,
    objects: RwLock<HashMap<u32, Arc<ObjectHandle>>>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    /// Empty registry; the first allocated id is [`DISPLAY_ID`].
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(DISPLAY_ID),
            objects: RwLock::new(HashMap::new()),
        }
    }

    fn allocate(&self, interface: &'static str, handler: Option<Arc<dyn Dispatch>>) -> u32 {
        let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *next;
        debug_assert!(id <= CLIENT_ID_MAX, "client id space exhausted");
        *next += 1;
        // Insert while still holding the allocation lock so ids become
        // visible in allocation order.
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(ObjectHandle {
                id,
                interface,
                handler,
                zombie: AtomicBool::new(false),
            }));
        id
    }

    /// Register a client-created object and return its new id.
    pub fn register(&self, interface: &'static str, handler: Arc<dyn Dispatch>) -> u32 {
        self.allocate(interface, Some(handler))
    }

    /// Register a request-only object that never receives events.
    pub fn register_inert(&self, interface: &'static str) -> u32 {
        self.allocate(interface, None)
    }

    /// Register a compositor-created object under the id it chose.
    ///
    /// A zombie with the same id is replaced; a live one is an error.
    pub fn register_with_id(
        &self,
        id: u32,
        interface: &'static str,
        handler: Arc<dyn Dispatch>,
    ) -> Result<(), DispatchError> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = objects.get(&id) {
            if existing.liveness() == Liveness::Active {
                return Err(DispatchError::IdInUse(id));
            }
        }
        objects.insert(
            id,
            Arc::new(ObjectHandle {
                id,
                interface,
                handler: Some(handler),
                zombie: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    /// Remove an object, returning it if it was present.
    pub fn unregister(&self, id: u32) -> Option<Arc<ObjectHandle>> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Look up an object by id.
    pub fn lookup(&self, id: u32) -> Option<Arc<ObjectHandle>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Flag an object as destroyed. Returns `false` for unknown ids.
    pub fn mark_zombie(&self, id: u32) -> bool {
        match self.lookup(id) {
            Some(handle) => {
                handle.mark_zombie();
                true
            }
            None => false,
        }
    }

    /// Liveness of `id`, or `None` if unknown.
    pub fn liveness(&self, id: u32) -> Option<Liveness> {
        self.lookup(id).map(|h| h.liveness())
    }

    /// Number of registered objects, zombies included.
    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no objects are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    struct Nop;

    impl Dispatch for Nop {
        fn dispatch(&self, _conn: &mut Connection, _msg: Message) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    #[test]
    fn ids_start_at_display_and_increase() {
        let registry = ObjectRegistry::new();
        let a = registry.register("wl_display", Arc::new(Nop));
        let b = registry.register_inert("wl_surface");
        let c = registry.register("wl_callback", Arc::new(Nop));
        assert_eq!((a, b, c), (DISPLAY_ID, 2, 3));
    }

    #[test]
    fn concurrent_registration_never_reuses_ids() {
        let registry = Arc::new(ObjectRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let mut ids = Vec::new();
                    for _ in 0..200 {
                        ids.push(registry.register("test", Arc::new(Nop)));
                    }
                    ids
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]), "per-thread ids must increase");
            for id in ids {
                assert!(seen.insert(id), "id {id} allocated twice");
            }
        }
        assert_eq!(registry.len(), 1600);
    }

    #[test]
    fn unregister_does_not_recycle_ids() {
        let registry = ObjectRegistry::new();
        let first = registry.register("a", Arc::new(Nop));
        registry.unregister(first);
        let second = registry.register("b", Arc::new(Nop));
        assert!(second > first);
        assert!(registry.lookup(first).is_none());
    }

    #[test]
    fn zombie_flag_is_visible_through_lookup() {
        let registry = ObjectRegistry::new();
        let id = registry.register("wl_callback", Arc::new(Nop));
        assert_eq!(registry.liveness(id), Some(Liveness::Active));
        assert!(registry.mark_zombie(id));
        assert_eq!(registry.liveness(id), Some(Liveness::Zombie));
        assert!(!registry.mark_zombie(999));
    }

    #[test]
    fn server_ids_replace_only_zombies() {
        let registry = ObjectRegistry::new();
        registry
            .register_with_id(SERVER_ID_MIN, "zwlr_output_head_v1", Arc::new(Nop))
            .unwrap();
        assert!(matches!(
            registry.register_with_id(SERVER_ID_MIN, "zwlr_output_head_v1", Arc::new(Nop)),
            Err(DispatchError::IdInUse(id)) if id == SERVER_ID_MIN
        ));

        registry.mark_zombie(SERVER_ID_MIN);
        registry
            .register_with_id(SERVER_ID_MIN, "zwlr_output_head_v1", Arc::new(Nop))
            .unwrap();
        assert_eq!(registry.liveness(SERVER_ID_MIN), Some(Liveness::Active));
    }

    #[test]
    fn inert_objects_have_no_handler() {
        let registry = ObjectRegistry::new();
        let id = registry.register_inert("zwlr_output_configuration_head_v1");
        let handle = registry.lookup(id).unwrap();
        assert!(handle.handler().is_none());
        assert_eq!(handle.interface(), "zwlr_output_configuration_head_v1");
    }
}
