//! Debounced diff-and-broadcast state store.
//!
//! A [`StateStore`] holds the latest snapshot of a manager's state and a
//! set of subscribers. Writers replace the snapshot with
//! [`set_state`](StateStore::set_state) and then call
//! [`mark_dirty`](StateStore::mark_dirty); a notifier thread turns bursts of
//! dirty signals into at most one broadcast per window:
//!
//! ```text
//! mark_dirty ──► dirty (bounded(1), try_send)
//!                    │
//!              notifier thread
//!   idle ──first signal──► armed (after(min_gap)) ──expiry──► diff vs last broadcast
//!                             ▲   │ further signals                │ changed
//!                             └───┘ absorbed                       ▼
//!                                                     try_send to every subscriber
//! ```
//!
//! Delivery never blocks: a subscriber whose queue is full misses that
//! broadcast, and one whose receiver is gone is pruned.
//!
//! Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{after, bounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use crossbeam::select;

/// A value-type state snapshot.
pub trait Snapshot: Clone + Send + Sync + 'static {
    /// Whether `self` differs from `previous` in any way subscribers care
    /// about. Fields that only carry presentation detail may be ignored.
    fn differs_from(&self, previous: &Self) -> bool;
}

/// Store tuning.
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    /// Queue length per subscriber.
    pub subscriber_capacity: usize,
    /// Minimum gap between broadcasts.
    pub min_gap: Duration,
}

type ActivityHook = Arc<dyn Fn(bool) + Send + Sync>;

struct Subscriber<T> {
    token: u64,
    tx: Sender<T>,
}

struct Inner<T> {
    name: String,
    state: RwLock<T>,
    subscribers: Mutex<HashMap<String, Subscriber<T>>>,
    subscriber_capacity: usize,
    next_token: AtomicU64,
    dirty_tx: Sender<()>,
    close_tx: Mutex<Option<Sender<()>>>,
    closed: AtomicBool,
    activity: Mutex<Option<ActivityHook>>,
    /// Last edge reported to the hook. Held while the hook runs.
    active: Mutex<bool>,
}

impl<T> Inner<T> {
    fn subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Subscriber<T>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report an activity edge if the subscriber set crossed empty/non-empty
    /// since the last report.
    fn sync_activity(&self) {
        let mut reported = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let active = !self.subscribers().is_empty();
        if *reported == active {
            return;
        }
        *reported = active;
        let hook = self
            .activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(active);
        }
    }
}

impl<T: Snapshot> Inner<T> {
    fn snapshot(&self) -> T {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Broadcast the current state if it differs from `last`.
    fn broadcast_if_changed(&self, last: &mut Option<T>) {
        let current = self.snapshot();
        if let Some(previous) = last.as_ref() {
            if !current.differs_from(previous) {
                log::trace!("[Store] {} unchanged, skipping broadcast", self.name);
                return;
            }
        }

        let emptied = {
            let mut subscribers = self.subscribers();
            let mut gone = Vec::new();
            for (id, subscriber) in subscribers.iter() {
                match subscriber.tx.try_send(current.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::debug!("[Store] {} subscriber {id} is behind, dropping update", self.name);
                    }
                    Err(TrySendError::Disconnected(_)) => gone.push(id.clone()),
                }
            }
            for id in &gone {
                subscribers.remove(id);
                log::debug!("[Store] {} pruned disconnected subscriber {id}", self.name);
            }
            !gone.is_empty() && subscribers.is_empty()
        };
        if emptied {
            self.sync_activity();
        }
        *last = Some(current);
    }
}

/// A subscriber's end of the broadcast.
///
/// Closed (receives report disconnection) once the subscriber is removed
/// and the remaining queued snapshots are drained.
#[derive(Debug)]
pub struct Subscription<T> {
    id: String,
    token: u64,
    rx: Receiver<T>,
}

impl<T> Subscription<T> {
    /// Subscriber id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Block for the next broadcast.
    pub fn recv(&self) -> Result<T, RecvError> {
        self.rx.recv()
    }

    /// Block for the next broadcast, up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Next broadcast if one is queued.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }

    /// Underlying receiver, for `select!`.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

/// Shared state snapshot plus debounced subscriber broadcast.
///
/// Cloning yields another handle to the same store. The notifier thread
/// exits when the store is closed or the last handle drops.
pub struct StateStore<T: Snapshot> {
    inner: Arc<Inner<T>>,
}

impl<T: Snapshot> Clone for StateStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Snapshot> fmt::Debug for StateStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("name", &self.inner.name)
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Snapshot> StateStore<T> {
    /// Create a store holding `initial` and start its notifier thread.
    pub fn new(name: impl Into<String>, initial: T, settings: StoreSettings) -> std::io::Result<Self> {
        let name = name.into();
        let (dirty_tx, dirty_rx) = bounded(1);
        let (close_tx, close_rx) = bounded::<()>(0);
        let inner = Arc::new(Inner {
            name: name.clone(),
            state: RwLock::new(initial),
            subscribers: Mutex::new(HashMap::new()),
            subscriber_capacity: settings.subscriber_capacity.max(1),
            next_token: AtomicU64::new(1),
            dirty_tx,
            close_tx: Mutex::new(Some(close_tx)),
            closed: AtomicBool::new(false),
            activity: Mutex::new(None),
            active: Mutex::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let min_gap = settings.min_gap;
        thread::Builder::new()
            .name(format!("notifier-{name}"))
            .spawn(move || run_notifier(&weak, &dirty_rx, &close_rx, min_gap))?;

        Ok(Self { inner })
    }

    /// Clone of the current snapshot.
    pub fn get_state(&self) -> T {
        self.inner.snapshot()
    }

    /// Replace the snapshot. Subscribers are not notified until
    /// [`mark_dirty`](Self::mark_dirty).
    pub fn set_state(&self, state: T) {
        *self.inner.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Mutate the snapshot in place under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.state.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Signal that the snapshot may have changed. Never blocks; signals
    /// arriving while one is already pending coalesce.
    pub fn mark_dirty(&self) {
        let _ = self.inner.dirty_tx.try_send(());
    }

    /// Register subscriber `id` and return its queue.
    ///
    /// The queue receives future broadcasts only. Re-using an id replaces
    /// the previous subscription and closes its queue. After
    /// [`close`](Self::close) the returned queue is already closed.
    pub fn subscribe(&self, id: impl Into<String>) -> Subscription<T> {
        let id = id.into();
        let (tx, rx) = bounded(self.inner.subscriber_capacity);
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        if self.inner.closed.load(Ordering::Acquire) {
            return Subscription { id, token, rx };
        }

        let first = {
            let mut subscribers = self.inner.subscribers();
            let was_empty = subscribers.is_empty();
            if subscribers.insert(id.clone(), Subscriber { token, tx }).is_some() {
                log::debug!("[Store] {} subscriber {id} replaced", self.inner.name);
            }
            was_empty
        };
        log::debug!("[Store] {} subscriber {id} added", self.inner.name);
        if first {
            self.inner.sync_activity();
        }
        Subscription { id, token, rx }
    }

    /// Remove subscriber `id` and close its queue. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: &str) {
        let emptied = {
            let mut subscribers = self.inner.subscribers();
            subscribers.remove(id).is_some() && subscribers.is_empty()
        };
        log::debug!("[Store] {} subscriber {id} removed", self.inner.name);
        if emptied {
            self.inner.sync_activity();
        }
    }

    /// Remove `subscription` if it is still the one registered under its id.
    ///
    /// Unlike [`unsubscribe`](Self::unsubscribe) this leaves a newer
    /// subscription that re-used the id alone.
    pub fn release(&self, subscription: &Subscription<T>) {
        let emptied = {
            let mut subscribers = self.inner.subscribers();
            let ours = subscribers
                .get(&subscription.id)
                .is_some_and(|s| s.token == subscription.token);
            ours && subscribers.remove(&subscription.id).is_some() && subscribers.is_empty()
        };
        if emptied {
            self.inner.sync_activity();
        }
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Install a hook called with `true` when the first subscriber arrives
    /// and `false` when the last one leaves.
    ///
    /// Edges are reported in order, one at a time. The hook must not
    /// subscribe to or unsubscribe from this store.
    pub fn set_activity_hook(&self, hook: impl Fn(bool) + Send + Sync + 'static) {
        *self.inner.activity.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Close every subscriber queue and stop the notifier.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.inner.close_tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let had_subscribers = {
            let mut subscribers = self.inner.subscribers();
            let had = !subscribers.is_empty();
            subscribers.clear();
            had
        };
        if had_subscribers {
            self.inner.sync_activity();
        }
        log::debug!("[Store] {} closed", self.inner.name);
    }
}

fn run_notifier<T: Snapshot>(inner: &Weak<Inner<T>>, dirty: &Receiver<()>, close: &Receiver<()>, min_gap: Duration) {
    let mut last: Option<T> = None;
    loop {
        select! {
            recv(dirty) -> signal => if signal.is_err() { return },
            recv(close) -> _ => return,
        }

        let window = after(min_gap);
        loop {
            select! {
                recv(dirty) -> signal => if signal.is_err() { return },
                recv(window) -> _ => break,
                recv(close) -> _ => return,
            }
        }

        let Some(inner) = inner.upgrade() else { return };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        inner.broadcast_if_changed(&mut last);
    }
}
