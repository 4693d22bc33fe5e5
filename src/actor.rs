//! Single-writer actor.
//!
//! One worker thread owns a piece of state (for compositor managers: the
//! [`Connection`](crate::transport::Connection) and everything hanging off
//! it) and runs closures against it one at a time, in submission order.
//! Callers on any thread hand closures over with [`Actor::post`] and block
//! until theirs has run.
//!
//! # Channels
//!
//! ```text
//!  post() ──► tasks (bounded, FIFO) ──► worker ──► done (bounded(1), per task)
//!               ▲                          ▲
//!   select!     │  stop (dropped Sender) ──┘
//!   send vs stop┘
//! ```
//!
//! Stop is signalled by dropping the only `Sender` of a zero-capacity
//! channel: every clone of the receiver sees the disconnect at once, so a
//! producer blocked on a full queue and the worker waiting for work both
//! wake up. When the worker exits it discards every queued task and drops
//! its own zero-capacity `exit` sender. A caller whose task never ran sees
//! its completion channel empty once `exit` disconnects and gets
//! [`ActorError::Stopped`].
//!
//! When no task arrives within the idle interval the worker calls
//! [`Worker::idle`]. An idle error is fatal, as is an error the state
//! reports through [`Worker::take_fatal`] after a task: it is published on
//! the actor's fatal-error channel and the worker exits.
//!
//! Rust guideline compliant 2026-02

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use crossbeam::select;

use crate::error::{ActorError, Error};

/// State owned by an actor's worker thread.
pub trait Worker: Send + 'static {
    /// Background step run when the queue has been empty for the idle
    /// interval. Returning an error stops the actor.
    fn idle(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Error that left the state unusable while the last task ran.
    /// Checked after every task; `Some` stops the actor.
    fn take_fatal(&mut self) -> Option<Error> {
        None
    }
}

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

struct Shared<S> {
    name: String,
    idle_interval: Duration,
    tasks_tx: Sender<Task<S>>,
    /// Held until `start` hands it to the worker.
    tasks_rx: Mutex<Option<Receiver<Task<S>>>>,
    state: Mutex<Option<S>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    fatal_tx: Sender<Error>,
    fatal_rx: Receiver<Error>,
    /// Handed to the worker, which drops it on exit.
    exit_tx: Mutex<Option<Sender<()>>>,
    exit_rx: Receiver<()>,
    started: AtomicBool,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Shared<S> {
    fn signal_stop(&self) {
        self.stopped.store(true, Ordering::Release);
        drop(self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner).take());
    }

    fn publish_fatal(&self, err: Error) {
        log::error!("[Actor] {} stopping on fatal error: {err}", self.name);
        self.signal_stop();
        if let Err(TrySendError::Full(err)) = self.fatal_tx.try_send(err) {
            log::debug!("[Actor] {} fatal error already pending, dropping: {err}", self.name);
        }
    }
}

/// Serializes every access to `S` onto one worker thread.
pub struct Actor<S: Worker> {
    shared: Arc<Shared<S>>,
}

impl<S: Worker> fmt::Debug for Actor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("name", &self.shared.name)
            .field("queued", &self.shared.tasks_tx.len())
            .field("started", &self.shared.started.load(Ordering::Relaxed))
            .field("stopped", &self.shared.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl<S: Worker> Actor<S> {
    /// Create an actor around `state`. Nothing runs until [`start`](Self::start).
    ///
    /// `capacity` bounds the task queue (at least 1); `idle_interval` is how
    /// long the worker waits for a task before calling [`Worker::idle`].
    pub fn new(name: impl Into<String>, state: S, capacity: usize, idle_interval: Duration) -> Self {
        let (tasks_tx, tasks_rx) = bounded(capacity.max(1));
        let (stop_tx, stop_rx) = bounded(0);
        let (fatal_tx, fatal_rx) = bounded(1);
        let (exit_tx, exit_rx) = bounded(0);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                idle_interval,
                tasks_tx,
                tasks_rx: Mutex::new(Some(tasks_rx)),
                state: Mutex::new(Some(state)),
                stop_tx: Mutex::new(Some(stop_tx)),
                stop_rx,
                fatal_tx,
                fatal_rx,
                exit_tx: Mutex::new(Some(exit_tx)),
                exit_rx,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Spawn the worker thread. Calling it again is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let tasks = self.shared.tasks_rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner).take();
        let exit = self.shared.exit_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let (Some(tasks), Some(state), Some(exit)) = (tasks, state, exit) else {
            // Stopped before it ever started.
            return Ok(());
        };

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("actor-{}", self.shared.name))
            .spawn(move || {
                run_worker(&shared, state, &tasks);
                drop(exit);
            })?;
        *self.shared.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        log::debug!("[Actor] {} started", self.shared.name);
        Ok(())
    }

    /// Run `f` on the worker and return its result.
    ///
    /// Blocks while the queue is full and until `f` has run. `f` may return
    /// its own `Result`; the outer one only reports what happened to the
    /// task itself. Must not be called from inside a task.
    pub fn post<F, R>(&self, f: F) -> Result<R, ActorError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_stopped() {
            return Err(ActorError::Stopped);
        }

        let (done_tx, done_rx) = bounded(1);
        let task: Task<S> = Box::new(move |state: &mut S| {
            let outcome = catch_unwind(AssertUnwindSafe(|| f(state)))
                .map_err(|_panic| ActorError::Panicked);
            // The caller may have given up; nothing to do then.
            let _ = done_tx.send(outcome);
        });

        select! {
            send(self.shared.tasks_tx, task) -> sent => {
                if sent.is_err() {
                    return Err(ActorError::Stopped);
                }
            }
            recv(self.shared.stop_rx) -> _ => return Err(ActorError::Stopped),
        }

        // A task that ran has sent its outcome before the worker exits.
        select! {
            recv(done_rx) -> outcome => outcome.unwrap_or(Err(ActorError::Stopped)),
            recv(self.shared.exit_rx) -> _ => done_rx.try_recv().unwrap_or(Err(ActorError::Stopped)),
        }
    }

    /// Stop the worker.
    ///
    /// The running task finishes, queued tasks are abandoned and their
    /// callers get [`ActorError::Stopped`]. Joins the worker unless called
    /// from the worker itself.
    pub fn stop(&self) {
        self.shared.signal_stop();
        drop(self.shared.tasks_rx.lock().unwrap_or_else(PoisonError::into_inner).take());
        drop(self.shared.state.lock().unwrap_or_else(PoisonError::into_inner).take());
        drop(self.shared.exit_tx.lock().unwrap_or_else(PoisonError::into_inner).take());

        let handle = self.shared.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("[Actor] {} worker panicked", self.shared.name);
            }
            log::debug!("[Actor] {} stopped", self.shared.name);
        }
    }

    /// Whether stop has been requested or the worker has exited.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Receiver for the error that stopped the worker, if any.
    ///
    /// At most one error is ever delivered.
    pub fn fatal_error(&self) -> Receiver<Error> {
        self.shared.fatal_rx.clone()
    }
}

impl<S: Worker> Drop for Actor<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<S: Worker>(shared: &Shared<S>, mut state: S, tasks: &Receiver<Task<S>>) {
    loop {
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }
        select! {
            recv(shared.stop_rx) -> _ => break,
            recv(tasks) -> task => match task {
                Ok(task) => {
                    task(&mut state);
                    if let Some(err) = state.take_fatal() {
                        shared.publish_fatal(err);
                        break;
                    }
                }
                Err(_) => break,
            },
            default(shared.idle_interval) => {
                if let Err(err) = state.idle() {
                    shared.publish_fatal(err);
                    break;
                }
            },
        }
    }
    shared.signal_stop();

    let mut abandoned = 0;
    while let Ok(task) = tasks.try_recv() {
        drop(task);
        abandoned += 1;
    }
    log::debug!("[Actor] {} worker exiting ({abandoned} queued tasks abandoned)", shared.name);
    drop(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        value: u64,
        log: Vec<u32>,
    }

    impl Worker for Counter {}

    fn counter() -> Actor<Counter> {
        let actor = Actor::new("test", Counter::default(), 8, Duration::from_millis(10));
        actor.start().unwrap();
        actor
    }

    #[test]
    fn post_returns_closure_result() {
        let actor = counter();
        let value = actor
            .post(|c: &mut Counter| {
                c.value += 41;
                c.value + 1
            })
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn start_is_idempotent() {
        let actor = counter();
        actor.start().unwrap();
        actor.start().unwrap();
        assert_eq!(actor.post(|c: &mut Counter| c.value).unwrap(), 0);
    }

    #[test]
    fn single_caller_order_is_preserved() {
        let actor = counter();
        for i in 0..100 {
            actor.post(move |c: &mut Counter| c.log.push(i)).unwrap();
        }
        let log = actor.post(|c: &mut Counter| c.log.clone()).unwrap();
        assert_eq!(log, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let actor = counter();
        let result: Result<(), _> = actor.post(|_c: &mut Counter| panic!("boom"));
        assert_eq!(result, Err(ActorError::Panicked));
        assert_eq!(actor.post(|c: &mut Counter| c.value).unwrap(), 0);
    }

    #[test]
    fn post_after_stop_is_rejected() {
        let actor = counter();
        actor.stop();
        assert_eq!(actor.post(|c: &mut Counter| c.value), Err(ActorError::Stopped));
        // Stopping twice is harmless.
        actor.stop();
    }

    #[test]
    fn stop_before_start_rejects_posts() {
        let actor = Actor::new("never", Counter::default(), 1, Duration::from_millis(10));
        actor.stop();
        actor.start().unwrap();
        assert_eq!(actor.post(|c: &mut Counter| c.value), Err(ActorError::Stopped));
    }

    struct FailingIdle {
        calls: Arc<AtomicUsize>,
    }

    impl Worker for FailingIdle {
        fn idle(&mut self) -> Result<(), Error> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= 2 {
                return Err(Error::Finished("test"));
            }
            Ok(())
        }
    }

    #[test]
    fn idle_error_is_fatal_and_published() {
        let calls = Arc::new(AtomicUsize::new(0));
        let actor = Actor::new(
            "idle",
            FailingIdle {
                calls: Arc::clone(&calls),
            },
            4,
            Duration::from_millis(5),
        );
        let fatal = actor.fatal_error();
        actor.start().unwrap();

        let err = fatal.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(err, Error::Finished("test")));
        assert!(actor.is_stopped());
        assert_eq!(actor.post(|_s: &mut FailingIdle| ()), Err(ActorError::Stopped));
    }
}
