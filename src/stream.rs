//! Streaming contract for long-lived subscriptions.
//!
//! A subscription stream emits the current snapshot first, then one value
//! per broadcast, until the subscriber's queue is closed (unsubscribe,
//! replacement, store shutdown) or the sink fails. The registration is
//! always released on the way out.

use std::io::{self, Write};

use serde::Serialize;

use crate::store::{Snapshot, StateStore, Subscription};

/// Drive `subscription` into `emit`.
///
/// Subscribe before handing the subscription over so an unsubscribe that
/// races the stream's start still closes it. Returns `Ok(())` when the
/// queue closes and the sink's error when writing fails.
pub fn stream_subscription<T: Snapshot>(
    store: &StateStore<T>,
    subscription: Subscription<T>,
    mut emit: impl FnMut(&T) -> io::Result<()>,
) -> io::Result<()> {
    let result = (|| {
        emit(&store.get_state())?;
        while let Ok(state) = subscription.recv() {
            emit(&state)?;
        }
        Ok(())
    })();
    store.release(&subscription);
    log::debug!("[Stream] subscription {} ended", subscription.id());
    result
}

/// Write `value` as one line of JSON and flush.
pub fn write_json_line<W: Write + ?Sized, V: Serialize + ?Sized>(out: &mut W, value: &V) -> io::Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    out.write_all(b"\n")?;
    out.flush()
}
