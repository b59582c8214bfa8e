//! Process-wide state: the registry tables, the abort flag, the id
//! generator and the abortable sleep.
//!
//! Lock order is strict: the global lock here is always taken before any
//! buffer or listener lock, never after one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};

use crate::buffer::BufferShared;
use crate::error::{Error, Result};
use crate::listener::ListenerShared;
use crate::registry::{IdTable, NameLookup};
use crate::Id;

/// Receives errors raised by notifier callbacks, which have no caller to
/// return to.
pub type ErrorSink = Arc<dyn Fn(&Error) + Send + Sync>;

pub(crate) struct GlobalState {
    pub(crate) abort: bool,
    pub(crate) buffers: IdTable<BufferShared>,
    pub(crate) listeners: IdTable<ListenerShared>,
    error_sink: Option<ErrorSink>,
}

struct Global {
    lock: Mutex<GlobalState>,
    cond: Condvar,
    id_counter: AtomicU64,
    epoch: Instant,
}

static SEED_ANCHOR: u8 = 0;

impl Global {
    fn new() -> Self {
        // Seed the id counter from the module address and the clock so
        // ids cannot be mistaken for small user-chosen integers.
        let addr = std::ptr::addr_of!(SEED_ANCHOR) as u64;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0x517c_c1b7_2722_0a95, |d| d.as_nanos() as u64);
        let seed = (addr.rotate_left(17) ^ nanos) | (1 << 32);

        Self {
            lock: Mutex::new(GlobalState {
                abort: false,
                buffers: IdTable::new(),
                listeners: IdTable::new(),
                error_sink: None,
            }),
            cond: Condvar::new(),
            id_counter: AtomicU64::new(seed),
            epoch: Instant::now(),
        }
    }
}

lazy_static! {
    static ref GLOBAL: Global = Global::new();
}

/// Hands out a fresh object id.
pub(crate) fn next_id() -> Id {
    GLOBAL.id_counter.fetch_add(1, Ordering::Relaxed)
}

/// Monotonic time in fractional seconds since an unspecified epoch.
pub fn time() -> f64 {
    GLOBAL.epoch.elapsed().as_secs_f64()
}

/// Blocks for the given number of fractional seconds, or until the
/// process-wide abort flag is raised.
pub fn sleep(seconds: f64) -> Result<()> {
    if seconds <= 0.0 {
        return Ok(());
    }
    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    let mut state = GLOBAL.lock.lock();
    loop {
        if state.abort {
            GLOBAL.cond.notify_all();
            return Err(Error::OperationAborted);
        }
        if Instant::now() >= deadline {
            return Ok(());
        }
        GLOBAL.cond.wait_until(&mut state, deadline);
    }
}

/// Raises (or clears) the process-wide abort flag and applies it to every
/// registered buffer and listener. While raised, blocking waits return
/// [`Error::OperationAborted`] and new objects cannot be created.
pub fn abort(flag: bool) {
    let mut state = GLOBAL.lock.lock();
    state.abort = flag;
    let buffers = state.buffers.collect();
    let listeners = state.listeners.collect();
    for buffer in &buffers {
        buffer.apply_abort(flag);
    }
    for listener in &listeners {
        listener.apply_abort(flag);
    }
    GLOBAL.cond.notify_all();
    drop(state);
    // The temporary strong references may be the last ones; their drop
    // glue retakes the global lock, so it must run after the unlock.
    drop(buffers);
    drop(listeners);
}

/// Reads the process-wide abort flag.
pub fn is_abort() -> bool {
    GLOBAL.lock.lock().abort
}

/// Installs (or removes) the sink that receives notifier callback errors.
pub fn set_error_sink(sink: Option<ErrorSink>) {
    GLOBAL.lock.lock().error_sink = sink;
}

pub(crate) fn report_notifier_error(err: &Error) {
    let sink = GLOBAL.lock.lock().error_sink.clone();
    if let Some(sink) = sink {
        sink(err);
    }
}

pub(crate) fn check_abort() -> Result<()> {
    if is_abort() {
        Err(Error::OperationAborted)
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------

pub(crate) fn register_buffer(shared: &Arc<BufferShared>) {
    let mut state = GLOBAL.lock.lock();
    state.buffers.insert(shared.id, shared.name.as_deref(), shared);
}

pub(crate) fn unregister_buffer(id: Id) {
    GLOBAL.lock.lock().buffers.remove(id);
}

pub(crate) fn register_listener(shared: &Arc<ListenerShared>) {
    let mut state = GLOBAL.lock.lock();
    state.listeners.insert(shared.id, shared.name.as_deref(), shared);
}

pub(crate) fn unregister_listener(id: Id) {
    GLOBAL.lock.lock().listeners.remove(id);
}

pub(crate) fn buffer_by_id(id: Id) -> Option<Arc<BufferShared>> {
    GLOBAL.lock.lock().buffers.get(id)
}

pub(crate) fn buffer_by_name(name: &[u8]) -> NameLookup<BufferShared> {
    GLOBAL.lock.lock().buffers.find_by_name(name)
}

pub(crate) fn listener_by_id(id: Id) -> Option<Arc<ListenerShared>> {
    GLOBAL.lock.lock().listeners.get(id)
}

pub(crate) fn listener_by_name(name: &[u8]) -> NameLookup<ListenerShared> {
    GLOBAL.lock.lock().listeners.find_by_name(name)
}
