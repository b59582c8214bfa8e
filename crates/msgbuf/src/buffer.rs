//! Message buffers: bounded or growable queues of serialized messages
//! with a single consumer and any number of producers.
//!
//! A buffer either owns its mutex/condvar pair (standalone) or lives
//! under the lock of the listener it is attached to — one lock guards a
//! listener and all of its attached buffers, which is what makes the
//! ready-list bookkeeping atomic with the queue operations.
//!
//! `Buffer` values are handles: cheap to hand out, safe to drop from any
//! thread, and backed by a shared object that unregisters itself when the
//! last handle goes away.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::codec;
use crate::codec::Value;
use crate::error::{Error, Result};
use crate::global;
use crate::invariants::{debug_assert_frame_accounting, debug_assert_ready_wellformed};
use crate::listener::{AttachedBuffer, ListenerShared, ListenerState};
use crate::membuf::{MemBuffer, ReserveError};
use crate::notify::{run_notifier, same_hook, NotifierKind, NotifierSlot, Notify, NotifyControl};
use crate::Id;

/// Construction parameters for a buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Optional name for registry lookup. Names need not be unique;
    /// looking up a shared name fails with [`Error::AmbiguousName`].
    pub name: Option<Vec<u8>>,
    /// Initial capacity of the message store in bytes.
    pub capacity: usize,
    /// Growth factor; a factor of at most 1 makes the buffer bounded.
    pub grow_factor: f64,
}

impl BufferConfig {
    pub fn new(capacity: usize, grow_factor: f64) -> Self {
        Self {
            name: None,
            capacity,
            grow_factor,
        }
    }

    pub fn with_name(mut self, name: impl Into<Vec<u8>>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self::new(1024, 2.0)
    }
}

// ---------------------------------------------------------------------
// GUARDED STATE
// ---------------------------------------------------------------------

/// Everything about a buffer that its lock protects.
pub(crate) struct BufferState {
    pub(crate) mem: MemBuffer,
    pub(crate) msg_count: usize,
    pub(crate) closed: bool,
    pub(crate) aborted: bool,
    /// Membership flag for the owning listener's ready list; stays false
    /// on standalone buffers.
    pub(crate) on_ready: bool,
    pub(crate) rise: Option<NotifierSlot>,
    pub(crate) fall: Option<NotifierSlot>,
}

impl BufferState {
    pub(crate) fn new(mem: MemBuffer) -> Self {
        Self {
            mem,
            msg_count: 0,
            closed: false,
            aborted: false,
            on_ready: false,
            rise: None,
            fall: None,
        }
    }

    /// Appends one frame. Returns the rise notifier to fire after the
    /// lock is released, if the post pushed the count over its threshold.
    pub(crate) fn put_frame(
        &mut self,
        payload: &[u8],
        replace: bool,
    ) -> Result<Option<Arc<dyn Notify>>> {
        if replace {
            self.mem.reset();
            self.msg_count = 0;
        }
        let (header, header_len) = codec::encode_header(payload.len());
        let total = header_len + payload.len();
        match self.mem.reserve(total) {
            Ok(()) => {}
            Err(ReserveError::NoGrow) => {
                return Err(if total <= self.mem.capacity() {
                    Error::Full
                } else {
                    Error::MessageSize {
                        size: total,
                        limit: self.mem.capacity(),
                    }
                });
            }
            Err(ReserveError::Alloc(bytes)) => return Err(Error::OutOfMemory(bytes)),
        }
        self.mem.extend_from_slice(&header[..header_len]);
        self.mem.extend_from_slice(payload);
        self.msg_count += 1;
        debug_assert_frame_accounting!(self);

        Ok(self
            .rise
            .as_ref()
            .filter(|slot| self.msg_count as i64 > slot.threshold)
            .map(|slot| Arc::clone(&slot.hook)))
    }

    /// Moves the head frame's payload into `out` and advances past it.
    /// Returns the payload length and the fall notifier to fire after the
    /// lock is released. The fall notifier compares against the count
    /// *after* the decrement; a threshold of zero or less always fires.
    pub(crate) fn take_frame(
        &mut self,
        out: &mut MemBuffer,
    ) -> Result<(usize, Option<Arc<dyn Notify>>)> {
        let (header_len, payload_len) = codec::parse_header(self.mem.bytes());
        out.reset();
        match out.reserve(payload_len) {
            Ok(()) => {}
            Err(ReserveError::NoGrow) => {
                return Err(Error::MessageSize {
                    size: payload_len,
                    limit: out.capacity(),
                });
            }
            Err(ReserveError::Alloc(bytes)) => return Err(Error::OutOfMemory(bytes)),
        }
        out.extend_from_slice(&self.mem.bytes()[header_len..header_len + payload_len]);
        self.mem.consume(header_len + payload_len);
        self.msg_count -= 1;
        debug_assert_frame_accounting!(self);

        let fall = self
            .fall
            .as_ref()
            .filter(|slot| slot.threshold <= 0 || (self.msg_count as i64) < slot.threshold)
            .map(|slot| Arc::clone(&slot.hook));
        Ok((payload_len, fall))
    }
}

/// Where a buffer's guarded state lives.
pub(crate) enum Place {
    /// Standalone: the buffer owns its mutex and condvar.
    Own {
        lock: Mutex<BufferState>,
        cond: Condvar,
    },
    /// Attached: the state sits inside the listener's lock, keyed by the
    /// buffer id. The strong reference keeps the listener alive for as
    /// long as any handle to this buffer exists.
    Attached { listener: Arc<ListenerShared> },
}

pub(crate) struct BufferShared {
    pub(crate) id: Id,
    pub(crate) name: Option<Box<[u8]>>,
    pub(crate) place: Place,
    /// Creation capacity and factor, reused for per-handle staging areas.
    pub(crate) stage_capacity: usize,
    pub(crate) stage_grow: f64,
}

/// A held lock over a buffer's state, either its own or the listener's.
pub(crate) enum Dock<'a> {
    Own {
        guard: MutexGuard<'a, BufferState>,
        cond: &'a Condvar,
    },
    Listener {
        guard: MutexGuard<'a, ListenerState>,
        cond: &'a Condvar,
        id: Id,
    },
}

impl<'a> Dock<'a> {
    fn state(&mut self) -> Result<&mut BufferState> {
        match self {
            Dock::Own { guard, .. } => Ok(&mut **guard),
            Dock::Listener { guard, id, .. } => guard
                .attached_mut(*id)
                .map(|a| &mut a.state)
                .ok_or(Error::ObjectClosed),
        }
    }

    /// Fails when the buffer (or its listener) is closed or aborted,
    /// waking any other waiters so they observe the transition too.
    fn check_open(&mut self) -> Result<()> {
        let listener_aborted = match self {
            Dock::Own { .. } => false,
            Dock::Listener { guard, .. } => guard.aborted,
        };
        let (closed, aborted) = {
            let state = self.state()?;
            (state.closed, state.aborted)
        };
        if closed {
            self.notify_all();
            return Err(Error::ObjectClosed);
        }
        if aborted || listener_aborted {
            self.notify_all();
            return Err(Error::OperationAborted);
        }
        Ok(())
    }

    fn mark_ready(&mut self) {
        if let Dock::Listener { guard, id, .. } = self {
            let id = *id;
            guard.mark_ready(id);
            debug_assert_ready_wellformed!(&**guard);
        }
    }

    fn unmark_ready(&mut self) {
        if let Dock::Listener { guard, id, .. } = self {
            let id = *id;
            guard.unmark_ready(id);
            debug_assert_ready_wellformed!(&**guard);
        }
    }

    fn notify_one(&self) {
        match self {
            Dock::Own { cond, .. } | Dock::Listener { cond, .. } => cond.notify_one(),
        };
    }

    fn notify_all(&self) {
        match self {
            Dock::Own { cond, .. } | Dock::Listener { cond, .. } => cond.notify_all(),
        };
    }

    fn wait(&mut self) {
        match self {
            Dock::Own { guard, cond } => cond.wait(guard),
            Dock::Listener { guard, cond, .. } => cond.wait(guard),
        }
    }

    fn wait_until(&mut self, deadline: Instant) {
        match self {
            Dock::Own { guard, cond } => {
                cond.wait_until(guard, deadline);
            }
            Dock::Listener { guard, cond, .. } => {
                cond.wait_until(guard, deadline);
            }
        }
    }
}

impl BufferShared {
    pub(crate) fn dock(&self) -> Dock<'_> {
        match &self.place {
            Place::Own { lock, cond } => Dock::Own {
                guard: lock.lock(),
                cond,
            },
            Place::Attached { listener } => Dock::Listener {
                guard: listener.lock.lock(),
                cond: &listener.cond,
                id: self.id,
            },
        }
    }

    /// Appends one frame built from `payload`, with the full producer
    /// protocol: state checks, optional clear, ready-list insert, wakeup
    /// and rise-notifier dispatch outside the lock.
    pub(crate) fn post_payload(&self, payload: &[u8], replace: bool) -> Result<()> {
        let mut dock = self.dock();
        dock.check_open()?;
        let rise = dock.state()?.put_frame(payload, replace)?;
        dock.mark_ready();
        dock.notify_one();
        drop(dock);

        if let Some(hook) = rise {
            run_notifier(hook, |h| self.clear_notifier_if(NotifierKind::Rise, h));
        }
        Ok(())
    }

    /// Extracts the next frame's payload into `out`, waiting according to
    /// `nonblock`/`timeout`. `Ok(None)` means the wait ran out; state
    /// transitions surface as errors on every wakeup.
    pub(crate) fn fetch_frame(
        &self,
        nonblock: bool,
        timeout: Option<Duration>,
        out: &mut MemBuffer,
    ) -> Result<Option<usize>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut dock = self.dock();
        loop {
            dock.check_open()?;
            if !dock.state()?.mem.is_empty() {
                let (payload_len, fall) = dock.state()?.take_frame(out)?;
                if dock.state()?.mem.is_empty() {
                    dock.unmark_ready();
                } else {
                    // Another waiter may consume the rest.
                    dock.notify_one();
                }
                drop(dock);

                if let Some(hook) = fall {
                    run_notifier(hook, |h| self.clear_notifier_if(NotifierKind::Fall, h));
                }
                return Ok(Some(payload_len));
            }
            match deadline {
                Some(at) => {
                    if Instant::now() >= at {
                        return Ok(None);
                    }
                    dock.wait_until(at);
                }
                None => {
                    if nonblock {
                        return Ok(None);
                    }
                    dock.wait();
                }
            }
        }
    }

    /// Detaches the notifier slot if it still holds exactly this hook.
    /// The returned slot must be dropped after the lock is gone, which
    /// `run_notifier` guarantees.
    fn clear_notifier_if(
        &self,
        kind: NotifierKind,
        hook: &Arc<dyn Notify>,
    ) -> Option<NotifierSlot> {
        let mut dock = self.dock();
        let state = dock.state().ok()?;
        let slot = match kind {
            NotifierKind::Rise => &mut state.rise,
            NotifierKind::Fall => &mut state.fall,
        };
        if same_hook(slot, hook) {
            slot.take()
        } else {
            None
        }
    }

    /// Process-wide abort propagation. Attached buffers are covered by
    /// their listener's pass, which already holds the right lock.
    pub(crate) fn apply_abort(&self, flag: bool) {
        if let Place::Own { lock, cond } = &self.place {
            let mut state = lock.lock();
            if !state.closed {
                state.aborted = flag;
            }
            cond.notify_all();
        }
    }
}

impl Drop for BufferShared {
    fn drop(&mut self) {
        global::unregister_buffer(self.id);
        if let Place::Attached { listener } = &self.place {
            // With no handles left the buffer is unreachable: leave it for
            // the listener's consume path while it still has queued
            // messages, detach it right away otherwise.
            let mut reaped = None;
            let mut guard = listener.lock.lock();
            if let Some(pos) = guard.attached.iter().position(|a| a.id == self.id) {
                if guard.attached[pos].state.on_ready {
                    guard.attached[pos].unreachable = true;
                } else {
                    reaped = Some(guard.attached.remove(pos));
                }
            }
            drop(guard);
            drop(reaped);
        }
    }
}

// ---------------------------------------------------------------------
// HANDLE
// ---------------------------------------------------------------------

/// A handle to a message buffer.
///
/// Handles hold a per-handle staging area and non-blocking flag; the
/// queue itself is shared. Obtain more handles with [`Buffer::try_clone`]
/// or by registry lookup.
pub struct Buffer {
    pub(crate) shared: Arc<BufferShared>,
    pub(crate) nonblock: bool,
    tmp: MemBuffer,
}

pub(crate) fn create(
    config: BufferConfig,
    listener: Option<&Arc<ListenerShared>>,
) -> Result<Buffer> {
    global::check_abort()?;
    let id = global::next_id();
    let mem = MemBuffer::new(config.capacity, config.grow_factor).map_err(Error::OutOfMemory)?;
    let tmp = MemBuffer::new(config.capacity, config.grow_factor).map_err(Error::OutOfMemory)?;
    let state = BufferState::new(mem);

    let place = match listener {
        None => Place::Own {
            lock: Mutex::new(state),
            cond: Condvar::new(),
        },
        Some(shared) => {
            let mut guard = shared.lock.lock();
            if guard.closed {
                return Err(Error::ObjectClosed);
            }
            if guard.aborted {
                return Err(Error::OperationAborted);
            }
            guard.attached.push(AttachedBuffer {
                id,
                state,
                unreachable: false,
            });
            shared.cond.notify_all();
            drop(guard);
            Place::Attached {
                listener: Arc::clone(shared),
            }
        }
    };

    let shared = Arc::new(BufferShared {
        id,
        name: config.name.map(Into::into),
        place,
        stage_capacity: config.capacity,
        stage_grow: config.grow_factor,
    });
    global::register_buffer(&shared);
    Ok(Buffer {
        shared,
        nonblock: false,
        tmp,
    })
}

impl Buffer {
    /// Creates a standalone buffer and registers it.
    pub fn new(config: BufferConfig) -> Result<Buffer> {
        create(config, None)
    }

    fn from_shared(shared: Arc<BufferShared>) -> Result<Buffer> {
        let tmp =
            MemBuffer::new(shared.stage_capacity, shared.stage_grow).map_err(Error::OutOfMemory)?;
        Ok(Buffer {
            shared,
            nonblock: false,
            tmp,
        })
    }

    /// Looks up a registered buffer by id.
    pub fn by_id(id: Id) -> Result<Buffer> {
        global::check_abort()?;
        let shared = global::buffer_by_id(id)
            .ok_or_else(|| Error::UnknownObject(format!("buffer id {id}")))?;
        Buffer::from_shared(shared)
    }

    /// Looks up a registered buffer by name. Fails with
    /// [`Error::AmbiguousName`] when several live buffers share it.
    pub fn by_name(name: &[u8]) -> Result<Buffer> {
        global::check_abort()?;
        match global::buffer_by_name(name) {
            crate::registry::NameLookup::Unique(shared) => Buffer::from_shared(shared),
            crate::registry::NameLookup::Missing => Err(Error::UnknownObject(format!(
                "buffer name \"{}\"",
                String::from_utf8_lossy(name)
            ))),
            crate::registry::NameLookup::Ambiguous => Err(Error::AmbiguousName(format!(
                "buffer name \"{}\"",
                String::from_utf8_lossy(name)
            ))),
        }
    }

    /// A second handle to the same buffer, with its own staging area and
    /// a cleared non-blocking flag.
    pub fn try_clone(&self) -> Result<Buffer> {
        Buffer::from_shared(Arc::clone(&self.shared))
    }

    pub fn id(&self) -> Id {
        self.shared.id
    }

    pub fn name(&self) -> Option<&[u8]> {
        self.shared.name.as_deref()
    }

    fn stage_payload(&mut self, values: &[Value]) -> Result<()> {
        let size = codec::payload_size(values);
        self.tmp.reset();
        match self.tmp.reserve(size) {
            Ok(()) => {}
            Err(ReserveError::NoGrow) => {
                return Err(Error::MessageSize {
                    size,
                    limit: self.tmp.capacity(),
                });
            }
            Err(ReserveError::Alloc(bytes)) => return Err(Error::OutOfMemory(bytes)),
        }
        codec::encode_payload(values, self.tmp.grow_slice(size));
        Ok(())
    }

    /// Appends one message built from `values`.
    ///
    /// A bounded buffer that cannot take the frame answers
    /// [`Error::Full`] if the frame would fit an empty buffer, otherwise
    /// [`Error::MessageSize`]. Producers never block.
    pub fn add_msg(&mut self, values: &[Value]) -> Result<()> {
        self.stage_payload(values)?;
        self.shared.post_payload(self.tmp.bytes(), false)
    }

    /// Replaces the whole content with one message built from `values`.
    pub fn set_msg(&mut self, values: &[Value]) -> Result<()> {
        self.stage_payload(values)?;
        self.shared.post_payload(self.tmp.bytes(), true)
    }

    /// Takes the next message, waiting up to `timeout` (forever when
    /// `None`, unless this handle is non-blocking). `Ok(None)` means no
    /// message arrived in time.
    pub fn next_msg(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<Value>>> {
        match self
            .shared
            .fetch_frame(self.nonblock, timeout, &mut self.tmp)?
        {
            Some(_) => {
                let (values, _) = codec::decode_payload(self.tmp.bytes(), None)?;
                Ok(Some(values))
            }
            None => Ok(None),
        }
    }

    /// Discards all stored messages. No notifier fires.
    pub fn clear(&self) -> Result<()> {
        let mut dock = self.shared.dock();
        let state = dock.state()?;
        if state.closed {
            return Err(Error::ObjectClosed);
        }
        state.mem.reset();
        state.msg_count = 0;
        dock.unmark_ready();
        Ok(())
    }

    /// Closes the buffer: terminal, frees the stored messages, wakes all
    /// waiters. Every later call fails with [`Error::ObjectClosed`].
    pub fn close(&self) {
        let mut detached = (None, None);
        {
            let mut dock = self.shared.dock();
            if let Ok(state) = dock.state() {
                state.closed = true;
                state.mem.release();
                state.msg_count = 0;
                detached = (state.rise.take(), state.fall.take());
                dock.unmark_ready();
                dock.notify_all();
            }
        }
        drop(detached);
    }

    /// Registers the notifier watching the given occupancy transition.
    /// Each kind has one slot: a present notifier must be removed with
    /// [`Buffer::clear_notifier`] before a new one can be set.
    pub fn set_notifier(
        &self,
        kind: NotifierKind,
        hook: Arc<dyn Notify>,
        threshold: i64,
    ) -> Result<()> {
        // Kept outside the lock scope: dropping the hook may release a
        // buffer, whose drop glue takes the global lock.
        let mut incoming = Some(hook);
        let result = {
            let mut dock = self.shared.dock();
            match dock.state() {
                Err(err) => Err(err),
                Ok(state) if state.closed => Err(Error::ObjectClosed),
                Ok(state) => {
                    let slot = match kind {
                        NotifierKind::Rise => &mut state.rise,
                        NotifierKind::Fall => &mut state.fall,
                    };
                    if slot.is_some() {
                        Err(Error::HasNotifier)
                    } else {
                        *slot = incoming.take().map(|hook| NotifierSlot { hook, threshold });
                        Ok(())
                    }
                }
            }
        };
        drop(incoming);
        result
    }

    /// Removes the notifier of the given kind, if any.
    pub fn clear_notifier(&self, kind: NotifierKind) -> Result<()> {
        let detached;
        let result = {
            let mut dock = self.shared.dock();
            match dock.state() {
                Err(err) => {
                    detached = None;
                    Err(err)
                }
                Ok(state) if state.closed => {
                    detached = None;
                    Err(Error::ObjectClosed)
                }
                Ok(state) => {
                    detached = match kind {
                        NotifierKind::Rise => state.rise.take(),
                        NotifierKind::Fall => state.fall.take(),
                    };
                    Ok(())
                }
            }
        };
        drop(detached);
        result
    }

    /// Number of complete messages currently stored.
    pub fn msg_count(&self) -> usize {
        match &self.shared.place {
            Place::Own { lock, .. } => lock.lock().msg_count,
            Place::Attached { listener } => listener
                .lock
                .lock()
                .attached_ref(self.shared.id)
                .map_or(0, |a| a.state.msg_count),
        }
    }

    /// Raises or clears this buffer's abort flag. Raising unlinks the
    /// buffer from its listener's ready list without discarding messages;
    /// clearing relinks it when messages are stored.
    pub fn set_abort(&self, flag: bool) {
        match &self.shared.place {
            Place::Own { lock, cond } => {
                let mut state = lock.lock();
                if !state.closed {
                    state.aborted = flag;
                }
                cond.notify_all();
            }
            Place::Attached { listener } => {
                let mut guard = listener.lock.lock();
                guard.set_buffer_abort(self.shared.id, flag);
                debug_assert_ready_wellformed!(&*guard);
                drop(guard);
                listener.cond.notify_all();
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        match &self.shared.place {
            Place::Own { lock, .. } => lock.lock().aborted,
            Place::Attached { listener } => {
                let guard = listener.lock.lock();
                guard.aborted
                    || guard
                        .attached_ref(self.shared.id)
                        .is_some_and(|a| a.state.aborted)
            }
        }
    }

    /// Makes consumer calls on this handle return immediately instead of
    /// waiting (explicit timeouts still wait).
    pub fn set_nonblock(&mut self, nonblock: bool) {
        self.nonblock = nonblock;
    }

    pub fn is_nonblock(&self) -> bool {
        self.nonblock
    }
}

/// A buffer can serve as another buffer's notifier: notification posts an
/// empty message, and a closed target asks to be removed.
impl Notify for Buffer {
    fn notify(&self) -> Result<NotifyControl> {
        match self.shared.post_payload(&[], false) {
            Ok(()) => Ok(NotifyControl::Keep),
            Err(Error::ObjectClosed) => Ok(NotifyControl::Remove),
            Err(err) => Err(err),
        }
    }
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shared.name {
            Some(name) => write!(
                f,
                "msgbuf.buffer(name=\"{}\", id={})",
                String::from_utf8_lossy(name),
                self.shared.id
            ),
            None => write!(f, "msgbuf.buffer(id={})", self.shared.id),
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name.as_deref().map(String::from_utf8_lossy))
            .field("nonblock", &self.nonblock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_then_next_roundtrip() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        b.add_msg(&[Value::Integer(1), "hi".into(), Value::Boolean(true)])
            .unwrap();
        assert_eq!(b.msg_count(), 1);

        let got = b.next_msg(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(
            got,
            vec![Value::Integer(1), "hi".into(), Value::Boolean(true)]
        );
        assert_eq!(b.msg_count(), 0);
    }

    #[test]
    fn test_messages_are_fifo() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        for i in 0..5 {
            b.add_msg(&[Value::Integer(i)]).unwrap();
        }
        for i in 0..5 {
            let got = b.next_msg(None).unwrap().unwrap();
            assert_eq!(got, vec![Value::Integer(i)]);
        }
    }

    #[test]
    fn test_set_msg_replaces_content() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        b.add_msg(&[Value::Integer(1)]).unwrap();
        b.add_msg(&[Value::Integer(2)]).unwrap();
        b.set_msg(&[Value::Integer(99)]).unwrap();
        assert_eq!(b.msg_count(), 1);
        let got = b.next_msg(None).unwrap().unwrap();
        assert_eq!(got, vec![Value::Integer(99)]);
    }

    #[test]
    fn test_bounded_full_versus_oversized() {
        // 8-byte frames: header (1) + tag/len (2) + 5 bytes of string.
        let msg = [Value::Bytes(b"abcde".to_vec())];
        let mut b = Buffer::new(BufferConfig::new(16, 1.0)).unwrap();
        b.add_msg(&msg).unwrap();
        b.add_msg(&msg).unwrap();
        assert_eq!(b.add_msg(&msg), Err(Error::Full));
        assert_eq!(b.msg_count(), 2);

        // A frame that could never fit reports its size instead.
        let huge = [Value::Bytes(vec![b'x'; 32])];
        assert!(matches!(
            b.add_msg(&huge),
            Err(Error::MessageSize { .. })
        ));
    }

    #[test]
    fn test_empty_message_counts() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        b.add_msg(&[]).unwrap();
        assert_eq!(b.msg_count(), 1);
        assert_eq!(b.next_msg(None).unwrap(), Some(Vec::new()));
        assert_eq!(b.msg_count(), 0);
    }

    #[test]
    fn test_nonblock_consumer_returns_immediately() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        b.set_nonblock(true);
        assert!(b.is_nonblock());
        assert_eq!(b.next_msg(None).unwrap(), None);
    }

    #[test]
    fn test_timeout_expires_on_empty_buffer() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        let got = b.next_msg(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn test_close_is_sticky() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        b.add_msg(&[Value::Integer(5)]).unwrap();
        b.close();
        assert_eq!(b.add_msg(&[Value::Nil]), Err(Error::ObjectClosed));
        assert_eq!(b.next_msg(None), Err(Error::ObjectClosed));
        assert_eq!(b.clear(), Err(Error::ObjectClosed));
        assert_eq!(b.msg_count(), 0);
    }

    #[test]
    fn test_abort_is_reversible() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        b.add_msg(&[Value::Integer(5)]).unwrap();
        b.set_abort(true);
        assert!(b.is_aborted());
        assert_eq!(b.add_msg(&[Value::Nil]), Err(Error::OperationAborted));
        assert_eq!(b.next_msg(None), Err(Error::OperationAborted));

        b.set_abort(false);
        assert!(!b.is_aborted());
        // Stored messages survived the abort window.
        assert_eq!(
            b.next_msg(None).unwrap(),
            Some(vec![Value::Integer(5)])
        );
    }

    #[test]
    fn test_clear_discards_messages() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        b.add_msg(&[Value::Integer(1)]).unwrap();
        b.add_msg(&[Value::Integer(2)]).unwrap();
        b.clear().unwrap();
        assert_eq!(b.msg_count(), 0);
        assert_eq!(b.next_msg(Some(Duration::ZERO)).unwrap(), None);
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let mut b = Buffer::new(
            BufferConfig::default().with_name(b"lookup-test-buffer".as_slice()),
        )
        .unwrap();
        let mut again = Buffer::by_id(b.id()).unwrap();
        b.add_msg(&[Value::Integer(7)]).unwrap();
        assert_eq!(
            again.next_msg(None).unwrap(),
            Some(vec![Value::Integer(7)])
        );

        let by_name = Buffer::by_name(b"lookup-test-buffer").unwrap();
        assert_eq!(by_name.id(), b.id());
        assert!(matches!(
            Buffer::by_name(b"no-such-buffer"),
            Err(Error::UnknownObject(_))
        ));
    }

    #[test]
    fn test_duplicate_names_are_ambiguous_lazily() {
        let _a = Buffer::new(BufferConfig::default().with_name(b"dup-name".as_slice())).unwrap();
        let _b = Buffer::new(BufferConfig::default().with_name(b"dup-name".as_slice())).unwrap();
        assert!(matches!(
            Buffer::by_name(b"dup-name"),
            Err(Error::AmbiguousName(_))
        ));
    }

    #[test]
    fn test_notifier_slot_is_exclusive() {
        let b = Buffer::new(BufferConfig::default()).unwrap();
        let target = Arc::new(Buffer::new(BufferConfig::default()).unwrap());
        let other = Arc::new(Buffer::new(BufferConfig::default()).unwrap());

        b.set_notifier(NotifierKind::Rise, target.clone(), 0).unwrap();
        assert_eq!(
            b.set_notifier(NotifierKind::Rise, other.clone(), 0),
            Err(Error::HasNotifier)
        );
        // The fall slot is independent.
        b.set_notifier(NotifierKind::Fall, other, 0).unwrap();
        // Clearing makes room.
        b.clear_notifier(NotifierKind::Rise).unwrap();
        b.set_notifier(NotifierKind::Rise, target, 3).unwrap();
    }

    #[test]
    fn test_rise_notifier_fires_above_threshold() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        let wake = Arc::new(Buffer::new(BufferConfig::default()).unwrap());
        b.set_notifier(NotifierKind::Rise, wake.clone(), 3).unwrap();

        for i in 1..=3 {
            b.add_msg(&[Value::Integer(i)]).unwrap();
        }
        assert_eq!(wake.msg_count(), 0);
        b.add_msg(&[Value::Integer(4)]).unwrap();
        assert_eq!(wake.msg_count(), 1);

        // Consuming below and crossing again re-fires.
        b.next_msg(None).unwrap();
        b.add_msg(&[Value::Integer(5)]).unwrap();
        assert_eq!(wake.msg_count(), 2);
    }

    #[test]
    fn test_fall_notifier_fires_below_threshold() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        let wake = Arc::new(Buffer::new(BufferConfig::default()).unwrap());
        b.set_notifier(NotifierKind::Fall, wake.clone(), 2).unwrap();

        for i in 0..3 {
            b.add_msg(&[Value::Integer(i)]).unwrap();
        }
        b.next_msg(None).unwrap(); // 3 -> 2: not below threshold
        assert_eq!(wake.msg_count(), 0);
        b.next_msg(None).unwrap(); // 2 -> 1: below
        assert_eq!(wake.msg_count(), 1);
        b.next_msg(None).unwrap(); // 1 -> 0: below
        assert_eq!(wake.msg_count(), 2);
    }

    #[test]
    fn test_closed_notifier_target_is_removed() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        let wake = Arc::new(Buffer::new(BufferConfig::default()).unwrap());
        b.set_notifier(NotifierKind::Rise, wake.clone(), 0).unwrap();

        wake.close();
        b.add_msg(&[Value::Nil]).unwrap();
        // The slot cleared itself; a new notifier can be set directly.
        b.set_notifier(NotifierKind::Rise, wake, 0).unwrap();
    }

    #[test]
    fn test_display_formats() {
        let named =
            Buffer::new(BufferConfig::default().with_name(b"fmt".as_slice())).unwrap();
        assert_eq!(
            named.to_string(),
            format!("msgbuf.buffer(name=\"fmt\", id={})", named.id())
        );
        let anon = Buffer::new(BufferConfig::default()).unwrap();
        assert_eq!(anon.to_string(), format!("msgbuf.buffer(id={})", anon.id()));
    }
}
