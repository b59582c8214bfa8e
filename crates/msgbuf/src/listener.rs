//! Listeners: fan-in aggregation over a set of attached buffers.
//!
//! One lock guards the listener and the state of every buffer attached to
//! it, so ready-list membership can never go stale: a buffer is on the
//! ready list exactly while it is attached, open, not aborted and holds
//! at least one message. The ready list is FIFO over buffers; a buffer
//! that still has messages after a consume is rotated to the tail.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::buffer::{self, Buffer, BufferConfig, BufferState};
use crate::codec;
use crate::codec::Value;
use crate::error::{Error, Result};
use crate::global;
use crate::invariants::debug_assert_ready_wellformed;
use crate::membuf::MemBuffer;
use crate::notify::{run_notifier, same_hook, NotifierKind, NotifierSlot, Notify};
use crate::Id;

/// The state of one attached buffer, owned by its listener's lock.
pub(crate) struct AttachedBuffer {
    pub(crate) id: Id,
    pub(crate) state: BufferState,
    /// Set when the last user handle dropped while messages were still
    /// queued; the consume path detaches the entry once it drains.
    pub(crate) unreachable: bool,
}

pub(crate) struct ListenerState {
    pub(crate) closed: bool,
    pub(crate) aborted: bool,
    /// Attached buffers in attachment order.
    pub(crate) attached: Vec<AttachedBuffer>,
    /// Ids of attached buffers with queued messages, FIFO.
    pub(crate) ready: VecDeque<Id>,
}

impl ListenerState {
    pub(crate) fn attached_ref(&self, id: Id) -> Option<&AttachedBuffer> {
        self.attached.iter().find(|a| a.id == id)
    }

    pub(crate) fn attached_mut(&mut self, id: Id) -> Option<&mut AttachedBuffer> {
        self.attached.iter_mut().find(|a| a.id == id)
    }

    /// Puts a readable buffer on the ready tail unless it is already
    /// listed.
    pub(crate) fn mark_ready(&mut self, id: Id) {
        let listed = self.attached_mut(id).is_some_and(|a| {
            if !a.state.on_ready
                && !a.state.closed
                && !a.state.aborted
                && !a.state.mem.is_empty()
            {
                a.state.on_ready = true;
                true
            } else {
                false
            }
        });
        if listed {
            self.ready.push_back(id);
        }
    }

    pub(crate) fn unmark_ready(&mut self, id: Id) {
        if let Some(a) = self.attached_mut(id) {
            a.state.on_ready = false;
        }
        self.ready.retain(|&x| x != id);
    }

    /// Flips one attached buffer's abort flag, maintaining its ready-list
    /// membership: raising unlinks, clearing relinks a non-empty buffer.
    pub(crate) fn set_buffer_abort(&mut self, id: Id, flag: bool) {
        let present = match self.attached_mut(id) {
            Some(a) if !a.state.closed => {
                a.state.aborted = flag;
                true
            }
            _ => false,
        };
        if !present {
            return;
        }
        if flag {
            self.unmark_ready(id);
        } else {
            self.mark_ready(id);
        }
    }

    /// Detaches an unreachable, unlinked entry. The caller must drop the
    /// returned entry only after releasing the listener lock.
    pub(crate) fn reclaim_unreachable(&mut self, id: Id) -> Option<AttachedBuffer> {
        let pos = self
            .attached
            .iter()
            .position(|a| a.id == id && a.unreachable && !a.state.on_ready)?;
        Some(self.attached.remove(pos))
    }
}

pub(crate) struct ListenerShared {
    pub(crate) id: Id,
    pub(crate) name: Option<Box<[u8]>>,
    pub(crate) lock: Mutex<ListenerState>,
    pub(crate) cond: Condvar,
}

impl ListenerShared {
    /// Extracts the next frame from the first ready buffer, applying the
    /// same wait protocol as the buffer consumer.
    pub(crate) fn fetch_frame(
        &self,
        nonblock: bool,
        timeout: Option<Duration>,
        out: &mut MemBuffer,
    ) -> Result<Option<usize>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        // Declared before the guard so entries detached while the lock is
        // held are dropped only after it is released.
        let mut reaped: Vec<AttachedBuffer> = Vec::new();
        let mut guard = self.lock.lock();
        loop {
            if guard.closed {
                self.cond.notify_all();
                return Err(Error::ObjectClosed);
            }
            if guard.aborted {
                self.cond.notify_all();
                return Err(Error::OperationAborted);
            }
            if !guard.attached.iter().any(|a| !a.state.closed) {
                self.cond.notify_all();
                return Err(Error::NoBuffers);
            }

            while let Some(&id) = guard.ready.front() {
                let readable = guard.attached_ref(id).is_some_and(|a| {
                    !a.state.closed && !a.state.aborted && !a.state.mem.is_empty()
                });
                if !readable {
                    guard.ready.pop_front();
                    if let Some(a) = guard.attached_mut(id) {
                        a.state.on_ready = false;
                    }
                    if let Some(entry) = guard.reclaim_unreachable(id) {
                        reaped.push(entry);
                    }
                    continue;
                }

                let (payload_len, fall) = match guard.attached_mut(id) {
                    Some(a) => a.state.take_frame(out)?,
                    None => {
                        guard.ready.pop_front();
                        continue;
                    }
                };
                guard.ready.pop_front();
                let emptied = guard.attached_mut(id).map_or(true, |a| {
                    if a.state.mem.is_empty() {
                        a.state.on_ready = false;
                        true
                    } else {
                        false
                    }
                });
                if emptied {
                    if let Some(entry) = guard.reclaim_unreachable(id) {
                        reaped.push(entry);
                    }
                } else {
                    // Still has messages: rotate to the ready tail so the
                    // other buffers get their turn first.
                    guard.ready.push_back(id);
                }
                debug_assert_ready_wellformed!(&*guard);
                if !guard.ready.is_empty() {
                    self.cond.notify_one();
                }
                drop(guard);
                drop(reaped);

                if let Some(hook) = fall {
                    run_notifier(hook, |h| {
                        self.clear_buffer_notifier(id, NotifierKind::Fall, h)
                    });
                }
                return Ok(Some(payload_len));
            }

            match deadline {
                Some(at) => {
                    if Instant::now() >= at {
                        return Ok(None);
                    }
                    self.cond.wait_until(&mut guard, at);
                }
                None => {
                    if nonblock {
                        return Ok(None);
                    }
                    self.cond.wait(&mut guard);
                }
            }
        }
    }

    /// Detaches a consumed buffer's notifier slot if it still holds this
    /// hook; `run_notifier` drops the returned slot outside the lock.
    fn clear_buffer_notifier(
        &self,
        id: Id,
        kind: NotifierKind,
        hook: &Arc<dyn Notify>,
    ) -> Option<NotifierSlot> {
        let mut guard = self.lock.lock();
        let a = guard.attached_mut(id)?;
        let slot = match kind {
            NotifierKind::Rise => &mut a.state.rise,
            NotifierKind::Fall => &mut a.state.fall,
        };
        if same_hook(slot, hook) {
            slot.take()
        } else {
            None
        }
    }

    /// Raises or clears the listener abort flag and propagates it to
    /// every attached buffer whose flag differs.
    pub(crate) fn apply_abort(&self, flag: bool) {
        let mut guard = self.lock.lock();
        guard.aborted = flag;
        let ids: Vec<Id> = guard
            .attached
            .iter()
            .filter(|a| !a.state.closed && a.state.aborted != flag)
            .map(|a| a.id)
            .collect();
        for id in ids {
            guard.set_buffer_abort(id, flag);
        }
        debug_assert_ready_wellformed!(&*guard);
        drop(guard);
        self.cond.notify_all();
    }
}

impl Drop for ListenerShared {
    fn drop(&mut self) {
        global::unregister_listener(self.id);
        // The attached entries (including any still-unreachable ones) go
        // down with the state, after this body, with no lock held.
    }
}

// ---------------------------------------------------------------------
// HANDLE
// ---------------------------------------------------------------------

/// A handle to a listener, the single consumer over a set of attached
/// buffers.
pub struct Listener {
    pub(crate) shared: Arc<ListenerShared>,
    pub(crate) nonblock: bool,
    tmp: MemBuffer,
}

impl Listener {
    /// Creates a listener and registers it.
    pub fn new(name: Option<&[u8]>) -> Result<Listener> {
        global::check_abort()?;
        let shared = Arc::new(ListenerShared {
            id: global::next_id(),
            name: name.map(Into::into),
            lock: Mutex::new(ListenerState {
                closed: false,
                aborted: false,
                attached: Vec::new(),
                ready: VecDeque::new(),
            }),
            cond: Condvar::new(),
        });
        global::register_listener(&shared);
        Ok(Listener {
            shared,
            nonblock: false,
            tmp: MemBuffer::new(0, 2.0).map_err(Error::OutOfMemory)?,
        })
    }

    fn from_shared(shared: Arc<ListenerShared>) -> Result<Listener> {
        Ok(Listener {
            shared,
            nonblock: false,
            tmp: MemBuffer::new(0, 2.0).map_err(Error::OutOfMemory)?,
        })
    }

    /// Looks up a registered listener by id.
    pub fn by_id(id: Id) -> Result<Listener> {
        global::check_abort()?;
        let shared = global::listener_by_id(id)
            .ok_or_else(|| Error::UnknownObject(format!("listener id {id}")))?;
        Listener::from_shared(shared)
    }

    /// Looks up a registered listener by name.
    pub fn by_name(name: &[u8]) -> Result<Listener> {
        global::check_abort()?;
        match global::listener_by_name(name) {
            crate::registry::NameLookup::Unique(shared) => Listener::from_shared(shared),
            crate::registry::NameLookup::Missing => Err(Error::UnknownObject(format!(
                "listener name \"{}\"",
                String::from_utf8_lossy(name)
            ))),
            crate::registry::NameLookup::Ambiguous => Err(Error::AmbiguousName(format!(
                "listener name \"{}\"",
                String::from_utf8_lossy(name)
            ))),
        }
    }

    /// A second handle to the same listener.
    pub fn try_clone(&self) -> Result<Listener> {
        Listener::from_shared(Arc::clone(&self.shared))
    }

    pub fn id(&self) -> Id {
        self.shared.id
    }

    pub fn name(&self) -> Option<&[u8]> {
        self.shared.name.as_deref()
    }

    /// Creates a buffer attached to this listener. The buffer's state is
    /// guarded by this listener's lock and its messages are delivered
    /// through [`Listener::next_msg`].
    pub fn new_buffer(&self, config: BufferConfig) -> Result<Buffer> {
        buffer::create(config, Some(&self.shared))
    }

    /// Takes the next message from any ready attached buffer, waiting up
    /// to `timeout`. Messages within one buffer arrive in order; across
    /// buffers the ready list decides, first ready first.
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

    /// Empties every attached buffer and the ready list.
    pub fn clear(&self) -> Result<()> {
        let mut reaped: Vec<AttachedBuffer> = Vec::new();
        let mut guard = self.shared.lock.lock();
        if guard.closed {
            return Err(Error::ObjectClosed);
        }
        for a in &mut guard.attached {
            a.state.mem.reset();
            a.state.msg_count = 0;
            a.state.on_ready = false;
        }
        guard.ready.clear();
        let mut i = 0;
        while i < guard.attached.len() {
            if guard.attached[i].unreachable {
                reaped.push(guard.attached.remove(i));
            } else {
                i += 1;
            }
        }
        debug_assert_ready_wellformed!(&*guard);
        drop(guard);
        drop(reaped);
        Ok(())
    }

    /// Closes the listener and every attached buffer, freeing their
    /// stored messages and waking all waiters. Terminal.
    pub fn close(&self) {
        let mut detached: Vec<NotifierSlot> = Vec::new();
        let mut reaped: Vec<AttachedBuffer> = Vec::new();
        let mut guard = self.shared.lock.lock();
        guard.closed = true;
        for a in &mut guard.attached {
            a.state.closed = true;
            a.state.mem.release();
            a.state.msg_count = 0;
            a.state.on_ready = false;
            detached.extend(a.state.rise.take());
            detached.extend(a.state.fall.take());
        }
        guard.ready.clear();
        let mut i = 0;
        while i < guard.attached.len() {
            if guard.attached[i].unreachable {
                reaped.push(guard.attached.remove(i));
            } else {
                i += 1;
            }
        }
        self.shared.cond.notify_all();
        drop(guard);
        drop(reaped);
        drop(detached);
    }

    /// Raises or clears the abort flag, propagating to every attached
    /// buffer.
    pub fn set_abort(&self, flag: bool) {
        self.shared.apply_abort(flag);
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.lock.lock().aborted
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

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shared.name {
            Some(name) => write!(
                f,
                "msgbuf.listener(name=\"{}\", id={})",
                String::from_utf8_lossy(name),
                self.shared.id
            ),
            None => write!(f, "msgbuf.listener(id={})", self.shared.id),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name.as_deref().map(String::from_utf8_lossy))
            .field("nonblock", &self.nonblock)
            .finish()
    }
}
