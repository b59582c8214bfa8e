//! msgbuf - Message Buffers Between Threads
//!
//! An in-process message-passing substrate: threads exchange typed,
//! self-describing binary messages through named, reference-counted
//! queue objects.
//!
//! Two queue shapes are provided. A [`Buffer`] is a bounded or growable
//! queue read by a single consumer. A [`Listener`] aggregates several
//! attached buffers and hands its consumer the next ready message from
//! any of them. Buffers can carry notifiers that fire when their
//! occupancy crosses a threshold, so schedulers can be woken without
//! polling.
//!
//! # Key Features
//!
//! - Self-describing frame encoding with compact forms for small
//!   integers and short strings
//! - Bounded (`Full` on overflow) or growable buffers
//! - Blocking, non-blocking and timeout consumer waits
//! - Registry lookup by name or id from any thread
//! - Reversible abort and terminal close, per object or process-wide
//! - [`Writer`]/[`Reader`] staging for incremental message assembly and
//!   decoding
//!
//! # Example
//!
//! ```
//! use msgbuf::{Buffer, BufferConfig, Listener, Value};
//!
//! # fn main() -> msgbuf::Result<()> {
//! // A standalone buffer works like a queue.
//! let mut buffer = Buffer::new(BufferConfig::default())?;
//! buffer.add_msg(&[Value::Integer(1), "hello".into()])?;
//! let msg = buffer.next_msg(None)?;
//! assert_eq!(msg, Some(vec![Value::Integer(1), "hello".into()]));
//!
//! // A listener fans in messages from the buffers attached to it.
//! let mut listener = Listener::new(Some(b"workers"))?;
//! let mut jobs = listener.new_buffer(BufferConfig::default())?;
//! jobs.add_msg(&["ping".into()])?;
//! assert_eq!(listener.next_msg(None)?, Some(vec!["ping".into()]));
//! # Ok(())
//! # }
//! ```

mod buffer;
mod codec;
mod error;
mod global;
mod invariants;
mod listener;
mod membuf;
mod notify;
mod reader;
mod registry;
mod writer;

pub use buffer::{Buffer, BufferConfig};
pub use codec::{Array, Value};
pub use error::{Error, Result};
pub use global::{abort, is_abort, set_error_sink, sleep, time, ErrorSink};
pub use listener::Listener;
pub use notify::{NotifierKind, Notify, NotifyControl};
pub use reader::{MessageSource, Reader};
pub use writer::Writer;

/// Identifier of a registered buffer or listener. Ids are generated from
/// a randomized seed, so they do not collide with small user-chosen
/// integers.
pub type Id = u64;
