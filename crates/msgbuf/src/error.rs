//! The closed error set shared by every operation in the crate.

use thiserror::Error;

/// Errors that buffer, listener, writer and reader operations can return.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// No registered object matches the given name or id.
    #[error("unknown object: {0}")]
    UnknownObject(String),

    /// More than one registered object carries the given name.
    #[error("ambiguous name: {0}")]
    AmbiguousName(String),

    /// The object was closed; close is terminal.
    #[error("object is closed")]
    ObjectClosed,

    /// The object (or the whole process) is in the aborted state.
    #[error("operation was aborted")]
    OperationAborted,

    /// The frame exceeds what a bounded buffer could ever hold.
    #[error("message size {size} exceeds limit of {limit} bytes")]
    MessageSize {
        /// Total frame size that was requested.
        size: usize,
        /// Capacity of the bounded buffer.
        limit: usize,
    },

    /// The allocator refused to provide the requested storage.
    #[error("failed to allocate {0} bytes")]
    OutOfMemory(usize),

    /// The listener has no attached buffers to read from.
    #[error("listener has no buffers")]
    NoBuffers,

    /// The decoder met a tag byte it does not understand.
    #[error("unsupported value encoding (tag {0})")]
    UnsupportedType(u8),

    /// A notifier of that kind is already registered; clear it first.
    #[error("buffer already has a notifier")]
    HasNotifier,

    /// Non-blocking post into a bounded buffer that cannot accept the frame.
    #[error("buffer is full")]
    Full,
}

impl Error {
    /// Returns `true` if retrying later can succeed (e.g. `Full` after a
    /// consumer catches up, `OperationAborted` after the flag is cleared).
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Full | Self::OperationAborted)
    }

    /// Returns `true` if the target object is permanently unusable.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ObjectClosed)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
