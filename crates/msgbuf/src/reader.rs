//! Readers pull one whole frame out of a buffer or listener and decode
//! its values incrementally, so a consumer can step through a message
//! without materializing every value at once.

use std::time::Duration;

use crate::buffer::Buffer;
use crate::codec;
use crate::codec::Value;
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::membuf::MemBuffer;

/// Anything a [`Reader`] can extract frames from.
pub trait MessageSource {
    /// Moves the next whole frame's payload into the reader, honoring the
    /// source handle's non-blocking flag and the given timeout. Returns
    /// whether a frame arrived.
    fn read_frame(&self, reader: &mut Reader, timeout: Option<Duration>) -> Result<bool>;
}

impl MessageSource for Buffer {
    fn read_frame(&self, reader: &mut Reader, timeout: Option<Duration>) -> Result<bool> {
        Ok(self
            .shared
            .fetch_frame(self.nonblock, timeout, &mut reader.mem)?
            .is_some())
    }
}

impl MessageSource for Listener {
    fn read_frame(&self, reader: &mut Reader, timeout: Option<Duration>) -> Result<bool> {
        Ok(self
            .shared
            .fetch_frame(self.nonblock, timeout, &mut reader.mem)?
            .is_some())
    }
}

/// Holds one extracted frame payload and decodes it value by value.
pub struct Reader {
    mem: MemBuffer,
}

impl Reader {
    /// Creates a reader with the given payload capacity; a grow factor of
    /// at most 1 bounds the size of messages it can extract.
    pub fn new(capacity: usize, grow_factor: f64) -> Result<Reader> {
        Ok(Reader {
            mem: MemBuffer::new(capacity, grow_factor).map_err(Error::OutOfMemory)?,
        })
    }

    /// Discards any not-yet-decoded bytes.
    pub fn clear(&mut self) {
        self.mem.reset();
    }

    /// Number of not-yet-decoded payload bytes.
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// Decodes up to `max` values from the held payload and advances past
    /// them. An exhausted reader returns an empty vector.
    pub fn next(&mut self, max: usize) -> Result<Vec<Value>> {
        if max == 0 || self.mem.is_empty() {
            return Ok(Vec::new());
        }
        let (values, consumed) = codec::decode_payload(self.mem.bytes(), Some(max))?;
        self.mem.consume(consumed);
        Ok(values)
    }

    /// Discards any leftover bytes and extracts the next whole frame from
    /// the source. Returns whether a frame arrived before the timeout.
    pub fn next_msg<S: MessageSource + ?Sized>(
        &mut self,
        source: &S,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.mem.reset();
        source.read_frame(self, timeout)
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader").field("len", &self.mem.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;

    #[test]
    fn test_stepwise_decoding() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        b.add_msg(&[Value::Integer(1), Value::Integer(2), Value::Integer(3)])
            .unwrap();

        let mut r = Reader::new(64, 2.0).unwrap();
        assert!(r.next_msg(&b, None).unwrap());
        assert_eq!(r.next(2).unwrap(), vec![Value::Integer(1), Value::Integer(2)]);
        assert_eq!(r.next(5).unwrap(), vec![Value::Integer(3)]);
        assert!(r.next(1).unwrap().is_empty());
    }

    #[test]
    fn test_next_msg_discards_leftovers() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        b.add_msg(&["first".into(), "unread".into()]).unwrap();
        b.add_msg(&["second".into()]).unwrap();

        let mut r = Reader::new(64, 2.0).unwrap();
        assert!(r.next_msg(&b, None).unwrap());
        assert_eq!(r.next(1).unwrap(), vec!["first".into()]);

        assert!(r.next_msg(&b, None).unwrap());
        assert_eq!(r.next(1).unwrap(), vec!["second".into()]);
    }

    #[test]
    fn test_reader_times_out_on_empty_buffer() {
        let b = Buffer::new(BufferConfig::default()).unwrap();
        let mut r = Reader::new(64, 2.0).unwrap();
        assert!(!r.next_msg(&b, Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_reader_reads_from_listener() {
        let l = Listener::new(None).unwrap();
        let mut b = l.new_buffer(BufferConfig::default()).unwrap();
        b.add_msg(&[Value::Integer(9)]).unwrap();

        let mut r = Reader::new(64, 2.0).unwrap();
        assert!(r.next_msg(&l, None).unwrap());
        assert_eq!(r.next(1).unwrap(), vec![Value::Integer(9)]);
    }

    #[test]
    fn test_bounded_reader_rejects_large_frames() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        b.add_msg(&[Value::Bytes(vec![7u8; 100])]).unwrap();

        let mut r = Reader::new(16, 1.0).unwrap();
        assert!(matches!(
            r.next_msg(&b, None),
            Err(Error::MessageSize { .. })
        ));
        // The message stays queued for a capable consumer.
        assert_eq!(b.msg_count(), 1);
    }
}
