//! Writers stage a message without holding any lock; posting it into a
//! buffer is then a single copy under the buffer's lock.

use crate::buffer::Buffer;
use crate::codec;
use crate::codec::{Array, Value};
use crate::error::{Error, Result};
use crate::membuf::{MemBuffer, ReserveError};

/// An unsynchronized staging area for building one message out of many
/// append calls before posting it atomically.
pub struct Writer {
    mem: MemBuffer,
}

impl Writer {
    /// Creates a writer with the given staging capacity; a grow factor of
    /// at most 1 bounds the staged message size.
    pub fn new(capacity: usize, grow_factor: f64) -> Result<Writer> {
        Ok(Writer {
            mem: MemBuffer::new(capacity, grow_factor).map_err(Error::OutOfMemory)?,
        })
    }

    /// Discards the staged content.
    pub fn clear(&mut self) {
        self.mem.reset();
    }

    /// Number of staged payload bytes.
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    fn push_value(&mut self, value: &Value) -> Result<()> {
        let size = codec::value_size(value);
        match self.mem.reserve(size) {
            Ok(()) => {}
            Err(ReserveError::NoGrow) => {
                return Err(Error::MessageSize {
                    size: self.mem.len() + size,
                    limit: self.mem.capacity(),
                });
            }
            Err(ReserveError::Alloc(bytes)) => return Err(Error::OutOfMemory(bytes)),
        }
        codec::encode_value(value, self.mem.grow_slice(size));
        Ok(())
    }

    /// Appends values to the staged message.
    pub fn add(&mut self, values: &[Value]) -> Result<()> {
        for value in values {
            self.push_value(value)?;
        }
        Ok(())
    }

    pub fn add_boolean(&mut self, value: bool) -> Result<()> {
        self.push_value(&Value::Boolean(value))
    }

    pub fn add_integer(&mut self, value: i64) -> Result<()> {
        self.push_value(&Value::Integer(value))
    }

    pub fn add_number(&mut self, value: f64) -> Result<()> {
        self.push_value(&Value::Number(value))
    }

    pub fn add_str(&mut self, value: &str) -> Result<()> {
        self.push_value(&Value::Bytes(value.as_bytes().to_vec()))
    }

    pub fn add_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.push_value(&Value::Bytes(value.to_vec()))
    }

    pub fn add_array(&mut self, value: Array) -> Result<()> {
        self.push_value(&Value::Array(value))
    }

    /// Posts the staged content as one message appended to the buffer.
    /// The writer is cleared on success and left untouched on failure, so
    /// a `Full` answer can be retried.
    pub fn add_msg(&mut self, buffer: &Buffer) -> Result<()> {
        buffer.shared.post_payload(self.mem.bytes(), false)?;
        self.mem.reset();
        Ok(())
    }

    /// Posts the staged content as the buffer's only message, discarding
    /// whatever was queued. Clears the writer on success.
    pub fn set_msg(&mut self, buffer: &Buffer) -> Result<()> {
        buffer.shared.post_payload(self.mem.bytes(), true)?;
        self.mem.reset();
        Ok(())
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").field("len", &self.mem.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;

    #[test]
    fn test_staged_message_posts_and_clears() {
        let mut w = Writer::new(64, 2.0).unwrap();
        w.add_integer(7).unwrap();
        w.add_str("hey").unwrap();
        w.add_boolean(false).unwrap();
        assert!(!w.is_empty());

        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        w.add_msg(&b).unwrap();
        assert!(w.is_empty());

        let got = b.next_msg(None).unwrap().unwrap();
        assert_eq!(
            got,
            vec![Value::Integer(7), "hey".into(), Value::Boolean(false)]
        );
    }

    #[test]
    fn test_failed_post_keeps_staged_content() {
        let mut w = Writer::new(64, 2.0).unwrap();
        w.add_bytes(&[9u8; 20]).unwrap();

        let b = Buffer::new(BufferConfig::new(8, 1.0)).unwrap();
        assert!(matches!(w.add_msg(&b), Err(Error::MessageSize { .. })));
        assert_eq!(w.len(), 22);
    }

    #[test]
    fn test_set_msg_replaces_queue() {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        b.add_msg(&[Value::Integer(1)]).unwrap();
        b.add_msg(&[Value::Integer(2)]).unwrap();

        let mut w = Writer::new(64, 2.0).unwrap();
        w.add_integer(42).unwrap();
        w.set_msg(&b).unwrap();

        assert_eq!(b.msg_count(), 1);
        assert_eq!(b.next_msg(None).unwrap(), Some(vec![Value::Integer(42)]));
    }

    #[test]
    fn test_bounded_writer_limits_staging() {
        let mut w = Writer::new(4, 1.0).unwrap();
        w.add_integer(1).unwrap();
        assert!(matches!(
            w.add_number(1.5),
            Err(Error::MessageSize { .. })
        ));
    }

    #[test]
    fn test_array_appender() {
        let mut w = Writer::new(16, 2.0).unwrap();
        w.add_array(Array::I32(vec![-1, 2, -3])).unwrap();
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        w.add_msg(&b).unwrap();
        assert_eq!(
            b.next_msg(None).unwrap(),
            Some(vec![Value::Array(Array::I32(vec![-1, 2, -3]))])
        );
    }
}
