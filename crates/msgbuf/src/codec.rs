//! Self-describing binary encoding of message values.
//!
//! Every value is written as a one-byte tag followed by its raw bytes in
//! native layout (messages never leave the process, so cross-platform
//! portability is a non-goal). Two compact forms keep common payloads
//! small: integers in `0..=255` use a single data byte, and byte strings
//! up to 255 bytes carry a one-byte length.
//!
//! A message frame prefixes the encoded payload with its length: one byte
//! for payloads below 255 bytes, otherwise the sentinel `0xFF` followed by
//! a native `usize`.

use crate::error::{Error, Result};

pub(crate) const TAG_NIL: u8 = 0;
pub(crate) const TAG_INTEGER: u8 = 1;
pub(crate) const TAG_BYTE: u8 = 2;
pub(crate) const TAG_NUMBER: u8 = 3;
pub(crate) const TAG_BOOLEAN: u8 = 4;
pub(crate) const TAG_STRING: u8 = 5;
pub(crate) const TAG_SMALLSTRING: u8 = 6;
pub(crate) const TAG_LIGHTUSERDATA: u8 = 7;
pub(crate) const TAG_CFUNCTION: u8 = 8;
pub(crate) const TAG_ARRAY: u8 = 9;

const LARGE_FRAME: u8 = 0xff;
const USIZE_BYTES: usize = std::mem::size_of::<usize>();

/// One message value.
///
/// `Pointer` and `Function` carry opaque pointer-sized bits; the codec
/// round-trips them without interpreting them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Bytes(Vec<u8>),
    Pointer(usize),
    Function(usize),
    Array(Array),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// A typed numeric array, stored densely.
#[derive(Debug, Clone, PartialEq)]
pub enum Array {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    U64(Vec<u64>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! for_each_array {
    ($arr:expr, $v:ident => $body:expr) => {
        match $arr {
            Array::U8($v) => $body,
            Array::I8($v) => $body,
            Array::U16($v) => $body,
            Array::I16($v) => $body,
            Array::U32($v) => $body,
            Array::I32($v) => $body,
            Array::U64($v) => $body,
            Array::I64($v) => $body,
            Array::F32($v) => $body,
            Array::F64($v) => $body,
        }
    };
}

impl Array {
    /// Number of elements.
    pub fn len(&self) -> usize {
        for_each_array!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn elem_code(&self) -> u8 {
        match self {
            Array::U8(_) => 0,
            Array::I8(_) => 1,
            Array::U16(_) => 2,
            Array::I16(_) => 3,
            Array::U32(_) => 4,
            Array::I32(_) => 5,
            Array::U64(_) => 6,
            Array::I64(_) => 7,
            Array::F32(_) => 8,
            Array::F64(_) => 9,
        }
    }

    fn elem_size(&self) -> usize {
        match self {
            Array::U8(_) | Array::I8(_) => 1,
            Array::U16(_) | Array::I16(_) => 2,
            Array::U32(_) | Array::I32(_) | Array::F32(_) => 4,
            Array::U64(_) | Array::I64(_) | Array::F64(_) => 8,
        }
    }

    fn byte_len(&self) -> usize {
        self.len() * self.elem_size()
    }

    fn write_elems(&self, out: &mut [u8]) {
        macro_rules! put {
            ($v:expr, $size:expr) => {{
                for (chunk, e) in out.chunks_exact_mut($size).zip($v.iter()) {
                    chunk.copy_from_slice(&e.to_ne_bytes());
                }
            }};
        }
        match self {
            Array::U8(v) => out.copy_from_slice(v),
            Array::I8(v) => put!(v, 1),
            Array::U16(v) => put!(v, 2),
            Array::I16(v) => put!(v, 2),
            Array::U32(v) => put!(v, 4),
            Array::I32(v) => put!(v, 4),
            Array::U64(v) => put!(v, 8),
            Array::I64(v) => put!(v, 8),
            Array::F32(v) => put!(v, 4),
            Array::F64(v) => put!(v, 8),
        }
    }

    fn read_elems(code: u8, bytes: &[u8]) -> Result<Array> {
        macro_rules! take {
            ($variant:ident, $ty:ty, $size:expr) => {
                Array::$variant(
                    bytes
                        .chunks_exact($size)
                        .map(|c| <$ty>::from_ne_bytes(c.try_into().unwrap()))
                        .collect(),
                )
            };
        }
        Ok(match code {
            0 => Array::U8(bytes.to_vec()),
            1 => take!(I8, i8, 1),
            2 => take!(U16, u16, 2),
            3 => take!(I16, i16, 2),
            4 => take!(U32, u32, 4),
            5 => take!(I32, i32, 4),
            6 => take!(U64, u64, 8),
            7 => take!(I64, i64, 8),
            8 => take!(F32, f32, 4),
            9 => take!(F64, f64, 8),
            other => return Err(Error::UnsupportedType(other)),
        })
    }

    fn size_for_code(code: u8) -> Option<usize> {
        match code {
            0 | 1 => Some(1),
            2 | 3 => Some(2),
            4 | 5 | 8 => Some(4),
            6 | 7 | 9 => Some(8),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------
// ENCODING
// ---------------------------------------------------------------------

/// Encoded size of one value, tag included.
pub(crate) fn value_size(value: &Value) -> usize {
    match value {
        Value::Nil => 1,
        Value::Boolean(_) => 1 + 1,
        Value::Integer(i) => {
            if (0..=0xff).contains(i) {
                1 + 1
            } else {
                1 + 8
            }
        }
        Value::Number(_) => 1 + 8,
        Value::Bytes(b) => {
            if b.len() <= 0xff {
                1 + 1 + b.len()
            } else {
                1 + USIZE_BYTES + b.len()
            }
        }
        Value::Pointer(_) | Value::Function(_) => 1 + USIZE_BYTES,
        Value::Array(a) => 1 + 1 + 1 + USIZE_BYTES + a.byte_len(),
    }
}

/// Encoded size of a whole payload.
pub(crate) fn payload_size(values: &[Value]) -> usize {
    values.iter().map(value_size).sum()
}

/// Writes one value into `out`, which must be exactly `value_size` long.
pub(crate) fn encode_value(value: &Value, out: &mut [u8]) {
    match value {
        Value::Nil => out[0] = TAG_NIL,
        Value::Boolean(b) => {
            out[0] = TAG_BOOLEAN;
            out[1] = u8::from(*b);
        }
        Value::Integer(i) => {
            if (0..=0xff).contains(i) {
                out[0] = TAG_BYTE;
                out[1] = *i as u8;
            } else {
                out[0] = TAG_INTEGER;
                out[1..9].copy_from_slice(&i.to_ne_bytes());
            }
        }
        Value::Number(n) => {
            out[0] = TAG_NUMBER;
            out[1..9].copy_from_slice(&n.to_ne_bytes());
        }
        Value::Bytes(b) => {
            if b.len() <= 0xff {
                out[0] = TAG_SMALLSTRING;
                out[1] = b.len() as u8;
                out[2..2 + b.len()].copy_from_slice(b);
            } else {
                out[0] = TAG_STRING;
                out[1..=USIZE_BYTES].copy_from_slice(&b.len().to_ne_bytes());
                out[1 + USIZE_BYTES..].copy_from_slice(b);
            }
        }
        Value::Pointer(p) => {
            out[0] = TAG_LIGHTUSERDATA;
            out[1..=USIZE_BYTES].copy_from_slice(&p.to_ne_bytes());
        }
        Value::Function(p) => {
            out[0] = TAG_CFUNCTION;
            out[1..=USIZE_BYTES].copy_from_slice(&p.to_ne_bytes());
        }
        Value::Array(a) => {
            out[0] = TAG_ARRAY;
            out[1] = a.elem_code();
            out[2] = a.elem_size() as u8;
            out[3..3 + USIZE_BYTES].copy_from_slice(&a.len().to_ne_bytes());
            a.write_elems(&mut out[3 + USIZE_BYTES..]);
        }
    }
}

/// Writes a payload into `out`, which must be exactly `payload_size` long.
pub(crate) fn encode_payload(values: &[Value], out: &mut [u8]) {
    let mut pos = 0;
    for value in values {
        let n = value_size(value);
        encode_value(value, &mut out[pos..pos + n]);
        pos += n;
    }
    debug_assert_eq!(pos, out.len(), "payload size accounting is off");
}

// ---------------------------------------------------------------------
// DECODING
// ---------------------------------------------------------------------

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize, tag: u8) -> Result<&'a [u8]> {
    let end = pos.checked_add(n).filter(|&e| e <= bytes.len());
    match end {
        Some(end) => {
            let slice = &bytes[*pos..end];
            *pos = end;
            Ok(slice)
        }
        None => Err(Error::UnsupportedType(tag)),
    }
}

fn take_usize(bytes: &[u8], pos: &mut usize, tag: u8) -> Result<usize> {
    let raw = take(bytes, pos, USIZE_BYTES, tag)?;
    Ok(usize::from_ne_bytes(raw.try_into().unwrap()))
}

/// Decodes values from an encoded payload, stopping at the end of the
/// payload or after `max` values. Returns the values and the number of
/// payload bytes consumed.
pub(crate) fn decode_payload(bytes: &[u8], max: Option<usize>) -> Result<(Vec<Value>, usize)> {
    let mut values = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() && max.map_or(true, |m| values.len() < m) {
        let tag = bytes[pos];
        pos += 1;
        let value = match tag {
            TAG_NIL => Value::Nil,
            TAG_BOOLEAN => Value::Boolean(take(bytes, &mut pos, 1, tag)?[0] != 0),
            TAG_BYTE => Value::Integer(i64::from(take(bytes, &mut pos, 1, tag)?[0])),
            TAG_INTEGER => {
                let raw = take(bytes, &mut pos, 8, tag)?;
                Value::Integer(i64::from_ne_bytes(raw.try_into().unwrap()))
            }
            TAG_NUMBER => {
                let raw = take(bytes, &mut pos, 8, tag)?;
                Value::Number(f64::from_ne_bytes(raw.try_into().unwrap()))
            }
            TAG_SMALLSTRING => {
                let len = usize::from(take(bytes, &mut pos, 1, tag)?[0]);
                Value::Bytes(take(bytes, &mut pos, len, tag)?.to_vec())
            }
            TAG_STRING => {
                let len = take_usize(bytes, &mut pos, tag)?;
                Value::Bytes(take(bytes, &mut pos, len, tag)?.to_vec())
            }
            TAG_LIGHTUSERDATA => Value::Pointer(take_usize(bytes, &mut pos, tag)?),
            TAG_CFUNCTION => Value::Function(take_usize(bytes, &mut pos, tag)?),
            TAG_ARRAY => {
                let code = take(bytes, &mut pos, 1, tag)?[0];
                let elem_size = usize::from(take(bytes, &mut pos, 1, tag)?[0]);
                let count = take_usize(bytes, &mut pos, tag)?;
                if Array::size_for_code(code) != Some(elem_size) {
                    return Err(Error::UnsupportedType(code));
                }
                let raw = take(bytes, &mut pos, elem_size * count, tag)?;
                Value::Array(Array::read_elems(code, raw)?)
            }
            other => return Err(Error::UnsupportedType(other)),
        };
        values.push(value);
    }
    Ok((values, pos))
}

// ---------------------------------------------------------------------
// FRAME HEADER
// ---------------------------------------------------------------------

/// Size of the header a payload of `payload` bytes needs.
pub(crate) fn header_size(payload: usize) -> usize {
    if payload < usize::from(LARGE_FRAME) {
        1
    } else {
        1 + USIZE_BYTES
    }
}

/// Encodes a frame header; returns the buffer and the used length.
pub(crate) fn encode_header(payload: usize) -> ([u8; 1 + USIZE_BYTES], usize) {
    let mut out = [0u8; 1 + USIZE_BYTES];
    if payload < usize::from(LARGE_FRAME) {
        out[0] = payload as u8;
        (out, 1)
    } else {
        out[0] = LARGE_FRAME;
        out[1..].copy_from_slice(&payload.to_ne_bytes());
        (out, 1 + USIZE_BYTES)
    }
}

/// Parses the frame header at the head of `bytes`. Returns the header
/// size and the payload length. The producer side only ever stores whole
/// frames, so the header is always complete.
pub(crate) fn parse_header(bytes: &[u8]) -> (usize, usize) {
    let first = bytes[0];
    if first != LARGE_FRAME {
        (1, usize::from(first))
    } else {
        let raw: [u8; USIZE_BYTES] = bytes[1..=USIZE_BYTES].try_into().unwrap();
        (1 + USIZE_BYTES, usize::from_ne_bytes(raw))
    }
}

/// Walks whole frames; returns the frame count and total byte length, or
/// `None` if the bytes do not form a whole number of frames. Used by the
/// debug invariant checks.
pub(crate) fn count_frames(bytes: &[u8]) -> Option<(usize, usize)> {
    let mut pos = 0;
    let mut frames = 0;
    while pos < bytes.len() {
        if bytes.len() - pos < 1 {
            return None;
        }
        let (hsize, plen) = if bytes[pos] != LARGE_FRAME {
            (1, usize::from(bytes[pos]))
        } else {
            if bytes.len() - pos < 1 + USIZE_BYTES {
                return None;
            }
            let raw: [u8; USIZE_BYTES] = bytes[pos + 1..pos + 1 + USIZE_BYTES].try_into().unwrap();
            (1 + USIZE_BYTES, usize::from_ne_bytes(raw))
        };
        pos = pos.checked_add(hsize + plen)?;
        if pos > bytes.len() {
            return None;
        }
        frames += 1;
    }
    Some((frames, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: &[Value]) -> Vec<Value> {
        let size = payload_size(values);
        let mut buf = vec![0u8; size];
        encode_payload(values, &mut buf);
        let (decoded, consumed) = decode_payload(&buf, None).unwrap();
        assert_eq!(consumed, size);
        decoded
    }

    #[test]
    fn test_scalar_roundtrip() {
        let values = vec![
            Value::Nil,
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Integer(0),
            Value::Integer(255),
            Value::Integer(-1),
            Value::Integer(i64::MAX),
            Value::Number(3.25),
            Value::Pointer(0xdead_beef),
            Value::Function(0x1234),
        ];
        assert_eq!(roundtrip(&values), values);
    }

    #[test]
    fn test_small_integer_takes_two_bytes() {
        assert_eq!(value_size(&Value::Integer(200)), 2);
        assert_eq!(value_size(&Value::Integer(256)), 9);
        assert_eq!(value_size(&Value::Integer(-1)), 9);
    }

    #[test]
    fn test_string_roundtrip_both_forms() {
        let short = Value::Bytes(b"hello".to_vec());
        let long = Value::Bytes(vec![b'x'; 300]);
        assert_eq!(value_size(&short), 1 + 1 + 5);
        assert_eq!(value_size(&long), 1 + std::mem::size_of::<usize>() + 300);
        let values = vec![short, long];
        assert_eq!(roundtrip(&values), values);
    }

    #[test]
    fn test_array_roundtrip() {
        let values = vec![
            Value::Array(Array::U8(vec![1, 2, 3])),
            Value::Array(Array::I16(vec![-5, 10_000])),
            Value::Array(Array::F64(vec![0.5, -2.25])),
            Value::Array(Array::U64(Vec::new())),
        ];
        assert_eq!(roundtrip(&values), values);
    }

    #[test]
    fn test_decode_respects_max_count() {
        let values = vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)];
        let size = payload_size(&values);
        let mut buf = vec![0u8; size];
        encode_payload(&values, &mut buf);

        let (first, used) = decode_payload(&buf, Some(2)).unwrap();
        assert_eq!(first, vec![Value::Integer(1), Value::Integer(2)]);
        let (rest, _) = decode_payload(&buf[used..], None).unwrap();
        assert_eq!(rest, vec![Value::Integer(3)]);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert_eq!(
            decode_payload(&[42], None),
            Err(Error::UnsupportedType(42))
        );
    }

    #[test]
    fn test_header_sentinel_boundary() {
        let (h, n) = encode_header(254);
        assert_eq!(n, 1);
        assert_eq!(parse_header(&h[..n]), (1, 254));

        let (h, n) = encode_header(255);
        assert_eq!(n, 1 + std::mem::size_of::<usize>());
        assert_eq!(parse_header(&h[..n]), (n, 255));
    }

    #[test]
    fn test_count_frames() {
        let values = vec![Value::Integer(7)];
        let psize = payload_size(&values);
        let mut frame = Vec::new();
        let (h, n) = encode_header(psize);
        frame.extend_from_slice(&h[..n]);
        let mut payload = vec![0u8; psize];
        encode_payload(&values, &mut payload);
        frame.extend_from_slice(&payload);

        let mut two = frame.clone();
        two.extend_from_slice(&frame);
        assert_eq!(count_frames(&two), Some((2, two.len())));
        // A trailing partial frame is not a whole number of frames.
        two.push(9);
        assert_eq!(count_frames(&two), None);
    }
}
