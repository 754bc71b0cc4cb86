//! Frame codecs for the control channel.
//!
//! Two byte-level frame shapes share the wire:
//!
//! - **Tuple**: `u16` body length, then each field as `u16` length + raw bytes.
//!   Length-prefixed fields keep arbitrary binary content (NULs included) intact.
//! - **Scalar**: `u32` length + raw bytes, via LengthDelimitedCodec.
//!
//! All lengths are big-endian. The third frame shape (descriptors) travels as
//! ancillary data and lives in `bridge::transport`.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Size of the tuple body length prefix.
pub const TUPLE_HEADER_LEN: usize = 2;
/// Size of each tuple field length prefix.
pub const FIELD_HEADER_LEN: usize = 2;
/// Largest tuple body the codec accepts.
pub const MAX_TUPLE_BODY: usize = u16::MAX as usize;
pub const MAX_TUPLE_FIELDS: usize = 256;

/// Size of the scalar length prefix.
pub const SCALAR_HEADER_LEN: usize = 4;
pub const DEFAULT_MAX_SCALAR_LEN: usize = 64 * 1024 * 1024;

/// An ordered list of binary-safe fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuple {
    fields: Vec<Bytes>,
}

impl Tuple {
    pub fn new<I, B>(fields: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[Bytes] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<Bytes> {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.fields.get(index).map(|f| f.as_ref())
    }

    /// Field rendered as text, for error messages and logs.
    pub fn text(&self, index: usize) -> Option<String> {
        self.get(index)
            .map(|f| String::from_utf8_lossy(f).into_owned())
    }

    /// True when field `index` exists and equals `expected`.
    pub fn field_is(&self, index: usize, expected: &str) -> bool {
        self.get(index) == Some(expected.as_bytes())
    }
}

impl From<Vec<&str>> for Tuple {
    fn from(fields: Vec<&str>) -> Self {
        Self::new(
            fields
                .into_iter()
                .map(|f| Bytes::copy_from_slice(f.as_bytes())),
        )
    }
}

/// Decoders whose frames can be sized from a prefix of the buffer.
///
/// `Channel` uses this to read exactly one frame and nothing more, so bytes
/// (and ancillary data) belonging to the next frame stay in the socket.
pub trait ExactFrame: Decoder<Error = io::Error> {
    /// Bytes still missing before `buf` holds one complete frame. Zero means
    /// `decode` will yield a frame.
    fn missing(&self, buf: &[u8]) -> io::Result<usize>;
}

fn missing_prefixed(buf: &[u8], header_len: usize, body_len: usize) -> usize {
    (header_len + body_len).saturating_sub(buf.len())
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Codec for tuple frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct TupleCodec;

impl TupleCodec {
    pub fn new() -> Self {
        Self
    }

    fn body_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < TUPLE_HEADER_LEN {
            return None;
        }
        Some(u16::from_be_bytes([buf[0], buf[1]]) as usize)
    }
}

impl ExactFrame for TupleCodec {
    fn missing(&self, buf: &[u8]) -> io::Result<usize> {
        match Self::body_len(buf) {
            None => Ok(TUPLE_HEADER_LEN - buf.len()),
            Some(body_len) => Ok(missing_prefixed(buf, TUPLE_HEADER_LEN, body_len)),
        }
    }
}

impl Decoder for TupleCodec {
    type Item = Tuple;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(body_len) = Self::body_len(src) else {
            return Ok(None);
        };
        if src.len() < TUPLE_HEADER_LEN + body_len {
            src.reserve(TUPLE_HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        src.advance(TUPLE_HEADER_LEN);
        let mut body = src.split_to(body_len).freeze();

        let mut fields = Vec::new();
        while body.has_remaining() {
            if fields.len() == MAX_TUPLE_FIELDS {
                return Err(invalid(format!(
                    "tuple frame has more than {} fields",
                    MAX_TUPLE_FIELDS
                )));
            }
            if body.remaining() < FIELD_HEADER_LEN {
                return Err(invalid("truncated tuple field header"));
            }
            let field_len = body.get_u16() as usize;
            if body.remaining() < field_len {
                return Err(invalid(format!(
                    "tuple field claims {} bytes but only {} remain",
                    field_len,
                    body.remaining()
                )));
            }
            fields.push(body.split_to(field_len));
        }

        tracing::trace!(fields = fields.len(), body_len, "Decoded tuple frame");
        Ok(Some(Tuple { fields }))
    }
}

impl Encoder<Tuple> for TupleCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Tuple, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&Tuple>>::encode(self, &item, dst)
    }
}

impl Encoder<&Tuple> for TupleCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &Tuple, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_TUPLE_FIELDS {
            return Err(invalid(format!(
                "tuple has {} fields, limit is {}",
                item.len(),
                MAX_TUPLE_FIELDS
            )));
        }
        let body_len: usize = item
            .fields
            .iter()
            .map(|f| FIELD_HEADER_LEN + f.len())
            .sum();
        if body_len > MAX_TUPLE_BODY {
            return Err(invalid(format!(
                "tuple body is {} bytes, limit is {}",
                body_len, MAX_TUPLE_BODY
            )));
        }

        dst.reserve(TUPLE_HEADER_LEN + body_len);
        dst.put_u16(body_len as u16);
        for field in &item.fields {
            // Bounded by MAX_TUPLE_BODY above.
            dst.put_u16(field.len() as u16);
            dst.extend_from_slice(field);
        }
        tracing::trace!(fields = item.len(), body_len, "Encoding tuple frame");
        Ok(())
    }
}

/// Codec for scalar frames.
///
/// Wraps LengthDelimitedCodec with a 4-byte length field and a size ceiling.
pub struct ScalarCodec {
    inner: LengthDelimitedCodec,
    max_len: usize,
}

impl Default for ScalarCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SCALAR_LEN)
    }
}

impl ScalarCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(SCALAR_HEADER_LEN)
                .max_frame_length(max_len)
                .new_codec(),
            max_len,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl ExactFrame for ScalarCodec {
    fn missing(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() < SCALAR_HEADER_LEN {
            return Ok(SCALAR_HEADER_LEN - buf.len());
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > self.max_len {
            return Err(invalid(format!(
                "scalar frame of {} bytes exceeds limit of {}",
                len, self.max_len
            )));
        }
        Ok(missing_prefixed(buf, SCALAR_HEADER_LEN, len))
    }
}

impl Decoder for ScalarCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(src)?.map(BytesMut::freeze))
    }
}

impl Encoder<Bytes> for ScalarCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.len();
        tracing::trace!(scalar_size_bytes = len, "Encoding scalar frame");
        if len > 1_000_000 {
            tracing::debug!(
                scalar_size_bytes = len,
                scalar_size_kb = len / 1024,
                "Large scalar frame being encoded"
            );
        }
        self.inner.encode(item, dst)
    }
}
