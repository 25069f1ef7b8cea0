//! Binary record codec.
//!
//! Every encoded record is a length-prefixed frame of tagged fields:
//!
//! ```text
//! +-----------+-------------------------------------------------+
//! |  Length   | Field* (any order)                              |
//! | (u32 LE)  | id (u16 LE) | wire type (u8) | value            |
//! +-----------+-------------------------------------------------+
//! ```
//!
//! Wire types: `1` u64, `2` i64, `3` u32 (all little-endian) and `4` bytes
//! (`u32 LE` length followed by the data).
//!
//! Field ids are stable and never reused. Decoders skip ids they do not know,
//! so new optional fields can be added without breaking records already on
//! disk.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::error::CodecError;
use super::types::VoteRecord;

/// Size of the frame length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

const FIELD_HEADER_SIZE: usize = 3; // 2 (id) + 1 (wire type)

pub const FIELD_NAME: u16 = 0;
pub const FIELD_COUNT: u16 = 10;
pub const FIELD_MAX_COUNT: u16 = 20;
pub const FIELD_LAST_VOTE_SECS: u16 = 30;
/// Optional; absent means zero.
pub const FIELD_LAST_VOTE_NANOS: u16 = 31;

pub const WIRE_U64: u8 = 1;
pub const WIRE_I64: u8 = 2;
pub const WIRE_U32: u8 = 3;
pub const WIRE_BYTES: u8 = 4;

/// Encodes a record into a standalone frame.
pub fn encode(record: &VoteRecord) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_len(record));
    encode_into(record, &mut buf);
    buf.freeze()
}

/// Appends one frame for `record` to `buf`.
pub fn encode_into(record: &VoteRecord, buf: &mut BytesMut) {
    let body_len = body_len(record);
    buf.reserve(LENGTH_PREFIX_SIZE + body_len);

    buf.put_u32_le(body_len as u32);

    let name = record.name().as_bytes();
    put_field_header(buf, FIELD_NAME, WIRE_BYTES);
    buf.put_u32_le(name.len() as u32);
    buf.put_slice(name);

    put_field_header(buf, FIELD_COUNT, WIRE_U64);
    buf.put_u64_le(record.count());

    put_field_header(buf, FIELD_MAX_COUNT, WIRE_U64);
    buf.put_u64_le(record.max_count());

    let last_vote = record.last_vote();
    put_field_header(buf, FIELD_LAST_VOTE_SECS, WIRE_I64);
    buf.put_i64_le(last_vote.timestamp());

    put_field_header(buf, FIELD_LAST_VOTE_NANOS, WIRE_U32);
    buf.put_u32_le(last_vote.timestamp_subsec_nanos());
}

/// Total encoded size of `record`, prefix included.
pub fn encoded_len(record: &VoteRecord) -> usize {
    LENGTH_PREFIX_SIZE + body_len(record)
}

fn body_len(record: &VoteRecord) -> usize {
    FIELD_HEADER_SIZE * 5 + 4 + record.name().len() + 8 * 3 + 4
}

fn put_field_header(buf: &mut BytesMut, field: u16, wire_type: u8) {
    buf.put_u16_le(field);
    buf.put_u8(wire_type);
}

/// Decodes the first frame in `bytes`. Bytes after the frame are ignored.
///
/// # Errors
/// Returns a [`CodecError`] if the frame is truncated or malformed.
pub fn decode(bytes: &[u8]) -> Result<VoteRecord, CodecError> {
    let mut cursor = bytes;
    decode_from(&mut cursor)
}

/// Consumes exactly one frame from `buf`.
///
/// On error the buffer position is unspecified; callers framing records in a
/// container should treat the rest of the container as unreadable.
///
/// # Errors
/// Returns a [`CodecError`] if the frame is truncated or malformed.
pub fn decode_from(buf: &mut impl Buf) -> Result<VoteRecord, CodecError> {
    ensure(buf.remaining(), LENGTH_PREFIX_SIZE)?;
    let len = buf.get_u32_le() as usize;
    ensure(buf.remaining(), len)?;
    let mut body = buf.copy_to_bytes(len);
    decode_body(&mut body)
}

enum Value {
    U64(u64),
    I64(i64),
    U32(u32),
    Bytes(Bytes),
}

impl Value {
    fn wire_type(&self) -> u8 {
        match self {
            Value::U64(_) => WIRE_U64,
            Value::I64(_) => WIRE_I64,
            Value::U32(_) => WIRE_U32,
            Value::Bytes(_) => WIRE_BYTES,
        }
    }

    fn wrong(&self, field: u16, expected: u8) -> CodecError {
        CodecError::WrongWireType {
            field,
            expected,
            actual: self.wire_type(),
        }
    }

    fn into_u64(self, field: u16) -> Result<u64, CodecError> {
        match self {
            Value::U64(v) => Ok(v),
            other => Err(other.wrong(field, WIRE_U64)),
        }
    }

    fn into_i64(self, field: u16) -> Result<i64, CodecError> {
        match self {
            Value::I64(v) => Ok(v),
            other => Err(other.wrong(field, WIRE_I64)),
        }
    }

    fn into_u32(self, field: u16) -> Result<u32, CodecError> {
        match self {
            Value::U32(v) => Ok(v),
            other => Err(other.wrong(field, WIRE_U32)),
        }
    }

    fn into_string(self, field: u16) -> Result<String, CodecError> {
        match self {
            Value::Bytes(b) => {
                String::from_utf8(b.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
            }
            other => Err(other.wrong(field, WIRE_BYTES)),
        }
    }
}

fn decode_body(body: &mut Bytes) -> Result<VoteRecord, CodecError> {
    let mut name = None;
    let mut count = None;
    let mut max_count = None;
    let mut secs = None;
    let mut nanos = None;

    while body.has_remaining() {
        ensure(body.remaining(), FIELD_HEADER_SIZE)?;
        let field = body.get_u16_le();
        let wire_type = body.get_u8();
        let value = read_value(body, field, wire_type)?;

        match field {
            FIELD_NAME => set_once(&mut name, field, value.into_string(field)?)?,
            FIELD_COUNT => set_once(&mut count, field, value.into_u64(field)?)?,
            FIELD_MAX_COUNT => set_once(&mut max_count, field, value.into_u64(field)?)?,
            FIELD_LAST_VOTE_SECS => set_once(&mut secs, field, value.into_i64(field)?)?,
            FIELD_LAST_VOTE_NANOS => set_once(&mut nanos, field, value.into_u32(field)?)?,
            _ => tracing::trace!(field, "skipping unknown record field"),
        }
    }

    let name = name.ok_or(CodecError::MissingField(FIELD_NAME))?;
    let count = count.ok_or(CodecError::MissingField(FIELD_COUNT))?;
    let max_count = max_count.ok_or(CodecError::MissingField(FIELD_MAX_COUNT))?;
    let seconds = secs.ok_or(CodecError::MissingField(FIELD_LAST_VOTE_SECS))?;
    let nanos = nanos.unwrap_or(0);

    let last_vote: DateTime<Utc> = DateTime::from_timestamp(seconds, nanos)
        .ok_or(CodecError::InvalidTimestamp { seconds, nanos })?;

    VoteRecord::from_parts(name, count, max_count, last_vote)
        .ok_or(CodecError::InvalidCounts { count, max_count })
}

fn read_value(body: &mut Bytes, field: u16, wire_type: u8) -> Result<Value, CodecError> {
    match wire_type {
        WIRE_U64 => {
            ensure(body.remaining(), 8)?;
            Ok(Value::U64(body.get_u64_le()))
        }
        WIRE_I64 => {
            ensure(body.remaining(), 8)?;
            Ok(Value::I64(body.get_i64_le()))
        }
        WIRE_U32 => {
            ensure(body.remaining(), 4)?;
            Ok(Value::U32(body.get_u32_le()))
        }
        WIRE_BYTES => {
            ensure(body.remaining(), 4)?;
            let len = body.get_u32_le() as usize;
            ensure(body.remaining(), len)?;
            Ok(Value::Bytes(body.split_to(len)))
        }
        wire_type => Err(CodecError::UnknownWireType { field, wire_type }),
    }
}

fn set_once<T>(slot: &mut Option<T>, field: u16, value: T) -> Result<(), CodecError> {
    if slot.is_some() {
        return Err(CodecError::DuplicateField(field));
    }
    *slot = Some(value);
    Ok(())
}

fn ensure(available: usize, needed: usize) -> Result<(), CodecError> {
    if available < needed {
        return Err(CodecError::Truncated { needed, available });
    }
    Ok(())
}
