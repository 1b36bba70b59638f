//! Lock coordinate codec
//!
//! Maps a protected `(key, column)` pair to the row that stores its lock
//! claims, and encodes each claim as a column:
//!
//! ```text
//! ---------------------------------------
//! | 8 bytes timestamp | var bytes rid   |
//! ---------------------------------------
//! ```
//!
//! The timestamp is nanoseconds since the Unix epoch, written big-endian with
//! the sign bit flipped, so unsigned byte order matches chronological order.
//! Equal timestamps fall back to rid byte order.
//!
//! A claim slice reads from a single zero byte, which sorts before every
//! claim column because it is shorter, up to nine `0xFF` bytes, which sorts
//! after every claim column whose first rid byte is not `0xFF`. A UTF-8
//! encoded rid never starts with `0xFF`.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use tessera_common::{KeySliceQuery, Timestamp};

use crate::error::CodecError;

/// Width of the encoded timestamp prefix
pub const TIMESTAMP_LEN: usize = 8;

/// Width of the data key length prefix in a lock row key
pub const KEY_LEN_PREFIX: usize = 4;

/// Inclusive start of a claim slice
pub const LOCK_COL_START: &[u8] = &[0x00];

/// Exclusive end of a claim slice
pub const LOCK_COL_END: &[u8] = &[0xFF; 9];

/// Value stored with every claim column
pub const LOCK_COL_VALUE: &[u8] = &[0x00; 4];

const SIGN_FLIP: u64 = 1 << 63;
const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A decoded claim column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampRid {
    pub timestamp: Timestamp,
    pub rid: Bytes,
}

/// Row key holding the claims for `(data_key, data_column)`
///
/// The data key is length-prefixed, so distinct pairs never collide even when
/// their concatenations do. Keys whose length does not fit the four-byte
/// prefix are rejected.
pub fn to_lock_key(data_key: &[u8], data_column: &[u8]) -> Result<Bytes, CodecError> {
    let prefix = key_length_prefix(data_key.len())?;
    let mut buf = BytesMut::with_capacity(KEY_LEN_PREFIX + data_key.len() + data_column.len());
    buf.put_u32(prefix);
    buf.put_slice(data_key);
    buf.put_slice(data_column);
    Ok(buf.freeze())
}

fn key_length_prefix(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::KeyTooLong { len })
}

/// Claim column for a write at `timestamp` by participant `rid`
pub fn to_lock_column(timestamp: Timestamp, rid: &[u8]) -> Result<Bytes, CodecError> {
    if rid.is_empty() {
        return Err(CodecError::EmptyRid);
    }
    let nanos = timestamp
        .timestamp_nanos_opt()
        .ok_or(CodecError::TimestampOutOfRange(timestamp))?;

    let mut buf = BytesMut::with_capacity(TIMESTAMP_LEN + rid.len());
    buf.put_u64((nanos as u64) ^ SIGN_FLIP);
    buf.put_slice(rid);
    Ok(buf.freeze())
}

/// Inverse of [`to_lock_column`]
pub fn from_lock_column(column: &[u8]) -> Result<TimestampRid, CodecError> {
    let min = TIMESTAMP_LEN + 1;
    if column.len() < min {
        return Err(CodecError::ColumnTooShort {
            min,
            actual: column.len(),
        });
    }

    let nanos = (BigEndian::read_u64(&column[..TIMESTAMP_LEN]) ^ SIGN_FLIP) as i64;
    let timestamp = Timestamp::from_timestamp(
        nanos.div_euclid(NANOS_PER_SEC),
        nanos.rem_euclid(NANOS_PER_SEC) as u32,
    )
    .ok_or(CodecError::TimestampOutOfRange(Timestamp::UNIX_EPOCH))?;

    Ok(TimestampRid {
        timestamp,
        rid: Bytes::copy_from_slice(&column[TIMESTAMP_LEN..]),
    })
}

/// Query covering every claim column stored under `lock_key`
pub fn claim_slice(lock_key: Bytes) -> KeySliceQuery {
    KeySliceQuery::new(
        lock_key,
        Bytes::from_static(LOCK_COL_START),
        Bytes::from_static(LOCK_COL_END),
    )
}
