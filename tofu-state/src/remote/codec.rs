//! Flattening a key/value map into one blob and back
//!
//! Layout (integers big-endian unless noted):
//!
//! ```text
//! magic       8 bytes  "TOFU" 00 00 00 01
//! item_count  8 bytes  u64
//! item_count times:
//!   key_len   uvarint (LEB128)
//!   key       key_len bytes, UTF-8 key name
//!   val_len   uvarint, never zero
//!   val       val_len bytes
//! ```
//!
//! Items are written in key name order so equal maps always flatten to
//! identical bytes.

use std::collections::HashMap;

use thiserror::Error;

use crate::statekeys::KeyError;
use crate::statestore::{Key, Value};

pub const MAGIC: &[u8; 8] = b"TOFU\x00\x00\x00\x01";
pub const HEADER_LEN: usize = MAGIC.len() + 8;

/// Why a blob could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("missing or incorrect header")]
    BadHeader,

    #[error("too many state items ({0})")]
    TooManyItems(u64),

    #[error("end of data during key at offset {offset}")]
    TruncatedKey { offset: usize },

    #[error("end of data during value for '{key}' at offset {offset}")]
    TruncatedValue { key: String, offset: usize },

    #[error("invalid key at offset {offset}: {source}")]
    InvalidKeyFormat {
        offset: usize,
        #[source]
        source: KeyError,
    },

    #[error("zero-length value for '{key}' at offset {offset}")]
    ZeroLengthValue { key: String, offset: usize },

    #[error("expected {expected} items, but found {found}")]
    ItemCountMismatch { expected: u64, found: usize },
}

/// Append `value` as an unsigned LEB128 varint
fn encode_uvarint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode an unsigned LEB128 varint, returning (value, bytes_consumed)
///
/// Returns `None` if the data ends mid-varint or the value overflows u64.
fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        if shift == 63 && byte > 1 {
            return None; // overflow
        }
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None; // overflow
        }
    }
    None // truncated
}

/// Flatten `data` into a single blob
pub fn encode(data: &HashMap<Key, Value>) -> Vec<u8> {
    let mut items: Vec<(&Key, &Value)> = data.iter().collect();
    items.sort_by(|a, b| a.0.name().cmp(b.0.name()));

    let mut buf = Vec::with_capacity(
        HEADER_LEN
            + items
                .iter()
                .map(|(k, v)| k.name().len() + v.len() + 4)
                .sum::<usize>(),
    );
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&(items.len() as u64).to_be_bytes());
    for (key, value) in items {
        let name = key.name().as_bytes();
        encode_uvarint(name.len() as u64, &mut buf);
        buf.extend_from_slice(name);
        encode_uvarint(value.len() as u64, &mut buf);
        buf.extend_from_slice(value.as_bytes());
    }
    buf
}

/// Read cursor over the item section, tracking absolute offsets for errors
struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> &'a [u8] {
        &self.raw[self.pos..]
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.raw.len()
    }

    fn uvarint(&mut self) -> Option<u64> {
        let (value, n) = decode_uvarint(self.remaining())?;
        self.pos += n;
        Some(value)
    }

    fn take(&mut self, len: u64) -> Option<&'a [u8]> {
        let len = usize::try_from(len).ok()?;
        let end = self.pos.checked_add(len)?;
        let bytes = self.raw.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }
}

/// Parse a blob produced by [`encode`]
pub fn decode(raw: &[u8]) -> Result<HashMap<Key, Value>, CodecError> {
    if raw.len() < HEADER_LEN || !raw.starts_with(MAGIC) {
        return Err(CodecError::BadHeader);
    }
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&raw[MAGIC.len()..HEADER_LEN]);
    let want = u64::from_be_bytes(count_bytes);
    let want_items = usize::try_from(want).map_err(|_| CodecError::TooManyItems(want))?;

    // Each item needs at least four bytes, so never trust the declared count
    // further than the data could possibly go when preallocating.
    let capacity = want_items.min((raw.len() - HEADER_LEN) / 4);
    let mut ret = HashMap::with_capacity(capacity);

    let mut cursor = Cursor {
        raw,
        pos: HEADER_LEN,
    };
    let mut found = 0usize;
    while !cursor.is_empty() {
        let key_offset = cursor.pos;
        let key_bytes = cursor
            .uvarint()
            .and_then(|len| cursor.take(len))
            .ok_or(CodecError::TruncatedKey { offset: key_offset })?;
        let key_name = std::str::from_utf8(key_bytes).map_err(|_| CodecError::InvalidKeyFormat {
            offset: key_offset,
            source: KeyError::InvalidUtf8 {
                raw: String::from_utf8_lossy(key_bytes).into_owned(),
            },
        })?;
        let key = Key::parse(key_name).map_err(|source| CodecError::InvalidKeyFormat {
            offset: key_offset,
            source,
        })?;

        let value_offset = cursor.pos;
        let value_len = cursor.uvarint().ok_or_else(|| CodecError::TruncatedValue {
            key: key.name().to_string(),
            offset: value_offset,
        })?;
        if value_len == 0 {
            return Err(CodecError::ZeroLengthValue {
                key: key.name().to_string(),
                offset: value_offset,
            });
        }
        let value_bytes = cursor
            .take(value_len)
            .ok_or_else(|| CodecError::TruncatedValue {
                key: key.name().to_string(),
                offset: value_offset,
            })?;

        ret.insert(key, Value::new(value_bytes.to_vec()));
        found += 1;
    }

    // Comparing the map size (not just the parsed count) also catches
    // duplicate keys silently collapsing into one entry.
    if found != want_items || ret.len() != want_items {
        return Err(CodecError::ItemCountMismatch {
            expected: want,
            found: ret.len().min(found),
        });
    }
    Ok(ret)
}
