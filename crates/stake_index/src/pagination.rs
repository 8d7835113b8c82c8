//! Opaque continuation tokens for cursor pagination.
//!
//! A token carries the sort field it was issued for, the last sort value and
//! the last unique key of the previous page. Layout before base64url:
//!
//! ```text
//! version:u8 | field_tag:u8 | value_kind:u8 | value_len:u32 | value
//!            | key_len:u32 | key | crc32:u32
//! ```
//!
//! All integers are big-endian and the CRC covers every preceding byte.
//! Decoding is strict: any trailing byte, checksum mismatch, foreign field tag
//! or value kind rejects the token.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::StakeError;
use crate::filter::{Document, DocumentField, FieldValue, Filter, ValueKind};
use crate::types::{DelegationState, MAX_FIELD_BYTES};

const TOKEN_VERSION: u8 = 1;
const KIND_U64: u8 = 0x01;
const KIND_I64: u8 = 0x02;
const KIND_STR: u8 = 0x03;
const KIND_BOOL: u8 = 0x04;
const KIND_STATE: u8 = 0x05;
/// Largest token a stored document can yield: header, a sort value and a key
/// each bounded by [`MAX_FIELD_BYTES`], and the checksum. Numeric values are
/// narrower than the string bound.
const MAX_TOKEN_BYTES: usize = 3 + 4 + MAX_FIELD_BYTES + 4 + MAX_FIELD_BYTES + 4;

/// Decoded position of the last row of a previous page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor<F> {
    pub field: F,
    pub last_sort_value: FieldValue,
    pub last_key: String,
}

impl<F: DocumentField> Cursor<F> {
    pub fn new(field: F, last_sort_value: FieldValue, last_key: impl Into<String>) -> Self {
        Self {
            field,
            last_sort_value,
            last_key: last_key.into(),
        }
    }

    /// Cursor positioned at `doc` for a page sorted by `field`.
    pub fn at<D: Document<Field = F>>(doc: &D, field: F) -> Self {
        Self::new(field, doc.field(field), doc.key())
    }

    pub fn encode(&self) -> String {
        encode_token(self.field, &self.last_sort_value, &self.last_key)
    }

    /// `(field < v) OR (field == v AND key > k)`: every row strictly after
    /// this cursor in `(field desc, key asc)` order.
    pub fn after_filter(&self, key_field: F) -> Filter<F> {
        Filter::lt(self.field, self.last_sort_value.clone()).or(Filter::eq(
            self.field,
            self.last_sort_value.clone(),
        )
        .and(Filter::gt(key_field, self.last_key.as_str())))
    }
}

fn kind_code(kind: ValueKind) -> u8 {
    match kind {
        ValueKind::U64 => KIND_U64,
        ValueKind::I64 => KIND_I64,
        ValueKind::Str => KIND_STR,
        ValueKind::Bool => KIND_BOOL,
        ValueKind::State => KIND_STATE,
    }
}

fn encode_value(value: &FieldValue) -> Vec<u8> {
    match value {
        FieldValue::U64(v) => v.to_be_bytes().to_vec(),
        FieldValue::I64(v) => v.to_be_bytes().to_vec(),
        FieldValue::Str(v) => v.as_bytes().to_vec(),
        FieldValue::Bool(v) => vec![u8::from(*v)],
        FieldValue::State(v) => vec![v.code()],
    }
}

/// Encodes a continuation token. Deterministic for a given input.
pub fn encode_token<F: DocumentField>(field: F, last_sort_value: &FieldValue, last_key: &str) -> String {
    let value = encode_value(last_sort_value);
    let mut out = Vec::with_capacity(3 + 4 + value.len() + 4 + last_key.len() + 4);
    out.push(TOKEN_VERSION);
    out.push(field.tag());
    out.push(kind_code(last_sort_value.kind()));
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(&value);
    out.extend_from_slice(&(last_key.len() as u32).to_be_bytes());
    out.extend_from_slice(last_key.as_bytes());
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    URL_SAFE_NO_PAD.encode(out)
}

/// Decodes `token` for a page sorted by `expected`.
pub fn decode_token<F: DocumentField>(token: &str, expected: F) -> Result<Cursor<F>, StakeError> {
    if token.is_empty() {
        return Err(invalid("empty token"));
    }
    let raw = URL_SAFE_NO_PAD
        .decode(token.as_bytes())
        .map_err(|_| invalid("not base64url"))?;
    if raw.len() > MAX_TOKEN_BYTES {
        return Err(invalid("token too large"));
    }
    if raw.len() < 4 {
        return Err(invalid("short token"));
    }
    let (body, crc_bytes) = raw.split_at(raw.len() - 4);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(crc_bytes);
    if crc32fast::hash(body) != u32::from_be_bytes(crc) {
        return Err(invalid("checksum mismatch"));
    }

    let mut offset = 0usize;
    let version = read_u8(body, &mut offset)?;
    if version != TOKEN_VERSION {
        return Err(invalid("unsupported token version"));
    }
    let tag = read_u8(body, &mut offset)?;
    if tag != expected.tag() {
        return Err(invalid("token issued for a different sort field"));
    }
    let kind = read_u8(body, &mut offset)?;
    if kind != kind_code(expected.value_kind()) {
        return Err(invalid("sort value type mismatch"));
    }
    let value_bytes = read_chunk(body, &mut offset)?;
    let last_sort_value = decode_value(expected.value_kind(), value_bytes)?;
    let key_bytes = read_chunk(body, &mut offset)?;
    let last_key = std::str::from_utf8(key_bytes)
        .map_err(|_| invalid("key is not utf-8"))?
        .to_string();
    if offset != body.len() {
        return Err(invalid("trailing bytes"));
    }
    Ok(Cursor {
        field: expected,
        last_sort_value,
        last_key,
    })
}

fn decode_value(kind: ValueKind, bytes: &[u8]) -> Result<FieldValue, StakeError> {
    let fixed8 = |bytes: &[u8]| -> Result<[u8; 8], StakeError> {
        bytes.try_into().map_err(|_| invalid("bad numeric width"))
    };
    match kind {
        ValueKind::U64 => Ok(FieldValue::U64(u64::from_be_bytes(fixed8(bytes)?))),
        ValueKind::I64 => Ok(FieldValue::I64(i64::from_be_bytes(fixed8(bytes)?))),
        ValueKind::Str => std::str::from_utf8(bytes)
            .map(|s| FieldValue::Str(s.to_string()))
            .map_err(|_| invalid("sort value is not utf-8")),
        ValueKind::Bool => match bytes {
            [0] => Ok(FieldValue::Bool(false)),
            [1] => Ok(FieldValue::Bool(true)),
            _ => Err(invalid("bad bool")),
        },
        ValueKind::State => match bytes {
            [code] => DelegationState::from_code(*code)
                .map(FieldValue::State)
                .ok_or_else(|| invalid("unknown state code")),
            _ => Err(invalid("bad state width")),
        },
    }
}

fn read_u8(buf: &[u8], offset: &mut usize) -> Result<u8, StakeError> {
    let byte = *buf.get(*offset).ok_or_else(|| invalid("truncated token"))?;
    *offset += 1;
    Ok(byte)
}

fn read_chunk<'a>(buf: &'a [u8], offset: &mut usize) -> Result<&'a [u8], StakeError> {
    let end = offset
        .checked_add(4)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| invalid("truncated token"))?;
    let mut len = [0u8; 4];
    len.copy_from_slice(&buf[*offset..end]);
    let len = u32::from_be_bytes(len) as usize;
    let chunk_end = end
        .checked_add(len)
        .filter(|chunk_end| *chunk_end <= buf.len())
        .ok_or_else(|| invalid("truncated token"))?;
    *offset = chunk_end;
    Ok(&buf[end..chunk_end])
}

fn invalid(reason: &str) -> StakeError {
    StakeError::InvalidToken(reason.to_string())
}
