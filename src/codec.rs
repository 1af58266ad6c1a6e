//! Tagged binary value codec.
//!
//! Encodes a Lua value on the stack into a byte vector; decodes the
//! inverse. Plain Lua tables are materialized into fresh external tables
//! on the fly as they're encoded — this is what lets `compute` return
//! structured results far larger than the I/O buffer.

use crate::error::{KernelError, SerializationErrorKind};
use crate::ext_table::{self, IdCounter};
use crate::function_codec;
use mlua::{Lua, Table, Value};
use rustc_hash::FxHashSet;

pub const TAG_NIL: u8 = 0x00;
pub const TAG_BOOL: u8 = 0x01;
pub const TAG_INT: u8 = 0x02;
pub const TAG_FLOAT: u8 = 0x03;
pub const TAG_STRING: u8 = 0x04;
pub const TAG_FUNCTION: u8 = 0x05;
pub const TAG_NATIVE_FN: u8 = 0x06;
pub const TAG_EXT_TABLE: u8 = 0x07;

pub const MAX_DEPTH: usize = 32;
pub const MAX_TABLE_ENTRIES: usize = 10_000;

fn fail<T>(sub: SerializationErrorKind, msg: impl Into<String>) -> Result<T, KernelError> {
    Err(KernelError::serialization(sub, msg))
}

/// Per-encode scratch state: the table-materialization depth counter and
/// the in-progress visited set used for cycle detection. The visited
/// marker is keyed by Lua table identity via `Value::to_pointer()` — a
/// pointer-set on the host side, since the codec already runs host-side
/// in Rust rather than needing a Lua-side scratch table for the same
/// purpose.
pub struct EncodeCtx<'a> {
    counter: &'a IdCounter,
    depth: usize,
    visited: FxHashSet<usize>,
    max_depth: usize,
    max_table_entries: usize,
}

impl<'a> EncodeCtx<'a> {
    pub fn new(counter: &'a IdCounter) -> Self {
        Self::with_limits(counter, MAX_DEPTH, MAX_TABLE_ENTRIES)
    }

    /// Used by [`crate::kernel::KernelOptions`] to shrink the limits for
    /// tests that need to exercise the boundary behaviours without
    /// constructing a literal 10,000-entry table.
    pub fn with_limits(counter: &'a IdCounter, max_depth: usize, max_table_entries: usize) -> Self {
        EncodeCtx {
            counter,
            depth: 0,
            visited: FxHashSet::default(),
            max_depth,
            max_table_entries,
        }
    }
}

/// Decode needs nothing but the counter, to bump it when an ext-table
/// reference lands on an ID not yet seen.
pub struct DecodeCtx;

impl DecodeCtx {
    pub fn new() -> Self {
        DecodeCtx
    }
}

/// Encodes a single Lua value, tag followed by payload, little-endian
/// throughout.
pub fn encode_value(lua: &Lua, value: &Value, ctx: &mut EncodeCtx) -> Result<Vec<u8>, KernelError> {
    match value {
        Value::Nil => Ok(vec![TAG_NIL]),
        Value::Boolean(b) => Ok(vec![TAG_BOOL, *b as u8]),
        Value::Integer(i) => {
            let mut out = vec![TAG_INT];
            out.extend_from_slice(&i.to_le_bytes());
            Ok(out)
        }
        Value::Number(f) => encode_number(*f),
        Value::String(s) => {
            let bytes = s.as_bytes();
            let mut out = Vec::with_capacity(5 + bytes.len());
            out.push(TAG_STRING);
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
            Ok(out)
        }
        Value::Table(t) => encode_table(lua, t, ctx),
        Value::Function(f) => function_codec::encode_function(lua, f),
        other => fail(
            SerializationErrorKind::TypeMismatch,
            format!("cannot encode a value of type {}", other.type_name()),
        ),
    }
}

/// A numeric value is tagged `0x02` iff its integer conversion round-trips
/// exactly; otherwise `0x03`. `Value::Integer` is
/// always already an integer and trivially round-trips; `Value::Number`
/// (a Lua float) is checked against `i64` range and exactness via
/// `num_traits::NumCast`, the same round-trip-checked-cast primitive
/// `mlua` itself uses internally to convert Lua numbers.
fn encode_number(f: f64) -> Result<Vec<u8>, KernelError> {
    if let Some(as_int) = exact_i64(f) {
        let mut out = vec![TAG_INT];
        out.extend_from_slice(&as_int.to_le_bytes());
        return Ok(out);
    }
    let mut out = vec![TAG_FLOAT];
    out.extend_from_slice(&f.to_le_bytes());
    Ok(out)
}

/// `Some(i)` iff `f` converts to `i64` without losing precision.
fn exact_i64(f: f64) -> Option<i64> {
    let as_int: i64 = num_traits::NumCast::from(f)?;
    (num_traits::ToPrimitive::to_f64(&as_int)? == f).then_some(as_int)
}

/// Restricted key encoding used only inside table materialization:
/// strings as raw bytes, integer-valued numbers as their decimal text,
/// other key types fail with `TypeMismatch`. Unlike `encode_value` this
/// produces an untagged byte string, since external-table storage is a
/// plain key/value byte map.
pub fn encode_key(key: &Value) -> Result<Vec<u8>, KernelError> {
    match key {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Integer(i) => Ok(i.to_string().into_bytes()),
        Value::Number(f) => match exact_i64(*f) {
            Some(i) => Ok(i.to_string().into_bytes()),
            None => fail(
                SerializationErrorKind::TypeMismatch,
                "non-integral float is not a valid table key",
            ),
        },
        other => fail(
            SerializationErrorKind::TypeMismatch,
            format!("table key of type {} is not supported", other.type_name()),
        ),
    }
}

fn encode_table(lua: &Lua, t: &Table, ctx: &mut EncodeCtx) -> Result<Vec<u8>, KernelError> {
    if let Some(id) = ext_table::ext_id_of(t) {
        let mut out = vec![TAG_EXT_TABLE];
        out.extend_from_slice(&id.to_le_bytes());
        return Ok(out);
    }

    if ctx.depth >= ctx.max_depth {
        return fail(
            SerializationErrorKind::MaxDepthExceeded,
            format!("table nesting exceeds {} levels", ctx.max_depth),
        );
    }

    let identity = t.to_pointer() as usize;
    if ctx.visited.contains(&identity) {
        return fail(
            SerializationErrorKind::CircularReference,
            "table references itself directly or transitively",
        );
    }
    ctx.visited.insert(identity);
    ctx.depth += 1;

    let result = (|| -> Result<u32, KernelError> {
        // Pass 1: count entries and reject oversized tables before any
        // write.
        let mut count: usize = 0;
        for pair in t.clone().pairs::<Value, Value>() {
            pair.map_err(KernelError::from)?;
            count += 1;
            if count > ctx.max_table_entries {
                return fail(
                    SerializationErrorKind::TableTooLarge,
                    format!("table has more than {} entries", ctx.max_table_entries),
                );
            }
        }

        let id = ctx.counter.next();
        // Pass 2: populate. Key/value pairs are serialized and handed to
        // the host one at a time; the new table's contents live host-side
        // from this point on.
        for pair in t.clone().pairs::<Value, Value>() {
            let (k, v) = pair.map_err(KernelError::from)?;
            let key_bytes = encode_key(&k)?;
            let val_bytes = encode_value(lua, &v, ctx)?;
            let status = crate::host::ext_table_set(id, &key_bytes, &val_bytes);
            if status != 0 {
                log::warn!(target: "lua_guest_runtime", "ext_table_set failed during materialization: id={id} status={status}");
            }
        }
        Ok(id)
    })();

    ctx.depth -= 1;
    ctx.visited.remove(&identity);

    let id = result?;
    let mut out = vec![TAG_EXT_TABLE];
    out.extend_from_slice(&id.to_le_bytes());
    Ok(out)
}

/// Decodes one tagged value from `bytes`, returning the value and
/// consuming exactly as many bytes as the tag's payload specifies. Unknown
/// tags, truncated payloads, and malformed bytecode/table headers are all
/// `InvalidFormat` — the tag set is closed.
pub fn decode_value(lua: &Lua, bytes: &[u8], ctx: &mut DecodeCtx) -> Result<Value, KernelError> {
    let (value, consumed) = decode_value_prefix(lua, bytes, ctx)?;
    let _ = consumed;
    Ok(value)
}

/// Like [`decode_value`] but also reports how many bytes were consumed,
/// for callers (reply framing) that decode a value embedded in a larger
/// buffer rather than a byte string sized to exactly one value.
pub fn decode_value_prefix(
    lua: &Lua,
    bytes: &[u8],
    ctx: &mut DecodeCtx,
) -> Result<(Value, usize), KernelError> {
    let tag = *bytes.first().ok_or_else(|| {
        KernelError::serialization(SerializationErrorKind::InvalidFormat, "empty encoded value")
    })?;
    let body = &bytes[1..];
    match tag {
        TAG_NIL => Ok((Value::Nil, 1)),
        TAG_BOOL => {
            let b = *require(body, 1)?.first().unwrap();
            Ok((Value::Boolean(b != 0), 2))
        }
        TAG_INT => {
            let b = require(body, 8)?;
            let n = i64::from_le_bytes(b[..8].try_into().unwrap());
            Ok((Value::Integer(n), 9))
        }
        TAG_FLOAT => {
            let b = require(body, 8)?;
            let n = f64::from_le_bytes(b[..8].try_into().unwrap());
            Ok((Value::Number(n), 9))
        }
        TAG_STRING => {
            let len_bytes = require(body, 4)?;
            let len = u32::from_le_bytes(len_bytes[..4].try_into().unwrap()) as usize;
            let data = require(&body[4..], len)?;
            let s = lua.create_string(&data[..len]).map_err(KernelError::from)?;
            Ok((Value::String(s), 5 + len))
        }
        TAG_FUNCTION => {
            let len_bytes = require(body, 4)?;
            let len = u32::from_le_bytes(len_bytes[..4].try_into().unwrap()) as usize;
            let data = require(&body[4..], len)?;
            let f = function_codec::decode_lua_function(lua, &data[..len])?;
            Ok((Value::Function(f), 5 + len))
        }
        TAG_NATIVE_FN => {
            let idx_bytes = require(body, 2)?;
            let idx = u16::from_le_bytes(idx_bytes[..2].try_into().unwrap());
            let v = function_codec::decode_native_fn(lua, idx)?;
            Ok((v, 3))
        }
        TAG_EXT_TABLE => {
            let id_bytes = require(body, 4)?;
            let id = u32::from_le_bytes(id_bytes[..4].try_into().unwrap());
            let counter = counter_for_decode(lua, ctx)?;
            let t = ext_table::attach(lua, &counter, id).map_err(KernelError::from)?;
            Ok((Value::Table(t), 5))
        }
        other => fail(
            SerializationErrorKind::InvalidFormat,
            format!("unknown value tag 0x{other:02x}"),
        ),
    }
}

fn require(bytes: &[u8], len: usize) -> Result<&[u8], KernelError> {
    bytes.get(..len).ok_or_else(|| {
        KernelError::serialization(
            SerializationErrorKind::InvalidFormat,
            "encoded value is truncated",
        )
    })
}

/// Decoding a `0x07` reference needs the same `IdCounter` encoding does,
/// but `DecodeCtx` is otherwise stateless — fetched from Lua app data
/// exactly like `ext_table`'s metamethods do.
fn counter_for_decode(lua: &Lua, _ctx: &mut DecodeCtx) -> Result<std::rc::Rc<IdCounter>, KernelError> {
    lua.app_data_ref::<std::rc::Rc<IdCounter>>()
        .map(|c| c.clone())
        .ok_or_else(|| KernelError::allocation("IdCounter missing from Lua app data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake_host;

    fn fresh_lua() -> (Lua, std::rc::Rc<IdCounter>) {
        let lua = Lua::new();
        let counter = std::rc::Rc::new(IdCounter::new());
        lua.set_app_data(counter.clone());
        (lua, counter)
    }

    #[test]
    fn nil_round_trips() {
        let (lua, counter) = fresh_lua();
        let mut ectx = EncodeCtx::new(&counter);
        let bytes = encode_value(&lua, &Value::Nil, &mut ectx).unwrap();
        assert_eq!(bytes, vec![TAG_NIL]);
        let mut dctx = DecodeCtx::new();
        let (v, n) = decode_value_prefix(&lua, &bytes, &mut dctx).unwrap();
        assert!(matches!(v, Value::Nil));
        assert_eq!(n, 1);
    }

    #[test]
    fn integer_round_trips() {
        let (lua, counter) = fresh_lua();
        let mut ectx = EncodeCtx::new(&counter);
        let bytes = encode_value(&lua, &Value::Integer(-42), &mut ectx).unwrap();
        assert_eq!(bytes[0], TAG_INT);
        let mut dctx = DecodeCtx::new();
        let (v, _) = decode_value_prefix(&lua, &bytes, &mut dctx).unwrap();
        assert!(matches!(v, Value::Integer(-42)));
    }

    #[test]
    fn integral_float_encodes_as_int_tag() {
        let (lua, counter) = fresh_lua();
        let mut ectx = EncodeCtx::new(&counter);
        let bytes = encode_value(&lua, &Value::Number(7.0), &mut ectx).unwrap();
        assert_eq!(bytes[0], TAG_INT);
    }

    #[test]
    fn fractional_float_encodes_as_float_tag() {
        let (lua, counter) = fresh_lua();
        let mut ectx = EncodeCtx::new(&counter);
        let bytes = encode_value(&lua, &Value::Number(1.5), &mut ectx).unwrap();
        assert_eq!(bytes[0], TAG_FLOAT);
    }

    #[test]
    fn string_round_trips_as_raw_bytes() {
        let (lua, counter) = fresh_lua();
        let s = lua.create_string(b"\xff\x00hi").unwrap();
        let mut ectx = EncodeCtx::new(&counter);
        let bytes = encode_value(&lua, &Value::String(s), &mut ectx).unwrap();
        let mut dctx = DecodeCtx::new();
        let (v, _) = decode_value_prefix(&lua, &bytes, &mut dctx).unwrap();
        match v {
            Value::String(s) => assert_eq!(s.as_bytes().as_ref(), b"\xff\x00hi"),
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn plain_table_materializes_into_ext_table_ref() {
        fake_host::reset();
        let (lua, counter) = fresh_lua();
        let t = lua.create_table().unwrap();
        t.set("a", 1).unwrap();
        let mut ectx = EncodeCtx::new(&counter);
        let bytes = encode_value(&lua, &Value::Table(t), &mut ectx).unwrap();
        assert_eq!(bytes[0], TAG_EXT_TABLE);
        let id = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
        assert!(id >= 1);
        let mut out = [0u8; 16];
        let n = crate::host::ext_table_get(id, b"a", &mut out);
        assert!(n > 0);
    }

    #[test]
    fn self_referential_table_is_circular_reference() {
        fake_host::reset();
        let (lua, counter) = fresh_lua();
        let t = lua.create_table().unwrap();
        t.set("self", t.clone()).unwrap();
        let mut ectx = EncodeCtx::new(&counter);
        let err = encode_value(&lua, &Value::Table(t), &mut ectx).unwrap_err();
        assert_eq!(
            err.kind,
            crate::error::ErrorKind::SerializationError(SerializationErrorKind::CircularReference)
        );
    }

    #[test]
    fn table_over_entry_limit_is_table_too_large() {
        fake_host::reset();
        let (lua, counter) = fresh_lua();
        let t = lua.create_table().unwrap();
        for i in 0..(MAX_TABLE_ENTRIES + 1) {
            t.set(i as i64 + 1, i as i64).unwrap();
        }
        let mut ectx = EncodeCtx::new(&counter);
        let err = encode_value(&lua, &Value::Table(t), &mut ectx).unwrap_err();
        assert_eq!(
            err.kind,
            crate::error::ErrorKind::SerializationError(SerializationErrorKind::TableTooLarge)
        );
    }

    #[test]
    fn table_at_entry_limit_succeeds() {
        fake_host::reset();
        let (lua, counter) = fresh_lua();
        let t = lua.create_table().unwrap();
        for i in 0..MAX_TABLE_ENTRIES {
            t.set(i as i64 + 1, i as i64).unwrap();
        }
        let mut ectx = EncodeCtx::new(&counter);
        assert!(encode_value(&lua, &Value::Table(t), &mut ectx).is_ok());
    }

    #[test]
    fn unknown_tag_is_invalid_format() {
        let (lua, _counter) = fresh_lua();
        let mut dctx = DecodeCtx::new();
        let err = decode_value_prefix(&lua, &[0xEE], &mut dctx).unwrap_err();
        assert_eq!(
            err.kind,
            crate::error::ErrorKind::SerializationError(SerializationErrorKind::InvalidFormat)
        );
    }
}
