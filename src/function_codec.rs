//! Function codec: serializing and restoring callable values.
//!
//! Two distinct encodings share tag space: Lua closures serialize as their
//! own bytecode dump (`0x05`); everything else callable — the native
//! functions installed by the standard libraries this kernel opens, plus
//! `print` and the `ext` library — round-trips through a fixed whitelist
//! of symbolic names (`0x06`).

use crate::error::{ErrorKind, KernelError, SerializationErrorKind};
use mlua::{Function, Lua, Value};

/// First four bytes of Lua's own bytecode dump format.
const BYTECODE_SIGNATURE: [u8; 4] = [0x1B, b'L', b'u', b'a'];

/// Sentinel written for a function whose identity isn't in
/// [`NATIVE_FN_WHITELIST`].
pub const NATIVE_FN_UNSUPPORTED: u16 = 0xFFFF;

/// Symbolic names eligible for the `0x06` native-function handle, indexed
/// by position — the full set consistent with the standard library subset
/// this kernel actually opens (`table`, `string`, `math`, `utf8`,
/// `coroutine`), plus the globals `init` installs itself. One level of
/// `table.field` nesting is supported.
const NATIVE_FN_WHITELIST: &[&str] = &[
    "print",
    "type",
    "tostring",
    "tonumber",
    "pairs",
    "ipairs",
    "next",
    "select",
    "error",
    "assert",
    "pcall",
    "xpcall",
    "setmetatable",
    "getmetatable",
    "rawget",
    "rawset",
    "rawequal",
    "rawlen",
    "collectgarbage",
    "table.insert",
    "table.remove",
    "table.concat",
    "table.sort",
    "table.unpack",
    "table.pack",
    "string.format",
    "string.sub",
    "string.find",
    "string.match",
    "string.gmatch",
    "string.gsub",
    "string.rep",
    "string.upper",
    "string.lower",
    "string.len",
    "string.byte",
    "string.char",
    "string.reverse",
    "math.sin",
    "math.cos",
    "math.tan",
    "math.floor",
    "math.ceil",
    "math.abs",
    "math.max",
    "math.min",
    "math.sqrt",
    "math.random",
    "math.randomseed",
    "math.fmod",
    "math.modf",
    "math.tointeger",
    "math.type",
    "utf8.char",
    "utf8.codepoint",
    "utf8.len",
    "os.time",
    "os.clock",
    "ext.table",
    "ext.attach",
];

/// Encodes a function value: a Lua closure dumps as bytecode (`0x05`); a
/// native function resolves through the whitelist by identity (`0x06`).
/// `Function::dump` can't error (Lua's own `lua_dump` has no failure mode
/// for a well-formed closure) but it silently produces an empty buffer for
/// a Rust-backed callback, since `lua_dump` has nothing to serialize for a
/// C function — that emptiness is the signal used here to fall back to the
/// native path rather than inspecting the value's origin directly.
pub fn encode_function(lua: &Lua, f: &Function) -> Result<Vec<u8>, KernelError> {
    let bytecode = f.dump(true);
    if bytecode.is_empty() {
        let idx = encode_native_fn(lua, f);
        let mut out = vec![crate::codec::TAG_NATIVE_FN];
        out.extend_from_slice(&idx.to_le_bytes());
        Ok(out)
    } else {
        let mut out = Vec::with_capacity(5 + bytecode.len());
        out.push(crate::codec::TAG_FUNCTION);
        out.extend_from_slice(&(bytecode.len() as u32).to_le_bytes());
        out.extend_from_slice(&bytecode);
        Ok(out)
    }
}

/// Finds `f`'s whitelist index by comparing Lua identity
/// (`Value::to_pointer`) against each whitelisted name resolved through
/// `_G`. Returns [`NATIVE_FN_UNSUPPORTED`] if nothing matches.
fn encode_native_fn(lua: &Lua, f: &Function) -> u16 {
    let target = Value::Function(f.clone()).to_pointer();
    for (idx, name) in NATIVE_FN_WHITELIST.iter().enumerate() {
        if let Ok(Some(resolved)) = resolve_global_path(lua, name) {
            if resolved.to_pointer() == target {
                return idx as u16;
            }
        }
    }
    NATIVE_FN_UNSUPPORTED
}

/// Decodes a `0x06` handle back into a value. Unknown index, unresolved
/// name, or a non-function at that name all push `nil` rather than
/// erroring.
pub fn decode_native_fn(lua: &Lua, idx: u16) -> Result<Value, KernelError> {
    if idx == NATIVE_FN_UNSUPPORTED {
        return Ok(Value::Nil);
    }
    let Some(name) = NATIVE_FN_WHITELIST.get(idx as usize) else {
        return Ok(Value::Nil);
    };
    match resolve_global_path(lua, name) {
        Ok(Some(v)) => Ok(v),
        _ => Ok(Value::Nil),
    }
}

/// Resolves `name`, optionally one level of `table.field`, against the
/// globals table. Returns `Ok(None)` on a missing name rather than an
/// error so callers can treat "absent" and "present but nil" uniformly.
fn resolve_global_path(lua: &Lua, name: &str) -> mlua::Result<Option<Value>> {
    let globals = lua.globals();
    match name.split_once('.') {
        Some((table_name, field)) => {
            let Value::Table(t) = globals.get::<Value>(table_name)? else {
                return Ok(None);
            };
            let v: Value = t.get(field)?;
            Ok(if matches!(v, Value::Nil) { None } else { Some(v) })
        }
        None => {
            let v: Value = globals.get(name)?;
            Ok(if matches!(v, Value::Nil) { None } else { Some(v) })
        }
    }
}

/// Validates the four-byte bytecode signature, then loads the bytes as a
/// binary chunk. Does not call the resulting function — restoring
/// upvalues is out of scope; a function serialized with open upvalues
/// comes back closed over nothing.
pub fn decode_lua_function(lua: &Lua, bytes: &[u8]) -> Result<Function, KernelError> {
    if bytes.len() < 4 || bytes[..4] != BYTECODE_SIGNATURE {
        return Err(KernelError::serialization(
            SerializationErrorKind::InvalidFormat,
            "bytecode signature does not match Lua's dump header",
        ));
    }
    lua.load(bytes)
        .set_name("<restored function>")
        .into_function()
        .map_err(|e| {
            // A malformed-but-signature-valid dump is still the codec's
            // problem, not a generic runtime error.
            if matches!(e, mlua::Error::SyntaxError { .. }) {
                KernelError::new(ErrorKind::CompilationError, e.to_string())
            } else {
                KernelError::serialization(SerializationErrorKind::InvalidFormat, e.to_string())
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lua_closure_round_trips_through_bytecode() {
        let lua = Lua::new();
        let f: Function = lua.load("return function(x) return x * 2 end").eval().unwrap();
        let bytes = encode_function(&lua, &f).unwrap();
        assert_eq!(bytes[0], crate::codec::TAG_FUNCTION);
        let len = u32::from_le_bytes(bytes[1..5].try_into().unwrap()) as usize;
        let bytecode = &bytes[5..5 + len];
        assert_eq!(&bytecode[..4], &BYTECODE_SIGNATURE);
        let restored = decode_lua_function(&lua, bytecode).unwrap();
        let result: i64 = restored.call(3).unwrap();
        assert_eq!(result, 6);
    }

    #[test]
    fn invalid_signature_is_invalid_format() {
        let lua = Lua::new();
        let err = decode_lua_function(&lua, b"not-lua-bytecode").unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::SerializationError(SerializationErrorKind::InvalidFormat)
        );
    }

    #[test]
    fn native_print_round_trips_by_identity() {
        let lua = Lua::new();
        let print: Function = lua.globals().get("print").unwrap();
        let bytes = encode_function(&lua, &print).unwrap();
        assert_eq!(bytes[0], crate::codec::TAG_NATIVE_FN);
        let idx = u16::from_le_bytes(bytes[1..3].try_into().unwrap());
        assert_ne!(idx, NATIVE_FN_UNSUPPORTED);
        let decoded = decode_native_fn(&lua, idx).unwrap();
        assert!(matches!(decoded, Value::Function(_)));
    }

    #[test]
    fn unsupported_native_fn_decodes_to_nil() {
        let lua = Lua::new();
        let v = decode_native_fn(&lua, NATIVE_FN_UNSUPPORTED).unwrap();
        assert!(matches!(v, Value::Nil));
    }
}
