//! External-table facade.
//!
//! An external table is an ordinary Lua table carrying one field,
//! [`EXT_ID_FIELD`], plus a metatable shared across every external table
//! in the process. The metatable's `__index`/`__newindex`/`__len`
//! metamethods are the only way Lua code touches host-resident storage;
//! there is deliberately no `__pairs` — iteration is not part of the
//! Lua-visible contract.

use crate::codec::{self, DecodeCtx, EncodeCtx};
use crate::error::KernelError;
use crate::host;
use mlua::{Lua, Table, Value};
use std::cell::Cell;
use std::rc::Rc;

/// Hidden field every external table carries, holding its host-side ID.
pub const EXT_ID_FIELD: &str = "__ext_table_id";

const REGISTRY_METATABLE_KEY: &str = "lua_guest_runtime.ext_table_metatable";

/// Key/value scratch space for metamethod calls. Sized the same as a
/// quarter of the I/O buffer, though these buffers are local to this
/// module and not physically shared with the kernel's own buffer.
const KEY_SCRATCH_LEN: usize = 16 * 1024;
const VALUE_SCRATCH_LEN: usize = 16 * 1024;

/// Process-wide (per guest VM) monotonic ID counter assigning fresh IDs
/// on creation. Starts at 1 so `0` is free to mean "no table" at call
/// sites (e.g. `get_home_table_id` returning 0 before `init`).
pub struct IdCounter(Cell<u32>);

impl IdCounter {
    pub fn new() -> Self {
        IdCounter(Cell::new(1))
    }

    pub fn next(&self) -> u32 {
        let id = self.0.get();
        self.0.set(id + 1);
        id
    }

    pub fn current(&self) -> u32 {
        self.0.get()
    }

    /// Raises the counter to `max(current, n)`; never lowers it.
    pub fn sync(&self, n: u32) {
        if n > self.0.get() {
            self.0.set(n);
        }
    }

    /// If `id` is at or past the current counter, raises the counter past
    /// it.
    fn observe(&self, id: u32) {
        if id >= self.0.get() {
            self.0.set(id + 1);
        }
    }
}

/// Installs the `ext` library (`ext.table()`, `ext.attach(id)`) and the
/// shared metatable, as one step of kernel initialization.
pub fn install(lua: &Lua, counter: Rc<IdCounter>) -> mlua::Result<()> {
    shared_metatable(lua)?;
    // Stashed so metamethods (which only receive what mlua's callback
    // signature passes them) can still materialize nested tables with
    // fresh IDs when a plain Lua table is assigned through `__newindex`.
    lua.set_app_data(counter.clone());

    let ext = lua.create_table()?;

    let c = counter.clone();
    ext.set(
        "table",
        lua.create_function(move |lua, ()| create(lua, &c))?,
    )?;

    let c = counter.clone();
    ext.set(
        "attach",
        lua.create_function(move |lua, id: u32| attach(lua, &c, id))?,
    )?;

    lua.globals().set("ext", ext)?;
    Ok(())
}

fn shared_metatable(lua: &Lua) -> mlua::Result<Table> {
    if let Some(mt) = lua.named_registry_value::<Option<Table>>(REGISTRY_METATABLE_KEY)? {
        return Ok(mt);
    }
    let mt = lua.create_table()?;
    mt.set("__index", lua.create_function(ext_index)?)?;
    mt.set("__newindex", lua.create_function(ext_newindex)?)?;
    mt.set("__len", lua.create_function(ext_len)?)?;
    lua.set_named_registry_value(REGISTRY_METATABLE_KEY, mt.clone())?;
    Ok(mt)
}

/// Builds a fresh Lua-visible wrapper bound to `id`, sharing the one
/// metatable every external table uses.
fn wrapper_for(lua: &Lua, id: u32) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.raw_set(EXT_ID_FIELD, id)?;
    t.set_metatable(Some(shared_metatable(lua)?))?;
    Ok(t)
}

/// `ext.table()`: allocates the next ID and returns a fresh wrapper. Also
/// used internally whenever the codec materializes a plain Lua table.
pub fn create(lua: &Lua, counter: &IdCounter) -> mlua::Result<Table> {
    let id = counter.next();
    log::debug!(target: "lua_guest_runtime", "external table created: id={id}");
    wrapper_for(lua, id)
}

/// `ext.attach(id)` / the guest `attach` helper: builds a wrapper for an
/// existing ID, raising the counter past it if necessary.
pub fn attach(lua: &Lua, counter: &IdCounter, id: u32) -> mlua::Result<Table> {
    counter.observe(id);
    log::debug!(target: "lua_guest_runtime", "external table attached: id={id}");
    wrapper_for(lua, id)
}

/// Reads `__ext_table_id` off a table value, if present.
pub fn ext_id_of(t: &Table) -> Option<u32> {
    t.raw_get::<Option<u32>>(EXT_ID_FIELD).ok().flatten()
}

fn to_lua_err(e: KernelError) -> mlua::Error {
    mlua::Error::RuntimeError(e.to_wire_message())
}

fn ext_index(lua: &Lua, (t, k): (Table, Value)) -> mlua::Result<Value> {
    let id = ext_id_of(&t).ok_or_else(|| mlua::Error::RuntimeError("not an external table".into()))?;
    let key_bytes = codec::encode_key(&k).map_err(to_lua_err)?;
    let mut val_buf = vec![0u8; VALUE_SCRATCH_LEN];
    let n = host::ext_table_get(id, &key_bytes, &mut val_buf);
    if n < 0 {
        return Ok(Value::Nil);
    }
    let mut ctx = DecodeCtx::new();
    codec::decode_value(lua, &val_buf[..n as usize], &mut ctx).map_err(to_lua_err)
}

fn ext_newindex(lua: &Lua, (t, k, v): (Table, Value, Value)) -> mlua::Result<()> {
    let id = ext_id_of(&t).ok_or_else(|| mlua::Error::RuntimeError("not an external table".into()))?;
    let key_bytes = match codec::encode_key(&k) {
        Ok(b) => b,
        Err(e) => {
            log::warn!(target: "lua_guest_runtime", "ext_newindex key encode failed: {e}");
            return Ok(());
        }
    };
    // Table values assigned through `__newindex` auto-materialize.
    let counter = counter_for(lua);
    let mut ctx = EncodeCtx::new(&counter);
    let val_bytes = match codec::encode_value(lua, &v, &mut ctx) {
        Ok(b) => b,
        Err(e) => {
            log::warn!(target: "lua_guest_runtime", "ext_newindex value encode failed: {e}");
            return Ok(());
        }
    };
    let status = host::ext_table_set(id, &key_bytes, &val_bytes);
    if status != 0 {
        // Failures inside metamethods are swallowed; the assignment still
        // appears to succeed to the script.
        log::warn!(target: "lua_guest_runtime", "ext_table_set failed: id={id} status={status}");
    }
    Ok(())
}

fn ext_len(_lua: &Lua, t: Table) -> mlua::Result<u32> {
    let id = ext_id_of(&t).ok_or_else(|| mlua::Error::RuntimeError("not an external table".into()))?;
    Ok(host::ext_table_size(id))
}

/// Fetches the `IdCounter` registered as Lua app data during [`install`].
fn counter_for(lua: &Lua) -> Rc<IdCounter> {
    lua.app_data_ref::<Rc<IdCounter>>()
        .expect("IdCounter registered as app data during init")
        .clone()
}
