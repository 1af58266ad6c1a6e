//! Globals bootstrap: the well-known external tables every guest VM
//! carries.
//!
//! Owns the two well-known external tables every guest VM starts with —
//! `_home`, the persistent workspace, and `_io`, the three-slot channel
//! for values too large or too frequent to round-trip through `ext.table`
//! calls from Lua source — plus the legacy `Memory` alias.

use crate::ext_table::{self, IdCounter};
use mlua::{Lua, Table, Value};
use std::cell::Cell;

/// The three documented `_io` slots.
const IO_SLOTS: [&str; 3] = ["input", "output", "meta"];

/// Tracks the IDs and the legacy-alias flag across `init`/`attach` calls.
/// Lives inside the kernel singleton, not as a free-standing global — see
/// the allocator/kernel modules for why a `thread_local` kernel singleton
/// was chosen over raw statics.
pub struct GlobalsState {
    home_id: Cell<u32>,
    io_id: Cell<u32>,
    memory_alias_enabled: Cell<bool>,
}

impl GlobalsState {
    pub fn new(memory_alias_enabled: bool) -> Self {
        GlobalsState {
            home_id: Cell::new(0),
            io_id: Cell::new(0),
            memory_alias_enabled: Cell::new(memory_alias_enabled),
        }
    }

    pub fn home_id(&self) -> u32 {
        self.home_id.get()
    }

    pub fn io_id(&self) -> u32 {
        self.io_id.get()
    }

    pub fn set_memory_alias_enabled(&self, enabled: bool) {
        self.memory_alias_enabled.set(enabled);
    }
}

/// Create `_home` (and `Memory` if aliased) and `_io`, remembering both
/// IDs.
pub fn bootstrap(lua: &Lua, counter: &IdCounter, state: &GlobalsState) -> mlua::Result<()> {
    let home = ext_table::create(lua, counter)?;
    state.home_id.set(
        ext_table::ext_id_of(&home).expect("freshly created external table always carries an id"),
    );
    lua.globals().set("_home", home.clone())?;
    if state.memory_alias_enabled.get() {
        lua.globals().set("Memory", home)?;
    }

    let io = ext_table::create(lua, counter)?;
    state.io_id.set(
        ext_table::ext_id_of(&io).expect("freshly created external table always carries an id"),
    );
    lua.globals().set("_io", io)?;

    Ok(())
}

/// Rebinds `_home` (and `Memory`) to a different external table ID, e.g.
/// after the host restores a session. A no-op if `id` is `0` or already
/// current.
pub fn attach_home_table(
    lua: &Lua,
    counter: &IdCounter,
    state: &GlobalsState,
    id: u32,
) -> mlua::Result<()> {
    if id == 0 || id == state.home_id.get() {
        return Ok(());
    }
    let home = ext_table::attach(lua, counter, id)?;
    lua.globals().set("_home", home.clone())?;
    if state.memory_alias_enabled.get() {
        lua.globals().set("Memory", home)?;
    }
    state.home_id.set(id);
    Ok(())
}

/// Nils out all three `_io` slots through ordinary assignment, so the
/// external-table facade's own `__newindex` records the clear host-side
/// exactly like any other script-driven write would.
pub fn clear_io_table(lua: &Lua) -> mlua::Result<()> {
    let io: Table = lua.globals().get("_io")?;
    for slot in IO_SLOTS {
        io.set(slot, Value::Nil)?;
    }
    Ok(())
}
