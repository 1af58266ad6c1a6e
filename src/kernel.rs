//! Kernel and call protocol.
//!
//! [`GuestKernel`] is the single-owner object backing every exported ABI
//! call in `abi.rs`: one Lua VM, one allocator pool, one I/O buffer, the
//! output/error capture state, and the `_home`/`_io` bookkeeping. `abi.rs`
//! holds exactly one of these behind a `thread_local!` singleton (see its
//! module doc for why that beats a raw `static mut` here).

use crate::allocator::{pool_alloc, Pool};
use crate::buffer::{IoBuffer, IO_BUFFER_SIZE};
use crate::capture::{self, ErrorCapture, OutputCapture};
use crate::codec::{self, DecodeCtx, EncodeCtx, MAX_DEPTH, MAX_TABLE_ENTRIES};
use crate::error::{ErrorKind, KernelError};
use crate::ext_table::{self, IdCounter};
use crate::globals::{self, GlobalsState};
use crate::host;
use mlua::{ffi, Lua, MultiValue, StdLib, Value};
use std::cell::RefCell;
use std::os::raw::c_void;
use std::rc::Rc;

/// Default arena size for the allocator pool: 512 KiB.
const DEFAULT_ARENA_SIZE: usize = 512 * 1024;

/// Bytes of the I/O buffer reserved for the reply header, the optional
/// `...` overflow marker, and the encoded return value, so that captured
/// `print` output never itself fills the buffer to the point that there's
/// no room left to frame the reply around it.
const OUTPUT_CAPTURE_HEADROOM: usize = 1024;

/// Constructor-time knobs mirroring `mlua::LuaOptions`'s role: production
/// always uses [`KernelOptions::default`]; tests shrink these to exercise
/// boundary behaviour cheaply.
#[derive(Clone, Debug)]
pub struct KernelOptions {
    pub io_buffer_size: usize,
    pub arena_size: usize,
    pub max_table_entries: usize,
    pub max_depth: usize,
    pub memory_alias_enabled: bool,
}

impl Default for KernelOptions {
    fn default() -> Self {
        KernelOptions {
            io_buffer_size: IO_BUFFER_SIZE,
            arena_size: DEFAULT_ARENA_SIZE,
            max_table_entries: MAX_TABLE_ENTRIES,
            max_depth: MAX_DEPTH,
            memory_alias_enabled: true,
        }
    }
}

impl KernelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_io_buffer_size(mut self, n: usize) -> Self {
        self.io_buffer_size = n;
        self
    }

    pub fn with_arena_size(mut self, n: usize) -> Self {
        self.arena_size = n;
        self
    }

    pub fn with_max_table_entries(mut self, n: usize) -> Self {
        self.max_table_entries = n;
        self
    }

    pub fn with_max_depth(mut self, n: usize) -> Self {
        self.max_depth = n;
        self
    }

    pub fn with_memory_alias_enabled(mut self, enabled: bool) -> Self {
        self.memory_alias_enabled = enabled;
        self
    }

    fn output_capacity(&self) -> usize {
        self.io_buffer_size.saturating_sub(OUTPUT_CAPTURE_HEADROOM)
    }
}

#[repr(C)]
pub struct MemoryStats {
    pub io_buffer_size: u32,
    pub lua_memory_used: u32,
    pub wasm_pages: u32,
}

pub struct GuestKernel {
    // `pool` must outlive `lua`: the raw pointer handed to
    // `ffi::lua_newstate` points into this box, and Lua calls back through
    // it for every allocation, including during `lua_close` itself when
    // `lua` is dropped. Rust drops struct fields in declaration order (the
    // opposite of local variables), so `lua` is declared first here —
    // otherwise `_pool` would be freed before `Lua::drop` runs and
    // `lua_close` would call back into freed memory.
    lua: Lua,
    _pool: Box<Pool>,
    counter: Rc<IdCounter>,
    globals: GlobalsState,
    output: Rc<RefCell<OutputCapture>>,
    last_error: RefCell<Option<ErrorCapture>>,
    io_buffer: RefCell<IoBuffer>,
    options: KernelOptions,
}

impl GuestKernel {
    /// Builds the VM and installs every ambient fixture it needs. Returns
    /// `AllocationError` if the VM itself cannot be constructed.
    pub fn new(options: KernelOptions) -> Result<Self, KernelError> {
        let pool = Box::new(Pool::new(options.arena_size));
        let extra = &*pool as *const Pool as *mut c_void;
        let state = unsafe { ffi::lua_newstate(pool_alloc, extra) };
        if state.is_null() {
            return Err(KernelError::allocation(
                "lua_newstate returned null: allocator pool exhausted during VM bootstrap",
            ));
        }
        // `Lua::init_from_ptr` wraps a raw state without opening anything —
        // unlike `Lua::new_with`, it never calls `luaL_requiref(_G,
        // luaopen_base)` itself, so the base library (`pairs`, `type`,
        // `pcall`, `error`, `tostring`, `setmetatable`, ...) has to be
        // opened by hand before any other library.
        unsafe {
            ffi::luaL_requiref(state, c"_G".as_ptr(), ffi::luaopen_base, 1);
            ffi::lua_pop(state, 1);
        }
        let lua = unsafe { Lua::init_from_ptr(state) };

        lua.load_std_libs(StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE)
            .map_err(KernelError::from)?;
        install_os_override(&lua).map_err(KernelError::from)?;

        let counter = Rc::new(IdCounter::new());
        ext_table::install(&lua, counter.clone()).map_err(KernelError::from)?;

        let output = Rc::new(RefCell::new(OutputCapture::new(options.output_capacity())));
        install_print(&lua, output.clone()).map_err(KernelError::from)?;

        let globals = GlobalsState::new(options.memory_alias_enabled);
        globals::bootstrap(&lua, &counter, &globals).map_err(KernelError::from)?;

        let io_buffer = RefCell::new(IoBuffer::new(options.io_buffer_size));

        log::info!(target: "lua_guest_runtime", "guest kernel initialized");

        Ok(GuestKernel {
            _pool: pool,
            lua,
            counter,
            globals,
            output,
            last_error: RefCell::new(None),
            io_buffer,
            options,
        })
    }

    /// A pointer the host writes Lua source into (before `compute`) and
    /// reads the reply out of (after). Stable for the kernel's lifetime
    /// even though it's fetched through a `RefCell` each call, since the
    /// address is the boxed slice's own heap allocation, untouched by the
    /// borrow guard's drop.
    pub fn buffer_ptr(&self) -> *mut u8 {
        self.io_buffer.borrow_mut().as_mut_ptr()
    }

    pub fn buffer_size(&self) -> u32 {
        self.io_buffer.borrow().capacity() as u32
    }

    /// Evaluates the Lua source currently sitting in the I/O buffer and
    /// writes the reply back into it. Returns the reply length on success,
    /// or a negative encoding of the error message length on failure.
    pub fn compute(&self, len: usize) -> i32 {
        self.output.borrow_mut().reset();
        *self.last_error.borrow_mut() = None;
        log::info!(target: "lua_guest_runtime", "compute: len={len}");

        if len == 0 {
            return self.fail(KernelError::serialization(
                crate::error::SerializationErrorKind::BufferTooSmall,
                "compute called with zero-length input",
            ));
        }

        let src = match self.io_buffer.borrow().read(len) {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => return self.fail(e),
        };

        let eval_result: mlua::Result<MultiValue> = self.lua.load(&src[..]).eval();
        let outcome = match eval_result {
            Ok(values) => {
                let top = values.into_iter().next().unwrap_or(Value::Nil);
                self.encode_reply(&top).and_then(|bytes| {
                    self.io_buffer.borrow_mut().write(&bytes)?;
                    Ok(bytes.len() as i32)
                })
            }
            Err(e) => Err(KernelError::from(e)),
        };

        match outcome {
            Ok(n) => {
                log::info!(target: "lua_guest_runtime", "compute: ok, {n} bytes written");
                n
            }
            Err(e) => self.fail(e),
        }
    }

    fn encode_reply(&self, value: &Value) -> Result<Vec<u8>, KernelError> {
        let output_bytes = self.output.borrow().emit();
        let mut ctx = EncodeCtx::with_limits(&self.counter, self.options.max_depth, self.options.max_table_entries);
        let value_bytes = codec::encode_value(&self.lua, value, &mut ctx)?;

        let mut out = Vec::with_capacity(4 + output_bytes.len() + value_bytes.len());
        out.extend_from_slice(&(output_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&output_bytes);
        out.extend_from_slice(&value_bytes);
        Ok(out)
    }

    /// Writes the error text into the buffer and returns the negative
    /// reply code.
    fn fail(&self, err: KernelError) -> i32 {
        let capacity = self.io_buffer.borrow().capacity();
        let msg = err.to_wire_message();
        let truncated = capture::truncate_with_marker(msg.as_bytes(), capacity);
        let _ = self.io_buffer.borrow_mut().write(&truncated);
        log::error!(target: "lua_guest_runtime", "compute failed: kind={:?}", err.kind);
        *self.last_error.borrow_mut() = Some(ErrorCapture {
            kind: err.kind,
            message: truncated.clone(),
        });
        -(truncated.len() as i32 + 1)
    }

    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.last_error.borrow().as_ref().map(|e| e.kind)
    }

    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            io_buffer_size: self.io_buffer.borrow().capacity() as u32,
            lua_memory_used: self.lua.used_memory() as u32,
            wasm_pages: current_wasm_pages(),
        }
    }

    /// Always runs Lua's logical collector, even though the bump-arena
    /// allocator backing it can't physically reclaim the bytes that
    /// frees — finalizers and weak-table clearing still need to run.
    pub fn run_gc(&self) {
        if let Err(e) = self.lua.gc_collect() {
            log::warn!(target: "lua_guest_runtime", "gc_collect failed: {e}");
        }
    }

    pub fn home_table_id(&self) -> u32 {
        self.globals.home_id()
    }

    pub fn io_table_id(&self) -> u32 {
        self.globals.io_id()
    }

    pub fn attach_home_table(&self, id: u32) {
        if let Err(e) = globals::attach_home_table(&self.lua, &self.counter, &self.globals, id) {
            log::warn!(target: "lua_guest_runtime", "attach_home_table({id}) failed: {e}");
        }
    }

    pub fn clear_io_table(&self) {
        if let Err(e) = globals::clear_io_table(&self.lua) {
            log::warn!(target: "lua_guest_runtime", "clear_io_table failed: {e}");
        }
    }

    pub fn sync_external_table_counter(&self, next_id: u32) {
        self.counter.sync(next_id);
        log::debug!(target: "lua_guest_runtime", "external table counter synced to >= {next_id}");
    }

    pub fn set_memory_alias_enabled(&self, enabled: bool) {
        self.globals.set_memory_alias_enabled(enabled);
    }

    /// Decodes one tagged value from an arbitrary byte slice against this
    /// kernel's VM — useful for a host that has retrieved raw bytes
    /// through `ext_table_get`/`ext_table_keys` directly and wants them
    /// back as a Lua value without going through another `compute` call.
    pub fn decode_value(&self, bytes: &[u8]) -> Result<Value, KernelError> {
        let mut ctx = DecodeCtx::new();
        codec::decode_value(&self.lua, bytes, &mut ctx)
    }
}

#[cfg(target_arch = "wasm32")]
fn current_wasm_pages() -> u32 {
    core::arch::wasm32::memory_size(0) as u32
}

#[cfg(not(target_arch = "wasm32"))]
fn current_wasm_pages() -> u32 {
    0
}

/// Minimal `os` table override: the real `os` library assumes a
/// filesystem and a real OS clock, neither of which exist in this
/// environment, so only `time`/`clock` are installed, both backed by the
/// host's `time_now` import.
fn install_os_override(lua: &Lua) -> mlua::Result<()> {
    let os = lua.create_table()?;
    os.set(
        "time",
        lua.create_function(|_, ()| Ok(host::time_now() / 1000))?,
    )?;
    os.set(
        "clock",
        lua.create_function(|_, ()| Ok(host::time_now() as f64 / 1000.0))?,
    )?;
    lua.globals().set("os", os)?;
    Ok(())
}

/// `print` override routing all output through [`OutputCapture`].
fn install_print(lua: &Lua, output: Rc<RefCell<OutputCapture>>) -> mlua::Result<()> {
    let f = lua.create_function(move |_, args: MultiValue| {
        let values: Vec<Value> = args.into_iter().collect();
        let rendered = capture::format_print_args(&values);
        output.borrow_mut().push(&rendered);
        Ok(())
    })?;
    lua.globals().set("print", f)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake_host;

    fn kernel_with(options: KernelOptions) -> GuestKernel {
        let _ = env_logger::try_init();
        fake_host::reset();
        GuestKernel::new(options).unwrap()
    }

    fn run(kernel: &GuestKernel, src: &[u8]) -> i32 {
        kernel.io_buffer.borrow_mut().write(src).unwrap();
        kernel.compute(src.len())
    }

    #[test]
    fn integer_arithmetic_round_trips() {
        let kernel = kernel_with(KernelOptions::default());
        let n = run(&kernel, b"return 1 + 1");
        assert!(n >= 0);
        let buf = kernel.io_buffer.borrow();
        let reply = buf.read(n as usize).unwrap();
        assert_eq!(&reply[..4], &0u32.to_le_bytes());
        assert_eq!(reply[4], codec::TAG_INT);
        assert_eq!(i64::from_le_bytes(reply[5..13].try_into().unwrap()), 2);
    }

    #[test]
    fn print_output_is_framed_before_the_value() {
        let kernel = kernel_with(KernelOptions::default());
        let n = run(&kernel, b"print('hi'); return nil");
        let buf = kernel.io_buffer.borrow();
        let reply = buf.read(n as usize).unwrap();
        let out_len = u32::from_le_bytes(reply[..4].try_into().unwrap()) as usize;
        assert_eq!(out_len, 3);
        assert_eq!(&reply[4..4 + out_len], b"hi\n");
        assert_eq!(reply[4 + out_len], codec::TAG_NIL);
    }

    #[test]
    fn syntax_error_is_negative_and_compilation_kind() {
        let kernel = kernel_with(KernelOptions::default());
        let n = run(&kernel, b"this is not lua");
        assert!(n < 0);
        assert_eq!(kernel.last_error_kind(), Some(ErrorKind::CompilationError));
    }

    #[test]
    fn init_is_idempotent_about_home_contents() {
        let kernel = kernel_with(KernelOptions::default());
        run(&kernel, b"_home.x = 7");
        // A second `GuestKernel` is a fresh VM in this test harness (the
        // ABI layer is what actually makes `init` a no-op on a live
        // singleton); this only checks that re-running `compute` against
        // the same kernel doesn't disturb `_home`.
        let n = run(&kernel, b"return _home.x");
        let buf = kernel.io_buffer.borrow();
        let reply = buf.read(n as usize).unwrap();
        let out_len = u32::from_le_bytes(reply[..4].try_into().unwrap()) as usize;
        assert_eq!(
            i64::from_le_bytes(reply[4 + out_len + 1..4 + out_len + 9].try_into().unwrap()),
            7
        );
    }

    #[test]
    fn circular_table_is_negative_serialization_error() {
        let kernel = kernel_with(KernelOptions::default());
        let n = run(&kernel, b"local t = {}; t.self = t; return t");
        assert!(n < 0);
        assert_eq!(
            kernel.last_error_kind(),
            Some(ErrorKind::SerializationError(
                crate::error::SerializationErrorKind::CircularReference
            ))
        );
    }

    #[test]
    fn source_longer_than_buffer_is_rejected() {
        let kernel = kernel_with(KernelOptions::default().with_io_buffer_size(64));
        let huge = vec![b' '; 128];
        let n = kernel.compute(huge.len());
        assert!(n < 0);
    }

    #[test]
    fn zero_length_source_is_rejected_before_entering_lua() {
        let kernel = kernel_with(KernelOptions::default());
        let n = kernel.compute(0);
        assert!(n < 0);
        assert_eq!(
            kernel.last_error_kind(),
            Some(ErrorKind::SerializationError(
                crate::error::SerializationErrorKind::BufferTooSmall
            ))
        );
    }
}
