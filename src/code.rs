//! Installed machine-code artifacts.

use crate::trap_registry::{self, ProtectedInstruction};
use crate::FuncIndex;
use std::fmt;
use std::slice;
use std::sync::atomic::{AtomicI64, Ordering::SeqCst};

/// What a piece of installed code is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeKind {
    /// A compiled wasm function.
    Function,
    /// A wrapper for calling out of wasm into the host.
    WasmToHostWrapper,
    /// The stub jumped to for functions that are not compiled yet.
    LazyStub,
    /// A shared runtime helper, referenced by a [`RuntimeStubId`].
    RuntimeStub,
    /// An entry into the interpreter for one function.
    InterpreterEntry,
    /// The module's jump table.
    JumpTable,
}

impl fmt::Display for CodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CodeKind::Function => "wasm function",
            CodeKind::WasmToHostWrapper => "wasm-to-host",
            CodeKind::LazyStub => "lazy-compile",
            CodeKind::RuntimeStub => "runtime-stub",
            CodeKind::InterpreterEntry => "interpreter entry",
            CodeKind::JumpTable => "jump table",
        })
    }
}

/// Which compiler produced a piece of code. `Other` is used for code
/// that is neither baseline- nor optimizing-compiled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Baseline,
    Optimizing,
    Other,
}

/// Identifies a runtime stub. Generated code references stubs through
/// [`crate::reloc::RelocMode::RuntimeStubCall`] records carrying this id
/// as a tag; the tag is resolved to the stub's address at install time.
///
/// The first block mirrors the wasm trap reasons, each backed by a stub
/// that raises the corresponding trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RuntimeStubId {
    ThrowWasmTrapUnreachable = 0,
    ThrowWasmTrapMemOutOfBounds,
    ThrowWasmTrapDivByZero,
    ThrowWasmTrapDivUnrepresentable,
    ThrowWasmTrapRemByZero,
    ThrowWasmTrapFloatUnrepresentable,
    ThrowWasmTrapFuncInvalid,
    ThrowWasmTrapFuncSigMismatch,
    WasmAllocateHeapNumber,
    WasmArgumentsAdaptor,
    WasmCallHost,
    WasmStackGuard,
    WasmToNumber,
    DoubleToInt,
}

/// Number of runtime stubs resolved per module.
pub const RUNTIME_STUB_COUNT: usize = 14;

impl RuntimeStubId {
    /// All stubs, indexable by the tag value embedded in relocations.
    pub const ALL: [RuntimeStubId; RUNTIME_STUB_COUNT] = [
        RuntimeStubId::ThrowWasmTrapUnreachable,
        RuntimeStubId::ThrowWasmTrapMemOutOfBounds,
        RuntimeStubId::ThrowWasmTrapDivByZero,
        RuntimeStubId::ThrowWasmTrapDivUnrepresentable,
        RuntimeStubId::ThrowWasmTrapRemByZero,
        RuntimeStubId::ThrowWasmTrapFloatUnrepresentable,
        RuntimeStubId::ThrowWasmTrapFuncInvalid,
        RuntimeStubId::ThrowWasmTrapFuncSigMismatch,
        RuntimeStubId::WasmAllocateHeapNumber,
        RuntimeStubId::WasmArgumentsAdaptor,
        RuntimeStubId::WasmCallHost,
        RuntimeStubId::WasmStackGuard,
        RuntimeStubId::WasmToNumber,
        RuntimeStubId::DoubleToInt,
    ];
}

/// A compiler's output buffer, handed over for installation.
///
/// `buffer[..instr_size]` holds the machine code at its scratch address;
/// `buffer[reloc_offset..reloc_offset + reloc_size]` holds the
/// relocation section (see [`crate::reloc`]). A trailing
/// `constant_pool_size` bytes of the instructions are the embedded
/// constant pool, when one is emitted.
#[derive(Clone, Copy, Debug)]
pub struct CodeDescriptor<'a> {
    pub buffer: &'a [u8],
    pub instr_size: usize,
    pub reloc_offset: usize,
    pub reloc_size: usize,
    pub constant_pool_size: usize,
}

impl<'a> CodeDescriptor<'a> {
    /// Descriptor for a buffer that is nothing but instructions.
    pub fn plain(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            instr_size: buffer.len(),
            reloc_offset: buffer.len(),
            reloc_size: 0,
            constant_pool_size: 0,
        }
    }

    pub fn instructions(&self) -> &'a [u8] {
        &self.buffer[..self.instr_size]
    }

    pub fn reloc_section(&self) -> &'a [u8] {
        &self.buffer[self.reloc_offset..self.reloc_offset + self.reloc_size]
    }
}

/// Metadata accompanying a function's code descriptor.
#[derive(Clone, Debug, Default)]
pub struct FunctionInfo<'a> {
    pub stack_slots: u32,
    pub safepoint_table_offset: usize,
    pub handler_table_offset: usize,
    pub protected_instructions: Vec<ProtectedInstruction>,
    pub source_positions: &'a [u8],
}

/// One installed machine-code artifact, owned by its
/// [`crate::NativeModule`].
///
/// The instruction bytes are borrowed from the owning module's
/// reservations, which outlive the code object; the relocation info and
/// source-position table are owned copies that outlive the compiler's
/// buffer. Immutable after installation except for the set-once
/// trap-handler handle.
pub struct CodeObject {
    instructions_start: usize,
    instructions_len: usize,
    reloc_info: Box<[u8]>,
    source_positions: Box<[u8]>,
    index: Option<FuncIndex>,
    kind: CodeKind,
    tier: Tier,
    constant_pool_offset: usize,
    stack_slots: u32,
    safepoint_table_offset: usize,
    handler_table_offset: usize,
    protected_instructions: Vec<ProtectedInstruction>,
    trap_handler_index: AtomicI64,
    module_id: usize,
    embedded_constant_pool: bool,
}

impl CodeObject {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        instructions_start: usize,
        instructions_len: usize,
        reloc_info: Box<[u8]>,
        source_positions: Box<[u8]>,
        index: Option<FuncIndex>,
        kind: CodeKind,
        tier: Tier,
        constant_pool_offset: usize,
        stack_slots: u32,
        safepoint_table_offset: usize,
        handler_table_offset: usize,
        protected_instructions: Vec<ProtectedInstruction>,
        module_id: usize,
        embedded_constant_pool: bool,
    ) -> Self {
        debug_assert!(constant_pool_offset <= instructions_len);
        debug_assert!(safepoint_table_offset <= instructions_len);
        debug_assert!(handler_table_offset <= instructions_len);
        Self {
            instructions_start,
            instructions_len,
            reloc_info,
            source_positions,
            index,
            kind,
            tier,
            constant_pool_offset,
            stack_slots,
            safepoint_table_offset,
            handler_table_offset,
            protected_instructions,
            trap_handler_index: AtomicI64::new(-1),
            module_id,
            embedded_constant_pool,
        }
    }

    /// The installed instruction bytes.
    ///
    /// The bytes live in the owning module's reservations; the module
    /// outlives every code object it owns, so the slice is valid for as
    /// long as this object is reachable through the module.
    pub fn instructions(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.instructions_start as *const u8, self.instructions_len) }
    }

    pub fn instruction_start(&self) -> usize {
        self.instructions_start
    }

    pub fn contains(&self, pc: usize) -> bool {
        self.instructions_start <= pc && pc < self.instructions_start + self.instructions_len
    }

    pub fn reloc_info(&self) -> &[u8] {
        &self.reloc_info
    }

    /// Opaque mapping from instruction offsets to source byte offsets.
    pub fn source_positions(&self) -> &[u8] {
        &self.source_positions
    }

    /// The function index of this code. Panics for anonymous code.
    pub fn index(&self) -> FuncIndex {
        self.index.expect("code is anonymous")
    }

    pub fn is_anonymous(&self) -> bool {
        self.index.is_none()
    }

    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn is_baseline(&self) -> bool {
        self.tier == Tier::Baseline
    }

    /// Address of the embedded constant pool, if the module is
    /// configured to emit one and this code has one.
    pub fn constant_pool(&self) -> Option<usize> {
        if self.embedded_constant_pool && self.constant_pool_offset < self.instructions_len {
            Some(self.instructions_start + self.constant_pool_offset)
        } else {
            None
        }
    }

    pub fn constant_pool_offset(&self) -> usize {
        self.constant_pool_offset
    }

    pub fn safepoint_table_offset(&self) -> usize {
        self.safepoint_table_offset
    }

    pub fn handler_table_offset(&self) -> usize {
        self.handler_table_offset
    }

    pub fn stack_slots(&self) -> u32 {
        self.stack_slots
    }

    pub fn protected_instructions(&self) -> &[ProtectedInstruction] {
        &self.protected_instructions
    }

    /// Instance id of the owning module.
    pub fn module_instance_id(&self) -> usize {
        self.module_id
    }

    pub(crate) fn has_trap_handler_index(&self) -> bool {
        self.trap_handler_index.load(SeqCst) >= 0
    }

    /// Register the protected-instruction table with the trap-handler
    /// registry. Only function code registers; the handle is stored on
    /// this object and released when the object dies.
    pub(crate) fn register_trap_handler_data(&self) {
        debug_assert!(!self.has_trap_handler_index());
        if self.kind != CodeKind::Function {
            return;
        }
        let index = trap_registry::register_handler_data(
            self.instructions_start,
            self.instructions_len,
            &self.protected_instructions,
        );
        assert!(index >= 0, "trap handler registration failed");
        self.trap_handler_index.store(i64::from(index), SeqCst);
    }
}

impl Drop for CodeObject {
    fn drop(&mut self) {
        let index = self.trap_handler_index.load(SeqCst);
        if index >= 0 {
            trap_registry::release_handler_data(index as i32);
        }
    }
}

impl fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeObject")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("start", &format_args!("{:#x}", self.instructions_start))
            .field("len", &self.instructions_len)
            .field("tier", &self.tier)
            .finish()
    }
}

fn _assert() {
    fn _assert_send_sync<T: Send + Sync>() {}
    _assert_send_sync::<CodeObject>();
}
