//! Per-module ownership of generated code.
//!
//! A [`NativeModule`] holds all machine code for one loaded wasm module:
//! the virtual-memory reservations backing it, the free/allocated space
//! bookkeeping, the address-sorted list of installed code objects, the
//! per-function code table and the jump table through which all calls
//! are routed. Installation copies a compiler's output into code space,
//! applies relocations, publishes the result in the tables and flushes
//! the instruction cache, all under the module's allocation mutex.

use crate::code::{CodeDescriptor, CodeKind, CodeObject, FunctionInfo, RuntimeStubId, Tier};
use crate::manager::CodeManager;
use crate::mmap::{self, Mmap, Protection};
use crate::pool::{AddressRange, DisjointPool};
use crate::reloc::{self, RelocIterator, RelocMode};
use crate::{icache, jump_table, round_up};
use crate::{DeclaredFuncIndex, FuncIndex, CODE_ALIGNMENT, RUNTIME_STUB_COUNT};
use cranelift_entity::PrimaryMap;
use more_asserts::{assert_le, assert_lt, debug_assert_le};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// What the code manager needs to know about a module to size and run
/// its code space.
#[derive(Clone, Debug)]
pub struct ModuleEnv {
    /// Total number of functions, imports included.
    pub num_functions: u32,
    pub num_imported_functions: u32,
    /// Wasm body sizes of the declared functions, for the reservation
    /// estimate.
    pub function_body_sizes: Vec<usize>,
    /// Whether generated code relies on the signal handler for memory
    /// bounds checks.
    pub use_trap_handler: bool,
}

/// State guarded by the module's allocation mutex. The lock is held for
/// the entire install pipeline: allocate, copy, relocate, insert, table
/// update, jump-table patch, I-cache flush.
struct ModuleInner {
    /// All installed code, sorted by instruction start for PC lookup.
    owned_code: Vec<Arc<CodeObject>>,
    /// Current best code per declared function.
    code_table: PrimaryMap<DeclaredFuncIndex, Option<Arc<CodeObject>>>,
    runtime_stubs: [Option<Arc<CodeObject>>; RUNTIME_STUB_COUNT],
    jump_table: Option<Arc<CodeObject>>,
    /// Reservations backing this module, in allocation order.
    owned_code_space: Vec<Mmap>,
    free_code_space: DisjointPool,
    allocated_code_space: DisjointPool,
    committed_code_space: usize,
    modification_scope_depth: usize,
    is_executable: bool,
    use_trap_handler: bool,
}

impl ModuleInner {
    fn runtime_stub_by_tag(&self, tag: u64) -> &Arc<CodeObject> {
        let stub = RuntimeStubId::ALL
            .get(tag as usize)
            .unwrap_or_else(|| panic!("invalid runtime stub tag {}", tag));
        self.runtime_stubs[*stub as usize]
            .as_ref()
            .expect("runtime stubs are not initialized")
    }
}

/// All generated code of one loaded wasm module.
pub struct NativeModule {
    instance_id: usize,
    num_functions: u32,
    num_imported_functions: u32,
    can_grow: bool,
    lazy_compile_frozen: AtomicBool,
    manager: CodeManager,
    self_weak: Weak<NativeModule>,
    inner: Mutex<ModuleInner>,
}

impl NativeModule {
    pub(crate) fn new(
        manager: CodeManager,
        code_space: Mmap,
        num_functions: u32,
        num_imported_functions: u32,
        can_grow: bool,
        use_trap_handler: bool,
    ) -> Arc<NativeModule> {
        debug_assert_le!(num_imported_functions, num_functions);
        debug_assert!(code_space.is_reserved());
        let num_declared = num_functions - num_imported_functions;

        let mut code_table = PrimaryMap::with_capacity(num_declared as usize);
        for _ in 0..num_declared {
            code_table.push(None);
        }
        let initial_range = AddressRange::new(code_space.address(), code_space.end());

        let module = Arc::new_cyclic(|self_weak| NativeModule {
            instance_id: NEXT_ID.fetch_add(1, SeqCst),
            num_functions,
            num_imported_functions,
            can_grow,
            lazy_compile_frozen: AtomicBool::new(false),
            manager,
            self_weak: self_weak.clone(),
            inner: Mutex::new(ModuleInner {
                owned_code: Vec::with_capacity(num_functions as usize),
                code_table,
                runtime_stubs: Default::default(),
                jump_table: None,
                free_code_space: DisjointPool::new(initial_range),
                allocated_code_space: DisjointPool::default(),
                owned_code_space: vec![code_space],
                committed_code_space: 0,
                modification_scope_depth: 0,
                is_executable: false,
                use_trap_handler,
            }),
        });

        module
            .manager
            .assign_ranges(initial_range.start, initial_range.end, module.self_weak.clone());
        if num_declared > 0 {
            module.create_empty_jump_table(num_declared);
        }
        module
    }

    pub fn instance_id(&self) -> usize {
        self.instance_id
    }

    pub fn num_functions(&self) -> u32 {
        self.num_functions
    }

    pub fn num_imported_functions(&self) -> u32 {
        self.num_imported_functions
    }

    pub fn num_declared_functions(&self) -> u32 {
        self.num_functions - self.num_imported_functions
    }

    pub fn use_trap_handler(&self) -> bool {
        self.lock().use_trap_handler
    }

    pub fn is_executable(&self) -> bool {
        self.lock().is_executable
    }

    pub fn committed_code_space(&self) -> usize {
        self.lock().committed_code_space
    }

    /// Number of OS reservations backing this module.
    pub fn reservation_count(&self) -> usize {
        self.lock().owned_code_space.len()
    }

    pub fn lazy_compile_frozen(&self) -> bool {
        self.lazy_compile_frozen.load(SeqCst)
    }

    pub fn set_lazy_compile_frozen(&self, frozen: bool) {
        self.lazy_compile_frozen.store(frozen, SeqCst);
    }

    /// Convert a function index into this module's declared-function
    /// numbering. Panics for imports and out-of-range indices.
    pub fn declared_function_index(&self, index: FuncIndex) -> DeclaredFuncIndex {
        assert_le!(self.num_imported_functions, index.as_u32());
        assert_lt!(index.as_u32(), self.num_functions);
        DeclaredFuncIndex::from_u32(index.as_u32() - self.num_imported_functions)
    }

    /// Install compiled function code: copy it into code space, apply
    /// its relocations, register trap-handler data when the module uses
    /// trap handlers, publish it in the code table and retarget the
    /// function's jump-table slot.
    pub fn add_code(
        &self,
        desc: &CodeDescriptor,
        index: FuncIndex,
        info: &FunctionInfo,
        tier: Tier,
    ) -> Arc<CodeObject> {
        let mut inner = self.lock();
        let code = self.install_locked(&mut inner, desc, Some(index), CodeKind::Function, tier, info);
        if inner.use_trap_handler {
            code.register_trap_handler_data();
        }
        let declared = self.declared_function_index(index);
        inner.code_table[declared] = Some(code.clone());
        self.patch_jump_table_locked(&inner, index, code.instruction_start());
        log::debug!(
            "module {}: installed {} {:?} at {:#x}+{}",
            self.instance_id,
            code.kind(),
            index,
            code.instruction_start(),
            code.instructions().len(),
        );
        code
    }

    /// Install a wasm-to-host wrapper for `index`. The wrapper is
    /// recorded in the code table (unless it wraps an import) but the
    /// jump table is left alone.
    pub fn add_wrapper_code(
        &self,
        desc: &CodeDescriptor,
        index: FuncIndex,
        info: &FunctionInfo,
    ) -> Arc<CodeObject> {
        let mut inner = self.lock();
        let code = self.install_locked(
            &mut inner,
            desc,
            Some(index),
            CodeKind::WasmToHostWrapper,
            Tier::Other,
            info,
        );
        if index.as_u32() >= self.num_imported_functions {
            let declared = self.declared_function_index(index);
            inner.code_table[declared] = Some(code.clone());
        }
        code
    }

    /// Install an interpreter entry for `index` and point the function's
    /// jump-table slot at it.
    ///
    /// The entry self-identifies with the function index but is not
    /// recorded in the code table: callers only ever reach it through
    /// the jump table, and the empty code-table slot keeps "has compiled
    /// code" queries answering no.
    pub fn add_interpreter_entry(&self, desc: &CodeDescriptor, index: FuncIndex) -> Arc<CodeObject> {
        let inner = &mut self.lock();
        let code = self.install_locked(
            inner,
            desc,
            Some(index),
            CodeKind::InterpreterEntry,
            Tier::Other,
            &FunctionInfo::default(),
        );
        self.patch_jump_table_locked(inner, index, code.instruction_start());
        code
    }

    /// Install the lazy-compile stub and fill every jump-table slot with
    /// a lazy-compile jump carrying the slot's function index. Returns
    /// the stub, or `None` when the module declares no functions.
    pub fn set_lazy_builtin(&self, desc: &CodeDescriptor) -> Option<Arc<CodeObject>> {
        let num_declared = self.num_declared_functions();
        if num_declared == 0 {
            return None;
        }
        let mut inner = self.lock();
        let stub = self.install_locked(
            &mut inner,
            desc,
            None,
            CodeKind::LazyStub,
            Tier::Other,
            &FunctionInfo::default(),
        );
        let target = stub.instruction_start();
        let table = inner.jump_table.clone().expect("module has no jump table");
        let table_start = table.instruction_start();
        for i in 0..num_declared {
            let slot_addr = table_start + i as usize * jump_table::SLOT_SIZE;
            let slot =
                unsafe { slice::from_raw_parts_mut(slot_addr as *mut u8, jump_table::SLOT_SIZE) };
            jump_table::emit_lazy_compile_slot(slot, self.num_imported_functions + i, target);
        }
        icache::flush(table_start as *const u8, table.instructions().len());
        Some(stub)
    }

    /// Install all runtime stubs from `descs`, indexed by
    /// [`RuntimeStubId`]. Must be called exactly once per module, before
    /// installing any code whose relocations reference a stub. A stub's
    /// own relocations may only reference stubs with smaller ids.
    pub fn set_runtime_stubs(&self, descs: &[CodeDescriptor]) {
        assert_eq!(descs.len(), RUNTIME_STUB_COUNT);
        let mut inner = self.lock();
        assert!(
            inner.runtime_stubs[0].is_none(),
            "runtime stubs are already initialized"
        );
        for (i, desc) in descs.iter().enumerate() {
            let code = self.install_locked(
                &mut inner,
                desc,
                None,
                CodeKind::RuntimeStub,
                Tier::Other,
                &FunctionInfo::default(),
            );
            inner.runtime_stubs[i] = Some(code);
        }
    }

    /// The code currently published for `index`, if any.
    pub fn code(&self, index: FuncIndex) -> Option<Arc<CodeObject>> {
        let declared = self.declared_function_index(index);
        self.lock().code_table[declared].clone()
    }

    pub fn has_code(&self, index: FuncIndex) -> bool {
        self.code(index).is_some()
    }

    pub fn runtime_stub(&self, id: RuntimeStubId) -> Arc<CodeObject> {
        self.lock().runtime_stubs[id as usize]
            .clone()
            .expect("runtime stubs are not initialized")
    }

    /// The target to call for `index`: the address of the function's
    /// jump-table slot. Stable for the life of the module.
    pub fn call_target_for_function(&self, index: FuncIndex) -> usize {
        let declared = self.declared_function_index(index);
        let inner = self.lock();
        let table = inner.jump_table.as_ref().expect("module has no jump table");
        debug_assert_le!(
            (declared.as_u32() as usize + 1) * jump_table::SLOT_SIZE,
            table.instructions().len()
        );
        table.instruction_start() + declared.as_u32() as usize * jump_table::SLOT_SIZE
    }

    pub fn is_jump_table_slot(&self, addr: usize) -> bool {
        match &self.lock().jump_table {
            Some(table) => table.contains(addr),
            None => false,
        }
    }

    /// Inverse of [`call_target_for_function`]: `addr` must be the start
    /// of a jump-table slot.
    ///
    /// [`call_target_for_function`]: NativeModule::call_target_for_function
    pub fn function_index_from_jump_table_slot(&self, addr: usize) -> FuncIndex {
        let inner = self.lock();
        let table = inner.jump_table.as_ref().expect("module has no jump table");
        debug_assert!(table.contains(addr));
        let offset = addr - table.instruction_start();
        debug_assert_eq!(offset % jump_table::SLOT_SIZE, 0);
        let slot_index = (offset / jump_table::SLOT_SIZE) as u32;
        debug_assert!(slot_index < self.num_declared_functions());
        FuncIndex::from_u32(self.num_imported_functions + slot_index)
    }

    /// Find the code object containing `pc`, if any.
    pub fn lookup(&self, pc: usize) -> Option<Arc<CodeObject>> {
        Self::lookup_locked(&self.lock(), pc)
    }

    fn lookup_locked(inner: &ModuleInner, pc: usize) -> Option<Arc<CodeObject>> {
        let pos = inner
            .owned_code
            .partition_point(|code| code.instruction_start() <= pc);
        if pos == 0 {
            return None;
        }
        let candidate = &inner.owned_code[pos - 1];
        if candidate.contains(pc) {
            Some(candidate.clone())
        } else {
            None
        }
    }

    /// Flip the module's code between read-execute and read-write.
    /// No-op if the state already matches; no syscalls are made at all
    /// unless the manager write-protects code memory. Returns false if
    /// the OS refused a permission change.
    pub fn set_executable(&self, executable: bool) -> bool {
        self.set_executable_locked(&mut self.lock(), executable)
    }

    fn set_executable_locked(&self, inner: &mut ModuleInner, executable: bool) -> bool {
        if inner.is_executable == executable {
            return true;
        }
        log::trace!(
            "module {}: setting executable: {}",
            self.instance_id,
            executable
        );
        let protection = if executable {
            Protection::ReadExecute
        } else {
            Protection::ReadWrite
        };

        if self.manager.config().write_protect_code_memory {
            #[cfg(windows)]
            {
                // Permission changes cannot straddle separate
                // reservations, so flip whole reservations when the
                // module can have more than one.
                if self.can_grow {
                    for vmem in &inner.owned_code_space {
                        if mmap::set_permissions(vmem.address(), vmem.size(), protection).is_err() {
                            return false;
                        }
                        log::trace!(
                            "set {:#x}..{:#x} to executable: {}",
                            vmem.address(),
                            vmem.end(),
                            executable
                        );
                    }
                    inner.is_executable = executable;
                    return true;
                }
            }

            let page_size = mmap::page_size();
            for range in inner.allocated_code_space.ranges() {
                // The allocated pool is byte-granular; pad each range
                // out to the pages it committed.
                debug_assert_eq!(range.start % page_size, 0);
                let size = round_up(range.size(), page_size);
                if mmap::set_permissions(range.start, size, protection).is_err() {
                    return false;
                }
                log::trace!(
                    "set {:#x}..{:#x} to executable: {}",
                    range.start,
                    range.end,
                    executable
                );
            }
        }
        inner.is_executable = executable;
        true
    }

    /// Transition a module whose code relies on trap handlers to one
    /// that will be re-filled with explicitly bounds-checked code. The
    /// code table is cleared so every still-reachable function must be
    /// installed again; the owned code stays, keeping PC lookups for
    /// frames already on the stack valid. The bytes of the unreachable
    /// code are not recycled until the module dies.
    pub fn disable_trap_handler(&self) {
        let mut inner = self.lock();
        assert!(inner.use_trap_handler);
        inner.use_trap_handler = false;
        for entry in inner.code_table.values_mut() {
            *entry = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, ModuleInner> {
        self.inner.lock().expect("allocation mutex poisoned")
    }

    fn create_empty_jump_table(&self, num_declared: u32) {
        let instructions = vec![0u8; num_declared as usize * jump_table::SLOT_SIZE];
        let desc = CodeDescriptor::plain(&instructions);
        let mut inner = self.lock();
        let code = self.install_locked(
            &mut inner,
            &desc,
            None,
            CodeKind::JumpTable,
            Tier::Other,
            &FunctionInfo::default(),
        );
        inner.jump_table = Some(code);
    }

    /// Copy `desc`'s instructions into code space, apply relocations,
    /// insert the resulting code object into the sorted owned-code list
    /// and flush the written range. Does not touch the code table, jump
    /// table or trap registry.
    fn install_locked(
        &self,
        inner: &mut ModuleInner,
        desc: &CodeDescriptor,
        index: Option<FuncIndex>,
        kind: CodeKind,
        tier: Tier,
        info: &FunctionInfo,
    ) -> Arc<CodeObject> {
        let instructions = desc.instructions();
        debug_assert!(!instructions.is_empty());
        self.debug_assert_writable(inner);

        let dst = self
            .allocate_for_code(inner, instructions.len())
            .unwrap_or_else(|| {
                panic!(
                    "out of code space installing {} in module {}",
                    kind, self.instance_id
                )
            });
        unsafe {
            ptr::copy_nonoverlapping(instructions.as_ptr(), dst as *mut u8, instructions.len());
        }

        let code = Arc::new(CodeObject::new(
            dst,
            instructions.len(),
            desc.reloc_section().to_vec().into_boxed_slice(),
            info.source_positions.to_vec().into_boxed_slice(),
            index,
            kind,
            tier,
            desc.instr_size - desc.constant_pool_size,
            info.stack_slots,
            info.safepoint_table_offset,
            info.handler_table_offset,
            info.protected_instructions.clone(),
            self.instance_id,
            self.manager.config().embedded_constant_pool,
        ));

        // Allocation and insertion happen under the same lock, so the
        // list stays sorted even with installs racing on other threads.
        let pos = inner
            .owned_code
            .partition_point(|c| c.instruction_start() <= dst);
        inner.owned_code.insert(pos, code.clone());

        let delta = dst as i64 - instructions.as_ptr() as i64;
        self.apply_relocations_locked(inner, &code, delta);
        icache::flush(dst as *const u8, instructions.len());
        #[cfg(debug_assertions)]
        self.validate_code_locked(inner, &code);
        code
    }

    fn apply_relocations_locked(&self, inner: &ModuleInner, code: &CodeObject, delta: i64) {
        for entry in RelocIterator::new(code.reloc_info()) {
            debug_assert_le!(entry.offset as usize + 8, code.instructions().len());
            let site = code.instruction_start() + entry.offset as usize;
            match entry.mode {
                RelocMode::RuntimeStubCall => {
                    // The site still holds the stub-id tag the compiler
                    // embedded; resolve it to the stub's address.
                    let tag = unsafe { reloc::read_site_value(site) };
                    let stub = inner.runtime_stub_by_tag(tag);
                    unsafe { reloc::write_site_value(site, stub.instruction_start() as u64) };
                }
                mode if mode.needs_rewrite() => {
                    let old = unsafe { reloc::read_site_value(site) };
                    unsafe { reloc::write_site_value(site, old.wrapping_add(delta as u64)) };
                }
                _ => {}
            }
        }
    }

    fn patch_jump_table_locked(&self, inner: &ModuleInner, index: FuncIndex, target: usize) {
        self.debug_assert_writable(inner);
        let declared = self.declared_function_index(index);
        let table = inner.jump_table.as_ref().expect("module has no jump table");
        let slot_addr =
            table.instruction_start() + declared.as_u32() as usize * jump_table::SLOT_SIZE;
        let slot = unsafe { slice::from_raw_parts_mut(slot_addr as *mut u8, jump_table::SLOT_SIZE) };
        jump_table::emit_jump_slot(slot, target);
        icache::flush(slot_addr as *const u8, jump_table::SLOT_SIZE);
    }

    /// Carve `size` bytes out of the module's code space, growing it by
    /// another manager reservation when allowed, and commit the pages
    /// covering the returned range. Returns `None` when the module
    /// cannot grow or the commit budget is exhausted.
    fn allocate_for_code(&self, inner: &mut ModuleInner, size: usize) -> Option<usize> {
        let size = round_up(size, CODE_ALIGNMENT);
        let mut mem = inner.free_code_space.allocate(size);
        if mem.is_empty() {
            if !self.can_grow {
                return None;
            }
            // Hint the new reservation right past the last one so the
            // free ranges have a chance to coalesce.
            let hint = inner.owned_code_space.last().map(Mmap::end);
            let new_mem = match self.manager.try_allocate(size, hint) {
                Ok(new_mem) => new_mem,
                Err(error) => {
                    log::warn!(
                        "module {}: failed to grow code space: {:#}",
                        self.instance_id,
                        error
                    );
                    return None;
                }
            };
            self.manager
                .assign_ranges(new_mem.address(), new_mem.end(), self.self_weak.clone());
            inner
                .free_code_space
                .merge(AddressRange::new(new_mem.address(), new_mem.end()));
            inner.owned_code_space.push(new_mem);
            mem = inner.free_code_space.allocate(size);
            if mem.is_empty() {
                return None;
            }
        }

        let page_size = mmap::page_size();
        let commit_start = round_up(mem.start, page_size);
        let commit_end = round_up(mem.end, page_size);
        // The page holding `mem.start` is already committed (or
        // `commit_start` is `mem.start` itself): allocation is
        // bump-ordered, so everything below was committed by earlier
        // allocations.
        if commit_start < commit_end {
            #[cfg(windows)]
            {
                // A commit cannot straddle separate reservations. Growth
                // appends, so walk the reservations newest to oldest and
                // commit the intersecting slice of each.
                let mut slices = Vec::new();
                {
                    let mut commit_end = commit_end;
                    for vmem in inner.owned_code_space.iter().rev() {
                        if commit_start >= commit_end {
                            break;
                        }
                        if commit_end > vmem.end() || vmem.address() >= commit_end {
                            continue;
                        }
                        let start = commit_start.max(vmem.address());
                        slices.push((start, commit_end - start));
                        commit_end = start;
                    }
                }
                for (start, commit_size) in slices {
                    debug_assert_eq!(commit_size % page_size, 0);
                    if !self.manager.commit(start, commit_size) {
                        return None;
                    }
                    inner.committed_code_space += commit_size;
                }
            }
            #[cfg(not(windows))]
            {
                let commit_size = commit_end - commit_start;
                debug_assert_eq!(commit_size % page_size, 0);
                if !self.manager.commit(commit_start, commit_size) {
                    return None;
                }
                inner.committed_code_space += commit_size;
            }
        }

        debug_assert_eq!(mem.start % CODE_ALIGNMENT, 0);
        inner.allocated_code_space.merge(mem);
        log::trace!(
            "module {}: code alloc {:#x}+{}",
            self.instance_id,
            mem.start,
            size
        );
        Some(mem.start)
    }

    fn debug_assert_writable(&self, inner: &ModuleInner) {
        // With write protection on, installs and patches are only legal
        // while the module is non-executable (inside a modification
        // scope, or before it was first made executable).
        debug_assert!(
            !self.manager.config().write_protect_code_memory || !inner.is_executable,
            "writing code while the module is executable"
        );
    }

    #[cfg(debug_assertions)]
    fn validate_code_locked(&self, inner: &ModuleInner, code: &CodeObject) {
        for entry in RelocIterator::new(code.reloc_info()) {
            if entry.mode != RelocMode::RuntimeStubCall {
                continue;
            }
            let site = code.instruction_start() + entry.offset as usize;
            let target = unsafe { reloc::read_site_value(site) } as usize;
            let stub = Self::lookup_locked(inner, target)
                .expect("runtime-stub call does not target module code");
            assert_eq!(stub.kind(), CodeKind::RuntimeStub);
            assert_eq!(stub.instruction_start(), target);
        }
    }
}

impl Drop for NativeModule {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().expect("allocation mutex poisoned");
        self.manager.free_native_module(
            self.instance_id,
            &mut inner.owned_code_space,
            inner.committed_code_space,
        );
    }
}

fn _assert() {
    fn _assert_send_sync<T: Send + Sync>() {}
    _assert_send_sync::<NativeModule>();
}

/// Within the scope the module's code is writable and not executable; at
/// the scope's destruction it is executable and not writable, regardless
/// of the state on entry. Nested scopes issue no extra syscalls. Every
/// write to installed code happens inside such a scope when the manager
/// write-protects code memory.
pub struct NativeModuleModificationScope<'a> {
    native_module: &'a NativeModule,
}

impl<'a> NativeModuleModificationScope<'a> {
    pub fn new(native_module: &'a NativeModule) -> Self {
        let mut inner = native_module.lock();
        inner.modification_scope_depth += 1;
        if inner.modification_scope_depth == 1 {
            let ok = native_module.set_executable_locked(&mut inner, false);
            assert!(ok, "failed to make module code writable");
        }
        Self { native_module }
    }
}

impl Drop for NativeModuleModificationScope<'_> {
    fn drop(&mut self) {
        let mut inner = self.native_module.lock();
        inner.modification_scope_depth -= 1;
        if inner.modification_scope_depth == 0 {
            let ok = self.native_module.set_executable_locked(&mut inner, true);
            assert!(ok, "failed to make module code executable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::CodeManagerConfig;

    fn write_protected_manager() -> CodeManager {
        CodeManager::with_config(CodeManagerConfig {
            max_committed: 16 * 1024 * 1024,
            write_protect_code_memory: true,
            embedded_constant_pool: false,
        })
    }

    // All permission-syscall assertions live in this one test because
    // the call counter is process-global.
    #[test]
    fn modification_scope_toggles_permissions_once() {
        let manager = write_protected_manager();
        let module = manager
            .new_native_module_with_limits(64 * 1024, 1, 0, false, false)
            .unwrap();
        assert!(!module.is_executable());

        // Creating the module committed the jump table's page; one
        // contiguous allocated range, so one syscall per toggle.
        let calls0 = mmap::protect_call_count();
        assert!(module.set_executable(true));
        assert!(module.is_executable());
        let calls1 = mmap::protect_call_count();
        assert_eq!(calls1 - calls0, 1);

        // Toggling to the state we are already in makes no syscall.
        assert!(module.set_executable(true));
        assert_eq!(mmap::protect_call_count(), calls1);

        {
            let _scope = NativeModuleModificationScope::new(&module);
            assert!(!module.is_executable());
            let calls2 = mmap::protect_call_count();
            assert_eq!(calls2 - calls1, 1);
            {
                let _nested = NativeModuleModificationScope::new(&module);
                assert_eq!(mmap::protect_call_count(), calls2);
            }
            // Closing the inner scope keeps the module writable.
            assert!(!module.is_executable());
            assert_eq!(mmap::protect_call_count(), calls2);
        }
        assert!(module.is_executable());
        assert_eq!(mmap::protect_call_count(), calls1 + 2);
    }

    #[test]
    fn declared_function_index_offsets_imports() {
        let manager = CodeManager::new(16 * 1024 * 1024);
        let module = manager
            .new_native_module_with_limits(64 * 1024, 5, 2, false, false)
            .unwrap();
        assert_eq!(module.num_declared_functions(), 3);
        assert_eq!(
            module.declared_function_index(FuncIndex::from_u32(2)),
            DeclaredFuncIndex::from_u32(0)
        );
        assert_eq!(
            module.declared_function_index(FuncIndex::from_u32(4)),
            DeclaredFuncIndex::from_u32(2)
        );
    }

    #[test]
    fn lazy_builtin_fills_every_slot() {
        let manager = CodeManager::new(16 * 1024 * 1024);
        let module = manager
            .new_native_module_with_limits(64 * 1024, 3, 1, false, false)
            .unwrap();
        let stub_bytes = vec![0x90u8; 64];
        let stub = module
            .set_lazy_builtin(&CodeDescriptor::plain(&stub_bytes))
            .unwrap();
        assert_eq!(stub.kind(), CodeKind::LazyStub);
        assert!(stub.is_anonymous());

        for raw in 1..3u32 {
            let index = FuncIndex::from_u32(raw);
            let slot_addr = module.call_target_for_function(index);
            assert!(module.is_jump_table_slot(slot_addr));
            let slot =
                unsafe { slice::from_raw_parts(slot_addr as *const u8, jump_table::SLOT_SIZE) };
            assert_eq!(jump_table::slot_target(slot), stub.instruction_start());
            assert_eq!(module.function_index_from_jump_table_slot(slot_addr), index);
        }
    }

    #[test]
    fn disable_trap_handler_clears_code_table_only() {
        let manager = CodeManager::new(16 * 1024 * 1024);
        let module = manager
            .new_native_module_with_limits(64 * 1024, 1, 0, false, true)
            .unwrap();
        let body = vec![0x90u8; 128];
        let index = FuncIndex::from_u32(0);
        let code = module.add_code(
            &CodeDescriptor::plain(&body),
            index,
            &FunctionInfo::default(),
            Tier::Baseline,
        );
        assert!(module.has_code(index));
        assert!(module.use_trap_handler());

        module.disable_trap_handler();
        assert!(!module.use_trap_handler());
        assert!(!module.has_code(index));
        // PC-indexed lookups stay valid for frames still on the stack.
        let found = module.lookup(code.instruction_start() + 4).unwrap();
        assert!(Arc::ptr_eq(&found, &code));
    }
}
