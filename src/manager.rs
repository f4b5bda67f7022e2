//! The process-wide owner of all wasm code.
//!
//! A [`CodeManager`] hands out the virtual-memory reservations backing
//! [`NativeModule`]s, enforces the global cap on committed code bytes,
//! and maps any program counter back to the module owning it. It is a
//! cheaply clonable handle to shared state; every module keeps one.

use crate::code::CodeObject;
use crate::jump_table;
use crate::mmap::{self, Mmap, Protection};
use crate::module::{ModuleEnv, NativeModule};
use crate::{round_up, MAX_WASM_CODE_MEMORY};
use anyhow::{Context, Result};
use more_asserts::assert_le;
use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, RwLock, Weak};

/// Notify the host below this much remaining commit budget, so it can
/// free modules before the next reservation fails.
const CRITICAL_COMMITTED_THRESHOLD: usize = 32 * 1024 * 1024;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        // Generated code assumes all of a module's code is reachable
        // with fixed-width displacements, so the whole range is
        // reserved up front and modules never grow.
        const REQUIRES_CODE_RANGE: bool = true;
        const MODULE_CAN_ALLOCATE_MORE_MEMORY: bool = false;
    } else {
        // Address space is the scarce resource: reserve only the
        // estimate and grow on demand.
        const REQUIRES_CODE_RANGE: bool = false;
        const MODULE_CAN_ALLOCATE_MORE_MEMORY: bool = true;
    }
}

/// Process-level configuration of the code manager.
#[derive(Clone, Debug)]
pub struct CodeManagerConfig {
    /// Cap on committed code bytes across all modules.
    pub max_committed: usize,
    /// Keep code pages W^X: committed read-write, flipped to
    /// read-execute outside modification scopes.
    pub write_protect_code_memory: bool,
    /// Whether compilers embed constant pools in function code.
    pub embedded_constant_pool: bool,
}

impl Default for CodeManagerConfig {
    fn default() -> Self {
        Self {
            max_committed: MAX_WASM_CODE_MEMORY,
            write_protect_code_memory: false,
            embedded_constant_pool: false,
        }
    }
}

struct ManagerInner {
    config: CodeManagerConfig,
    remaining_uncommitted_code_space: AtomicUsize,
    /// Reservation base -> (reservation end, owning module).
    lookup_map: RwLock<BTreeMap<usize, (usize, Weak<NativeModule>)>>,
    /// Live modules, to decide whether memory pressure is worth
    /// reporting.
    active: AtomicUsize,
    critical_pressure_callback: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// Owns the code space of every live [`NativeModule`] in the process.
#[derive(Clone)]
pub struct CodeManager {
    inner: Arc<ManagerInner>,
}

impl CodeManager {
    pub fn new(max_committed: usize) -> Self {
        Self::with_config(CodeManagerConfig {
            max_committed,
            ..Default::default()
        })
    }

    pub fn with_config(config: CodeManagerConfig) -> Self {
        assert_le!(config.max_committed, MAX_WASM_CODE_MEMORY);
        Self {
            inner: Arc::new(ManagerInner {
                remaining_uncommitted_code_space: AtomicUsize::new(config.max_committed),
                config,
                lookup_map: RwLock::new(BTreeMap::new()),
                active: AtomicUsize::new(0),
                critical_pressure_callback: RwLock::new(None),
            }),
        }
    }

    /// Install a callback run when a new module is created while the
    /// commit budget is nearly exhausted.
    pub fn set_critical_memory_pressure_callback(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self
            .inner
            .critical_pressure_callback
            .write()
            .expect("callback lock poisoned") = Some(callback);
    }

    pub fn config(&self) -> &CodeManagerConfig {
        &self.inner.config
    }

    pub fn remaining_uncommitted_code_space(&self) -> usize {
        self.inner.remaining_uncommitted_code_space.load(SeqCst)
    }

    /// Create the module described by `env`, reserving its code space
    /// with a size heuristic. An `Err` means the reservation failed and
    /// is treated as out-of-memory by callers.
    pub fn new_native_module(&self, env: &ModuleEnv) -> Result<Arc<NativeModule>> {
        let vmem_size = if REQUIRES_CODE_RANGE {
            MAX_WASM_CODE_MEMORY
        } else {
            Self::estimate_native_module_size(env)
        };
        self.new_native_module_with_limits(
            vmem_size,
            env.num_functions,
            env.num_imported_functions,
            MODULE_CAN_ALLOCATE_MORE_MEMORY,
            env.use_trap_handler,
        )
    }

    /// Create a module with an exact reservation size and growth policy.
    /// For embedders (and tests) that size code space themselves.
    pub fn new_native_module_with_limits(
        &self,
        memory_estimate: usize,
        num_functions: u32,
        num_imported_functions: u32,
        can_grow: bool,
        use_trap_handler: bool,
    ) -> Result<Arc<NativeModule>> {
        if self.inner.active.load(SeqCst) > 1
            && self.remaining_uncommitted_code_space() < CRITICAL_COMMITTED_THRESHOLD
        {
            log::warn!(
                "critical code-space pressure: {} bytes of commit budget remain",
                self.remaining_uncommitted_code_space()
            );
            let callback = self
                .inner
                .critical_pressure_callback
                .read()
                .expect("callback lock poisoned");
            if let Some(callback) = callback.as_ref() {
                callback();
            }
        }

        let mem = self
            .try_allocate(memory_estimate, None)
            .context("failed to reserve code space for new module")?;
        self.inner.active.fetch_add(1, SeqCst);
        let module = NativeModule::new(
            self.clone(),
            mem,
            num_functions,
            num_imported_functions,
            can_grow,
            use_trap_handler,
        );
        log::debug!(
            "new module {}: {} functions ({} imported)",
            module.instance_id(),
            num_functions,
            num_imported_functions
        );
        Ok(module)
    }

    /// Reservation-size heuristic: room for the bookkeeping plus an
    /// expansion factor over the wasm body bytes.
    pub fn estimate_native_module_size(env: &ModuleEnv) -> usize {
        const CODE_EXPANSION_FACTOR: usize = 4;
        const IMPORT_OVERHEAD: usize = 32 * mem::size_of::<usize>();

        let num_declared = (env.num_functions - env.num_imported_functions) as usize;
        let mut estimate = mmap::page_size()
            + mem::size_of::<NativeModule>()
            + num_declared * mem::size_of::<*const CodeObject>()
            + num_declared * mem::size_of::<CodeObject>()
            + env.num_imported_functions as usize * IMPORT_OVERHEAD
            + num_declared * jump_table::SLOT_SIZE;
        for body_size in &env.function_body_sizes {
            estimate += CODE_EXPANSION_FACTOR * body_size;
        }
        estimate
    }

    /// Reserve `size` bytes (rounded up to pages) of code space, at
    /// `hint` if given, else at a randomized address.
    pub(crate) fn try_allocate(&self, size: usize, hint: Option<usize>) -> Result<Mmap> {
        assert!(size > 0);
        let size = round_up(size, mmap::page_size());
        let hint = hint.unwrap_or_else(mmap::random_mmap_hint);
        let mem = Mmap::reserve(size, hint)?;
        log::trace!(
            "reserved {:#x}..{:#x} ({} bytes)",
            mem.address(),
            mem.end(),
            mem.size()
        );
        Ok(mem)
    }

    /// Debit the commit budget and commit the pages. Returns false if
    /// the budget cannot cover `size` or the OS refused; the budget is
    /// untouched in either failure case.
    pub(crate) fn commit(&self, start: usize, size: usize) -> bool {
        let page_size = mmap::page_size();
        debug_assert_eq!(start % page_size, 0);
        debug_assert_eq!(size % page_size, 0);

        // Debit with a CAS loop: a plain subtraction could underflow
        // transiently and let racing threads over-commit.
        let remaining = &self.inner.remaining_uncommitted_code_space;
        let mut old = remaining.load(SeqCst);
        loop {
            if old < size {
                return false;
            }
            match remaining.compare_exchange_weak(old, old - size, SeqCst, SeqCst) {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }

        let protection = if self.inner.config.write_protect_code_memory {
            Protection::ReadWrite
        } else {
            Protection::ReadWriteExecute
        };
        match mmap::commit_pages(start, size, protection) {
            Ok(()) => {
                log::trace!("committed {:#x}..{:#x}", start, start + size);
                true
            }
            Err(error) => {
                log::warn!(
                    "failed to commit {:#x}..{:#x}: {:#}",
                    start,
                    start + size,
                    error
                );
                remaining.fetch_add(size, SeqCst);
                false
            }
        }
    }

    /// Record that `[start, end)` belongs to `module` for PC lookups.
    pub(crate) fn assign_ranges(&self, start: usize, end: usize, module: Weak<NativeModule>) {
        self.inner
            .lookup_map
            .write()
            .expect("lookup map poisoned")
            .insert(start, (end, module));
    }

    /// Find the module whose reservations contain `pc`.
    pub fn lookup_native_module(&self, pc: usize) -> Option<Arc<NativeModule>> {
        let map = self.inner.lookup_map.read().expect("lookup map poisoned");
        let (start, (end, module)) = map.range(..=pc).next_back()?;
        debug_assert!(*start <= pc);
        if pc < *end {
            module.upgrade()
        } else {
            None
        }
    }

    /// Find the code object containing `pc`, in any live module.
    pub fn lookup_code(&self, pc: usize) -> Option<Arc<CodeObject>> {
        self.lookup_native_module(pc)?.lookup(pc)
    }

    /// Fast path for callers that know `pc` is exactly an instruction
    /// start. Anything else is a bug and panics.
    pub fn code_from_start_address(&self, pc: usize) -> Arc<CodeObject> {
        let code = self.lookup_code(pc).expect("pc is not managed code");
        assert_eq!(
            pc,
            code.instruction_start(),
            "pc is not an instruction start"
        );
        code
    }

    /// Tear down a dying module: deregister and release its
    /// reservations and credit its committed bytes back to the budget.
    pub(crate) fn free_native_module(
        &self,
        instance_id: usize,
        reservations: &mut Vec<Mmap>,
        committed_code_space: usize,
    ) {
        debug_assert!(self.inner.active.load(SeqCst) >= 1);
        self.inner.active.fetch_sub(1, SeqCst);
        log::trace!("freeing module {}", instance_id);

        let mut map = self.inner.lookup_map.write().expect("lookup map poisoned");
        for vmem in reservations.drain(..) {
            map.remove(&vmem.address());
            log::trace!(
                "released {:#x}..{:#x} ({} bytes)",
                vmem.address(),
                vmem.end(),
                vmem.size()
            );
        }
        drop(map);

        debug_assert_eq!(committed_code_space % mmap::page_size(), 0);
        self.inner
            .remaining_uncommitted_code_space
            .fetch_add(committed_code_space, SeqCst);
    }
}

fn _assert() {
    fn _assert_send_sync<T: Send + Sync>() {}
    _assert_send_sync::<CodeManager>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_budget_is_transactional() {
        let page = mmap::page_size();
        let manager = CodeManager::new(2 * page);
        let mem = Mmap::reserve(4 * page, 0).unwrap();

        // A request of exactly the remaining budget succeeds and leaves
        // it at zero.
        assert!(manager.commit(mem.address(), 2 * page));
        assert_eq!(manager.remaining_uncommitted_code_space(), 0);

        // Further requests fail without disturbing the budget.
        assert!(!manager.commit(mem.address() + 2 * page, page));
        assert_eq!(manager.remaining_uncommitted_code_space(), 0);
    }

    #[test]
    fn lookup_misses_outside_any_module() {
        let manager = CodeManager::new(mmap::page_size() * 16);
        assert!(manager.lookup_native_module(0x1234).is_none());
        assert!(manager.lookup_code(0x1234).is_none());
    }

    #[test]
    fn estimate_grows_with_bodies_and_functions() {
        let small = ModuleEnv {
            num_functions: 1,
            num_imported_functions: 0,
            function_body_sizes: vec![100],
            use_trap_handler: false,
        };
        let large = ModuleEnv {
            num_functions: 10,
            num_imported_functions: 2,
            function_body_sizes: vec![1000; 8],
            use_trap_handler: false,
        };
        let small_estimate = CodeManager::estimate_native_module_size(&small);
        let large_estimate = CodeManager::estimate_native_module_size(&large);
        // 4x expansion over the body bytes, plus fixed overhead.
        assert!(small_estimate >= 4 * 100);
        assert!(large_estimate >= small_estimate + 4 * (8 * 1000 - 100));
    }
}
