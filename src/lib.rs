//! Runtime management of executable code for WebAssembly modules.
//!
//! This crate owns every byte of machine code generated for the wasm
//! modules loaded into a process. A process-wide [`CodeManager`] hands out
//! virtual-memory reservations and enforces a global committed-bytes cap;
//! each loaded module gets a [`NativeModule`] which carves code space out
//! of its reservations, copies compiler output into place, applies
//! relocations, and publishes the result through a per-function jump
//! table so that calls can be redirected (lazy stub → compiled code →
//! optimized replacement) without rewriting call sites.
//!
//! Code installed here is looked up by program counter during stack
//! walking and trap handling, so all bookkeeping is kept sorted by
//! address: a module's owned code supports `O(log n)` PC lookup and the
//! manager maps any PC back to the owning module.

#[macro_use]
extern crate more_asserts;

use cranelift_entity::entity_impl;

mod code;
mod icache;
pub mod jump_table;
mod manager;
mod mmap;
mod module;
mod pool;
pub mod reloc;
pub mod trap_registry;

pub use crate::code::{
    CodeDescriptor, CodeKind, CodeObject, FunctionInfo, RuntimeStubId, Tier, RUNTIME_STUB_COUNT,
};
pub use crate::manager::{CodeManager, CodeManagerConfig};
pub use crate::mmap::Protection;
pub use crate::module::{ModuleEnv, NativeModule, NativeModuleModificationScope};
pub use crate::pool::{AddressRange, DisjointPool};
pub use crate::trap_registry::ProtectedInstruction;

/// Alignment of every code allocation, in bytes.
pub const CODE_ALIGNMENT: usize = 64;

/// Upper bound on the code reservation of a single module; also the size
/// reserved up front on platforms that require a contiguous code range.
pub const MAX_WASM_CODE_MEMORY: usize = 1024 * 1024 * 1024;

/// Index of any function in a module, imported functions included.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct FuncIndex(u32);
entity_impl!(FuncIndex);

/// Index of a function declared (not imported) by a module. Declared
/// functions are numbered from zero, after the imports.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct DeclaredFuncIndex(u32);
entity_impl!(DeclaredFuncIndex);

pub(crate) fn round_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + (align - 1)) & !(align - 1)
}
