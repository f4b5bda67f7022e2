//! Process-global registry of code regions that rely on the signal
//! handler for memory-bounds traps.
//!
//! Generated code compiled without explicit bounds checks faults on
//! out-of-bounds accesses; the signal handler consults this registry to
//! decide whether a faulting PC belongs to such code and where its
//! landing pad is. Registration returns an integer handle which the
//! owning code object releases exactly once when it dies.

use lazy_static::lazy_static;
use std::sync::RwLock;

/// One potentially-faulting instruction in a registered code region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtectedInstruction {
    /// Offset of the instruction from the start of the code.
    pub instr_offset: u32,
    /// Offset of the landing pad the signal handler resumes at.
    pub landing_offset: u32,
}

struct HandlerData {
    base: usize,
    size: usize,
    protected: Vec<ProtectedInstruction>,
}

#[derive(Default)]
struct HandlerRegistry {
    entries: Vec<Option<HandlerData>>,
    free: Vec<usize>,
}

lazy_static! {
    static ref REGISTRY: RwLock<HandlerRegistry> = RwLock::new(HandlerRegistry::default());
}

/// Register a code region with the signal handler. Returns the handle to
/// release the data with, or a negative value if registration failed.
pub fn register_handler_data(
    base: usize,
    size: usize,
    protected: &[ProtectedInstruction],
) -> i32 {
    let mut registry = REGISTRY.write().expect("trap handler registry poisoned");
    let data = HandlerData {
        base,
        size,
        protected: protected.to_vec(),
    };
    let index = match registry.free.pop() {
        Some(index) => {
            debug_assert!(registry.entries[index].is_none());
            registry.entries[index] = Some(data);
            index
        }
        None => {
            registry.entries.push(Some(data));
            registry.entries.len() - 1
        }
    };
    if index > i32::MAX as usize {
        registry.entries[index] = None;
        registry.free.push(index);
        return -1;
    }
    index as i32
}

/// Release a handle returned by [`register_handler_data`]. Releasing a
/// handle that is not live is a bug.
pub fn release_handler_data(index: i32) {
    let mut registry = REGISTRY.write().expect("trap handler registry poisoned");
    let index = usize::try_from(index).expect("invalid trap handler index");
    let entry = registry
        .entries
        .get_mut(index)
        .expect("invalid trap handler index");
    assert!(entry.is_some(), "trap handler data released twice");
    *entry = None;
    registry.free.push(index);
}

/// Map a faulting PC to the address of its landing pad, if the PC is a
/// registered protected instruction. Called from the signal handler.
pub fn lookup_landing_pad(pc: usize) -> Option<usize> {
    let registry = REGISTRY.read().expect("trap handler registry poisoned");
    for entry in registry.entries.iter().flatten() {
        if pc < entry.base || pc >= entry.base + entry.size {
            continue;
        }
        let offset = (pc - entry.base) as u32;
        for protected in &entry.protected {
            if protected.instr_offset == offset {
                return Some(entry.base + protected.landing_offset as usize);
            }
        }
    }
    None
}

/// Number of live registrations, for diagnostics.
pub fn registered_handler_count() -> usize {
    let registry = REGISTRY.read().expect("trap handler registry poisoned");
    registry.entries.iter().flatten().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_release_and_reuse() {
        let protected = [ProtectedInstruction {
            instr_offset: 4,
            landing_offset: 16,
        }];

        let a = register_handler_data(0x10_0000, 0x100, &protected);
        let b = register_handler_data(0x20_0000, 0x100, &protected);
        assert!(a >= 0 && b >= 0);
        assert_ne!(a, b);
        assert!(registered_handler_count() >= 2);

        assert_eq!(lookup_landing_pad(0x10_0004), Some(0x10_0010));
        assert_eq!(lookup_landing_pad(0x10_0008), None);
        assert_eq!(lookup_landing_pad(0x30_0004), None);

        release_handler_data(a);
        assert_eq!(lookup_landing_pad(0x10_0004), None);

        let c = register_handler_data(0x30_0000, 0x100, &protected);
        assert!(c >= 0);
        assert_eq!(lookup_landing_pad(0x30_0004), Some(0x30_0010));
        release_handler_data(b);
        release_handler_data(c);
    }
}
