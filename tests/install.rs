//! End-to-end installation scenarios driven through the public API.

use std::slice;
use std::sync::Arc;
use wasm_code_manager::reloc::{self, RelocEntry, RelocMode};
use wasm_code_manager::{
    jump_table, trap_registry, CodeDescriptor, CodeKind, CodeManager, FuncIndex, FunctionInfo,
    NativeModule, ProtectedInstruction, RuntimeStubId, Tier, RUNTIME_STUB_COUNT,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn new_manager(max_committed: usize) -> CodeManager {
    init_logging();
    CodeManager::new(max_committed)
}

fn new_module(
    manager: &CodeManager,
    num_functions: u32,
    num_imported: u32,
) -> Arc<NativeModule> {
    manager
        .new_native_module_with_limits(1 << 20, num_functions, num_imported, false, false)
        .unwrap()
}

fn install_runtime_stubs(module: &NativeModule) {
    let buffers: Vec<Vec<u8>> = (0..RUNTIME_STUB_COUNT).map(|_| vec![0x90u8; 32]).collect();
    let descs: Vec<CodeDescriptor> = buffers.iter().map(|b| CodeDescriptor::plain(b)).collect();
    module.set_runtime_stubs(&descs);
}

fn install_plain(module: &NativeModule, index: FuncIndex, len: usize, tier: Tier) -> Arc<wasm_code_manager::CodeObject> {
    let body = vec![0x90u8; len];
    module.add_code(
        &CodeDescriptor::plain(&body),
        index,
        &FunctionInfo::default(),
        tier,
    )
}

fn read_slot(slot_addr: usize) -> &'static [u8] {
    unsafe { slice::from_raw_parts(slot_addr as *const u8, jump_table::SLOT_SIZE) }
}

#[test]
fn happy_install_resolves_runtime_stub_calls() {
    let manager = new_manager(16 * 1024 * 1024);
    let module = new_module(&manager, 1, 0);
    install_runtime_stubs(&module);

    let lazy_bytes = vec![0x90u8; 300];
    let lazy = module
        .set_lazy_builtin(&CodeDescriptor::plain(&lazy_bytes))
        .unwrap();
    assert_eq!(lazy.instructions().len(), 300);
    assert_eq!(lazy.kind(), CodeKind::LazyStub);

    // 1200 bytes of code with one runtime-stub call site at offset 0x40,
    // holding the stub-id tag until relocation resolves it.
    const SITE: usize = 0x40;
    let reloc_bytes = reloc::encode(&[RelocEntry {
        mode: RelocMode::RuntimeStubCall,
        offset: SITE as u32,
    }]);
    let mut buffer = vec![0x90u8; 1200];
    buffer[SITE..SITE + 8]
        .copy_from_slice(&(RuntimeStubId::WasmStackGuard as u64).to_le_bytes());
    buffer.extend_from_slice(&reloc_bytes);
    let desc = CodeDescriptor {
        buffer: &buffer,
        instr_size: 1200,
        reloc_offset: 1200,
        reloc_size: reloc_bytes.len(),
        constant_pool_size: 0,
    };

    let index = FuncIndex::from_u32(0);
    let code = module.add_code(&desc, index, &FunctionInfo::default(), Tier::Baseline);
    assert_eq!(code.instructions().len(), 1200);
    assert_eq!(code.kind(), CodeKind::Function);
    assert_eq!(code.index(), index);
    assert!(module.has_code(index));

    // PC lookup, module- and process-level.
    let inside = code.instruction_start() + 10;
    assert!(Arc::ptr_eq(&module.lookup(inside).unwrap(), &code));
    assert!(Arc::ptr_eq(&manager.lookup_code(inside).unwrap(), &code));
    let owner = manager.lookup_native_module(inside).unwrap();
    assert_eq!(owner.instance_id(), module.instance_id());

    // The call site was rewritten to the stub's address.
    let stub = module.runtime_stub(RuntimeStubId::WasmStackGuard);
    let site_value =
        u64::from_le_bytes(code.instructions()[SITE..SITE + 8].try_into().unwrap());
    assert_eq!(site_value as usize, stub.instruction_start());
    assert_eq!(stub.kind(), CodeKind::RuntimeStub);

    // The function's jump-table slot targets the new code.
    let slot_addr = module.call_target_for_function(index);
    assert_eq!(
        jump_table::slot_target(read_slot(slot_addr)),
        code.instruction_start()
    );
}

#[test]
fn relocation_delta_shifts_internal_references() {
    let manager = new_manager(16 * 1024 * 1024);
    let module = new_module(&manager, 1, 0);

    let reloc_bytes = reloc::encode(&[RelocEntry {
        mode: RelocMode::InternalReference,
        offset: 16,
    }]);
    let mut buffer = vec![0x90u8; 256];
    buffer.extend_from_slice(&reloc_bytes);
    // The site holds an absolute address inside the source buffer;
    // written after the buffer reached its final location.
    let src = buffer.as_ptr() as u64;
    buffer[16..24].copy_from_slice(&(src + 128).to_le_bytes());
    let desc = CodeDescriptor {
        buffer: &buffer,
        instr_size: 256,
        reloc_offset: 256,
        reloc_size: reloc_bytes.len(),
        constant_pool_size: 0,
    };

    let code = module.add_code(
        &desc,
        FuncIndex::from_u32(0),
        &FunctionInfo::default(),
        Tier::Optimizing,
    );
    let site_value =
        u64::from_le_bytes(code.instructions()[16..24].try_into().unwrap());
    assert_eq!(site_value as usize, code.instruction_start() + 128);
}

#[test]
fn jump_table_slot_retargets_on_tier_up() {
    let manager = new_manager(16 * 1024 * 1024);
    let module = new_module(&manager, 6, 0);
    let index = FuncIndex::from_u32(5);

    let baseline = install_plain(&module, index, 400, Tier::Baseline);
    let slot_addr = module.call_target_for_function(index);
    let snapshot1: [u8; 8] = read_slot(slot_addr)[..8].try_into().unwrap();
    assert_eq!(
        jump_table::slot_target(read_slot(slot_addr)),
        baseline.instruction_start()
    );

    let optimized = install_plain(&module, index, 800, Tier::Optimizing);
    let snapshot2: [u8; 8] = read_slot(slot_addr)[..8].try_into().unwrap();
    assert_ne!(snapshot1, snapshot2);
    assert_eq!(
        jump_table::slot_target(read_slot(slot_addr)),
        optimized.instruction_start()
    );

    // The code table now answers with the optimizing code; the old code
    // stays reachable through PC lookup for frames still running it.
    let current = module.code(index).unwrap();
    assert!(Arc::ptr_eq(&current, &optimized));
    assert_eq!(current.tier(), Tier::Optimizing);
    assert!(Arc::ptr_eq(
        &module.lookup(baseline.instruction_start()).unwrap(),
        &baseline
    ));
}

#[test]
fn module_grows_into_multiple_reservations() {
    let manager = new_manager(16 * 1024 * 1024);
    let module = manager
        .new_native_module_with_limits(4096, 2, 0, true, false)
        .unwrap();
    assert_eq!(module.reservation_count(), 1);

    let first = install_plain(&module, FuncIndex::from_u32(0), 512, Tier::Baseline);
    // Larger than any initial reservation page, forcing growth.
    let second = install_plain(&module, FuncIndex::from_u32(1), 3 * 16 * 1024, Tier::Baseline);
    assert!(module.reservation_count() >= 2);

    for code in [&first, &second] {
        let pc = code.instruction_start() + code.instructions().len() / 2;
        assert!(Arc::ptr_eq(&module.lookup(pc).unwrap(), code));
        assert!(Arc::ptr_eq(&manager.lookup_code(pc).unwrap(), code));
    }
}

#[test]
fn freeing_a_module_restores_the_commit_budget() {
    let cap = 16 * 1024 * 1024;
    let manager = new_manager(cap);
    assert_eq!(manager.remaining_uncommitted_code_space(), cap);

    let module = new_module(&manager, 2, 0);
    install_plain(&module, FuncIndex::from_u32(0), 4096, Tier::Baseline);
    install_plain(&module, FuncIndex::from_u32(1), 300, Tier::Baseline);

    let committed = module.committed_code_space();
    assert!(committed > 0);
    assert_eq!(manager.remaining_uncommitted_code_space(), cap - committed);

    let stale_pc = module.code(FuncIndex::from_u32(0)).unwrap().instruction_start();
    drop(module);
    assert_eq!(manager.remaining_uncommitted_code_space(), cap);
    assert!(manager.lookup_code(stale_pc).is_none());
    assert!(manager.lookup_native_module(stale_pc).is_none());
}

#[test]
fn call_target_and_slot_index_round_trip() {
    let manager = new_manager(16 * 1024 * 1024);
    let module = new_module(&manager, 7, 3);
    for raw in 3..7u32 {
        let index = FuncIndex::from_u32(raw);
        let target = module.call_target_for_function(index);
        assert!(module.is_jump_table_slot(target));
        assert_eq!(module.function_index_from_jump_table_slot(target), index);
    }
}

#[test]
fn interpreter_entry_patches_slot_but_not_code_table() {
    let manager = new_manager(16 * 1024 * 1024);
    let module = new_module(&manager, 1, 0);
    let index = FuncIndex::from_u32(0);

    let body = vec![0x90u8; 96];
    let entry = module.add_interpreter_entry(&CodeDescriptor::plain(&body), index);
    assert_eq!(entry.kind(), CodeKind::InterpreterEntry);
    assert_eq!(entry.index(), index);

    // The jump table routes calls to the interpreter while the code
    // table still reports the function as uncompiled.
    assert!(!module.has_code(index));
    let slot_addr = module.call_target_for_function(index);
    assert_eq!(
        jump_table::slot_target(read_slot(slot_addr)),
        entry.instruction_start()
    );
}

#[test]
fn wrapper_code_fills_code_table_without_slot_patch() {
    let manager = new_manager(16 * 1024 * 1024);
    let module = new_module(&manager, 1, 0);
    let index = FuncIndex::from_u32(0);

    let lazy_bytes = vec![0x90u8; 64];
    let lazy = module
        .set_lazy_builtin(&CodeDescriptor::plain(&lazy_bytes))
        .unwrap();

    let body = vec![0x90u8; 128];
    let wrapper =
        module.add_wrapper_code(&CodeDescriptor::plain(&body), index, &FunctionInfo::default());
    assert_eq!(wrapper.kind(), CodeKind::WasmToHostWrapper);
    assert_eq!(wrapper.tier(), Tier::Other);
    assert!(Arc::ptr_eq(&module.code(index).unwrap(), &wrapper));

    // The slot still targets the lazy stub.
    let slot_addr = module.call_target_for_function(index);
    assert_eq!(
        jump_table::slot_target(read_slot(slot_addr)),
        lazy.instruction_start()
    );
}

#[test]
fn lookup_is_half_open() {
    let manager = new_manager(16 * 1024 * 1024);
    let module = new_module(&manager, 1, 0);
    let code = install_plain(&module, FuncIndex::from_u32(0), 256, Tier::Baseline);

    let start = code.instruction_start();
    let end = start + code.instructions().len();
    assert!(Arc::ptr_eq(&module.lookup(start).unwrap(), &code));
    assert!(Arc::ptr_eq(&module.lookup(end - 1).unwrap(), &code));
    assert!(module.lookup(end).is_none());
}

#[test]
fn pc_lookup_is_disjoint_across_modules() {
    let manager = new_manager(16 * 1024 * 1024);
    let module_a = new_module(&manager, 1, 0);
    let module_b = new_module(&manager, 1, 0);
    let code_a = install_plain(&module_a, FuncIndex::from_u32(0), 200, Tier::Baseline);
    let code_b = install_plain(&module_b, FuncIndex::from_u32(0), 200, Tier::Baseline);

    let owner_a = manager
        .lookup_native_module(code_a.instruction_start() + 4)
        .unwrap();
    let owner_b = manager
        .lookup_native_module(code_b.instruction_start() + 4)
        .unwrap();
    assert_eq!(owner_a.instance_id(), module_a.instance_id());
    assert_eq!(owner_b.instance_id(), module_b.instance_id());
    assert_ne!(owner_a.instance_id(), owner_b.instance_id());

    let found = manager.code_from_start_address(code_a.instruction_start());
    assert!(Arc::ptr_eq(&found, &code_a));
}

#[test]
#[should_panic(expected = "instruction start")]
fn code_from_mid_body_address_panics() {
    let manager = new_manager(16 * 1024 * 1024);
    let module = new_module(&manager, 1, 0);
    let code = install_plain(&module, FuncIndex::from_u32(0), 128, Tier::Baseline);
    manager.code_from_start_address(code.instruction_start() + 4);
}

#[test]
fn trap_handler_handles_follow_code_lifetime() {
    let manager = new_manager(16 * 1024 * 1024);
    let module = manager
        .new_native_module_with_limits(1 << 20, 2, 0, false, true)
        .unwrap();
    let before = trap_registry::registered_handler_count();

    let protected = vec![ProtectedInstruction {
        instr_offset: 8,
        landing_offset: 32,
    }];
    let body = vec![0x90u8; 64];
    let info = FunctionInfo {
        protected_instructions: protected,
        ..Default::default()
    };
    let code_a = module.add_code(
        &CodeDescriptor::plain(&body),
        FuncIndex::from_u32(0),
        &info,
        Tier::Baseline,
    );
    let code_b = module.add_code(
        &CodeDescriptor::plain(&body),
        FuncIndex::from_u32(1),
        &info,
        Tier::Baseline,
    );
    assert_eq!(trap_registry::registered_handler_count(), before + 2);

    // The faulting site of each function maps to its landing pad.
    assert_eq!(
        trap_registry::lookup_landing_pad(code_a.instruction_start() + 8),
        Some(code_a.instruction_start() + 32)
    );
    assert_eq!(
        trap_registry::lookup_landing_pad(code_b.instruction_start() + 9),
        None
    );

    // Handles are released exactly once, when the owning module dies.
    drop(code_a);
    drop(code_b);
    drop(module);
    assert_eq!(trap_registry::registered_handler_count(), before);
}
