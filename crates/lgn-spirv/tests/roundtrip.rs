//! Round-trip and injection coverage over a hand-assembled compute module.

use byteorder::{ByteOrder, LittleEndian};
use lgn_shader_il::{Emitter, Op, ValueId};
use lgn_spirv::{spec, SpirvModule};

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = vec![0u8; words.len() * 4];
    LittleEndian::write_u32_into(words, &mut bytes);
    bytes
}

/// A small but structurally complete compute module:
/// a private float variable stored from a float constant.
fn compute_module() -> Vec<u32> {
    const MAIN: u32 = 1;
    const T_VOID: u32 = 2;
    const T_FN: u32 = 3;
    const T_F32: u32 = 4;
    const T_U32: u32 = 5;
    const C_ONE: u32 = 6;
    const T_PTR: u32 = 7;
    const VAR: u32 = 8;
    const LABEL: u32 = 9;

    vec![
        spec::MAGIC,
        0x0001_0000,
        0,
        20,
        0,
        // OpCapability Shader
        spec::pack_op(spec::OP_CAPABILITY, 2),
        1,
        // OpMemoryModel Logical GLSL450
        spec::pack_op(spec::OP_MEMORY_MODEL, 3),
        0,
        1,
        // OpEntryPoint GLCompute %main "m"
        spec::pack_op(spec::OP_ENTRY_POINT, 4),
        5,
        MAIN,
        0x0000_006d,
        // OpExecutionMode %main LocalSize 1 1 1
        spec::pack_op(spec::OP_EXECUTION_MODE, 6),
        MAIN,
        17,
        1,
        1,
        1,
        // Types and constants.
        spec::pack_op(spec::OP_TYPE_VOID, 2),
        T_VOID,
        spec::pack_op(spec::OP_TYPE_FUNCTION, 3),
        T_FN,
        T_VOID,
        spec::pack_op(spec::OP_TYPE_FLOAT, 3),
        T_F32,
        32,
        spec::pack_op(spec::OP_TYPE_INT, 4),
        T_U32,
        32,
        0,
        spec::pack_op(spec::OP_CONSTANT, 4),
        T_F32,
        C_ONE,
        0x3f80_0000,
        spec::pack_op(spec::OP_TYPE_POINTER, 4),
        T_PTR,
        spec::STORAGE_CLASS_PRIVATE,
        T_F32,
        spec::pack_op(spec::OP_VARIABLE, 4),
        T_PTR,
        VAR,
        spec::STORAGE_CLASS_PRIVATE,
        // Function body.
        spec::pack_op(spec::OP_FUNCTION, 5),
        T_VOID,
        MAIN,
        0,
        T_FN,
        spec::pack_op(spec::OP_LABEL, 2),
        LABEL,
        spec::pack_op(spec::OP_STORE, 3),
        VAR,
        C_ONE,
        spec::pack_op(spec::OP_RETURN, 1),
        spec::pack_op(spec::OP_FUNCTION_END, 1),
    ]
}

#[test]
fn test_roundtrip_identity_on_parsed_program() {
    let bytes = words_to_bytes(&compute_module());
    let mut module = SpirvModule::parse(&bytes, 11).unwrap();

    // Building the IL without mutating it must not disturb emission.
    module.program().unwrap();
    assert_eq!(module.emit().unwrap(), bytes);
}

#[test]
fn test_parse_structures_function() {
    let bytes = words_to_bytes(&compute_module());
    let mut module = SpirvModule::parse(&bytes, 11).unwrap();

    let program = module.program().unwrap();
    assert_eq!(program.functions().len(), 1);

    let function = &program.functions()[0];
    assert_eq!(function.blocks().len(), 1);

    let block = &function.blocks()[0];
    assert_eq!(block.len(), 2);
    assert!(matches!(block.instructions()[0].op, Op::Store { .. }));
    assert!(matches!(block.instructions()[1].op, Op::Return { .. }));
    assert!(!program.is_dirty());
}

#[test]
fn test_traceback_points_at_store() {
    let bytes = words_to_bytes(&compute_module());
    let mut module = SpirvModule::parse(&bytes, 11).unwrap();
    module.program().unwrap();

    // Word offset of the OpStore in the assembled stream.
    let store_offset = compute_module()
        .iter()
        .position(|w| *w == spec::pack_op(spec::OP_STORE, 3))
        .unwrap() as u32;

    let traceback = module.traceback(store_offset).unwrap();
    assert_eq!(traceback.instruction_index, 0);
}

#[test]
fn test_injected_check_reemits_and_reparses() {
    let bytes = words_to_bytes(&compute_module());
    let mut module = SpirvModule::parse(&bytes, 11).unwrap();

    let program = module.program().unwrap();
    let fid = program.functions()[0].id();
    let entry = program.functions()[0].blocks()[0].id();

    // The stored value, recovered the way a feature injector would.
    let stored = match &program.functions()[0].blocks()[0].instructions()[0].op {
        Op::Store { value, .. } => *value,
        other => panic!("unexpected op {:?}", other),
    };

    // Split ahead of the store, check the value, export on failure.
    let resume = program.split_block(fid, entry, 0).unwrap();
    let detour = program.alloc_block(fid).unwrap();

    let mut pre = Emitter::new(program, fid, entry);
    let is_nan = pre.is_nan(stored);
    let is_inf = pre.is_inf(stored);
    let failed = pre.logical_or(is_nan, is_inf);
    pre.branch_conditional(failed, detour, resume, Some(resume));

    let mut oob = Emitter::new(program, fid, detour);
    let sguid = oob.uint32(42);
    let one = oob.uint32(1);
    let zero = oob.uint32(0);
    let nan_flag = oob.select(is_nan, one, zero);
    oob.export(0, &[sguid, nan_flag]);
    oob.branch(resume);

    assert!(program.is_dirty());

    let emitted = module.emit().unwrap();
    assert_ne!(emitted, bytes);

    // The re-emitted stream is itself a valid parse source with the export
    // plumbing present.
    let reparsed = SpirvModule::parse(&emitted, 11).unwrap();
    assert!(reparsed.header().bound > 20);
    assert!(reparsed
        .instructions()
        .iter()
        .any(|i| i.opcode == spec::OP_ATOMIC_I_ADD));
    assert!(reparsed
        .instructions()
        .iter()
        .any(|i| i.opcode == spec::OP_TYPE_RUNTIME_ARRAY));
    assert!(reparsed
        .instructions()
        .iter()
        .any(|i| i.opcode == spec::OP_SELECTION_MERGE));

    // Unsigned 32-bit stores of the original module words survive verbatim.
    let original_store = [spec::pack_op(spec::OP_STORE, 3), 8, 6];
    let words: Vec<u32> = reparsed.words().to_vec();
    assert!(words
        .windows(original_store.len())
        .any(|window| window == original_store));
}

#[test]
fn test_zero_instruction_module_roundtrips() {
    let words = vec![spec::MAGIC, 0x0001_0000, 0, 1, 0];
    let bytes = words_to_bytes(&words);
    let module = SpirvModule::parse(&bytes, 3).unwrap();
    assert!(module.instructions().is_empty());
    assert_eq!(module.emit().unwrap(), bytes);
}
