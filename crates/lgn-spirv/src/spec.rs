//! The subset of the SPIR-V physical specification the codec touches.
//!
//! Instructions outside this set round-trip through the IL as unexposed
//! payloads; only their layout (`word_count << 16 | opcode`) matters.

/// Magic number of a little-endian SPIR-V stream.
pub const MAGIC: u32 = 0x0723_0203;

/// Generator word stamped on modules the codec re-emits with injected code.
pub const GENERATOR: u32 = 0;

/// Word count of the module header.
pub const HEADER_WORD_COUNT: usize = 5;

// Module preamble.
pub const OP_SOURCE_CONTINUED: u16 = 2;
pub const OP_SOURCE: u16 = 3;
pub const OP_NAME: u16 = 5;
pub const OP_MEMBER_NAME: u16 = 6;
pub const OP_STRING: u16 = 7;
pub const OP_LINE: u16 = 8;
pub const OP_EXTENSION: u16 = 10;
pub const OP_EXT_INST_IMPORT: u16 = 11;
pub const OP_MEMORY_MODEL: u16 = 14;
pub const OP_ENTRY_POINT: u16 = 15;
pub const OP_EXECUTION_MODE: u16 = 16;
pub const OP_CAPABILITY: u16 = 17;

// Types.
pub const OP_TYPE_VOID: u16 = 19;
pub const OP_TYPE_BOOL: u16 = 20;
pub const OP_TYPE_INT: u16 = 21;
pub const OP_TYPE_FLOAT: u16 = 22;
pub const OP_TYPE_VECTOR: u16 = 23;
pub const OP_TYPE_MATRIX: u16 = 24;
pub const OP_TYPE_IMAGE: u16 = 25;
pub const OP_TYPE_SAMPLER: u16 = 26;
pub const OP_TYPE_SAMPLED_IMAGE: u16 = 27;
pub const OP_TYPE_ARRAY: u16 = 28;
pub const OP_TYPE_RUNTIME_ARRAY: u16 = 29;
pub const OP_TYPE_STRUCT: u16 = 30;
pub const OP_TYPE_POINTER: u16 = 32;
pub const OP_TYPE_FUNCTION: u16 = 33;

// Constants.
pub const OP_CONSTANT_TRUE: u16 = 41;
pub const OP_CONSTANT_FALSE: u16 = 42;
pub const OP_CONSTANT: u16 = 43;
pub const OP_CONSTANT_COMPOSITE: u16 = 44;
pub const OP_CONSTANT_NULL: u16 = 46;

// Functions and memory.
pub const OP_FUNCTION: u16 = 54;
pub const OP_FUNCTION_PARAMETER: u16 = 55;
pub const OP_FUNCTION_END: u16 = 56;
pub const OP_FUNCTION_CALL: u16 = 57;
pub const OP_VARIABLE: u16 = 59;
pub const OP_LOAD: u16 = 61;
pub const OP_STORE: u16 = 62;
pub const OP_ACCESS_CHAIN: u16 = 65;
pub const OP_DECORATE: u16 = 71;
pub const OP_MEMBER_DECORATE: u16 = 72;

// Composites.
pub const OP_COMPOSITE_CONSTRUCT: u16 = 80;
pub const OP_COMPOSITE_EXTRACT: u16 = 81;

// Arithmetic.
pub const OP_S_NEGATE: u16 = 126;
pub const OP_F_NEGATE: u16 = 127;
pub const OP_I_ADD: u16 = 128;
pub const OP_F_ADD: u16 = 129;
pub const OP_I_SUB: u16 = 130;
pub const OP_F_SUB: u16 = 131;
pub const OP_I_MUL: u16 = 132;
pub const OP_F_MUL: u16 = 133;
pub const OP_U_DIV: u16 = 134;
pub const OP_S_DIV: u16 = 135;
pub const OP_F_DIV: u16 = 136;
pub const OP_U_MOD: u16 = 137;

// Relational.
pub const OP_ANY: u16 = 154;
pub const OP_ALL: u16 = 155;
pub const OP_IS_NAN: u16 = 156;
pub const OP_IS_INF: u16 = 157;
pub const OP_LOGICAL_OR: u16 = 166;
pub const OP_LOGICAL_AND: u16 = 167;
pub const OP_LOGICAL_NOT: u16 = 168;
pub const OP_SELECT: u16 = 169;
pub const OP_I_EQUAL: u16 = 170;
pub const OP_I_NOT_EQUAL: u16 = 171;
pub const OP_U_GREATER_THAN: u16 = 172;
pub const OP_S_GREATER_THAN: u16 = 173;
pub const OP_U_GREATER_THAN_EQUAL: u16 = 174;
pub const OP_S_GREATER_THAN_EQUAL: u16 = 175;
pub const OP_U_LESS_THAN: u16 = 176;
pub const OP_S_LESS_THAN: u16 = 177;
pub const OP_U_LESS_THAN_EQUAL: u16 = 178;
pub const OP_S_LESS_THAN_EQUAL: u16 = 179;

// Bit operations.
pub const OP_SHIFT_RIGHT_LOGICAL: u16 = 194;
pub const OP_SHIFT_LEFT_LOGICAL: u16 = 196;
pub const OP_BITWISE_OR: u16 = 197;
pub const OP_BITWISE_XOR: u16 = 198;
pub const OP_BITWISE_AND: u16 = 199;
pub const OP_NOT: u16 = 200;

// Atomics.
pub const OP_ATOMIC_I_ADD: u16 = 234;
pub const OP_ATOMIC_AND: u16 = 240;
pub const OP_ATOMIC_OR: u16 = 241;

// Control flow.
pub const OP_PHI: u16 = 245;
pub const OP_LOOP_MERGE: u16 = 246;
pub const OP_SELECTION_MERGE: u16 = 247;
pub const OP_LABEL: u16 = 248;
pub const OP_BRANCH: u16 = 249;
pub const OP_BRANCH_CONDITIONAL: u16 = 250;
pub const OP_SWITCH: u16 = 251;
pub const OP_RETURN: u16 = 253;
pub const OP_RETURN_VALUE: u16 = 254;
pub const OP_UNREACHABLE: u16 = 255;

// Storage classes.
pub const STORAGE_CLASS_UNIFORM_CONSTANT: u32 = 0;
pub const STORAGE_CLASS_INPUT: u32 = 1;
pub const STORAGE_CLASS_UNIFORM: u32 = 2;
pub const STORAGE_CLASS_OUTPUT: u32 = 3;
pub const STORAGE_CLASS_WORKGROUP: u32 = 4;
pub const STORAGE_CLASS_PRIVATE: u32 = 6;
pub const STORAGE_CLASS_FUNCTION: u32 = 7;
pub const STORAGE_CLASS_STORAGE_BUFFER: u32 = 12;

// Decorations.
pub const DECORATION_BLOCK: u32 = 2;
pub const DECORATION_ARRAY_STRIDE: u32 = 6;
pub const DECORATION_OFFSET: u32 = 35;
pub const DECORATION_BINDING: u32 = 33;
pub const DECORATION_DESCRIPTOR_SET: u32 = 34;

// Memory scopes / semantics for injected atomics.
pub const SCOPE_DEVICE: u32 = 1;
pub const MEMORY_SEMANTICS_NONE: u32 = 0;

/// Pack an opcode and word count into the leading instruction word.
pub fn pack_op(opcode: u16, word_count: u16) -> u32 {
    (u32::from(word_count) << 16) | u32::from(opcode)
}

/// Split the leading instruction word into `(opcode, word_count)`.
pub fn unpack_op(word: u32) -> (u16, u16) {
    ((word & 0xFFFF) as u16, (word >> 16) as u16)
}

/// Whether the opcode belongs to the global types/constants/variables
/// section, which is where injected globals are appended.
pub fn is_global_section_op(opcode: u16) -> bool {
    matches!(
        opcode,
        OP_TYPE_VOID
            ..=OP_TYPE_FUNCTION
    ) || matches!(
        opcode,
        OP_CONSTANT_TRUE | OP_CONSTANT_FALSE | OP_CONSTANT | OP_CONSTANT_COMPOSITE
            | OP_CONSTANT_NULL
            | OP_VARIABLE
    )
}

/// Whether the opcode belongs to the annotation section.
pub fn is_annotation_op(opcode: u16) -> bool {
    matches!(opcode, OP_DECORATE | OP_MEMBER_DECORATE)
}
