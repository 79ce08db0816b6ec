use smallvec::SmallVec;

use crate::{BlockId, FunctionId, ValueId};

/// Sentinel for instructions with no binary origin (injected code).
pub const INVALID_CODE_OFFSET: u32 = u32::MAX;

/// Position of an instruction in the original binary, in format-specific
/// units (words for SPIR-V, record offsets for DXIL).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSpan {
    pub code_offset: u32,
}

impl SourceSpan {
    pub const INVALID: Self = Self {
        code_offset: INVALID_CODE_OFFSET,
    };

    pub fn new(code_offset: u32) -> Self {
        Self { code_offset }
    }

    pub fn is_valid(self) -> bool {
        self.code_offset != INVALID_CODE_OFFSET
    }
}

impl Default for SourceSpan {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Two-operand operations, arithmetic through comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitOr,
    BitAnd,
    BitXor,
    BitShiftLeft,
    BitShiftRight,
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    LogicalAnd,
    LogicalOr,
}

/// Single-operand operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
    IsInf,
    IsNan,
    Any,
    All,
}

/// Atomic read-modify-write operations on buffer elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Or,
    And,
    Add,
    Exchange,
    CompareExchange,
}

/// Built-in kernel inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelValue {
    DispatchThreadId,
    GroupId,
    ThreadIdInGroup,
    FlattenedThreadIdInGroup,
}

/// Instruction payload. One variant per operation; codecs preserve what
/// they do not model through [`Op::Unexposed`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Load {
        pointer: ValueId,
    },
    Store {
        pointer: ValueId,
        value: ValueId,
    },
    AddressChain {
        base: ValueId,
        indices: SmallVec<[ValueId; 4]>,
    },
    Extract {
        composite: ValueId,
        index: u32,
    },
    Construct {
        components: SmallVec<[ValueId; 4]>,
    },
    Binary {
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    Unary {
        op: UnaryOp,
        value: ValueId,
    },
    Select {
        condition: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    },
    Branch {
        target: BlockId,
    },
    BranchConditional {
        condition: ValueId,
        on_true: BlockId,
        on_false: BlockId,
        /// Structured control-flow merge block, when the source format
        /// requires one.
        merge: Option<BlockId>,
    },
    Switch {
        selector: ValueId,
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    Phi {
        incoming: Vec<(ValueId, BlockId)>,
    },
    Return {
        value: Option<ValueId>,
    },
    SampleTexture {
        texture: ValueId,
        sampler: ValueId,
        coordinate: ValueId,
    },
    LoadTexture {
        texture: ValueId,
        coordinate: ValueId,
    },
    StoreTexture {
        texture: ValueId,
        coordinate: ValueId,
        texel: ValueId,
    },
    LoadBuffer {
        buffer: ValueId,
        index: ValueId,
    },
    StoreBuffer {
        buffer: ValueId,
        index: ValueId,
        value: ValueId,
    },
    StoreOutput {
        index: u32,
        value: ValueId,
    },
    Atomic {
        op: AtomicOp,
        buffer: ValueId,
        index: ValueId,
        value: ValueId,
        comparator: Option<ValueId>,
    },
    Call {
        function: FunctionId,
        arguments: Vec<ValueId>,
    },
    KernelValue {
        value: KernelValue,
    },
    /// Emission of a diagnostic record into the export stream with the
    /// given export id.
    Export {
        export_id: u32,
        values: SmallVec<[ValueId; 4]>,
    },
    /// Instruction the codec does not model. The raw words are preserved
    /// verbatim on re-emission.
    Unexposed {
        opcode: u32,
        words: Vec<u32>,
    },
}

/// A single IL instruction: payload, optional SSA result, source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub result: Option<ValueId>,
    pub source: SourceSpan,
}

impl Instruction {
    pub fn new(op: Op, result: Option<ValueId>) -> Self {
        Self {
            op,
            result,
            source: SourceSpan::INVALID,
        }
    }

    pub fn with_source(op: Op, result: Option<ValueId>, source: SourceSpan) -> Self {
        Self { op, result, source }
    }

    /// Whether the instruction ends a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.op,
            Op::Branch { .. } | Op::BranchConditional { .. } | Op::Switch { .. } | Op::Return { .. }
        )
    }

    /// Value stored by the instruction, for the store-like shapes the
    /// feature injectors inspect.
    pub fn stored_value(&self) -> Option<ValueId> {
        match &self.op {
            Op::Store { value, .. }
            | Op::StoreBuffer { value, .. }
            | Op::StoreOutput { value, .. } => Some(*value),
            Op::StoreTexture { texel, .. } => Some(*texel),
            _ => None,
        }
    }

    /// Resource operand of the instruction, if any.
    pub fn resource(&self) -> Option<ValueId> {
        match &self.op {
            Op::StoreBuffer { buffer, .. } | Op::LoadBuffer { buffer, .. } => Some(*buffer),
            Op::StoreTexture { texture, .. }
            | Op::LoadTexture { texture, .. }
            | Op::SampleTexture { texture, .. } => Some(*texture),
            _ => None,
        }
    }
}
