use smallvec::SmallVec;

use crate::{
    AtomicOp, BinaryOp, BlockId, Constant, FunctionId, Instruction, KernelValue, Op, Program,
    SourceSpan, Type, TypeId, UnaryOp, ValueId,
};

/// Instruction emitter appending to one basic block of one function.
///
/// This is the API the feature injectors build their checks with. Emitted
/// instructions carry an invalid source span (they have no binary origin)
/// unless [`Emitter::set_source`] was called.
pub struct Emitter<'a> {
    program: &'a mut Program,
    function: FunctionId,
    block: BlockId,
    source: SourceSpan,
}

impl<'a> Emitter<'a> {
    pub fn new(program: &'a mut Program, function: FunctionId, block: BlockId) -> Self {
        Self {
            program,
            function,
            block,
            source: SourceSpan::INVALID,
        }
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Redirect emission to another block of the same function.
    pub fn set_block(&mut self, block: BlockId) {
        self.block = block;
    }

    /// Source span stamped on subsequently emitted instructions.
    pub fn set_source(&mut self, source: SourceSpan) {
        self.source = source;
    }

    pub fn program(&mut self) -> &mut Program {
        self.program
    }

    /// Materialize an unsigned 32-bit constant.
    pub fn uint32(&mut self, value: u32) -> ValueId {
        let type_id = self.program.types.get_or_add(Type::Int {
            bit_width: 32,
            signed: false,
        });
        self.program
            .intern_constant(Constant::Int(i64::from(value)), type_id)
    }

    /// Materialize a boolean constant.
    pub fn bool(&mut self, value: bool) -> ValueId {
        let type_id = self.program.types.get_or_add(Type::Bool);
        self.program.intern_constant(Constant::Bool(value), type_id)
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary_like(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary_like(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary_like(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary_like(BinaryOp::Div, lhs, rhs)
    }

    pub fn bit_or(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary_like(BinaryOp::BitOr, lhs, rhs)
    }

    pub fn bit_and(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary_like(BinaryOp::BitAnd, lhs, rhs)
    }

    pub fn logical_or(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        let bool_ty = self.program.types.get_or_add(Type::Bool);
        self.binary_typed(BinaryOp::LogicalOr, lhs, rhs, bool_ty)
    }

    pub fn logical_and(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        let bool_ty = self.program.types.get_or_add(Type::Bool);
        self.binary_typed(BinaryOp::LogicalAnd, lhs, rhs, bool_ty)
    }

    pub fn bit_shift_left(&mut self, value: ValueId, shift: ValueId) -> ValueId {
        self.binary_like(BinaryOp::BitShiftLeft, value, shift)
    }

    pub fn bit_shift_right(&mut self, value: ValueId, shift: ValueId) -> ValueId {
        self.binary_like(BinaryOp::BitShiftRight, value, shift)
    }

    pub fn equal(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        let bool_ty = self.program.types.get_or_add(Type::Bool);
        self.binary_typed(BinaryOp::Equal, lhs, rhs, bool_ty)
    }

    pub fn less_than(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        let bool_ty = self.program.types.get_or_add(Type::Bool);
        self.binary_typed(BinaryOp::LessThan, lhs, rhs, bool_ty)
    }

    pub fn greater_than_equal(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        let bool_ty = self.program.types.get_or_add(Type::Bool);
        self.binary_typed(BinaryOp::GreaterThanEqual, lhs, rhs, bool_ty)
    }

    pub fn is_inf(&mut self, value: ValueId) -> ValueId {
        self.unary_bool(UnaryOp::IsInf, value)
    }

    pub fn is_nan(&mut self, value: ValueId) -> ValueId {
        self.unary_bool(UnaryOp::IsNan, value)
    }

    /// Reduce a boolean vector to a scalar: true if any component is true.
    pub fn any(&mut self, value: ValueId) -> ValueId {
        self.unary_bool(UnaryOp::Any, value)
    }

    pub fn all(&mut self, value: ValueId) -> ValueId {
        self.unary_bool(UnaryOp::All, value)
    }

    pub fn not(&mut self, value: ValueId) -> ValueId {
        self.unary_bool(UnaryOp::Not, value)
    }

    pub fn select(&mut self, condition: ValueId, on_true: ValueId, on_false: ValueId) -> ValueId {
        let result_type = self.program.value_type(on_true).unwrap_or(TypeId::INVALID);
        let result = self.allocate_result(result_type);
        self.push(
            Op::Select {
                condition,
                on_true,
                on_false,
            },
            Some(result),
        );
        result
    }

    pub fn load_buffer(&mut self, buffer: ValueId, index: ValueId) -> ValueId {
        let u32_ty = self.program.types.get_or_add(Type::Int {
            bit_width: 32,
            signed: false,
        });
        let result = self.allocate_result(u32_ty);
        self.push(Op::LoadBuffer { buffer, index }, Some(result));
        result
    }

    pub fn store_buffer(&mut self, buffer: ValueId, index: ValueId, value: ValueId) {
        self.push(Op::StoreBuffer { buffer, index, value }, None);
    }

    pub fn atomic_or(&mut self, buffer: ValueId, index: ValueId, value: ValueId) -> ValueId {
        let u32_ty = self.program.types.get_or_add(Type::Int {
            bit_width: 32,
            signed: false,
        });
        let result = self.allocate_result(u32_ty);
        self.push(
            Op::Atomic {
                op: AtomicOp::Or,
                buffer,
                index,
                value,
                comparator: None,
            },
            Some(result),
        );
        result
    }

    pub fn kernel_value(&mut self, value: KernelValue) -> ValueId {
        let u32_ty = self.program.types.get_or_add(Type::Int {
            bit_width: 32,
            signed: false,
        });
        let result = self.allocate_result(u32_ty);
        self.push(Op::KernelValue { value }, Some(result));
        result
    }

    /// Emit a diagnostic record into the export stream `export_id`.
    pub fn export(&mut self, export_id: u32, values: &[ValueId]) {
        self.push(
            Op::Export {
                export_id,
                values: SmallVec::from_slice(values),
            },
            None,
        );
    }

    pub fn branch(&mut self, target: BlockId) {
        self.push(Op::Branch { target }, None);
    }

    pub fn branch_conditional(
        &mut self,
        condition: ValueId,
        on_true: BlockId,
        on_false: BlockId,
        merge: Option<BlockId>,
    ) {
        self.push(
            Op::BranchConditional {
                condition,
                on_true,
                on_false,
                merge,
            },
            None,
        );
    }

    pub fn return_void(&mut self) {
        self.push(Op::Return { value: None }, None);
    }

    fn binary_like(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let result_type = self.program.value_type(lhs).unwrap_or(TypeId::INVALID);
        self.binary_typed(op, lhs, rhs, result_type)
    }

    fn binary_typed(
        &mut self,
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
        result_type: TypeId,
    ) -> ValueId {
        let result = self.allocate_result(result_type);
        self.push(Op::Binary { op, lhs, rhs }, Some(result));
        result
    }

    fn unary_bool(&mut self, op: UnaryOp, value: ValueId) -> ValueId {
        let bool_ty = self.program.types.get_or_add(Type::Bool);
        let result = self.allocate_result(bool_ty);
        self.push(Op::Unary { op, value }, Some(result));
        result
    }

    fn allocate_result(&mut self, result_type: TypeId) -> ValueId {
        let result = self.program.ids_mut().allocate_value();
        self.program.set_value_type(result, result_type);
        result
    }

    fn push(&mut self, op: Op, result: Option<ValueId>) {
        let instruction = Instruction::with_source(op, result, self.source);
        let block = self.block;
        self.program
            .function_mut(self.function)
            .and_then(|f| f.block_mut(block))
            .expect("emitter block must exist")
            .push(instruction);
    }
}
