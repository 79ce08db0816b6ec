//! Physical re-emission of a mutated program.
//!
//! Clean functions are copied by word range from the parse source; dirty
//! functions are regenerated instruction by instruction, with injected IL
//! lowered back to physical form. New types, constants, and the export
//! plumbing are spliced into the module's global sections.

use fnv::FnvHashMap;
use lgn_shader_il::{
    AddressSpace, AtomicOp, BinaryOp, Constant, Function, Instruction, Op, Program, Type, TypeId,
    UnaryOp, ValueId,
};

use crate::{
    builder::{CodecMaps, FunctionMeta},
    module::{words_to_bytes, ProgramBundle, SpirvModule},
    spec, CodecError, Result,
};

/// Descriptor bindings the injected export plumbing is declared against.
///
/// The instrumented pipeline layout reserves this set for the layer; the
/// counter buffer holds one dword per export id, the stream buffer receives
/// fixed-stride records.
#[derive(Debug, Clone, Copy)]
pub struct InjectionBindings {
    pub descriptor_set: u32,
    pub counter_binding: u32,
    pub stream_binding: u32,
}

impl Default for InjectionBindings {
    fn default() -> Self {
        Self {
            descriptor_set: 7,
            counter_binding: 0,
            stream_binding: 1,
        }
    }
}

pub(crate) fn emit(
    module: &SpirvModule,
    bundle: &ProgramBundle,
    bindings: &InjectionBindings,
) -> Result<Vec<u8>> {
    let program = &bundle.program;
    let maps = &bundle.maps;

    if program.functions().len() != maps.functions.len() {
        return Err(CodecError::EmissionFailed(
            "function count diverged from parse".to_string(),
        ));
    }

    let mut ctx = WriterContext::new(module, program, maps, bindings);

    // Emit bodies first so injected globals are known before assembly.
    let mut bodies: Vec<Option<Vec<u32>>> = Vec::with_capacity(program.functions().len());
    for (function, meta) in program.functions().iter().zip(&maps.functions) {
        if function.is_dirty() {
            bodies.push(Some(ctx.emit_function(function, meta)?));
        } else {
            bodies.push(None);
        }
    }

    let words = module.words();
    let mut out = Vec::with_capacity(words.len() + ctx.new_globals.len() + ctx.new_annotations.len());

    // Header, with the advanced id bound.
    out.push(spec::MAGIC);
    out.push(module.header().version);
    out.push(module.header().generator);
    out.push(ctx.next_id);
    out.push(module.header().reserved);

    // Preamble up to the global section, then injected annotations, the
    // original globals, and the injected globals.
    out.extend_from_slice(&words[spec::HEADER_WORD_COUNT..module.global_section_offset()]);
    out.extend_from_slice(&ctx.new_annotations);
    out.extend_from_slice(&words[module.global_section_offset()..module.first_function_offset()]);
    out.extend_from_slice(&ctx.new_globals);

    for (body, meta) in bodies.iter().zip(&maps.functions) {
        match body {
            Some(body) => out.extend_from_slice(body),
            None => out.extend_from_slice(&words[meta.range.0..meta.range.1]),
        }
    }

    Ok(words_to_bytes(&out))
}

struct ExportAbi {
    counter_var: u32,
    stream_var: u32,
}

struct WriterContext<'a> {
    program: &'a Program,
    bindings: &'a InjectionBindings,
    original_bound: u32,
    next_id: u32,
    type_to_spirv: FnvHashMap<TypeId, u32>,
    emitted_constants: FnvHashMap<ValueId, u32>,
    writer_constants: FnvHashMap<u32, u32>,
    ptr_sb_uint: Option<u32>,
    export_abi: Option<ExportAbi>,
    new_annotations: Vec<u32>,
    new_globals: Vec<u32>,
}

impl<'a> WriterContext<'a> {
    fn new(
        module: &SpirvModule,
        program: &'a Program,
        maps: &'a CodecMaps,
        bindings: &'a InjectionBindings,
    ) -> Self {
        Self {
            program,
            bindings,
            original_bound: module.header().bound,
            next_id: program.ids().bound().max(module.header().bound),
            type_to_spirv: maps.type_to_spirv.clone(),
            emitted_constants: FnvHashMap::default(),
            writer_constants: FnvHashMap::default(),
            ptr_sb_uint: None,
            export_abi: None,
            new_annotations: Vec::new(),
            new_globals: Vec::new(),
        }
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn emit_function(&mut self, function: &Function, meta: &FunctionMeta) -> Result<Vec<u32>> {
        let mut out = meta.declaration_words.clone();

        for block in function.blocks() {
            out.push(spec::pack_op(spec::OP_LABEL, 2));
            out.push(block.id().0);

            for instruction in block.instructions() {
                self.emit_instruction(instruction, &mut out)?;
            }
        }

        out.push(spec::pack_op(spec::OP_FUNCTION_END, 1));
        Ok(out)
    }

    fn emit_instruction(&mut self, instruction: &Instruction, out: &mut Vec<u32>) -> Result<()> {
        match &instruction.op {
            Op::Unexposed { words, .. } => {
                out.extend_from_slice(words);
                Ok(())
            }
            Op::Load { pointer } => {
                let (result, rtype) = self.typed_result(instruction)?;
                self.ensure_operand(*pointer)?;
                out.extend_from_slice(&[spec::pack_op(spec::OP_LOAD, 4), rtype, result, pointer.0]);
                Ok(())
            }
            Op::Store { pointer, value } => {
                self.ensure_operand(*value)?;
                out.extend_from_slice(&[spec::pack_op(spec::OP_STORE, 3), pointer.0, value.0]);
                Ok(())
            }
            Op::AddressChain { base, indices } => {
                let (result, rtype) = self.typed_result(instruction)?;
                for index in indices {
                    self.ensure_operand(*index)?;
                }
                out.push(spec::pack_op(spec::OP_ACCESS_CHAIN, 4 + indices.len() as u16));
                out.extend_from_slice(&[rtype, result, base.0]);
                out.extend(indices.iter().map(|v| v.0));
                Ok(())
            }
            Op::Extract { composite, index } => {
                let (result, rtype) = self.typed_result(instruction)?;
                out.extend_from_slice(&[
                    spec::pack_op(spec::OP_COMPOSITE_EXTRACT, 5),
                    rtype,
                    result,
                    composite.0,
                    *index,
                ]);
                Ok(())
            }
            Op::Construct { components } => {
                let (result, rtype) = self.typed_result(instruction)?;
                for component in components {
                    self.ensure_operand(*component)?;
                }
                out.push(spec::pack_op(
                    spec::OP_COMPOSITE_CONSTRUCT,
                    3 + components.len() as u16,
                ));
                out.extend_from_slice(&[rtype, result]);
                out.extend(components.iter().map(|v| v.0));
                Ok(())
            }
            Op::Binary { op, lhs, rhs } => {
                let (result, rtype) = self.typed_result(instruction)?;
                let opcode = self.binary_opcode(*op, *lhs, instruction.result)?;
                self.ensure_operand(*lhs)?;
                self.ensure_operand(*rhs)?;
                out.extend_from_slice(&[spec::pack_op(opcode, 5), rtype, result, lhs.0, rhs.0]);
                Ok(())
            }
            Op::Unary { op, value } => {
                let (result, rtype) = self.typed_result(instruction)?;
                let opcode = self.unary_opcode(*op, *value)?;
                self.ensure_operand(*value)?;
                out.extend_from_slice(&[spec::pack_op(opcode, 4), rtype, result, value.0]);
                Ok(())
            }
            Op::Select {
                condition,
                on_true,
                on_false,
            } => {
                let (result, rtype) = self.typed_result(instruction)?;
                self.ensure_operand(*condition)?;
                self.ensure_operand(*on_true)?;
                self.ensure_operand(*on_false)?;
                out.extend_from_slice(&[
                    spec::pack_op(spec::OP_SELECT, 6),
                    rtype,
                    result,
                    condition.0,
                    on_true.0,
                    on_false.0,
                ]);
                Ok(())
            }
            Op::Phi { incoming } => {
                let (result, rtype) = self.typed_result(instruction)?;
                out.push(spec::pack_op(spec::OP_PHI, 3 + 2 * incoming.len() as u16));
                out.extend_from_slice(&[rtype, result]);
                for (value, block) in incoming {
                    out.push(value.0);
                    out.push(block.0);
                }
                Ok(())
            }
            Op::Branch { target } => {
                out.extend_from_slice(&[spec::pack_op(spec::OP_BRANCH, 2), target.0]);
                Ok(())
            }
            Op::BranchConditional {
                condition,
                on_true,
                on_false,
                merge,
            } => {
                if let Some(merge) = merge {
                    out.extend_from_slice(&[
                        spec::pack_op(spec::OP_SELECTION_MERGE, 3),
                        merge.0,
                        0,
                    ]);
                }
                self.ensure_operand(*condition)?;
                out.extend_from_slice(&[
                    spec::pack_op(spec::OP_BRANCH_CONDITIONAL, 4),
                    condition.0,
                    on_true.0,
                    on_false.0,
                ]);
                Ok(())
            }
            Op::Switch {
                selector,
                default,
                cases,
            } => {
                out.push(spec::pack_op(spec::OP_SWITCH, 3 + 2 * cases.len() as u16));
                out.extend_from_slice(&[selector.0, default.0]);
                for (literal, block) in cases {
                    out.push(*literal as u32);
                    out.push(block.0);
                }
                Ok(())
            }
            Op::Return { value } => {
                match value {
                    Some(value) => {
                        out.extend_from_slice(&[spec::pack_op(spec::OP_RETURN_VALUE, 2), value.0]);
                    }
                    None => out.push(spec::pack_op(spec::OP_RETURN, 1)),
                }
                Ok(())
            }
            Op::Export { export_id, values } => self.emit_export(*export_id, values, out),
            Op::Atomic {
                op,
                buffer,
                index,
                value,
                comparator,
            } => {
                if comparator.is_some() {
                    return Err(CodecError::UnsupportedInjection("atomic compare exchange"));
                }
                let opcode = match op {
                    AtomicOp::Or => spec::OP_ATOMIC_OR,
                    AtomicOp::And => spec::OP_ATOMIC_AND,
                    AtomicOp::Add => spec::OP_ATOMIC_I_ADD,
                    AtomicOp::Exchange | AtomicOp::CompareExchange => {
                        return Err(CodecError::UnsupportedInjection("atomic exchange"))
                    }
                };

                self.ensure_operand(*index)?;
                self.ensure_operand(*value)?;
                let pointer = self.buffer_element_pointer(buffer.0, index.0, out)?;
                let uint = self.uint_type()?;
                let scope = self.uint_const(spec::SCOPE_DEVICE)?;
                let semantics = self.uint_const(spec::MEMORY_SEMANTICS_NONE)?;
                let result = instruction.result.map_or_else(|| self.alloc_id(), |v| v.0);
                out.extend_from_slice(&[
                    spec::pack_op(opcode, 7),
                    uint,
                    result,
                    pointer,
                    scope,
                    semantics,
                    value.0,
                ]);
                Ok(())
            }
            Op::LoadBuffer { buffer, index } => {
                self.ensure_operand(*index)?;
                let pointer = self.buffer_element_pointer(buffer.0, index.0, out)?;
                let uint = self.uint_type()?;
                let result = instruction.result.map_or_else(|| self.alloc_id(), |v| v.0);
                out.extend_from_slice(&[spec::pack_op(spec::OP_LOAD, 4), uint, result, pointer]);
                Ok(())
            }
            Op::StoreBuffer {
                buffer,
                index,
                value,
            } => {
                self.ensure_operand(*index)?;
                self.ensure_operand(*value)?;
                let pointer = self.buffer_element_pointer(buffer.0, index.0, out)?;
                out.extend_from_slice(&[spec::pack_op(spec::OP_STORE, 3), pointer, value.0]);
                Ok(())
            }
            Op::Call { .. } => Err(CodecError::UnsupportedInjection("call")),
            Op::KernelValue { .. } => Err(CodecError::UnsupportedInjection("kernel value")),
            Op::SampleTexture { .. } | Op::LoadTexture { .. } | Op::StoreTexture { .. } => {
                Err(CodecError::UnsupportedInjection("texture access"))
            }
            Op::StoreOutput { .. } => Err(CodecError::UnsupportedInjection("output store")),
        }
    }

    /// Lower an export: bump the per-export counter, then write the record
    /// at the claimed slot. Overruns clamp host-side when the streamer
    /// consumes `min(counter, capacity)`.
    fn emit_export(&mut self, export_id: u32, values: &[ValueId], out: &mut Vec<u32>) -> Result<()> {
        let abi = self.export_abi()?;
        let (counter_var, stream_var) = (abi.counter_var, abi.stream_var);

        let uint = self.uint_type()?;
        let ptr = self.ptr_sb_uint()?;
        let zero = self.uint_const(0)?;
        let one = self.uint_const(1)?;
        let scope = self.uint_const(spec::SCOPE_DEVICE)?;
        let semantics = self.uint_const(spec::MEMORY_SEMANTICS_NONE)?;
        let export_index = self.uint_const(export_id)?;
        let stride = self.uint_const(values.len().max(1) as u32)?;

        // Claim a slot.
        let counter_ptr = self.alloc_id();
        out.extend_from_slice(&[
            spec::pack_op(spec::OP_ACCESS_CHAIN, 6),
            ptr,
            counter_ptr,
            counter_var,
            zero,
            export_index,
        ]);

        let slot = self.alloc_id();
        out.extend_from_slice(&[
            spec::pack_op(spec::OP_ATOMIC_I_ADD, 7),
            uint,
            slot,
            counter_ptr,
            scope,
            semantics,
            one,
        ]);

        let base = self.alloc_id();
        out.extend_from_slice(&[spec::pack_op(spec::OP_I_MUL, 5), uint, base, slot, stride]);

        for (offset, value) in values.iter().enumerate() {
            self.ensure_operand(*value)?;

            let index = if offset == 0 {
                base
            } else {
                let offset_const = self.uint_const(offset as u32)?;
                let index = self.alloc_id();
                out.extend_from_slice(&[
                    spec::pack_op(spec::OP_I_ADD, 5),
                    uint,
                    index,
                    base,
                    offset_const,
                ]);
                index
            };

            let element_ptr = self.alloc_id();
            out.extend_from_slice(&[
                spec::pack_op(spec::OP_ACCESS_CHAIN, 6),
                ptr,
                element_ptr,
                stream_var,
                zero,
                index,
            ]);
            out.extend_from_slice(&[spec::pack_op(spec::OP_STORE, 3), element_ptr, value.0]);
        }

        Ok(())
    }

    /// Access chain into member 0 of a block-struct buffer variable.
    fn buffer_element_pointer(
        &mut self,
        variable: u32,
        index: u32,
        out: &mut Vec<u32>,
    ) -> Result<u32> {
        let ptr = self.ptr_sb_uint()?;
        let zero = self.uint_const(0)?;
        let pointer = self.alloc_id();
        out.extend_from_slice(&[
            spec::pack_op(spec::OP_ACCESS_CHAIN, 6),
            ptr,
            pointer,
            variable,
            zero,
            index,
        ]);
        Ok(pointer)
    }

    fn typed_result(&mut self, instruction: &Instruction) -> Result<(u32, u32)> {
        let result = instruction.result.ok_or_else(|| {
            CodecError::EmissionFailed("instruction requires a result".to_string())
        })?;
        let type_id = self.program.value_type(result).ok_or_else(|| {
            CodecError::EmissionFailed(format!("no type recorded for value {}", result.0))
        })?;
        let rtype = self.spirv_type(type_id)?;
        Ok((result.0, rtype))
    }

    fn binary_opcode(
        &self,
        op: BinaryOp,
        lhs: ValueId,
        result: Option<ValueId>,
    ) -> Result<u16> {
        let operand_kind = self.value_kind(lhs);
        let result_kind = result.map_or(ValueKind::Unknown, |r| self.value_kind(r));

        let opcode = match op {
            BinaryOp::Add => pick_arith(result_kind, spec::OP_I_ADD, spec::OP_F_ADD)?,
            BinaryOp::Sub => pick_arith(result_kind, spec::OP_I_SUB, spec::OP_F_SUB)?,
            BinaryOp::Mul => pick_arith(result_kind, spec::OP_I_MUL, spec::OP_F_MUL)?,
            BinaryOp::Div => match result_kind {
                ValueKind::Fp => spec::OP_F_DIV,
                ValueKind::Int { signed: true } => spec::OP_S_DIV,
                ValueKind::Int { signed: false } => spec::OP_U_DIV,
                _ => return Err(CodecError::UnsupportedInjection("untyped division")),
            },
            BinaryOp::Rem => match result_kind {
                ValueKind::Int { signed: false } => spec::OP_U_MOD,
                _ => return Err(CodecError::UnsupportedInjection("signed remainder")),
            },
            BinaryOp::BitOr => spec::OP_BITWISE_OR,
            BinaryOp::BitXor => spec::OP_BITWISE_XOR,
            BinaryOp::BitAnd => spec::OP_BITWISE_AND,
            BinaryOp::BitShiftLeft => spec::OP_SHIFT_LEFT_LOGICAL,
            BinaryOp::BitShiftRight => spec::OP_SHIFT_RIGHT_LOGICAL,
            BinaryOp::LogicalAnd => spec::OP_LOGICAL_AND,
            BinaryOp::LogicalOr => spec::OP_LOGICAL_OR,
            BinaryOp::Equal => match operand_kind {
                ValueKind::Int { .. } => spec::OP_I_EQUAL,
                _ => return Err(CodecError::UnsupportedInjection("non-integer equality")),
            },
            BinaryOp::NotEqual => match operand_kind {
                ValueKind::Int { .. } => spec::OP_I_NOT_EQUAL,
                _ => return Err(CodecError::UnsupportedInjection("non-integer inequality")),
            },
            BinaryOp::LessThan => pick_compare(operand_kind, spec::OP_U_LESS_THAN, spec::OP_S_LESS_THAN)?,
            BinaryOp::LessThanEqual => pick_compare(
                operand_kind,
                spec::OP_U_LESS_THAN_EQUAL,
                spec::OP_S_LESS_THAN_EQUAL,
            )?,
            BinaryOp::GreaterThan => {
                pick_compare(operand_kind, spec::OP_U_GREATER_THAN, spec::OP_S_GREATER_THAN)?
            }
            BinaryOp::GreaterThanEqual => pick_compare(
                operand_kind,
                spec::OP_U_GREATER_THAN_EQUAL,
                spec::OP_S_GREATER_THAN_EQUAL,
            )?,
        };

        Ok(opcode)
    }

    fn unary_opcode(&self, op: UnaryOp, value: ValueId) -> Result<u16> {
        Ok(match op {
            UnaryOp::Not => match self.value_kind(value) {
                ValueKind::Bool => spec::OP_LOGICAL_NOT,
                _ => spec::OP_NOT,
            },
            UnaryOp::Negate => match self.value_kind(value) {
                ValueKind::Fp => spec::OP_F_NEGATE,
                ValueKind::Int { .. } => spec::OP_S_NEGATE,
                _ => return Err(CodecError::UnsupportedInjection("untyped negate")),
            },
            UnaryOp::IsNan => spec::OP_IS_NAN,
            UnaryOp::IsInf => spec::OP_IS_INF,
            UnaryOp::Any => spec::OP_ANY,
            UnaryOp::All => spec::OP_ALL,
        })
    }

    fn value_kind(&self, value: ValueId) -> ValueKind {
        let Some(type_id) = self.program.value_type(value) else {
            return ValueKind::Unknown;
        };

        match self.program.types.get(type_id) {
            Some(Type::Bool) => ValueKind::Bool,
            Some(Type::Fp { .. }) => ValueKind::Fp,
            Some(Type::Int { signed, .. }) => ValueKind::Int { signed: *signed },
            Some(Type::Vector { component, .. }) => match self.program.types.get(*component) {
                Some(Type::Bool) => ValueKind::Bool,
                Some(Type::Fp { .. }) => ValueKind::Fp,
                Some(Type::Int { signed, .. }) => ValueKind::Int { signed: *signed },
                _ => ValueKind::Unknown,
            },
            _ => ValueKind::Unknown,
        }
    }

    /// Resolve an IL type to its SPIR-V id, synthesizing a definition in the
    /// injected globals when the binary does not declare it.
    fn spirv_type(&mut self, type_id: TypeId) -> Result<u32> {
        if let Some(id) = self.type_to_spirv.get(&type_id) {
            return Ok(*id);
        }

        let ty = self
            .program
            .types
            .get(type_id)
            .ok_or_else(|| CodecError::EmissionFailed("dangling type id".to_string()))?
            .clone();

        let id = match ty {
            Type::Void => {
                let id = self.alloc_id();
                self.new_globals
                    .extend_from_slice(&[spec::pack_op(spec::OP_TYPE_VOID, 2), id]);
                id
            }
            Type::Bool => {
                let id = self.alloc_id();
                self.new_globals
                    .extend_from_slice(&[spec::pack_op(spec::OP_TYPE_BOOL, 2), id]);
                id
            }
            Type::Int { bit_width, signed } => {
                let id = self.alloc_id();
                self.new_globals.extend_from_slice(&[
                    spec::pack_op(spec::OP_TYPE_INT, 4),
                    id,
                    u32::from(bit_width),
                    u32::from(signed),
                ]);
                id
            }
            Type::Fp { bit_width } => {
                let id = self.alloc_id();
                self.new_globals.extend_from_slice(&[
                    spec::pack_op(spec::OP_TYPE_FLOAT, 3),
                    id,
                    u32::from(bit_width),
                ]);
                id
            }
            Type::Vector {
                component,
                component_count,
            } => {
                let component = self.spirv_type(component)?;
                let id = self.alloc_id();
                self.new_globals.extend_from_slice(&[
                    spec::pack_op(spec::OP_TYPE_VECTOR, 4),
                    id,
                    component,
                    u32::from(component_count),
                ]);
                id
            }
            Type::Pointer {
                pointee,
                address_space,
            } => {
                let pointee = self.spirv_type(pointee)?;
                let id = self.alloc_id();
                self.new_globals.extend_from_slice(&[
                    spec::pack_op(spec::OP_TYPE_POINTER, 4),
                    id,
                    storage_class(address_space),
                    pointee,
                ]);
                id
            }
            _ => {
                return Err(CodecError::EmissionFailed(
                    "type cannot be synthesized".to_string(),
                ))
            }
        };

        self.type_to_spirv.insert(type_id, id);
        Ok(id)
    }

    /// Make sure an operand id resolves at runtime: injected constants get
    /// their definitions appended on first use.
    fn ensure_operand(&mut self, value: ValueId) -> Result<()> {
        if value.0 < self.original_bound || self.emitted_constants.contains_key(&value) {
            return Ok(());
        }

        let Some(constant_id) = self.program.constants.find_by_value(value) else {
            // Instruction result or block produced by injection.
            return Ok(());
        };

        let entry = self
            .program
            .constants
            .entry(constant_id)
            .expect("constant entry")
            .clone();

        let rtype = self.spirv_type(entry.type_id)?;

        match &entry.constant {
            Constant::Bool(true) => {
                self.new_globals
                    .extend_from_slice(&[spec::pack_op(spec::OP_CONSTANT_TRUE, 3), rtype, value.0]);
            }
            Constant::Bool(false) => {
                self.new_globals.extend_from_slice(&[
                    spec::pack_op(spec::OP_CONSTANT_FALSE, 3),
                    rtype,
                    value.0,
                ]);
            }
            Constant::Int(literal) => {
                if wide_literal(self.program.types.get(entry.type_id)) {
                    return Err(CodecError::UnsupportedInjection("wide integer literal"));
                }
                self.new_globals.extend_from_slice(&[
                    spec::pack_op(spec::OP_CONSTANT, 4),
                    rtype,
                    value.0,
                    *literal as u32,
                ]);
            }
            Constant::Fp(bits) => {
                if wide_literal(self.program.types.get(entry.type_id)) {
                    return Err(CodecError::UnsupportedInjection("wide float literal"));
                }
                self.new_globals.extend_from_slice(&[
                    spec::pack_op(spec::OP_CONSTANT, 4),
                    rtype,
                    value.0,
                    *bits as u32,
                ]);
            }
            Constant::Null => {
                self.new_globals
                    .extend_from_slice(&[spec::pack_op(spec::OP_CONSTANT_NULL, 3), rtype, value.0]);
            }
            Constant::Undef => {
                return Err(CodecError::UnsupportedInjection("undef constant"));
            }
            Constant::Composite(components) => {
                let mut component_values = Vec::with_capacity(components.len());
                for component in components {
                    let component_value = self
                        .program
                        .constants
                        .entry(*component)
                        .expect("component entry")
                        .value;
                    self.ensure_operand(component_value)?;
                    component_values.push(component_value.0);
                }
                self.new_globals.push(spec::pack_op(
                    spec::OP_CONSTANT_COMPOSITE,
                    3 + components.len() as u16,
                ));
                self.new_globals.extend_from_slice(&[rtype, value.0]);
                self.new_globals.extend_from_slice(&component_values);
            }
        }

        self.emitted_constants.insert(value, value.0);
        Ok(())
    }

    fn uint_type(&mut self) -> Result<u32> {
        // The id is stable across calls through the type map.
        let type_id = self.find_il_type(&Type::Int {
            bit_width: 32,
            signed: false,
        });

        match type_id {
            Some(type_id) => self.spirv_type(type_id),
            None => Err(CodecError::EmissionFailed(
                "module has no 32-bit unsigned type and none was interned".to_string(),
            )),
        }
    }

    /// A 32-bit unsigned constant usable as an operand, reusing the
    /// module's own definition when one exists.
    fn uint_const(&mut self, literal: u32) -> Result<u32> {
        let uint_type_id = self.find_il_type(&Type::Int {
            bit_width: 32,
            signed: false,
        });

        if let Some(uint_type_id) = uint_type_id {
            if let Some(constant_id) = self
                .program
                .constants
                .find(&Constant::Int(i64::from(literal)), uint_type_id)
            {
                let value = self
                    .program
                    .constants
                    .entry(constant_id)
                    .expect("constant entry")
                    .value;
                self.ensure_operand(value)?;
                return Ok(value.0);
            }
        }

        if let Some(id) = self.writer_constants.get(&literal) {
            return Ok(*id);
        }

        let rtype = self.uint_type()?;
        let id = self.alloc_id();
        self.new_globals
            .extend_from_slice(&[spec::pack_op(spec::OP_CONSTANT, 4), rtype, id, literal]);
        self.writer_constants.insert(literal, id);
        Ok(id)
    }

    fn find_il_type(&self, ty: &Type) -> Option<TypeId> {
        self.program
            .types
            .iter()
            .find(|(_, candidate)| *candidate == ty)
            .map(|(id, _)| id)
    }

    fn ptr_sb_uint(&mut self) -> Result<u32> {
        if let Some(id) = self.ptr_sb_uint {
            return Ok(id);
        }

        // Reuse the module's pointer type when the parse registered one.
        let uint_type_id = self.find_il_type(&Type::Int {
            bit_width: 32,
            signed: false,
        });
        if let Some(uint_type_id) = uint_type_id {
            if let Some(existing) = self.find_il_type(&Type::Pointer {
                pointee: uint_type_id,
                address_space: AddressSpace::Storage,
            }) {
                let id = self.spirv_type(existing)?;
                self.ptr_sb_uint = Some(id);
                return Ok(id);
            }
        }

        let uint = self.uint_type()?;
        let id = self.alloc_id();
        self.new_globals.extend_from_slice(&[
            spec::pack_op(spec::OP_TYPE_POINTER, 4),
            id,
            spec::STORAGE_CLASS_STORAGE_BUFFER,
            uint,
        ]);
        self.ptr_sb_uint = Some(id);
        Ok(id)
    }

    /// Declare the export counter and stream buffers on first use.
    fn export_abi(&mut self) -> Result<&ExportAbi> {
        if self.export_abi.is_none() {
            let uint = self.uint_type()?;

            let runtime_array = self.alloc_id();
            self.new_globals.extend_from_slice(&[
                spec::pack_op(spec::OP_TYPE_RUNTIME_ARRAY, 3),
                runtime_array,
                uint,
            ]);

            let block = self.alloc_id();
            self.new_globals.extend_from_slice(&[
                spec::pack_op(spec::OP_TYPE_STRUCT, 3),
                block,
                runtime_array,
            ]);

            let ptr_block = self.alloc_id();
            self.new_globals.extend_from_slice(&[
                spec::pack_op(spec::OP_TYPE_POINTER, 4),
                ptr_block,
                spec::STORAGE_CLASS_STORAGE_BUFFER,
                block,
            ]);

            let counter_var = self.alloc_id();
            self.new_globals.extend_from_slice(&[
                spec::pack_op(spec::OP_VARIABLE, 4),
                ptr_block,
                counter_var,
                spec::STORAGE_CLASS_STORAGE_BUFFER,
            ]);

            let stream_var = self.alloc_id();
            self.new_globals.extend_from_slice(&[
                spec::pack_op(spec::OP_VARIABLE, 4),
                ptr_block,
                stream_var,
                spec::STORAGE_CLASS_STORAGE_BUFFER,
            ]);

            let annotations = &mut self.new_annotations;
            annotations.extend_from_slice(&[
                spec::pack_op(spec::OP_DECORATE, 4),
                runtime_array,
                spec::DECORATION_ARRAY_STRIDE,
                4,
            ]);
            annotations.extend_from_slice(&[
                spec::pack_op(spec::OP_DECORATE, 3),
                block,
                spec::DECORATION_BLOCK,
            ]);
            annotations.extend_from_slice(&[
                spec::pack_op(spec::OP_MEMBER_DECORATE, 5),
                block,
                0,
                spec::DECORATION_OFFSET,
                0,
            ]);

            for (variable, binding) in [
                (counter_var, self.bindings.counter_binding),
                (stream_var, self.bindings.stream_binding),
            ] {
                annotations.extend_from_slice(&[
                    spec::pack_op(spec::OP_DECORATE, 4),
                    variable,
                    spec::DECORATION_DESCRIPTOR_SET,
                    self.bindings.descriptor_set,
                ]);
                annotations.extend_from_slice(&[
                    spec::pack_op(spec::OP_DECORATE, 4),
                    variable,
                    spec::DECORATION_BINDING,
                    binding,
                ]);
            }

            self.export_abi = Some(ExportAbi {
                counter_var,
                stream_var,
            });
        }

        Ok(self.export_abi.as_ref().expect("just created"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Bool,
    Int { signed: bool },
    Fp,
    Unknown,
}

fn pick_arith(kind: ValueKind, int_op: u16, fp_op: u16) -> Result<u16> {
    match kind {
        ValueKind::Int { .. } => Ok(int_op),
        ValueKind::Fp => Ok(fp_op),
        _ => Err(CodecError::UnsupportedInjection("untyped arithmetic")),
    }
}

fn pick_compare(kind: ValueKind, unsigned_op: u16, signed_op: u16) -> Result<u16> {
    match kind {
        ValueKind::Int { signed: false } => Ok(unsigned_op),
        ValueKind::Int { signed: true } => Ok(signed_op),
        _ => Err(CodecError::UnsupportedInjection("non-integer comparison")),
    }
}

fn wide_literal(ty: Option<&Type>) -> bool {
    matches!(
        ty,
        Some(Type::Int { bit_width, .. } | Type::Fp { bit_width }) if *bit_width > 32
    )
}

fn storage_class(address_space: AddressSpace) -> u32 {
    match address_space {
        AddressSpace::Input => spec::STORAGE_CLASS_INPUT,
        AddressSpace::Uniform => spec::STORAGE_CLASS_UNIFORM,
        AddressSpace::Output => spec::STORAGE_CLASS_OUTPUT,
        AddressSpace::Workgroup => spec::STORAGE_CLASS_WORKGROUP,
        AddressSpace::Private => spec::STORAGE_CLASS_PRIVATE,
        AddressSpace::Function => spec::STORAGE_CLASS_FUNCTION,
        AddressSpace::Storage => spec::STORAGE_CLASS_STORAGE_BUFFER,
        AddressSpace::Unexposed(raw) => raw,
    }
}
