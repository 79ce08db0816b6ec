//! Second-stage parse: structuring the scanned word stream into the IL.
//!
//! Preamble modeling is best-effort by design: the preamble is emitted
//! verbatim, so a type or constant the builder does not model simply has no
//! IL handle. Function bodies are total — every instruction becomes either
//! a modeled op or an unexposed payload that re-emits byte-identically.

use fnv::FnvHashMap;
use lgn_shader_il::{
    BasicBlock, BinaryOp, BlockId, Constant, Instruction, Op, Program, SourceSpan, Type, TypeId,
    UnaryOp, ValueId,
};

use crate::{module::SpirvModule, spec, CodecError, Result};

/// Per-function emission data kept outside the IL.
pub(crate) struct FunctionMeta {
    /// `OpFunction` and `OpFunctionParameter` words, verbatim.
    pub declaration_words: Vec<u32>,
    /// Word range `[start, end)` of the whole function in the source
    /// stream, `OpFunction` through `OpFunctionEnd` inclusive.
    pub range: (usize, usize),
}

/// Codec-private maps relating IL handles to SPIR-V ids.
#[derive(Default)]
pub(crate) struct CodecMaps {
    pub spirv_to_type: FnvHashMap<u32, TypeId>,
    pub type_to_spirv: FnvHashMap<TypeId, u32>,
    pub functions: Vec<FunctionMeta>,
}

impl CodecMaps {
    fn register_type(&mut self, program: &mut Program, spirv: u32, ty: Type) -> TypeId {
        let id = program.types.get_or_add(ty);
        self.spirv_to_type.insert(spirv, id);
        self.type_to_spirv.entry(id).or_insert(spirv);
        id
    }

    fn lookup(&self, spirv: u32) -> Option<TypeId> {
        self.spirv_to_type.get(&spirv).copied()
    }
}

pub(crate) fn build(module: &SpirvModule) -> Result<(Program, CodecMaps)> {
    let words = module.words();
    let mut program = Program::with_bound(module.shader_guid(), module.header().bound);
    let mut maps = CodecMaps::default();

    let mut current_function = None;
    let mut current_decl: Vec<u32> = Vec::new();
    let mut current_block: Option<BasicBlock> = None;
    let mut current_start = 0usize;

    for raw in module.instructions() {
        let offset = raw.offset as usize;
        let w = &words[offset..offset + raw.word_count as usize];

        if offset < module.first_function_offset() {
            build_preamble(&mut program, &mut maps, raw.opcode, w);
            continue;
        }

        match raw.opcode {
            spec::OP_FUNCTION => {
                if w.len() != 5 {
                    return Err(CodecError::ShaderParsingFailed(format!(
                        "malformed OpFunction at word {}",
                        offset
                    )));
                }

                let function_type = maps.lookup(w[4]).unwrap_or(TypeId::INVALID);
                current_function = Some(program.add_function(function_type));
                current_decl = w.to_vec();
                current_start = offset;
            }
            spec::OP_FUNCTION_PARAMETER => {
                let Some(fid) = current_function else {
                    return Err(CodecError::ShaderParsingFailed(format!(
                        "parameter outside a function at word {}",
                        offset
                    )));
                };
                if w.len() != 3 {
                    return Err(CodecError::ShaderParsingFailed(format!(
                        "malformed OpFunctionParameter at word {}",
                        offset
                    )));
                }

                current_decl.extend_from_slice(w);
                if let Some(ty) = maps.lookup(w[1]) {
                    program.set_value_type(ValueId(w[2]), ty);
                }
                program
                    .function_mut(fid)
                    .expect("current function")
                    .add_parameter(ValueId(w[2]));
            }
            spec::OP_LABEL => {
                let Some(fid) = current_function else {
                    return Err(CodecError::ShaderParsingFailed(format!(
                        "label outside a function at word {}",
                        offset
                    )));
                };
                if let Some(block) = current_block.take() {
                    program
                        .function_mut(fid)
                        .expect("current function")
                        .add_existing_block(block);
                }
                current_block = Some(BasicBlock::new(BlockId(w[1])));
            }
            spec::OP_FUNCTION_END => {
                let Some(fid) = current_function.take() else {
                    return Err(CodecError::ShaderParsingFailed(format!(
                        "function end without a function at word {}",
                        offset
                    )));
                };
                if let Some(block) = current_block.take() {
                    program
                        .function_mut(fid)
                        .expect("current function")
                        .add_existing_block(block);
                }
                maps.functions.push(FunctionMeta {
                    declaration_words: std::mem::take(&mut current_decl),
                    range: (current_start, offset + raw.word_count as usize),
                });
            }
            _ => {
                if let Some(block) = current_block.as_mut() {
                    let instruction =
                        map_instruction(&mut program, &maps, raw.opcode, w, raw.offset);
                    block.push(instruction);
                } else {
                    // Debug instructions may sit between the declaration and
                    // the first label; keep them with the declaration.
                    current_decl.extend_from_slice(w);
                }
            }
        }
    }

    if current_function.is_some() {
        return Err(CodecError::ShaderParsingFailed(
            "unterminated function at end of stream".to_string(),
        ));
    }

    Ok((program, maps))
}

fn build_preamble(program: &mut Program, maps: &mut CodecMaps, opcode: u16, w: &[u32]) {
    match opcode {
        spec::OP_TYPE_VOID if w.len() == 2 => {
            maps.register_type(program, w[1], Type::Void);
        }
        spec::OP_TYPE_BOOL if w.len() == 2 => {
            maps.register_type(program, w[1], Type::Bool);
        }
        spec::OP_TYPE_INT if w.len() == 4 => {
            maps.register_type(
                program,
                w[1],
                Type::Int {
                    bit_width: w[2] as u8,
                    signed: w[3] != 0,
                },
            );
        }
        spec::OP_TYPE_FLOAT if w.len() == 3 => {
            maps.register_type(program, w[1], Type::Fp { bit_width: w[2] as u8 });
        }
        spec::OP_TYPE_VECTOR if w.len() == 4 => {
            let ty = match maps.lookup(w[2]) {
                Some(component) => Type::Vector {
                    component,
                    component_count: w[3] as u8,
                },
                None => Type::Unexposed { words: w.to_vec() },
            };
            maps.register_type(program, w[1], ty);
        }
        spec::OP_TYPE_POINTER if w.len() == 4 => {
            let ty = match maps.lookup(w[3]) {
                Some(pointee) => Type::Pointer {
                    pointee,
                    address_space: address_space(w[2]),
                },
                None => Type::Unexposed { words: w.to_vec() },
            };
            maps.register_type(program, w[1], ty);
        }
        spec::OP_TYPE_FUNCTION if w.len() >= 3 => {
            let return_type = maps.lookup(w[2]);
            let parameters: Option<Vec<_>> = w[3..].iter().map(|id| maps.lookup(*id)).collect();
            let ty = match (return_type, parameters) {
                (Some(return_type), Some(parameters)) => Type::Function {
                    return_type,
                    parameters,
                },
                _ => Type::Unexposed { words: w.to_vec() },
            };
            maps.register_type(program, w[1], ty);
        }
        // Aggregates and opaque types keep their raw words: structurally
        // equal aggregates are distinct SPIR-V types, and collapsing them
        // would alias ids on re-emission.
        op if (spec::OP_TYPE_VOID..=spec::OP_TYPE_FUNCTION).contains(&op) && w.len() >= 2 => {
            maps.register_type(program, w[1], Type::Unexposed { words: w.to_vec() });
        }
        spec::OP_CONSTANT_TRUE | spec::OP_CONSTANT_FALSE if w.len() == 3 => {
            if let Some(ty) = maps.lookup(w[1]) {
                program.constants.add_existing(
                    Constant::Bool(opcode == spec::OP_CONSTANT_TRUE),
                    ty,
                    ValueId(w[2]),
                );
                program.set_value_type(ValueId(w[2]), ty);
            }
        }
        spec::OP_CONSTANT if w.len() == 4 || w.len() == 5 => {
            let Some(ty) = maps.lookup(w[1]) else {
                return;
            };

            let mut literal = u64::from(w[3]);
            if w.len() == 5 {
                literal |= u64::from(w[4]) << 32;
            }

            let constant = match program.types.get(ty) {
                Some(Type::Int { .. }) => Some(Constant::Int(literal as i64)),
                Some(Type::Fp { .. }) => Some(Constant::Fp(literal)),
                _ => None,
            };

            if let Some(constant) = constant {
                program.constants.add_existing(constant, ty, ValueId(w[2]));
                program.set_value_type(ValueId(w[2]), ty);
            }
        }
        spec::OP_CONSTANT_NULL if w.len() == 3 => {
            if let Some(ty) = maps.lookup(w[1]) {
                program
                    .constants
                    .add_existing(Constant::Null, ty, ValueId(w[2]));
                program.set_value_type(ValueId(w[2]), ty);
            }
        }
        spec::OP_CONSTANT_COMPOSITE if w.len() >= 3 => {
            let Some(ty) = maps.lookup(w[1]) else {
                return;
            };
            let components: Option<Vec<_>> = w[3..]
                .iter()
                .map(|id| program.constants.find_by_value(ValueId(*id)))
                .collect();
            if let Some(components) = components {
                program
                    .constants
                    .add_existing(Constant::Composite(components), ty, ValueId(w[2]));
                program.set_value_type(ValueId(w[2]), ty);
            }
        }
        spec::OP_VARIABLE if w.len() >= 4 => {
            if let Some(ty) = maps.lookup(w[1]) {
                program.set_value_type(ValueId(w[2]), ty);
            }
        }
        _ => {}
    }
}

fn address_space(storage_class: u32) -> lgn_shader_il::AddressSpace {
    use lgn_shader_il::AddressSpace;

    match storage_class {
        spec::STORAGE_CLASS_INPUT => AddressSpace::Input,
        spec::STORAGE_CLASS_UNIFORM => AddressSpace::Uniform,
        spec::STORAGE_CLASS_OUTPUT => AddressSpace::Output,
        spec::STORAGE_CLASS_WORKGROUP => AddressSpace::Workgroup,
        spec::STORAGE_CLASS_PRIVATE => AddressSpace::Private,
        spec::STORAGE_CLASS_FUNCTION => AddressSpace::Function,
        spec::STORAGE_CLASS_STORAGE_BUFFER => AddressSpace::Storage,
        other => AddressSpace::Unexposed(other),
    }
}

/// Structure one in-block instruction, falling back to an unexposed payload
/// whenever the exact shape is not modeled.
fn map_instruction(
    program: &mut Program,
    maps: &CodecMaps,
    opcode: u16,
    w: &[u32],
    offset: u32,
) -> Instruction {
    let source = SourceSpan::new(offset);

    let unexposed = |w: &[u32]| Op::Unexposed {
        opcode: u32::from(opcode),
        words: w.to_vec(),
    };

    // Record the result type of a `(result_type, result, ...)` shape.
    let mut typed_result = |program: &mut Program, rtype: u32, result: u32| -> Option<ValueId> {
        let value = ValueId(result);
        if let Some(ty) = maps.lookup(rtype) {
            program.set_value_type(value, ty);
        }
        Some(value)
    };

    let (op, result) = match opcode {
        spec::OP_LOAD if w.len() == 4 => (
            Op::Load {
                pointer: ValueId(w[3]),
            },
            typed_result(program, w[1], w[2]),
        ),
        spec::OP_STORE if w.len() == 3 => (
            Op::Store {
                pointer: ValueId(w[1]),
                value: ValueId(w[2]),
            },
            None,
        ),
        spec::OP_ACCESS_CHAIN if w.len() >= 4 => (
            Op::AddressChain {
                base: ValueId(w[3]),
                indices: w[4..].iter().map(|id| ValueId(*id)).collect(),
            },
            typed_result(program, w[1], w[2]),
        ),
        spec::OP_COMPOSITE_EXTRACT if w.len() == 5 => (
            Op::Extract {
                composite: ValueId(w[3]),
                index: w[4],
            },
            typed_result(program, w[1], w[2]),
        ),
        spec::OP_COMPOSITE_CONSTRUCT if w.len() >= 3 => (
            Op::Construct {
                components: w[3..].iter().map(|id| ValueId(*id)).collect(),
            },
            typed_result(program, w[1], w[2]),
        ),
        spec::OP_I_ADD | spec::OP_F_ADD if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::Add, w)
        }
        spec::OP_I_SUB | spec::OP_F_SUB if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::Sub, w)
        }
        spec::OP_I_MUL | spec::OP_F_MUL if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::Mul, w)
        }
        spec::OP_U_DIV | spec::OP_S_DIV | spec::OP_F_DIV if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::Div, w)
        }
        spec::OP_U_MOD if w.len() == 5 => binary(program, &mut typed_result, BinaryOp::Rem, w),
        spec::OP_SHIFT_LEFT_LOGICAL if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::BitShiftLeft, w)
        }
        spec::OP_SHIFT_RIGHT_LOGICAL if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::BitShiftRight, w)
        }
        spec::OP_BITWISE_OR if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::BitOr, w)
        }
        spec::OP_BITWISE_XOR if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::BitXor, w)
        }
        spec::OP_BITWISE_AND if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::BitAnd, w)
        }
        spec::OP_LOGICAL_AND if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::LogicalAnd, w)
        }
        spec::OP_LOGICAL_OR if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::LogicalOr, w)
        }
        spec::OP_I_EQUAL if w.len() == 5 => binary(program, &mut typed_result, BinaryOp::Equal, w),
        spec::OP_I_NOT_EQUAL if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::NotEqual, w)
        }
        spec::OP_U_LESS_THAN | spec::OP_S_LESS_THAN if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::LessThan, w)
        }
        spec::OP_U_LESS_THAN_EQUAL | spec::OP_S_LESS_THAN_EQUAL if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::LessThanEqual, w)
        }
        spec::OP_U_GREATER_THAN | spec::OP_S_GREATER_THAN if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::GreaterThan, w)
        }
        spec::OP_U_GREATER_THAN_EQUAL | spec::OP_S_GREATER_THAN_EQUAL if w.len() == 5 => {
            binary(program, &mut typed_result, BinaryOp::GreaterThanEqual, w)
        }
        spec::OP_NOT | spec::OP_LOGICAL_NOT if w.len() == 4 => {
            unary(program, &mut typed_result, UnaryOp::Not, w)
        }
        spec::OP_IS_NAN if w.len() == 4 => unary(program, &mut typed_result, UnaryOp::IsNan, w),
        spec::OP_IS_INF if w.len() == 4 => unary(program, &mut typed_result, UnaryOp::IsInf, w),
        spec::OP_ANY if w.len() == 4 => unary(program, &mut typed_result, UnaryOp::Any, w),
        spec::OP_ALL if w.len() == 4 => unary(program, &mut typed_result, UnaryOp::All, w),
        spec::OP_SELECT if w.len() == 6 => (
            Op::Select {
                condition: ValueId(w[3]),
                on_true: ValueId(w[4]),
                on_false: ValueId(w[5]),
            },
            typed_result(program, w[1], w[2]),
        ),
        spec::OP_PHI if w.len() >= 3 && (w.len() - 3) % 2 == 0 => (
            Op::Phi {
                incoming: w[3..]
                    .chunks_exact(2)
                    .map(|pair| (ValueId(pair[0]), BlockId(pair[1])))
                    .collect(),
            },
            typed_result(program, w[1], w[2]),
        ),
        spec::OP_BRANCH if w.len() == 2 => (
            Op::Branch {
                target: BlockId(w[1]),
            },
            None,
        ),
        spec::OP_BRANCH_CONDITIONAL if w.len() == 4 => (
            Op::BranchConditional {
                condition: ValueId(w[1]),
                on_true: BlockId(w[2]),
                on_false: BlockId(w[3]),
                merge: None,
            },
            None,
        ),
        spec::OP_SWITCH if w.len() >= 3 && (w.len() - 3) % 2 == 0 && is_u32_selector(program, w[1]) => {
            (
                Op::Switch {
                    selector: ValueId(w[1]),
                    default: BlockId(w[2]),
                    cases: w[3..]
                        .chunks_exact(2)
                        .map(|pair| (i64::from(pair[0]), BlockId(pair[1])))
                        .collect(),
                },
                None,
            )
        }
        spec::OP_RETURN if w.len() == 1 => (Op::Return { value: None }, None),
        spec::OP_RETURN_VALUE if w.len() == 2 => (
            Op::Return {
                value: Some(ValueId(w[1])),
            },
            None,
        ),
        _ => (unexposed(w), None),
    };

    Instruction::with_source(op, result, source)
}

type TypedResult<'a> = dyn FnMut(&mut Program, u32, u32) -> Option<ValueId> + 'a;

fn binary(
    program: &mut Program,
    typed_result: &mut TypedResult<'_>,
    op: BinaryOp,
    w: &[u32],
) -> (Op, Option<ValueId>) {
    (
        Op::Binary {
            op,
            lhs: ValueId(w[3]),
            rhs: ValueId(w[4]),
        },
        typed_result(program, w[1], w[2]),
    )
}

fn unary(
    program: &mut Program,
    typed_result: &mut TypedResult<'_>,
    op: UnaryOp,
    w: &[u32],
) -> (Op, Option<ValueId>) {
    (
        Op::Unary {
            op,
            value: ValueId(w[3]),
        },
        typed_result(program, w[1], w[2]),
    )
}

fn is_u32_selector(program: &Program, selector: u32) -> bool {
    program
        .value_type(ValueId(selector))
        .and_then(|ty| program.types.get(ty).cloned())
        .map_or(false, |ty| matches!(ty, Type::Int { bit_width: 32, .. }))
}
