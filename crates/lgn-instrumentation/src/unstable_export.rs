//! Export-stability checking.
//!
//! Every floating-point store is split around a NaN/infinity check: the
//! value flows through unchanged on the stable path, the detour exports a
//! diagnostic record and rejoins. Detour blocks are marked so a second
//! instrumentation pass leaves them alone.

use std::sync::Arc;

use lgn_shader_il::{BlockFlags, BlockId, ControlFlow, Emitter, Op, Program, SourceSpan, ValueId};
use lgn_shader_export::ShaderExportHost;
use lgn_validation_messages::diagnostic::UnstableExportMessage;
use lgn_validation_messages::Message;

use crate::ShaderSguidHost;

pub struct UnstableExportFeature {
    export_id: u32,
    sguid_host: Arc<ShaderSguidHost>,
}

struct Candidate {
    block: BlockId,
    index: usize,
    value: ValueId,
    source: SourceSpan,
}

impl UnstableExportFeature {
    /// Feature selector bit.
    pub const FEATURE_BIT: u64 = 1 << 0;

    pub fn install(export_host: &ShaderExportHost, sguid_host: Arc<ShaderSguidHost>) -> Self {
        let export_id = export_host.allocate(
            UnstableExportMessage::ID,
            UnstableExportMessage::EXPORT_DWORD_COUNT,
        );

        Self {
            export_id,
            sguid_host,
        }
    }

    pub fn export_id(&self) -> u32 {
        self.export_id
    }

    /// Inject the stability checks into a program.
    pub fn inject(&self, program: &mut Program) {
        for function_index in 0..program.functions().len() {
            let fid = program.functions()[function_index].id();

            // Collect first: splitting rewrites the block list. Processing
            // in reverse keeps every earlier candidate position valid (a
            // split only moves instructions at or after the split point).
            // Unreachable blocks carry no observable stores and are left
            // alone.
            let control_flow = ControlFlow::compute(&program.functions()[function_index]);

            let mut candidates = Vec::new();
            for block in program.functions()[function_index].blocks() {
                if block.flags.contains(BlockFlags::NO_INSTRUMENTATION) {
                    continue;
                }
                if !control_flow.post_order().contains(&block.id()) {
                    continue;
                }

                for (index, instruction) in block.instructions().iter().enumerate() {
                    let Some(value) = instruction.stored_value() else {
                        continue;
                    };

                    // Stability only checks floating-point exports;
                    // matrices are not handled.
                    let Some(type_id) = program.value_type(value) else {
                        continue;
                    };
                    if !program.types.is_fp_component(type_id) || program.types.is_matrix(type_id)
                    {
                        continue;
                    }

                    candidates.push(Candidate {
                        block: block.id(),
                        index,
                        value,
                        source: instruction.source,
                    });
                }
            }

            for candidate in candidates.into_iter().rev() {
                self.inject_check(program, fid, &candidate);
            }
        }
    }

    fn inject_check(
        &self,
        program: &mut Program,
        fid: lgn_shader_il::FunctionId,
        candidate: &Candidate,
    ) {
        let sguid = self.sguid_host.bind(program, candidate.source);

        // The checked instruction and everything after it resume here.
        let Some(resume) = program.split_block(fid, candidate.block, candidate.index) else {
            return;
        };

        let Some(detour) = program.alloc_block(fid) else {
            return;
        };
        if let Some(block) = program
            .function_mut(fid)
            .and_then(|f| f.block_mut(detour))
        {
            block.flags |= BlockFlags::NO_INSTRUMENTATION;
        }

        let mut pre = Emitter::new(program, fid, candidate.block);
        let is_nan = pre.is_nan(candidate.value);
        let is_inf = pre.is_inf(candidate.value);
        let failed = pre.logical_or(is_nan, is_inf);
        pre.branch_conditional(failed, detour, resume, Some(resume));

        let mut oob = Emitter::new(program, fid, detour);
        let sguid_value = oob.uint32(sguid);
        let one = oob.uint32(1);
        let zero = oob.uint32(0);
        let nan_flag = oob.select(is_nan, one, zero);
        // Detail chunk reserved; the record arity stays fixed.
        oob.export(self.export_id, &[sguid_value, nan_flag, zero, zero]);
        oob.branch(resume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lgn_shader_il::{Instruction, Type};

    fn float_store_program() -> Program {
        let mut program = Program::with_bound(5, 100);
        let void = program.types.get_or_add(Type::Void);
        let fp32 = program.types.get_or_add(Type::Fp { bit_width: 32 });
        let fid = program.add_function(void);
        let block = program.alloc_block(fid).unwrap();

        let pointer = program.ids_mut().allocate_value();
        let value = program.ids_mut().allocate_value();
        program.set_value_type(value, fp32);

        let function = program.function_mut(fid).unwrap();
        let b = function.block_mut(block).unwrap();
        b.push(Instruction::with_source(
            Op::Store { pointer, value },
            None,
            SourceSpan::new(40),
        ));
        b.push(Instruction::new(Op::Return { value: None }, None));
        program
    }

    fn feature() -> UnstableExportFeature {
        let export_host = ShaderExportHost::new();
        UnstableExportFeature::install(&export_host, ShaderSguidHost::new())
    }

    #[test]
    fn test_injection_splits_around_float_store() {
        let mut program = float_store_program();
        let feature = feature();

        feature.inject(&mut program);

        let function = &program.functions()[0];
        // Entry (check), resume (store + return), detour (export).
        assert_eq!(function.blocks().len(), 3);

        let entry = &function.blocks()[0];
        assert!(matches!(
            entry.terminator().map(|t| &t.op),
            Some(Op::BranchConditional { .. })
        ));

        let resume = &function.blocks()[1];
        assert!(matches!(resume.instructions()[0].op, Op::Store { .. }));

        let detour = function
            .blocks()
            .iter()
            .find(|b| b.flags.contains(BlockFlags::NO_INSTRUMENTATION))
            .expect("detour block");
        assert!(detour
            .instructions()
            .iter()
            .any(|i| matches!(i.op, Op::Export { .. })));
        assert!(program.is_dirty());
    }

    #[test]
    fn test_injection_is_idempotent_on_detours() {
        let mut program = float_store_program();
        let feature = feature();

        feature.inject(&mut program);
        let blocks_after_first = program.functions()[0].blocks().len();

        // The resume block still carries the original store, which a naive
        // second pass would re-instrument into unbounded growth; splitting
        // it again is expected, but the detour must stay untouched.
        feature.inject(&mut program);
        let detour_count = program.functions()[0]
            .blocks()
            .iter()
            .filter(|b| b.flags.contains(BlockFlags::NO_INSTRUMENTATION))
            .count();

        assert!(program.functions()[0].blocks().len() > blocks_after_first);
        assert_eq!(detour_count, 2);
    }

    #[test]
    fn test_integer_stores_are_ignored() {
        let mut program = Program::with_bound(5, 100);
        let void = program.types.get_or_add(Type::Void);
        let u32_ty = program.types.get_or_add(Type::Int {
            bit_width: 32,
            signed: false,
        });
        let fid = program.add_function(void);
        let block = program.alloc_block(fid).unwrap();

        let pointer = program.ids_mut().allocate_value();
        let value = program.ids_mut().allocate_value();
        program.set_value_type(value, u32_ty);

        program
            .function_mut(fid)
            .unwrap()
            .block_mut(block)
            .unwrap()
            .push(Instruction::new(Op::Store { pointer, value }, None));

        let feature = feature();
        feature.inject(&mut program);

        assert_eq!(program.functions()[0].blocks().len(), 1);
    }
}
