use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lgn_shader_il::{Program, SourceSpan};
use lgn_validation_bridge::MemoryBridge;
use lgn_validation_messages::diagnostic::ShaderSourceMappingMessage;
use lgn_validation_messages::MessageStream;

/// Width of the SGUID space carried in export records.
pub const SGUID_BIT_COUNT: u32 = 24;

pub const INVALID_SGUID: u32 = u32::MAX;

const INVALID_FILE_UID: u32 = u32::MAX;

/// What an SGUID resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaderSourceMapping {
    pub shader_guid: u64,
    pub file_uid: u32,
    pub line: u32,
    pub column: u32,
    pub basic_block_id: u32,
    pub instruction_index: u32,
}

#[derive(Default)]
struct SguidInner {
    /// Mapping -> sguid, per shader.
    shader_entries: HashMap<u64, HashMap<ShaderSourceMapping, u32>>,
    /// sguid -> mapping.
    lookup: HashMap<u32, ShaderSourceMapping>,
    free_indices: Vec<u32>,
    counter: u32,
    /// Newly bound sguids awaiting a source-mapping message.
    pending_submissions: Vec<u32>,
}

/// Host-assigned shader-source GUIDs: a 24-bit key per distinct
/// `(shader, block, instruction, source position)` tuple, bound lazily as
/// instrumentation touches instructions and flushed to the inspector on
/// commit.
#[derive(Default)]
pub struct ShaderSguidHost {
    inner: Mutex<SguidInner>,
}

impl ShaderSguidHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind an SGUID for the instruction at `source` of `program`.
    ///
    /// Returns [`INVALID_SGUID`] when the source cannot be resolved or the
    /// 24-bit space is exhausted.
    pub fn bind(&self, program: &Program, source: SourceSpan) -> u32 {
        let Some(traceback) = program.traceback(source.code_offset) else {
            return INVALID_SGUID;
        };

        let mapping = ShaderSourceMapping {
            shader_guid: program.shader_guid(),
            file_uid: INVALID_FILE_UID,
            line: 0,
            column: 0,
            basic_block_id: traceback.basic_block.0,
            instruction_index: traceback.instruction_index,
        };

        let mut inner = self.inner.lock().unwrap();

        let entries = inner
            .shader_entries
            .entry(mapping.shader_guid)
            .or_default();
        if let Some(sguid) = entries.get(&mapping) {
            return *sguid;
        }

        let sguid = if let Some(free) = inner.free_indices.pop() {
            free
        } else if inner.counter < (1 << SGUID_BIT_COUNT) {
            let sguid = inner.counter;
            inner.counter += 1;
            sguid
        } else {
            return INVALID_SGUID;
        };

        inner
            .shader_entries
            .get_mut(&mapping.shader_guid)
            .expect("entry created above")
            .insert(mapping, sguid);
        inner.lookup.insert(sguid, mapping);
        inner.pending_submissions.push(sguid);
        sguid
    }

    pub fn mapping(&self, sguid: u32) -> Option<ShaderSourceMapping> {
        self.inner.lock().unwrap().lookup.get(&sguid).copied()
    }

    /// Flush newly observed sguids as source-mapping messages.
    pub fn commit(&self, bridge: &MemoryBridge) {
        let mut stream = MessageStream::typed::<ShaderSourceMappingMessage>();

        let mut inner = self.inner.lock().unwrap();
        let pending: Vec<u32> = inner.pending_submissions.drain(..).collect();
        for sguid in pending {
            let mapping = inner.lookup[&sguid];

            stream.add(&ShaderSourceMappingMessage {
                sguid,
                shader_guid: mapping.shader_guid,
                file_uid: mapping.file_uid,
                line: mapping.line,
                column: mapping.column,
                basic_block_id: mapping.basic_block_id,
                instruction_index: mapping.instruction_index,
                contents: String::new(),
            });
        }
        drop(inner);

        if !stream.is_empty() {
            bridge.add_stream(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lgn_shader_il::{Instruction, Op, Type};
    use lgn_validation_bridge::BridgeListener;
    use lgn_validation_messages::Message;

    fn program_with_instruction(offset: u32) -> Program {
        let mut program = Program::with_bound(42, 10);
        let void = program.types.get_or_add(Type::Void);
        let fid = program.add_function(void);
        let block = program.alloc_block(fid).unwrap();
        program
            .function_mut(fid)
            .unwrap()
            .block_mut(block)
            .unwrap()
            .push(Instruction::with_source(
                Op::Return { value: None },
                None,
                SourceSpan::new(offset),
            ));
        program
    }

    #[test]
    fn test_bind_is_idempotent_per_site() {
        let host = ShaderSguidHost::new();
        let program = program_with_instruction(7);

        let a = host.bind(&program, SourceSpan::new(7));
        let b = host.bind(&program, SourceSpan::new(7));
        assert_ne!(a, INVALID_SGUID);
        assert_eq!(a, b);

        let mapping = host.mapping(a).unwrap();
        assert_eq!(mapping.shader_guid, 42);
        assert_eq!(mapping.instruction_index, 0);
    }

    #[test]
    fn test_unresolvable_source_is_invalid() {
        let host = ShaderSguidHost::new();
        let program = program_with_instruction(7);
        assert_eq!(host.bind(&program, SourceSpan::INVALID), INVALID_SGUID);
        assert_eq!(host.bind(&program, SourceSpan::new(99)), INVALID_SGUID);
    }

    #[test]
    fn test_commit_flushes_pending_once() {
        #[derive(Default)]
        struct Count {
            messages: Mutex<u32>,
        }

        impl BridgeListener for Count {
            fn handle(&self, streams: &[MessageStream]) {
                let mut messages = self.messages.lock().unwrap();
                for stream in streams {
                    *messages += stream.count();
                }
            }
        }

        let host = ShaderSguidHost::new();
        let bridge = MemoryBridge::new();
        let count = Arc::new(Count::default());
        bridge.register(ShaderSourceMappingMessage::ID, count.clone());

        let program = program_with_instruction(7);
        host.bind(&program, SourceSpan::new(7));

        host.commit(&bridge);
        bridge.commit();
        assert_eq!(*count.messages.lock().unwrap(), 1);

        // Nothing pending on a second commit.
        host.commit(&bridge);
        bridge.commit();
        assert_eq!(*count.messages.lock().unwrap(), 1);
    }
}
