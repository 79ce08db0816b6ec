use byteorder::{ByteOrder, LittleEndian};
use lgn_shader_il::{Program, Traceback};

use crate::{builder, spec, writer, CodecError, InjectionBindings, Result};

/// Parsed module header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpirvHeader {
    pub magic: u32,
    pub version: u32,
    pub generator: u32,
    pub bound: u32,
    pub reserved: u32,
}

/// Physical position of one instruction in the word stream.
#[derive(Debug, Clone, Copy)]
pub struct RawInstruction {
    pub opcode: u16,
    pub word_count: u16,
    /// Word offset of the instruction's leading word.
    pub offset: u32,
}

/// A scanned SPIR-V module.
///
/// Parsing is physical only; the IL program is built on the first call to
/// [`SpirvModule::program`], so modules that are never instrumented stay
/// cheap.
pub struct SpirvModule {
    shader_guid: u64,
    header: SpirvHeader,
    words: Vec<u32>,
    instructions: Vec<RawInstruction>,
    /// Word offset of the first `OpFunction`, or the stream end.
    first_function_offset: usize,
    /// Word offset where the global types/constants/variables section
    /// starts. Injected annotations are spliced in just before it.
    global_section_offset: usize,
    program: Option<ProgramBundle>,
}

pub(crate) struct ProgramBundle {
    pub program: Program,
    pub maps: builder::CodecMaps,
}

impl SpirvModule {
    /// Scan a SPIR-V byte stream.
    ///
    /// # Errors
    ///
    /// Any malformed input fails with [`CodecError::ShaderParsingFailed`];
    /// the scan never panics on application-supplied bytes.
    pub fn parse(bytes: &[u8], shader_guid: u64) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(CodecError::ShaderParsingFailed(format!(
                "byte length {} is not word aligned",
                bytes.len()
            )));
        }

        let mut words = vec![0u32; bytes.len() / 4];
        LittleEndian::read_u32_into(bytes, &mut words);

        if words.len() < spec::HEADER_WORD_COUNT {
            return Err(CodecError::ShaderParsingFailed(format!(
                "stream of {} words is shorter than the header",
                words.len()
            )));
        }

        let header = SpirvHeader {
            magic: words[0],
            version: words[1],
            generator: words[2],
            bound: words[3],
            reserved: words[4],
        };

        if header.magic != spec::MAGIC {
            return Err(CodecError::ShaderParsingFailed(format!(
                "unexpected magic {:#010x}",
                header.magic
            )));
        }

        // Scan the instruction stream, validating layout as we go.
        let mut instructions = Vec::new();
        let mut first_function_offset = words.len();
        let mut global_section_offset = words.len();

        let mut offset = spec::HEADER_WORD_COUNT;
        while offset < words.len() {
            let (opcode, word_count) = spec::unpack_op(words[offset]);

            if word_count == 0 {
                return Err(CodecError::ShaderParsingFailed(format!(
                    "zero word count at word {}",
                    offset
                )));
            }

            if offset + word_count as usize > words.len() {
                return Err(CodecError::ShaderParsingFailed(format!(
                    "instruction at word {} overruns the stream",
                    offset
                )));
            }

            if spec::is_global_section_op(opcode) && global_section_offset == words.len() {
                global_section_offset = offset;
            }

            if opcode == spec::OP_FUNCTION && first_function_offset == words.len() {
                first_function_offset = offset;
            }

            instructions.push(RawInstruction {
                opcode,
                word_count,
                offset: offset as u32,
            });

            offset += word_count as usize;
        }

        // A module without globals starts its section at the functions.
        if global_section_offset > first_function_offset {
            global_section_offset = first_function_offset;
        }

        Ok(Self {
            shader_guid,
            header,
            words,
            instructions,
            first_function_offset,
            global_section_offset,
            program: None,
        })
    }

    pub fn shader_guid(&self) -> u64 {
        self.shader_guid
    }

    pub fn header(&self) -> &SpirvHeader {
        &self.header
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn instructions(&self) -> &[RawInstruction] {
        &self.instructions
    }

    pub(crate) fn first_function_offset(&self) -> usize {
        self.first_function_offset
    }

    pub(crate) fn global_section_offset(&self) -> usize {
        self.global_section_offset
    }

    /// The IL program, built on first use.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ShaderParsingFailed`] if the instruction stream
    /// cannot be structured into functions and blocks.
    pub fn program(&mut self) -> Result<&mut Program> {
        if self.program.is_none() {
            let (program, maps) = builder::build(self)?;
            log::debug!(
                "structured spirv module {:#x}: {} functions, {} types",
                self.shader_guid,
                program.functions().len(),
                program.types.len()
            );
            self.program = Some(ProgramBundle { program, maps });
        }

        Ok(&mut self.program.as_mut().expect("just built").program)
    }

    /// The IL program, if it was built.
    pub fn try_program(&self) -> Option<&Program> {
        self.program.as_ref().map(|b| &b.program)
    }

    /// Resolve a code offset recorded on an IL instruction back to its
    /// block and instruction index.
    pub fn traceback(&self, code_offset: u32) -> Option<Traceback> {
        self.try_program()?.traceback(code_offset)
    }

    /// Re-emit the module with default injection bindings.
    ///
    /// # Errors
    ///
    /// See [`SpirvModule::emit_with`].
    pub fn emit(&self) -> Result<Vec<u8>> {
        self.emit_with(&InjectionBindings::default())
    }

    /// Re-emit the module.
    ///
    /// A module whose program was never built or never mutated emits the
    /// original bytes unchanged. A mutated program re-emits its dirty
    /// functions, splicing injected globals into the right sections.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::EmissionFailed`] or
    /// [`CodecError::UnsupportedInjection`] when injected IL cannot be
    /// lowered; the caller falls back to the uninstrumented shader.
    pub fn emit_with(&self, bindings: &InjectionBindings) -> Result<Vec<u8>> {
        match &self.program {
            Some(bundle) if bundle.program.is_dirty() => writer::emit(self, bundle, bindings),
            _ => Ok(words_to_bytes(&self.words)),
        }
    }
}

pub(crate) fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = vec![0u8; words.len() * 4];
    LittleEndian::write_u32_into(words, &mut bytes);
    bytes
}
