use crate::{Buffer, PipelineHandle};

/// Recorded command. Backends consume these at submission.
#[derive(Debug, Clone)]
pub enum Command {
    CopyBuffer {
        src: Buffer,
        dst: Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    /// Fill a byte range with a repeated dword.
    FillBuffer {
        dst: Buffer,
        offset: u64,
        size: u64,
        value: u32,
    },
    /// Upload inline data staged at record time.
    StageBuffer {
        dst: Buffer,
        offset: u64,
        data: Vec<u8>,
    },
    MemoryBarrier,
    BindPipeline {
        pipeline: PipelineHandle,
    },
    Dispatch {
        groups: [u32; 3],
    },
}

/// A recorded command list. Recording is single-threaded by contract; the
/// recording thread owns the buffer until submission.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn reset(&mut self) {
        self.commands.clear();
    }

    pub fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, src_offset: u64, dst_offset: u64, size: u64) {
        self.commands.push(Command::CopyBuffer {
            src: src.clone(),
            dst: dst.clone(),
            src_offset,
            dst_offset,
            size,
        });
    }

    pub fn fill_buffer(&mut self, dst: &Buffer, offset: u64, size: u64, value: u32) {
        self.commands.push(Command::FillBuffer {
            dst: dst.clone(),
            offset,
            size,
            value,
        });
    }

    pub fn stage_buffer(&mut self, dst: &Buffer, offset: u64, data: Vec<u8>) {
        self.commands.push(Command::StageBuffer {
            dst: dst.clone(),
            offset,
            data,
        });
    }

    pub fn memory_barrier(&mut self) {
        self.commands.push(Command::MemoryBarrier);
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.commands.push(Command::BindPipeline { pipeline });
    }

    pub fn dispatch(&mut self, groups: [u32; 3]) {
        self.commands.push(Command::Dispatch { groups });
    }
}
