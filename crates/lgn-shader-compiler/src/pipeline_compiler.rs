//! Pipeline compilation: batched create-infos through the pool, with
//! per-batch dedup on the instrumentation key so equal keys cost one
//! driver compile and share the resulting handle.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use lgn_gpu_api::{
    ComputePipelineDesc, DeviceContext, GraphicsPipelineDesc, PipelineHandle, PipelineType,
};

use crate::{BatchCompletion, CompileError, CompilerPool, Result, ShaderInstrumentationKey};

/// Create description of one pipeline job.
#[derive(Debug, Clone)]
pub enum PipelineDesc {
    Graphics(GraphicsPipelineDesc),
    Compute(ComputePipelineDesc),
}

impl PipelineDesc {
    pub fn pipeline_type(&self) -> PipelineType {
        match self {
            Self::Graphics(_) => PipelineType::Graphics,
            Self::Compute(_) => PipelineType::Compute,
        }
    }
}

/// One queued pipeline compile.
pub struct PipelineJob {
    pub key: ShaderInstrumentationKey,
    pub desc: PipelineDesc,
    dedup: Option<Arc<DedupMap>>,
}

impl PipelineJob {
    pub fn new(key: ShaderInstrumentationKey, desc: PipelineDesc) -> Self {
        Self {
            key,
            desc,
            dedup: None,
        }
    }
}

enum DedupState {
    Compiling,
    Done(PipelineHandle),
    Failed,
}

/// Batch-scoped fingerprint table: the first job of a key compiles, the
/// rest block on it and share the handle.
#[derive(Default)]
struct DedupMap {
    states: Mutex<HashMap<ShaderInstrumentationKey, DedupState>>,
    condvar: Condvar,
}

impl DedupMap {
    fn compile_shared<F>(&self, key: ShaderInstrumentationKey, compile: F) -> Result<PipelineHandle>
    where
        F: FnOnce() -> Result<PipelineHandle>,
    {
        let mut states = self.states.lock().unwrap();

        loop {
            match states.get(&key) {
                None => {
                    states.insert(key, DedupState::Compiling);
                    drop(states);

                    let result = compile();

                    let mut states = self.states.lock().unwrap();
                    match &result {
                        Ok(handle) => states.insert(key, DedupState::Done(*handle)),
                        Err(_) => states.insert(key, DedupState::Failed),
                    };
                    self.condvar.notify_all();
                    return result;
                }
                Some(DedupState::Done(handle)) => return Ok(*handle),
                Some(DedupState::Failed) => return Err(CompileError::SharedKeyFailed),
                Some(DedupState::Compiling) => {
                    states = self.condvar.wait(states).unwrap();
                }
            }
        }
    }
}

/// The pipeline compiler pool.
pub struct PipelineCompiler {
    pool: CompilerPool<PipelineJob, PipelineHandle>,
}

impl PipelineCompiler {
    pub fn new(device: DeviceContext, worker_count: usize) -> Self {
        let pool = CompilerPool::new(worker_count, "pipeline-compiler", move |job: &PipelineJob| {
            let dedup = job.dedup.as_ref().expect("batch dedup installed");
            let device = device.clone();
            let desc = job.desc.clone();
            dedup.compile_shared(job.key, move || compile_pipeline(&device, &desc))
        });

        Self { pool }
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    pub fn chunked_size(&self, count: usize) -> usize {
        self.pool.chunked_size(count)
    }

    pub fn complete_counter(&self) -> u64 {
        self.pool.complete_counter()
    }

    /// Push a batch of jobs; the completion functor is invoked exactly
    /// once by the last worker.
    pub fn push(&self, mut jobs: Vec<PipelineJob>, completion: BatchCompletion<PipelineHandle>) {
        let dedup = Arc::new(DedupMap::default());
        for job in &mut jobs {
            job.dedup = Some(Arc::clone(&dedup));
        }
        self.pool.push(jobs, completion);
    }
}

fn compile_pipeline(device: &DeviceContext, desc: &PipelineDesc) -> Result<PipelineHandle> {
    match desc {
        PipelineDesc::Graphics(desc) => Ok(device.create_graphics_pipeline(desc)?),
        PipelineDesc::Compute(desc) => Ok(device.create_compute_pipeline(desc)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lgn_gpu_api::backends::null::NullDevice;
    use std::sync::mpsc;

    #[test]
    fn test_identical_keys_share_one_driver_compile() {
        let device = NullDevice::new();
        let context = device.context();

        let shader = context.create_shader_module(&[1, 2, 3]).unwrap();
        let compiler = PipelineCompiler::new(context, 4);

        // Ten identical compute create-infos under one key.
        let key = ShaderInstrumentationKey::new(0x01, 0xFEED);
        let jobs: Vec<PipelineJob> = (0..10)
            .map(|_| {
                PipelineJob::new(
                    key,
                    PipelineDesc::Compute(ComputePipelineDesc {
                        shader,
                        debug_name: None,
                    }),
                )
            })
            .collect();

        // Ten chunks with four workers.
        assert_eq!(compiler.chunked_size(jobs.len()), 1);

        let (sender, receiver) = mpsc::channel();
        compiler.push(
            jobs,
            Box::new(move |head, error, pipelines| {
                sender.send((head, error, pipelines)).unwrap();
            }),
        );

        let (_, error, pipelines) = receiver.recv().unwrap();
        assert!(error.is_none());
        assert_eq!(pipelines.len(), 10);

        let first = pipelines[0].expect("compiled");
        assert!(pipelines.iter().all(|p| *p == Some(first)));

        // One driver compile for the whole batch.
        assert_eq!(device.created_pipeline_count(), 1);
    }

    #[test]
    fn test_distinct_keys_compile_separately() {
        let device = NullDevice::new();
        let context = device.context();
        let shader = context.create_shader_module(&[1]).unwrap();
        let compiler = PipelineCompiler::new(context, 2);

        let jobs: Vec<PipelineJob> = (0..4)
            .map(|index| {
                PipelineJob::new(
                    ShaderInstrumentationKey::new(0x01, index),
                    PipelineDesc::Compute(ComputePipelineDesc {
                        shader,
                        debug_name: None,
                    }),
                )
            })
            .collect();

        let (sender, receiver) = mpsc::channel();
        compiler.push(
            jobs,
            Box::new(move |_, _, pipelines| {
                sender.send(pipelines).unwrap();
            }),
        );

        let pipelines = receiver.recv().unwrap();
        assert_eq!(pipelines.len(), 4);
        assert_eq!(device.created_pipeline_count(), 4);
    }
}
