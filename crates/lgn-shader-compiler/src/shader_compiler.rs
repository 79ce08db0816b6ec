//! Shader compilation: parse, inject, re-emit, sign, hand to the driver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lgn_dxbc::DxbcModule;
use lgn_gpu_api::{DeviceContext, ShaderModuleHandle};
use lgn_spirv::SpirvModule;

use crate::{
    BatchCompletion, CompilerDiagnostic, CompilerPool, Result, ShaderCache,
};

/// The two shader container formats the layer rewrites.
#[derive(Debug, Clone)]
pub enum ShaderSource {
    SpirV(Vec<u8>),
    Dxbc(Vec<u8>),
}

impl ShaderSource {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::SpirV(bytes) | Self::Dxbc(bytes) => bytes,
        }
    }
}

/// The instrumentation seam: features rewrite the parsed module through
/// the IL; the compiler neither knows nor cares which checks went in.
pub trait ShaderInstrumenter: Send + Sync {
    /// # Errors
    ///
    /// A failed injection marks the shader un-instrumentable; its original
    /// driver object stays live.
    fn instrument_spirv(&self, module: &mut SpirvModule, feature_bit_set: u64) -> Result<()>;

    /// # Errors
    ///
    /// Same contract as [`ShaderInstrumenter::instrument_spirv`].
    fn instrument_dxbc(&self, module: &mut DxbcModule, feature_bit_set: u64) -> Result<()>;
}

/// One queued shader compile.
pub struct ShaderJob {
    pub shader_guid: u64,
    pub source: ShaderSource,
    /// Features to inject.
    pub feature_bit_set: u64,
    /// Versions the cache key: a feature-set change invalidates hits.
    pub feature_version_uid: u64,
    pub instrumenter: Arc<dyn ShaderInstrumenter>,
    pub diagnostic: Arc<CompilerDiagnostic>,
}

/// The shader compiler pool.
pub struct ShaderCompiler {
    pool: CompilerPool<ShaderJob, ShaderModuleHandle>,
    cache_hits: Arc<AtomicU64>,
}

impl ShaderCompiler {
    pub fn new(device: DeviceContext, cache: Arc<ShaderCache>, worker_count: usize) -> Self {
        let cache_hits = Arc::new(AtomicU64::new(0));

        let pool = {
            let cache_hits = Arc::clone(&cache_hits);
            CompilerPool::new(worker_count, "shader-compiler", move |job: &ShaderJob| {
                match compile_shader(&device, &cache, &cache_hits, job) {
                    Ok(handle) => Ok(handle),
                    Err(error) => {
                        job.diagnostic.record_failure(job.shader_guid, &error);
                        Err(error)
                    }
                }
            })
        };

        Self { pool, cache_hits }
    }

    pub fn chunked_size(&self, count: usize) -> usize {
        self.pool.chunked_size(count)
    }

    pub fn complete_counter(&self) -> u64 {
        self.pool.complete_counter()
    }

    pub fn cache_hit_count(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn push(&self, jobs: Vec<ShaderJob>, completion: BatchCompletion<ShaderModuleHandle>) {
        self.pool.push(jobs, completion);
    }
}

fn compile_shader(
    device: &DeviceContext,
    cache: &ShaderCache,
    cache_hits: &AtomicU64,
    job: &ShaderJob,
) -> Result<ShaderModuleHandle> {
    let source_bytes = job.source.bytes();

    if let Some(blob) = cache.query(job.feature_version_uid, source_bytes) {
        cache_hits.fetch_add(1, Ordering::Relaxed);
        return Ok(device.create_shader_module(&blob)?);
    }

    let compiled = match &job.source {
        ShaderSource::SpirV(bytes) => {
            let mut module = SpirvModule::parse(bytes, job.shader_guid)?;
            job.instrumenter
                .instrument_spirv(&mut module, job.feature_bit_set)?;
            module.emit()?
        }
        ShaderSource::Dxbc(bytes) => {
            let mut module = DxbcModule::parse(bytes, job.shader_guid)?;
            job.instrumenter
                .instrument_dxbc(&mut module, job.feature_bit_set)?;
            module.stitch(None)?
        }
    };

    let handle = device.create_shader_module(&compiled)?;
    cache.insert(job.feature_version_uid, source_bytes, 0, &compiled);
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompileError;
    use lgn_gpu_api::backends::null::NullDevice;
    use std::sync::mpsc;

    struct NoopInstrumenter;

    impl ShaderInstrumenter for NoopInstrumenter {
        fn instrument_spirv(&self, _module: &mut SpirvModule, _bits: u64) -> Result<()> {
            Ok(())
        }

        fn instrument_dxbc(&self, _module: &mut DxbcModule, _bits: u64) -> Result<()> {
            Ok(())
        }
    }

    fn minimal_spirv() -> Vec<u8> {
        let words: [u32; 8] = [
            lgn_spirv::spec::MAGIC,
            0x0001_0000,
            0,
            4,
            0,
            lgn_spirv::spec::pack_op(lgn_spirv::spec::OP_MEMORY_MODEL, 3),
            0,
            1,
        ];
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn job(source: ShaderSource, diagnostic: &Arc<CompilerDiagnostic>) -> ShaderJob {
        ShaderJob {
            shader_guid: 1,
            source,
            feature_bit_set: 0x01,
            feature_version_uid: 0x10,
            instrumenter: Arc::new(NoopInstrumenter),
            diagnostic: Arc::clone(diagnostic),
        }
    }

    fn push_and_wait(
        compiler: &ShaderCompiler,
        jobs: Vec<ShaderJob>,
    ) -> (Option<CompileError>, Vec<Option<ShaderModuleHandle>>) {
        let (sender, receiver) = mpsc::channel();
        compiler.push(
            jobs,
            Box::new(move |_, error, outputs| {
                sender.send((error, outputs)).unwrap();
            }),
        );
        receiver.recv().unwrap()
    }

    #[test]
    fn test_compile_and_cache_hit() {
        let device = NullDevice::new();
        let cache = Arc::new(ShaderCache::new());
        let compiler = ShaderCompiler::new(device.context(), Arc::clone(&cache), 2);
        let diagnostic = Arc::new(CompilerDiagnostic::default());

        let (error, outputs) = push_and_wait(
            &compiler,
            vec![job(ShaderSource::SpirV(minimal_spirv()), &diagnostic)],
        );
        assert!(error.is_none());
        assert!(outputs[0].is_some());
        assert_eq!(compiler.cache_hit_count(), 0);
        assert_eq!(cache.entry_count(), 1);

        let (error, outputs) = push_and_wait(
            &compiler,
            vec![job(ShaderSource::SpirV(minimal_spirv()), &diagnostic)],
        );
        assert!(error.is_none());
        assert!(outputs[0].is_some());
        assert_eq!(compiler.cache_hit_count(), 1);
    }

    #[test]
    fn test_parse_failure_is_local_and_diagnosed() {
        let device = NullDevice::new();
        let cache = Arc::new(ShaderCache::new());
        let compiler = ShaderCompiler::new(device.context(), cache, 2);
        let diagnostic = Arc::new(CompilerDiagnostic::default());

        let (error, outputs) = push_and_wait(
            &compiler,
            vec![
                job(ShaderSource::SpirV(vec![1, 2, 3]), &diagnostic),
                job(ShaderSource::SpirV(minimal_spirv()), &diagnostic),
            ],
        );

        assert!(matches!(error, Some(CompileError::Parse(_))));
        assert!(outputs[0].is_none());
        assert!(outputs[1].is_some());
        assert_eq!(diagnostic.failed_job_count(), 1);
    }

    #[test]
    fn test_dxbc_source_compiles() {
        let device = NullDevice::new();
        let cache = Arc::new(ShaderCache::new());
        let compiler = ShaderCompiler::new(device.context(), cache, 1);
        let diagnostic = Arc::new(CompilerDiagnostic::default());

        // An empty container: header only, zero chunks.
        let mut container = Vec::new();
        container.extend_from_slice(&lgn_dxbc::CONTAINER_MAGIC.to_le_bytes());
        container.extend_from_slice(&[0u8; 16]);
        container.extend_from_slice(&1u32.to_le_bytes());
        container.extend_from_slice(&32u32.to_le_bytes());
        container.extend_from_slice(&0u32.to_le_bytes());
        lgn_dxbc::sign_with_bypass(&mut container).unwrap();

        let (error, outputs) = push_and_wait(
            &compiler,
            vec![job(ShaderSource::Dxbc(container), &diagnostic)],
        );
        assert!(error.is_none());
        assert!(outputs[0].is_some());
    }
}
