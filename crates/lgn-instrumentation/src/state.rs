use std::collections::HashMap;
use std::sync::Mutex;

use lgn_gpu_api::{
    ComputePipelineDesc, GraphicsPipelineDesc, PipelineHandle, PipelineType, ShaderModuleHandle,
};
use lgn_shader_compiler::{
    combine_hash, content_hash, PipelineDesc, ShaderInstrumentationKey, ShaderSource,
};

/// A tracked shader module: the original byte code, the driver object the
/// application created, and the instrumented objects per key.
pub struct ShaderState {
    shader_guid: u64,
    source: ShaderSource,
    original: ShaderModuleHandle,
    content_hash: u64,
    instruments: Mutex<HashMap<ShaderInstrumentationKey, ShaderModuleHandle>>,
}

impl ShaderState {
    pub fn new(shader_guid: u64, source: ShaderSource, original: ShaderModuleHandle) -> Self {
        let content_hash = content_hash(source.bytes());
        Self {
            shader_guid,
            source,
            original,
            content_hash,
            instruments: Mutex::new(HashMap::new()),
        }
    }

    pub fn shader_guid(&self) -> u64 {
        self.shader_guid
    }

    pub fn source(&self) -> &ShaderSource {
        &self.source
    }

    pub fn original(&self) -> ShaderModuleHandle {
        self.original
    }

    pub fn content_hash(&self) -> u64 {
        self.content_hash
    }

    /// Key of this shader at a feature set.
    pub fn instrumentation_key(&self, feature_bit_set: u64) -> ShaderInstrumentationKey {
        ShaderInstrumentationKey::new(feature_bit_set, self.content_hash)
    }

    pub fn set_instrument(&self, key: ShaderInstrumentationKey, handle: ShaderModuleHandle) {
        self.instruments.lock().unwrap().insert(key, handle);
    }

    pub fn instrument(&self, key: ShaderInstrumentationKey) -> Option<ShaderModuleHandle> {
        self.instruments.lock().unwrap().get(&key).copied()
    }
}

/// A tracked pipeline: its deep-copied creation description, the shader
/// states it references, and whichever driver object is currently live.
pub struct PipelineState {
    uid: u64,
    pipeline_type: PipelineType,
    debug_name: Option<String>,
    shaders: Vec<std::sync::Arc<ShaderState>>,
    desc: PipelineDesc,
    original: PipelineHandle,
    combined_hash: u64,
    current_instrument: Mutex<Option<PipelineHandle>>,
}

impl PipelineState {
    pub fn new(
        uid: u64,
        debug_name: Option<String>,
        shaders: Vec<std::sync::Arc<ShaderState>>,
        desc: PipelineDesc,
        original: PipelineHandle,
        signature_hash: u64,
    ) -> Self {
        // Content hash over the shaders and the signature layout; the
        // feature set rides separately in the instrumentation key.
        let mut combined_hash = 0u64;
        for shader in &shaders {
            combine_hash(&mut combined_hash, shader.content_hash());
        }
        combine_hash(&mut combined_hash, signature_hash);

        Self {
            uid,
            pipeline_type: desc.pipeline_type(),
            debug_name,
            shaders,
            desc,
            original,
            combined_hash,
            current_instrument: Mutex::new(None),
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.pipeline_type
    }

    pub fn debug_name(&self) -> Option<&str> {
        self.debug_name.as_deref()
    }

    pub fn shaders(&self) -> &[std::sync::Arc<ShaderState>] {
        &self.shaders
    }

    pub fn combined_hash(&self) -> u64 {
        self.combined_hash
    }

    pub fn original(&self) -> PipelineHandle {
        self.original
    }

    /// Key of this pipeline at a feature set.
    pub fn instrumentation_key(&self, feature_bit_set: u64) -> ShaderInstrumentationKey {
        ShaderInstrumentationKey::new(feature_bit_set, self.combined_hash)
    }

    /// The driver object application work binds: the instrumented variant
    /// once a batch committed it, the original otherwise. Never an
    /// in-flight compile.
    pub fn bound_object(&self) -> PipelineHandle {
        self.current_instrument.lock().unwrap().unwrap_or(self.original)
    }

    pub fn set_instrument(&self, handle: Option<PipelineHandle>) {
        *self.current_instrument.lock().unwrap() = handle;
    }

    /// Creation description against the instrumented shader objects of a
    /// feature set. `None` when any shader failed to instrument; the
    /// pipeline then keeps its original object.
    pub fn instrumented_desc(&self, feature_bit_set: u64) -> Option<PipelineDesc> {
        match &self.desc {
            PipelineDesc::Compute(desc) => {
                let shader = self.shaders.first()?;
                let instrument = shader.instrument(shader.instrumentation_key(feature_bit_set))?;
                Some(PipelineDesc::Compute(ComputePipelineDesc {
                    shader: instrument,
                    debug_name: desc.debug_name.clone(),
                }))
            }
            PipelineDesc::Graphics(desc) => {
                let mut instruments = Vec::with_capacity(self.shaders.len());
                for shader in &self.shaders {
                    instruments
                        .push(shader.instrument(shader.instrumentation_key(feature_bit_set))?);
                }
                Some(PipelineDesc::Graphics(GraphicsPipelineDesc {
                    shaders: instruments,
                    debug_name: desc.debug_name.clone(),
                }))
            }
        }
    }
}
