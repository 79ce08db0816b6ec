/// Dedup key of an instrumented compile: two pipelines with equal keys and
/// equal signatures share one driver object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShaderInstrumentationKey {
    /// Enabled feature bit set.
    pub feature_bit_set: u64,
    /// Content hash over the shaders, the signature layout, and the
    /// feature set.
    pub combined_hash: u64,
}

impl ShaderInstrumentationKey {
    pub fn new(feature_bit_set: u64, combined_hash: u64) -> Self {
        Self {
            feature_bit_set,
            combined_hash,
        }
    }
}
