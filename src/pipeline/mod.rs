//! Pipeline management: descriptor/pipeline-layout cache + PSO cache,
//! exposed together as the `PipelineManager` the encoder API vocabulary
//! refers to.

pub mod descriptor;
pub mod pso;

use crate::pipeline::descriptor::DescriptorLayoutCache;
use crate::pipeline::pso::PsoCache;
use crate::shader::ShaderModuleStore;

/// Bundles the process-wide caches a pass's execute callback needs to bind
/// pipelines and resolve arguments. Passed by reference; never cloned.
pub struct PipelineManager {
    pub shaders: ShaderModuleStore,
    pub descriptors: DescriptorLayoutCache,
    pub psos: PsoCache,
}

impl PipelineManager {
    pub fn new() -> PipelineManager {
        PipelineManager {
            shaders: ShaderModuleStore::new(),
            descriptors: DescriptorLayoutCache::new(),
            psos: PsoCache::new(),
        }
    }

    /// Tears down every retained API object across all three caches. Called
    /// once at renderer teardown, after the device is idle.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        self.psos.destroy(device);
        self.descriptors.destroy(device);
    }
}
