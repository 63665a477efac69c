//! Pipeline state object cache.
//!
//! Two layers: the PSO description cache (content-hashed, exclusive lock on
//! introduction, shared lock on lookup) and the API-pipeline materialization
//! cache (single-writer, keyed by a hash that folds in the target
//! renderpass's compatibility hash).

use std::ffi::CString;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, RwLock};

use ash::vk;
use fxhash::FxHasher64;

use crate::error::{GraphError, Result};
use crate::shader::ShaderModuleStore;

pub type PsoHash = u64;
pub type RenderpassCompatibilityHash = u64;
pub type MaterializationKey = u64;

#[derive(Debug, Clone, Copy, Hash)]
pub struct RasterizationState {
    pub polygon_mode: i32,
    pub cull_mode: u32,
    pub front_face: i32,
}

#[derive(Debug, Clone, Copy, Hash)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: i32,
}

#[derive(Debug, Clone, Copy, Hash)]
pub struct AttachmentBlendState {
    pub blend_enable: bool,
    pub color_write_mask: u32,
}

#[derive(Debug, Clone, Hash)]
pub struct VertexInputBinding {
    pub binding: u32,
    pub stride: u32,
}

#[derive(Debug, Clone, Hash)]
pub struct VertexInputAttribute {
    pub location: u32,
    pub binding: u32,
    pub format_raw: i32,
    pub offset: u32,
}

/// Graphics PSO description. Content hash folds the fixed-state blob with
/// each stage's module hash in insertion order, then the explicit
/// vertex-input arrays if non-empty.
#[derive(Debug, Clone)]
pub struct GraphicsPsoDesc {
    pub stage_module_hashes: Vec<u64>,
    pub rasterization: RasterizationState,
    pub sample_count: vk::SampleCountFlags,
    pub depth_stencil: DepthStencilState,
    pub primitive_topology: vk::PrimitiveTopology,
    pub attachment_blends: Vec<AttachmentBlendState>,
    pub vertex_bindings: Vec<VertexInputBinding>,
    pub vertex_attributes: Vec<VertexInputAttribute>,
}

impl GraphicsPsoDesc {
    pub fn content_hash(&self) -> PsoHash {
        let mut hasher = FxHasher64::default();
        self.rasterization.hash(&mut hasher);
        self.sample_count.as_raw().hash(&mut hasher);
        self.depth_stencil.hash(&mut hasher);
        (self.primitive_topology.as_raw() as u32).hash(&mut hasher);
        for blend in &self.attachment_blends {
            blend.hash(&mut hasher);
        }
        for stage_hash in &self.stage_module_hashes {
            stage_hash.hash(&mut hasher);
        }
        if !self.vertex_bindings.is_empty() || !self.vertex_attributes.is_empty() {
            for b in &self.vertex_bindings {
                b.hash(&mut hasher);
            }
            for a in &self.vertex_attributes {
                a.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}

#[derive(Debug, Clone)]
pub struct ComputePsoDesc {
    pub module_hash: u64,
}

impl ComputePsoDesc {
    pub fn content_hash(&self) -> PsoHash {
        self.module_hash
    }
}

#[derive(Debug, Clone, Hash)]
pub struct ShaderGroupInfo {
    pub group_type: u32,
    pub general: Option<u32>,
    pub closest_hit: Option<u32>,
    pub any_hit: Option<u32>,
    pub intersection: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RtxPsoDesc {
    pub stage_module_hashes: Vec<u64>,
    pub groups: Vec<ShaderGroupInfo>,
}

impl RtxPsoDesc {
    pub fn content_hash(&self) -> PsoHash {
        let mut hasher = FxHasher64::default();
        for stage_hash in &self.stage_module_hashes {
            stage_hash.hash(&mut hasher);
        }
        for group in &self.groups {
            group.hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[derive(Debug, Clone)]
pub enum PsoDesc {
    Graphics(GraphicsPsoDesc),
    Compute(ComputePsoDesc),
    Rtx(RtxPsoDesc),
}

impl PsoDesc {
    pub fn content_hash(&self) -> PsoHash {
        match self {
            PsoDesc::Graphics(d) => d.content_hash(),
            PsoDesc::Compute(d) => d.content_hash(),
            PsoDesc::Rtx(d) => d.content_hash(),
        }
    }
}

/// An attachment description reduced to the fields that matter for
/// compatibility: format and sample count, but not load/store ops.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct AttachmentCompatibility {
    pub format_raw: i32,
    pub sample_count: u32,
}

#[derive(Debug, Clone, Hash)]
pub struct SubpassCompatibility {
    pub color_attachment_refs: Vec<u32>,
    pub depth_attachment_ref: Option<u32>,
}

/// Computes the renderpass-compatibility hash: identical attachment layout
/// sequences with differing load/store ops hash the same; differing
/// formats hash differently.
pub fn renderpass_compatibility_hash(attachments: &[AttachmentCompatibility], subpasses: &[SubpassCompatibility]) -> RenderpassCompatibilityHash {
    let mut hasher = FxHasher64::default();
    for a in attachments {
        a.hash(&mut hasher);
    }
    for s in subpasses {
        s.hash(&mut hasher);
    }
    hasher.finish()
}

pub fn materialization_key(pso: PsoHash, renderpass_compat: RenderpassCompatibilityHash, stage_module_hashes: &[u64], pipeline_layout_hash: u64) -> MaterializationKey {
    let mut hasher = FxHasher64::default();
    pso.hash(&mut hasher);
    renderpass_compat.hash(&mut hasher);
    for h in stage_module_hashes {
        h.hash(&mut hasher);
    }
    pipeline_layout_hash.hash(&mut hasher);
    hasher.finish()
}

struct Introduced {
    descs: std::collections::HashMap<PsoHash, PsoDesc>,
}

/// PSO cache. `introduce` takes an exclusive lock; `lookup` takes a shared
/// lock.
pub struct PsoCache {
    introduced: RwLock<Introduced>,
    /// The API-pipeline map: single-writer, only the submission path
    /// mutates it.
    materialized: Mutex<std::collections::HashMap<MaterializationKey, vk::Pipeline>>,
}

impl PsoCache {
    pub fn new() -> PsoCache {
        PsoCache {
            introduced: RwLock::new(Introduced { descs: std::collections::HashMap::new() }),
            materialized: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Building the same PSO twice yields the same handle; changing any
    /// contributing field changes the handle.
    pub fn introduce(&self, desc: PsoDesc) -> PsoHash {
        let hash = desc.content_hash();
        let mut introduced = self.introduced.write().expect("pso cache lock poisoned");
        introduced.descs.entry(hash).or_insert(desc);
        hash
    }

    pub fn lookup(&self, hash: PsoHash) -> Option<PsoDesc> {
        let introduced = self.introduced.read().expect("pso cache lock poisoned");
        introduced.descs.get(&hash).cloned()
    }

    pub fn materialized_pipeline(&self, key: MaterializationKey) -> Option<vk::Pipeline> {
        self.materialized.lock().expect("pso materialization lock poisoned").get(&key).copied()
    }

    pub fn insert_materialized(&self, key: MaterializationKey, pipeline: vk::Pipeline) {
        self.materialized.lock().expect("pso materialization lock poisoned").insert(key, pipeline);
    }

    /// Builds (or reuses, by `key`) the real `vk::Pipeline` for a graphics
    /// PSO against a compatible renderpass/subpass. Shader modules are
    /// created just for this call and destroyed immediately
    /// after, since neither Vulkan nor this cache need them to outlive
    /// pipeline creation.
    pub fn materialize_graphics_pipeline(
        &self,
        device: &ash::Device,
        shaders: &ShaderModuleStore,
        desc: &GraphicsPsoDesc,
        pipeline_layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
        subpass: u32,
        key: MaterializationKey,
    ) -> Result<vk::Pipeline> {
        if let Some(pipeline) = self.materialized_pipeline(key) {
            return Ok(pipeline);
        }

        let entry_point = CString::new("main").expect("no interior NUL");
        let mut stage_modules = Vec::with_capacity(desc.stage_module_hashes.len());
        for &hash in &desc.stage_module_hashes {
            let (stage, spirv) = shaders
                .with_module(hash, |m| (m.stage, m.spirv.clone()))
                .ok_or_else(|| pso_error(format!("unknown shader module hash {:#x}", hash)))?;
            let module = create_shader_module_object(device, &spirv)?;
            stage_modules.push((stage, module));
        }
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = stage_modules
            .iter()
            .map(|(stage, module)| vk::PipelineShaderStageCreateInfo::builder().stage(*stage).module(*module).name(&entry_point).build())
            .collect();

        let vertex_bindings: Vec<vk::VertexInputBindingDescription> = desc
            .vertex_bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription { binding: b.binding, stride: b.stride, input_rate: vk::VertexInputRate::VERTEX })
            .collect();
        let vertex_attributes: Vec<vk::VertexInputAttributeDescription> = desc
            .vertex_attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: vk::Format::from_raw(a.format_raw),
                offset: a.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes)
            .build();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder().topology(desc.primitive_topology).build();

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder().viewport_count(1).scissor_count(1).build();

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(raw_to_polygon_mode(desc.rasterization.polygon_mode))
            .cull_mode(vk::CullModeFlags::from_raw(desc.rasterization.cull_mode))
            .front_face(raw_to_front_face(desc.rasterization.front_face))
            .line_width(1.0)
            .build();

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(desc.sample_count).build();

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_stencil.depth_test_enable)
            .depth_write_enable(desc.depth_stencil.depth_write_enable)
            .depth_compare_op(raw_to_compare_op(desc.depth_stencil.depth_compare_op))
            .build();

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .attachment_blends
            .iter()
            .map(|b| vk::PipelineColorBlendAttachmentState {
                blend_enable: b.blend_enable as vk::Bool32,
                color_write_mask: vk::ColorComponentFlags::from_raw(b.color_write_mask),
                src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
                dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
                color_blend_op: vk::BlendOp::ADD,
                src_alpha_blend_factor: vk::BlendFactor::ONE,
                dst_alpha_blend_factor: vk::BlendFactor::ZERO,
                alpha_blend_op: vk::BlendOp::ADD,
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments).build();

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR, vk::DynamicState::LINE_WIDTH];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states).build();

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(pipeline_layout)
            .render_pass(render_pass)
            .subpass(subpass)
            .build();

        let result = unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None) };
        for (_, module) in &stage_modules {
            unsafe { device.destroy_shader_module(*module, None) };
        }
        let pipeline = result.map_err(|(_, e)| pso_error(format!("create_graphics_pipelines failed: {:?}", e)))?[0];
        self.insert_materialized(key, pipeline);
        Ok(pipeline)
    }

    /// Builds (or reuses, by `key`) the real `vk::Pipeline` for a compute
    /// PSO.
    pub fn materialize_compute_pipeline(
        &self,
        device: &ash::Device,
        shaders: &ShaderModuleStore,
        desc: &ComputePsoDesc,
        pipeline_layout: vk::PipelineLayout,
        key: MaterializationKey,
    ) -> Result<vk::Pipeline> {
        if let Some(pipeline) = self.materialized_pipeline(key) {
            return Ok(pipeline);
        }
        let entry_point = CString::new("main").expect("no interior NUL");
        let spirv = shaders
            .with_module(desc.module_hash, |m| m.spirv.clone())
            .ok_or_else(|| pso_error(format!("unknown shader module hash {:#x}", desc.module_hash)))?;
        let module = create_shader_module_object(device, &spirv)?;
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point)
            .build();
        let create_info = vk::ComputePipelineCreateInfo::builder().stage(stage).layout(pipeline_layout).build();
        let result = unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None) };
        unsafe { device.destroy_shader_module(module, None) };
        let pipeline = result.map_err(|(_, e)| pso_error(format!("create_compute_pipelines failed: {:?}", e)))?[0];
        self.insert_materialized(key, pipeline);
        Ok(pipeline)
    }

    /// Destroys every retained materialized pipeline. Called once at
    /// renderer teardown.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        let materialized = self.materialized.lock().expect("pso materialization lock poisoned");
        for pipeline in materialized.values() {
            device.destroy_pipeline(*pipeline, None);
        }
    }
}

fn create_shader_module_object(device: &ash::Device, spirv: &[u8]) -> Result<vk::ShaderModule> {
    // SPIR-V words are little-endian; ash wants a `&[u32]` view of the bytes.
    let words: Vec<u32> = spirv.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words).build();
    unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| pso_error(format!("create_shader_module failed: {:?}", e)))
}

fn pso_error(message: String) -> GraphError {
    GraphError::Unsupported { message }
}

fn raw_to_polygon_mode(raw: i32) -> vk::PolygonMode {
    match raw {
        1 => vk::PolygonMode::LINE,
        2 => vk::PolygonMode::POINT,
        _ => vk::PolygonMode::FILL,
    }
}

fn raw_to_front_face(raw: i32) -> vk::FrontFace {
    match raw {
        1 => vk::FrontFace::CLOCKWISE,
        _ => vk::FrontFace::COUNTER_CLOCKWISE,
    }
}

fn raw_to_compare_op(raw: i32) -> vk::CompareOp {
    match raw {
        0 => vk::CompareOp::NEVER,
        2 => vk::CompareOp::EQUAL,
        3 => vk::CompareOp::LESS_OR_EQUAL,
        4 => vk::CompareOp::GREATER,
        5 => vk::CompareOp::NOT_EQUAL,
        6 => vk::CompareOp::GREATER_OR_EQUAL,
        7 => vk::CompareOp::ALWAYS,
        _ => vk::CompareOp::LESS,
    }
}

impl Clone for PsoDesc {
    fn clone(&self) -> PsoDesc {
        match self {
            PsoDesc::Graphics(d) => PsoDesc::Graphics(d.clone()),
            PsoDesc::Compute(d) => PsoDesc::Compute(d.clone()),
            PsoDesc::Rtx(d) => PsoDesc::Rtx(d.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_desc(module_hash: u64) -> GraphicsPsoDesc {
        GraphicsPsoDesc {
            stage_module_hashes: vec![module_hash],
            rasterization: RasterizationState { polygon_mode: 0, cull_mode: 0, front_face: 0 },
            sample_count: vk::SampleCountFlags::TYPE_1,
            depth_stencil: DepthStencilState { depth_test_enable: true, depth_write_enable: true, depth_compare_op: 0 },
            primitive_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            attachment_blends: vec![AttachmentBlendState { blend_enable: false, color_write_mask: 0xf }],
            vertex_bindings: vec![],
            vertex_attributes: vec![],
        }
    }

    #[test]
    fn same_pso_description_yields_the_same_handle() {
        let cache = PsoCache::new();
        let a = cache.introduce(PsoDesc::Graphics(sample_desc(42)));
        let b = cache.introduce(PsoDesc::Graphics(sample_desc(42)));
        assert_eq!(a, b);
    }

    #[test]
    fn changing_the_module_hash_changes_the_handle() {
        let cache = PsoCache::new();
        let a = cache.introduce(PsoDesc::Graphics(sample_desc(42)));
        let b = cache.introduce(PsoDesc::Graphics(sample_desc(43)));
        assert_ne!(a, b);
    }

    #[test]
    fn compatibility_hash_ignores_load_store_ops_but_not_format() {
        let attachments_a = vec![AttachmentCompatibility { format_raw: vk::Format::R8G8B8A8_UNORM.as_raw(), sample_count: 1 }];
        let attachments_b = attachments_a.clone();
        let subpasses = vec![SubpassCompatibility { color_attachment_refs: vec![0], depth_attachment_ref: None }];

        let hash_a = renderpass_compatibility_hash(&attachments_a, &subpasses);
        let hash_b = renderpass_compatibility_hash(&attachments_b, &subpasses);
        assert_eq!(hash_a, hash_b, "identical attachment sequences should hash the same regardless of load/store ops");

        let attachments_c = vec![AttachmentCompatibility { format_raw: vk::Format::B8G8R8A8_UNORM.as_raw(), sample_count: 1 }];
        let hash_c = renderpass_compatibility_hash(&attachments_c, &subpasses);
        assert_ne!(hash_a, hash_c, "differing attachment formats should hash differently");
    }
}
