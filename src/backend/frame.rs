//! Per-frame orchestrator: the seven-step lifecycle a frame's slot goes
//! through in the swapchain ring.

use std::collections::HashMap;
use std::ffi::c_void;

use ash::vk;
use log::{debug, warn};

use crate::alloc::{LinearAllocator, StagingAllocator};
use crate::backend::PhysicalResource;
use crate::command::decoder::CommandDecoder;
use crate::command::{CommandEncoder, RecordedCommand};
use crate::device::{find_memory_type_index, VulkanDevice};
use crate::error::{GraphError, Result};
use crate::graph::{self, ResolvedGraph};
use crate::handle::ResourceHandle;
use crate::module::RenderModule;
use crate::pipeline::descriptor::{DescriptorData, DescriptorLayoutCache, MergedBinding};
use crate::pipeline::pso::{materialization_key, AttachmentCompatibility, PsoDesc, RenderpassCompatibilityHash, SubpassCompatibility};
use crate::pipeline::PipelineManager;
use crate::settings::settings;
use crate::shader::StageBinding;
use crate::sync::{plan_sync, ResourceState, SyncPlan};

/// A resource a pass's command stream can reference once it has been bound
/// for this frame: buffers and the images they're attached/sampled
/// through, keyed by the same handle the encoder recorded.
#[derive(Debug, Clone, Copy)]
pub enum FrameResource {
    Buffer(vk::Buffer),
    Image { image: vk::Image, view: vk::ImageView },
}

/// Per-set argument state for the currently bound pipeline: binding a new
/// pipeline resets argument state, preallocating a flat array of
/// `DescriptorData` slots per set. `data`'s slot order
/// matches `bindings`' (sorted by binding) and the set's update-template
/// entry offsets.
struct BoundArgumentSet {
    set_layout_hash: u64,
    bindings: Vec<MergedBinding>,
    data: Vec<DescriptorData>,
    dynamic_offsets: Vec<u32>,
}

struct BoundArguments {
    bind_point: vk::PipelineBindPoint,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    sets: Vec<BoundArgumentSet>,
}

impl BoundArgumentSet {
    /// Returns the owned binding alongside its slot index rather than a
    /// reference, since every caller immediately needs to mutate `self.data`
    /// too and the borrow checker won't let a `&self.bindings` borrow
    /// outlive that.
    fn slot_for(&self, name_hash: u64) -> Option<(usize, MergedBinding)> {
        let mut slot = 0usize;
        for binding in &self.bindings {
            if binding.name_hash == name_hash {
                return Some((slot, binding.clone()));
            }
            slot += binding.array_count.max(1) as usize;
        }
        None
    }

    fn dynamic_offset_position(&self, binding: &MergedBinding) -> Option<usize> {
        let mut position = 0usize;
        for b in &self.bindings {
            let is_dynamic = matches!(b.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC);
            if b.binding == binding.binding {
                return if is_dynamic { Some(position) } else { None };
            }
            if is_dynamic {
                position += 1;
            }
        }
        None
    }

    fn all_filled(&self) -> bool {
        self.data.iter().all(|d| d.filled)
    }
}

/// Per-pass scratch region size; the backend hands out one such region per
/// pass so passes could in principle record on independent worker threads.
pub const PER_PASS_SCRATCH_BYTES: u64 = 1 << 20;
const MAX_PASSES_PER_FRAME: usize = graph::MAX_RESOURCES;

pub enum OwnedResource {
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    Framebuffer(vk::Framebuffer),
    RenderPass(vk::RenderPass),
    /// A one-shot host-visible buffer backing a `WriteToImage` upload
    /// freed once the frame's fence crosses.
    Buffer(vk::Buffer, vk::DeviceMemory),
}

impl OwnedResource {
    unsafe fn destroy(&self, device: &ash::Device) {
        match self {
            OwnedResource::ImageView(v) => device.destroy_image_view(*v, None),
            OwnedResource::Sampler(s) => device.destroy_sampler(*s, None),
            OwnedResource::Framebuffer(f) => device.destroy_framebuffer(*f, None),
            OwnedResource::RenderPass(r) => device.destroy_render_pass(*r, None),
            OwnedResource::Buffer(b, m) => {
                device.destroy_buffer(*b, None);
                device.free_memory(*m, None);
            }
        }
    }
}

/// Per-frame state for one slot in the swapchain ring.
pub struct BackendFrameData {
    pub fence: vk::Fence,
    pub image_acquired: vk::Semaphore,
    pub render_complete: vk::Semaphore,
    pub command_pool: vk::CommandPool,
    pub descriptor_pools: Vec<vk::DescriptorPool>,
    pub available_resources: HashMap<ResourceHandle, FrameResource>,
    pub binned_resources: Vec<PhysicalResource>,
    pub owned_resources: Vec<OwnedResource>,
    pub staging: StagingAllocator,
    /// Linear-repeat sampler used for every combined-image-sampler argument
    /// bound by name: per-texture sampler state isn't modeled, so one shared
    /// default covers every `setArgumentTexture` call.
    pub default_sampler: vk::Sampler,

    scratch_buffer: vk::Buffer,
    scratch_memory: vk::DeviceMemory,
    scratch_mapped_base: *mut u8,
    pass_allocators: HashMap<u64, LinearAllocator>,
    renderpass_cache: HashMap<u64, (vk::RenderPass, vk::Framebuffer)>,
}

// The mapped scratch buffer is only ever touched from the thread driving
// this frame's lifecycle methods.
unsafe impl Send for BackendFrameData {}

impl BackendFrameData {
    pub fn new(device: &dyn VulkanDevice, pass_count_hint: usize) -> Result<BackendFrameData> {
        let raw = device.raw();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED).build();
        let fence = unsafe { raw.create_fence(&fence_info, None) }.map_err(|e| vk_error("create_fence", e))?;
        let semaphore_info = vk::SemaphoreCreateInfo::builder().build();
        let image_acquired = unsafe { raw.create_semaphore(&semaphore_info, None) }.map_err(|e| vk_error("create_semaphore", e))?;
        let render_complete = unsafe { raw.create_semaphore(&semaphore_info, None) }.map_err(|e| vk_error("create_semaphore", e))?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.queue_family_indices().graphics)
            .build();
        let command_pool = unsafe { raw.create_command_pool(&pool_info, None) }.map_err(|e| vk_error("create_command_pool", e))?;

        let descriptor_pool = create_descriptor_pool(device, pass_count_hint.max(1))?;

        let total_scratch = PER_PASS_SCRATCH_BYTES * MAX_PASSES_PER_FRAME as u64;
        let (scratch_buffer, scratch_memory, scratch_mapped_base) = create_mapped_host_visible_buffer(device, total_scratch)?;

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE)
            .build();
        let default_sampler = unsafe { raw.create_sampler(&sampler_info, None) }.map_err(|e| vk_error("create_sampler", e))?;

        Ok(BackendFrameData {
            fence,
            image_acquired,
            render_complete,
            command_pool,
            descriptor_pools: vec![descriptor_pool],
            available_resources: HashMap::new(),
            binned_resources: Vec::new(),
            owned_resources: Vec::new(),
            staging: StagingAllocator::new(),
            default_sampler,
            scratch_buffer,
            scratch_memory,
            scratch_mapped_base,
            pass_allocators: HashMap::new(),
            renderpass_cache: HashMap::new(),
        })
    }

    /// Step 1: wait this slot's fence, reset it, drop everything that was
    /// only alive for the previous frame occupying this slot.
    pub fn acquire(&mut self, device: &dyn VulkanDevice) -> Result<()> {
        let raw = device.raw();
        unsafe {
            raw.wait_for_fences(&[self.fence], true, u64::MAX).map_err(|e| vk_error("wait_for_fences", e))?;
            raw.reset_fences(&[self.fence]).map_err(|e| vk_error("reset_fences", e))?;
            raw.reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
                .map_err(|e| vk_error("reset_command_pool", e))?;
            for pool in &self.descriptor_pools {
                raw.reset_descriptor_pool(*pool, vk::DescriptorPoolResetFlags::empty())
                    .map_err(|e| vk_error("reset_descriptor_pool", e))?;
            }
            for owned in self.owned_resources.drain(..) {
                owned.destroy(raw);
            }
            for binned in self.binned_resources.drain(..) {
                binned.destroy(raw);
            }
        }
        self.available_resources.clear();
        self.pass_allocators.clear();
        self.renderpass_cache.clear();
        self.staging.reset();
        Ok(())
    }

    fn pass_allocator(&mut self, pass_id: u64, pass_slot: usize) -> &mut LinearAllocator {
        self.pass_allocators.entry(pass_id).or_insert_with(|| {
            let offset = pass_slot as u64 * PER_PASS_SCRATCH_BYTES;
            let base = unsafe { self.scratch_mapped_base.add(offset as usize) };
            LinearAllocator::new(PER_PASS_SCRATCH_BYTES, Some(base))
        })
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_sampler(self.default_sampler, None);
        device.destroy_buffer(self.scratch_buffer, None);
        device.free_memory(self.scratch_memory, None);
        for pool in &self.descriptor_pools {
            device.destroy_descriptor_pool(*pool, None);
        }
        device.destroy_command_pool(self.command_pool, None);
        device.destroy_semaphore(self.image_acquired, None);
        device.destroy_semaphore(self.render_complete, None);
        device.destroy_fence(self.fence, None);
    }
}

fn create_descriptor_pool(device: &dyn VulkanDevice, pass_count: usize) -> Result<vk::DescriptorPool> {
    let raw = device.raw();
    let per_type = (pass_count as u32).max(1) * 16;
    let sizes = [
        vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: per_type },
        vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, descriptor_count: per_type },
        vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER, descriptor_count: per_type },
        vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, descriptor_count: per_type },
        vk::DescriptorPoolSize { ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count: per_type },
        vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_IMAGE, descriptor_count: per_type },
    ];
    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets((pass_count as u32).max(1) * 8)
        .pool_sizes(&sizes)
        .build();
    unsafe { raw.create_descriptor_pool(&pool_info, None) }.map_err(|e| vk_error("create_descriptor_pool", e))
}

fn create_mapped_host_visible_buffer(device: &dyn VulkanDevice, size: u64) -> Result<(vk::Buffer, vk::DeviceMemory, *mut u8)> {
    let raw = device.raw();
    let create_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .build();
    let buffer = unsafe { raw.create_buffer(&create_info, None) }.map_err(|e| vk_error("create_buffer", e))?;
    let requirements = unsafe { raw.get_buffer_memory_requirements(buffer) };
    let memory_properties = device.physical_device_memory_properties();
    let memory_type = find_memory_type_index(&memory_properties, requirements.memory_type_bits, vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT)
        .ok_or_else(|| vk_error("find_memory_type_index", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))?;
    let alloc_info = vk::MemoryAllocateInfo::builder().allocation_size(requirements.size).memory_type_index(memory_type).build();
    let memory = unsafe { raw.allocate_memory(&alloc_info, None) }.map_err(|e| vk_error("allocate_memory", e))?;
    unsafe { raw.bind_buffer_memory(buffer, memory, 0) }.map_err(|e| vk_error("bind_buffer_memory", e))?;
    let mapped = unsafe { raw.map_memory(memory, 0, size, vk::MemoryMapFlags::empty()) }.map_err(|e| vk_error("map_memory", e))? as *mut u8;
    Ok((buffer, memory, mapped))
}

fn vk_error(call: &str, result: vk::Result) -> GraphError {
    GraphError::SwapchainAcquireFailed { message: format!("{} failed: {:?}", call, result) }
}

/// The result of step 2 ("Plan"): a resolved graph plus the sync chains
/// computed for its surviving passes, ready for renderpass construction
/// and recording.
pub struct PlannedFrame {
    pub graph: ResolvedGraph,
    pub sync: SyncPlan,
}

/// Step 2: import the module's passes, run setup callbacks, resolve the
/// graph, and plan synchronization.
pub fn plan_frame(module: &RenderModule, swapchain_extent: (u32, u32), persisted_states: &HashMap<ResourceHandle, ResourceState>) -> Result<PlannedFrame> {
    let (mut passes, _declared_resources) = module.clone_for_frame();

    passes.retain(|pass| {
        let setup = pass.data().setup_callback.clone();
        match setup {
            Some(callback) => {
                let mut data = pass.data_mut();
                callback(&mut data)
            }
            None => true,
        }
    });

    let resolved = graph::resolve_and_patch(passes, swapchain_extent)?;
    let sync = plan_sync(&resolved.passes, persisted_states);
    Ok(PlannedFrame { graph: resolved, sync })
}

/// Step 5: mints an encoder for each surviving pass and runs its execute
/// callbacks, pre-setting a default viewport/scissor covering the pass
/// extent first.
pub fn record_pass(frame: &mut BackendFrameData, pipelines: &PipelineManager, pass: &crate::pass::RenderPass, pass_slot: usize) -> Vec<u8> {
    let pass_id = pass.data().id;
    let extent = {
        let data = pass.data();
        (data.width, data.height)
    };
    let allocator = frame.pass_allocator(pass_id, pass_slot) as *mut LinearAllocator;
    // SAFETY: `allocator` and `frame.staging` are disjoint fields; the raw
    // pointer exists only to let the encoder borrow one field of `frame`
    // mutably while the execute callbacks (borrowed from `pass`, not
    // `frame`) run without an aliasing conflict on `frame` itself.
    let allocator_ref = unsafe { &mut *allocator };
    let mut encoder = CommandEncoder::new_with_pipeline_manager(allocator_ref, &frame.staging, extent, pipelines);
    encoder.set_viewport(&[crate::command::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.0 as f32,
        height: extent.1 as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }]);
    encoder.set_scissor(&[crate::command::ScissorRect { x: 0, y: 0, width: extent.0, height: extent.1 }]);

    let callbacks = pass.data().execute_callbacks.clone();
    for callback in &callbacks {
        callback(&mut encoder);
    }
    if encoder.dropped_commands() > 0 {
        warn!("pass '{}' dropped {} commands due to scratch overflow", pass.data().name, encoder.dropped_commands());
    }
    encoder.finish()
}

/// Builds (or reuses, within this frame) the Vulkan renderpass and
/// framebuffer for a graphics pass: attachment descriptions carry
/// load/store ops and layouts from the sync chain, one subpass, and a pair
/// of external↔subpass dependencies.
pub fn build_renderpass(
    device: &dyn VulkanDevice,
    frame: &mut BackendFrameData,
    pass: &crate::pass::RenderPass,
    sync: &SyncPlan,
    image_views: &HashMap<ResourceHandle, vk::ImageView>,
    attachment_formats: &HashMap<ResourceHandle, vk::Format>,
) -> Result<(vk::RenderPass, vk::Framebuffer, RenderpassCompatibilityHash)> {
    let data = pass.data();
    let raw = device.raw();

    let mut attachment_descs = Vec::with_capacity(data.attachments.len());
    let mut attachment_compat = Vec::with_capacity(data.attachments.len());
    let mut color_refs = Vec::new();
    let mut depth_ref = None;
    let mut views = Vec::with_capacity(data.attachments.len());

    for (index, attachment) in data.attachments.iter().enumerate() {
        let chain = sync.chain_for(attachment.handle).unwrap_or(&[]);
        // The subpass-entry state is always the third-from-last entry this
        // pass pushed (entry, subpass, dummy); fall back to a sensible
        // default if the chain is shorter than expected.
        let initial_layout = chain.iter().rev().nth(2).map(|s| s.image_layout).unwrap_or(vk::ImageLayout::UNDEFINED);
        let final_layout = if attachment.handle.is_root() { vk::ImageLayout::PRESENT_SRC_KHR } else { vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL };
        let format = attachment_formats.get(&attachment.handle).copied().unwrap_or(vk::Format::R8G8B8A8_UNORM);

        attachment_compat.push(AttachmentCompatibility { format_raw: format.as_raw(), sample_count: data.sample_count.as_raw() });
        attachment_descs.push(
            vk::AttachmentDescription::builder()
                .format(format)
                .samples(data.sample_count)
                .load_op(attachment.load_op)
                .store_op(attachment.store_op)
                .initial_layout(initial_layout)
                .final_layout(final_layout)
                .build(),
        );
        if attachment.is_depth_stencil {
            depth_ref = Some(vk::AttachmentReference { attachment: index as u32, layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL });
        } else {
            color_refs.push(vk::AttachmentReference { attachment: index as u32, layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL });
        }
        if let Some(&view) = image_views.get(&attachment.handle) {
            views.push(view);
        }
    }

    let mut subpass_builder = vk::SubpassDescription::builder().pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS).color_attachments(&color_refs);
    if let Some(ref depth) = depth_ref {
        subpass_builder = subpass_builder.depth_stencil_attachment(depth);
    }
    let subpass = subpass_builder.build();

    let dependencies = [
        vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .build(),
        vk::SubpassDependency::builder()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .build(),
    ];
    let subpasses = [subpass];
    let renderpass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachment_descs)
        .subpasses(&subpasses)
        .dependencies(&dependencies)
        .build();
    let renderpass = unsafe { raw.create_render_pass(&renderpass_info, None) }.map_err(|e| vk_error("create_render_pass", e))?;

    let framebuffer_info = vk::FramebufferCreateInfo::builder()
        .render_pass(renderpass)
        .attachments(&views)
        .width(data.width.max(1))
        .height(data.height.max(1))
        .layers(1)
        .build();
    let framebuffer = unsafe { raw.create_framebuffer(&framebuffer_info, None) }.map_err(|e| {
        let _ = unsafe { raw.destroy_render_pass(renderpass, None) };
        vk_error("create_framebuffer", e)
    })?;

    frame.owned_resources.push(OwnedResource::RenderPass(renderpass));
    frame.owned_resources.push(OwnedResource::Framebuffer(framebuffer));

    let subpass_compat = vec![SubpassCompatibility {
        color_attachment_refs: color_refs.iter().map(|r| r.attachment).collect(),
        depth_attachment_ref: depth_ref.map(|r| r.attachment),
    }];
    let compat_hash = crate::pipeline::pso::renderpass_compatibility_hash(&attachment_compat, &subpass_compat);

    Ok((renderpass, framebuffer, compat_hash))
}

/// Resolves a handle recorded in a pass's command stream to the real
/// `vk::Buffer` backing it this frame: virtual handles always resolve to
/// this frame's scratch buffer (that's what the encoder staged bytes into),
/// everything else goes through the bind step's `available_resources` map.
fn resolve_buffer(frame: &BackendFrameData, handle: ResourceHandle) -> Option<vk::Buffer> {
    if handle.is_virtual() {
        return Some(frame.scratch_buffer);
    }
    match frame.available_resources.get(&handle) {
        Some(FrameResource::Buffer(b)) => Some(*b),
        _ => None,
    }
}

fn resolve_image_view(frame: &BackendFrameData, handle: ResourceHandle) -> Option<vk::ImageView> {
    match frame.available_resources.get(&handle) {
        Some(FrameResource::Image { view, .. }) => Some(*view),
        _ => None,
    }
}

fn resolve_image(frame: &BackendFrameData, handle: ResourceHandle) -> Option<vk::Image> {
    match frame.available_resources.get(&handle) {
        Some(FrameResource::Image { image, .. }) => Some(*image),
        _ => None,
    }
}

/// Merges a PSO's stage modules' declared bindings into a pipeline layout
/// and materializes it, returning the layout's hash (for the materialization
/// key) alongside the real `vk::PipelineLayout`.
fn produce_and_materialize_layout(device: &ash::Device, pipelines: &PipelineManager, stage_module_hashes: &[u64]) -> Result<(u64, vk::PipelineLayout)> {
    let mut stage_binding_lists = Vec::new();
    for &hash in stage_module_hashes {
        if let Some(bindings) = pipelines.shaders.with_module(hash, |m| m.bindings.clone()) {
            stage_binding_lists.push(bindings);
        }
    }
    let stage_binding_refs: Vec<&[StageBinding]> = stage_binding_lists.iter().map(|v| v.as_slice()).collect();
    let merged = DescriptorLayoutCache::merge_stage_bindings(&stage_binding_refs)?;
    let entry = pipelines.descriptors.produce_pipeline_layout(merged)?;
    let layout = pipelines.descriptors.materialize_pipeline_layout(device, entry.hash)?;
    Ok((entry.hash, layout))
}

/// Builds a fresh [`BoundArguments`], preallocating one [`DescriptorData`]
/// slot per array element of every binding in each of the pipeline
/// layout's descriptor sets, since binding a new pipeline resets argument
/// state.
fn bind_arguments_for(
    pipelines: &PipelineManager,
    bind_point: vk::PipelineBindPoint,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    pipeline_layout_hash: u64,
) -> BoundArguments {
    let set_layout_hashes = pipelines.descriptors.set_layout_hashes_of(pipeline_layout_hash).unwrap_or_default();
    let mut sets = Vec::with_capacity(set_layout_hashes.len());
    for set_hash in set_layout_hashes {
        let bindings = pipelines.descriptors.set_layout_bindings(set_hash).unwrap_or_default();
        let slot_count: usize = bindings.iter().map(|b| b.array_count.max(1) as usize).sum();
        let dynamic_count = bindings
            .iter()
            .filter(|b| matches!(b.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC))
            .count();
        sets.push(BoundArgumentSet {
            set_layout_hash: set_hash,
            bindings,
            data: vec![DescriptorData::default(); slot_count],
            dynamic_offsets: vec![0; dynamic_count],
        });
    }
    BoundArguments { bind_point, pipeline, pipeline_layout, sets }
}

/// Fills the argument slot matching `name_hash` across every bound set with
/// a buffer descriptor; `setArgumentData`/`bindArgumentBuffer` share this
/// fill path since the encoder stages both the same way. Tracks
/// the slot's dynamic offset, if its binding is one of the `_DYNAMIC` types.
fn fill_argument_buffer(bound: &mut BoundArguments, name_hash: u64, buffer: vk::Buffer, offset: u64, range: u64) {
    for set in &mut bound.sets {
        if let Some((slot, binding)) = set.slot_for(name_hash) {
            let mut data = set.data[slot];
            data.buffer = vk::DescriptorBufferInfo { buffer, offset, range };
            data.descriptor_type = binding.descriptor_type;
            data.binding = binding.binding;
            data.array_index = 0;
            data.filled = true;
            set.data[slot] = data;
            if let Some(position) = set.dynamic_offset_position(&binding) {
                if let Some(slot_offset) = set.dynamic_offsets.get_mut(position) {
                    *slot_offset = offset as u32;
                }
            }
            return;
        }
    }
    warn!("argument '{:#x}' does not match any binding in the bound pipeline's layout", name_hash);
}

/// Fills the argument slot matching `name_hash` with an image descriptor
/// filled by `setArgumentTexture`/`setArgumentImage`.
fn fill_argument_image(bound: &mut BoundArguments, name_hash: u64, view: vk::ImageView, sampler: vk::Sampler, layout: vk::ImageLayout) {
    for set in &mut bound.sets {
        if let Some((slot, binding)) = set.slot_for(name_hash) {
            let mut data = set.data[slot];
            data.image = vk::DescriptorImageInfo { sampler, image_view: view, image_layout: layout };
            data.descriptor_type = binding.descriptor_type;
            data.binding = binding.binding;
            data.array_index = 0;
            data.filled = true;
            set.data[slot] = data;
            return;
        }
    }
    warn!("argument '{:#x}' does not match any binding in the bound pipeline's layout", name_hash);
}

/// Before a draw/dispatch, allocates one `vk::DescriptorSet` per non-empty
/// set from this frame's pool, pushes the set's flat `DescriptorData` slots
/// through its update template, and binds every set: before issuing a
/// draw/dispatch/trace-rays/mesh-tasks call, every slot must be filled or
/// the command is skipped and logged. Returns `false` (and
/// leaves nothing bound) when no pipeline is bound or any slot is unfilled.
fn update_and_bind_arguments(raw: &ash::Device, pipelines: &PipelineManager, frame: &BackendFrameData, bound: &mut Option<BoundArguments>, command_buffer: vk::CommandBuffer) -> bool {
    let bound = match bound {
        Some(b) => b,
        None => {
            warn!("draw attempted with no pipeline bound, skipping");
            return false;
        }
    };
    if !bound.sets.iter().all(|set| set.bindings.is_empty() || set.all_filled()) {
        warn!("draw skipped: a descriptor set has unfilled argument bindings");
        return false;
    }
    for (set_index, set) in bound.sets.iter().enumerate() {
        if set.bindings.is_empty() {
            continue;
        }
        let layout = match pipelines.descriptors.set_layout_vk(set.set_layout_hash) {
            Some(l) => l,
            None => {
                warn!("draw skipped: descriptor set layout not materialized");
                return false;
            }
        };
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder().descriptor_pool(frame.descriptor_pools[0]).set_layouts(&layouts).build();
        let vk_set = match unsafe { raw.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                warn!("draw skipped: descriptor set allocation failed: {:?}", e);
                return false;
            }
        };
        if let Some(template) = pipelines.descriptors.update_template_vk(set.set_layout_hash) {
            unsafe { raw.update_descriptor_set_with_template(vk_set, template, set.data.as_ptr() as *const c_void) };
        }
        unsafe {
            raw.cmd_bind_descriptor_sets(command_buffer, bound.bind_point, bound.pipeline_layout, set_index as u32, &[vk_set], &set.dynamic_offsets);
        }
    }
    true
}

/// Step 6: walks a pass's decoded command stream and issues the
/// corresponding Vulkan calls. Resource-handle resolution through
/// `available_resources` is the caller's job; commands referring to a
/// handle this frame never bound are logged and skipped, degrading in
/// place rather than aborting the frame.
#[allow(clippy::too_many_arguments)]
pub fn translate_commands(
    device: &dyn VulkanDevice,
    frame: &mut BackendFrameData,
    pipelines: &PipelineManager,
    command_buffer: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    subpass: u32,
    renderpass_compat_hash: RenderpassCompatibilityHash,
    bytes: &[u8],
) {
    let raw = device.raw();
    let mut bound: Option<BoundArguments> = None;
    for command in CommandDecoder::new(bytes) {
        match command {
            RecordedCommand::SetViewport { viewports } => {
                let vp: Vec<vk::Viewport> = viewports
                    .iter()
                    .map(|v| vk::Viewport { x: v.x, y: v.y, width: v.width, height: v.height, min_depth: v.min_depth, max_depth: v.max_depth })
                    .collect();
                unsafe { raw.cmd_set_viewport(command_buffer, 0, &vp) };
            }
            RecordedCommand::SetScissor { scissors } => {
                let sc: Vec<vk::Rect2D> = scissors
                    .iter()
                    .map(|s| vk::Rect2D { offset: vk::Offset2D { x: s.x, y: s.y }, extent: vk::Extent2D { width: s.width, height: s.height } })
                    .collect();
                unsafe { raw.cmd_set_scissor(command_buffer, 0, &sc) };
            }
            RecordedCommand::SetLineWidth { width } => unsafe { raw.cmd_set_line_width(command_buffer, width) },
            RecordedCommand::Draw { vertex_count, instance_count, first_vertex, first_instance } => {
                if update_and_bind_arguments(raw, pipelines, frame, &mut bound, command_buffer) {
                    unsafe { raw.cmd_draw(command_buffer, vertex_count, instance_count, first_vertex, first_instance) };
                }
            }
            RecordedCommand::DrawIndexed { index_count, instance_count, first_index, vertex_offset, first_instance } => {
                if update_and_bind_arguments(raw, pipelines, frame, &mut bound, command_buffer) {
                    unsafe { raw.cmd_draw_indexed(command_buffer, index_count, instance_count, first_index, vertex_offset, first_instance) };
                }
            }
            RecordedCommand::Dispatch { group_count_x, group_count_y, group_count_z } => {
                if update_and_bind_arguments(raw, pipelines, frame, &mut bound, command_buffer) {
                    unsafe { raw.cmd_dispatch(command_buffer, group_count_x, group_count_y, group_count_z) };
                }
            }
            RecordedCommand::BindIndexBuffer { buffer, offset, index_type } => {
                if let Some(vk_buffer) = resolve_buffer(frame, buffer) {
                    let ty = if index_type == crate::command::IndexType::U32 { vk::IndexType::UINT32 } else { vk::IndexType::UINT16 };
                    unsafe { raw.cmd_bind_index_buffer(command_buffer, vk_buffer, offset, ty) };
                } else {
                    warn!("BindIndexBuffer: handle not bound this frame, skipping");
                }
            }
            RecordedCommand::BindVertexBuffers { buffers } => {
                let mut vk_buffers = Vec::with_capacity(buffers.len());
                let mut offsets = Vec::with_capacity(buffers.len());
                let mut all_present = true;
                for (handle, offset) in &buffers {
                    match resolve_buffer(frame, *handle) {
                        Some(vk_buffer) => {
                            vk_buffers.push(vk_buffer);
                            offsets.push(*offset);
                        }
                        None => {
                            all_present = false;
                            break;
                        }
                    }
                }
                if all_present {
                    unsafe { raw.cmd_bind_vertex_buffers(command_buffer, 0, &vk_buffers, &offsets) };
                } else {
                    warn!("BindVertexBuffers: handle not bound this frame, skipping");
                }
            }
            RecordedCommand::BufferMemoryBarrier { buffer, offset, range, src_stage, dst_stage, src_access, dst_access } => match resolve_buffer(frame, buffer) {
                Some(vk_buffer) => {
                    let barrier = vk::BufferMemoryBarrier::builder()
                        .src_access_mask(vk::AccessFlags::from_raw(src_access))
                        .dst_access_mask(vk::AccessFlags::from_raw(dst_access))
                        .buffer(vk_buffer)
                        .offset(offset)
                        .size(if range == 0 { vk::WHOLE_SIZE } else { range })
                        .build();
                    unsafe {
                        raw.cmd_pipeline_barrier(
                            command_buffer,
                            vk::PipelineStageFlags::from_raw(src_stage),
                            vk::PipelineStageFlags::from_raw(dst_stage),
                            vk::DependencyFlags::empty(),
                            &[],
                            &[barrier],
                            &[],
                        )
                    };
                }
                None => warn!("BufferMemoryBarrier: handle not bound this frame, skipping"),
            },
            RecordedCommand::WriteToBuffer { src, src_offset, dst, dst_offset, bytes } => {
                match (resolve_buffer(frame, src), resolve_buffer(frame, dst)) {
                    (Some(src_buffer), Some(dst_buffer)) => {
                        let region = vk::BufferCopy { src_offset, dst_offset, size: bytes.len() as u64 };
                        unsafe { raw.cmd_copy_buffer(command_buffer, src_buffer, dst_buffer, &[region]) };
                    }
                    _ => warn!("WriteToBuffer: source or destination handle not bound this frame, skipping"),
                }
            }
            RecordedCommand::BindGraphicsPipeline { pso } => match pipelines.psos.lookup(pso) {
                Some(PsoDesc::Graphics(desc)) => match produce_and_materialize_layout(raw, pipelines, &desc.stage_module_hashes) {
                    Ok((layout_hash, pipeline_layout)) => {
                        let key = materialization_key(pso, renderpass_compat_hash, &desc.stage_module_hashes, layout_hash);
                        match pipelines.psos.materialize_graphics_pipeline(raw, &pipelines.shaders, &desc, pipeline_layout, render_pass, subpass, key) {
                            Ok(pipeline) => {
                                unsafe { raw.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline) };
                                bound = Some(bind_arguments_for(pipelines, vk::PipelineBindPoint::GRAPHICS, pipeline, pipeline_layout, layout_hash));
                            }
                            Err(e) => warn!("BindGraphicsPipeline: pipeline materialization failed: {:?}", e),
                        }
                    }
                    Err(e) => warn!("BindGraphicsPipeline: pipeline-layout materialization failed: {:?}", e),
                },
                _ => warn!("BindGraphicsPipeline: unknown or mismatched PSO hash {:#x}, skipping", pso),
            },
            RecordedCommand::BindComputePipeline { pso } => match pipelines.psos.lookup(pso) {
                Some(PsoDesc::Compute(desc)) => match produce_and_materialize_layout(raw, pipelines, &[desc.module_hash]) {
                    Ok((layout_hash, pipeline_layout)) => {
                        let key = materialization_key(pso, 0, &[desc.module_hash], layout_hash);
                        match pipelines.psos.materialize_compute_pipeline(raw, &pipelines.shaders, &desc, pipeline_layout, key) {
                            Ok(pipeline) => {
                                unsafe { raw.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, pipeline) };
                                bound = Some(bind_arguments_for(pipelines, vk::PipelineBindPoint::COMPUTE, pipeline, pipeline_layout, layout_hash));
                            }
                            Err(e) => warn!("BindComputePipeline: pipeline materialization failed: {:?}", e),
                        }
                    }
                    Err(e) => warn!("BindComputePipeline: pipeline-layout materialization failed: {:?}", e),
                },
                _ => warn!("BindComputePipeline: unknown or mismatched PSO hash {:#x}, skipping", pso),
            },
            RecordedCommand::BindRtxPipeline { .. } => {
                warn!("BindRtxPipeline: ray tracing pipelines require the host's VK_KHR_ray_tracing_pipeline loader, skipping");
            }
            RecordedCommand::SetArgumentData { name_hash, buffer, offset, range } | RecordedCommand::BindArgumentBuffer { name_hash, buffer, offset, range } => {
                match (&mut bound, resolve_buffer(frame, buffer)) {
                    (Some(b), Some(vk_buffer)) => fill_argument_buffer(b, name_hash, vk_buffer, offset, range),
                    _ => warn!("argument buffer bind skipped: no pipeline bound or handle not bound this frame"),
                }
            }
            RecordedCommand::SetArgumentTexture { name_hash, texture, array_index: _ } => match (&mut bound, resolve_image_view(frame, texture)) {
                (Some(b), Some(view)) => fill_argument_image(b, name_hash, view, frame.default_sampler, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                _ => warn!("SetArgumentTexture: no pipeline bound or handle not bound this frame, skipping"),
            },
            RecordedCommand::SetArgumentImage { name_hash, image, array_index: _ } => match (&mut bound, resolve_image_view(frame, image)) {
                (Some(b), Some(view)) => fill_argument_image(b, name_hash, view, vk::Sampler::null(), vk::ImageLayout::GENERAL),
                _ => warn!("SetArgumentImage: no pipeline bound or handle not bound this frame, skipping"),
            },
            RecordedCommand::SetArgumentTlas { .. } => {
                warn!("SetArgumentTlas: acceleration-structure descriptor writes require the host's VK_KHR_acceleration_structure loader, skipping");
            }
            RecordedCommand::TraceRays { .. } => {
                warn!("TraceRays: ray tracing requires the host's VK_KHR_ray_tracing_pipeline loader, skipping");
            }
            RecordedCommand::DrawMeshTasks { task_count, first_task } => {
                if update_and_bind_arguments(raw, pipelines, frame, &mut bound, command_buffer) {
                    warn!(
                        "DrawMeshTasks({}, {}): mesh shading requires the host's VK_EXT_mesh_shader loader, skipping",
                        task_count, first_task
                    );
                }
            }
            RecordedCommand::WriteToImage { staging: _, dst, settings: upload, bytes } => match resolve_image(frame, dst) {
                Some(image) => translate_write_to_image(device, frame, command_buffer, image, &upload, &bytes),
                None => warn!("WriteToImage: destination handle not bound this frame, skipping"),
            },
            RecordedCommand::SetPushConstantData { bytes } => match &bound {
                Some(b) => {
                    let mut payload = bytes;
                    payload.truncate(crate::pipeline::descriptor::MAX_PUSH_CONSTANT_BYTES as usize);
                    unsafe { raw.cmd_push_constants(command_buffer, b.pipeline_layout, vk::ShaderStageFlags::ALL, 0, &payload) };
                }
                None => warn!("SetPushConstantData: no pipeline bound, skipping"),
            },
            RecordedCommand::BuildRtxBlas { .. } => {
                warn!("BuildRtxBlas: acceleration structure builds require the host's VK_KHR_acceleration_structure loader, skipping");
            }
            RecordedCommand::BuildRtxTlas { .. } => {
                warn!("BuildRtxTlas: acceleration structure builds require the host's VK_KHR_acceleration_structure loader, skipping");
            }
        }
    }
    if settings().print_extended_debug_messages() {
        debug!("translated {} bytes of command stream", bytes.len());
    }
}

/// Uploads `bytes` into `image`'s base mip level and generates the rest of
/// its mip chain via a blit cascade: host write into a one-shot staging
/// buffer, `vkCmdCopyBufferToImage` into
/// level 0, then an iterative transferDst→transferSrc→blit→shaderReadOnly
/// walk up the chain. The staging buffer outlives this call (submission
/// hasn't happened yet); it's registered as an [`OwnedResource::Buffer`] so
/// the next `acquire()` for this frame slot frees it once its fence crosses.
fn translate_write_to_image(device: &dyn VulkanDevice, frame: &mut BackendFrameData, command_buffer: vk::CommandBuffer, image: vk::Image, settings: &crate::command::WriteImageSettings, bytes: &[u8]) {
    let raw = device.raw();
    let (staging_buffer, staging_memory, mapped) = match create_mapped_host_visible_buffer(device, bytes.len().max(1) as u64) {
        Ok(b) => b,
        Err(e) => {
            warn!("WriteToImage: staging buffer allocation failed: {:?}", e);
            return;
        }
    };
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped, bytes.len());
        raw.unmap_memory(staging_memory);
    }
    frame.owned_resources.push(OwnedResource::Buffer(staging_buffer, staging_memory));

    let mip_levels = settings.num_miplevels.max(1);
    let whole_range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: mip_levels,
        base_array_layer: settings.array_layer,
        layer_count: 1,
    };
    let host_write_to_transfer_read = vk::BufferMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::HOST_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
        .buffer(staging_buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .build();
    let to_transfer_dst = vk::ImageMemoryBarrier::builder()
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .image(image)
        .subresource_range(whole_range)
        .build();
    unsafe {
        raw.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::HOST,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[host_write_to_transfer_read],
            &[to_transfer_dst],
        );
    }

    let copy_region = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: settings.array_layer,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D { width: settings.width.max(1), height: settings.height.max(1), depth: 1 },
    };
    unsafe { raw.cmd_copy_buffer_to_image(command_buffer, staging_buffer, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[copy_region]) };

    let mut mip_width = settings.width.max(1) as i32;
    let mut mip_height = settings.height.max(1) as i32;
    for level in 1..mip_levels {
        let src_level = level - 1;
        let to_transfer_src = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange { base_mip_level: src_level, level_count: 1, ..whole_range })
            .build();
        unsafe {
            raw.cmd_pipeline_barrier(command_buffer, vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::TRANSFER, vk::DependencyFlags::empty(), &[], &[], &[to_transfer_src]);
        }

        let next_width = (mip_width / 2).max(1);
        let next_height = (mip_height / 2).max(1);
        let blit = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers { aspect_mask: vk::ImageAspectFlags::COLOR, mip_level: src_level, base_array_layer: settings.array_layer, layer_count: 1 },
            src_offsets: [vk::Offset3D::default(), vk::Offset3D { x: mip_width, y: mip_height, z: 1 }],
            dst_subresource: vk::ImageSubresourceLayers { aspect_mask: vk::ImageAspectFlags::COLOR, mip_level: level, base_array_layer: settings.array_layer, layer_count: 1 },
            dst_offsets: [vk::Offset3D::default(), vk::Offset3D { x: next_width, y: next_height, z: 1 }],
        };
        unsafe {
            raw.cmd_blit_image(command_buffer, image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[blit], vk::Filter::LINEAR);
        }

        let src_done = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_access_mask(vk::AccessFlags::TRANSFER_READ)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange { base_mip_level: src_level, level_count: 1, ..whole_range })
            .build();
        unsafe {
            raw.cmd_pipeline_barrier(command_buffer, vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::FRAGMENT_SHADER, vk::DependencyFlags::empty(), &[], &[], &[src_done]);
        }

        mip_width = next_width;
        mip_height = next_height;
    }

    let last_level = mip_levels - 1;
    let last_done = vk::ImageMemoryBarrier::builder()
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange { base_mip_level: last_level, level_count: 1, ..whole_range })
        .build();
    unsafe {
        raw.cmd_pipeline_barrier(command_buffer, vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::FRAGMENT_SHADER, vk::DependencyFlags::empty(), &[], &[], &[last_done]);
    }
}
