//! Vulkan backend: per-frame orchestration over a swapchain and the
//! external device seam (`crate::device`).

pub mod frame;
pub mod swapchain;

use std::collections::HashMap;
use std::sync::Mutex;

use ash::vk;
use log::warn;

use crate::device::{find_memory_type_index, VulkanDevice};
use crate::error::{GraphError, Result};
use crate::handle::ResourceHandle;
use crate::module::RenderModule;
use crate::pass::QueueKind;
use crate::pipeline::PipelineManager;
use crate::resource::ResourceInfo;
use crate::sync::ResourceState;

pub use frame::{BackendFrameData, FrameResource};
pub use swapchain::Swapchain;

/// A physically-backed resource: the Vulkan object(s) plus the declared
/// info they were created from, so a later frame's "is this a superset"
/// check has something to compare against.
pub enum PhysicalResource {
    Buffer {
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        info: crate::resource::BufferInfo,
    },
    Image {
        image: vk::Image,
        memory: vk::DeviceMemory,
        view: vk::ImageView,
        info: crate::resource::ImageInfo,
    },
}

impl PhysicalResource {
    fn satisfies(&self, required: &ResourceInfo) -> bool {
        match (self, required) {
            (PhysicalResource::Buffer { info, .. }, ResourceInfo::Buffer(req)) => info.size >= req.size && info.usage.contains(req.usage),
            (PhysicalResource::Image { info, .. }, ResourceInfo::Image(req)) => {
                info.width >= req.width && info.height >= req.height && info.format == req.format && info.usage.contains(req.usage)
            }
            _ => false,
        }
    }

    /// Destroys the Vulkan objects backing this resource. Called once a
    /// resource moves into `binned_resources` and its owning frame's fence
    /// has since crossed.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        match self {
            PhysicalResource::Buffer { buffer, memory, .. } => {
                device.destroy_buffer(*buffer, None);
                device.free_memory(*memory, None);
            }
            PhysicalResource::Image { image, memory, view, .. } => {
                device.destroy_image_view(*view, None);
                device.destroy_image(*image, None);
                device.free_memory(*memory, None);
            }
        }
    }
}

/// Owns the ring of per-frame state plus the caches that persist across
/// frames: the backend-wide physical-resource cache and the pipeline
/// manager.
pub struct Backend {
    frames: Vec<BackendFrameData>,
    current_frame: usize,
    physical_cache: Mutex<HashMap<ResourceHandle, PhysicalResource>>,
    /// Each resource's final state as of the last frame that touched it,
    /// carried forward from the backend's previous frame, read by
    /// `sync::plan_sync` on the next call to [`Backend::update`].
    persisted_states: Mutex<HashMap<ResourceHandle, ResourceState>>,
    pub pipelines: PipelineManager,
    pub swapchain: Swapchain,
    queue: vk::Queue,
}

impl Backend {
    pub fn new(device: &dyn VulkanDevice, swapchain: Swapchain, pass_count_hint: usize) -> Result<Backend> {
        let image_count = swapchain.image_count();
        let mut frames = Vec::with_capacity(image_count);
        for _ in 0..image_count {
            frames.push(BackendFrameData::new(device, pass_count_hint)?);
        }
        Ok(Backend {
            frames,
            current_frame: 0,
            physical_cache: Mutex::new(HashMap::new()),
            persisted_states: Mutex::new(HashMap::new()),
            pipelines: PipelineManager::new(),
            swapchain,
            queue: device.graphics_queue(),
        })
    }

    pub fn current_frame_mut(&mut self) -> &mut BackendFrameData {
        &mut self.frames[self.current_frame]
    }

    pub fn advance_frame(&mut self) {
        self.current_frame = (self.current_frame + 1) % self.frames.len();
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Drives one full pass through the frame lifecycle for `module`:
    /// acquire this frame's ring slot, resolve the rendergraph and its
    /// synchronization plan, bind the swapchain image and every other
    /// resource the surviving passes touch, build renderpasses, record each
    /// pass's command stream, decode and submit grouped by subgraph, and
    /// present if anything targeted the swapchain. A failed swapchain
    /// acquire skips the frame entirely rather than propagating an error.
    pub fn update(&mut self, device: &dyn VulkanDevice, module: &RenderModule) -> Result<()> {
        let raw = device.raw();

        self.frames[self.current_frame].acquire(device)?;

        let persisted = self.persisted_states.lock().expect("persisted-state cache poisoned").clone();
        let swapchain_extent = self.swapchain.extent();
        let frame::PlannedFrame { graph, sync } = frame::plan_frame(module, swapchain_extent, &persisted)?;

        if graph.passes.is_empty() {
            self.advance_frame();
            return Ok(());
        }

        let image_acquired = self.frames[self.current_frame].image_acquired;
        let image_index = match self.swapchain.acquire_next_image(image_acquired) {
            Ok(index) => index,
            Err(e) => {
                warn!("swapchain acquire failed, skipping frame: {:?}", e);
                self.advance_frame();
                return Ok(());
            }
        };
        let swapchain_image = self.swapchain.image_at(image_index);
        let (swapchain_vk_image, swapchain_view) = (swapchain_image.image, swapchain_image.view);

        let declared = module.declared_resources();
        {
            let frame = &mut self.frames[self.current_frame];
            for pass in &graph.passes {
                let data = pass.data();
                for attachment in &data.attachments {
                    if attachment.handle.is_root() {
                        frame
                            .available_resources
                            .entry(attachment.handle)
                            .or_insert(FrameResource::Image { image: swapchain_vk_image, view: swapchain_view });
                    }
                }
                for use_ in &data.uses {
                    let handle = use_.handle;
                    if handle.is_root() || handle.is_virtual() || handle.is_staging() || frame.available_resources.contains_key(&handle) {
                        continue;
                    }
                    let required = match declared.get(&handle) {
                        Some(info) => info,
                        None => {
                            warn!("pass '{}' uses a resource never declared to the module, skipping it this frame", data.name);
                            continue;
                        }
                    };
                    if let Err(e) = resolve_physical_resource(&self.physical_cache, device, frame, handle, required) {
                        warn!("resource allocation failed for pass '{}': {:?}", data.name, e);
                        continue;
                    }
                    let cache = self.physical_cache.lock().expect("physical resource cache poisoned");
                    match cache.get(&handle) {
                        Some(PhysicalResource::Buffer { buffer, .. }) => {
                            frame.available_resources.insert(handle, FrameResource::Buffer(*buffer));
                        }
                        Some(PhysicalResource::Image { image, view, .. }) => {
                            frame.available_resources.insert(handle, FrameResource::Image { image: *image, view: *view });
                        }
                        None => {}
                    }
                }
            }
        }

        let image_views: HashMap<ResourceHandle, vk::ImageView> = {
            let frame = &self.frames[self.current_frame];
            frame
                .available_resources
                .iter()
                .filter_map(|(&handle, resource)| match resource {
                    FrameResource::Image { view, .. } => Some((handle, *view)),
                    FrameResource::Buffer(_) => None,
                })
                .collect()
        };

        let attachment_formats: HashMap<ResourceHandle, vk::Format> = {
            let mut formats = HashMap::new();
            for pass in &graph.passes {
                for attachment in &pass.data().attachments {
                    if attachment.handle.is_root() {
                        formats.insert(attachment.handle, self.swapchain.format());
                    } else if let Some(info) = declared.get(&attachment.handle) {
                        if let ResourceInfo::Image(image_info) = info {
                            formats.insert(attachment.handle, image_info.format);
                        }
                    }
                }
            }
            formats
        };

        let mut renderpasses: Vec<Option<(vk::RenderPass, vk::Framebuffer, crate::pipeline::pso::RenderpassCompatibilityHash)>> = Vec::with_capacity(graph.passes.len());
        {
            let frame = &mut self.frames[self.current_frame];
            for pass in &graph.passes {
                if pass.data().queue_kind == QueueKind::Graphics {
                    match frame::build_renderpass(device, frame, pass, &sync, &image_views, &attachment_formats) {
                        Ok(built) => renderpasses.push(Some(built)),
                        Err(e) => {
                            warn!("renderpass build failed for pass '{}', skipping: {:?}", pass.data().name, e);
                            renderpasses.push(None);
                        }
                    }
                } else {
                    renderpasses.push(None);
                }
            }
        }

        let mut recorded: Vec<Vec<u8>> = Vec::with_capacity(graph.passes.len());
        {
            let frame = &mut self.frames[self.current_frame];
            for (slot, pass) in graph.passes.iter().enumerate() {
                recorded.push(frame::record_pass(frame, &self.pipelines, pass, slot));
            }
        }

        let mut targets_swapchain_this_frame = false;
        {
            let frame = &mut self.frames[self.current_frame];
            let mut submission_groups: Vec<Vec<vk::CommandBuffer>> = Vec::with_capacity(graph.subgraphs.len());
            let mut group_targets_swapchain: Vec<bool> = Vec::with_capacity(graph.subgraphs.len());

            for group_mask in &graph.subgraphs {
                let mut command_buffers = Vec::new();
                let mut this_group_targets_swapchain = false;

                for (pass_index, pass) in graph.passes.iter().enumerate() {
                    if !group_mask.contains(pass_index) {
                        continue;
                    }
                    let data = pass.data();
                    let is_graphics = data.queue_kind == QueueKind::Graphics;
                    let (render_pass, framebuffer, compat_hash) = match renderpasses[pass_index] {
                        Some(built) => built,
                        None if is_graphics => {
                            warn!("pass '{}' has no renderpass, skipping", data.name);
                            continue;
                        }
                        None => (vk::RenderPass::null(), vk::Framebuffer::null(), 0u64),
                    };
                    if data.attachments.iter().any(|a| a.handle.is_root()) {
                        this_group_targets_swapchain = true;
                    }

                    let alloc_info = vk::CommandBufferAllocateInfo::builder()
                        .command_pool(frame.command_pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1)
                        .build();
                    let command_buffer = match unsafe { raw.allocate_command_buffers(&alloc_info) } {
                        Ok(buffers) => buffers[0],
                        Err(e) => {
                            warn!("command buffer allocation failed for pass '{}', skipping: {:?}", data.name, e);
                            continue;
                        }
                    };
                    let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).build();
                    if let Err(e) = unsafe { raw.begin_command_buffer(command_buffer, &begin_info) } {
                        warn!("begin_command_buffer failed for pass '{}', skipping: {:?}", data.name, e);
                        continue;
                    }

                    for (op, before, after) in sync.barriers_for_pass(pass_index) {
                        issue_barrier(frame, raw, command_buffer, op.resource, before, after);
                    }

                    if is_graphics {
                        let clear_values: Vec<vk::ClearValue> = data.attachments.iter().map(|a| a.clear_value).collect();
                        let render_area = vk::Rect2D { offset: vk::Offset2D::default(), extent: vk::Extent2D { width: data.width.max(1), height: data.height.max(1) } };
                        let pass_begin = vk::RenderPassBeginInfo::builder()
                            .render_pass(render_pass)
                            .framebuffer(framebuffer)
                            .render_area(render_area)
                            .clear_values(&clear_values)
                            .build();
                        unsafe { raw.cmd_begin_render_pass(command_buffer, &pass_begin, vk::SubpassContents::INLINE) };
                    }

                    frame::translate_commands(device, frame, &self.pipelines, command_buffer, render_pass, 0, compat_hash, &recorded[pass_index]);

                    if is_graphics {
                        unsafe { raw.cmd_end_render_pass(command_buffer) };
                    }
                    if let Err(e) = unsafe { raw.end_command_buffer(command_buffer) } {
                        warn!("end_command_buffer failed for pass '{}': {:?}", data.name, e);
                        continue;
                    }
                    command_buffers.push(command_buffer);
                }

                if this_group_targets_swapchain {
                    targets_swapchain_this_frame = true;
                }
                submission_groups.push(command_buffers);
                group_targets_swapchain.push(this_group_targets_swapchain);
            }

            let last_index = submission_groups.len().checked_sub(1);
            for (group_index, command_buffers) in submission_groups.iter().enumerate() {
                let wait_stage = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
                let wait_semaphores = [frame.image_acquired];
                let signal_semaphores = [frame.render_complete];
                let mut submit_builder = vk::SubmitInfo::builder().wait_semaphores(&wait_semaphores).wait_dst_stage_mask(&wait_stage).command_buffers(command_buffers);
                if group_targets_swapchain[group_index] {
                    submit_builder = submit_builder.signal_semaphores(&signal_semaphores);
                }
                let submit_info = submit_builder.build();
                let fence = if Some(group_index) == last_index { frame.fence } else { vk::Fence::null() };
                if let Err(e) = unsafe { raw.queue_submit(self.queue, &[submit_info], fence) } {
                    warn!("queue_submit failed for subgraph {}: {:?}", group_index, e);
                }
            }
        }

        if targets_swapchain_this_frame {
            let render_complete = self.frames[self.current_frame].render_complete;
            if let Err(e) = self.swapchain.present(self.queue, image_index, render_complete) {
                warn!("present failed: {:?}", e);
            }
        } else {
            log::debug!("frame produced no pass targeting the swapchain, skipping present");
        }

        {
            let mut persisted_states = self.persisted_states.lock().expect("persisted-state cache poisoned");
            for (&handle, chain) in &sync.chains {
                if let Some(&last) = chain.last() {
                    persisted_states.insert(handle, last);
                }
            }
        }

        self.advance_frame();
        Ok(())
    }
}

/// Resolves a resource against the backend-wide cache: reuse if present and
/// a superset of the requirement, move to `binned_resources` and reallocate
/// if present but conflicting, allocate fresh otherwise. A free function
/// (rather than a `Backend` method) so
/// `Backend::update` can hold `&mut self.frames[..]` and `&self.physical_cache`
/// as the disjoint borrows they are.
fn resolve_physical_resource(
    physical_cache: &Mutex<HashMap<ResourceHandle, PhysicalResource>>,
    device: &dyn VulkanDevice,
    frame: &mut BackendFrameData,
    handle: ResourceHandle,
    required: &ResourceInfo,
) -> Result<()> {
    let mut cache = physical_cache.lock().expect("physical resource cache poisoned");
    if let Some(existing) = cache.get(&handle) {
        if existing.satisfies(required) {
            return Ok(());
        }
    }
    let fresh = allocate_physical_resource(device, required)?;
    if let Some(old) = cache.insert(handle, fresh) {
        frame.binned_resources.push(old);
    }
    Ok(())
}

/// Issues the `vk::ImageMemoryBarrier`/`vk::BufferMemoryBarrier` for one
/// active explicit sync op.
fn issue_barrier(frame: &BackendFrameData, raw: &ash::Device, command_buffer: vk::CommandBuffer, handle: ResourceHandle, before: ResourceState, after: ResourceState) {
    if handle.is_image() {
        let image = match frame.available_resources.get(&handle) {
            Some(FrameResource::Image { image, .. }) => *image,
            _ => {
                warn!("barrier for {:?} skipped: image not bound this frame", handle);
                return;
            }
        };
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(before.image_layout)
            .new_layout(after.image_layout)
            .src_access_mask(before.access_flags)
            .dst_access_mask(after.access_flags)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            })
            .build();
        unsafe { raw.cmd_pipeline_barrier(command_buffer, before.stage_mask, after.stage_mask, vk::DependencyFlags::empty(), &[], &[], &[barrier]) };
    } else {
        let buffer = match frame.available_resources.get(&handle) {
            Some(FrameResource::Buffer(b)) => *b,
            _ => {
                warn!("barrier for {:?} skipped: buffer not bound this frame", handle);
                return;
            }
        };
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(before.access_flags)
            .dst_access_mask(after.access_flags)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe { raw.cmd_pipeline_barrier(command_buffer, before.stage_mask, after.stage_mask, vk::DependencyFlags::empty(), &[], &[barrier], &[]) };
    }
}

fn allocate_physical_resource(device: &dyn VulkanDevice, info: &ResourceInfo) -> Result<PhysicalResource> {
    let raw = device.raw();
    let memory_properties = device.physical_device_memory_properties();
    match info {
        ResourceInfo::Buffer(buffer_info) => {
            let create_info = vk::BufferCreateInfo::builder()
                .size(buffer_info.size.max(1))
                .usage(buffer_info.usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .build();
            let buffer = unsafe { raw.create_buffer(&create_info, None) }.map_err(|e| vulkan_call_failed("create_buffer", e))?;
            let requirements = unsafe { raw.get_buffer_memory_requirements(buffer) };
            let memory_type = find_memory_type_index(&memory_properties, requirements.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
                .ok_or_else(|| vulkan_call_failed("find_memory_type_index", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))?;
            let alloc_info = vk::MemoryAllocateInfo::builder().allocation_size(requirements.size).memory_type_index(memory_type).build();
            let memory = unsafe { raw.allocate_memory(&alloc_info, None) }.map_err(|e| vulkan_call_failed("allocate_memory", e))?;
            unsafe { raw.bind_buffer_memory(buffer, memory, 0) }.map_err(|e| vulkan_call_failed("bind_buffer_memory", e))?;
            Ok(PhysicalResource::Buffer { buffer, memory, info: *buffer_info })
        }
        ResourceInfo::Image(image_info) => {
            let create_info = vk::ImageCreateInfo::builder()
                .flags(image_info.create_flags)
                .image_type(image_info.image_type)
                .format(image_info.format)
                .extent(vk::Extent3D { width: image_info.width.max(1), height: image_info.height.max(1), depth: image_info.depth })
                .mip_levels(image_info.mip_levels)
                .array_layers(image_info.array_layers)
                .samples(image_info.samples)
                .tiling(image_info.tiling)
                .usage(image_info.usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .build();
            let image = unsafe { raw.create_image(&create_info, None) }.map_err(|e| vulkan_call_failed("create_image", e))?;
            let requirements = unsafe { raw.get_image_memory_requirements(image) };
            let memory_type = find_memory_type_index(&memory_properties, requirements.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
                .ok_or_else(|| vulkan_call_failed("find_memory_type_index", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))?;
            let alloc_info = vk::MemoryAllocateInfo::builder().allocation_size(requirements.size).memory_type_index(memory_type).build();
            let memory = unsafe { raw.allocate_memory(&alloc_info, None) }.map_err(|e| vulkan_call_failed("allocate_memory", e))?;
            unsafe { raw.bind_image_memory(image, memory, 0) }.map_err(|e| vulkan_call_failed("bind_image_memory", e))?;
            let aspect = if image_info.usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
                vk::ImageAspectFlags::DEPTH
            } else {
                vk::ImageAspectFlags::COLOR
            };
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(image_info.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: aspect,
                    base_mip_level: 0,
                    level_count: image_info.mip_levels,
                    base_array_layer: 0,
                    layer_count: image_info.array_layers,
                })
                .build();
            let view = unsafe { raw.create_image_view(&view_info, None) }.map_err(|e| vulkan_call_failed("create_image_view", e))?;
            Ok(PhysicalResource::Image { image, memory, view, info: *image_info })
        }
        ResourceInfo::AccelerationStructure(_) => Err(GraphError::Unsupported {
            message: "acceleration structure physical allocation requires the host's VK_KHR_acceleration_structure loader".to_string(),
        }),
    }
}

fn vulkan_call_failed(call: &str, result: vk::Result) -> GraphError {
    GraphError::SwapchainAcquireFailed { message: format!("{} failed: {:?}", call, result) }
}
