//! Command stream encoder.
//!
//! Appends self-describing commands into a contiguous byte buffer, one per
//! pass. Holds a reference to the pass's [`LinearAllocator`] (for
//! `set_vertex_data`/`set_index_data`/`set_argument_data`) and to the
//! frame's [`StagingAllocator`] (for `write_to_image`).

use ash::vk;
use byteorder::{LittleEndian, WriteBytesExt};
use log::warn;

use crate::alloc::{LinearAllocator, StagingAllocator};
use crate::command::{write_header, CommandType, IndexType, ScissorRect, Viewport, WriteImageSettings};
use crate::handle::ResourceHandle;
use crate::pipeline::PipelineManager;

/// Encoder exposed to a pass's execute callback. Not `Send`/`Sync`: one
/// encoder exists per pass, recorded on a single thread and never shared
/// across passes.
pub struct CommandEncoder<'a> {
    buffer: Vec<u8>,
    scratch: &'a mut LinearAllocator,
    staging: &'a StagingAllocator,
    extent: (u32, u32),
    /// Incremented every time a scratch allocation fails, for diagnostics;
    /// the command itself is silently dropped.
    dropped_commands: u32,
    /// Lets an execute callback introspect the process-wide caches, e.g. to
    /// pre-introduce a PSO.
    /// `None` in the unit-test constructor, which has no live caches to hand
    /// back.
    pipeline_manager: Option<&'a PipelineManager>,
}

impl<'a> CommandEncoder<'a> {
    pub fn new(scratch: &'a mut LinearAllocator, staging: &'a StagingAllocator, extent: (u32, u32)) -> CommandEncoder<'a> {
        CommandEncoder {
            buffer: Vec::new(),
            scratch,
            staging,
            extent,
            dropped_commands: 0,
            pipeline_manager: None,
        }
    }

    pub fn new_with_pipeline_manager(
        scratch: &'a mut LinearAllocator,
        staging: &'a StagingAllocator,
        extent: (u32, u32),
        pipeline_manager: &'a PipelineManager,
    ) -> CommandEncoder<'a> {
        CommandEncoder {
            buffer: Vec::new(),
            scratch,
            staging,
            extent,
            dropped_commands: 0,
            pipeline_manager: Some(pipeline_manager),
        }
    }

    pub fn get_pipeline_manager(&self) -> Option<&'a PipelineManager> {
        self.pipeline_manager
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }

    pub fn dropped_commands(&self) -> u32 {
        self.dropped_commands
    }

    pub fn get_renderpass_extent(&self) -> (u32, u32) {
        self.extent
    }

    fn push(&mut self, command_type: CommandType, encode_payload: impl FnOnce(&mut Vec<u8>)) {
        let start = self.buffer.len();
        // Reserve the header; its byte_length is patched once the payload
        // (and any trailing variable-length bytes) has been written.
        write_header(&mut self.buffer, command_type, 0);
        encode_payload(&mut self.buffer);
        let total_len = (self.buffer.len() - start) as u32;
        self.buffer[start + 4..start + 8].copy_from_slice(&total_len.to_le_bytes());
    }

    fn write_handle(buf: &mut Vec<u8>, handle: ResourceHandle) {
        buf.write_u64::<LittleEndian>(handle.id()).unwrap();
        buf.write_u8(handle.kind() as u8).unwrap();
        buf.write_u8(handle.is_virtual() as u8).unwrap();
        buf.write_u8(handle.is_staging() as u8).unwrap();
        buf.write_u8(handle.is_root() as u8).unwrap();
        buf.write_u32::<LittleEndian>(handle.variant_index()).unwrap();
    }

    // ---------------------------------------------------------------
    // Pipeline binds

    pub fn bind_graphics_pipeline(&mut self, pso: u64) {
        self.push(CommandType::BindGraphicsPipeline, |buf| {
            buf.write_u64::<LittleEndian>(pso).unwrap();
        });
    }

    pub fn bind_compute_pipeline(&mut self, pso: u64) {
        self.push(CommandType::BindComputePipeline, |buf| {
            buf.write_u64::<LittleEndian>(pso).unwrap();
        });
    }

    pub fn bind_rtx_pipeline(&mut self, pso: u64) {
        self.push(CommandType::BindRtxPipeline, |buf| {
            buf.write_u64::<LittleEndian>(pso).unwrap();
        });
    }

    pub fn bind_index_buffer(&mut self, buffer: ResourceHandle, offset: u64, index_type: IndexType) {
        self.push(CommandType::BindIndexBuffer, |buf| {
            Self::write_handle(buf, buffer);
            buf.write_u64::<LittleEndian>(offset).unwrap();
            buf.write_u8(if index_type == IndexType::U32 { 1 } else { 0 }).unwrap();
        });
    }

    pub fn bind_vertex_buffers(&mut self, buffers: &[(ResourceHandle, u64)]) {
        self.push(CommandType::BindVertexBuffers, |buf| {
            buf.write_u32::<LittleEndian>(buffers.len() as u32).unwrap();
            for (handle, offset) in buffers {
                Self::write_handle(buf, *handle);
                buf.write_u64::<LittleEndian>(*offset).unwrap();
            }
        });
    }

    // ---------------------------------------------------------------
    // Scratch-backed vertex/index/argument data.
    //
    // Each of these allocates from the pass's linear sub-allocator; the
    // resulting scratch region is itself the virtual buffer later bound
    // directly, so the only record emitted is the bind command.

    pub fn set_index_data(&mut self, bytes: &[u8], index_type: IndexType) {
        match self.scratch.allocate(bytes.len() as u64) {
            Some(allocation) => {
                self.stage_scratch_bytes(allocation.buffer_offset, bytes);
                let handle = ResourceHandle::virtual_buffer("index_scratch", allocation.buffer_offset as u32);
                self.bind_index_buffer(handle, allocation.buffer_offset, index_type);
            }
            None => self.drop_command("setIndexData: sub-allocator overflow"),
        }
    }

    pub fn set_vertex_data(&mut self, bytes: &[u8], binding_index: u32) {
        match self.scratch.allocate(bytes.len() as u64) {
            Some(allocation) => {
                self.stage_scratch_bytes(allocation.buffer_offset, bytes);
                let handle = ResourceHandle::virtual_buffer("vertex_scratch", allocation.buffer_offset as u32 + binding_index);
                self.bind_vertex_buffers(&[(handle, allocation.buffer_offset)]);
            }
            None => self.drop_command("setVertexData: sub-allocator overflow"),
        }
    }

    pub fn set_argument_data(&mut self, name_hash: u64, bytes: &[u8]) {
        match self.scratch.allocate(bytes.len() as u64) {
            Some(allocation) => {
                self.stage_scratch_bytes(allocation.buffer_offset, bytes);
                let buffer = ResourceHandle::virtual_buffer("argument_scratch", allocation.buffer_offset as u32);
                self.push(CommandType::SetArgumentData, |buf| {
                    buf.write_u64::<LittleEndian>(name_hash).unwrap();
                    Self::write_handle(buf, buffer);
                    buf.write_u64::<LittleEndian>(allocation.buffer_offset).unwrap();
                    buf.write_u64::<LittleEndian>(bytes.len() as u64).unwrap();
                });
            }
            None => self.drop_command("setArgumentData: sub-allocator overflow"),
        }
    }

    fn stage_scratch_bytes(&mut self, offset: u64, bytes: &[u8]) {
        if let Some(ptr) = self.scratch.mapped_ptr_at(offset) {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
            }
        }
    }

    fn drop_command(&mut self, message: &str) {
        self.dropped_commands += 1;
        warn!("command dropped: {}", message);
    }

    // ---------------------------------------------------------------
    // Argument binding

    pub fn bind_argument_buffer(&mut self, name_hash: u64, buffer: ResourceHandle, offset: u64, range: u64) {
        self.push(CommandType::BindArgumentBuffer, |buf| {
            buf.write_u64::<LittleEndian>(name_hash).unwrap();
            Self::write_handle(buf, buffer);
            buf.write_u64::<LittleEndian>(offset).unwrap();
            buf.write_u64::<LittleEndian>(range).unwrap();
        });
    }

    pub fn set_argument_texture(&mut self, name_hash: u64, texture: ResourceHandle, array_index: u32) {
        self.push(CommandType::SetArgumentTexture, |buf| {
            buf.write_u64::<LittleEndian>(name_hash).unwrap();
            Self::write_handle(buf, texture);
            buf.write_u32::<LittleEndian>(array_index).unwrap();
        });
    }

    pub fn set_argument_image(&mut self, name_hash: u64, image: ResourceHandle, array_index: u32) {
        self.push(CommandType::SetArgumentImage, |buf| {
            buf.write_u64::<LittleEndian>(name_hash).unwrap();
            Self::write_handle(buf, image);
            buf.write_u32::<LittleEndian>(array_index).unwrap();
        });
    }

    pub fn set_argument_tlas(&mut self, name_hash: u64, tlas: ResourceHandle) {
        self.push(CommandType::SetArgumentTlas, |buf| {
            buf.write_u64::<LittleEndian>(name_hash).unwrap();
            Self::write_handle(buf, tlas);
        });
    }

    // ---------------------------------------------------------------
    // Draw / dispatch

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.push(CommandType::Draw, |buf| {
            buf.write_u32::<LittleEndian>(vertex_count).unwrap();
            buf.write_u32::<LittleEndian>(instance_count).unwrap();
            buf.write_u32::<LittleEndian>(first_vertex).unwrap();
            buf.write_u32::<LittleEndian>(first_instance).unwrap();
        });
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) {
        self.push(CommandType::DrawIndexed, |buf| {
            buf.write_u32::<LittleEndian>(index_count).unwrap();
            buf.write_u32::<LittleEndian>(instance_count).unwrap();
            buf.write_u32::<LittleEndian>(first_index).unwrap();
            buf.write_i32::<LittleEndian>(vertex_offset).unwrap();
            buf.write_u32::<LittleEndian>(first_instance).unwrap();
        });
    }

    pub fn draw_mesh_tasks(&mut self, task_count: u32, first_task: u32) {
        self.push(CommandType::DrawMeshTasks, |buf| {
            buf.write_u32::<LittleEndian>(task_count).unwrap();
            buf.write_u32::<LittleEndian>(first_task).unwrap();
        });
    }

    pub fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        self.push(CommandType::Dispatch, |buf| {
            buf.write_u32::<LittleEndian>(group_count_x).unwrap();
            buf.write_u32::<LittleEndian>(group_count_y).unwrap();
            buf.write_u32::<LittleEndian>(group_count_z).unwrap();
        });
    }

    pub fn trace_rays(&mut self, width: u32, height: u32, depth: u32) {
        self.push(CommandType::TraceRays, |buf| {
            buf.write_u32::<LittleEndian>(width).unwrap();
            buf.write_u32::<LittleEndian>(height).unwrap();
            buf.write_u32::<LittleEndian>(depth).unwrap();
        });
    }

    // ---------------------------------------------------------------
    // Fixed-function state

    pub fn set_line_width(&mut self, width: f32) {
        self.push(CommandType::SetLineWidth, |buf| {
            buf.write_f32::<LittleEndian>(width).unwrap();
        });
    }

    pub fn set_viewport(&mut self, viewports: &[Viewport]) {
        self.push(CommandType::SetViewport, |buf| {
            buf.write_u32::<LittleEndian>(viewports.len() as u32).unwrap();
            for v in viewports {
                buf.write_f32::<LittleEndian>(v.x).unwrap();
                buf.write_f32::<LittleEndian>(v.y).unwrap();
                buf.write_f32::<LittleEndian>(v.width).unwrap();
                buf.write_f32::<LittleEndian>(v.height).unwrap();
                buf.write_f32::<LittleEndian>(v.min_depth).unwrap();
                buf.write_f32::<LittleEndian>(v.max_depth).unwrap();
            }
        });
    }

    pub fn set_scissor(&mut self, scissors: &[ScissorRect]) {
        self.push(CommandType::SetScissor, |buf| {
            buf.write_u32::<LittleEndian>(scissors.len() as u32).unwrap();
            for s in scissors {
                buf.write_i32::<LittleEndian>(s.x).unwrap();
                buf.write_i32::<LittleEndian>(s.y).unwrap();
                buf.write_u32::<LittleEndian>(s.width).unwrap();
                buf.write_u32::<LittleEndian>(s.height).unwrap();
            }
        });
    }

    pub fn set_push_constant_data(&mut self, bytes: &[u8]) {
        self.push(CommandType::SetPushConstantData, |buf| {
            buf.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
            buf.extend_from_slice(bytes);
        });
    }

    // ---------------------------------------------------------------
    // Uploads

    pub fn write_to_buffer(&mut self, dst: ResourceHandle, dst_offset: u64, bytes: &[u8]) {
        match self.scratch.allocate(bytes.len() as u64) {
            Some(allocation) => {
                self.stage_scratch_bytes(allocation.buffer_offset, bytes);
                let src = ResourceHandle::virtual_buffer("write_to_buffer_scratch", allocation.buffer_offset as u32);
                // Fences the host write just staged into the scratch buffer
                // against the transfer read the following copy performs.
                self.push(CommandType::BufferMemoryBarrier, |buf| {
                    Self::write_handle(buf, src);
                    buf.write_u64::<LittleEndian>(allocation.buffer_offset).unwrap();
                    buf.write_u64::<LittleEndian>(bytes.len() as u64).unwrap();
                    buf.write_u32::<LittleEndian>(vk::PipelineStageFlags::HOST.as_raw()).unwrap();
                    buf.write_u32::<LittleEndian>(vk::PipelineStageFlags::TRANSFER.as_raw()).unwrap();
                    buf.write_u32::<LittleEndian>(vk::AccessFlags::HOST_WRITE.as_raw()).unwrap();
                    buf.write_u32::<LittleEndian>(vk::AccessFlags::TRANSFER_READ.as_raw()).unwrap();
                });
                self.push(CommandType::WriteToBuffer, |buf| {
                    Self::write_handle(buf, src);
                    buf.write_u64::<LittleEndian>(allocation.buffer_offset).unwrap();
                    Self::write_handle(buf, dst);
                    buf.write_u64::<LittleEndian>(dst_offset).unwrap();
                    buf.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
                    buf.extend_from_slice(bytes);
                });
            }
            None => self.drop_command("writeToBuffer: sub-allocator overflow"),
        }
    }

    pub fn write_to_image(&mut self, dst: ResourceHandle, settings: WriteImageSettings, bytes: &[u8]) {
        let (_ptr, staging_handle) = self.staging.map(bytes.len());
        self.staging.write(staging_handle, bytes);
        self.push(CommandType::WriteToImage, |buf| {
            Self::write_handle(buf, staging_handle);
            Self::write_handle(buf, dst);
            buf.write_u32::<LittleEndian>(settings.num_miplevels).unwrap();
            buf.write_u32::<LittleEndian>(settings.array_layer).unwrap();
            buf.write_u32::<LittleEndian>(settings.width).unwrap();
            buf.write_u32::<LittleEndian>(settings.height).unwrap();
            buf.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
            buf.extend_from_slice(bytes);
        });
    }

    // ---------------------------------------------------------------
    // Ray tracing acceleration structure builds

    pub fn build_rtx_blas(&mut self, blas: ResourceHandle) {
        self.push(CommandType::BuildRtxBlas, |buf| {
            Self::write_handle(buf, blas);
        });
    }

    pub fn build_rtx_tlas(&mut self, tlas: ResourceHandle) {
        self.push(CommandType::BuildRtxTlas, |buf| {
            Self::write_handle(buf, tlas);
        });
    }
}
