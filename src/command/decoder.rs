//! Command stream decoder.
//!
//! Walks a recorded byte buffer header-by-header and yields
//! [`RecordedCommand`] values, without knowing anything about the resource
//! handles' physical backing — that translation (virtual handle to real
//! `vk::Buffer`/`vk::Image`, PSO hash to real `vk::Pipeline`) is the
//! backend's job at submission time. Kept separate from `encoder.rs` so the
//! encode side and the submission-time consuming side can evolve
//! independently.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::command::{
    read_header, CommandType, IndexType, RecordedCommand, ScissorRect, Viewport, WriteImageSettings, HEADER_BYTES,
};
use crate::handle::{ResourceHandle, ResourceKind};

/// Iterator over a recorded command buffer. Construct with
/// [`CommandDecoder::new`] and consume with `Iterator::next` or by
/// collecting, as the backend's submission loop does.
pub struct CommandDecoder<'a> {
    cursor: Cursor<&'a [u8]>,
    len: u64,
}

impl<'a> CommandDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> CommandDecoder<'a> {
        CommandDecoder {
            cursor: Cursor::new(bytes),
            len: bytes.len() as u64,
        }
    }

    fn read_handle(&mut self) -> ResourceHandle {
        let id = self.cursor.read_u64::<LittleEndian>().unwrap();
        let kind = ResourceKind::from_u8(self.cursor.read_u8().unwrap());
        let is_virtual = self.cursor.read_u8().unwrap() != 0;
        let is_staging = self.cursor.read_u8().unwrap() != 0;
        let is_root = self.cursor.read_u8().unwrap() != 0;
        let variant_index = self.cursor.read_u32::<LittleEndian>().unwrap();
        ResourceHandle::from_wire(id, kind, is_virtual, is_staging, is_root, variant_index)
    }

    fn read_bytes(&mut self, len: usize) -> Vec<u8> {
        let position = self.cursor.position() as usize;
        let bytes = self.cursor.get_ref()[position..position + len].to_vec();
        self.cursor.set_position((position + len) as u64);
        bytes
    }
}

impl<'a> Iterator for CommandDecoder<'a> {
    type Item = RecordedCommand;

    fn next(&mut self) -> Option<RecordedCommand> {
        if self.cursor.position() >= self.len {
            return None;
        }
        let header = read_header(&mut self.cursor);
        let record_start = self.cursor.position() - HEADER_BYTES as u64;
        let command = match header.command_type {
            CommandType::BindGraphicsPipeline => RecordedCommand::BindGraphicsPipeline {
                pso: self.cursor.read_u64::<LittleEndian>().unwrap(),
            },
            CommandType::BindComputePipeline => RecordedCommand::BindComputePipeline {
                pso: self.cursor.read_u64::<LittleEndian>().unwrap(),
            },
            CommandType::BindRtxPipeline => RecordedCommand::BindRtxPipeline {
                pso: self.cursor.read_u64::<LittleEndian>().unwrap(),
            },
            CommandType::BindIndexBuffer => {
                let buffer = self.read_handle();
                let offset = self.cursor.read_u64::<LittleEndian>().unwrap();
                let index_type = if self.cursor.read_u8().unwrap() == 1 { IndexType::U32 } else { IndexType::U16 };
                RecordedCommand::BindIndexBuffer { buffer, offset, index_type }
            }
            CommandType::BindVertexBuffers => {
                let count = self.cursor.read_u32::<LittleEndian>().unwrap();
                let mut buffers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let handle = self.read_handle();
                    let offset = self.cursor.read_u64::<LittleEndian>().unwrap();
                    buffers.push((handle, offset));
                }
                RecordedCommand::BindVertexBuffers { buffers }
            }
            CommandType::SetArgumentData => {
                let name_hash = self.cursor.read_u64::<LittleEndian>().unwrap();
                let buffer = self.read_handle();
                let offset = self.cursor.read_u64::<LittleEndian>().unwrap();
                let range = self.cursor.read_u64::<LittleEndian>().unwrap();
                RecordedCommand::SetArgumentData { name_hash, buffer, offset, range }
            }
            CommandType::BindArgumentBuffer => {
                let name_hash = self.cursor.read_u64::<LittleEndian>().unwrap();
                let buffer = self.read_handle();
                let offset = self.cursor.read_u64::<LittleEndian>().unwrap();
                let range = self.cursor.read_u64::<LittleEndian>().unwrap();
                RecordedCommand::BindArgumentBuffer { name_hash, buffer, offset, range }
            }
            CommandType::SetArgumentTexture => {
                let name_hash = self.cursor.read_u64::<LittleEndian>().unwrap();
                let texture = self.read_handle();
                let array_index = self.cursor.read_u32::<LittleEndian>().unwrap();
                RecordedCommand::SetArgumentTexture { name_hash, texture, array_index }
            }
            CommandType::SetArgumentImage => {
                let name_hash = self.cursor.read_u64::<LittleEndian>().unwrap();
                let image = self.read_handle();
                let array_index = self.cursor.read_u32::<LittleEndian>().unwrap();
                RecordedCommand::SetArgumentImage { name_hash, image, array_index }
            }
            CommandType::SetArgumentTlas => {
                let name_hash = self.cursor.read_u64::<LittleEndian>().unwrap();
                let tlas = self.read_handle();
                RecordedCommand::SetArgumentTlas { name_hash, tlas }
            }
            CommandType::Draw => RecordedCommand::Draw {
                vertex_count: self.cursor.read_u32::<LittleEndian>().unwrap(),
                instance_count: self.cursor.read_u32::<LittleEndian>().unwrap(),
                first_vertex: self.cursor.read_u32::<LittleEndian>().unwrap(),
                first_instance: self.cursor.read_u32::<LittleEndian>().unwrap(),
            },
            CommandType::DrawIndexed => RecordedCommand::DrawIndexed {
                index_count: self.cursor.read_u32::<LittleEndian>().unwrap(),
                instance_count: self.cursor.read_u32::<LittleEndian>().unwrap(),
                first_index: self.cursor.read_u32::<LittleEndian>().unwrap(),
                vertex_offset: self.cursor.read_i32::<LittleEndian>().unwrap(),
                first_instance: self.cursor.read_u32::<LittleEndian>().unwrap(),
            },
            CommandType::Dispatch => RecordedCommand::Dispatch {
                group_count_x: self.cursor.read_u32::<LittleEndian>().unwrap(),
                group_count_y: self.cursor.read_u32::<LittleEndian>().unwrap(),
                group_count_z: self.cursor.read_u32::<LittleEndian>().unwrap(),
            },
            CommandType::TraceRays => RecordedCommand::TraceRays {
                width: self.cursor.read_u32::<LittleEndian>().unwrap(),
                height: self.cursor.read_u32::<LittleEndian>().unwrap(),
                depth: self.cursor.read_u32::<LittleEndian>().unwrap(),
            },
            CommandType::DrawMeshTasks => RecordedCommand::DrawMeshTasks {
                task_count: self.cursor.read_u32::<LittleEndian>().unwrap(),
                first_task: self.cursor.read_u32::<LittleEndian>().unwrap(),
            },
            CommandType::WriteToBuffer => {
                let src = self.read_handle();
                let src_offset = self.cursor.read_u64::<LittleEndian>().unwrap();
                let dst = self.read_handle();
                let dst_offset = self.cursor.read_u64::<LittleEndian>().unwrap();
                let len = self.cursor.read_u32::<LittleEndian>().unwrap() as usize;
                let bytes = self.read_bytes(len);
                RecordedCommand::WriteToBuffer { src, src_offset, dst, dst_offset, bytes }
            }
            CommandType::WriteToImage => {
                let staging = self.read_handle();
                let dst = self.read_handle();
                let settings = WriteImageSettings {
                    num_miplevels: self.cursor.read_u32::<LittleEndian>().unwrap(),
                    array_layer: self.cursor.read_u32::<LittleEndian>().unwrap(),
                    width: self.cursor.read_u32::<LittleEndian>().unwrap(),
                    height: self.cursor.read_u32::<LittleEndian>().unwrap(),
                };
                let len = self.cursor.read_u32::<LittleEndian>().unwrap() as usize;
                let bytes = self.read_bytes(len);
                RecordedCommand::WriteToImage { staging, dst, settings, bytes }
            }
            CommandType::SetViewport => {
                let count = self.cursor.read_u32::<LittleEndian>().unwrap();
                let mut viewports = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    viewports.push(Viewport {
                        x: self.cursor.read_f32::<LittleEndian>().unwrap(),
                        y: self.cursor.read_f32::<LittleEndian>().unwrap(),
                        width: self.cursor.read_f32::<LittleEndian>().unwrap(),
                        height: self.cursor.read_f32::<LittleEndian>().unwrap(),
                        min_depth: self.cursor.read_f32::<LittleEndian>().unwrap(),
                        max_depth: self.cursor.read_f32::<LittleEndian>().unwrap(),
                    });
                }
                RecordedCommand::SetViewport { viewports }
            }
            CommandType::SetScissor => {
                let count = self.cursor.read_u32::<LittleEndian>().unwrap();
                let mut scissors = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    scissors.push(ScissorRect {
                        x: self.cursor.read_i32::<LittleEndian>().unwrap(),
                        y: self.cursor.read_i32::<LittleEndian>().unwrap(),
                        width: self.cursor.read_u32::<LittleEndian>().unwrap(),
                        height: self.cursor.read_u32::<LittleEndian>().unwrap(),
                    });
                }
                RecordedCommand::SetScissor { scissors }
            }
            CommandType::SetLineWidth => RecordedCommand::SetLineWidth {
                width: self.cursor.read_f32::<LittleEndian>().unwrap(),
            },
            CommandType::SetPushConstantData => {
                let len = self.cursor.read_u32::<LittleEndian>().unwrap() as usize;
                let bytes = self.read_bytes(len);
                RecordedCommand::SetPushConstantData { bytes }
            }
            CommandType::BuildRtxBlas => RecordedCommand::BuildRtxBlas { blas: self.read_handle() },
            CommandType::BuildRtxTlas => RecordedCommand::BuildRtxTlas { tlas: self.read_handle() },
            CommandType::BufferMemoryBarrier => {
                let buffer = self.read_handle();
                let offset = self.cursor.read_u64::<LittleEndian>().unwrap();
                let range = self.cursor.read_u64::<LittleEndian>().unwrap();
                let src_stage = self.cursor.read_u32::<LittleEndian>().unwrap();
                let dst_stage = self.cursor.read_u32::<LittleEndian>().unwrap();
                let src_access = self.cursor.read_u32::<LittleEndian>().unwrap();
                let dst_access = self.cursor.read_u32::<LittleEndian>().unwrap();
                RecordedCommand::BufferMemoryBarrier { buffer, offset, range, src_stage, dst_stage, src_access, dst_access }
            }
        };
        // Trust the declared record length over however many bytes the
        // payload decoder actually consumed, so a future command type this
        // decoder doesn't yet understand can still be skipped.
        self.cursor.set_position(record_start + header.byte_length as u64);
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{LinearAllocator, StagingAllocator};
    use crate::command::CommandEncoder;
    use crate::handle::ResourceHandle;

    #[test]
    fn draw_round_trips_through_encode_and_decode() {
        let mut scratch = LinearAllocator::new(4096, None);
        let staging = StagingAllocator::new();
        let mut encoder = CommandEncoder::new(&mut scratch, &staging, (1920, 1080));
        encoder.bind_graphics_pipeline(42);
        encoder.draw(3, 1, 0, 0);
        let bytes = encoder.finish();

        let commands: Vec<RecordedCommand> = CommandDecoder::new(&bytes).collect();
        assert_eq!(commands.len(), 2);
        match commands[0] {
            RecordedCommand::BindGraphicsPipeline { pso } => assert_eq!(pso, 42),
            _ => panic!("expected BindGraphicsPipeline"),
        }
        match commands[1] {
            RecordedCommand::Draw { vertex_count, instance_count, .. } => {
                assert_eq!(vertex_count, 3);
                assert_eq!(instance_count, 1);
            }
            _ => panic!("expected Draw"),
        }
    }

    #[test]
    fn push_constant_bytes_round_trip_exactly() {
        let mut scratch = LinearAllocator::new(4096, None);
        let staging = StagingAllocator::new();
        let mut encoder = CommandEncoder::new(&mut scratch, &staging, (1, 1));
        encoder.set_push_constant_data(&[9, 8, 7, 6, 5]);
        let bytes = encoder.finish();

        let mut commands = CommandDecoder::new(&bytes);
        match commands.next().unwrap() {
            RecordedCommand::SetPushConstantData { bytes } => assert_eq!(bytes, vec![9, 8, 7, 6, 5]),
            _ => panic!("expected SetPushConstantData"),
        }
        assert!(commands.next().is_none());
    }

    #[test]
    fn write_to_buffer_emits_a_host_to_transfer_barrier_before_the_copy() {
        let mut scratch = LinearAllocator::new(4096, None);
        let staging = StagingAllocator::new();
        let mut encoder = CommandEncoder::new(&mut scratch, &staging, (1, 1));
        let dst = ResourceHandle::virtual_buffer("ubo", 0);
        encoder.write_to_buffer(dst, 0, &[1, 2, 3, 4]);
        let bytes = encoder.finish();

        let commands: Vec<RecordedCommand> = CommandDecoder::new(&bytes).collect();
        assert_eq!(commands.len(), 2);
        match &commands[0] {
            RecordedCommand::BufferMemoryBarrier { range, src_stage, dst_stage, src_access, dst_access, .. } => {
                assert_eq!(*range, 4);
                assert_eq!(*src_stage, ash::vk::PipelineStageFlags::HOST.as_raw());
                assert_eq!(*dst_stage, ash::vk::PipelineStageFlags::TRANSFER.as_raw());
                assert_eq!(*src_access, ash::vk::AccessFlags::HOST_WRITE.as_raw());
                assert_eq!(*dst_access, ash::vk::AccessFlags::TRANSFER_READ.as_raw());
            }
            _ => panic!("expected BufferMemoryBarrier"),
        }
        match &commands[1] {
            RecordedCommand::WriteToBuffer { dst: decoded_dst, bytes, .. } => {
                assert_eq!(*decoded_dst, dst);
                assert_eq!(bytes, &vec![1, 2, 3, 4]);
            }
            _ => panic!("expected WriteToBuffer"),
        }
    }

    #[test]
    fn write_to_image_carries_settings_and_staging_handle() {
        let mut scratch = LinearAllocator::new(4096, None);
        let staging = StagingAllocator::new();
        let mut encoder = CommandEncoder::new(&mut scratch, &staging, (256, 256));
        let dst = ResourceHandle::swapchain_image("mip_target");
        encoder.write_to_image(
            dst,
            WriteImageSettings { num_miplevels: 1, array_layer: 0, width: 64, height: 64 },
            &vec![0xABu8; 64 * 64 * 4],
        );
        let bytes = encoder.finish();

        match CommandDecoder::new(&bytes).next().unwrap() {
            RecordedCommand::WriteToImage { dst: decoded_dst, settings, bytes, .. } => {
                assert_eq!(decoded_dst, dst);
                assert_eq!(settings.width, 64);
                assert_eq!(bytes.len(), 64 * 64 * 4);
            }
            _ => panic!("expected WriteToImage"),
        }
    }
}
