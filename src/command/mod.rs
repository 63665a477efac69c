//! Self-describing per-pass command stream.
//!
//! Every record begins with an 8-byte `CommandHeader { type: u32, size: u32 }`;
//! fixed payload fields follow, and variable-length payloads (push constant
//! bytes, inline viewport/scissor arrays, argument data) are appended
//! immediately after and are covered by `size`. A length-prefixed byte
//! buffer decoded with `byteorder` rather than a tagged union, since Rust
//! has no portable way to lay out a `union`-style tagged record.

pub mod decoder;
pub mod encoder;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::handle::ResourceHandle;

pub use encoder::CommandEncoder;

pub const HEADER_BYTES: u32 = 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u32)]
pub enum CommandType {
    BindGraphicsPipeline = 0,
    BindComputePipeline = 1,
    BindRtxPipeline = 2,
    BindIndexBuffer = 3,
    BindVertexBuffers = 4,
    SetArgumentData = 5,
    BindArgumentBuffer = 6,
    SetArgumentTexture = 7,
    SetArgumentImage = 8,
    SetArgumentTlas = 9,
    Draw = 10,
    DrawIndexed = 11,
    Dispatch = 12,
    TraceRays = 13,
    DrawMeshTasks = 14,
    WriteToBuffer = 15,
    WriteToImage = 16,
    SetViewport = 17,
    SetScissor = 18,
    SetLineWidth = 19,
    SetPushConstantData = 20,
    BuildRtxBlas = 21,
    BuildRtxTlas = 22,
    BufferMemoryBarrier = 23,
}

impl CommandType {
    fn from_u32(value: u32) -> CommandType {
        use CommandType::*;
        match value {
            0 => BindGraphicsPipeline,
            1 => BindComputePipeline,
            2 => BindRtxPipeline,
            3 => BindIndexBuffer,
            4 => BindVertexBuffers,
            5 => SetArgumentData,
            6 => BindArgumentBuffer,
            7 => SetArgumentTexture,
            8 => SetArgumentImage,
            9 => SetArgumentTlas,
            10 => Draw,
            11 => DrawIndexed,
            12 => Dispatch,
            13 => TraceRays,
            14 => DrawMeshTasks,
            15 => WriteToBuffer,
            16 => WriteToImage,
            17 => SetViewport,
            18 => SetScissor,
            19 => SetLineWidth,
            20 => SetPushConstantData,
            21 => BuildRtxBlas,
            22 => BuildRtxTlas,
            23 => BufferMemoryBarrier,
            other => panic!("corrupt command stream: unknown command type {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandHeader {
    pub command_type: CommandType,
    /// Total byte length of this record, header included.
    pub byte_length: u32,
}

pub(crate) fn write_header(buf: &mut Vec<u8>, command_type: CommandType, byte_length: u32) {
    buf.write_u32::<LittleEndian>(command_type as u32).unwrap();
    buf.write_u32::<LittleEndian>(byte_length).unwrap();
}

pub(crate) fn read_header(cursor: &mut Cursor<&[u8]>) -> CommandHeader {
    let command_type = CommandType::from_u32(cursor.read_u32::<LittleEndian>().unwrap());
    let byte_length = cursor.read_u32::<LittleEndian>().unwrap();
    CommandHeader {
        command_type,
        byte_length,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IndexType {
    U16,
    U32,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteImageSettings {
    pub num_miplevels: u32,
    pub array_layer: u32,
    pub width: u32,
    pub height: u32,
}

/// A fully decoded command, used both by the submission-time decoder and
/// by the command-stream round-trip tests to compare recorded vs. decoded
/// sequences.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    BindGraphicsPipeline { pso: u64 },
    BindComputePipeline { pso: u64 },
    BindRtxPipeline { pso: u64 },
    BindIndexBuffer { buffer: ResourceHandle, offset: u64, index_type: IndexType },
    BindVertexBuffers { buffers: Vec<(ResourceHandle, u64)> },
    SetArgumentData { name_hash: u64, buffer: ResourceHandle, offset: u64, range: u64 },
    BindArgumentBuffer { name_hash: u64, buffer: ResourceHandle, offset: u64, range: u64 },
    SetArgumentTexture { name_hash: u64, texture: ResourceHandle, array_index: u32 },
    SetArgumentImage { name_hash: u64, image: ResourceHandle, array_index: u32 },
    SetArgumentTlas { name_hash: u64, tlas: ResourceHandle },
    Draw { vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32 },
    DrawIndexed { index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32 },
    Dispatch { group_count_x: u32, group_count_y: u32, group_count_z: u32 },
    TraceRays { width: u32, height: u32, depth: u32 },
    DrawMeshTasks { task_count: u32, first_task: u32 },
    WriteToBuffer { src: ResourceHandle, src_offset: u64, dst: ResourceHandle, dst_offset: u64, bytes: Vec<u8> },
    WriteToImage { staging: ResourceHandle, dst: ResourceHandle, settings: WriteImageSettings, bytes: Vec<u8> },
    SetViewport { viewports: Vec<Viewport> },
    SetScissor { scissors: Vec<ScissorRect> },
    SetLineWidth { width: f32 },
    SetPushConstantData { bytes: Vec<u8> },
    BuildRtxBlas { blas: ResourceHandle },
    BuildRtxTlas { tlas: ResourceHandle },
    /// An explicit buffer barrier the encoder records directly, distinct
    /// from the planner-synthesized image/buffer barriers of `sync.rs`.
    /// `write_to_buffer` uses this internally to fence the host-write into
    /// its scratch allocation against the transfer-read of the copy that
    /// follows it in the same stream.
    BufferMemoryBarrier { buffer: ResourceHandle, offset: u64, range: u64, src_stage: u32, dst_stage: u32, src_access: u32, dst_access: u32 },
}
