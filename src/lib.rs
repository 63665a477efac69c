//! `vkforge`: the core of a Vulkan frame-graph renderer.
//!
//! A declarative per-frame description of GPU work (resource handles,
//! render passes, a render module) is resolved into an execution plan
//! (dependency pruning, subgraph isolation, synchronization chains),
//! recorded through a self-describing command stream, and decoded by a
//! Vulkan backend at submission time. Window/surface creation, physical
//! device and queue selection, and the SPIR-V compiler frontend are the
//! host application's job; this crate only needs the seams in [`device`] and
//! [`backend::swapchain`].

pub mod alloc;
pub mod backend;
pub mod command;
pub mod device;
pub mod error;
pub mod graph;
pub mod handle;
pub mod module;
pub mod pass;
pub mod pipeline;
pub mod resource;
pub mod settings;
pub mod shader;
pub mod sync;

pub use backend::Backend;
pub use command::CommandEncoder;
pub use error::{GraphError, Result};
pub use handle::{blas_resource, buffer_resource, image_resource, tlas_resource, ResourceHandle, ResourceKind};
pub use module::RenderModule;
pub use pass::{QueueKind, RenderPass, RenderPassData};
pub use pipeline::PipelineManager;
pub use resource::{AccelerationStructureInfo, BufferInfo, ImageInfo, ImageInfoBuilder, ResourceInfo};
