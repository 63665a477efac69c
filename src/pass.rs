//! Renderpass object.
//!
//! Reference-counted because a renderpass instance is moved between the
//! client-facing render module and the frame's rendergraph; built with
//! `Rc<RefCell<..>>` rather than an intrusive count since this is a
//! single-threaded construction path (recording happens per-pass, not
//! across passes).

use std::cell::RefCell;
use std::rc::Rc;

use ash::vk;
use fxhash::FxHasher64;
use std::hash::{Hash, Hasher};

use crate::command::CommandEncoder;
use crate::error::{GraphError, Result};
use crate::handle::ResourceHandle;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageAttachment {
    pub handle: ResourceHandle,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: vk::ClearValue,
    pub is_depth_stencil: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SampledTexture {
    pub handle: ResourceHandle,
    pub sampler_info: vk::SamplerCreateInfo,
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceUse {
    pub handle: ResourceHandle,
    pub access_flags: vk::AccessFlags,
    pub is_read: bool,
    pub is_write: bool,
}

/// Setup callback: returns `false` to drop the pass from the frame during
/// resolution.
pub type SetupCallback = Rc<dyn Fn(&mut RenderPassData) -> bool>;
pub type ExecuteCallback = Rc<dyn Fn(&mut CommandEncoder)>;

/// The mutable template data cloned into each frame's rendergraph node.
pub struct RenderPassData {
    pub name: String,
    pub id: u64,
    pub queue_kind: QueueKind,
    pub width: u32,
    pub height: u32,
    pub sample_count: vk::SampleCountFlags,
    pub is_root: bool,
    pub uses: Vec<ResourceUse>,
    pub attachments: Vec<ImageAttachment>,
    pub sampled_textures: Vec<SampledTexture>,
    pub setup_callback: Option<SetupCallback>,
    pub execute_callbacks: Vec<ExecuteCallback>,
}

impl RenderPassData {
    fn new(name: &str, queue_kind: QueueKind) -> RenderPassData {
        let mut hasher = FxHasher64::default();
        name.hash(&mut hasher);
        RenderPassData {
            name: name.to_string(),
            id: hasher.finish(),
            queue_kind,
            width: 0,
            height: 0,
            sample_count: vk::SampleCountFlags::TYPE_1,
            is_root: false,
            uses: Vec::new(),
            attachments: Vec::new(),
            sampled_textures: Vec::new(),
            setup_callback: None,
            execute_callbacks: Vec::new(),
        }
    }

    /// Records the handle once; duplicate calls OR-combine access flags.
    pub fn use_resource(&mut self, handle: ResourceHandle, access_flags: vk::AccessFlags) {
        if let Some(existing) = self.uses.iter_mut().find(|u| u.handle == handle) {
            existing.access_flags |= access_flags;
            existing.is_read |= is_read_access(access_flags);
            existing.is_write |= is_write_access(access_flags, handle);
        } else {
            self.uses.push(ResourceUse {
                handle,
                access_flags,
                is_read: is_read_access(access_flags),
                is_write: is_write_access(access_flags, handle),
            });
        }
    }

    pub fn add_color_attachment(&mut self, handle: ResourceHandle, load_op: vk::AttachmentLoadOp, store_op: vk::AttachmentStoreOp, clear_value: vk::ClearValue) {
        self.add_attachment(handle, load_op, store_op, clear_value, false);
    }

    pub fn add_depth_stencil_attachment(&mut self, handle: ResourceHandle, load_op: vk::AttachmentLoadOp, store_op: vk::AttachmentStoreOp, clear_value: vk::ClearValue) {
        self.add_attachment(handle, load_op, store_op, clear_value, true);
    }

    /// Adding an image attachment implicitly calls `use_resource` with
    /// access derived from load/store ops.
    fn add_attachment(&mut self, handle: ResourceHandle, load_op: vk::AttachmentLoadOp, store_op: vk::AttachmentStoreOp, clear_value: vk::ClearValue, is_depth_stencil: bool) {
        let mut access = vk::AccessFlags::empty();
        if load_op == vk::AttachmentLoadOp::LOAD {
            access |= vk::AccessFlags::COLOR_ATTACHMENT_READ;
        }
        if store_op == vk::AttachmentStoreOp::STORE {
            access |= if is_depth_stencil {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            } else {
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            };
        }
        self.use_resource(handle, access);
        if handle.is_root() {
            self.is_root = true;
        }
        self.attachments.push(ImageAttachment { handle, load_op, store_op, clear_value, is_depth_stencil });
    }

    pub fn sample_texture(&mut self, handle: ResourceHandle, sampler_info: vk::SamplerCreateInfo) {
        self.use_resource(handle, vk::AccessFlags::SHADER_READ);
        self.sampled_textures.push(SampledTexture { handle, sampler_info });
    }

    pub fn set_is_root(&mut self, is_root: bool) {
        self.is_root = is_root;
    }

    pub fn set_width(&mut self, width: u32) {
        self.width = width;
    }

    pub fn set_height(&mut self, height: u32) {
        self.height = height;
    }

    pub fn set_sample_count(&mut self, sample_count: vk::SampleCountFlags) {
        self.sample_count = sample_count;
    }

    /// Only meaningful for graphics passes.
    pub fn framebuffer_settings(&self) -> Option<(u32, u32, vk::SampleCountFlags)> {
        if self.queue_kind == QueueKind::Graphics {
            Some((self.width, self.height, self.sample_count))
        } else {
            None
        }
    }

    /// Patches a zero width/height from the first swapchain-backed
    /// attachment's extent.
    pub fn patch_extent(&mut self, swapchain_extent: (u32, u32)) -> Result<()> {
        if self.width != 0 && self.height != 0 {
            return Ok(());
        }
        let has_swapchain_attachment = self.attachments.iter().any(|a| a.handle.is_root());
        if !has_swapchain_attachment {
            return Err(GraphError::ExtentInferenceFailed { pass: self.name.clone() });
        }
        self.width = swapchain_extent.0;
        self.height = swapchain_extent.1;
        Ok(())
    }
}

fn is_read_access(flags: vk::AccessFlags) -> bool {
    flags.intersects(
        vk::AccessFlags::SHADER_READ
            | vk::AccessFlags::COLOR_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags::TRANSFER_READ
            | vk::AccessFlags::UNIFORM_READ
            | vk::AccessFlags::INDEX_READ
            | vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
    )
}

/// Images using shader-read are conservatively considered read+write
/// because a layout transition may be required.
fn is_write_access(flags: vk::AccessFlags, handle: ResourceHandle) -> bool {
    let write_bits = flags.intersects(
        vk::AccessFlags::SHADER_WRITE
            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            | vk::AccessFlags::TRANSFER_WRITE
            | vk::AccessFlags::HOST_WRITE,
    );
    let conservative_image_read = handle.is_image() && flags.contains(vk::AccessFlags::SHADER_READ);
    write_bits || conservative_image_read
}

/// Client-facing builder. Construction clones a template; the clone is what moves, by value, into
/// the frame's rendergraph, while the `Rc` lets the client hold its own
/// handle to the same pass for the lifetime of the render module.
pub struct RenderPass {
    inner: Rc<RefCell<RenderPassData>>,
}

impl RenderPass {
    pub fn new(name: &str, kind: QueueKind) -> RenderPass {
        RenderPass {
            inner: Rc::new(RefCell::new(RenderPassData::new(name, kind))),
        }
    }

    pub fn set_setup_callback(self, callback: impl Fn(&mut RenderPassData) -> bool + 'static) -> Self {
        self.inner.borrow_mut().setup_callback = Some(Rc::new(callback));
        self
    }

    pub fn set_execute_callback(self, callback: impl Fn(&mut CommandEncoder) + 'static) -> Self {
        self.inner.borrow_mut().execute_callbacks.push(Rc::new(callback));
        self
    }

    pub fn add_color_attachment(self, handle: ResourceHandle, load_op: vk::AttachmentLoadOp, store_op: vk::AttachmentStoreOp, clear_value: vk::ClearValue) -> Self {
        self.inner.borrow_mut().add_color_attachment(handle, load_op, store_op, clear_value);
        self
    }

    pub fn add_depth_stencil_attachment(self, handle: ResourceHandle, load_op: vk::AttachmentLoadOp, store_op: vk::AttachmentStoreOp, clear_value: vk::ClearValue) -> Self {
        self.inner.borrow_mut().add_depth_stencil_attachment(handle, load_op, store_op, clear_value);
        self
    }

    pub fn use_image_resource(self, handle: ResourceHandle, access_flags: vk::AccessFlags) -> Self {
        self.inner.borrow_mut().use_resource(handle, access_flags);
        self
    }

    pub fn use_buffer_resource(self, handle: ResourceHandle, access_flags: vk::AccessFlags) -> Self {
        self.inner.borrow_mut().use_resource(handle, access_flags);
        self
    }

    pub fn sample_texture(self, handle: ResourceHandle, sampler_info: vk::SamplerCreateInfo) -> Self {
        self.inner.borrow_mut().sample_texture(handle, sampler_info);
        self
    }

    pub fn set_is_root(self, is_root: bool) -> Self {
        self.inner.borrow_mut().set_is_root(is_root);
        self
    }

    pub fn set_width(self, width: u32) -> Self {
        self.inner.borrow_mut().set_width(width);
        self
    }

    pub fn set_height(self, height: u32) -> Self {
        self.inner.borrow_mut().set_height(height);
        self
    }

    pub fn set_sample_count(self, sample_count: vk::SampleCountFlags) -> Self {
        self.inner.borrow_mut().set_sample_count(sample_count);
        self
    }

    /// Clones the `Rc`: a renderpass instance is shared between the client
    /// builder and the frame rendergraph.
    pub fn share(&self) -> RenderPass {
        RenderPass { inner: self.inner.clone() }
    }

    pub fn data(&self) -> std::cell::Ref<RenderPassData> {
        self.inner.borrow()
    }

    pub fn data_mut(&self) -> std::cell::RefMut<RenderPassData> {
        self.inner.borrow_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{buffer_resource, image_resource};

    #[test]
    fn duplicate_use_resource_calls_or_combine_access_flags() {
        let mut data = RenderPassData::new("test", QueueKind::Graphics);
        let buf = buffer_resource("ubo");
        data.use_resource(buf, vk::AccessFlags::SHADER_READ);
        data.use_resource(buf, vk::AccessFlags::SHADER_WRITE);
        let recorded = data.uses.iter().find(|u| u.handle == buf).unwrap();
        assert_eq!(recorded.access_flags, vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);
    }

    #[test]
    fn writing_the_swapchain_image_marks_the_pass_root() {
        let mut data = RenderPassData::new("present", QueueKind::Graphics);
        let swapchain = ResourceHandle::swapchain_image("backbuffer");
        data.add_color_attachment(swapchain, vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::STORE, vk::ClearValue::default());
        assert!(data.is_root);
    }

    #[test]
    fn shader_read_on_an_image_is_conservatively_read_and_write() {
        let mut data = RenderPassData::new("blur", QueueKind::Compute);
        let img = image_resource("input");
        data.use_resource(img, vk::AccessFlags::SHADER_READ);
        let recorded = data.uses.iter().find(|u| u.handle == img).unwrap();
        assert!(recorded.is_read);
        assert!(recorded.is_write);
    }

    #[test]
    fn zero_extent_without_swapchain_attachment_fails_to_patch() {
        let mut data = RenderPassData::new("offscreen", QueueKind::Graphics);
        assert!(data.patch_extent((1920, 1080)).is_err());
    }

    #[test]
    fn zero_extent_with_swapchain_attachment_patches_from_swapchain() {
        let mut data = RenderPassData::new("present", QueueKind::Graphics);
        let swapchain = ResourceHandle::swapchain_image("backbuffer");
        data.add_color_attachment(swapchain, vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::STORE, vk::ClearValue::default());
        data.patch_extent((1920, 1080)).unwrap();
        assert_eq!((data.width, data.height), (1920, 1080));
    }
}
