//! Render module: client-facing accumulator of renderpasses and resource
//! declarations for one frame.

use std::collections::HashMap;

use crate::error::Result;
use crate::handle::ResourceHandle;
use crate::pass::RenderPass;
use crate::resource::ResourceInfo;

/// Ordered list of passes plus a declared-resource table.
#[derive(Default)]
pub struct RenderModule {
    passes: Vec<RenderPass>,
    declared_resources: HashMap<ResourceHandle, ResourceInfo>,
}

impl RenderModule {
    pub fn new() -> RenderModule {
        RenderModule {
            passes: Vec::new(),
            declared_resources: HashMap::new(),
        }
    }

    pub fn add_pass(&mut self, pass: RenderPass) {
        self.passes.push(pass);
    }

    /// Declares (or re-declares) a resource's desired properties. Usage
    /// flags/extents union across calls for the same handle.
    pub fn declare_resource(&mut self, handle: ResourceHandle, info: ResourceInfo) -> Result<()> {
        if let Some(existing) = self.declared_resources.get_mut(&handle) {
            let debug_name = format!("{:?}", handle);
            existing.merge(&info, &debug_name)?;
        } else {
            self.declared_resources.insert(handle, info);
        }
        Ok(())
    }

    pub fn passes(&self) -> &[RenderPass] {
        &self.passes
    }

    pub fn declared_resources(&self) -> &HashMap<ResourceHandle, ResourceInfo> {
        &self.declared_resources
    }

    /// Shares every pass by cloning its `Rc`, leaving this module reusable
    /// for the next frame's declarations.
    pub fn clone_for_frame(&self) -> (Vec<RenderPass>, HashMap<ResourceHandle, ResourceInfo>) {
        let passes = self.passes.iter().map(|p| p.share()).collect();
        (passes, self.declared_resources.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::image_resource;
    use crate::pass::QueueKind;
    use crate::resource::{ImageInfoBuilder, ResourceInfo};
    use ash::vk;

    #[test]
    fn declaring_the_same_resource_twice_unions_usage_flags() {
        let mut module = RenderModule::new();
        let handle = image_resource("gbuffer");
        module
            .declare_resource(handle, ResourceInfo::Image(ImageInfoBuilder::new().usage(vk::ImageUsageFlags::SAMPLED).build()))
            .unwrap();
        module
            .declare_resource(handle, ResourceInfo::Image(ImageInfoBuilder::new().usage(vk::ImageUsageFlags::STORAGE).build()))
            .unwrap();
        let info = module.declared_resources().get(&handle).unwrap().as_image().unwrap();
        assert!(info.usage.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(info.usage.contains(vk::ImageUsageFlags::STORAGE));
    }

    #[test]
    fn clone_for_frame_preserves_pass_count() {
        let mut module = RenderModule::new();
        module.add_pass(RenderPass::new("a", QueueKind::Graphics));
        module.add_pass(RenderPass::new("b", QueueKind::Compute));
        let (passes, _) = module.clone_for_frame();
        assert_eq!(passes.len(), 2);
    }
}
