//! Declarative resource descriptions.

use ash::vk;

use crate::error::{GraphError, Result};
use crate::handle::ResourceHandle;

/// Image description. `extent` may be `(0, 0)` at declaration time for
/// render targets; the resolver patches it in.
#[derive(Debug, Clone, Copy)]
pub struct ImageInfo {
    pub create_flags: vk::ImageCreateFlags,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
}

impl Default for ImageInfo {
    fn default() -> ImageInfo {
        ImageInfo {
            create_flags: vk::ImageCreateFlags::empty(),
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::UNDEFINED,
            width: 0,
            height: 0,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::empty(),
        }
    }
}

/// Builder with an additive-flag-merging construction style: each `usage`
/// call ORs into the accumulated flags rather than replacing them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageInfoBuilder(ImageInfo);

impl ImageInfoBuilder {
    pub fn new() -> ImageInfoBuilder {
        ImageInfoBuilder(ImageInfo::default())
    }

    pub fn extent(mut self, width: u32, height: u32) -> Self {
        self.0.width = width;
        self.0.height = height;
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.0.depth = depth;
        self
    }

    pub fn format(mut self, format: vk::Format) -> Self {
        self.0.format = format;
        self
    }

    pub fn mip_levels(mut self, mips: u32) -> Self {
        self.0.mip_levels = mips;
        self
    }

    pub fn array_layers(mut self, layers: u32) -> Self {
        self.0.array_layers = layers;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.0.samples = samples;
        self
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.0.usage |= usage;
        self
    }

    pub fn build(self) -> ImageInfo {
        self.0
    }
}

impl ImageInfo {
    /// Combines two declarations of the same logical resource. Usage flags
    /// OR; extents/mips/layers take the max; formats must match or one side
    /// must be `UNDEFINED`.
    pub fn merge(&mut self, other: &ImageInfo, resource_name: &str) -> Result<()> {
        self.usage |= other.usage;
        self.create_flags |= other.create_flags;
        self.width = self.width.max(other.width);
        self.height = self.height.max(other.height);
        self.depth = self.depth.max(other.depth);
        self.mip_levels = self.mip_levels.max(other.mip_levels);
        self.array_layers = self.array_layers.max(other.array_layers);
        if sample_count_value(self.samples) < sample_count_value(other.samples) {
            self.samples = other.samples;
        }

        match (self.format, other.format) {
            (a, vk::Format::UNDEFINED) if a != vk::Format::UNDEFINED => {}
            (vk::Format::UNDEFINED, b) => self.format = b,
            (a, b) if a == b => {}
            (a, b) => {
                return Err(GraphError::ResourceInfoConflict {
                    resource: resource_name.to_string(),
                    message: format!("conflicting explicit formats {:?} and {:?}", a, b),
                })
            }
        }
        Ok(())
    }

    /// Infers a concrete format from usage flags when none was specified
    /// explicitly; failure to infer one is fatal rather than defaulted.
    pub fn resolve_format(&mut self, resource_name: &str) -> Result<()> {
        if self.format != vk::Format::UNDEFINED {
            return Ok(());
        }
        self.format = if self.usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
            vk::Format::D32_SFLOAT
        } else if self.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            || self.usage.contains(vk::ImageUsageFlags::STORAGE)
            || self.usage.contains(vk::ImageUsageFlags::SAMPLED)
        {
            vk::Format::R8G8B8A8_UNORM
        } else {
            return Err(GraphError::FormatInferenceFailed {
                resource: resource_name.to_string(),
            });
        };
        Ok(())
    }
}

fn sample_count_value(samples: vk::SampleCountFlags) -> u32 {
    samples.as_raw()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferInfo {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
}

impl BufferInfo {
    pub fn new(size: u64, usage: vk::BufferUsageFlags) -> BufferInfo {
        BufferInfo { size, usage }
    }

    pub fn merge(&mut self, other: &BufferInfo) {
        self.size = self.size.max(other.size);
        self.usage |= other.usage;
    }
}

/// Opaque payload for acceleration-structure build inputs. The frame graph
/// itself never inspects the contents; it is forwarded verbatim to the
/// backend's ray tracing command recorder.
#[derive(Debug, Clone)]
pub enum RtxBuildInfo {
    Blas {
        vertex_buffer: ResourceHandle,
        index_buffer: Option<ResourceHandle>,
        vertex_count: u32,
        triangle_count: u32,
    },
    Tlas {
        instance_buffer: ResourceHandle,
        instance_count: u32,
    },
}

#[derive(Debug, Clone)]
pub struct AccelerationStructureInfo {
    pub build_info: RtxBuildInfo,
    pub usage: vk::BufferUsageFlags,
}

/// Declarative description keyed by handle, unioned across all uses before
/// physical allocation.
#[derive(Debug, Clone)]
pub enum ResourceInfo {
    Image(ImageInfo),
    Buffer(BufferInfo),
    AccelerationStructure(AccelerationStructureInfo),
}

impl ResourceInfo {
    pub fn merge(&mut self, other: &ResourceInfo, resource_name: &str) -> Result<()> {
        match (self, other) {
            (ResourceInfo::Image(a), ResourceInfo::Image(b)) => a.merge(b, resource_name),
            (ResourceInfo::Buffer(a), ResourceInfo::Buffer(b)) => {
                a.merge(b);
                Ok(())
            }
            (ResourceInfo::AccelerationStructure(a), ResourceInfo::AccelerationStructure(b)) => {
                a.usage |= b.usage;
                Ok(())
            }
            _ => Err(GraphError::ResourceInfoConflict {
                resource: resource_name.to_string(),
                message: "resource kind mismatch between declarations".to_string(),
            }),
        }
    }

    pub fn as_image(&self) -> Option<&ImageInfo> {
        match self {
            ResourceInfo::Image(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_image_mut(&mut self) -> Option<&mut ImageInfo> {
        match self {
            ResourceInfo::Image(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&BufferInfo> {
        match self {
            ResourceInfo::Buffer(info) => Some(info),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_flags_union_on_merge() {
        let mut a = ImageInfo {
            usage: vk::ImageUsageFlags::SAMPLED,
            ..ImageInfo::default()
        };
        let b = ImageInfo {
            usage: vk::ImageUsageFlags::STORAGE,
            ..ImageInfo::default()
        };
        a.merge(&b, "tex").unwrap();
        assert!(a.usage.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(a.usage.contains(vk::ImageUsageFlags::STORAGE));
    }

    #[test]
    fn extent_merge_takes_max() {
        let mut a = ImageInfoBuilder::new().extent(0, 0).build();
        let b = ImageInfoBuilder::new().extent(1024, 768).build();
        a.merge(&b, "rt").unwrap();
        assert_eq!((a.width, a.height), (1024, 768));
    }

    #[test]
    fn conflicting_explicit_formats_are_an_error() {
        let mut a = ImageInfoBuilder::new().format(vk::Format::R8G8B8A8_UNORM).build();
        let b = ImageInfoBuilder::new().format(vk::Format::B8G8R8A8_UNORM).build();
        assert!(a.merge(&b, "tex").is_err());
    }

    #[test]
    fn undefined_side_yields_to_explicit_format() {
        let mut a = ImageInfoBuilder::new().build();
        let b = ImageInfoBuilder::new().format(vk::Format::R8G8B8A8_UNORM).build();
        a.merge(&b, "tex").unwrap();
        assert_eq!(a.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn format_inference_from_usage_succeeds_for_color_attachment() {
        let mut info = ImageInfoBuilder::new()
            .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .build();
        info.resolve_format("rt").unwrap();
        assert_eq!(info.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn format_inference_fails_without_a_usable_usage_bit() {
        let mut info = ImageInfoBuilder::new()
            .usage(vk::ImageUsageFlags::TRANSFER_DST)
            .build();
        assert!(info.resolve_format("rt").is_err());
    }
}
