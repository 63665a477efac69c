//! Opaque typed resource identifiers.
//!
//! A handle is a small value type: identity equality over a hash of its
//! debug name (so two handles constructed from the same name in different
//! places always compare equal), plus meta bits for the virtual/staging
//! variants. Swapchain images get a distinguished root flag since writing
//! to the swapchain image is implicitly a root pass, and that has to be
//! checked without looking anything up.

use fxhash::FxHasher64;
use std::hash::{Hash, Hasher};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
    BottomLevelAccelerationStructure,
    TopLevelAccelerationStructure,
    TextureSampler,
}

impl ResourceKind {
    pub(crate) fn from_u8(value: u8) -> ResourceKind {
        match value {
            0 => ResourceKind::Buffer,
            1 => ResourceKind::Image,
            2 => ResourceKind::BottomLevelAccelerationStructure,
            3 => ResourceKind::TopLevelAccelerationStructure,
            4 => ResourceKind::TextureSampler,
            other => panic!("corrupt command stream: unknown resource kind {}", other),
        }
    }
}

/// Opaque identifier for a resource. Two handles are the same logical
/// resource iff their `id` fields match; `id` is a hash of the debug name
/// (and, for virtual/staging variants, the variant index) so that handles
/// constructed independently from the same name still compare equal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResourceHandle {
    id: u64,
    kind: ResourceKind,
    is_virtual: bool,
    is_staging: bool,
    is_root: bool,
    variant_index: u32,
}

impl ResourceHandle {
    fn hash_name(kind: ResourceKind, name: &str, variant_index: u32) -> u64 {
        let mut hasher = FxHasher64::default();
        kind.hash(&mut hasher);
        name.hash(&mut hasher);
        variant_index.hash(&mut hasher);
        hasher.finish()
    }

    pub fn new(kind: ResourceKind, name: &str) -> ResourceHandle {
        ResourceHandle {
            id: Self::hash_name(kind, name, 0),
            kind,
            is_virtual: false,
            is_staging: false,
            is_root: false,
            variant_index: 0,
        }
    }

    /// A per-pass scratch (virtual) buffer backed by the frame's linear
    /// sub-allocator. `variant_index` disambiguates multiple
    /// virtual allocations requested under the same debug name within a frame.
    pub fn virtual_buffer(name: &str, variant_index: u32) -> ResourceHandle {
        ResourceHandle {
            id: Self::hash_name(ResourceKind::Buffer, name, variant_index),
            kind: ResourceKind::Buffer,
            is_virtual: true,
            is_staging: false,
            is_root: false,
            variant_index,
        }
    }

    /// A one-shot host-visible upload buffer handed out by the staging
    /// allocator.
    pub fn staging_buffer(variant_index: u32) -> ResourceHandle {
        ResourceHandle {
            id: Self::hash_name(ResourceKind::Buffer, "__staging__", variant_index),
            kind: ResourceKind::Buffer,
            is_virtual: false,
            is_staging: true,
            is_root: false,
            variant_index,
        }
    }

    pub fn swapchain_image(name: &str) -> ResourceHandle {
        let mut handle = ResourceHandle::new(ResourceKind::Image, name);
        handle.is_root = true;
        handle
    }

    /// Reconstructs a handle from its wire representation. The decoder
    /// never learns a handle's original `kind` from
    /// the byte stream, since every command that carries one already
    /// constrains it by context (index/vertex/argument buffer, image
    /// write); callers pass the kind they expect instead of round-tripping
    /// it over the wire, so `is_image`/`is_buffer` downstream stay correct.
    pub(crate) fn from_wire(id: u64, kind: ResourceKind, is_virtual: bool, is_staging: bool, is_root: bool, variant_index: u32) -> ResourceHandle {
        ResourceHandle {
            id,
            kind,
            is_virtual,
            is_staging,
            is_root,
            variant_index,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn is_staging(&self) -> bool {
        self.is_staging
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Index into the virtual/staging variant vector.
    pub fn variant_index(&self) -> u32 {
        self.variant_index
    }

    pub fn is_image(&self) -> bool {
        self.kind == ResourceKind::Image
    }

    pub fn is_buffer(&self) -> bool {
        self.kind == ResourceKind::Buffer
    }
}

/// Convenience constructors matching the client-facing vocabulary for
/// declaring resources by name.
pub fn image_resource(name: &str) -> ResourceHandle {
    ResourceHandle::new(ResourceKind::Image, name)
}

pub fn buffer_resource(name: &str) -> ResourceHandle {
    ResourceHandle::new(ResourceKind::Buffer, name)
}

pub fn blas_resource(name: &str) -> ResourceHandle {
    ResourceHandle::new(ResourceKind::BottomLevelAccelerationStructure, name)
}

pub fn tlas_resource(name: &str) -> ResourceHandle {
    ResourceHandle::new(ResourceKind::TopLevelAccelerationStructure, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_names_are_distinct_handles() {
        assert_ne!(image_resource("A"), image_resource("B"));
    }

    #[test]
    fn same_name_is_the_same_handle() {
        assert_eq!(image_resource("A"), image_resource("A"));
        assert_eq!(image_resource("A").id(), image_resource("A").id());
    }

    #[test]
    fn virtual_variants_with_different_indices_differ() {
        assert_ne!(
            ResourceHandle::virtual_buffer("scratch", 0),
            ResourceHandle::virtual_buffer("scratch", 1)
        );
    }

    #[test]
    fn swapchain_image_is_flagged_root() {
        assert!(ResourceHandle::swapchain_image("present").is_root());
        assert!(!image_resource("offscreen").is_root());
    }
}
