//! External collaborator seam.
//!
//! Physical device selection, logical device/queue creation, and surface
//! creation are explicitly out of scope: the host application owns an
//! `ash::Device` and its queues before this crate ever sees a frame. This
//! module is the narrow trait the frame orchestrator needs implemented
//! against whatever the host already built, plus the queue-family indices
//! it needs to know about.

use ash::vk;

#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

/// What the frame orchestrator needs from the host's Vulkan device. The
/// host implements this once over its own device wrapper; this crate never
/// constructs a `VkDevice`, `VkInstance`, or `VkSurfaceKHR` itself.
pub trait VulkanDevice {
    fn raw(&self) -> &ash::Device;
    fn physical_device_memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;
    fn queue_family_indices(&self) -> QueueFamilyIndices;
    fn graphics_queue(&self) -> vk::Queue;
    fn compute_queue(&self) -> vk::Queue;
    fn transfer_queue(&self) -> vk::Queue;
}

/// Picks a memory type index satisfying `type_bits` and `properties`.
/// The sub-allocators call through this to back their buffers. Mirrors the
/// standard Vulkan sample idiom for this lookup.
pub fn find_memory_type_index(memory_properties: &vk::PhysicalDeviceMemoryProperties, type_bits: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
    for i in 0..memory_properties.memory_type_count {
        let type_matches = (type_bits & (1 << i)) != 0;
        let properties_match = memory_properties.memory_types[i as usize].property_flags.contains(properties);
        if type_matches && properties_match {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_type_lookup_skips_non_matching_bits() {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties::default();
        memory_properties.memory_type_count = 2;
        memory_properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        memory_properties.memory_types[1].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let index = find_memory_type_index(&memory_properties, 0b10, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(index, Some(1));

        let none = find_memory_type_index(&memory_properties, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(none, None);
    }
}
