//! Swapchain abstraction.
//!
//! Acquire/present plumbing only; selecting a present mode, surface format,
//! or rebuilding the swapchain on resize is the host application's job.

use ash::extensions::khr;
use ash::vk;

use crate::error::{GraphError, Result};

pub struct SwapchainImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

/// A thin wrapper over a `VK_KHR_swapchain` handle and its images, owned by
/// the host application and handed to the frame orchestrator by reference.
pub struct Swapchain {
    loader: khr::Swapchain,
    handle: vk::SwapchainKHR,
    images: Vec<SwapchainImage>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(loader: khr::Swapchain, handle: vk::SwapchainKHR, images: Vec<SwapchainImage>, format: vk::Format, extent: vk::Extent2D) -> Swapchain {
        Swapchain { loader, handle, images, format, extent }
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_at(&self, index: u32) -> &SwapchainImage {
        &self.images[index as usize]
    }

    /// Acquires the next image, signalling `semaphore` when it is ready.
    /// A failure here means the caller should rebuild the swapchain and
    /// retry next frame, not abort.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<u32> {
        unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
                .map(|(index, _suboptimal)| index)
                .map_err(|e| GraphError::SwapchainAcquireFailed { message: format!("{:?}", e) })
        }
    }

    /// Presents `image_index`, waiting on `wait_semaphore` (the
    /// render-complete semaphore).
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<()> {
        let wait = [wait_semaphore];
        let swapchains = [self.handle];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices)
            .build();
        unsafe {
            self.loader
                .queue_present(queue, &present_info)
                .map(|_suboptimal| ())
                .map_err(|e| GraphError::SwapchainAcquireFailed { message: format!("present failed: {:?}", e) })
        }
    }
}
