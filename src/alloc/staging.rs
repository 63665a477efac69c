//! Staging allocator.
//!
//! Hands out ad-hoc host-visible transfer-source buffers for upload
//! commands. Thread-safe via an internal mutex because multiple pass
//! encoders may upload concurrently.

use std::sync::Mutex;

use crate::handle::ResourceHandle;

struct StagingBuffer {
    data: Vec<u8>,
}

struct Inner {
    buffers: Vec<StagingBuffer>,
}

/// Per-frame pool of host-visible upload buffers, reset wholesale at
/// frame-end.
pub struct StagingAllocator {
    inner: Mutex<Inner>,
}

impl StagingAllocator {
    pub fn new() -> StagingAllocator {
        StagingAllocator {
            inner: Mutex::new(Inner { buffers: Vec::new() }),
        }
    }

    /// Allocates a fresh staging buffer of `num_bytes`, returning a pointer
    /// to its host-visible memory and a handle marking it staging.
    pub fn map(&self, num_bytes: usize) -> (*mut u8, ResourceHandle) {
        let mut inner = self.inner.lock().expect("staging allocator mutex poisoned");
        let index = inner.buffers.len() as u32;
        inner.buffers.push(StagingBuffer {
            data: vec![0u8; num_bytes],
        });
        let ptr = inner.buffers[index as usize].data.as_mut_ptr();
        (ptr, ResourceHandle::staging_buffer(index))
    }

    /// Copies `bytes` into the staging buffer identified by `handle` and
    /// returns the byte range it now occupies, for tests and for the
    /// backend's byte-identical upload path.
    pub fn write(&self, handle: ResourceHandle, bytes: &[u8]) {
        debug_assert!(handle.is_staging());
        let mut inner = self.inner.lock().expect("staging allocator mutex poisoned");
        let buffer = &mut inner.buffers[staging_index(handle) as usize];
        buffer.data[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn read(&self, handle: ResourceHandle) -> Vec<u8> {
        debug_assert!(handle.is_staging());
        let inner = self.inner.lock().expect("staging allocator mutex poisoned");
        inner.buffers[staging_index(handle) as usize].data.clone()
    }

    /// Frees all staging allocations.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("staging allocator mutex poisoned");
        inner.buffers.clear();
    }

    pub fn allocation_count(&self) -> usize {
        self.inner.lock().expect("staging allocator mutex poisoned").buffers.len()
    }
}

fn staging_index(handle: ResourceHandle) -> u32 {
    handle.variant_index()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_write_then_read_round_trips() {
        let staging = StagingAllocator::new();
        let (_ptr, handle) = staging.map(4);
        staging.write(handle, &[1, 2, 3, 4]);
        assert_eq!(staging.read(handle), vec![1, 2, 3, 4]);
    }

    #[test]
    fn reset_clears_all_allocations() {
        let staging = StagingAllocator::new();
        staging.map(16);
        staging.map(32);
        assert_eq!(staging.allocation_count(), 2);
        staging.reset();
        assert_eq!(staging.allocation_count(), 0);
    }
}
