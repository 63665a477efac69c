//! Per-frame scratch allocators.

pub mod linear;
pub mod staging;

pub use linear::{Allocation, LinearAllocator, DEFAULT_ALIGNMENT};
pub use staging::StagingAllocator;
