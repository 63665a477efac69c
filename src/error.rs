//! Crate-wide error type for construction-time failures.
//!
//! Per-frame failures (skipped draws, dropped uploads, rolled-back shader
//! reloads) never surface as `GraphError`: they are logged and the affected
//! operation is degraded in place instead.

use std::fmt;

#[derive(Debug, Clone)]
pub enum GraphError {
    /// Shader source failed to compile or SPIR-V reflection failed.
    ShaderCompile { path: String, message: String },
    /// Two shader stages declared incompatible bindings at the same (set, binding).
    BindingConflict { set: u32, binding: u32, message: String },
    /// Two resource declarations for the same handle disagree on format.
    ResourceInfoConflict { resource: String, message: String },
    /// A render-target image's format could not be inferred from usage flags.
    FormatInferenceFailed { resource: String },
    /// A pass with a zero width/height has no swapchain-backed attachment to infer extent from.
    ExtentInferenceFailed { pass: String },
    /// Swapchain image acquisition failed; caller should rebuild the swapchain and retry.
    SwapchainAcquireFailed { message: String },
    /// Too many distinct resources for the fixed-width bitset resolver.
    TooManyResources { max: usize },
    /// A requested operation needs a capability this build doesn't carry
    /// (e.g. an extension loader the host application didn't wire up).
    Unsupported { message: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GraphError::ShaderCompile { path, message } => {
                write!(f, "shader compile error in '{}': {}", path, message)
            }
            GraphError::BindingConflict { set, binding, message } => write!(
                f,
                "descriptor binding conflict at (set={}, binding={}): {}",
                set, binding, message
            ),
            GraphError::ResourceInfoConflict { resource, message } => {
                write!(f, "resource info conflict for '{}': {}", resource, message)
            }
            GraphError::FormatInferenceFailed { resource } => {
                write!(f, "could not infer image format for '{}'", resource)
            }
            GraphError::ExtentInferenceFailed { pass } => write!(
                f,
                "pass '{}' has width/height == 0 and no swapchain-backed attachment to infer it from",
                pass
            ),
            GraphError::SwapchainAcquireFailed { message } => {
                write!(f, "swapchain acquire failed: {}", message)
            }
            GraphError::TooManyResources { max } => {
                write!(f, "frame uses more than the maximum of {} distinct resources", max)
            }
            GraphError::Unsupported { message } => write!(f, "unsupported: {}", message),
        }
    }
}

impl std::error::Error for GraphError {}

pub type Result<T> = std::result::Result<T, GraphError>;
