//! Error types for device-level operations

use std::fmt;
use thiserror::Error;

use super::flags::MemoryProperties;
use super::format::GpuFormat;

/// Kind of GPU object an operation was working on, used for error context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Buffer
    Buffer,
    /// Device memory allocation
    Memory,
    /// Image
    Image,
    /// Image view
    ImageView,
    /// Sampler
    Sampler,
    /// Descriptor set layout
    DescriptorSetLayout,
    /// Descriptor pool
    DescriptorPool,
    /// Descriptor set
    DescriptorSet,
    /// Render pass
    RenderPass,
    /// Framebuffer
    Framebuffer,
    /// Fence
    Fence,
    /// Semaphore
    Semaphore,
    /// Command buffer
    CommandBuffer,
    /// Shader module
    ShaderModule,
    /// Pipeline or pipeline layout
    Pipeline,
    /// Swapchain
    Swapchain,
    /// Presentation surface
    Surface,
    /// Queue submission
    Submission,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Buffer => "buffer",
            Self::Memory => "memory",
            Self::Image => "image",
            Self::ImageView => "image view",
            Self::Sampler => "sampler",
            Self::DescriptorSetLayout => "descriptor set layout",
            Self::DescriptorPool => "descriptor pool",
            Self::DescriptorSet => "descriptor set",
            Self::RenderPass => "render pass",
            Self::Framebuffer => "framebuffer",
            Self::Fence => "fence",
            Self::Semaphore => "semaphore",
            Self::CommandBuffer => "command buffer",
            Self::ShaderModule => "shader module",
            Self::Pipeline => "pipeline",
            Self::Swapchain => "swapchain",
            Self::Surface => "surface",
            Self::Submission => "queue submission",
        };
        f.write_str(name)
    }
}

/// Which heap an out-of-memory condition came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryDomain {
    /// CPU-side allocation
    Host,
    /// GPU-side allocation
    Device,
}

impl fmt::Display for MemoryDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Device => f.write_str("device"),
        }
    }
}

/// Errors produced by the device abstraction and the frame core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GpuError {
    /// Descriptor pool has no room left; the allocator retries in a new pool
    #[error("descriptor pool exhausted")]
    OutOfPoolMemory,

    /// Allocation failed on the given heap
    #[error("out of {domain} memory creating {kind} ({requested} bytes)")]
    OutOfMemory {
        /// Heap the allocation came from
        domain: MemoryDomain,
        /// Object being created
        kind: ResourceKind,
        /// Requested size in bytes, 0 when not applicable
        requested: u64,
    },

    /// No memory type satisfies the requested properties
    #[error("no memory type with {properties:?} for {kind}")]
    NoSuitableMemoryType {
        /// Object being created
        kind: ResourceKind,
        /// Requested memory properties
        properties: MemoryProperties,
    },

    /// The device cannot use the requested format
    #[error("format {0:?} is not supported by the device")]
    UnsupportedFormat(GpuFormat),

    /// The swapchain no longer matches the surface
    #[error("swapchain is out of date")]
    OutOfDate,

    /// The presentation surface was lost
    #[error("presentation surface lost")]
    SurfaceLost,

    /// The logical device was lost
    #[error("device lost")]
    DeviceLost,

    /// A bounded wait expired
    #[error("timed out waiting for {0}")]
    Timeout(ResourceKind),

    /// Any other creation failure
    #[error("{kind} creation failed: {reason}")]
    Creation {
        /// Object being created
        kind: ResourceKind,
        /// Backend-provided description
        reason: String,
    },

    /// The call is not valid in the current state
    #[error("invalid operation: {reason}")]
    InvalidOperation {
        /// Why the operation was rejected
        reason: String,
    },

    /// Backend start-up failed
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
}

impl GpuError {
    /// Whether the error means the swapchain must be rebuilt
    #[must_use]
    pub const fn is_swapchain_stale(&self) -> bool {
        matches!(self, Self::OutOfDate)
    }
}

/// Result type for device operations
pub type GpuResult<T> = Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_message_carries_context() {
        let err = GpuError::OutOfMemory {
            domain: MemoryDomain::Device,
            kind: ResourceKind::Buffer,
            requested: 4096,
        };
        let message = err.to_string();
        assert!(message.contains("device"));
        assert!(message.contains("buffer"));
        assert!(message.contains("4096"));
    }

    #[test]
    fn only_out_of_date_marks_swapchain_stale() {
        assert!(GpuError::OutOfDate.is_swapchain_stale());
        assert!(!GpuError::DeviceLost.is_swapchain_stale());
        assert!(!GpuError::OutOfPoolMemory.is_swapchain_stale());
    }
}
