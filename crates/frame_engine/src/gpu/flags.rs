//! Backend-neutral usage and property flags

use bitflags::bitflags;

bitflags! {
    /// How a buffer will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Per-vertex or per-instance vertex input
        const VERTEX = 1 << 0;
        /// Index input
        const INDEX = 1 << 1;
        /// Uniform buffer binding
        const UNIFORM = 1 << 2;
        /// Storage buffer binding
        const STORAGE = 1 << 3;
        /// Source of a transfer
        const TRANSFER_SRC = 1 << 4;
        /// Destination of a transfer
        const TRANSFER_DST = 1 << 5;
    }
}

bitflags! {
    /// Required properties of the memory backing a resource
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        /// Fast GPU-local memory
        const DEVICE_LOCAL = 1 << 0;
        /// Mappable by the CPU
        const HOST_VISIBLE = 1 << 1;
        /// CPU writes visible without explicit flushes
        const HOST_COHERENT = 1 << 2;
        /// CPU-cached
        const HOST_CACHED = 1 << 3;
    }
}

impl MemoryProperties {
    /// Persistently mapped, CPU-written memory used for per-frame data
    pub const HOST_STREAMING: Self = Self::HOST_VISIBLE.union(Self::HOST_COHERENT);
}

bitflags! {
    /// How an image will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        /// Colour attachment
        const COLOR_ATTACHMENT = 1 << 0;
        /// Depth/stencil attachment
        const DEPTH_STENCIL_ATTACHMENT = 1 << 1;
        /// Sampled from shaders
        const SAMPLED = 1 << 2;
        /// Destination of a transfer
        const TRANSFER_DST = 1 << 3;
        /// Input attachment of a later subpass
        const INPUT_ATTACHMENT = 1 << 4;
        /// Contents never leave tile memory
        const TRANSIENT = 1 << 5;
    }
}

bitflags! {
    /// Shader stages a binding is visible to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        /// Vertex stage
        const VERTEX = 1 << 0;
        /// Fragment stage
        const FRAGMENT = 1 << 1;
        /// Compute stage
        const COMPUTE = 1 << 2;
        /// Both graphics stages
        const GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}
