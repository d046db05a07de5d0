//! Plain descriptions exchanged across the device boundary

use super::flags::{ImageUsage, ShaderStages};
use super::format::GpuFormat;
use super::handles::{
    BufferHandle, CommandBufferHandle, DescriptorSetLayoutHandle, FenceHandle, ImageViewHandle,
    SamplerHandle, SemaphoreHandle,
};

/// Descriptor kinds every pool is sized for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Uniform buffer
    UniformBuffer,
    /// Storage buffer
    StorageBuffer,
    /// Combined image + sampler
    CombinedImageSampler,
    /// Input attachment
    InputAttachment,
}

impl DescriptorKind {
    /// The fixed pool catalog
    pub const ALL: [Self; 4] = [
        Self::UniformBuffer,
        Self::StorageBuffer,
        Self::CombinedImageSampler,
        Self::InputAttachment,
    ];
}

/// One binding of a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    /// Binding index in the set
    pub binding: u32,
    /// Descriptor kind
    pub kind: DescriptorKind,
    /// Array length
    pub count: u32,
    /// Visible stages
    pub stages: ShaderStages,
}

/// Descriptor budget of one kind in a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    /// Descriptor kind
    pub kind: DescriptorKind,
    /// Number of descriptors of this kind
    pub count: u32,
}

/// What a descriptor binding should point at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorWrite {
    /// A region of a buffer
    Buffer {
        /// Uniform or storage
        kind: DescriptorKind,
        /// Source buffer
        buffer: BufferHandle,
        /// Byte offset
        offset: u64,
        /// Byte range
        range: u64,
    },
    /// A sampled image
    Image {
        /// Image view
        view: ImageViewHandle,
        /// Sampler
        sampler: SamplerHandle,
    },
    /// An input attachment
    InputAttachment {
        /// Attachment view
        view: ImageViewHandle,
    },
}

/// Width/height pair in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

impl Extent2D {
    /// New extent
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either dimension is zero (minimised window)
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Aspect of an image a view covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageAspect {
    /// Colour
    Color,
    /// Depth only
    Depth,
    /// Depth and stencil
    DepthStencil,
}

impl ImageAspect {
    /// Natural aspect of a format
    #[must_use]
    pub const fn for_format(format: GpuFormat) -> Self {
        if format.has_stencil() {
            Self::DepthStencil
        } else if format.is_depth() {
            Self::Depth
        } else {
            Self::Color
        }
    }
}

/// Description of a 2D image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Size
    pub extent: Extent2D,
    /// Format
    pub format: GpuFormat,
    /// Usage
    pub usage: ImageUsage,
    /// MSAA sample count
    pub samples: u32,
}

/// Attachment layout of a single-subpass render pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassDesc {
    /// Colour attachment formats
    pub color_formats: Vec<GpuFormat>,
    /// Optional depth attachment
    pub depth_format: Option<GpuFormat>,
    /// Sample count of colour and depth attachments
    pub samples: u32,
    /// Resolve the first colour attachment into a single-sampled target
    pub resolve: bool,
    /// Final colour layout is presentable rather than shader-readable
    pub present: bool,
}

/// Clear value for one attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Colour clear
    Color([f32; 4]),
    /// Depth/stencil clear
    DepthStencil {
        /// Depth value
        depth: f32,
        /// Stencil value
        stencil: u32,
    },
}

/// Pipeline stage a semaphore wait blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Start of the pipeline
    TopOfPipe,
    /// Vertex input and vertex shading
    VertexShader,
    /// Fragment shading
    FragmentShader,
    /// Colour attachment writes
    ColorAttachmentOutput,
    /// Compute shading
    ComputeShader,
    /// Transfers
    Transfer,
}

/// Bind point for pipelines and descriptor sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPoint {
    /// Graphics
    Graphics,
    /// Compute
    Compute,
}

/// Global memory barriers the core inserts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBarrier {
    /// Compute shader writes become visible to vertex input and vertex/fragment shader reads
    ComputeWriteToGraphicsRead,
    /// Host writes become visible to shader reads
    HostWriteToShaderRead,
    /// Transfer writes become visible to shader reads
    TransferWriteToShaderRead,
}

/// Compute dispatch size in workgroups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workgroups {
    /// X count
    pub x: u32,
    /// Y count
    pub y: u32,
    /// Z count
    pub z: u32,
}

impl Workgroups {
    /// New dispatch size
    #[must_use]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

/// One queue submission
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    /// Command buffers in execution order
    pub command_buffers: &'a [CommandBufferHandle],
    /// Semaphores to wait on and the stage each wait blocks
    pub wait: &'a [(SemaphoreHandle, PipelineStage)],
    /// Semaphores to signal
    pub signal: &'a [SemaphoreHandle],
    /// Fence to signal, or null
    pub fence: FenceHandle,
}

/// Result of asking the surface for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired
    Acquired {
        /// Swapchain image index
        image_index: u32,
        /// The swapchain still works but no longer matches the surface
        suboptimal: bool,
    },
    /// The swapchain must be rebuilt before anything can be acquired
    OutOfDate,
}

/// Result of presenting an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally
    Presented,
    /// Presented, but the swapchain should be rebuilt
    Suboptimal,
    /// Not presented, the swapchain must be rebuilt
    OutOfDate,
}

/// Device limits the core depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Minimum offset alignment for storage buffer bindings
    pub min_storage_buffer_offset_alignment: u64,
    /// Minimum offset alignment for uniform buffer bindings
    pub min_uniform_buffer_offset_alignment: u64,
    /// Largest 2D image dimension
    pub max_image_dimension_2d: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_storage_buffer_offset_alignment: 256,
            min_uniform_buffer_offset_alignment: 256,
            max_image_dimension_2d: 4096,
        }
    }
}

/// Compute pipeline creation input
#[derive(Debug, Clone, Copy)]
pub struct ComputePipelineDesc<'a> {
    /// SPIR-V bytecode
    pub spirv: &'a [u8],
    /// Entry point name
    pub entry_point: &'a str,
    /// Descriptor set layouts in set order
    pub set_layouts: &'a [DescriptorSetLayoutHandle],
}
