//! Translation between the backend-neutral GPU types and `ash::vk`

use ash::vk;

use crate::gpu::{
    BufferUsage, ClearValue, DescriptorKind, GpuError, GpuFormat, ImageAspect, ImageUsage, MemoryBarrier,
    MemoryDomain, MemoryProperties, PipelineStage, ResourceKind, ShaderStages,
};

/// `vk::Format` for every [`GpuFormat`], indexed by discriminant
const FORMATS: [vk::Format; GpuFormat::COUNT] = [
    vk::Format::UNDEFINED,
    vk::Format::R8_UNORM,
    vk::Format::R8G8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::A2B10G10R10_UNORM_PACK32,
    vk::Format::R16G16B16A16_SFLOAT,
    vk::Format::R32_SFLOAT,
    vk::Format::R32G32_SFLOAT,
    vk::Format::R32G32B32_SFLOAT,
    vk::Format::R32G32B32A32_SFLOAT,
    vk::Format::D16_UNORM,
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
];

/// Vulkan format of `format`
#[must_use]
pub const fn format_to_vk(format: GpuFormat) -> vk::Format {
    FORMATS[format.index()]
}

/// Neutral format for a Vulkan format, if the core knows it
#[must_use]
pub fn format_from_vk(format: vk::Format) -> Option<GpuFormat> {
    FORMATS
        .iter()
        .position(|&candidate| candidate == format)
        .and_then(GpuFormat::from_index)
}

/// Buffer usage flags
#[must_use]
pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    for (ours, theirs) in [
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

/// Image usage flags
#[must_use]
pub fn image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    for (ours, theirs) in [
        (ImageUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (ImageUsage::DEPTH_STENCIL_ATTACHMENT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
        (ImageUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
        (ImageUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
        (ImageUsage::INPUT_ATTACHMENT, vk::ImageUsageFlags::INPUT_ATTACHMENT),
        (ImageUsage::TRANSIENT, vk::ImageUsageFlags::TRANSIENT_ATTACHMENT),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

/// Format features an optimally tiled image needs for `usage`
#[must_use]
pub fn required_format_features(usage: ImageUsage) -> vk::FormatFeatureFlags {
    let mut features = vk::FormatFeatureFlags::empty();
    if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
        features |= vk::FormatFeatureFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
        features |= vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(ImageUsage::SAMPLED) {
        features |= vk::FormatFeatureFlags::SAMPLED_IMAGE;
    }
    features
}

/// Memory property flags
#[must_use]
pub fn memory_properties(properties: MemoryProperties) -> vk::MemoryPropertyFlags {
    let mut flags = vk::MemoryPropertyFlags::empty();
    for (ours, theirs) in [
        (MemoryProperties::DEVICE_LOCAL, vk::MemoryPropertyFlags::DEVICE_LOCAL),
        (MemoryProperties::HOST_VISIBLE, vk::MemoryPropertyFlags::HOST_VISIBLE),
        (MemoryProperties::HOST_COHERENT, vk::MemoryPropertyFlags::HOST_COHERENT),
        (MemoryProperties::HOST_CACHED, vk::MemoryPropertyFlags::HOST_CACHED),
    ] {
        if properties.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

/// Shader stage flags
#[must_use]
pub fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

/// Descriptor type
#[must_use]
pub const fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorKind::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
    }
}

/// Pipeline stage a semaphore wait blocks
#[must_use]
pub const fn pipeline_stage(stage: PipelineStage) -> vk::PipelineStageFlags {
    match stage {
        PipelineStage::TopOfPipe => vk::PipelineStageFlags::TOP_OF_PIPE,
        PipelineStage::VertexShader => vk::PipelineStageFlags::VERTEX_SHADER,
        PipelineStage::FragmentShader => vk::PipelineStageFlags::FRAGMENT_SHADER,
        PipelineStage::ColorAttachmentOutput => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        PipelineStage::ComputeShader => vk::PipelineStageFlags::COMPUTE_SHADER,
        PipelineStage::Transfer => vk::PipelineStageFlags::TRANSFER,
    }
}

/// Image aspect mask
#[must_use]
pub fn aspect_mask(aspect: ImageAspect) -> vk::ImageAspectFlags {
    match aspect {
        ImageAspect::Color => vk::ImageAspectFlags::COLOR,
        ImageAspect::Depth => vk::ImageAspectFlags::DEPTH,
        ImageAspect::DepthStencil => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
    }
}

/// Source/destination stages and access masks of a global barrier
#[must_use]
pub fn memory_barrier(
    barrier: MemoryBarrier,
) -> (vk::PipelineStageFlags, vk::PipelineStageFlags, vk::AccessFlags, vk::AccessFlags) {
    let graphics_reads = vk::PipelineStageFlags::VERTEX_INPUT
        | vk::PipelineStageFlags::VERTEX_SHADER
        | vk::PipelineStageFlags::FRAGMENT_SHADER;
    let shader_reads = vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER;
    match barrier {
        MemoryBarrier::ComputeWriteToGraphicsRead => (
            vk::PipelineStageFlags::COMPUTE_SHADER,
            graphics_reads,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ | vk::AccessFlags::SHADER_READ,
        ),
        MemoryBarrier::HostWriteToShaderRead => (
            vk::PipelineStageFlags::HOST,
            graphics_reads,
            vk::AccessFlags::HOST_WRITE,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::SHADER_READ,
        ),
        MemoryBarrier::TransferWriteToShaderRead => (
            vk::PipelineStageFlags::TRANSFER,
            shader_reads,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        ),
    }
}

/// Clear value
#[must_use]
pub const fn clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

/// Sample count flag for a power-of-two count
#[must_use]
pub fn sample_count(samples: u32) -> vk::SampleCountFlags {
    match samples {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        _ => vk::SampleCountFlags::TYPE_64,
    }
}

/// Map a failed call creating `kind` to a [`GpuError`]
#[must_use]
pub fn vk_error(result: vk::Result, kind: ResourceKind) -> GpuError {
    vk_alloc_error(result, kind, 0)
}

/// Map a failed allocation of `requested` bytes for `kind` to a [`GpuError`]
#[must_use]
pub fn vk_alloc_error(result: vk::Result, kind: ResourceKind, requested: u64) -> GpuError {
    match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => GpuError::OutOfMemory {
            domain: MemoryDomain::Host,
            kind,
            requested,
        },
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => GpuError::OutOfMemory {
            domain: MemoryDomain::Device,
            kind,
            requested,
        },
        vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => GpuError::OutOfPoolMemory,
        vk::Result::ERROR_OUT_OF_DATE_KHR => GpuError::OutOfDate,
        vk::Result::ERROR_SURFACE_LOST_KHR => GpuError::SurfaceLost,
        vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
        vk::Result::TIMEOUT | vk::Result::NOT_READY => GpuError::Timeout(kind),
        vk::Result::ERROR_FORMAT_NOT_SUPPORTED => GpuError::Creation {
            kind,
            reason: "format not supported".to_owned(),
        },
        other => GpuError::Creation {
            kind,
            reason: format!("{other:?}"),
        },
    }
}
