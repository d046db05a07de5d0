//! Device abstraction boundary
//!
//! The frame core never touches the graphics API directly. Everything it
//! needs from the device (resource creation, descriptor primitives, fences and
//! semaphores, command recording, submission) goes through [`GpuDevice`].
//! The ash backend in [`crate::vulkan`] is the production implementation; the
//! unit tests drive the same code against a recording mock.
//!
//! All methods take `&self`: the frame core runs on a single render thread and
//! the Vulkan objects behind a device are externally synchronised by that
//! thread, so implementations use interior mutability for their own
//! bookkeeping.

use super::error::{GpuError, GpuResult};
use super::flags::{BufferUsage, ImageUsage, MemoryProperties};
use super::format::GpuFormat;
use super::handles::{
    BufferHandle, CommandBufferHandle, DescriptorPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, FenceHandle, FramebufferHandle, ImageHandle, ImageViewHandle,
    MemoryHandle, PipelineHandle, PipelineLayoutHandle, RenderPassHandle, SamplerHandle,
    SemaphoreHandle,
};
use super::types::{
    BindPoint, ClearValue, ComputePipelineDesc, DescriptorWrite, DeviceLimits, Extent2D,
    ImageAspect, ImageDesc, LayoutBinding, MemoryBarrier, PoolSize, RenderPassDesc, Submission,
    Workgroups,
};

/// Fence wait used for blocking single-use submissions
pub const SINGLE_USE_TIMEOUT_NS: u64 = 10_000_000_000;

/// Primitive operations the frame core consumes from the graphics device
pub trait GpuDevice {
    /// Limits relevant to buffer sizing and texture extents
    fn limits(&self) -> DeviceLimits;

    /// Whether `format` can be used with `usage` as an optimally tiled image
    fn supports_format(&self, format: GpuFormat, usage: ImageUsage) -> bool;

    // --- buffers and memory -------------------------------------------------

    /// Create a buffer with freshly allocated, bound memory
    ///
    /// # Errors
    ///
    /// Out-of-memory or missing memory type for the requested properties.
    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        properties: MemoryProperties,
    ) -> GpuResult<(BufferHandle, MemoryHandle)>;

    /// Destroy a buffer object (its memory is freed separately)
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Free a memory allocation, unmapping it first if it is mapped
    fn free_memory(&self, memory: MemoryHandle);

    /// Persistently map the first `size` bytes of a host-visible allocation
    ///
    /// # Errors
    ///
    /// Mapping failure reported by the driver.
    fn map_memory(&self, memory: MemoryHandle, size: u64) -> GpuResult<()>;

    /// Unmap a persistently mapped allocation
    fn unmap_memory(&self, memory: MemoryHandle);

    /// Copy bytes into mapped memory at `offset`
    ///
    /// # Errors
    ///
    /// The allocation is not mapped or the write falls outside the mapping.
    fn write_mapped(&self, memory: MemoryHandle, offset: u64, bytes: &[u8]) -> GpuResult<()>;

    // --- images ---------------------------------------------------------------

    /// Create an optimally tiled image with dedicated device-local memory
    ///
    /// # Errors
    ///
    /// Unsupported format or allocation failure.
    fn create_image(&self, desc: &ImageDesc) -> GpuResult<(ImageHandle, MemoryHandle)>;

    /// Destroy an image (its memory is freed separately)
    fn destroy_image(&self, image: ImageHandle);

    /// Create a 2D view over an image
    ///
    /// # Errors
    ///
    /// Driver-reported creation failure.
    fn create_image_view(
        &self,
        image: ImageHandle,
        format: GpuFormat,
        aspect: ImageAspect,
    ) -> GpuResult<ImageViewHandle>;

    /// Destroy an image view
    fn destroy_image_view(&self, view: ImageViewHandle);

    /// Create a linear clamp-to-edge sampler
    ///
    /// # Errors
    ///
    /// Driver-reported creation failure.
    fn create_sampler(&self) -> GpuResult<SamplerHandle>;

    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: SamplerHandle);

    // --- descriptors ------------------------------------------------------------

    /// Create a descriptor set layout from its bindings
    ///
    /// # Errors
    ///
    /// Driver-reported creation failure.
    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> GpuResult<DescriptorSetLayoutHandle>;

    /// Destroy a descriptor set layout
    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle);

    /// Create a descriptor pool whose sets can be freed individually
    ///
    /// # Errors
    ///
    /// Driver-reported creation failure.
    fn create_descriptor_pool(
        &self,
        sizes: &[PoolSize],
        max_sets: u32,
    ) -> GpuResult<DescriptorPoolHandle>;

    /// Destroy a descriptor pool and every set still allocated from it
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);

    /// Allocate one set from a pool
    ///
    /// # Errors
    ///
    /// [`GpuError::OutOfPoolMemory`](super::error::GpuError::OutOfPoolMemory)
    /// when the pool is exhausted; other allocation failures otherwise.
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> GpuResult<DescriptorSetHandle>;

    /// Return sets to the pool they were allocated from
    fn free_descriptor_sets(&self, pool: DescriptorPoolHandle, sets: &[DescriptorSetHandle]);

    /// Point one binding of a set at a resource
    fn write_descriptor(&self, set: DescriptorSetHandle, binding: u32, write: DescriptorWrite);

    // --- render passes ----------------------------------------------------------

    /// Create a single-subpass render pass
    ///
    /// # Errors
    ///
    /// Driver-reported creation failure.
    fn create_render_pass(&self, desc: &RenderPassDesc) -> GpuResult<RenderPassHandle>;

    /// Destroy a render pass
    fn destroy_render_pass(&self, render_pass: RenderPassHandle);

    /// Create a framebuffer for a render pass
    ///
    /// # Errors
    ///
    /// Driver-reported creation failure.
    fn create_framebuffer(
        &self,
        render_pass: RenderPassHandle,
        attachments: &[ImageViewHandle],
        extent: Extent2D,
    ) -> GpuResult<FramebufferHandle>;

    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle);

    // --- synchronisation --------------------------------------------------------

    /// Create a fence, optionally already signalled
    ///
    /// # Errors
    ///
    /// Driver-reported creation failure.
    fn create_fence(&self, signaled: bool) -> GpuResult<FenceHandle>;

    /// Block until the fence is signalled or the timeout expires
    ///
    /// # Errors
    ///
    /// [`GpuError::Timeout`](super::error::GpuError::Timeout) or device loss.
    fn wait_for_fence(&self, fence: FenceHandle, timeout_ns: u64) -> GpuResult<()>;

    /// Return a fence to the unsignalled state
    ///
    /// # Errors
    ///
    /// Driver-reported failure.
    fn reset_fence(&self, fence: FenceHandle) -> GpuResult<()>;

    /// Destroy a fence
    fn destroy_fence(&self, fence: FenceHandle);

    /// Create a binary semaphore
    ///
    /// # Errors
    ///
    /// Driver-reported creation failure.
    fn create_semaphore(&self) -> GpuResult<SemaphoreHandle>;

    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    /// Block until the device has finished all submitted work
    ///
    /// # Errors
    ///
    /// Device loss.
    fn wait_idle(&self) -> GpuResult<()>;

    // --- command buffers --------------------------------------------------------

    /// Allocate a primary command buffer from the graphics command pool
    ///
    /// # Errors
    ///
    /// Driver-reported allocation failure.
    fn allocate_command_buffer(&self) -> GpuResult<CommandBufferHandle>;

    /// Return a command buffer to the pool
    fn free_command_buffer(&self, command_buffer: CommandBufferHandle);

    /// Reset and begin recording
    ///
    /// # Errors
    ///
    /// Driver-reported failure.
    fn begin_commands(&self, command_buffer: CommandBufferHandle, one_time: bool) -> GpuResult<()>;

    /// Finish recording
    ///
    /// # Errors
    ///
    /// Driver-reported failure.
    fn end_commands(&self, command_buffer: CommandBufferHandle) -> GpuResult<()>;

    /// Submit work to the graphics queue
    ///
    /// # Errors
    ///
    /// Device loss or out-of-memory reported by the queue.
    fn submit(&self, submission: &Submission<'_>) -> GpuResult<()>;

    // --- recording ---------------------------------------------------------------

    /// Begin a render pass with inline contents
    fn cmd_begin_render_pass(
        &self,
        command_buffer: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        clear_values: &[ClearValue],
    );

    /// End the current render pass
    fn cmd_end_render_pass(&self, command_buffer: CommandBufferHandle);

    /// Bind a pipeline
    fn cmd_bind_pipeline(
        &self,
        command_buffer: CommandBufferHandle,
        bind_point: BindPoint,
        pipeline: PipelineHandle,
    );

    /// Bind descriptor sets starting at `first_set`
    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: CommandBufferHandle,
        bind_point: BindPoint,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    );

    /// Bind a vertex buffer to a binding slot
    fn cmd_bind_vertex_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        binding: u32,
        buffer: BufferHandle,
        offset: u64,
    );

    /// Bind a `u32` index buffer
    fn cmd_bind_index_buffer(&self, command_buffer: CommandBufferHandle, buffer: BufferHandle, offset: u64);

    /// Indexed, instanced draw
    fn cmd_draw_indexed(&self, command_buffer: CommandBufferHandle, index_count: u32, instance_count: u32);

    /// Non-indexed, instanced draw
    fn cmd_draw(&self, command_buffer: CommandBufferHandle, vertex_count: u32, instance_count: u32);

    /// Dispatch a compute workload
    fn cmd_dispatch(&self, command_buffer: CommandBufferHandle, groups: Workgroups);

    /// Insert a global memory barrier
    fn cmd_memory_barrier(&self, command_buffer: CommandBufferHandle, barrier: MemoryBarrier);

    /// Copy a tightly packed buffer region into a whole colour image,
    /// leaving the image shader-readable
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        image: ImageHandle,
        extent: Extent2D,
    );

    // --- pipelines ----------------------------------------------------------------

    /// Create a compute pipeline and its layout from SPIR-V
    ///
    /// # Errors
    ///
    /// Invalid bytecode or driver-reported creation failure.
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<'_>,
    ) -> GpuResult<(PipelineHandle, PipelineLayoutHandle)>;

    /// Destroy a pipeline
    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    /// Destroy a pipeline layout
    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle);
}

/// Round `size` up to the device's storage-buffer offset alignment
///
/// # Panics
///
/// Panics on a zero size; an empty buffer means the caller broke the sizing contract.
#[must_use]
pub fn pad_buffer_size(limits: &DeviceLimits, size: u64) -> u64 {
    assert!(size > 0, "buffer size must be non-zero");
    let alignment = limits
        .min_storage_buffer_offset_alignment
        .max(limits.min_uniform_buffer_offset_alignment)
        .max(1);
    size.div_ceil(alignment) * alignment
}

/// Record and run a one-off command buffer, blocking until the GPU finishes
///
/// Used for setup-time transfers and the per-frame compute batch; never for
/// regular frame work.
///
/// # Errors
///
/// Any recording, submission or fence-wait failure. The command buffer and
/// fence are released on every path except a timed-out wait followed by a
/// failed device drain, where they are leaked.
pub fn submit_single_use<F>(device: &dyn GpuDevice, record: F) -> GpuResult<()>
where
    F: FnOnce(&dyn GpuDevice, CommandBufferHandle),
{
    let command_buffer = device.allocate_command_buffer()?;
    let fence = match device.create_fence(false) {
        Ok(fence) => fence,
        Err(err) => {
            device.free_command_buffer(command_buffer);
            return Err(err);
        }
    };

    let result = (|| {
        device.begin_commands(command_buffer, true)?;
        record(device, command_buffer);
        device.end_commands(command_buffer)?;
        device.submit(&Submission {
            command_buffers: &[command_buffer],
            wait: &[],
            signal: &[],
            fence,
        })?;
        device.wait_for_fence(fence, SINGLE_USE_TIMEOUT_NS)
    })();

    if let Err(GpuError::Timeout(_)) = &result {
        // The GPU may still be executing the command buffer
        if let Err(err) = device.wait_idle() {
            log::error!("Leaking single-use command buffer after timed-out wait: {err}");
            return result;
        }
    }
    device.destroy_fence(fence);
    device.free_command_buffer(command_buffer);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DeviceCall, MockDevice};

    #[test]
    fn pad_buffer_size_rounds_to_alignment() {
        let limits = DeviceLimits {
            min_storage_buffer_offset_alignment: 64,
            min_uniform_buffer_offset_alignment: 256,
            max_image_dimension_2d: 4096,
        };
        assert_eq!(pad_buffer_size(&limits, 1), 256);
        assert_eq!(pad_buffer_size(&limits, 256), 256);
        assert_eq!(pad_buffer_size(&limits, 257), 512);
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn pad_buffer_size_rejects_zero() {
        let _ = pad_buffer_size(&DeviceLimits::default(), 0);
    }

    #[test]
    fn single_use_submission_waits_and_releases() {
        let device = MockDevice::new();
        submit_single_use(&device, |device, cmd| {
            device.cmd_dispatch(cmd, Workgroups::new(1, 1, 1));
        })
        .unwrap();

        let calls = device.calls();
        let submit = calls.iter().position(|c| matches!(c, DeviceCall::Submit { .. })).unwrap();
        let wait = calls.iter().position(|c| matches!(c, DeviceCall::WaitFence(_))).unwrap();
        assert!(submit < wait);
        assert_eq!(device.live_command_buffers(), 0);
        assert_eq!(device.live_fences(), 0);
    }

    #[test]
    fn timed_out_single_use_drains_before_release() {
        let device = MockDevice::new();
        device.fail_next_fence_waits(1);
        let result = submit_single_use(&device, |device, cmd| {
            device.cmd_dispatch(cmd, Workgroups::new(1, 1, 1));
        });
        assert!(matches!(result, Err(GpuError::Timeout(_))));

        let calls = device.calls();
        let idle = calls.iter().position(|c| matches!(c, DeviceCall::WaitIdle)).unwrap();
        let destroy = calls.iter().position(|c| matches!(c, DeviceCall::DestroyFence(_))).unwrap();
        assert!(idle < destroy);
        assert_eq!(device.live_command_buffers(), 0);
        assert_eq!(device.live_fences(), 0);
    }
}
