//! Recording mock device and surface for unit tests
//!
//! `MockDevice` hands out unique, monotonically increasing handles, keeps the
//! contents of mapped memory, enforces descriptor pool capacities and records
//! every destroy and command-stream call so tests can assert on what the
//! frame core asked the GPU to do.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::gpu::*;

/// A device call worth asserting on
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    CreateBuffer { buffer: BufferHandle, size: u64 },
    DestroyBuffer(BufferHandle),
    FreeMemory(MemoryHandle),
    CreateImage { image: ImageHandle, extent: Extent2D, format: GpuFormat },
    DestroyImage(ImageHandle),
    DestroyImageView(ImageViewHandle),
    CreateRenderPass(RenderPassHandle),
    DestroyRenderPass(RenderPassHandle),
    DestroyFramebuffer(FramebufferHandle),
    CreateDescriptorPool { pool: DescriptorPoolHandle, max_sets: u32 },
    DestroyDescriptorPool(DescriptorPoolHandle),
    FreeDescriptorSets { pool: DescriptorPoolHandle, sets: Vec<DescriptorSetHandle> },
    WriteDescriptor { set: DescriptorSetHandle, binding: u32, write: DescriptorWrite },
    CreateSemaphore(SemaphoreHandle),
    DestroySemaphore(SemaphoreHandle),
    DestroyFence(FenceHandle),
    WaitFence(FenceHandle),
    ResetFence(FenceHandle),
    WaitIdle,
    Submit {
        command_buffers: Vec<CommandBufferHandle>,
        wait: Vec<SemaphoreHandle>,
        signal: Vec<SemaphoreHandle>,
        fence: FenceHandle,
    },
    BeginRenderPass { render_pass: RenderPassHandle, framebuffer: FramebufferHandle },
    EndRenderPass,
    BindPipeline(PipelineHandle),
    BindDescriptorSets(Vec<DescriptorSetHandle>),
    BindVertexBuffer { binding: u32, buffer: BufferHandle, offset: u64 },
    BindIndexBuffer(BufferHandle),
    DrawIndexed { index_count: u32, instance_count: u32 },
    Draw { vertex_count: u32, instance_count: u32 },
    Dispatch(Workgroups),
    Barrier(MemoryBarrier),
    CopyBufferToImage { buffer: BufferHandle, offset: u64, image: ImageHandle, extent: Extent2D },
}

#[derive(Debug, Default)]
struct PoolState {
    max_sets: u32,
    allocated: HashSet<DescriptorSetHandle>,
}

/// Recording [`GpuDevice`] for tests
#[derive(Debug)]
pub struct MockDevice {
    next_handle: Cell<u64>,
    limits: Cell<DeviceLimits>,
    calls: RefCell<Vec<DeviceCall>>,
    live: RefCell<HashMap<u64, ResourceKind>>,
    mapped: RefCell<HashMap<MemoryHandle, Vec<u8>>>,
    pools: RefCell<HashMap<DescriptorPoolHandle, PoolState>>,
    unsupported_formats: RefCell<HashSet<GpuFormat>>,
    fail_buffers: Cell<u32>,
    fail_submits: Cell<u32>,
    fail_fence_waits: Cell<u32>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            next_handle: Cell::new(1),
            limits: Cell::new(DeviceLimits::default()),
            calls: RefCell::new(Vec::new()),
            live: RefCell::new(HashMap::new()),
            mapped: RefCell::new(HashMap::new()),
            pools: RefCell::new(HashMap::new()),
            unsupported_formats: RefCell::new(HashSet::new()),
            fail_buffers: Cell::new(0),
            fail_submits: Cell::new(0),
            fail_fence_waits: Cell::new(0),
        }
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        let device = Self::new();
        device.limits.set(limits);
        device
    }

    /// Make the next `count` buffer creations fail with out-of-device-memory
    pub fn fail_next_buffers(&self, count: u32) {
        self.fail_buffers.set(count);
    }

    /// Make the next `count` queue submissions fail with out-of-host-memory
    pub fn fail_next_submits(&self, count: u32) {
        self.fail_submits.set(count);
    }

    /// Make the next `count` fence waits time out
    pub fn fail_next_fence_waits(&self, count: u32) {
        self.fail_fence_waits.set(count);
    }

    pub fn mark_unsupported(&self, format: GpuFormat) {
        self.unsupported_formats.borrow_mut().insert(format);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn destroyed_buffers(&self) -> Vec<BufferHandle> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                DeviceCall::DestroyBuffer(buffer) => Some(*buffer),
                _ => None,
            })
            .collect()
    }

    pub fn created_buffers(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| matches!(call, DeviceCall::CreateBuffer { .. }))
            .count()
    }

    pub fn created_pools(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| matches!(call, DeviceCall::CreateDescriptorPool { .. }))
            .count()
    }

    pub fn live_count(&self, kind: ResourceKind) -> usize {
        self.live.borrow().values().filter(|&&k| k == kind).count()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.live_count(ResourceKind::CommandBuffer)
    }

    pub fn live_fences(&self) -> usize {
        self.live_count(ResourceKind::Fence)
    }

    pub fn is_live(&self, raw: u64) -> bool {
        self.live.borrow().contains_key(&raw)
    }

    /// Contents of a mapped allocation
    pub fn mapped_bytes(&self, memory: MemoryHandle) -> Vec<u8> {
        self.mapped.borrow().get(&memory).cloned().unwrap_or_default()
    }

    fn next(&self, kind: ResourceKind) -> u64 {
        let raw = self.next_handle.get();
        self.next_handle.set(raw + 1);
        self.live.borrow_mut().insert(raw, kind);
        raw
    }

    fn release(&self, raw: u64) {
        self.live.borrow_mut().remove(&raw);
    }

    fn record(&self, call: DeviceCall) {
        self.calls.borrow_mut().push(call);
    }
}

impl GpuDevice for MockDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits.get()
    }

    fn supports_format(&self, format: GpuFormat, _usage: ImageUsage) -> bool {
        !self.unsupported_formats.borrow().contains(&format)
    }

    fn create_buffer(
        &self,
        size: u64,
        _usage: BufferUsage,
        _properties: MemoryProperties,
    ) -> GpuResult<(BufferHandle, MemoryHandle)> {
        let failures = self.fail_buffers.get();
        if failures > 0 {
            self.fail_buffers.set(failures - 1);
            return Err(GpuError::OutOfMemory {
                domain: MemoryDomain::Device,
                kind: ResourceKind::Buffer,
                requested: size,
            });
        }
        let buffer = BufferHandle::from_raw(self.next(ResourceKind::Buffer));
        let memory = MemoryHandle::from_raw(self.next(ResourceKind::Memory));
        self.record(DeviceCall::CreateBuffer { buffer, size });
        Ok((buffer, memory))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.release(buffer.raw());
        self.record(DeviceCall::DestroyBuffer(buffer));
    }

    fn free_memory(&self, memory: MemoryHandle) {
        self.mapped.borrow_mut().remove(&memory);
        self.release(memory.raw());
        self.record(DeviceCall::FreeMemory(memory));
    }

    fn map_memory(&self, memory: MemoryHandle, size: u64) -> GpuResult<()> {
        self.mapped.borrow_mut().insert(memory, vec![0; size as usize]);
        Ok(())
    }

    fn unmap_memory(&self, memory: MemoryHandle) {
        self.mapped.borrow_mut().remove(&memory);
    }

    fn write_mapped(&self, memory: MemoryHandle, offset: u64, bytes: &[u8]) -> GpuResult<()> {
        let mut mapped = self.mapped.borrow_mut();
        let region = mapped.get_mut(&memory).ok_or_else(|| GpuError::InvalidOperation {
            reason: format!("memory {memory:?} is not mapped"),
        })?;
        let start = offset as usize;
        let end = start + bytes.len();
        if end > region.len() {
            return Err(GpuError::InvalidOperation {
                reason: format!("write {start}..{end} outside mapping of {} bytes", region.len()),
            });
        }
        region[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<(ImageHandle, MemoryHandle)> {
        if self.unsupported_formats.borrow().contains(&desc.format) {
            return Err(GpuError::UnsupportedFormat(desc.format));
        }
        let image = ImageHandle::from_raw(self.next(ResourceKind::Image));
        let memory = MemoryHandle::from_raw(self.next(ResourceKind::Memory));
        self.record(DeviceCall::CreateImage { image, extent: desc.extent, format: desc.format });
        Ok((image, memory))
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.release(image.raw());
        self.record(DeviceCall::DestroyImage(image));
    }

    fn create_image_view(&self, _image: ImageHandle, _format: GpuFormat, _aspect: ImageAspect) -> GpuResult<ImageViewHandle> {
        Ok(ImageViewHandle::from_raw(self.next(ResourceKind::ImageView)))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        self.release(view.raw());
        self.record(DeviceCall::DestroyImageView(view));
    }

    fn create_sampler(&self) -> GpuResult<SamplerHandle> {
        Ok(SamplerHandle::from_raw(self.next(ResourceKind::Sampler)))
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        self.release(sampler.raw());
    }

    fn create_descriptor_set_layout(&self, _bindings: &[LayoutBinding]) -> GpuResult<DescriptorSetLayoutHandle> {
        Ok(DescriptorSetLayoutHandle::from_raw(self.next(ResourceKind::DescriptorSetLayout)))
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        self.release(layout.raw());
    }

    fn create_descriptor_pool(&self, _sizes: &[PoolSize], max_sets: u32) -> GpuResult<DescriptorPoolHandle> {
        let pool = DescriptorPoolHandle::from_raw(self.next(ResourceKind::DescriptorPool));
        self.pools.borrow_mut().insert(pool, PoolState { max_sets, allocated: HashSet::new() });
        self.record(DeviceCall::CreateDescriptorPool { pool, max_sets });
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        if let Some(state) = self.pools.borrow_mut().remove(&pool) {
            for set in state.allocated {
                self.release(set.raw());
            }
        }
        self.release(pool.raw());
        self.record(DeviceCall::DestroyDescriptorPool(pool));
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        _layout: DescriptorSetLayoutHandle,
    ) -> GpuResult<DescriptorSetHandle> {
        let full = {
            let pools = self.pools.borrow();
            let state = pools.get(&pool).ok_or_else(|| GpuError::InvalidOperation {
                reason: format!("unknown pool {pool:?}"),
            })?;
            state.allocated.len() as u32 >= state.max_sets
        };
        if full {
            return Err(GpuError::OutOfPoolMemory);
        }
        let set = DescriptorSetHandle::from_raw(self.next(ResourceKind::DescriptorSet));
        if let Some(state) = self.pools.borrow_mut().get_mut(&pool) {
            state.allocated.insert(set);
        }
        Ok(set)
    }

    fn free_descriptor_sets(&self, pool: DescriptorPoolHandle, sets: &[DescriptorSetHandle]) {
        if let Some(state) = self.pools.borrow_mut().get_mut(&pool) {
            for set in sets {
                assert!(state.allocated.remove(set), "set {set:?} was not allocated from {pool:?}");
            }
        }
        for set in sets {
            self.release(set.raw());
        }
        self.record(DeviceCall::FreeDescriptorSets { pool, sets: sets.to_vec() });
    }

    fn write_descriptor(&self, set: DescriptorSetHandle, binding: u32, write: DescriptorWrite) {
        self.record(DeviceCall::WriteDescriptor { set, binding, write });
    }

    fn create_render_pass(&self, _desc: &RenderPassDesc) -> GpuResult<RenderPassHandle> {
        let render_pass = RenderPassHandle::from_raw(self.next(ResourceKind::RenderPass));
        self.record(DeviceCall::CreateRenderPass(render_pass));
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: RenderPassHandle) {
        self.release(render_pass.raw());
        self.record(DeviceCall::DestroyRenderPass(render_pass));
    }

    fn create_framebuffer(
        &self,
        _render_pass: RenderPassHandle,
        _attachments: &[ImageViewHandle],
        _extent: Extent2D,
    ) -> GpuResult<FramebufferHandle> {
        Ok(FramebufferHandle::from_raw(self.next(ResourceKind::Framebuffer)))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        self.release(framebuffer.raw());
        self.record(DeviceCall::DestroyFramebuffer(framebuffer));
    }

    fn create_fence(&self, _signaled: bool) -> GpuResult<FenceHandle> {
        Ok(FenceHandle::from_raw(self.next(ResourceKind::Fence)))
    }

    fn wait_for_fence(&self, fence: FenceHandle, _timeout_ns: u64) -> GpuResult<()> {
        self.record(DeviceCall::WaitFence(fence));
        let failures = self.fail_fence_waits.get();
        if failures > 0 {
            self.fail_fence_waits.set(failures - 1);
            return Err(GpuError::Timeout(ResourceKind::Fence));
        }
        Ok(())
    }

    fn reset_fence(&self, fence: FenceHandle) -> GpuResult<()> {
        self.record(DeviceCall::ResetFence(fence));
        Ok(())
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.release(fence.raw());
        self.record(DeviceCall::DestroyFence(fence));
    }

    fn create_semaphore(&self) -> GpuResult<SemaphoreHandle> {
        let semaphore = SemaphoreHandle::from_raw(self.next(ResourceKind::Semaphore));
        self.record(DeviceCall::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.release(semaphore.raw());
        self.record(DeviceCall::DestroySemaphore(semaphore));
    }

    fn wait_idle(&self) -> GpuResult<()> {
        self.record(DeviceCall::WaitIdle);
        Ok(())
    }

    fn allocate_command_buffer(&self) -> GpuResult<CommandBufferHandle> {
        Ok(CommandBufferHandle::from_raw(self.next(ResourceKind::CommandBuffer)))
    }

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle) {
        self.release(command_buffer.raw());
    }

    fn begin_commands(&self, _command_buffer: CommandBufferHandle, _one_time: bool) -> GpuResult<()> {
        Ok(())
    }

    fn end_commands(&self, _command_buffer: CommandBufferHandle) -> GpuResult<()> {
        Ok(())
    }

    fn submit(&self, submission: &Submission<'_>) -> GpuResult<()> {
        let failures = self.fail_submits.get();
        if failures > 0 {
            self.fail_submits.set(failures - 1);
            return Err(GpuError::OutOfMemory {
                domain: MemoryDomain::Host,
                kind: ResourceKind::Submission,
                requested: 0,
            });
        }
        self.record(DeviceCall::Submit {
            command_buffers: submission.command_buffers.to_vec(),
            wait: submission.wait.iter().map(|(semaphore, _)| *semaphore).collect(),
            signal: submission.signal.to_vec(),
            fence: submission.fence,
        });
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        _command_buffer: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        _extent: Extent2D,
        _clear_values: &[ClearValue],
    ) {
        self.record(DeviceCall::BeginRenderPass { render_pass, framebuffer });
    }

    fn cmd_end_render_pass(&self, _command_buffer: CommandBufferHandle) {
        self.record(DeviceCall::EndRenderPass);
    }

    fn cmd_bind_pipeline(&self, _command_buffer: CommandBufferHandle, _bind_point: BindPoint, pipeline: PipelineHandle) {
        self.record(DeviceCall::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        _command_buffer: CommandBufferHandle,
        _bind_point: BindPoint,
        _layout: PipelineLayoutHandle,
        _first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        self.record(DeviceCall::BindDescriptorSets(sets.to_vec()));
    }

    fn cmd_bind_vertex_buffer(&self, _command_buffer: CommandBufferHandle, binding: u32, buffer: BufferHandle, offset: u64) {
        self.record(DeviceCall::BindVertexBuffer { binding, buffer, offset });
    }

    fn cmd_bind_index_buffer(&self, _command_buffer: CommandBufferHandle, buffer: BufferHandle, _offset: u64) {
        self.record(DeviceCall::BindIndexBuffer(buffer));
    }

    fn cmd_draw_indexed(&self, _command_buffer: CommandBufferHandle, index_count: u32, instance_count: u32) {
        self.record(DeviceCall::DrawIndexed { index_count, instance_count });
    }

    fn cmd_draw(&self, _command_buffer: CommandBufferHandle, vertex_count: u32, instance_count: u32) {
        self.record(DeviceCall::Draw { vertex_count, instance_count });
    }

    fn cmd_dispatch(&self, _command_buffer: CommandBufferHandle, groups: Workgroups) {
        self.record(DeviceCall::Dispatch(groups));
    }

    fn cmd_memory_barrier(&self, _command_buffer: CommandBufferHandle, barrier: MemoryBarrier) {
        self.record(DeviceCall::Barrier(barrier));
    }

    fn cmd_copy_buffer_to_image(
        &self,
        _command_buffer: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        image: ImageHandle,
        extent: Extent2D,
    ) {
        self.record(DeviceCall::CopyBufferToImage { buffer, offset, image, extent });
    }

    fn create_compute_pipeline(&self, _desc: &ComputePipelineDesc<'_>) -> GpuResult<(PipelineHandle, PipelineLayoutHandle)> {
        Ok((
            PipelineHandle::from_raw(self.next(ResourceKind::Pipeline)),
            PipelineLayoutHandle::from_raw(self.next(ResourceKind::Pipeline)),
        ))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.release(pipeline.raw());
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle) {
        self.release(layout.raw());
    }
}

/// Scriptable [`PresentationSurface`] for tests
#[derive(Debug)]
pub struct MockSurface {
    pub size: Extent2D,
    pub image_count: u32,
    pub swapchains_created: usize,
    pub presented: Vec<u32>,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    next_image: u32,
    next_handle: u64,
    live: bool,
}

impl MockSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: Extent2D::new(width, height),
            image_count: 3,
            swapchains_created: 0,
            presented: Vec::new(),
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            next_image: 0,
            next_handle: 1 << 40,
            live: false,
        }
    }

    /// Queue an outcome for a future acquire; unscripted acquires succeed
    pub fn script_acquire(&mut self, outcome: AcquireOutcome) {
        self.acquire_script.push_back(outcome);
    }

    /// Queue an outcome for a future present; unscripted presents succeed
    pub fn script_present(&mut self, outcome: PresentOutcome) {
        self.present_script.push_back(outcome);
    }
}

impl PresentationSurface for MockSurface {
    fn drawable_size(&self) -> Extent2D {
        self.size
    }

    fn create_swapchain(&mut self, preferred_formats: &[GpuFormat], _vsync: bool, extent: Extent2D) -> GpuResult<SwapchainImages> {
        self.swapchains_created += 1;
        self.live = true;
        self.next_image = 0;
        let images = (0..self.image_count)
            .map(|_| {
                self.next_handle += 1;
                ImageHandle::from_raw(self.next_handle)
            })
            .collect();
        Ok(SwapchainImages { images, format: preferred_formats[0], extent })
    }

    fn destroy_swapchain(&mut self) {
        self.live = false;
    }

    fn acquire_next_image(&mut self, _signal: SemaphoreHandle, _timeout_ns: u64) -> GpuResult<AcquireOutcome> {
        assert!(self.live, "acquire without a swapchain");
        if let Some(outcome) = self.acquire_script.pop_front() {
            return Ok(outcome);
        }
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        Ok(AcquireOutcome::Acquired { image_index, suboptimal: false })
    }

    fn present(&mut self, image_index: u32, _wait: SemaphoreHandle) -> GpuResult<PresentOutcome> {
        self.presented.push(image_index);
        Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
    }
}
