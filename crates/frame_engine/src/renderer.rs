//! Top-level frame renderer
//!
//! [`FrameRenderer`] owns the device, the presentation surface and every
//! frame subsystem, and drives one frame per [`FrameRenderer::render_frame`]:
//!
//! 1. wait for the slot, acquire an image, reclaim expired resources
//! 2. run queued compute work
//! 3. compact and upload every draw group into the slot's buffer region
//! 4. record pre-pass producers, then instance-texture copies, main-stage
//!    offscreen passes and the instanced draws into the swapchain pass
//! 5. submit by stage and present

use std::rc::Rc;

use crate::batch::{DrawBatcher, GroupId, GroupLimits, InstanceRef, Material, MeshRef};
use crate::core::FrameEngineConfig;
use crate::frame::{FrameSynchronizer, FrameTarget, PassKey, RenderContext, SwapChain, SwapchainDependent};
use crate::gpu::{GpuDevice, GpuError, GpuResult, MemoryBarrier, PresentationSurface};
use crate::painter::{ComputeTask, PaintStage, Painter};

/// What one rendered frame did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames presented before this one
    pub frame_number: u64,
    /// Live draw groups
    pub groups: usize,
    /// Instances uploaded across all groups
    pub visible_instances: usize,
    /// Instanced draws recorded
    pub draw_calls: usize,
    /// Groups whose buffers grew
    pub reallocations: usize,
    /// Groups skipped after a failed upload
    pub failed_groups: usize,
    /// Compute dispatches run
    pub compute_dispatches: usize,
    /// Entries waiting in the destruction queue
    pub trash_depth: usize,
    /// Descriptor pools allocated so far
    pub descriptor_pools: usize,
}

/// Owner of the whole frame lifecycle
pub struct FrameRenderer<D: GpuDevice, S: PresentationSurface> {
    ctx: RenderContext,
    sync: FrameSynchronizer,
    painter: Painter,
    batcher: DrawBatcher,
    clear_color: [f32; 4],
    shut_down: bool,
    // device drops first; the surface may own the window the context presents to
    device: D,
    surface: S,
}

impl<D: GpuDevice, S: PresentationSurface> std::fmt::Debug for FrameRenderer<D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRenderer")
            .field("sync", &self.sync)
            .field("batcher", &self.batcher)
            .field("trash", &self.ctx.trash.len())
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl<D: GpuDevice, S: PresentationSurface> FrameRenderer<D, S> {
    /// Bring up frame slots, the swapchain and the command buffers
    ///
    /// # Errors
    ///
    /// Invalid configuration or any creation failure; partially created
    /// objects are released.
    pub fn new(device: D, mut surface: S, config: &FrameEngineConfig) -> GpuResult<Self> {
        config.validate().map_err(|err| GpuError::InvalidOperation { reason: err.to_string() })?;
        let frames = config.frames();

        let mut sync = FrameSynchronizer::new(
            &device,
            &mut surface,
            config.swapchain_settings(),
            frames,
            config.fence_timeout_ns,
        )?;
        let painter = match Painter::new(&device, frames) {
            Ok(painter) => painter,
            Err(err) => {
                sync.destroy(&device, &mut surface);
                return Err(err);
            }
        };
        let limits = GroupLimits {
            frames_in_flight: frames,
            row_texels: config.instance_texture_row_texels,
            device: device.limits(),
        };

        log::info!(
            "Frame renderer ready: {frames} frames in flight, {}x{} swapchain",
            sync.swapchain().extent().width,
            sync.swapchain().extent().height
        );
        Ok(Self {
            ctx: RenderContext::new(frames, config.descriptor_sets_per_pool),
            sync,
            painter,
            batcher: DrawBatcher::new(limits),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            shut_down: false,
            device,
            surface,
        })
    }

    /// Register a swapchain-dependent pass and build it against the current swapchain
    ///
    /// Passes with a lower sort key are rebuilt first.
    ///
    /// # Errors
    ///
    /// The initial reconstruction failed; the pass stays registered and is
    /// retried on the next swapchain rebuild.
    pub fn register_pass(&mut self, sort_key: i32, pass: Box<dyn SwapchainDependent>) -> GpuResult<PassKey> {
        let key = self.ctx.passes.register(sort_key, pass);
        self.ctx
            .passes
            .rebuild_all(&self.device, self.sync.swapchain(), &mut self.ctx.trash)?;
        Ok(key)
    }

    /// Unregister a pass and destroy it once the GPU is idle
    pub fn remove_pass(&mut self, key: PassKey) {
        if let Some(mut pass) = self.ctx.passes.remove(key) {
            if let Err(err) = self.device.wait_idle() {
                log::warn!("wait_idle before removing pass '{}' failed: {err}", pass.name());
            }
            pass.destroy(&self.device);
        }
    }

    /// Add an instance to the batch of its mesh and material
    pub fn add_instance(&mut self, mesh: MeshRef, material: &Rc<Material>, instance: InstanceRef) -> GroupId {
        self.batcher.add(mesh, material, instance)
    }

    /// Queue a compute dispatch for the next frame
    pub fn queue_compute(&mut self, task: ComputeTask) {
        self.painter.queue_compute(task);
    }

    /// Run `callback` right after the next successful acquire
    pub fn queue_pre_run(&mut self, callback: impl FnOnce(&dyn GpuDevice) + 'static) {
        self.sync.queue_pre_run(callback);
    }

    /// Rebuild the swapchain before the next frame
    pub fn request_rebuild(&mut self) {
        self.sync.request_rebuild();
    }

    /// Colour the swapchain pass clears to
    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    /// Record and present one frame
    ///
    /// `Ok(None)` means no frame was produced: the window is minimised or the
    /// swapchain had to be rebuilt first. Queued compute work is dispatched
    /// before acquisition and runs even when no frame is produced.
    ///
    /// # Errors
    ///
    /// Device-level failures. A recording or submission failure after the
    /// image was acquired abandons the frame; the renderer stays usable and
    /// the next call rebuilds the swapchain.
    pub fn render_frame(&mut self) -> GpuResult<Option<FrameStats>> {
        let compute_dispatches = self.painter.dispatch_compute(&self.device)?;
        let Some(target) = self.sync.ready_frame(&self.device, &mut self.surface, &mut self.ctx)? else {
            return Ok(None);
        };

        match self.record_and_present(target, compute_dispatches) {
            Ok(stats) => Ok(Some(stats)),
            Err(err) => {
                log::error!("Frame {} failed after acquire: {err}", self.sync.frame_number());
                self.painter.cancel(&self.device);
                if let Err(abandon) = self.sync.abandon_frame(&self.device) {
                    log::error!("Could not release the abandoned frame: {abandon}");
                }
                Err(err)
            }
        }
    }

    fn record_and_present(&mut self, target: FrameTarget, compute_dispatches: usize) -> GpuResult<FrameStats> {
        let device: &dyn GpuDevice = &self.device;
        let batch = self.batcher.update(device, &mut self.ctx, target.slot);

        self.painter.begin(device, target.slot)?;
        if self.ctx.passes.has_stage(PaintStage::PrePass) {
            let cmd = self.painter.command_buffer(PaintStage::PrePass);
            self.ctx.passes.record_stage(device, cmd, PaintStage::PrePass);
        }

        let cmd = self.painter.command_buffer(PaintStage::MainPass);
        if self.batcher.record_uploads(device, cmd, target.slot) > 0 {
            device.cmd_memory_barrier(cmd, MemoryBarrier::TransferWriteToShaderRead);
        }
        self.ctx.passes.record_stage(device, cmd, PaintStage::MainPass);

        let clear_values = self.sync.swapchain().clear_values(self.clear_color);
        device.cmd_begin_render_pass(cmd, target.render_pass, target.framebuffer, target.extent, &clear_values);
        let draw_calls = self.batcher.record_draws(device, cmd, target.slot);
        device.cmd_end_render_pass(cmd);

        let staged = self.painter.finish(device)?;
        let frame_number = self.sync.frame_number();
        self.sync.swap_frame(device, &mut self.surface, &mut self.ctx, &staged)?;

        let stats = FrameStats {
            frame_number,
            groups: batch.groups,
            visible_instances: batch.visible_instances,
            draw_calls,
            reallocations: batch.reallocations,
            failed_groups: batch.failed_groups,
            compute_dispatches,
            trash_depth: self.ctx.trash.len(),
            descriptor_pools: self.ctx.descriptors.pool_count(),
        };
        log::trace!("{stats:?}");
        Ok(stats)
    }

    /// Drain the GPU and destroy everything the renderer created
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if let Err(err) = self.device.wait_idle() {
            log::error!("wait_idle during shutdown failed: {err}");
        }
        self.batcher.teardown_all(&mut self.ctx.trash);
        self.painter.destroy(&self.device);
        self.sync.destroy(&self.device, &mut self.surface);
        self.ctx.shutdown(&self.device);
        log::info!("Frame renderer shut down");
    }

    /// The device
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// The presentation surface
    pub const fn surface(&self) -> &S {
        &self.surface
    }

    /// Mutable access to the surface, e.g. to forward window events
    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    /// The live swapchain
    pub const fn swapchain(&self) -> &SwapChain {
        self.sync.swapchain()
    }

    /// The draw batcher
    pub const fn batcher(&self) -> &DrawBatcher {
        &self.batcher
    }

    /// The frame synchronizer
    pub const fn synchronizer(&self) -> &FrameSynchronizer {
        &self.sync
    }

    /// Shared frame state: destruction queue, descriptor pools and passes
    pub const fn context(&self) -> &RenderContext {
        &self.ctx
    }

    /// Mutable frame state, for callers allocating descriptor sets or retiring resources
    pub fn context_mut(&mut self) -> &mut RenderContext {
        &mut self.ctx
    }
}

impl<D: GpuDevice, S: PresentationSurface> Drop for FrameRenderer<D, S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
