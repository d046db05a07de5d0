//! Frame pacing: slot rotation, acquisition, submission and presentation
//!
//! `ready_frame` waits for the slot's previous frame, acquires an image and,
//! once the frame is certain to happen, resets the fence, advances the
//! deferred-destruction queue and runs pending pre-run callbacks.
//! `swap_frame` submits the staged command buffers and presents.
//!
//! Submission chain for one frame:
//!
//! ```text
//! acquire --image_acquired--> pre-pass --prepass_finished--> main pass --render_finished--> present
//!                                                              \--> fence
//! ```
//!
//! With an empty pre-pass the main pass waits on `image_acquired` directly.
//! Out-of-date and suboptimal results from either end trigger a full
//! swapchain rebuild followed by the ordered reconstruction of every
//! registered render pass; they are never reported as errors.

use super::context::RenderContext;
use super::swapchain::{SwapChain, SwapchainSettings};
use super::sync::FrameSlot;
use crate::gpu::{
    AcquireOutcome, Extent2D, FenceHandle, FramebufferHandle, GpuDevice, GpuError, GpuResult, PipelineStage,
    PresentOutcome, PresentationSurface, RenderPassHandle, SemaphoreHandle, Submission,
};
use crate::painter::StagedCommands;

/// One-shot work run after the next successful acquire
pub type PreRunCallback = Box<dyn FnOnce(&dyn GpuDevice)>;

/// Everything the recorder needs about the acquired frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTarget {
    /// Frame slot being recorded
    pub slot: usize,
    /// Acquired swapchain image
    pub image_index: u32,
    /// Swapchain render pass
    pub render_pass: RenderPassHandle,
    /// Framebuffer of the acquired image
    pub framebuffer: FramebufferHandle,
    /// Swapchain extent
    pub extent: Extent2D,
}

/// Rotating frame slots plus the swapchain they present to
pub struct FrameSynchronizer {
    slots: Vec<FrameSlot>,
    current: usize,
    frame_number: u64,
    swapchain: SwapChain,
    built_for: Extent2D,
    settings: SwapchainSettings,
    fence_timeout_ns: u64,
    pre_run: Vec<PreRunCallback>,
    needs_rebuild: bool,
    prepass_submitted: bool,
    rebuilds: u64,
}

impl std::fmt::Debug for FrameSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSynchronizer")
            .field("slots", &self.slots)
            .field("current", &self.current)
            .field("frame_number", &self.frame_number)
            .field("swapchain", &self.swapchain)
            .field("pre_run", &self.pre_run.len())
            .field("needs_rebuild", &self.needs_rebuild)
            .field("rebuilds", &self.rebuilds)
            .finish()
    }
}

impl FrameSynchronizer {
    /// Create `frames_in_flight` slots and the initial swapchain
    ///
    /// # Errors
    ///
    /// Slot or swapchain creation failure; anything created is released.
    pub fn new(
        device: &dyn GpuDevice,
        surface: &mut dyn PresentationSurface,
        settings: SwapchainSettings,
        frames_in_flight: usize,
        fence_timeout_ns: u64,
    ) -> GpuResult<Self> {
        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            match FrameSlot::new(device) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    slots.iter_mut().for_each(|slot| slot.destroy(device));
                    return Err(err);
                }
            }
        }
        let built_for = surface.drawable_size();
        let swapchain = match SwapChain::new(device, surface, &settings) {
            Ok(swapchain) => swapchain,
            Err(err) => {
                slots.iter_mut().for_each(|slot| slot.destroy(device));
                return Err(err);
            }
        };

        Ok(Self {
            slots,
            current: 0,
            frame_number: 0,
            swapchain,
            built_for,
            settings,
            fence_timeout_ns,
            pre_run: Vec::new(),
            needs_rebuild: false,
            prepass_submitted: false,
            rebuilds: 0,
        })
    }

    /// The live swapchain
    #[must_use]
    pub const fn swapchain(&self) -> &SwapChain {
        &self.swapchain
    }

    /// Frames presented (or attempted) so far
    #[must_use]
    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Slot the next frame will use
    #[must_use]
    pub const fn current_slot(&self) -> usize {
        self.current
    }

    /// Slot state, for diagnostics
    #[must_use]
    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    /// Number of completed swapchain rebuilds
    #[must_use]
    pub const fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Force a rebuild before the next frame (explicit resize)
    pub fn request_rebuild(&mut self) {
        self.needs_rebuild = true;
    }

    /// Run `callback` after the next successful acquire
    pub fn queue_pre_run(&mut self, callback: impl FnOnce(&dyn GpuDevice) + 'static) {
        self.pre_run.push(Box::new(callback));
    }

    /// Prepare the current slot for recording
    ///
    /// Returns `None` when no frame can be rendered right now: the window is
    /// minimised, or the swapchain turned out to be stale and was rebuilt.
    ///
    /// # Errors
    ///
    /// Fence timeout, device or surface loss, or a failed rebuild.
    pub fn ready_frame(
        &mut self,
        device: &dyn GpuDevice,
        surface: &mut dyn PresentationSurface,
        ctx: &mut RenderContext,
    ) -> GpuResult<Option<FrameTarget>> {
        let drawable = surface.drawable_size();
        if drawable.is_empty() {
            return Ok(None);
        }
        if self.needs_rebuild || drawable != self.built_for {
            self.rebuild(device, surface, ctx)?;
        }

        let slot = &mut self.slots[self.current];
        slot.wait(device, self.fence_timeout_ns)?;
        slot.begin_acquire();

        let image_index = match surface.acquire_next_image(slot.image_acquired(), self.fence_timeout_ns) {
            Ok(AcquireOutcome::Acquired { image_index, suboptimal }) => {
                if suboptimal {
                    log::debug!("Acquired image is suboptimal; rebuilding after present");
                    self.needs_rebuild = true;
                }
                image_index
            }
            Ok(AcquireOutcome::OutOfDate) | Err(GpuError::OutOfDate) => {
                slot.abandon();
                log::debug!("Swapchain out of date on acquire");
                self.rebuild(device, surface, ctx)?;
                return Ok(None);
            }
            Err(err) => {
                slot.abandon();
                return Err(err);
            }
        };

        let slot = &mut self.slots[self.current];
        device.reset_fence(slot.fence())?;
        slot.begin_recording(image_index);
        self.prepass_submitted = false;

        ctx.cycle(device);
        for callback in self.pre_run.drain(..) {
            callback(device);
        }

        Ok(Some(FrameTarget {
            slot: self.current,
            image_index,
            render_pass: self.swapchain.render_pass(),
            framebuffer: self.swapchain.framebuffer(image_index),
            extent: self.swapchain.extent(),
        }))
    }

    /// Submit the frame's staged commands and present it
    ///
    /// # Errors
    ///
    /// Submission failure, device or surface loss, or a failed rebuild.
    ///
    /// # Panics
    ///
    /// Panics if the current slot is not recording.
    pub fn swap_frame(
        &mut self,
        device: &dyn GpuDevice,
        surface: &mut dyn PresentationSurface,
        ctx: &mut RenderContext,
        staged: &StagedCommands,
    ) -> GpuResult<()> {
        let slot = &mut self.slots[self.current];

        let main_wait: (SemaphoreHandle, PipelineStage) = if staged.pre_pass.is_empty() {
            (slot.image_acquired(), PipelineStage::ColorAttachmentOutput)
        } else {
            device.submit(&Submission {
                command_buffers: &staged.pre_pass,
                wait: &[(slot.image_acquired(), PipelineStage::ColorAttachmentOutput)],
                signal: &[slot.prepass_finished()],
                fence: FenceHandle::NULL,
            })?;
            self.prepass_submitted = true;
            (slot.prepass_finished(), PipelineStage::FragmentShader)
        };

        device.submit(&Submission {
            command_buffers: &staged.main_pass,
            wait: &[main_wait],
            signal: &[slot.render_finished()],
            fence: slot.fence(),
        })?;
        slot.mark_submitted();

        let outcome = surface.present(slot.image_index(), slot.render_finished());
        self.current = (self.current + 1) % self.slots.len();
        self.frame_number += 1;

        match outcome {
            Ok(PresentOutcome::Presented) => {}
            Ok(PresentOutcome::Suboptimal) => {
                log::debug!("Present reported a suboptimal swapchain");
                self.needs_rebuild = true;
            }
            Ok(PresentOutcome::OutOfDate) | Err(GpuError::OutOfDate) => {
                log::debug!("Swapchain out of date on present");
                self.needs_rebuild = true;
            }
            Err(err) => return Err(err),
        }

        if self.needs_rebuild {
            self.rebuild(device, surface, ctx)?;
        }
        Ok(())
    }

    /// Release the current slot after recording failed
    ///
    /// Submits an empty batch that consumes `image_acquired`, unless the
    /// pre-pass already did, and signals the slot's fence so the next wait on
    /// the slot returns. The acquired image is never presented; the swapchain
    /// and the slot semaphores are rebuilt before the next frame. A slot that
    /// is not recording is left alone.
    ///
    /// # Errors
    ///
    /// The empty submission failed; the slot stays unusable.
    pub fn abandon_frame(&mut self, device: &dyn GpuDevice) -> GpuResult<()> {
        let slot = &mut self.slots[self.current];
        if !slot.is_recording() {
            return Ok(());
        }
        let acquired = [(slot.image_acquired(), PipelineStage::ColorAttachmentOutput)];
        let wait: &[_] = if self.prepass_submitted { &[] } else { &acquired };
        device.submit(&Submission {
            command_buffers: &[],
            wait,
            signal: &[],
            fence: slot.fence(),
        })?;
        slot.mark_submitted();
        self.needs_rebuild = true;
        log::warn!("Abandoned frame {} in slot {}", self.frame_number, self.current);
        Ok(())
    }

    /// Drain the device and rebuild the swapchain and every dependent pass
    ///
    /// A minimised window postpones the rebuild until it has a size again.
    ///
    /// # Errors
    ///
    /// Creation failure of the swapchain, a slot semaphore or a pass.
    pub fn rebuild(
        &mut self,
        device: &dyn GpuDevice,
        surface: &mut dyn PresentationSurface,
        ctx: &mut RenderContext,
    ) -> GpuResult<()> {
        let drawable = surface.drawable_size();
        if drawable.is_empty() {
            self.needs_rebuild = true;
            return Ok(());
        }

        self.needs_rebuild = true;
        device.wait_idle()?;
        self.swapchain.destroy(device, surface);
        for slot in &mut self.slots {
            slot.recreate_semaphores(device)?;
        }
        self.swapchain = SwapChain::new(device, surface, &self.settings)?;
        self.built_for = drawable;
        ctx.passes.rebuild_all(device, &self.swapchain, &mut ctx.trash)?;

        self.needs_rebuild = false;
        self.rebuilds += 1;
        log::info!(
            "Rebuilt swapchain at {}x{} ({} dependent passes)",
            drawable.width,
            drawable.height,
            ctx.passes.len()
        );
        Ok(())
    }

    /// Destroy the slots and the swapchain; the device must be idle
    pub fn destroy(&mut self, device: &dyn GpuDevice, surface: &mut dyn PresentationSurface) {
        if !self.pre_run.is_empty() {
            log::debug!("Running {} pending pre-run callbacks at shutdown", self.pre_run.len());
            for callback in self.pre_run.drain(..) {
                callback(device);
            }
        }
        for slot in &mut self.slots {
            slot.destroy(device);
        }
        self.swapchain.destroy(device, surface);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::frame::sync::FrameSlotState;
    use crate::gpu::{CommandBufferHandle, GpuFormat};
    use crate::testing::{DeviceCall, MockDevice, MockSurface};

    fn settings() -> SwapchainSettings {
        SwapchainSettings {
            preferred_surface_formats: vec![GpuFormat::B8G8R8A8Srgb],
            preferred_depth_formats: vec![GpuFormat::D32Sfloat],
            msaa_samples: 1,
            vsync: true,
        }
    }

    fn setup(frames: usize) -> (MockDevice, MockSurface, RenderContext, FrameSynchronizer) {
        let device = MockDevice::new();
        let mut surface = MockSurface::new(800, 600);
        let ctx = RenderContext::new(frames, 8);
        let sync = FrameSynchronizer::new(&device, &mut surface, settings(), frames, 1_000).unwrap();
        (device, surface, ctx, sync)
    }

    fn staged(pre: bool) -> StagedCommands {
        StagedCommands {
            pre_pass: if pre { vec![CommandBufferHandle::from_raw(900)] } else { Vec::new() },
            main_pass: vec![CommandBufferHandle::from_raw(901)],
        }
    }

    fn submits(device: &MockDevice) -> Vec<DeviceCall> {
        device
            .calls()
            .into_iter()
            .filter(|call| matches!(call, DeviceCall::Submit { .. }))
            .collect()
    }

    #[test]
    fn frames_rotate_through_slots() {
        let (device, mut surface, mut ctx, mut sync) = setup(2);
        for expected in [0, 1, 0] {
            let target = sync.ready_frame(&device, &mut surface, &mut ctx).unwrap().unwrap();
            assert_eq!(target.slot, expected);
            assert_eq!(sync.slot(expected).state(), FrameSlotState::Recording);
            sync.swap_frame(&device, &mut surface, &mut ctx, &staged(false)).unwrap();
            assert_eq!(sync.slot(expected).state(), FrameSlotState::Submitted);
        }
        assert_eq!(sync.frame_number(), 3);
        assert_eq!(surface.presented, vec![0, 1, 2]);
    }

    #[test]
    fn fence_is_waited_before_acquire_and_reset_after() {
        let (device, mut surface, mut ctx, mut sync) = setup(2);
        device.clear_calls();
        sync.ready_frame(&device, &mut surface, &mut ctx).unwrap().unwrap();
        let fence = sync.slot(0).fence();
        assert_eq!(device.calls(), vec![DeviceCall::WaitFence(fence), DeviceCall::ResetFence(fence)]);
    }

    #[test]
    fn main_pass_waits_on_acquire_without_prepass() {
        let (device, mut surface, mut ctx, mut sync) = setup(2);
        sync.ready_frame(&device, &mut surface, &mut ctx).unwrap();
        let slot = sync.slot(0);
        let (acquired, finished, fence) = (slot.image_acquired(), slot.render_finished(), slot.fence());
        sync.swap_frame(&device, &mut surface, &mut ctx, &staged(false)).unwrap();

        assert_eq!(
            submits(&device),
            vec![DeviceCall::Submit {
                command_buffers: vec![CommandBufferHandle::from_raw(901)],
                wait: vec![acquired],
                signal: vec![finished],
                fence,
            }]
        );
    }

    #[test]
    fn prepass_is_chained_into_the_main_pass() {
        let (device, mut surface, mut ctx, mut sync) = setup(2);
        sync.ready_frame(&device, &mut surface, &mut ctx).unwrap();
        let slot = sync.slot(0);
        let (acquired, prepass, finished) = (slot.image_acquired(), slot.prepass_finished(), slot.render_finished());
        sync.swap_frame(&device, &mut surface, &mut ctx, &staged(true)).unwrap();

        let submits = submits(&device);
        assert_eq!(submits.len(), 2);
        assert!(matches!(&submits[0], DeviceCall::Submit { wait, signal, fence, .. }
            if *wait == vec![acquired] && *signal == vec![prepass] && !fence.is_valid()));
        assert!(matches!(&submits[1], DeviceCall::Submit { wait, signal, fence, .. }
            if *wait == vec![prepass] && *signal == vec![finished] && fence.is_valid()));
    }

    #[test]
    fn out_of_date_acquire_rebuilds_and_skips_the_frame() {
        let (device, mut surface, mut ctx, mut sync) = setup(2);
        surface.script_acquire(AcquireOutcome::OutOfDate);

        assert!(sync.ready_frame(&device, &mut surface, &mut ctx).unwrap().is_none());
        assert_eq!(sync.rebuilds(), 1);
        assert_eq!(surface.swapchains_created, 2);
        assert_eq!(sync.slot(0).state(), FrameSlotState::Idle);

        assert!(sync.ready_frame(&device, &mut surface, &mut ctx).unwrap().is_some());
    }

    #[test]
    fn suboptimal_present_rebuilds_after_the_frame() {
        let (device, mut surface, mut ctx, mut sync) = setup(2);
        surface.script_present(PresentOutcome::Suboptimal);
        sync.ready_frame(&device, &mut surface, &mut ctx).unwrap();
        sync.swap_frame(&device, &mut surface, &mut ctx, &staged(false)).unwrap();
        assert_eq!(sync.rebuilds(), 1);
        assert!(device.calls().contains(&DeviceCall::WaitIdle));
    }

    #[test]
    fn suboptimal_acquire_still_renders() {
        let (device, mut surface, mut ctx, mut sync) = setup(2);
        surface.script_acquire(AcquireOutcome::Acquired { image_index: 1, suboptimal: true });
        let target = sync.ready_frame(&device, &mut surface, &mut ctx).unwrap().unwrap();
        assert_eq!(target.image_index, 1);
        assert_eq!(sync.rebuilds(), 0);
        sync.swap_frame(&device, &mut surface, &mut ctx, &staged(false)).unwrap();
        assert_eq!(sync.rebuilds(), 1);
    }

    #[test]
    fn resize_triggers_rebuild_and_minimise_skips() {
        let (device, mut surface, mut ctx, mut sync) = setup(2);
        surface.size = Extent2D::new(0, 0);
        assert!(sync.ready_frame(&device, &mut surface, &mut ctx).unwrap().is_none());
        assert_eq!(sync.rebuilds(), 0);

        surface.size = Extent2D::new(1024, 768);
        let target = sync.ready_frame(&device, &mut surface, &mut ctx).unwrap().unwrap();
        assert_eq!(target.extent, Extent2D::new(1024, 768));
        assert_eq!(sync.rebuilds(), 1);
    }

    #[test]
    fn pre_run_callbacks_run_once_after_acquire() {
        let (device, mut surface, mut ctx, mut sync) = setup(2);
        let runs = Rc::new(Cell::new(0));
        let counter = Rc::clone(&runs);
        sync.queue_pre_run(move |_| counter.set(counter.get() + 1));

        surface.script_acquire(AcquireOutcome::OutOfDate);
        sync.ready_frame(&device, &mut surface, &mut ctx).unwrap();
        assert_eq!(runs.get(), 0);

        sync.ready_frame(&device, &mut surface, &mut ctx).unwrap();
        sync.swap_frame(&device, &mut surface, &mut ctx, &staged(false)).unwrap();
        sync.ready_frame(&device, &mut surface, &mut ctx).unwrap();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn trash_cycles_once_per_ready_frame() {
        let (device, mut surface, mut ctx, mut sync) = setup(2);
        let (buffer, memory) = device
            .create_buffer(64, crate::gpu::BufferUsage::VERTEX, crate::gpu::MemoryProperties::HOST_STREAMING)
            .unwrap();
        ctx.retire(crate::frame::trash::TrashEntry::new().buffer(buffer, memory));

        sync.ready_frame(&device, &mut surface, &mut ctx).unwrap();
        sync.swap_frame(&device, &mut surface, &mut ctx, &staged(false)).unwrap();
        assert!(device.is_live(buffer.raw()));
        sync.ready_frame(&device, &mut surface, &mut ctx).unwrap();
        assert!(!device.is_live(buffer.raw()));
    }

    #[test]
    fn abandoned_frame_signals_the_fence_and_forces_a_rebuild() {
        let (device, mut surface, mut ctx, mut sync) = setup(2);
        sync.ready_frame(&device, &mut surface, &mut ctx).unwrap().unwrap();
        let (acquired, fence) = (sync.slot(0).image_acquired(), sync.slot(0).fence());

        device.fail_next_submits(1);
        assert!(sync.swap_frame(&device, &mut surface, &mut ctx, &staged(false)).is_err());
        assert_eq!(sync.slot(0).state(), FrameSlotState::Recording);

        device.clear_calls();
        sync.abandon_frame(&device).unwrap();
        assert_eq!(
            submits(&device),
            vec![DeviceCall::Submit {
                command_buffers: Vec::new(),
                wait: vec![acquired],
                signal: Vec::new(),
                fence,
            }]
        );
        assert_eq!(sync.slot(0).state(), FrameSlotState::Submitted);
        assert!(surface.presented.is_empty());

        let target = sync.ready_frame(&device, &mut surface, &mut ctx).unwrap().unwrap();
        assert_eq!(target.slot, 0);
        assert_eq!(sync.rebuilds(), 1);
        sync.swap_frame(&device, &mut surface, &mut ctx, &staged(false)).unwrap();
        assert_eq!(surface.presented.len(), 1);
    }

    #[test]
    fn abandon_after_prepass_does_not_wait_on_the_consumed_acquire() {
        let (device, mut surface, mut ctx, mut sync) = setup(2);
        sync.ready_frame(&device, &mut surface, &mut ctx).unwrap().unwrap();
        sync.prepass_submitted = true;

        device.clear_calls();
        sync.abandon_frame(&device).unwrap();
        let submitted = submits(&device);
        assert!(matches!(&submitted[..], [DeviceCall::Submit { wait, .. }] if wait.is_empty()));
    }

    #[test]
    fn abandon_outside_recording_does_nothing() {
        let (device, _surface, _ctx, mut sync) = setup(2);
        device.clear_calls();
        sync.abandon_frame(&device).unwrap();
        assert!(submits(&device).is_empty());
        assert_eq!(sync.slot(0).state(), FrameSlotState::Idle);
    }
}
