//! Per-frame synchronisation slots
//!
//! Each of the `F` rotating slots owns a fence (CPU waits for the GPU to finish
//! the slot's previous frame), an image-acquired semaphore, a render-finished
//! semaphore and an internal pre-pass-finished semaphore that chains the
//! pre-pass submission into the main pass.
//!
//! ```text
//! Idle -> Acquiring -> Recording -> Submitted -> (fence signalled) -> Idle
//!             |
//!             +-- out of date --> Idle
//! ```

use crate::gpu::{FenceHandle, GpuDevice, GpuResult, SemaphoreHandle};

/// Lifecycle of a frame slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSlotState {
    /// Free for a new frame once its fence is waited on
    Idle,
    /// Waiting on swapchain image acquisition
    Acquiring,
    /// Commands for this slot are being recorded
    Recording,
    /// Work is on the GPU; the fence signals completion
    Submitted,
}

/// One rotating frame context
#[derive(Debug)]
pub struct FrameSlot {
    fence: FenceHandle,
    image_acquired: SemaphoreHandle,
    render_finished: SemaphoreHandle,
    prepass_finished: SemaphoreHandle,
    image_index: u32,
    state: FrameSlotState,
}

impl FrameSlot {
    /// Create the slot's objects; the fence starts signalled so the first wait returns at once
    ///
    /// # Errors
    ///
    /// Fence or semaphore creation failure.
    pub fn new(device: &dyn GpuDevice) -> GpuResult<Self> {
        let fence = device.create_fence(true)?;
        let mut slot = Self {
            fence,
            image_acquired: SemaphoreHandle::NULL,
            render_finished: SemaphoreHandle::NULL,
            prepass_finished: SemaphoreHandle::NULL,
            image_index: 0,
            state: FrameSlotState::Idle,
        };
        if let Err(err) = slot.create_semaphores(device) {
            slot.destroy(device);
            return Err(err);
        }
        Ok(slot)
    }

    fn create_semaphores(&mut self, device: &dyn GpuDevice) -> GpuResult<()> {
        self.image_acquired = device.create_semaphore()?;
        self.render_finished = device.create_semaphore()?;
        self.prepass_finished = device.create_semaphore()?;
        Ok(())
    }

    fn destroy_semaphores(&mut self, device: &dyn GpuDevice) {
        for semaphore in [
            self.image_acquired.take(),
            self.render_finished.take(),
            self.prepass_finished.take(),
        ] {
            if semaphore.is_valid() {
                device.destroy_semaphore(semaphore);
            }
        }
    }

    /// Replace the semaphores after a swapchain rebuild
    ///
    /// The device must be idle: an acquire that raced the rebuild may have
    /// left a semaphore signalled with nobody waiting on it.
    ///
    /// # Errors
    ///
    /// Semaphore creation failure.
    pub fn recreate_semaphores(&mut self, device: &dyn GpuDevice) -> GpuResult<()> {
        self.destroy_semaphores(device);
        self.state = FrameSlotState::Idle;
        self.create_semaphores(device)
    }

    /// Block until the GPU has finished this slot's previous frame
    ///
    /// # Errors
    ///
    /// Timeout or device loss.
    pub fn wait(&mut self, device: &dyn GpuDevice, timeout_ns: u64) -> GpuResult<()> {
        device.wait_for_fence(self.fence, timeout_ns)?;
        if self.state == FrameSlotState::Submitted {
            self.state = FrameSlotState::Idle;
        }
        Ok(())
    }

    /// Idle -> Acquiring
    ///
    /// # Panics
    ///
    /// Panics if another frame is still using the slot.
    pub fn begin_acquire(&mut self) {
        assert_eq!(self.state, FrameSlotState::Idle, "frame slot reused before its fence was waited on");
        self.state = FrameSlotState::Acquiring;
    }

    /// Acquiring -> Recording, once an image was acquired and the fence reset
    ///
    /// # Panics
    ///
    /// Panics outside of acquisition.
    pub fn begin_recording(&mut self, image_index: u32) {
        assert_eq!(self.state, FrameSlotState::Acquiring, "recording without an acquired image");
        self.image_index = image_index;
        self.state = FrameSlotState::Recording;
    }

    /// Acquiring -> Idle, when acquisition reported an out-of-date swapchain
    pub fn abandon(&mut self) {
        if self.state == FrameSlotState::Acquiring {
            self.state = FrameSlotState::Idle;
        }
    }

    /// Whether a frame is being recorded in this slot
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        matches!(self.state, FrameSlotState::Recording)
    }

    /// Recording -> Submitted
    ///
    /// # Panics
    ///
    /// Panics if nothing was being recorded.
    pub fn mark_submitted(&mut self) {
        assert_eq!(self.state, FrameSlotState::Recording, "submitting a slot that is not recording");
        self.state = FrameSlotState::Submitted;
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> FrameSlotState {
        self.state
    }

    /// Fence signalled when the slot's frame completes
    #[must_use]
    pub const fn fence(&self) -> FenceHandle {
        self.fence
    }

    /// Semaphore signalled by image acquisition
    #[must_use]
    pub const fn image_acquired(&self) -> SemaphoreHandle {
        self.image_acquired
    }

    /// Semaphore signalled by the main pass, waited on by present
    #[must_use]
    pub const fn render_finished(&self) -> SemaphoreHandle {
        self.render_finished
    }

    /// Semaphore chaining the pre-pass into the main pass
    #[must_use]
    pub const fn prepass_finished(&self) -> SemaphoreHandle {
        self.prepass_finished
    }

    /// Swapchain image acquired for the frame being recorded
    #[must_use]
    pub const fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Release the slot's objects; the device must be idle
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        self.destroy_semaphores(device);
        let fence = self.fence.take();
        if fence.is_valid() {
            device.destroy_fence(fence);
        }
    }
}
