//! Render-thread state shared by the frame subsystems

use super::descriptors::DescriptorAllocator;
use super::passes::RenderPassCache;
use super::trash::{BufferTrash, TrashEntry};
use crate::gpu::GpuDevice;

/// Deferred-destruction queue, descriptor pools and the render-pass cache
///
/// Owned by the top-level renderer and lent to whichever subsystem needs it
/// for the duration of a call; nothing here is global.
#[derive(Debug)]
pub struct RenderContext {
    /// Deferred destruction queue
    pub trash: BufferTrash,
    /// Descriptor pool list
    pub descriptors: DescriptorAllocator,
    /// Swapchain-dependent passes
    pub passes: RenderPassCache,
    frames_in_flight: usize,
}

impl RenderContext {
    /// Context for `frames_in_flight` slots
    #[must_use]
    pub fn new(frames_in_flight: usize, descriptor_sets_per_pool: u32) -> Self {
        Self {
            trash: BufferTrash::new(frames_in_flight),
            descriptors: DescriptorAllocator::new(frames_in_flight, descriptor_sets_per_pool),
            passes: RenderPassCache::new(),
            frames_in_flight,
        }
    }

    /// Number of frame slots
    #[must_use]
    pub const fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Queue resources for deferred destruction
    pub fn retire(&mut self, entry: TrashEntry) {
        self.trash.add(entry);
    }

    /// Frame boundary step of the destruction queue
    pub fn cycle(&mut self, device: &dyn GpuDevice) {
        self.trash.cycle(device, &mut self.descriptors);
    }

    /// Tear everything down in dependency order; the device must be idle
    pub fn shutdown(&mut self, device: &dyn GpuDevice) {
        self.passes.destroy_all(device);
        self.trash.purge(device, &mut self.descriptors);
        self.descriptors.destroy(device);
    }
}
