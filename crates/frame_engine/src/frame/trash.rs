//! Deferred destruction ("buffer trash")
//!
//! A resource that is replaced while frames are in flight may still be read by
//! the GPU for up to `F` frames. Instead of destroying it, its owner bundles the
//! handles into a [`TrashEntry`] and hands it to [`BufferTrash::add`]. Each
//! entry starts with `delay = F` and is decremented once per frame boundary by
//! [`BufferTrash::cycle`]; it is only physically destroyed when the counter
//! reaches zero, by which point every frame that could reference it has been
//! fenced.

use super::descriptors::{DescriptorAllocator, FrameSets};
use crate::gpu::{
    BufferHandle, FramebufferHandle, GpuDevice, ImageHandle, ImageViewHandle, MemoryHandle,
    RenderPassHandle, SamplerHandle, SemaphoreHandle,
};

/// A bundle of handles destroyed together once the GPU has moved past them
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrashEntry {
    buffers: Vec<BufferHandle>,
    memories: Vec<MemoryHandle>,
    images: Vec<ImageHandle>,
    views: Vec<ImageViewHandle>,
    samplers: Vec<SamplerHandle>,
    framebuffers: Vec<FramebufferHandle>,
    render_passes: Vec<RenderPassHandle>,
    semaphores: Vec<SemaphoreHandle>,
    descriptor_sets: Vec<FrameSets>,
    delay: usize,
}

impl TrashEntry {
    /// Empty bundle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a buffer and the memory bound to it
    #[must_use]
    pub fn buffer(mut self, buffer: BufferHandle, memory: MemoryHandle) -> Self {
        self.buffers.push(buffer);
        self.memories.push(memory);
        self
    }

    /// Add an image and its memory
    #[must_use]
    pub fn image(mut self, image: ImageHandle, memory: MemoryHandle) -> Self {
        self.images.push(image);
        self.memories.push(memory);
        self
    }

    /// Add an image view
    #[must_use]
    pub fn view(mut self, view: ImageViewHandle) -> Self {
        self.views.push(view);
        self
    }

    /// Add a sampler
    #[must_use]
    pub fn sampler(mut self, sampler: SamplerHandle) -> Self {
        self.samplers.push(sampler);
        self
    }

    /// Add a framebuffer
    #[must_use]
    pub fn framebuffer(mut self, framebuffer: FramebufferHandle) -> Self {
        self.framebuffers.push(framebuffer);
        self
    }

    /// Add a render pass
    #[must_use]
    pub fn render_pass(mut self, render_pass: RenderPassHandle) -> Self {
        self.render_passes.push(render_pass);
        self
    }

    /// Add a semaphore
    #[must_use]
    pub fn semaphore(mut self, semaphore: SemaphoreHandle) -> Self {
        self.semaphores.push(semaphore);
        self
    }

    /// Add per-frame descriptor sets; they return to their own pool
    #[must_use]
    pub fn descriptor_sets(mut self, sets: FrameSets) -> Self {
        self.descriptor_sets.push(sets);
        self
    }

    /// Whether nothing was bundled
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
            && self.memories.is_empty()
            && self.images.is_empty()
            && self.views.is_empty()
            && self.samplers.is_empty()
            && self.framebuffers.is_empty()
            && self.render_passes.is_empty()
            && self.semaphores.is_empty()
            && self.descriptor_sets.is_empty()
    }

    /// Frames left before destruction
    #[must_use]
    pub const fn delay(&self) -> usize {
        self.delay
    }

    fn all_valid(&self) -> bool {
        self.buffers.iter().all(|h| h.is_valid())
            && self.memories.iter().all(|h| h.is_valid())
            && self.images.iter().all(|h| h.is_valid())
            && self.views.iter().all(|h| h.is_valid())
            && self.samplers.iter().all(|h| h.is_valid())
            && self.framebuffers.iter().all(|h| h.is_valid())
            && self.render_passes.iter().all(|h| h.is_valid())
            && self.semaphores.iter().all(|h| h.is_valid())
            && self
                .descriptor_sets
                .iter()
                .all(|sets| sets.as_slice().iter().all(|h| h.is_valid()))
    }

    fn destroy(self, device: &dyn GpuDevice, descriptors: &mut DescriptorAllocator) {
        for sets in &self.descriptor_sets {
            descriptors.free_sets(device, sets);
        }
        for framebuffer in self.framebuffers {
            device.destroy_framebuffer(framebuffer);
        }
        for render_pass in self.render_passes {
            device.destroy_render_pass(render_pass);
        }
        for view in self.views {
            device.destroy_image_view(view);
        }
        for sampler in self.samplers {
            device.destroy_sampler(sampler);
        }
        for image in self.images {
            device.destroy_image(image);
        }
        for buffer in self.buffers {
            device.destroy_buffer(buffer);
        }
        for memory in self.memories {
            device.free_memory(memory);
        }
        for semaphore in self.semaphores {
            device.destroy_semaphore(semaphore);
        }
    }
}

/// Delay-counted destruction queue
#[derive(Debug)]
pub struct BufferTrash {
    entries: Vec<TrashEntry>,
    frames_in_flight: usize,
}

impl BufferTrash {
    /// Queue for `frames_in_flight` frame slots
    #[must_use]
    pub const fn new(frames_in_flight: usize) -> Self {
        Self {
            entries: Vec::new(),
            frames_in_flight,
        }
    }

    /// Number of entries waiting for destruction
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue an entry; it is destroyed after `F` calls to [`Self::cycle`]
    ///
    /// Null handles in the bundle are a caller bug and abort debug builds.
    pub fn add(&mut self, mut entry: TrashEntry) {
        debug_assert!(entry.all_valid(), "null handle queued for deferred destruction: {entry:?}");
        if entry.is_empty() {
            return;
        }
        entry.delay = self.frames_in_flight;
        self.entries.push(entry);
    }

    /// Advance one frame boundary, destroying every entry whose delay runs out
    ///
    /// Never blocks; the caller has already waited on the fence of the slot
    /// being reused.
    pub fn cycle(&mut self, device: &dyn GpuDevice, descriptors: &mut DescriptorAllocator) {
        for index in (0..self.entries.len()).rev() {
            let entry = &mut self.entries[index];
            entry.delay = entry.delay.saturating_sub(1);
            if entry.delay == 0 {
                self.entries.swap_remove(index).destroy(device, descriptors);
            }
        }
    }

    /// Destroy everything, cycling until the queue is empty
    ///
    /// Shutdown only: no further frames may be submitted and the device must be idle.
    pub fn purge(&mut self, device: &dyn GpuDevice, descriptors: &mut DescriptorAllocator) {
        let mut cycles = 0;
        while !self.entries.is_empty() {
            self.cycle(device, descriptors);
            cycles += 1;
        }
        if cycles > 0 {
            log::debug!("Purged deferred destruction queue in {cycles} cycles");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BufferUsage, DescriptorSetLayoutHandle, MemoryProperties};
    use crate::testing::{DeviceCall, MockDevice};

    fn buffer(device: &MockDevice) -> (BufferHandle, MemoryHandle) {
        device
            .create_buffer(256, BufferUsage::STORAGE, MemoryProperties::HOST_STREAMING)
            .unwrap()
    }

    #[test]
    fn entry_is_destroyed_after_exactly_frames_in_flight_cycles() {
        for frames in 1..=3 {
            let device = MockDevice::new();
            let mut descriptors = DescriptorAllocator::new(frames, 4);
            let mut trash = BufferTrash::new(frames);
            let (buf, mem) = buffer(&device);
            trash.add(TrashEntry::new().buffer(buf, mem));

            for _ in 0..frames - 1 {
                trash.cycle(&device, &mut descriptors);
            }
            assert!(device.destroyed_buffers().is_empty());
            assert!(device.is_live(buf.raw()));
            assert_eq!(trash.len(), 1);

            trash.cycle(&device, &mut descriptors);
            assert_eq!(device.destroyed_buffers(), vec![buf]);
            assert!(!device.is_live(mem.raw()));
            assert!(trash.is_empty());
        }
    }

    #[test]
    fn entries_added_on_different_frames_expire_independently() {
        let device = MockDevice::new();
        let mut descriptors = DescriptorAllocator::new(2, 4);
        let mut trash = BufferTrash::new(2);
        let (first, first_mem) = buffer(&device);
        let (second, second_mem) = buffer(&device);

        trash.add(TrashEntry::new().buffer(first, first_mem));
        trash.cycle(&device, &mut descriptors);
        trash.add(TrashEntry::new().buffer(second, second_mem));
        trash.cycle(&device, &mut descriptors);
        assert_eq!(device.destroyed_buffers(), vec![first]);

        trash.cycle(&device, &mut descriptors);
        assert_eq!(device.destroyed_buffers(), vec![first, second]);
    }

    #[test]
    fn descriptor_sets_return_to_their_pool() {
        let device = MockDevice::new();
        let mut descriptors = DescriptorAllocator::new(2, 4);
        let mut trash = BufferTrash::new(2);
        let sets = descriptors
            .allocate_set(&device, DescriptorSetLayoutHandle::from_raw(500), 0)
            .unwrap();

        trash.add(TrashEntry::new().descriptor_sets(sets));
        trash.purge(&device, &mut descriptors);

        assert_eq!(descriptors.live_sets(0), 0);
        assert!(device
            .calls()
            .iter()
            .any(|call| matches!(call, DeviceCall::FreeDescriptorSets { sets: freed, .. } if freed.as_slice() == sets.as_slice())));
    }

    #[test]
    fn purge_empties_the_queue() {
        let device = MockDevice::new();
        let mut descriptors = DescriptorAllocator::new(3, 4);
        let mut trash = BufferTrash::new(3);
        for _ in 0..5 {
            let (buf, mem) = buffer(&device);
            trash.add(TrashEntry::new().buffer(buf, mem));
            trash.cycle(&device, &mut descriptors);
        }
        trash.purge(&device, &mut descriptors);
        assert!(trash.is_empty());
        assert_eq!(device.destroyed_buffers().len(), 5);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "null handle")]
    fn null_handle_is_fatal_in_debug_builds() {
        let mut trash = BufferTrash::new(2);
        trash.add(TrashEntry::new().buffer(BufferHandle::NULL, MemoryHandle::NULL));
    }
}
