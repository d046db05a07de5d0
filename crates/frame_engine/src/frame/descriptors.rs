//! Descriptor pool/set allocation with transparent pool overflow
//!
//! Pools are sized for the fixed catalog in [`DescriptorKind::ALL`], scaled by
//! the number of frame slots, and are never resized: when a pool runs dry the
//! allocator moves on to the next one and appends a fresh pool once the list
//! is exhausted. Every allocation hands back one set per frame slot together
//! with the index of the pool that backs them, so the sets can later be freed
//! through that same pool.

use crate::gpu::{
    DescriptorKind, DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle,
    GpuDevice, GpuError, GpuResult, PoolSize, ResourceKind,
};

/// Upper bound on frame slots; sizes the per-frame arrays
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// One descriptor set per frame slot, all backed by the same pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSets {
    sets: [DescriptorSetHandle; MAX_FRAMES_IN_FLIGHT],
    count: usize,
    pool_index: usize,
}

impl FrameSets {
    /// The set used by frame slot `frame`
    ///
    /// # Panics
    ///
    /// Panics if `frame` is not a slot these sets were allocated for.
    #[must_use]
    pub fn get(&self, frame: usize) -> DescriptorSetHandle {
        assert!(frame < self.count, "frame slot {frame} out of range ({} sets)", self.count);
        self.sets[frame]
    }

    /// All sets in slot order
    #[must_use]
    pub fn as_slice(&self) -> &[DescriptorSetHandle] {
        &self.sets[..self.count]
    }

    /// Index of the pool these sets were allocated from
    #[must_use]
    pub const fn pool_index(&self) -> usize {
        self.pool_index
    }
}

#[derive(Debug)]
struct PoolRecord {
    handle: DescriptorPoolHandle,
    max_sets: u32,
    live_sets: u32,
}

/// Append-only list of descriptor pools
#[derive(Debug)]
pub struct DescriptorAllocator {
    pools: Vec<PoolRecord>,
    frames_in_flight: usize,
    sets_per_kind: u32,
}

impl DescriptorAllocator {
    /// Allocator for `frames_in_flight` slots whose pools hold
    /// `sets_per_kind` sets of each descriptor kind per slot
    ///
    /// # Panics
    ///
    /// Panics if `frames_in_flight` is zero or above [`MAX_FRAMES_IN_FLIGHT`].
    #[must_use]
    pub fn new(frames_in_flight: usize, sets_per_kind: u32) -> Self {
        assert!(
            (1..=MAX_FRAMES_IN_FLIGHT).contains(&frames_in_flight),
            "frames in flight must be within 1..={MAX_FRAMES_IN_FLIGHT}"
        );
        Self {
            pools: Vec::new(),
            frames_in_flight,
            sets_per_kind: sets_per_kind.max(1),
        }
    }

    /// Number of pools created so far
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Sets currently allocated from the pool at `index`
    #[must_use]
    pub fn live_sets(&self, index: usize) -> u32 {
        self.pools.get(index).map_or(0, |pool| pool.live_sets)
    }

    /// Create a pool sized for `estimated` sets of every descriptor kind per frame slot
    ///
    /// Returns the new pool's index.
    ///
    /// # Errors
    ///
    /// Propagates pool creation failure.
    pub fn allocate_pool(&mut self, device: &dyn GpuDevice, estimated: u32) -> GpuResult<usize> {
        let per_kind = estimated.max(1) * self.frames_in_flight as u32;
        let sizes: Vec<PoolSize> = DescriptorKind::ALL
            .iter()
            .map(|&kind| PoolSize { kind, count: per_kind })
            .collect();
        let handle = device.create_descriptor_pool(&sizes, per_kind)?;
        self.pools.push(PoolRecord { handle, max_sets: per_kind, live_sets: 0 });
        log::debug!(
            "Created descriptor pool #{} ({per_kind} sets, {per_kind} descriptors per kind)",
            self.pools.len() - 1
        );
        Ok(self.pools.len() - 1)
    }

    /// Allocate one set per frame slot, starting the search at `pool_index`
    ///
    /// An exhausted pool sends the request on to the next pool; past the end of
    /// the list a fresh pool is created. Sets partially allocated from a pool
    /// that ran dry are returned to it before moving on.
    ///
    /// # Errors
    ///
    /// Any failure other than pool exhaustion, including failing to create the
    /// overflow pool.
    pub fn allocate_set(
        &mut self,
        device: &dyn GpuDevice,
        layout: DescriptorSetLayoutHandle,
        pool_index: usize,
    ) -> GpuResult<FrameSets> {
        if pool_index >= self.pools.len() {
            let created = self.allocate_pool(device, self.sets_per_kind)?;
            return self.allocate_from(device, layout, created).and_then(|sets| {
                sets.ok_or_else(|| GpuError::Creation {
                    kind: ResourceKind::DescriptorSet,
                    reason: "a fresh pool cannot hold one set per frame slot".to_owned(),
                })
            });
        }

        match self.allocate_from(device, layout, pool_index)? {
            Some(sets) => Ok(sets),
            None => {
                log::trace!("Descriptor pool #{pool_index} exhausted, trying #{}", pool_index + 1);
                self.allocate_set(device, layout, pool_index + 1)
            }
        }
    }

    /// `Ok(None)` means the pool is exhausted
    fn allocate_from(
        &mut self,
        device: &dyn GpuDevice,
        layout: DescriptorSetLayoutHandle,
        pool_index: usize,
    ) -> GpuResult<Option<FrameSets>> {
        let pool = self.pools[pool_index].handle;
        let mut sets = [DescriptorSetHandle::NULL; MAX_FRAMES_IN_FLIGHT];

        for frame in 0..self.frames_in_flight {
            match device.allocate_descriptor_set(pool, layout) {
                Ok(set) => sets[frame] = set,
                Err(err) => {
                    if frame > 0 {
                        device.free_descriptor_sets(pool, &sets[..frame]);
                    }
                    return match err {
                        GpuError::OutOfPoolMemory => Ok(None),
                        other => Err(other),
                    };
                }
            }
        }

        self.pools[pool_index].live_sets += self.frames_in_flight as u32;
        Ok(Some(FrameSets {
            sets,
            count: self.frames_in_flight,
            pool_index,
        }))
    }

    /// Return sets to the pool that backs them
    ///
    /// # Panics
    ///
    /// Panics if the sets name a pool this allocator never created.
    pub fn free_sets(&mut self, device: &dyn GpuDevice, sets: &FrameSets) {
        let pool = self
            .pools
            .get_mut(sets.pool_index)
            .unwrap_or_else(|| panic!("descriptor pool #{} does not exist", sets.pool_index));
        device.free_descriptor_sets(pool.handle, sets.as_slice());
        pool.live_sets = pool.live_sets.saturating_sub(sets.count as u32);
    }

    /// Destroy every pool
    ///
    /// Call only after the deferred-destruction queue has been purged.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for (index, pool) in self.pools.drain(..).enumerate() {
            if pool.live_sets > 0 {
                log::warn!(
                    "Destroying descriptor pool #{index} with {} of {} sets still allocated",
                    pool.live_sets,
                    pool.max_sets
                );
            }
            device.destroy_descriptor_pool(pool.handle);
        }
    }
}
