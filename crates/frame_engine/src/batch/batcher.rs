//! Routing of instances into per (mesh, material) groups

use std::collections::HashMap;
use std::rc::Rc;

use slotmap::{new_key_type, SlotMap};

use super::group::{DrawInstanceGroup, GroupLimits};
use super::instance::InstanceRef;
use super::material::{Material, MeshRef};
use crate::frame::{BufferTrash, RenderContext};
use crate::gpu::{CommandBufferHandle, GpuDevice};

new_key_type! {
    /// Stable identifier of a draw group
    pub struct GroupId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GroupKey {
    mesh: u64,
    material: u64,
}

/// Per-frame batching summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Groups alive after the update
    pub groups: usize,
    /// Instances written across all groups
    pub visible_instances: usize,
    /// Groups whose buffers grew this frame
    pub reallocations: usize,
    /// Groups skipped because their upload failed
    pub failed_groups: usize,
}

/// Owns every draw group and routes new instances to them
#[derive(Debug)]
pub struct DrawBatcher {
    groups: SlotMap<GroupId, DrawInstanceGroup>,
    lookup: HashMap<GroupKey, GroupId>,
    failed: Vec<GroupId>,
    limits: GroupLimits,
}

impl DrawBatcher {
    /// Empty batcher
    #[must_use]
    pub fn new(limits: GroupLimits) -> Self {
        Self {
            groups: SlotMap::with_key(),
            lookup: HashMap::new(),
            failed: Vec::new(),
            limits,
        }
    }

    /// Add an instance to the group of its mesh and material, creating the group on first use
    pub fn add(&mut self, mesh: MeshRef, material: &Rc<Material>, instance: InstanceRef) -> GroupId {
        let key = GroupKey {
            mesh: mesh.id,
            material: material.id,
        };
        let id = match self.lookup.get(&key) {
            Some(&id) => id,
            None => {
                let id = self
                    .groups
                    .insert(DrawInstanceGroup::new(mesh, Rc::clone(material), self.limits));
                self.lookup.insert(key, id);
                log::debug!("New draw group for mesh {} / material {}", mesh.id, material.id);
                id
            }
        };
        self.groups[id].add_instance(instance);
        id
    }

    /// Compact, grow and upload every group for frame slot `frame`
    ///
    /// Groups left without instances are torn down. A group whose upload fails
    /// is logged and skipped for this frame; the others still draw.
    pub fn update(&mut self, device: &dyn GpuDevice, ctx: &mut RenderContext, frame: usize) -> BatchStats {
        let mut stats = BatchStats::default();
        let mut emptied = Vec::new();
        self.failed.clear();

        for (id, group) in &mut self.groups {
            stats.visible_instances += group.update_data();
            if group.is_empty() {
                emptied.push(id);
                continue;
            }
            match group.upload(device, ctx, frame) {
                Ok(true) => stats.reallocations += 1,
                Ok(false) => {}
                Err(err) => {
                    log::warn!("Skipping {group:?} this frame: {err}");
                    self.failed.push(id);
                }
            }
        }

        for id in emptied {
            self.remove_group(id, &mut ctx.trash);
        }
        stats.failed_groups = self.failed.len();
        stats.groups = self.groups.len();
        stats
    }

    fn remove_group(&mut self, id: GroupId, trash: &mut BufferTrash) {
        if let Some(mut group) = self.groups.remove(id) {
            self.lookup.retain(|_, existing| *existing != id);
            group.teardown(trash);
        }
    }

    fn drawable(&self) -> impl Iterator<Item = &DrawInstanceGroup> + '_ {
        self.groups
            .iter()
            .filter(|(id, _)| !self.failed.contains(id))
            .map(|(_, group)| group)
    }

    /// Record instance-texture uploads; must happen outside a render pass
    pub fn record_uploads(&self, device: &dyn GpuDevice, command_buffer: CommandBufferHandle, frame: usize) -> usize {
        self.drawable()
            .filter(|group| group.record_uploads(device, command_buffer, frame))
            .count()
    }

    /// Record one draw per group with visible instances; returns the draw count
    pub fn record_draws(&self, device: &dyn GpuDevice, command_buffer: CommandBufferHandle, frame: usize) -> usize {
        self.drawable()
            .filter(|group| group.record_draw(device, command_buffer, frame))
            .count()
    }

    /// A group by id
    #[must_use]
    pub fn group(&self, id: GroupId) -> Option<&DrawInstanceGroup> {
        self.groups.get(id)
    }

    /// Number of live groups
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether there are no groups
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Tear down every group into the destruction queue
    pub fn teardown_all(&mut self, trash: &mut BufferTrash) {
        for (_, mut group) in self.groups.drain() {
            group.teardown(trash);
        }
        self.lookup.clear();
        self.failed.clear();
    }
}
