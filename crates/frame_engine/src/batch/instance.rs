//! Drawable instances as seen by the batch engine
//!
//! The scene hands the batcher shared, interior-mutable instances. The batcher
//! only ever talks to them through [`DrawInstance`]: liveness, visibility, a
//! lazily recomputed model matrix, the packed per-instance bytes and optional
//! named auxiliary data such as a skinning palette.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::{to_cols_array, Mat4, Transform, Vec3};

/// Capability set the batch engine consumes from a drawable instance
pub trait DrawInstance {
    /// Removed from the scene; the batcher drops it on the next update
    fn is_destroyed(&self) -> bool;

    /// Should be drawn this frame
    fn is_active(&self) -> bool;

    /// The source transform changed since the last [`Self::update_model`]
    fn is_transform_dirty(&self) -> bool;

    /// Recompute the model matrix from the transform
    fn update_model(&mut self);

    /// Packed shader data for this instance
    fn data(&self) -> &[u8];

    /// Prepare named auxiliary data for slot `index` of a buffer holding
    /// `capacity` elements per instance; `true` asks the batcher to copy
    /// [`Self::named_data`] in
    fn update_named_data(&mut self, _index: usize, _capacity: usize, _name: &str) -> bool {
        false
    }

    /// Bytes of the named auxiliary buffer `name`
    fn named_data(&self, _name: &str) -> Option<&[u8]> {
        None
    }

    /// Bytes per instance this instance writes into `name`
    fn named_data_instance_size(&self, _name: &str) -> usize {
        0
    }
}

/// Shared handle to an instance; the scene and the batcher both hold one
pub type InstanceRef = Rc<RefCell<dyn DrawInstance>>;

/// Per-instance shader data of the built-in instance kinds
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ModelData {
    /// Column-major model matrix
    pub model: [[f32; 4]; 4],
    /// RGBA tint
    pub color: [f32; 4],
}

impl ModelData {
    /// Size in bytes
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// A transform with change tracking
#[derive(Debug, Clone)]
pub struct InstanceTransform {
    transform: Transform,
    dirty: bool,
}

impl InstanceTransform {
    /// Wrap a transform; starts dirty so the first update computes the matrix
    #[must_use]
    pub const fn new(transform: Transform) -> Self {
        Self { transform, dirty: true }
    }

    /// Current transform
    #[must_use]
    pub const fn get(&self) -> &Transform {
        &self.transform
    }

    /// Replace the transform
    pub fn set(&mut self, transform: Transform) {
        self.transform = transform;
        self.dirty = true;
    }

    /// Move to `position`
    pub fn set_position(&mut self, position: Vec3) {
        self.transform.position = position;
        self.dirty = true;
    }

    /// Whether the matrix needs recomputing
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Compute the model matrix and clear the dirty flag
    pub fn take_matrix(&mut self) -> Mat4 {
        self.dirty = false;
        self.transform.to_matrix()
    }
}

/// A plain instanced model: matrix + colour
#[derive(Debug)]
pub struct ModelInstance {
    transform: InstanceTransform,
    data: ModelData,
    active: bool,
    destroyed: bool,
    model_updates: usize,
    shadow: Option<Weak<RefCell<ModelInstance>>>,
}

impl ModelInstance {
    /// New active instance
    #[must_use]
    pub fn new(transform: Transform, color: [f32; 4]) -> Self {
        Self {
            transform: InstanceTransform::new(transform),
            data: ModelData {
                model: to_cols_array(&Mat4::identity()),
                color,
            },
            active: true,
            destroyed: false,
            model_updates: 0,
            shadow: None,
        }
    }

    /// Wrap into a shared handle
    #[must_use]
    pub fn shared(self) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(self))
    }

    /// Mutable access to the transform; marks it dirty on write
    pub fn transform_mut(&mut self) -> &mut InstanceTransform {
        &mut self.transform
    }

    /// Show or hide without removing
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Change the tint
    pub fn set_color(&mut self, color: [f32; 4]) {
        self.data.color = color;
    }

    /// Remove from the scene, taking the shadow caster with it
    pub fn destroy(&mut self) {
        self.destroyed = true;
        if let Some(shadow) = self.shadow() {
            if let Ok(mut shadow) = shadow.try_borrow_mut() {
                shadow.destroy();
            }
        }
    }

    /// Link a shadow caster that mirrors this instance's transform
    ///
    /// The link is non-owning: the shadow belongs to its own group.
    pub fn set_shadow(&mut self, shadow: &Rc<RefCell<Self>>) {
        self.shadow = Some(Rc::downgrade(shadow));
    }

    /// The shadow caster, if it is still alive
    #[must_use]
    pub fn shadow(&self) -> Option<Rc<RefCell<Self>>> {
        self.shadow.as_ref().and_then(Weak::upgrade)
    }

    /// Times the model matrix was recomputed
    #[must_use]
    pub const fn model_updates(&self) -> usize {
        self.model_updates
    }

    /// Current packed shader data
    #[must_use]
    pub const fn model_data(&self) -> &ModelData {
        &self.data
    }
}

impl DrawInstance for ModelInstance {
    fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn is_transform_dirty(&self) -> bool {
        self.transform.is_dirty()
    }

    fn update_model(&mut self) {
        self.data.model = to_cols_array(&self.transform.take_matrix());
        self.model_updates += 1;
        if let Some(shadow) = self.shadow() {
            // A shadow currently borrowed elsewhere picks the transform up next frame
            if let Ok(mut shadow) = shadow.try_borrow_mut() {
                shadow.transform.set(self.transform.get().clone());
            }
        }
    }

    fn data(&self) -> &[u8] {
        bytemuck::bytes_of(&self.data)
    }
}

/// Name of the skinning palette buffer
pub const SKIN_BUFFER: &str = "skin";

/// A model with a joint palette written into the [`SKIN_BUFFER`] named buffer
#[derive(Debug)]
pub struct SkinnedInstance {
    model: ModelInstance,
    joints: Vec<[[f32; 4]; 4]>,
    skin_dirty: bool,
    written_at: Option<usize>,
}

impl SkinnedInstance {
    /// New instance with an identity palette of `joint_count` joints
    #[must_use]
    pub fn new(transform: Transform, color: [f32; 4], joint_count: usize) -> Self {
        Self {
            model: ModelInstance::new(transform, color),
            joints: vec![to_cols_array(&Mat4::identity()); joint_count],
            skin_dirty: true,
            written_at: None,
        }
    }

    /// The underlying model instance
    pub fn model_mut(&mut self) -> &mut ModelInstance {
        &mut self.model
    }

    /// Replace the joint palette
    pub fn set_joints(&mut self, joints: &[Mat4]) {
        self.joints = joints.iter().map(to_cols_array).collect();
        self.skin_dirty = true;
    }
}

impl DrawInstance for SkinnedInstance {
    fn is_destroyed(&self) -> bool {
        self.model.is_destroyed()
    }

    fn is_active(&self) -> bool {
        self.model.is_active()
    }

    fn is_transform_dirty(&self) -> bool {
        self.model.is_transform_dirty()
    }

    fn update_model(&mut self) {
        self.model.update_model();
    }

    fn data(&self) -> &[u8] {
        self.model.data()
    }

    /// Rewrites only when the palette changed or compaction moved the instance
    fn update_named_data(&mut self, index: usize, capacity: usize, name: &str) -> bool {
        if name != SKIN_BUFFER {
            return false;
        }
        if self.joints.len() > capacity {
            log::warn!(
                "Skin palette of {} joints exceeds buffer capacity {capacity}; truncating",
                self.joints.len()
            );
            self.joints.truncate(capacity);
        }
        let write = self.skin_dirty || self.written_at != Some(index);
        self.skin_dirty = false;
        self.written_at = Some(index);
        write
    }

    fn named_data(&self, name: &str) -> Option<&[u8]> {
        (name == SKIN_BUFFER).then(|| bytemuck::cast_slice(self.joints.as_slice()))
    }

    fn named_data_instance_size(&self, name: &str) -> usize {
        if name == SKIN_BUFFER {
            std::mem::size_of_val(self.joints.as_slice())
        } else {
            0
        }
    }
}
