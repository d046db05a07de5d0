//! Per (mesh, material) instance batch
//!
//! A [`DrawInstanceGroup`] packs every live instance sharing a mesh and a
//! material into one CPU byte buffer, compacts visible instances to the front
//! on each update and streams the live region into a persistently mapped GPU
//! buffer holding one region per frame slot. Only the current slot's region is
//! ever written, so the other frames in flight keep reading stable data.
//!
//! Backing buffers follow a high-water mark: they are reallocated only when the
//! instance count exceeds the count they were sized for. The replaced buffers
//! and descriptor sets go through deferred destruction.

use std::rc::Rc;

use super::instance::InstanceRef;
use super::material::{Material, MeshRef, ShaderBinding};
use crate::frame::{BufferTrash, FrameSets, RenderContext, RenderTarget, TrashEntry};
use crate::gpu::{
    pad_buffer_size, BindPoint, BufferHandle, BufferUsage, CommandBufferHandle, DescriptorKind,
    DescriptorWrite, DeviceLimits, Extent2D, GpuDevice, GpuFormat, GpuResult, ImageDesc, ImageUsage,
    MemoryHandle, MemoryProperties, SamplerHandle,
};

/// Bytes per texel of the instance-data texture
pub const INSTANCE_TEXEL_SIZE: usize = GpuFormat::R32G32B32A32Sfloat.texel_size() as usize;

/// Sizing inputs shared by every group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLimits {
    /// Number of frame slots, one GPU region each
    pub frames_in_flight: usize,
    /// Texels per row of the instance-data texture
    pub row_texels: u32,
    /// Device alignment and image limits
    pub device: DeviceLimits,
}

/// Extent of an RGBA32F texture holding `bytes` of instance data
///
/// Rows are at most `row_texels` wide. `None` when more than `max_rows` rows
/// would be needed.
#[must_use]
pub fn instance_texture_extent(bytes: usize, row_texels: u32, max_rows: u32) -> Option<Extent2D> {
    let texels = bytes.div_ceil(INSTANCE_TEXEL_SIZE).max(1);
    let width = texels.min(row_texels.max(1) as usize);
    let height = texels.div_ceil(width);
    (height <= max_rows as usize).then(|| Extent2D::new(width as u32, height as u32))
}

/// Host-visible buffer split into one region per frame slot, mapped for its lifetime
#[derive(Debug, Clone, Copy)]
struct FrameRegions {
    buffer: BufferHandle,
    memory: MemoryHandle,
    region_size: u64,
}

impl FrameRegions {
    fn create(device: &dyn GpuDevice, region_size: u64, frames: usize, usage: BufferUsage) -> GpuResult<Self> {
        let total = region_size * frames as u64;
        let (buffer, memory) = device.create_buffer(total, usage, MemoryProperties::HOST_STREAMING)?;
        if let Err(err) = device.map_memory(memory, total) {
            // Never referenced by a command buffer, so it can go right away
            device.destroy_buffer(buffer);
            device.free_memory(memory);
            return Err(err);
        }
        Ok(Self { buffer, memory, region_size })
    }

    const fn offset(&self, frame: usize) -> u64 {
        self.region_size * frame as u64
    }

    fn retire(self, entry: TrashEntry) -> TrashEntry {
        entry.buffer(self.buffer, self.memory)
    }
}

#[derive(Debug)]
struct NamedBuffer {
    binding: ShaderBinding,
    bytes: Vec<u8>,
    // Instance whose data currently occupies each slot
    owners: Vec<Option<*const ()>>,
    gpu: Option<FrameRegions>,
}

#[derive(Debug)]
struct InstanceTexture {
    target: RenderTarget,
    sampler: SamplerHandle,
}

/// Instanced draw batch of one (mesh, material) pair
pub struct DrawInstanceGroup {
    mesh: MeshRef,
    material: Rc<Material>,
    instances: Vec<InstanceRef>,
    raw: Vec<u8>,
    padded_stride: usize,
    named: Vec<NamedBuffer>,
    instance_buffer: Option<FrameRegions>,
    texture: Option<InstanceTexture>,
    sets: Option<FrameSets>,
    pool_hint: usize,
    visible_count: usize,
    last_instance_count: usize,
    reallocations: usize,
    limits: GroupLimits,
}

impl std::fmt::Debug for DrawInstanceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrawInstanceGroup")
            .field("mesh", &self.mesh.id)
            .field("material", &self.material.id)
            .field("instances", &self.instances.len())
            .field("visible_count", &self.visible_count)
            .field("last_instance_count", &self.last_instance_count)
            .field("reallocations", &self.reallocations)
            .finish_non_exhaustive()
    }
}

impl DrawInstanceGroup {
    /// Empty group
    ///
    /// # Panics
    ///
    /// Panics if the shader declares a zero instance stride.
    #[must_use]
    pub fn new(mesh: MeshRef, material: Rc<Material>, limits: GroupLimits) -> Self {
        let stride = material.shader.instance_stride;
        assert!(stride > 0, "shader '{}' declares no instance data", material.shader.name);
        let named = material
            .shader
            .named_buffers
            .iter()
            .map(|binding| NamedBuffer {
                binding: binding.clone(),
                bytes: Vec::new(),
                owners: Vec::new(),
                gpu: None,
            })
            .collect();
        Self {
            mesh,
            material,
            instances: Vec::new(),
            raw: Vec::new(),
            padded_stride: stride.next_multiple_of(INSTANCE_TEXEL_SIZE),
            named,
            instance_buffer: None,
            texture: None,
            sets: None,
            pool_hint: 0,
            visible_count: 0,
            last_instance_count: 0,
            reallocations: 0,
            limits,
        }
    }

    /// Append an instance, growing the packed and named buffers by one slot
    pub fn add_instance(&mut self, instance: InstanceRef) {
        self.instances.push(instance);
        let count = self.instances.len();
        self.raw.resize(count * self.padded_stride, 0);
        for named in &mut self.named {
            let wanted = count * named.binding.instance_bytes();
            if named.bytes.len() < wanted {
                named.bytes.resize(wanted, 0);
            }
            if named.owners.len() < count {
                named.owners.resize(count, None);
            }
        }
    }

    /// Drop destroyed instances, refresh dirty transforms and pack the active
    /// ones to the front of the buffer
    ///
    /// Destroyed instances are swap-removed, so instance order is not stable.
    /// Returns the new visible count.
    ///
    /// # Panics
    ///
    /// Panics if an instance's data does not match the shader's stride.
    pub fn update_data(&mut self) -> usize {
        let stride = self.material.shader.instance_stride;
        let mut write = 0;
        let mut index = 0;

        while index < self.instances.len() {
            let shared = Rc::clone(&self.instances[index]);
            let mut instance = shared.borrow_mut();

            if instance.is_destroyed() {
                drop(instance);
                self.instances.swap_remove(index);
                continue;
            }
            if instance.is_transform_dirty() {
                instance.update_model();
            }

            if instance.is_active() {
                let data = instance.data();
                assert_eq!(data.len(), stride, "instance data does not match shader '{}'", self.material.shader.name);
                let offset = write * self.padded_stride;
                self.raw[offset..offset + stride].copy_from_slice(data);

                let owner = Rc::as_ptr(&shared).cast::<()>();
                for named in &mut self.named {
                    let slot = named.binding.instance_bytes();
                    let requested = instance.update_named_data(write, named.binding.capacity, &named.binding.name);
                    // The instance cannot see another one taking its slot while it was hidden
                    let reclaimed = named.owners[write] != Some(owner);
                    if !requested && !reclaimed {
                        continue;
                    }
                    let target = &mut named.bytes[write * slot..(write + 1) * slot];
                    let bytes = instance.named_data(&named.binding.name).unwrap_or_default();
                    let len = bytes.len().min(slot);
                    target[..len].copy_from_slice(&bytes[..len]);
                    target[len..].fill(0);
                    named.owners[write] = Some(owner);
                }
                write += 1;
            }
            index += 1;
        }

        let count = self.instances.len();
        self.raw.truncate(count * self.padded_stride);
        for named in &mut self.named {
            named.bytes.truncate(count * named.binding.instance_bytes());
            named.owners.truncate(count);
        }
        self.visible_count = write;
        write
    }

    /// Make sure the GPU buffers can hold every instance, then write the live
    /// region of the current frame slot
    ///
    /// Returns whether the backing buffers were reallocated.
    ///
    /// # Errors
    ///
    /// Buffer, texture or descriptor creation failure. The group is left
    /// without GPU resources and retries on the next upload.
    pub fn upload(&mut self, device: &dyn GpuDevice, ctx: &mut RenderContext, frame: usize) -> GpuResult<bool> {
        let count = self.instances.len();
        let grown = count > self.last_instance_count || self.instance_buffer.is_none();
        if grown && count > 0 {
            if let Err(err) = self.reallocate(device, ctx, count) {
                log::error!(
                    "Failed to grow group (mesh {}, material {}) to {count} instances: {err}",
                    self.mesh.id,
                    self.material.id
                );
                self.retire_resources(&mut ctx.trash);
                self.last_instance_count = 0;
                return Err(err);
            }
        }

        if self.visible_count == 0 {
            return Ok(grown);
        }
        if let Some(buffer) = &self.instance_buffer {
            let live = &self.raw[..self.visible_count * self.padded_stride];
            device.write_mapped(buffer.memory, buffer.offset(frame), live)?;
        }
        for named in &self.named {
            if let Some(gpu) = &named.gpu {
                let live = &named.bytes[..self.visible_count * named.binding.instance_bytes()];
                device.write_mapped(gpu.memory, gpu.offset(frame), live)?;
            }
        }
        Ok(grown)
    }

    fn reallocate(&mut self, device: &dyn GpuDevice, ctx: &mut RenderContext, count: usize) -> GpuResult<()> {
        self.retire_resources(&mut ctx.trash);
        let frames = self.limits.frames_in_flight;
        let bytes = count * self.padded_stride;
        let mut region = pad_buffer_size(&self.limits.device, bytes as u64);

        let texture_extent = self.material.shader.instance_texture_binding.map(|_| {
            let row = self.limits.row_texels.min(self.limits.device.max_image_dimension_2d);
            let max_rows = self.limits.device.max_image_dimension_2d;
            instance_texture_extent(bytes, row, max_rows).unwrap_or_else(|| {
                panic!("instance data of {bytes} bytes overflows a {row}x{max_rows} texture")
            })
        });
        if let Some(extent) = texture_extent {
            let texture_bytes = extent.width as usize * extent.height as usize * INSTANCE_TEXEL_SIZE;
            region = region.max(pad_buffer_size(&self.limits.device, texture_bytes as u64));
        }

        self.instance_buffer = Some(FrameRegions::create(
            device,
            region,
            frames,
            BufferUsage::VERTEX | BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC,
        )?);

        for named in &mut self.named {
            let named_bytes = (count * named.binding.instance_bytes()).max(1);
            let usage = match named.binding.kind {
                DescriptorKind::UniformBuffer => BufferUsage::UNIFORM,
                _ => BufferUsage::STORAGE,
            };
            named.gpu = Some(FrameRegions::create(
                device,
                pad_buffer_size(&self.limits.device, named_bytes as u64),
                frames,
                usage,
            )?);
        }

        if let Some(extent) = texture_extent {
            let target = RenderTarget::new(
                device,
                &ImageDesc {
                    extent,
                    format: GpuFormat::R32G32B32A32Sfloat,
                    usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
                    samples: 1,
                },
            )?;
            let sampler = match device.create_sampler() {
                Ok(sampler) => sampler,
                Err(err) => {
                    ctx.trash.add(target.retire(TrashEntry::new()));
                    return Err(err);
                }
            };
            self.texture = Some(InstanceTexture { target, sampler });
        }

        let layout = self.material.shader.set_layout;
        if layout.is_valid() {
            let sets = ctx.descriptors.allocate_set(device, layout, self.pool_hint)?;
            self.pool_hint = sets.pool_index();
            self.sets = Some(sets);
            self.write_descriptors(device);
        }

        self.last_instance_count = count;
        self.reallocations += 1;
        log::debug!(
            "Group (mesh {}, material {}) sized for {count} instances ({region} bytes per frame)",
            self.mesh.id,
            self.material.id
        );
        Ok(())
    }

    fn write_descriptors(&self, device: &dyn GpuDevice) {
        let Some(sets) = &self.sets else {
            return;
        };
        let shader = &self.material.shader;
        for frame in 0..self.limits.frames_in_flight {
            let set = sets.get(frame);
            if let (Some(binding), Some(buffer)) = (shader.instance_binding, &self.instance_buffer) {
                device.write_descriptor(
                    set,
                    binding,
                    DescriptorWrite::Buffer {
                        kind: DescriptorKind::StorageBuffer,
                        buffer: buffer.buffer,
                        offset: buffer.offset(frame),
                        range: buffer.region_size,
                    },
                );
            }
            for named in &self.named {
                if let Some(gpu) = &named.gpu {
                    device.write_descriptor(
                        set,
                        named.binding.binding,
                        DescriptorWrite::Buffer {
                            kind: named.binding.kind,
                            buffer: gpu.buffer,
                            offset: gpu.offset(frame),
                            range: gpu.region_size,
                        },
                    );
                }
            }
            if let (Some(binding), Some(texture)) = (shader.instance_texture_binding, &self.texture) {
                device.write_descriptor(
                    set,
                    binding,
                    DescriptorWrite::Image {
                        view: texture.target.view,
                        sampler: texture.sampler,
                    },
                );
            }
            for texture in &self.material.textures {
                device.write_descriptor(
                    set,
                    texture.binding,
                    DescriptorWrite::Image {
                        view: texture.view,
                        sampler: texture.sampler,
                    },
                );
            }
        }
    }

    /// Copy the current frame's instance data into the instance texture
    ///
    /// Must be recorded outside a render pass. Returns whether a copy was recorded.
    pub fn record_uploads(&self, device: &dyn GpuDevice, command_buffer: CommandBufferHandle, frame: usize) -> bool {
        match (&self.texture, &self.instance_buffer) {
            (Some(texture), Some(buffer)) if self.visible_count > 0 => {
                device.cmd_copy_buffer_to_image(
                    command_buffer,
                    buffer.buffer,
                    buffer.offset(frame),
                    texture.target.image,
                    texture.target.extent,
                );
                true
            }
            _ => false,
        }
    }

    /// Record one instanced draw of the visible instances
    ///
    /// Returns whether a draw was recorded; groups with nothing visible or a
    /// material without a pipeline record nothing.
    pub fn record_draw(&self, device: &dyn GpuDevice, command_buffer: CommandBufferHandle, frame: usize) -> bool {
        let (Some((pipeline, layout)), Some(buffer)) = (self.material.pipeline, &self.instance_buffer) else {
            return false;
        };
        if self.visible_count == 0 {
            return false;
        }
        device.cmd_bind_pipeline(command_buffer, BindPoint::Graphics, pipeline);
        if let Some(sets) = &self.sets {
            device.cmd_bind_descriptor_sets(command_buffer, BindPoint::Graphics, layout, 0, &[sets.get(frame)]);
        }
        device.cmd_bind_vertex_buffer(command_buffer, 0, self.mesh.vertex_buffer, 0);
        device.cmd_bind_vertex_buffer(command_buffer, 1, buffer.buffer, buffer.offset(frame));
        device.cmd_bind_index_buffer(command_buffer, self.mesh.index_buffer, 0);
        device.cmd_draw_indexed(command_buffer, self.mesh.index_count, self.visible_count as u32);
        true
    }

    fn retire_resources(&mut self, trash: &mut BufferTrash) {
        let mut entry = TrashEntry::new();
        if let Some(buffer) = self.instance_buffer.take() {
            entry = buffer.retire(entry);
        }
        for named in &mut self.named {
            if let Some(gpu) = named.gpu.take() {
                entry = gpu.retire(entry);
            }
        }
        if let Some(texture) = self.texture.take() {
            entry = texture.target.retire(entry).sampler(texture.sampler);
        }
        if let Some(sets) = self.sets.take() {
            entry = entry.descriptor_sets(sets);
        }
        trash.add(entry);
    }

    /// Queue every GPU resource for deferred destruction and forget the instances
    pub fn teardown(&mut self, trash: &mut BufferTrash) {
        self.retire_resources(trash);
        self.instances.clear();
        self.raw.clear();
        self.visible_count = 0;
    }

    /// Instances currently tracked, visible or not
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instance is left
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instances written by the last update
    #[must_use]
    pub const fn visible_count(&self) -> usize {
        self.visible_count
    }

    /// Instance count the GPU buffers are sized for
    #[must_use]
    pub const fn last_instance_count(&self) -> usize {
        self.last_instance_count
    }

    /// Number of buffer reallocations so far
    #[must_use]
    pub const fn reallocations(&self) -> usize {
        self.reallocations
    }

    /// Instance stride rounded up to whole texels
    #[must_use]
    pub const fn padded_stride(&self) -> usize {
        self.padded_stride
    }

    /// Packed CPU buffer, `instance_count * padded_stride` bytes
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The visible region of the packed buffer
    #[must_use]
    pub fn live_bytes(&self) -> &[u8] {
        &self.raw[..self.visible_count * self.padded_stride]
    }

    /// The visible region of the named buffer `name`
    #[must_use]
    pub fn named_live_bytes(&self, name: &str) -> Option<&[u8]> {
        self.named
            .iter()
            .find(|named| named.binding.name == name)
            .map(|named| &named.bytes[..self.visible_count * named.binding.instance_bytes()])
    }

    /// Current GPU instance buffer, if allocated
    #[must_use]
    pub fn instance_buffer(&self) -> Option<(BufferHandle, MemoryHandle)> {
        self.instance_buffer.map(|buffer| (buffer.buffer, buffer.memory))
    }

    /// Bytes per frame region of the instance buffer
    #[must_use]
    pub fn region_size(&self) -> Option<u64> {
        self.instance_buffer.map(|buffer| buffer.region_size)
    }

    /// Extent of the instance texture, if the shader mirrors instance data
    #[must_use]
    pub fn texture_extent(&self) -> Option<Extent2D> {
        self.texture.as_ref().map(|texture| texture.target.extent)
    }

    /// Descriptor sets of the group, if the shader declares a set layout
    #[must_use]
    pub const fn descriptor_sets(&self) -> Option<&FrameSets> {
        self.sets.as_ref()
    }

    /// Mesh drawn by this group
    #[must_use]
    pub const fn mesh(&self) -> &MeshRef {
        &self.mesh
    }

    /// Material drawn by this group
    #[must_use]
    pub fn material(&self) -> &Rc<Material> {
        &self.material
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::batch::instance::{DrawInstance, ModelData, ModelInstance, SkinnedInstance, SKIN_BUFFER};
    use crate::batch::material::ShaderLayout;
    use crate::foundation::math::{Mat4, Transform, Vec3};
    use crate::gpu::{DescriptorSetLayoutHandle, PipelineHandle, PipelineLayoutHandle, ShaderStages};
    use crate::testing::{DeviceCall, MockDevice};

    const FRAMES: usize = 2;

    fn limits() -> GroupLimits {
        GroupLimits {
            frames_in_flight: FRAMES,
            row_texels: 2048,
            device: DeviceLimits::default(),
        }
    }

    fn mesh() -> MeshRef {
        MeshRef {
            id: 1,
            vertex_buffer: BufferHandle::from_raw(10_000),
            index_buffer: BufferHandle::from_raw(10_001),
            index_count: 36,
        }
    }

    fn material(shader: ShaderLayout) -> Rc<Material> {
        Rc::new(Material {
            id: 7,
            shader: Rc::new(shader),
            textures: Vec::new(),
            pipeline: Some((PipelineHandle::from_raw(20_000), PipelineLayoutHandle::from_raw(20_001))),
        })
    }

    fn plain_group() -> DrawInstanceGroup {
        DrawInstanceGroup::new(mesh(), material(ShaderLayout::new("basic", ModelData::SIZE)), limits())
    }

    fn spawn(group: &mut DrawInstanceGroup, red: f32) -> Rc<RefCell<ModelInstance>> {
        let instance = ModelInstance::new(Transform::from_position(Vec3::new(red, 0.0, 0.0)), [red, 0.0, 0.0, 1.0]).shared();
        group.add_instance(instance.clone());
        instance
    }

    fn skinned_group() -> DrawInstanceGroup {
        let mut shader = ShaderLayout::new("skinned", ModelData::SIZE);
        shader.named_buffers.push(ShaderBinding {
            name: SKIN_BUFFER.to_owned(),
            binding: 1,
            kind: DescriptorKind::StorageBuffer,
            stride: 64,
            capacity: 4,
            stages: ShaderStages::VERTEX,
        });
        DrawInstanceGroup::new(mesh(), material(shader), limits())
    }

    fn spawn_skinned(group: &mut DrawInstanceGroup, joint: f32) -> Rc<RefCell<SkinnedInstance>> {
        let mut instance = SkinnedInstance::new(Transform::default(), [1.0; 4], 4);
        instance.set_joints(&[Mat4::from_element(joint); 4]);
        let instance = Rc::new(RefCell::new(instance));
        group.add_instance(instance.clone());
        instance
    }

    fn skin_floats(group: &DrawInstanceGroup) -> Vec<f32> {
        bytemuck::pod_collect_to_vec(group.named_live_bytes(SKIN_BUFFER).unwrap())
    }

    fn packed_colors(bytes: &[u8], padded: usize) -> Vec<f32> {
        bytes
            .chunks(padded)
            .map(|chunk| bytemuck::pod_read_unaligned::<ModelData>(&chunk[..ModelData::SIZE]).color[0])
            .collect()
    }

    #[test]
    fn compaction_keeps_only_live_visible_instances() {
        let mut group = plain_group();
        let instances: Vec<_> = (1..=6).map(|i| spawn(&mut group, i as f32)).collect();
        instances[1].borrow_mut().destroy();
        instances[3].borrow_mut().set_active(false);
        instances[4].borrow_mut().destroy();

        let visible = group.update_data();

        assert_eq!(visible, 3);
        assert!(group.visible_count() <= group.instance_count());
        assert_eq!(group.instance_count(), 4);
        assert_eq!(group.raw().len(), group.instance_count() * group.padded_stride());
        assert_eq!(group.live_bytes().len(), visible * group.padded_stride());

        let mut colors = packed_colors(group.live_bytes(), group.padded_stride());
        colors.sort_by(f32::total_cmp);
        assert_eq!(colors, vec![1.0, 3.0, 6.0]);
    }

    #[test]
    fn clean_transforms_are_not_recomputed() {
        let mut group = plain_group();
        let instance = spawn(&mut group, 1.0);
        group.update_data();
        group.update_data();
        assert_eq!(instance.borrow().model_updates(), 1);

        instance.borrow_mut().transform_mut().set_position(Vec3::new(2.0, 0.0, 0.0));
        group.update_data();
        assert_eq!(instance.borrow().model_updates(), 2);
    }

    #[test]
    fn growth_follows_the_high_water_mark() {
        let device = MockDevice::new();
        let mut ctx = RenderContext::new(FRAMES, 8);
        let mut group = plain_group();
        let mut marks = Vec::new();

        let mut live: Vec<_> = (0..4).map(|i| spawn(&mut group, i as f32)).collect();
        group.update_data();
        assert!(group.upload(&device, &mut ctx, 0).unwrap());
        marks.push(group.last_instance_count());

        // Shrink below the peak, then come back up to it
        for instance in live.drain(..2) {
            instance.borrow_mut().destroy();
        }
        group.update_data();
        assert!(!group.upload(&device, &mut ctx, 1).unwrap());
        marks.push(group.last_instance_count());
        live.extend((0..2).map(|i| spawn(&mut group, i as f32)));
        group.update_data();
        assert!(!group.upload(&device, &mut ctx, 0).unwrap());
        marks.push(group.last_instance_count());
        assert_eq!(group.reallocations(), 1);

        // Growing past the peak by several instances reallocates once
        live.extend((0..3).map(|i| spawn(&mut group, i as f32)));
        group.update_data();
        assert!(group.upload(&device, &mut ctx, 1).unwrap());
        marks.push(group.last_instance_count());
        assert_eq!(group.reallocations(), 2);

        assert!(marks.windows(2).all(|w| w[0] <= w[1]), "{marks:?}");
        assert_eq!(device.created_buffers(), 2);
    }

    #[test]
    fn replaced_buffer_goes_through_the_trash() {
        let device = MockDevice::new();
        let mut ctx = RenderContext::new(FRAMES, 8);
        let mut group = plain_group();
        spawn(&mut group, 1.0);
        group.update_data();
        group.upload(&device, &mut ctx, 0).unwrap();
        let (old, _) = group.instance_buffer().unwrap();

        spawn(&mut group, 2.0);
        group.update_data();
        group.upload(&device, &mut ctx, 1).unwrap();

        assert!(device.destroyed_buffers().is_empty());
        assert_eq!(ctx.trash.len(), 1);
        for _ in 0..FRAMES {
            ctx.cycle(&device);
        }
        assert_eq!(device.destroyed_buffers(), vec![old]);
    }

    #[test]
    fn upload_writes_only_the_current_frame_region() {
        let device = MockDevice::new();
        let mut ctx = RenderContext::new(FRAMES, 8);
        let mut group = plain_group();
        spawn(&mut group, 1.0);
        spawn(&mut group, 2.0);
        group.update_data();
        group.upload(&device, &mut ctx, 1).unwrap();

        let (_, memory) = group.instance_buffer().unwrap();
        let region = group.region_size().unwrap() as usize;
        let mapped = device.mapped_bytes(memory);
        assert_eq!(mapped.len(), region * FRAMES);
        assert!(mapped[..region].iter().all(|&b| b == 0));
        assert_eq!(&mapped[region..region + group.live_bytes().len()], group.live_bytes());
        assert_eq!(region % 256, 0);
    }

    #[test]
    fn failed_growth_is_reported_and_retried() {
        let device = MockDevice::new();
        let mut ctx = RenderContext::new(FRAMES, 8);
        let mut group = plain_group();
        spawn(&mut group, 1.0);
        group.update_data();

        device.fail_next_buffers(1);
        assert!(group.upload(&device, &mut ctx, 0).is_err());
        assert!(group.instance_buffer().is_none());

        assert!(group.upload(&device, &mut ctx, 0).unwrap());
        assert!(group.instance_buffer().is_some());
    }

    #[test]
    fn draw_covers_visible_instances_only() {
        let device = MockDevice::new();
        let mut ctx = RenderContext::new(FRAMES, 8);
        let mut group = plain_group();
        let hidden = spawn(&mut group, 1.0);
        spawn(&mut group, 2.0);
        spawn(&mut group, 3.0);
        hidden.borrow_mut().set_active(false);
        group.update_data();
        group.upload(&device, &mut ctx, 0).unwrap();

        device.clear_calls();
        assert!(group.record_draw(&device, CommandBufferHandle::from_raw(1), 0));
        assert!(device.calls().contains(&DeviceCall::DrawIndexed { index_count: 36, instance_count: 2 }));
    }

    #[test]
    fn named_buffers_and_descriptor_sets_follow_the_shader() {
        let device = MockDevice::new();
        let mut ctx = RenderContext::new(FRAMES, 8);
        let mut shader = ShaderLayout::new("skinned", ModelData::SIZE);
        shader.instance_binding = Some(0);
        shader.named_buffers.push(ShaderBinding {
            name: SKIN_BUFFER.to_owned(),
            binding: 1,
            kind: DescriptorKind::StorageBuffer,
            stride: 64,
            capacity: 4,
            stages: ShaderStages::VERTEX,
        });
        shader.set_layout = DescriptorSetLayoutHandle::from_raw(30_000);
        let mut group = DrawInstanceGroup::new(mesh(), material(shader), limits());

        let skinned = Rc::new(RefCell::new(SkinnedInstance::new(Transform::default(), [1.0; 4], 4)));
        group.add_instance(skinned.clone());
        group.update_data();
        group.upload(&device, &mut ctx, 0).unwrap();

        let sets = *group.descriptor_sets().unwrap();
        let writes: Vec<_> = device
            .calls()
            .into_iter()
            .filter(|call| matches!(call, DeviceCall::WriteDescriptor { .. }))
            .collect();
        // Instance + skin binding for each frame slot
        assert_eq!(writes.len(), 2 * FRAMES);
        assert!(writes.iter().any(|call| matches!(call,
            DeviceCall::WriteDescriptor { set, binding: 1, .. } if *set == sets.get(1))));
        assert_eq!(skinned.borrow().named_data_instance_size(SKIN_BUFFER), 4 * 64);
    }

    #[test]
    fn mirrored_groups_copy_into_the_instance_texture() {
        let device = MockDevice::new();
        let mut ctx = RenderContext::new(FRAMES, 8);
        let mut shader = ShaderLayout::new("mirrored", ModelData::SIZE);
        shader.instance_texture_binding = Some(2);
        let mut group = DrawInstanceGroup::new(mesh(), material(shader), limits());
        for i in 0..3 {
            spawn(&mut group, i as f32);
        }
        group.update_data();
        group.upload(&device, &mut ctx, 0).unwrap();

        // 3 instances * 80 bytes = 15 texels
        assert_eq!(group.texture_extent(), Some(Extent2D::new(15, 1)));
        assert!(group.record_uploads(&device, CommandBufferHandle::from_raw(1), 1));
        assert!(device.calls().iter().any(|call| matches!(call, DeviceCall::CopyBufferToImage { .. })));
    }

    #[test]
    fn texture_extent_wraps_rows() {
        assert_eq!(instance_texture_extent(16, 2048, 4096), Some(Extent2D::new(1, 1)));
        assert_eq!(instance_texture_extent(2048 * 16, 2048, 4096), Some(Extent2D::new(2048, 1)));
        assert_eq!(instance_texture_extent(2049 * 16, 2048, 4096), Some(Extent2D::new(2048, 2)));
        assert_eq!(instance_texture_extent(2048 * 16 * 3, 2048, 2), None);
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn texture_overflow_is_fatal() {
        let device = MockDevice::new();
        let mut ctx = RenderContext::new(FRAMES, 8);
        let mut shader = ShaderLayout::new("mirrored", ModelData::SIZE);
        shader.instance_texture_binding = Some(2);
        let tiny = GroupLimits {
            row_texels: 5,
            device: DeviceLimits { max_image_dimension_2d: 2, ..DeviceLimits::default() },
            ..limits()
        };
        let mut group = DrawInstanceGroup::new(mesh(), material(shader), tiny);
        for i in 0..3 {
            spawn(&mut group, i as f32);
        }
        group.update_data();
        let _ = group.upload(&device, &mut ctx, 0);
    }

    #[test]
    fn teardown_queues_everything() {
        let device = MockDevice::new();
        let mut ctx = RenderContext::new(FRAMES, 8);
        let mut group = plain_group();
        spawn(&mut group, 1.0);
        group.update_data();
        group.upload(&device, &mut ctx, 0).unwrap();

        group.teardown(&mut ctx.trash);
        assert!(group.is_empty());
        assert_eq!(ctx.trash.len(), 1);
        ctx.shutdown(&device);
        assert_eq!(device.destroyed_buffers().len(), 1);
    }

    #[test]
    fn reactivated_instance_reclaims_a_slot_taken_while_hidden() {
        let mut group = skinned_group();
        let a = spawn_skinned(&mut group, 1.0);
        let b = spawn_skinned(&mut group, 9.0);
        group.update_data();

        a.borrow_mut().model_mut().set_active(false);
        group.update_data();
        assert_eq!(skin_floats(&group)[0], 9.0);

        a.borrow_mut().model_mut().set_active(true);
        b.borrow_mut().model_mut().destroy();
        assert_eq!(group.update_data(), 1);

        let skin = skin_floats(&group);
        assert_eq!(skin.len(), 4 * 16);
        assert!(skin.iter().all(|&value| value == 1.0), "{skin:?}");
    }

    #[test]
    fn shrunk_palette_clears_the_slot_tail() {
        let mut group = skinned_group();
        let instance = spawn_skinned(&mut group, 9.0);
        group.update_data();

        instance.borrow_mut().set_joints(&[Mat4::from_element(1.0)]);
        group.update_data();

        let skin = skin_floats(&group);
        assert!(skin[..16].iter().all(|&value| value == 1.0));
        assert!(skin[16..].iter().all(|&value| value == 0.0), "{skin:?}");
    }
}
