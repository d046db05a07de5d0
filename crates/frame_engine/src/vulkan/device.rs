//! [`GpuDevice`] on top of `ash`

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::ptr::NonNull;
use std::rc::Rc;

use ash::vk::{self, Handle};

use super::context::VulkanContext;
use super::convert::{
    aspect_mask, buffer_usage, clear_value, descriptor_type, format_to_vk, image_usage, memory_barrier,
    memory_properties, pipeline_stage, required_format_features, sample_count, shader_stages, vk_alloc_error,
    vk_error,
};
use crate::gpu::{
    BindPoint, BufferHandle, BufferUsage, ClearValue, CommandBufferHandle, ComputePipelineDesc, DescriptorPoolHandle,
    DescriptorSetHandle, DescriptorSetLayoutHandle, DescriptorWrite, DeviceLimits, Extent2D, FenceHandle,
    FramebufferHandle, GpuDevice, GpuError, GpuFormat, GpuResult, ImageAspect, ImageDesc, ImageHandle, ImageUsage,
    ImageViewHandle, LayoutBinding, MemoryBarrier, MemoryHandle, MemoryProperties, PipelineHandle,
    PipelineLayoutHandle, PoolSize, RenderPassDesc, RenderPassHandle, ResourceKind, SamplerHandle, SemaphoreHandle,
    Submission, Workgroups,
};

fn vk_handle<T: Handle>(raw: u64) -> T {
    T::from_raw(raw)
}

/// A persistently mapped allocation
struct MappedRange {
    ptr: NonNull<u8>,
    size: u64,
}

impl MappedRange {
    /// # Panics
    ///
    /// Panics on a null pointer; a successful map never returns one.
    fn new(ptr: *mut std::ffi::c_void, size: u64) -> Self {
        let ptr = NonNull::new(ptr.cast::<u8>())
            .unwrap_or_else(|| panic!("driver returned a null mapping for {size} bytes"));
        Self { ptr, size }
    }
}

/// Vulkan implementation of [`GpuDevice`]
///
/// Every command buffer comes from the context's single graphics pool and all
/// work goes to the graphics queue.
pub struct VulkanDevice {
    context: Rc<VulkanContext>,
    limits: DeviceLimits,
    mapped: RefCell<HashMap<MemoryHandle, MappedRange>>,
}

impl VulkanDevice {
    /// Wrap a context
    #[must_use]
    pub fn new(context: Rc<VulkanContext>) -> Self {
        let limits = &context.physical_device.properties.limits;
        let limits = DeviceLimits {
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            max_image_dimension_2d: limits.max_image_dimension2_d,
        };
        log::debug!("Device limits: {limits:?}");
        Self {
            context,
            limits,
            mapped: RefCell::new(HashMap::new()),
        }
    }

    /// Shared Vulkan context
    #[must_use]
    pub const fn context(&self) -> &Rc<VulkanContext> {
        &self.context
    }

    fn device(&self) -> &ash::Device {
        self.context.raw()
    }

    fn find_memory_type(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
        let memory = &self.context.physical_device.memory;
        (0..memory.memory_type_count).find(|&index| {
            type_bits & (1 << index) != 0
                && memory.memory_types[index as usize].property_flags.contains(properties)
        })
    }

    fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        properties: MemoryProperties,
        kind: ResourceKind,
    ) -> GpuResult<vk::DeviceMemory> {
        let type_index = self
            .find_memory_type(requirements.memory_type_bits, memory_properties(properties))
            .ok_or(GpuError::NoSuitableMemoryType { kind, properties })?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        unsafe { self.device().allocate_memory(&alloc_info, None) }
            .map_err(|e| vk_alloc_error(e, kind, requirements.size))
    }

    fn render_pass_attachments(desc: &RenderPassDesc) -> Vec<vk::AttachmentDescription> {
        let samples = sample_count(desc.samples);
        let shown_layout = if desc.present {
            vk::ImageLayout::PRESENT_SRC_KHR
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        };

        let mut attachments: Vec<vk::AttachmentDescription> = desc
            .color_formats
            .iter()
            .enumerate()
            .map(|(index, &format)| {
                let resolved = desc.resolve && index == 0;
                vk::AttachmentDescription::builder()
                    .format(format_to_vk(format))
                    .samples(samples)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(if resolved {
                        vk::AttachmentStoreOp::DONT_CARE
                    } else {
                        vk::AttachmentStoreOp::STORE
                    })
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(if resolved {
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                    } else {
                        shown_layout
                    })
                    .build()
            })
            .collect();

        if let Some(depth) = desc.depth_format {
            let (store, final_layout) = if desc.present {
                (vk::AttachmentStoreOp::DONT_CARE, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            } else {
                (vk::AttachmentStoreOp::STORE, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)
            };
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(format_to_vk(depth))
                    .samples(samples)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(store)
                    .stencil_load_op(vk::AttachmentLoadOp::CLEAR)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(final_layout)
                    .build(),
            );
        }

        if let (true, Some(&format)) = (desc.resolve, desc.color_formats.first()) {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(format_to_vk(format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(shown_layout)
                    .build(),
            );
        }
        attachments
    }
}

impl GpuDevice for VulkanDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn supports_format(&self, format: GpuFormat, usage: ImageUsage) -> bool {
        if format == GpuFormat::Undefined {
            return false;
        }
        let properties = unsafe {
            self.context
                .instance
                .instance
                .get_physical_device_format_properties(self.context.physical_device.device, format_to_vk(format))
        };
        properties
            .optimal_tiling_features
            .contains(required_format_features(usage))
            && !properties.optimal_tiling_features.is_empty()
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        properties: MemoryProperties,
    ) -> GpuResult<(BufferHandle, MemoryHandle)> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(buffer_usage(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device().create_buffer(&buffer_info, None) }
            .map_err(|e| vk_alloc_error(e, ResourceKind::Buffer, size))?;

        let requirements = unsafe { self.device().get_buffer_memory_requirements(buffer) };
        let memory = match self.allocate(requirements, properties, ResourceKind::Buffer) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device().destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        if let Err(e) = unsafe { self.device().bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                self.device().destroy_buffer(buffer, None);
                self.device().free_memory(memory, None);
            }
            return Err(vk_alloc_error(e, ResourceKind::Memory, requirements.size));
        }

        log::trace!("Created buffer of {size} bytes ({usage:?}, {properties:?})");
        Ok((BufferHandle::from_raw(buffer.as_raw()), MemoryHandle::from_raw(memory.as_raw())))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        unsafe { self.device().destroy_buffer(vk_handle(buffer.raw()), None) };
    }

    fn free_memory(&self, memory: MemoryHandle) {
        self.unmap_memory(memory);
        unsafe { self.device().free_memory(vk_handle(memory.raw()), None) };
    }

    fn map_memory(&self, memory: MemoryHandle, size: u64) -> GpuResult<()> {
        if self.mapped.borrow().contains_key(&memory) {
            return Err(GpuError::InvalidOperation {
                reason: "memory is already mapped".to_owned(),
            });
        }
        let ptr = unsafe {
            self.device()
                .map_memory(vk_handle(memory.raw()), 0, size, vk::MemoryMapFlags::empty())
        }
        .map_err(|e| vk_alloc_error(e, ResourceKind::Memory, size))?;
        self.mapped.borrow_mut().insert(memory, MappedRange::new(ptr, size));
        Ok(())
    }

    fn unmap_memory(&self, memory: MemoryHandle) {
        if self.mapped.borrow_mut().remove(&memory).is_some() {
            unsafe { self.device().unmap_memory(vk_handle(memory.raw())) };
        }
    }

    fn write_mapped(&self, memory: MemoryHandle, offset: u64, bytes: &[u8]) -> GpuResult<()> {
        let mapped = self.mapped.borrow();
        let range = mapped.get(&memory).ok_or_else(|| GpuError::InvalidOperation {
            reason: "write to unmapped memory".to_owned(),
        })?;
        let end = offset.checked_add(bytes.len() as u64);
        if end.map_or(true, |end| end > range.size) {
            return Err(GpuError::InvalidOperation {
                reason: format!(
                    "write of {} bytes at {offset} exceeds mapping of {} bytes",
                    bytes.len(),
                    range.size
                ),
            });
        }
        // bounds checked above; the mapping stays valid until unmap_memory
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), range.ptr.as_ptr().add(offset as usize), bytes.len());
        }
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<(ImageHandle, MemoryHandle)> {
        if !self.supports_format(desc.format, desc.usage) {
            return Err(GpuError::UnsupportedFormat(desc.format));
        }
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format_to_vk(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(sample_count(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device().create_image(&image_info, None) }
            .map_err(|e| vk_error(e, ResourceKind::Image))?;

        let requirements = unsafe { self.device().get_image_memory_requirements(image) };
        let memory = match self.allocate(requirements, MemoryProperties::DEVICE_LOCAL, ResourceKind::Image) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device().destroy_image(image, None) };
                return Err(err);
            }
        };
        if let Err(e) = unsafe { self.device().bind_image_memory(image, memory, 0) } {
            unsafe {
                self.device().destroy_image(image, None);
                self.device().free_memory(memory, None);
            }
            return Err(vk_alloc_error(e, ResourceKind::Memory, requirements.size));
        }

        Ok((ImageHandle::from_raw(image.as_raw()), MemoryHandle::from_raw(memory.as_raw())))
    }

    fn destroy_image(&self, image: ImageHandle) {
        unsafe { self.device().destroy_image(vk_handle(image.raw()), None) };
    }

    fn create_image_view(&self, image: ImageHandle, format: GpuFormat, aspect: ImageAspect) -> GpuResult<ImageViewHandle> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(vk_handle(image.raw()))
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format_to_vk(format))
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_mask(aspect),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { self.device().create_image_view(&view_info, None) }
            .map_err(|e| vk_error(e, ResourceKind::ImageView))?;
        Ok(ImageViewHandle::from_raw(view.as_raw()))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        unsafe { self.device().destroy_image_view(vk_handle(view.raw()), None) };
    }

    fn create_sampler(&self) -> GpuResult<SamplerHandle> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(0.0);
        let sampler = unsafe { self.device().create_sampler(&sampler_info, None) }
            .map_err(|e| vk_error(e, ResourceKind::Sampler))?;
        Ok(SamplerHandle::from_raw(sampler.as_raw()))
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        unsafe { self.device().destroy_sampler(vk_handle(sampler.raw()), None) };
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> GpuResult<DescriptorSetLayoutHandle> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(descriptor_type(binding.kind))
                    .descriptor_count(binding.count)
                    .stage_flags(shader_stages(binding.stages))
                    .build()
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = unsafe { self.device().create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| vk_error(e, ResourceKind::DescriptorSetLayout))?;
        Ok(DescriptorSetLayoutHandle::from_raw(layout.as_raw()))
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        unsafe { self.device().destroy_descriptor_set_layout(vk_handle(layout.raw()), None) };
    }

    fn create_descriptor_pool(&self, sizes: &[PoolSize], max_sets: u32) -> GpuResult<DescriptorPoolHandle> {
        let sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .map(|size| vk::DescriptorPoolSize {
                ty: descriptor_type(size.kind),
                descriptor_count: size.count,
            })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        let pool = unsafe { self.device().create_descriptor_pool(&pool_info, None) }
            .map_err(|e| vk_error(e, ResourceKind::DescriptorPool))?;
        Ok(DescriptorPoolHandle::from_raw(pool.as_raw()))
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        unsafe { self.device().destroy_descriptor_pool(vk_handle(pool.raw()), None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> GpuResult<DescriptorSetHandle> {
        let layouts = [vk_handle::<vk::DescriptorSetLayout>(layout.raw())];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(vk_handle(pool.raw()))
            .set_layouts(&layouts);
        let sets = unsafe { self.device().allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| vk_error(e, ResourceKind::DescriptorSet))?;
        sets.first()
            .map(|set| DescriptorSetHandle::from_raw(set.as_raw()))
            .ok_or(GpuError::OutOfPoolMemory)
    }

    fn free_descriptor_sets(&self, pool: DescriptorPoolHandle, sets: &[DescriptorSetHandle]) {
        if sets.is_empty() {
            return;
        }
        let sets: Vec<vk::DescriptorSet> = sets.iter().map(|set| vk_handle(set.raw())).collect();
        if let Err(e) = unsafe { self.device().free_descriptor_sets(vk_handle(pool.raw()), &sets) } {
            log::warn!("Failed to free {} descriptor sets: {e:?}", sets.len());
        }
    }

    fn write_descriptor(&self, set: DescriptorSetHandle, binding: u32, write: DescriptorWrite) {
        let set: vk::DescriptorSet = vk_handle(set.raw());
        let (ty, buffer_info, image_info) = match write {
            DescriptorWrite::Buffer {
                kind,
                buffer,
                offset,
                range,
            } => (
                descriptor_type(kind),
                Some(vk::DescriptorBufferInfo {
                    buffer: vk_handle(buffer.raw()),
                    offset,
                    range,
                }),
                None,
            ),
            DescriptorWrite::Image { view, sampler } => (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                None,
                Some(vk::DescriptorImageInfo {
                    sampler: vk_handle(sampler.raw()),
                    image_view: vk_handle(view.raw()),
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }),
            ),
            DescriptorWrite::InputAttachment { view } => (
                vk::DescriptorType::INPUT_ATTACHMENT,
                None,
                Some(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: vk_handle(view.raw()),
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }),
            ),
        };

        let buffer_infos: Vec<_> = buffer_info.into_iter().collect();
        let image_infos: Vec<_> = image_info.into_iter().collect();
        let mut write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(ty);
        if !buffer_infos.is_empty() {
            write = write.buffer_info(&buffer_infos);
        }
        if !image_infos.is_empty() {
            write = write.image_info(&image_infos);
        }
        unsafe { self.device().update_descriptor_sets(&[write.build()], &[]) };
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> GpuResult<RenderPassHandle> {
        let attachments = Self::render_pass_attachments(desc);
        let color_count = desc.color_formats.len() as u32;

        let color_refs: Vec<vk::AttachmentReference> = (0..color_count)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: color_count,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let resolve_index = color_count + u32::from(desc.depth_format.is_some());
        let resolve_refs: Vec<vk::AttachmentReference> = (0..color_count)
            .map(|index| vk::AttachmentReference {
                attachment: if desc.resolve && index == 0 {
                    resolve_index
                } else {
                    vk::ATTACHMENT_UNUSED
                },
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.depth_format.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        if desc.resolve {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        let subpasses = [subpass.build()];

        let attachment_stages =
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let attachment_writes =
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        let mut dependencies = vec![vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER)
            .dst_stage_mask(attachment_stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(attachment_writes)
            .build()];
        if !desc.present {
            // later passes sample what this one wrote
            dependencies.push(
                vk::SubpassDependency::builder()
                    .src_subpass(0)
                    .dst_subpass(vk::SUBPASS_EXTERNAL)
                    .src_stage_mask(
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                    )
                    .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                    .src_access_mask(attachment_writes)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ)
                    .build(),
            );
        }

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let render_pass = unsafe { self.device().create_render_pass(&render_pass_info, None) }
            .map_err(|e| vk_error(e, ResourceKind::RenderPass))?;
        Ok(RenderPassHandle::from_raw(render_pass.as_raw()))
    }

    fn destroy_render_pass(&self, render_pass: RenderPassHandle) {
        unsafe { self.device().destroy_render_pass(vk_handle(render_pass.raw()), None) };
    }

    fn create_framebuffer(
        &self,
        render_pass: RenderPassHandle,
        attachments: &[ImageViewHandle],
        extent: Extent2D,
    ) -> GpuResult<FramebufferHandle> {
        let views: Vec<vk::ImageView> = attachments.iter().map(|view| vk_handle(view.raw())).collect();
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(vk_handle(render_pass.raw()))
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = unsafe { self.device().create_framebuffer(&framebuffer_info, None) }
            .map_err(|e| vk_error(e, ResourceKind::Framebuffer))?;
        Ok(FramebufferHandle::from_raw(framebuffer.as_raw()))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        unsafe { self.device().destroy_framebuffer(vk_handle(framebuffer.raw()), None) };
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { self.device().create_fence(&fence_info, None) }
            .map_err(|e| vk_error(e, ResourceKind::Fence))?;
        Ok(FenceHandle::from_raw(fence.as_raw()))
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout_ns: u64) -> GpuResult<()> {
        let fences = [vk_handle::<vk::Fence>(fence.raw())];
        unsafe { self.device().wait_for_fences(&fences, true, timeout_ns) }
            .map_err(|e| vk_error(e, ResourceKind::Fence))
    }

    fn reset_fence(&self, fence: FenceHandle) -> GpuResult<()> {
        let fences = [vk_handle::<vk::Fence>(fence.raw())];
        unsafe { self.device().reset_fences(&fences) }.map_err(|e| vk_error(e, ResourceKind::Fence))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        unsafe { self.device().destroy_fence(vk_handle(fence.raw()), None) };
    }

    fn create_semaphore(&self) -> GpuResult<SemaphoreHandle> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { self.device().create_semaphore(&semaphore_info, None) }
            .map_err(|e| vk_error(e, ResourceKind::Semaphore))?;
        Ok(SemaphoreHandle::from_raw(semaphore.as_raw()))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        unsafe { self.device().destroy_semaphore(vk_handle(semaphore.raw()), None) };
    }

    fn wait_idle(&self) -> GpuResult<()> {
        unsafe { self.device().device_wait_idle() }.map_err(|e| vk_error(e, ResourceKind::Submission))
    }

    fn allocate_command_buffer(&self) -> GpuResult<CommandBufferHandle> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.context.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device().allocate_command_buffers(&alloc_info) }
            .map_err(|e| vk_error(e, ResourceKind::CommandBuffer))?;
        buffers
            .first()
            .map(|buffer| CommandBufferHandle::from_raw(buffer.as_raw()))
            .ok_or_else(|| GpuError::Creation {
                kind: ResourceKind::CommandBuffer,
                reason: "driver returned no command buffer".to_owned(),
            })
    }

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle) {
        let buffers = [vk_handle::<vk::CommandBuffer>(command_buffer.raw())];
        unsafe { self.device().free_command_buffers(self.context.command_pool, &buffers) };
    }

    fn begin_commands(&self, command_buffer: CommandBufferHandle, one_time: bool) -> GpuResult<()> {
        let cb: vk::CommandBuffer = vk_handle(command_buffer.raw());
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe {
            self.device()
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .map_err(|e| vk_error(e, ResourceKind::CommandBuffer))?;
            self.device()
                .begin_command_buffer(cb, &begin_info)
                .map_err(|e| vk_error(e, ResourceKind::CommandBuffer))
        }
    }

    fn end_commands(&self, command_buffer: CommandBufferHandle) -> GpuResult<()> {
        unsafe { self.device().end_command_buffer(vk_handle(command_buffer.raw())) }
            .map_err(|e| vk_error(e, ResourceKind::CommandBuffer))
    }

    fn submit(&self, submission: &Submission<'_>) -> GpuResult<()> {
        let command_buffers: Vec<vk::CommandBuffer> =
            submission.command_buffers.iter().map(|cb| vk_handle(cb.raw())).collect();
        let (wait_semaphores, wait_stages): (Vec<vk::Semaphore>, Vec<vk::PipelineStageFlags>) = submission
            .wait
            .iter()
            .map(|&(semaphore, stage)| (vk_handle::<vk::Semaphore>(semaphore.raw()), pipeline_stage(stage)))
            .unzip();
        let signal_semaphores: Vec<vk::Semaphore> =
            submission.signal.iter().map(|semaphore| vk_handle(semaphore.raw())).collect();

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device().queue_submit(
                self.context.graphics_queue(),
                &[submit_info],
                vk_handle(submission.fence.raw()),
            )
        }
        .map_err(|e| vk_error(e, ResourceKind::Submission))
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        clear_values: &[ClearValue],
    ) {
        let clear_values: Vec<vk::ClearValue> = clear_values.iter().map(|&value| clear_value(value)).collect();
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(vk_handle(render_pass.raw()))
            .framebuffer(vk_handle(framebuffer.raw()))
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: extent.width,
                    height: extent.height,
                },
            })
            .clear_values(&clear_values);
        unsafe {
            self.device().cmd_begin_render_pass(
                vk_handle(command_buffer.raw()),
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
    }

    fn cmd_end_render_pass(&self, command_buffer: CommandBufferHandle) {
        unsafe { self.device().cmd_end_render_pass(vk_handle(command_buffer.raw())) };
    }

    fn cmd_bind_pipeline(&self, command_buffer: CommandBufferHandle, bind_point: BindPoint, pipeline: PipelineHandle) {
        unsafe {
            self.device().cmd_bind_pipeline(
                vk_handle(command_buffer.raw()),
                bind_point_to_vk(bind_point),
                vk_handle(pipeline.raw()),
            );
        }
    }

    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: CommandBufferHandle,
        bind_point: BindPoint,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        let sets: Vec<vk::DescriptorSet> = sets.iter().map(|set| vk_handle(set.raw())).collect();
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                vk_handle(command_buffer.raw()),
                bind_point_to_vk(bind_point),
                vk_handle(layout.raw()),
                first_set,
                &sets,
                &[],
            );
        }
    }

    fn cmd_bind_vertex_buffer(&self, command_buffer: CommandBufferHandle, binding: u32, buffer: BufferHandle, offset: u64) {
        unsafe {
            self.device().cmd_bind_vertex_buffers(
                vk_handle(command_buffer.raw()),
                binding,
                &[vk_handle(buffer.raw())],
                &[offset],
            );
        }
    }

    fn cmd_bind_index_buffer(&self, command_buffer: CommandBufferHandle, buffer: BufferHandle, offset: u64) {
        unsafe {
            self.device().cmd_bind_index_buffer(
                vk_handle(command_buffer.raw()),
                vk_handle(buffer.raw()),
                offset,
                vk::IndexType::UINT32,
            );
        }
    }

    fn cmd_draw_indexed(&self, command_buffer: CommandBufferHandle, index_count: u32, instance_count: u32) {
        unsafe {
            self.device()
                .cmd_draw_indexed(vk_handle(command_buffer.raw()), index_count, instance_count, 0, 0, 0);
        }
    }

    fn cmd_draw(&self, command_buffer: CommandBufferHandle, vertex_count: u32, instance_count: u32) {
        unsafe {
            self.device()
                .cmd_draw(vk_handle(command_buffer.raw()), vertex_count, instance_count, 0, 0);
        }
    }

    fn cmd_dispatch(&self, command_buffer: CommandBufferHandle, groups: Workgroups) {
        unsafe {
            self.device()
                .cmd_dispatch(vk_handle(command_buffer.raw()), groups.x, groups.y, groups.z);
        }
    }

    fn cmd_memory_barrier(&self, command_buffer: CommandBufferHandle, barrier: MemoryBarrier) {
        let (src_stage, dst_stage, src_access, dst_access) = memory_barrier(barrier);
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();
        unsafe {
            self.device().cmd_pipeline_barrier(
                vk_handle(command_buffer.raw()),
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        image: ImageHandle,
        extent: Extent2D,
    ) {
        let cb: vk::CommandBuffer = vk_handle(command_buffer.raw());
        let image: vk::Image = vk_handle(image.raw());
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let to_transfer = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
            .src_access_mask(vk::AccessFlags::SHADER_READ)
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .build();
        let to_shader = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .build();
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(offset)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .build();

        unsafe {
            self.device().cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            self.device()
                .cmd_copy_buffer_to_image(cb, vk_handle(buffer.raw()), image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
            self.device().cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        }
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<'_>) -> GpuResult<(PipelineHandle, PipelineLayoutHandle)> {
        let code = ash::util::read_spv(&mut std::io::Cursor::new(desc.spirv)).map_err(|e| GpuError::Creation {
            kind: ResourceKind::ShaderModule,
            reason: e.to_string(),
        })?;
        let entry_point = CString::new(desc.entry_point).map_err(|_| GpuError::Creation {
            kind: ResourceKind::Pipeline,
            reason: format!("entry point {:?} contains NUL", desc.entry_point),
        })?;

        let module_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = unsafe { self.device().create_shader_module(&module_info, None) }
            .map_err(|e| vk_error(e, ResourceKind::ShaderModule))?;

        let set_layouts: Vec<vk::DescriptorSetLayout> =
            desc.set_layouts.iter().map(|layout| vk_handle(layout.raw())).collect();
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let layout = match unsafe { self.device().create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { self.device().destroy_shader_module(module, None) };
                return Err(vk_error(e, ResourceKind::Pipeline));
            }
        };

        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point)
            .build();
        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();
        let created = unsafe {
            self.device()
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        unsafe { self.device().destroy_shader_module(module, None) };

        match created.map(|pipelines| pipelines.first().copied()) {
            Ok(Some(pipeline)) => Ok((
                PipelineHandle::from_raw(pipeline.as_raw()),
                PipelineLayoutHandle::from_raw(layout.as_raw()),
            )),
            Ok(None) => {
                unsafe { self.device().destroy_pipeline_layout(layout, None) };
                Err(GpuError::Creation {
                    kind: ResourceKind::Pipeline,
                    reason: "driver returned no pipeline".to_owned(),
                })
            }
            Err((_, e)) => {
                unsafe { self.device().destroy_pipeline_layout(layout, None) };
                Err(vk_error(e, ResourceKind::Pipeline))
            }
        }
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        unsafe { self.device().destroy_pipeline(vk_handle(pipeline.raw()), None) };
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle) {
        unsafe { self.device().destroy_pipeline_layout(vk_handle(layout.raw()), None) };
    }
}

const fn bind_point_to_vk(bind_point: BindPoint) -> vk::PipelineBindPoint {
    match bind_point {
        BindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
        BindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let mapped: Vec<MemoryHandle> = self.mapped.borrow().keys().copied().collect();
        for memory in mapped {
            self.unmap_memory(memory);
        }
    }
}
