//! Swapchain and the render targets that live and die with it
//!
//! A [`SwapChain`] is always built and discarded as a unit: presentable images,
//! one view and framebuffer per image, a shared multisampled colour target
//! (when MSAA is on), a shared depth target and the render pass they all
//! belong to.

use super::trash::TrashEntry;
use crate::gpu::{
    select_format, ClearValue, Extent2D, FramebufferHandle, GpuDevice, GpuFormat, GpuResult,
    ImageAspect, ImageDesc, ImageHandle, ImageUsage, ImageViewHandle, MemoryHandle,
    PresentationSurface, RenderPassDesc, RenderPassHandle,
};

/// Creation parameters of a swapchain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainSettings {
    /// Surface format preference list
    pub preferred_surface_formats: Vec<GpuFormat>,
    /// Depth format preference list
    pub preferred_depth_formats: Vec<GpuFormat>,
    /// MSAA sample count, 1 renders straight into the swapchain image
    pub msaa_samples: u32,
    /// Wait for vertical blank when presenting
    pub vsync: bool,
}

/// A device-local image with a single view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    /// Image
    pub image: ImageHandle,
    /// Backing memory
    pub memory: MemoryHandle,
    /// View over the whole image
    pub view: ImageViewHandle,
    /// Format
    pub format: GpuFormat,
    /// Size
    pub extent: Extent2D,
}

impl RenderTarget {
    /// Create an image and its view
    ///
    /// # Errors
    ///
    /// Image or view creation failure; nothing is leaked on the error path.
    pub fn new(device: &dyn GpuDevice, desc: &ImageDesc) -> GpuResult<Self> {
        let (image, memory) = device.create_image(desc)?;
        match device.create_image_view(image, desc.format, ImageAspect::for_format(desc.format)) {
            Ok(view) => Ok(Self {
                image,
                memory,
                view,
                format: desc.format,
                extent: desc.extent,
            }),
            Err(err) => {
                device.destroy_image(image);
                device.free_memory(memory);
                Err(err)
            }
        }
    }

    /// Queue the target for deferred destruction
    #[must_use]
    pub fn retire(self, entry: TrashEntry) -> TrashEntry {
        entry.view(self.view).image(self.image, self.memory)
    }

    /// Destroy immediately; the device must be idle
    pub fn destroy(self, device: &dyn GpuDevice) {
        device.destroy_image_view(self.view);
        device.destroy_image(self.image);
        device.free_memory(self.memory);
    }
}

/// Presentable images plus their per-image and shared attachments
#[derive(Debug)]
pub struct SwapChain {
    images: Vec<ImageHandle>,
    views: Vec<ImageViewHandle>,
    framebuffers: Vec<FramebufferHandle>,
    color_target: Option<RenderTarget>,
    depth_target: RenderTarget,
    render_pass: RenderPassHandle,
    format: GpuFormat,
    extent: Extent2D,
    samples: u32,
}

impl SwapChain {
    /// Create the swapchain and everything that depends on its images
    ///
    /// The depth format falls back to the first preference when the device
    /// supports none of them.
    ///
    /// # Errors
    ///
    /// Any creation failure. Objects created before the failure are released
    /// and the surface's swapchain is destroyed again.
    pub fn new(
        device: &dyn GpuDevice,
        surface: &mut dyn PresentationSurface,
        settings: &SwapchainSettings,
    ) -> GpuResult<Self> {
        let requested = surface.drawable_size();
        let presentable = surface.create_swapchain(&settings.preferred_surface_formats, settings.vsync, requested)?;
        let depth_format = select_format(&settings.preferred_depth_formats, |format| {
            device.supports_format(format, ImageUsage::DEPTH_STENCIL_ATTACHMENT)
        });
        let samples = settings.msaa_samples.max(1);

        let mut swapchain = Self {
            images: presentable.images,
            views: Vec::new(),
            framebuffers: Vec::new(),
            color_target: None,
            depth_target: RenderTarget {
                image: ImageHandle::NULL,
                memory: MemoryHandle::NULL,
                view: ImageViewHandle::NULL,
                format: depth_format,
                extent: presentable.extent,
            },
            render_pass: RenderPassHandle::NULL,
            format: presentable.format,
            extent: presentable.extent,
            samples,
        };

        if let Err(err) = swapchain.build_attachments(device, depth_format) {
            swapchain.destroy(device, surface);
            return Err(err);
        }

        log::info!(
            "Swapchain ready: {} images, {}x{} {:?}, depth {:?}, {}x MSAA",
            swapchain.images.len(),
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.format,
            depth_format,
            samples
        );
        Ok(swapchain)
    }

    fn build_attachments(&mut self, device: &dyn GpuDevice, depth_format: GpuFormat) -> GpuResult<()> {
        for &image in &self.images {
            self.views
                .push(device.create_image_view(image, self.format, ImageAspect::Color)?);
        }

        self.depth_target = RenderTarget::new(
            device,
            &ImageDesc {
                extent: self.extent,
                format: depth_format,
                usage: ImageUsage::DEPTH_STENCIL_ATTACHMENT,
                samples: self.samples,
            },
        )?;

        if self.samples > 1 {
            self.color_target = Some(RenderTarget::new(
                device,
                &ImageDesc {
                    extent: self.extent,
                    format: self.format,
                    usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSIENT,
                    samples: self.samples,
                },
            )?);
        }

        self.render_pass = device.create_render_pass(&RenderPassDesc {
            color_formats: vec![self.format],
            depth_format: Some(depth_format),
            samples: self.samples,
            resolve: self.samples > 1,
            present: true,
        })?;

        for index in 0..self.views.len() {
            let attachments = self.attachments(index);
            let framebuffer = device.create_framebuffer(self.render_pass, &attachments, self.extent)?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    /// Attachment order: colour (MSAA or swapchain image), depth, then resolve
    fn attachments(&self, image_index: usize) -> Vec<ImageViewHandle> {
        match &self.color_target {
            Some(color) => vec![color.view, self.depth_target.view, self.views[image_index]],
            None => vec![self.views[image_index], self.depth_target.view],
        }
    }

    /// Destroy everything, including the surface's swapchain; the device must be idle
    pub fn destroy(&mut self, device: &dyn GpuDevice, surface: &mut dyn PresentationSurface) {
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer);
        }
        let render_pass = self.render_pass.take();
        if render_pass.is_valid() {
            device.destroy_render_pass(render_pass);
        }
        if let Some(color) = self.color_target.take() {
            color.destroy(device);
        }
        if self.depth_target.image.is_valid() {
            let depth = self.depth_target;
            self.depth_target.image.reset();
            depth.destroy(device);
        }
        for view in self.views.drain(..) {
            device.destroy_image_view(view);
        }
        self.images.clear();
        surface.destroy_swapchain();
    }

    /// Render pass every framebuffer belongs to
    #[must_use]
    pub const fn render_pass(&self) -> RenderPassHandle {
        self.render_pass
    }

    /// Framebuffer targeting swapchain image `image_index`
    ///
    /// # Panics
    ///
    /// Panics on an index the surface never handed out.
    #[must_use]
    pub fn framebuffer(&self, image_index: u32) -> FramebufferHandle {
        self.framebuffers[image_index as usize]
    }

    /// Clear values in attachment order
    #[must_use]
    pub fn clear_values(&self, color: [f32; 4]) -> Vec<ClearValue> {
        let depth = ClearValue::DepthStencil { depth: 1.0, stencil: 0 };
        if self.color_target.is_some() {
            vec![ClearValue::Color(color), depth, ClearValue::Color(color)]
        } else {
            vec![ClearValue::Color(color), depth]
        }
    }

    /// Number of presentable images
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Colour format of the presentable images
    #[must_use]
    pub const fn format(&self) -> GpuFormat {
        self.format
    }

    /// Size of the presentable images
    #[must_use]
    pub const fn extent(&self) -> Extent2D {
        self.extent
    }

    /// Depth attachment shared by every framebuffer
    #[must_use]
    pub const fn depth_target(&self) -> &RenderTarget {
        &self.depth_target
    }

    /// MSAA sample count
    #[must_use]
    pub const fn samples(&self) -> u32 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DeviceCall, MockDevice, MockSurface};
    use crate::gpu::ResourceKind;

    fn settings(msaa_samples: u32) -> SwapchainSettings {
        SwapchainSettings {
            preferred_surface_formats: vec![GpuFormat::B8G8R8A8Srgb],
            preferred_depth_formats: vec![GpuFormat::D32Sfloat, GpuFormat::D24UnormS8Uint],
            msaa_samples,
            vsync: true,
        }
    }

    #[test]
    fn one_framebuffer_per_image() {
        let device = MockDevice::new();
        let mut surface = MockSurface::new(800, 600);
        let swapchain = SwapChain::new(&device, &mut surface, &settings(1)).unwrap();

        assert_eq!(swapchain.image_count(), 3);
        assert_eq!(device.live_count(ResourceKind::Framebuffer), 3);
        assert_eq!(swapchain.extent(), Extent2D::new(800, 600));
        assert_eq!(swapchain.clear_values([0.0; 4]).len(), 2);
    }

    #[test]
    fn msaa_adds_a_shared_color_target() {
        let device = MockDevice::new();
        let mut surface = MockSurface::new(640, 480);
        let swapchain = SwapChain::new(&device, &mut surface, &settings(4)).unwrap();

        // Depth + MSAA colour
        assert_eq!(device.live_count(ResourceKind::Image), 2);
        assert_eq!(swapchain.clear_values([0.0; 4]).len(), 3);
    }

    #[test]
    fn depth_format_falls_back_through_preferences() {
        let device = MockDevice::new();
        device.mark_unsupported(GpuFormat::D32Sfloat);
        let mut surface = MockSurface::new(64, 64);
        let swapchain = SwapChain::new(&device, &mut surface, &settings(1)).unwrap();
        assert_eq!(swapchain.depth_target().format, GpuFormat::D24UnormS8Uint);
    }

    #[test]
    fn destroy_releases_every_object() {
        let device = MockDevice::new();
        let mut surface = MockSurface::new(64, 64);
        let mut swapchain = SwapChain::new(&device, &mut surface, &settings(4)).unwrap();
        swapchain.destroy(&device, &mut surface);

        for kind in [ResourceKind::Image, ResourceKind::ImageView, ResourceKind::Framebuffer, ResourceKind::RenderPass] {
            assert_eq!(device.live_count(kind), 0, "{kind} leaked");
        }
        assert!(device.calls().iter().any(|call| matches!(call, DeviceCall::DestroyRenderPass(_))));
    }
}
