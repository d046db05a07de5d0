//! Swapchain management over a window surface

use std::rc::Rc;

use ash::vk::{self, Handle};

use super::context::VulkanContext;
use super::convert::{format_from_vk, format_to_vk, vk_error};
use crate::gpu::{
    AcquireOutcome, Extent2D, GpuError, GpuFormat, GpuResult, ImageHandle, PresentOutcome, PresentationSurface,
    ResourceKind, SemaphoreHandle, SwapchainImages, WindowSurface,
};

/// Vulkan implementation of [`PresentationSurface`]
///
/// Owns the window so its drawable size can be queried on every rebuild. The
/// context is declared before the window, which must outlive the Vulkan
/// surface the context destroys.
pub struct VulkanSurface<W: WindowSurface> {
    swapchain: vk::SwapchainKHR,
    context: Rc<VulkanContext>,
    window: W,
}

impl<W: WindowSurface> VulkanSurface<W> {
    /// Wrap the window the context's surface was created from
    pub const fn new(context: Rc<VulkanContext>, window: W) -> Self {
        Self {
            swapchain: vk::SwapchainKHR::null(),
            context,
            window,
        }
    }

    /// The window
    pub const fn window(&self) -> &W {
        &self.window
    }

    /// The window, mutably
    pub fn window_mut(&mut self) -> &mut W {
        &mut self.window
    }
}

/// First preferred format the surface offers in sRGB non-linear colour space,
/// else the first offered format the core can express
fn choose_surface_format(
    preferred: &[GpuFormat],
    available: &[vk::SurfaceFormatKHR],
) -> Option<(vk::SurfaceFormatKHR, GpuFormat)> {
    preferred
        .iter()
        .find_map(|&format| {
            available
                .iter()
                .find(|sf| sf.format == format_to_vk(format) && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
                .map(|&sf| (sf, format))
        })
        .or_else(|| {
            available
                .iter()
                .find_map(|&sf| format_from_vk(sf.format).map(|format| (sf, format)))
        })
}

/// FIFO with vsync; otherwise mailbox, then immediate, then FIFO
fn choose_present_mode(vsync: bool, available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: Extent2D) -> vk::Extent2D {
    if caps.current_extent.width == u32::MAX {
        vk::Extent2D {
            width: requested
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    } else {
        caps.current_extent
    }
}

const fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 && wanted > caps.max_image_count {
        caps.max_image_count
    } else {
        wanted
    }
}

impl<W: WindowSurface> PresentationSurface for VulkanSurface<W> {
    fn drawable_size(&self) -> Extent2D {
        self.window.drawable_size()
    }

    fn create_swapchain(
        &mut self,
        preferred_formats: &[GpuFormat],
        vsync: bool,
        extent: Extent2D,
    ) -> GpuResult<SwapchainImages> {
        let ctx = &self.context;
        let physical = ctx.physical_device.device;
        let surface_error = |e| vk_error(e, ResourceKind::Surface);

        let caps = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_capabilities(physical, ctx.surface)
                .map_err(surface_error)?
        };
        let surface_formats = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_formats(physical, ctx.surface)
                .map_err(surface_error)?
        };
        let present_modes = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_present_modes(physical, ctx.surface)
                .map_err(surface_error)?
        };

        let (surface_format, format) = choose_surface_format(preferred_formats, &surface_formats).ok_or_else(|| {
            GpuError::Creation {
                kind: ResourceKind::Swapchain,
                reason: "surface offers no usable colour format".to_owned(),
            }
        })?;
        if !preferred_formats.contains(&format) {
            log::warn!("No preferred surface format available, using {format:?}");
        }
        let present_mode = choose_present_mode(vsync, &present_modes);
        let image_extent = choose_extent(&caps, extent);
        let image_count = choose_image_count(&caps);

        let mut families = vec![ctx.physical_device.graphics_family];
        if ctx.physical_device.present_family != ctx.physical_device.graphics_family {
            families.push(ctx.physical_device.present_family);
        }
        let sharing_mode = if families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(ctx.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(image_extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&families)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { ctx.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| vk_error(e, ResourceKind::Swapchain))?;
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { ctx.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;

        let images = unsafe { self.context.swapchain_loader.get_swapchain_images(swapchain) }
            .map_err(|e| vk_error(e, ResourceKind::Swapchain))?;

        log::info!(
            "Swapchain created: {}x{} {format:?}, {} images, {present_mode:?}",
            image_extent.width,
            image_extent.height,
            images.len()
        );

        Ok(SwapchainImages {
            images: images.iter().map(|image| ImageHandle::from_raw(image.as_raw())).collect(),
            format,
            extent: Extent2D::new(image_extent.width, image_extent.height),
        })
    }

    fn destroy_swapchain(&mut self) {
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.context.swapchain_loader.destroy_swapchain(self.swapchain, None) };
            self.swapchain = vk::SwapchainKHR::null();
        }
    }

    fn acquire_next_image(&mut self, signal: SemaphoreHandle, timeout_ns: u64) -> GpuResult<AcquireOutcome> {
        let result = unsafe {
            self.context.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout_ns,
                vk::Semaphore::from_raw(signal.raw()),
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired { image_index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(vk_error(e, ResourceKind::Swapchain)),
        }
    }

    fn present(&mut self, image_index: u32, wait: SemaphoreHandle) -> GpuResult<PresentOutcome> {
        let wait_semaphores = [vk::Semaphore::from_raw(wait.raw())];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.context
                .swapchain_loader
                .queue_present(self.context.present_queue(), &present_info)
        };
        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(vk_error(e, ResourceKind::Swapchain)),
        }
    }
}

impl<W: WindowSurface> Drop for VulkanSurface<W> {
    fn drop(&mut self) {
        self.destroy_swapchain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn srgb(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn caps(current: u32, min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current,
                height: current,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            min_image_count: min_count,
            max_image_count: max_count,
            ..Default::default()
        }
    }

    #[test]
    fn preferred_surface_format_wins_in_preference_order() {
        let available = [srgb(vk::Format::R8G8B8A8_SRGB), srgb(vk::Format::B8G8R8A8_SRGB)];
        let (_, format) =
            choose_surface_format(&[GpuFormat::B8G8R8A8Srgb, GpuFormat::R8G8B8A8Srgb], &available).unwrap();
        assert_eq!(format, GpuFormat::B8G8R8A8Srgb);
    }

    #[test]
    fn unsupported_preferences_degrade_to_first_known_format() {
        let available = [srgb(vk::Format::BC1_RGB_SRGB_BLOCK), srgb(vk::Format::B8G8R8A8_UNORM)];
        let (_, format) = choose_surface_format(&[GpuFormat::R8G8B8A8Srgb], &available).unwrap();
        assert_eq!(format, GpuFormat::B8G8R8A8Unorm);
        assert!(choose_surface_format(&[GpuFormat::R8G8B8A8Srgb], &[]).is_none());
    }

    #[test]
    fn present_mode_follows_vsync() {
        let all = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(true, &all), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(false, &all), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(false, &[vk::PresentModeKHR::FIFO]), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_is_clamped_only_when_the_surface_leaves_it_open() {
        let fixed = caps(640, 2, 0);
        assert_eq!(choose_extent(&fixed, Extent2D::new(100, 100)).width, 640);
        let open = caps(u32::MAX, 2, 0);
        let extent = choose_extent(&open, Extent2D::new(4000, 0));
        assert_eq!((extent.width, extent.height), (1024, 1));
    }

    #[test]
    fn one_image_more_than_the_minimum_within_the_maximum() {
        assert_eq!(choose_image_count(&caps(1, 2, 0)), 3);
        assert_eq!(choose_image_count(&caps(1, 2, 2)), 2);
    }
}
