//! Windowing and presentation boundaries

use super::error::GpuResult;
use super::format::GpuFormat;
use super::handles::{ImageHandle, SemaphoreHandle};
use super::types::{AcquireOutcome, Extent2D, PresentOutcome};

/// What the windowing layer must provide to bring up a surface
///
/// Consumed only while creating the instance and surface; the frame loop
/// itself only ever asks for the drawable size.
pub trait WindowSurface {
    /// Current drawable size in pixels
    fn drawable_size(&self) -> Extent2D;

    /// Instance extensions the platform needs for presentation
    ///
    /// # Errors
    ///
    /// The platform cannot report its extensions (no Vulkan support).
    fn instance_extensions(&self) -> GpuResult<Vec<String>>;

    /// Create a native presentation surface for `instance`, returning the raw surface handle
    ///
    /// # Errors
    ///
    /// Platform surface creation failure.
    fn create_surface(&mut self, instance: u64) -> GpuResult<u64>;
}

/// Images of a freshly created swapchain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainImages {
    /// Presentable images in swapchain order
    pub images: Vec<ImageHandle>,
    /// Colour format actually chosen
    pub format: GpuFormat,
    /// Image extent actually chosen
    pub extent: Extent2D,
}

/// Swapchain image acquisition and presentation
pub trait PresentationSurface {
    /// Current drawable size of the window behind the surface
    fn drawable_size(&self) -> Extent2D;

    /// (Re)create the swapchain, retiring any previous one
    ///
    /// `preferred_formats` is a preference list; the first supported entry is
    /// used and an unsupported list degrades to the surface's first format.
    ///
    /// # Errors
    ///
    /// Surface loss or creation failure.
    fn create_swapchain(
        &mut self,
        preferred_formats: &[GpuFormat],
        vsync: bool,
        extent: Extent2D,
    ) -> GpuResult<SwapchainImages>;

    /// Destroy the current swapchain; its images become invalid
    fn destroy_swapchain(&mut self);

    /// Acquire the next image, signalling `signal` once it is ready
    ///
    /// # Errors
    ///
    /// Device or surface loss. Out-of-date is reported through [`AcquireOutcome`].
    fn acquire_next_image(&mut self, signal: SemaphoreHandle, timeout_ns: u64) -> GpuResult<AcquireOutcome>;

    /// Queue `image_index` for presentation after `wait` is signalled
    ///
    /// # Errors
    ///
    /// Device or surface loss. Out-of-date and suboptimal are reported through [`PresentOutcome`].
    fn present(&mut self, image_index: u32, wait: SemaphoreHandle) -> GpuResult<PresentOutcome>;
}
