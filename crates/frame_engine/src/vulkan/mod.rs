//! Vulkan backend
//!
//! `ash` implementations of the device and presentation boundaries, and a
//! GLFW window that can host a Vulkan surface. A typical bring-up:
//!
//! ```rust,no_run
//! use std::rc::Rc;
//!
//! use frame_engine::core::FrameEngineConfig;
//! use frame_engine::renderer::FrameRenderer;
//! use frame_engine::vulkan::{VulkanContext, VulkanDevice, VulkanSurface, Window};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FrameEngineConfig::new("demo");
//! let mut window = Window::new("demo", 1280, 720)?;
//! let context = Rc::new(VulkanContext::new(&mut window, &config)?);
//! let device = VulkanDevice::new(Rc::clone(&context));
//! let surface = VulkanSurface::new(context, window);
//! let mut renderer = FrameRenderer::new(device, surface, &config)?;
//! renderer.render_frame()?;
//! # Ok(())
//! # }
//! ```

/// Instance, physical/logical device and command pool
pub mod context;
/// Neutral type to `vk` conversions
pub mod convert;
/// [`GpuDevice`](crate::gpu::GpuDevice) implementation
pub mod device;
/// [`PresentationSurface`](crate::gpu::PresentationSurface) implementation
pub mod surface;
/// GLFW window
pub mod window;

pub use context::{LogicalDevice, PhysicalDeviceInfo, VulkanContext, VulkanError, VulkanInstance, VulkanResult};
pub use device::VulkanDevice;
pub use surface::VulkanSurface;
pub use window::{Window, WindowError, WindowResult};
