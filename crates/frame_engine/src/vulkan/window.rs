//! Window management using GLFW

use ash::vk::{self, Handle};
use thiserror::Error;

use crate::gpu::{Extent2D, GpuError, GpuResult, WindowSurface};

/// Window management errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// `glfwInit` failed
    #[error("GLFW initialization failed")]
    InitializationFailed,

    /// The window could not be opened
    #[error("Window creation failed")]
    CreationFailed,

    /// GLFW reported an error
    #[error("GLFW error: {0}")]
    GlfwError(String),
}

/// Result type for window operations
pub type WindowResult<T> = Result<T, WindowError>;

impl From<WindowError> for GpuError {
    fn from(error: WindowError) -> Self {
        Self::InitializationFailed(error.to_string())
    }
}

/// Resizable GLFW window without a client API, ready for a Vulkan surface
pub struct Window {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
    resized: bool,
}

impl Window {
    /// Open a window
    ///
    /// # Errors
    ///
    /// GLFW initialization or window creation failure.
    pub fn new(title: &str, width: u32, height: u32) -> WindowResult<Self> {
        let mut glfw = glfw::init(glfw::fail_on_errors).map_err(|_| WindowError::InitializationFailed)?;

        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(true));

        let (mut window, events) = glfw
            .create_window(width, height, title, glfw::WindowMode::Windowed)
            .ok_or(WindowError::CreationFailed)?;

        window.set_key_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);

        Ok(Self {
            glfw,
            window,
            events,
            resized: false,
        })
    }

    /// Whether the user asked to close the window
    #[must_use]
    pub fn should_close(&self) -> bool {
        self.window.should_close()
    }

    /// Request or cancel closing
    pub fn set_should_close(&mut self, should_close: bool) {
        self.window.set_should_close(should_close);
    }

    /// Process pending events and return them
    ///
    /// Framebuffer resizes are also remembered for [`Window::take_resized`].
    pub fn poll_events(&mut self) -> Vec<glfw::WindowEvent> {
        self.glfw.poll_events();
        let events: Vec<glfw::WindowEvent> = glfw::flush_messages(&self.events).map(|(_, event)| event).collect();
        if events
            .iter()
            .any(|event| matches!(event, glfw::WindowEvent::FramebufferSize(..)))
        {
            self.resized = true;
        }
        events
    }

    /// Block until at least one event arrives; used while minimized
    pub fn wait_events(&mut self) {
        self.glfw.wait_events();
    }

    /// Whether the framebuffer changed size since the last call
    pub fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }

    /// Set the title bar text
    pub fn set_title(&mut self, title: &str) {
        self.window.set_title(title);
    }

    /// Seconds since GLFW was initialized
    #[must_use]
    pub fn time(&self) -> f64 {
        self.glfw.get_time()
    }
}

impl WindowSurface for Window {
    fn drawable_size(&self) -> Extent2D {
        let (width, height) = self.window.get_framebuffer_size();
        Extent2D::new(width.max(0) as u32, height.max(0) as u32)
    }

    fn instance_extensions(&self) -> GpuResult<Vec<String>> {
        self.glfw
            .get_required_instance_extensions()
            .ok_or_else(|| WindowError::GlfwError("Vulkan is not supported by GLFW".to_owned()).into())
    }

    fn create_surface(&mut self, instance: u64) -> GpuResult<u64> {
        let mut surface = vk::SurfaceKHR::null();
        let result = self
            .window
            .create_window_surface(vk::Instance::from_raw(instance), std::ptr::null(), &mut surface);

        if result == vk::Result::SUCCESS {
            Ok(surface.as_raw())
        } else {
            Err(GpuError::Creation {
                kind: crate::gpu::ResourceKind::Surface,
                reason: format!("{result:?}"),
            })
        }
    }
}
