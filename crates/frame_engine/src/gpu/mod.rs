//! Backend-neutral GPU primitives
//!
//! Typed handles, formats, flags and the two boundaries the frame core is
//! written against: [`GpuDevice`] and [`PresentationSurface`].

/// Typed opaque handles
pub mod handles;
/// Device error taxonomy
pub mod error;
/// Texel formats and format fallback
pub mod format;
/// Usage and property flag sets
pub mod flags;
/// Descriptions shared by device calls
pub mod types;
/// The device abstraction trait
pub mod device;
/// Window and presentation traits
pub mod surface;

pub use device::{pad_buffer_size, submit_single_use, GpuDevice};
pub use error::{GpuError, GpuResult, MemoryDomain, ResourceKind};
pub use flags::{BufferUsage, ImageUsage, MemoryProperties, ShaderStages};
pub use format::{select_format, GpuFormat};
pub use handles::*;
pub use surface::{PresentationSurface, SwapchainImages, WindowSurface};
pub use types::*;
