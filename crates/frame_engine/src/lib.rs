//! # Frame Engine
//!
//! GPU resource and frame-lifecycle manager for a retained-mode Vulkan renderer.
//!
//! ## Features
//!
//! - **Frames in flight**: per-slot fences and semaphores, acquire/submit/present
//!   with swapchain rebuilds on resize
//! - **Deferred destruction**: GPU objects are released only once no in-flight
//!   frame can still reference them
//! - **Descriptor pools**: per-frame set allocation with transparent overflow
//!   into new pools
//! - **Instanced batching**: instances grouped by mesh and material, streamed
//!   into per-frame regions of persistently mapped buffers
//! - **Staged submission**: pre-pass producers run ahead of the main pass;
//!   compute work runs before either
//!
//! The frame core is written against [`gpu::GpuDevice`] and
//! [`gpu::PresentationSurface`]; [`vulkan`] provides the `ash` implementations.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

// Core engine modules
pub mod core;
pub mod gpu;

pub mod assets;
pub mod batch;
pub mod config;
pub mod foundation;
pub mod frame;
pub mod painter;
pub mod renderer;
pub mod vulkan;

#[cfg(test)]
mod testing;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        assets::{AssetError, AssetSource, FileAssets},
        batch::{DrawInstance, GroupId, InstanceRef, Material, MeshRef, ModelInstance, ShaderLayout},
        config::Config,
        core::FrameEngineConfig,
        foundation::math::{Mat4, Transform, Vec3},
        frame::{OffscreenPass, PassKey, SwapchainDependent},
        gpu::{GpuDevice, GpuError, GpuFormat, GpuResult, PresentationSurface},
        painter::{ComputeTask, PaintStage},
        renderer::{FrameRenderer, FrameStats},
        vulkan::{VulkanContext, VulkanDevice, VulkanSurface, Window},
    };
}
