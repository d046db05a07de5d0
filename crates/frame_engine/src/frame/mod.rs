//! Frame lifecycle
//!
//! Deferred destruction, descriptor allocation, per-frame synchronisation and
//! the swapchain with everything that has to be rebuilt alongside it.

/// Render-thread context object
pub mod context;
/// Descriptor pools with overflow
pub mod descriptors;
/// Swapchain-dependent passes
pub mod passes;
/// Swapchain and its attachments
pub mod swapchain;
/// Frame slots
pub mod sync;
/// Acquire/submit/present loop
pub mod synchronizer;
/// Deferred destruction queue
pub mod trash;

pub use context::RenderContext;
pub use descriptors::{DescriptorAllocator, FrameSets, MAX_FRAMES_IN_FLIGHT};
pub use passes::{OffscreenPass, PassKey, RebuildContext, RenderPassCache, SwapchainDependent};
pub use swapchain::{RenderTarget, SwapChain, SwapchainSettings};
pub use sync::{FrameSlot, FrameSlotState};
pub use synchronizer::{FrameSynchronizer, FrameTarget, PreRunCallback};
pub use trash::{BufferTrash, TrashEntry};
