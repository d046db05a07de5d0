//! Opaque typed GPU handles
//!
//! Every object the device hands back is wrapped in its own newtype so a
//! buffer can never be passed where a descriptor pool is expected. The raw
//! value is whatever the backend uses to identify the object (a dispatchable
//! or non-dispatchable Vulkan handle for the ash backend, a counter for the
//! test device). Zero is reserved as the null handle.

macro_rules! define_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
            pub struct $name(u64);

            impl $name {
                /// The null handle
                pub const NULL: Self = Self(0);

                /// Wrap a raw backend value
                #[must_use]
                pub const fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                /// Raw backend value
                #[must_use]
                pub const fn raw(self) -> u64 {
                    self.0
                }

                /// Whether the handle refers to a live object
                #[must_use]
                pub const fn is_valid(self) -> bool {
                    self.0 != 0
                }

                /// Reset to the null handle
                pub fn reset(&mut self) {
                    self.0 = 0;
                }

                /// Take the handle, leaving null behind
                #[must_use]
                pub fn take(&mut self) -> Self {
                    std::mem::take(self)
                }
            }
        )*
    };
}

define_handle! {
    /// GPU buffer object
    BufferHandle;
    /// Device memory allocation backing a buffer or image
    MemoryHandle;
    /// Image object
    ImageHandle;
    /// View onto an image
    ImageViewHandle;
    /// Texture sampler
    SamplerHandle;
    /// Descriptor set layout
    DescriptorSetLayoutHandle;
    /// Descriptor pool
    DescriptorPoolHandle;
    /// Descriptor set allocated from a pool
    DescriptorSetHandle;
    /// Pipeline layout
    PipelineLayoutHandle;
    /// Graphics or compute pipeline
    PipelineHandle;
    /// Render pass
    RenderPassHandle;
    /// Framebuffer
    FramebufferHandle;
    /// Primary command buffer
    CommandBufferHandle;
    /// CPU-GPU fence
    FenceHandle;
    /// GPU-GPU semaphore
    SemaphoreHandle;
    /// Shader module
    ShaderModuleHandle;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_is_invalid() {
        assert!(!BufferHandle::NULL.is_valid());
        assert_eq!(BufferHandle::default(), BufferHandle::NULL);
    }

    #[test]
    fn reset_and_take_clear_the_handle() {
        let mut fence = FenceHandle::from_raw(42);
        assert!(fence.is_valid());
        let taken = fence.take();
        assert_eq!(taken.raw(), 42);
        assert!(!fence.is_valid());

        let mut view = ImageViewHandle::from_raw(7);
        view.reset();
        assert_eq!(view, ImageViewHandle::NULL);
    }
}
