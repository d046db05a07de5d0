//! Texel formats understood by the frame core
//!
//! The enum is dense and contiguous so backends can translate it with a plain
//! array lookup indexed by the discriminant (see `vulkan::convert`). Keep
//! [`GpuFormat::ALL`] in discriminant order when adding variants.

use serde::{Deserialize, Serialize};

/// Image and attachment formats
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuFormat {
    /// No format
    Undefined = 0,
    /// 8-bit single channel
    R8Unorm,
    /// 8-bit two channel
    R8G8Unorm,
    /// 8-bit RGBA, linear
    R8G8B8A8Unorm,
    /// 8-bit RGBA, sRGB encoded
    R8G8B8A8Srgb,
    /// 8-bit BGRA, linear
    B8G8R8A8Unorm,
    /// 8-bit BGRA, sRGB encoded
    B8G8R8A8Srgb,
    /// 10-bit packed RGB with 2-bit alpha
    A2B10G10R10UnormPack32,
    /// 16-bit float RGBA
    R16G16B16A16Sfloat,
    /// 32-bit float single channel
    R32Sfloat,
    /// 32-bit float two channel
    R32G32Sfloat,
    /// 32-bit float three channel
    R32G32B32Sfloat,
    /// 32-bit float RGBA
    R32G32B32A32Sfloat,
    /// 16-bit depth
    D16Unorm,
    /// 32-bit float depth
    D32Sfloat,
    /// 24-bit depth with 8-bit stencil
    D24UnormS8Uint,
    /// 32-bit float depth with 8-bit stencil
    D32SfloatS8Uint,
}

impl GpuFormat {
    /// Number of variants
    pub const COUNT: usize = 17;

    /// Every variant in discriminant order
    pub const ALL: [Self; Self::COUNT] = [
        Self::Undefined,
        Self::R8Unorm,
        Self::R8G8Unorm,
        Self::R8G8B8A8Unorm,
        Self::R8G8B8A8Srgb,
        Self::B8G8R8A8Unorm,
        Self::B8G8R8A8Srgb,
        Self::A2B10G10R10UnormPack32,
        Self::R16G16B16A16Sfloat,
        Self::R32Sfloat,
        Self::R32G32Sfloat,
        Self::R32G32B32Sfloat,
        Self::R32G32B32A32Sfloat,
        Self::D16Unorm,
        Self::D32Sfloat,
        Self::D24UnormS8Uint,
        Self::D32SfloatS8Uint,
    ];

    /// Dense index of the variant
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Variant for a dense index
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Bytes per texel, 0 for [`GpuFormat::Undefined`]
    #[must_use]
    pub const fn texel_size(self) -> u32 {
        const SIZES: [u32; GpuFormat::COUNT] = [0, 1, 2, 4, 4, 4, 4, 4, 8, 4, 8, 12, 16, 2, 4, 4, 8];
        SIZES[self as usize]
    }

    /// Whether the format has a depth aspect
    #[must_use]
    pub const fn is_depth(self) -> bool {
        matches!(
            self,
            Self::D16Unorm | Self::D32Sfloat | Self::D24UnormS8Uint | Self::D32SfloatS8Uint
        )
    }

    /// Whether the format has a stencil aspect
    #[must_use]
    pub const fn has_stencil(self) -> bool {
        matches!(self, Self::D24UnormS8Uint | Self::D32SfloatS8Uint)
    }
}

/// Pick the first supported format from a preference list
///
/// When nothing in the list is supported the first candidate is returned and
/// an error is logged; callers keep running on a possibly degraded format
/// instead of failing outright.
///
/// # Panics
///
/// Panics if `candidates` is empty.
pub fn select_format(candidates: &[GpuFormat], is_supported: impl Fn(GpuFormat) -> bool) -> GpuFormat {
    assert!(!candidates.is_empty(), "format preference list must not be empty");

    if let Some(format) = candidates.iter().copied().find(|&format| is_supported(format)) {
        return format;
    }

    log::error!(
        "None of the preferred formats {:?} are supported, falling back to {:?}",
        candidates,
        candidates[0]
    );
    candidates[0]
}
