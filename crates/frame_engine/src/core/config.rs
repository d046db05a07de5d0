//! # Frame Engine Configuration
//!
//! Tunables of the frame core: slot count, descriptor pool sizing, the fence
//! timeout, swapchain preferences and the instance-texture row limit. Loaded
//! through [`Config`] from TOML or RON, validated with
//! [`FrameEngineConfig::validate`].

use serde::{Deserialize, Serialize};

pub use crate::config::{Config, ConfigError};
use crate::frame::{SwapchainSettings, MAX_FRAMES_IN_FLIGHT};
use crate::gpu::GpuFormat;

/// Top-level configuration of the frame engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameEngineConfig {
    /// Application name passed to instance creation
    pub application_name: String,
    /// Frame slots; clamped to `1..=MAX_FRAMES_IN_FLIGHT`
    pub frames_in_flight: usize,
    /// Estimated sets per descriptor kind for each new pool
    pub descriptor_sets_per_pool: u32,
    /// Upper bound on every fence wait, in nanoseconds
    pub fence_timeout_ns: u64,
    /// Swapchain colour formats in order of preference
    pub preferred_surface_formats: Vec<GpuFormat>,
    /// Depth formats in order of preference
    pub preferred_depth_formats: Vec<GpuFormat>,
    /// MSAA sample count; 1 renders straight into the swapchain image
    pub msaa_samples: u32,
    /// FIFO presentation
    pub vsync: bool,
    /// Validation layers; `None` enables them in debug builds only
    pub enable_validation: Option<bool>,
    /// Texels per row of instance-data textures
    pub instance_texture_row_texels: u32,
}

impl Default for FrameEngineConfig {
    fn default() -> Self {
        Self {
            application_name: "Frame Engine Application".to_owned(),
            frames_in_flight: 2,
            descriptor_sets_per_pool: 64,
            fence_timeout_ns: 10_000_000_000,
            preferred_surface_formats: vec![GpuFormat::B8G8R8A8Srgb, GpuFormat::R8G8B8A8Srgb],
            preferred_depth_formats: vec![GpuFormat::D32Sfloat, GpuFormat::D32SfloatS8Uint, GpuFormat::D24UnormS8Uint],
            msaa_samples: 1,
            vsync: true,
            enable_validation: None,
            instance_texture_row_texels: 2048,
        }
    }
}

impl FrameEngineConfig {
    /// Defaults with a custom application name
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Self::default()
        }
    }

    /// Reject values the frame core cannot run with
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames_in_flight == 0 {
            return Err(ConfigError::Invalid("frames_in_flight must be at least 1".to_owned()));
        }
        if self.descriptor_sets_per_pool == 0 {
            return Err(ConfigError::Invalid("descriptor_sets_per_pool must be at least 1".to_owned()));
        }
        if self.preferred_surface_formats.is_empty() {
            return Err(ConfigError::Invalid("preferred_surface_formats is empty".to_owned()));
        }
        if self.preferred_depth_formats.is_empty() {
            return Err(ConfigError::Invalid("preferred_depth_formats is empty".to_owned()));
        }
        if let Some(format) = self.preferred_depth_formats.iter().find(|format| !format.is_depth()) {
            return Err(ConfigError::Invalid(format!("{format:?} is not a depth format")));
        }
        if !self.msaa_samples.is_power_of_two() || self.msaa_samples > 64 {
            return Err(ConfigError::Invalid(format!(
                "msaa_samples must be a power of two up to 64, got {}",
                self.msaa_samples
            )));
        }
        if self.instance_texture_row_texels == 0 {
            return Err(ConfigError::Invalid("instance_texture_row_texels must be at least 1".to_owned()));
        }
        Ok(())
    }

    /// Slot count actually used
    #[must_use]
    pub fn frames(&self) -> usize {
        let clamped = self.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT);
        if clamped != self.frames_in_flight {
            log::warn!(
                "frames_in_flight = {} is out of range, using {clamped}",
                self.frames_in_flight
            );
        }
        clamped
    }

    /// Whether validation layers should be requested
    #[must_use]
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Swapchain preferences
    #[must_use]
    pub fn swapchain_settings(&self) -> SwapchainSettings {
        SwapchainSettings {
            preferred_surface_formats: self.preferred_surface_formats.clone(),
            preferred_depth_formats: self.preferred_depth_formats.clone(),
            msaa_samples: self.msaa_samples,
            vsync: self.vsync,
        }
    }
}

impl Config for FrameEngineConfig {}
