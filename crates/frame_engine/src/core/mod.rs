//! # Core Module
//!
//! Engine-wide configuration shared by the frame core and the backend.

pub mod config;

pub use config::{Config, ConfigError, FrameEngineConfig};
