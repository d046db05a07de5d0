//! Asset byte boundary
//!
//! The frame core never parses asset files. Shader bytecode and other blobs
//! come in as opaque bytes from an [`AssetSource`]; [`FileAssets`] reads them
//! from a list of search directories.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::gpu::{ComputePipelineDesc, DescriptorSetLayoutHandle, GpuDevice, GpuError, PipelineHandle, PipelineLayoutHandle};

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Asset loading errors
#[derive(Error, Debug)]
pub enum AssetError {
    /// No search path contains the asset
    #[error("Asset not found: {0}")]
    NotFound(String),

    /// Reading the file failed
    #[error("IO error reading {path}: {source}")]
    Io {
        /// Resolved file path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Bytes are not a SPIR-V module
    #[error("Invalid SPIR-V in {0}")]
    InvalidSpirv(String),

    /// The device rejected the asset
    #[error("GPU error creating {path}: {source}")]
    Gpu {
        /// Asset path
        path: String,
        /// Device error
        source: GpuError,
    },
}

/// Source of opaque asset bytes
pub trait AssetSource {
    /// Read the whole asset at `path`
    ///
    /// # Errors
    ///
    /// Missing or unreadable asset.
    fn read(&self, path: &str) -> Result<Vec<u8>, AssetError>;
}

/// Reads assets from the first search directory that contains them
#[derive(Debug, Clone, Default)]
pub struct FileAssets {
    search_paths: Vec<PathBuf>,
}

impl FileAssets {
    /// Search `paths` in order
    pub fn new<P: Into<PathBuf>>(paths: impl IntoIterator<Item = P>) -> Self {
        Self {
            search_paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Append a search directory
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.push(path.into());
    }

    /// First existing file for `path`
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path);
        if relative.is_absolute() {
            return relative.is_file().then(|| relative.to_path_buf());
        }
        self.search_paths
            .iter()
            .map(|dir| dir.join(relative))
            .find(|candidate| candidate.is_file())
    }
}

impl AssetSource for FileAssets {
    fn read(&self, path: &str) -> Result<Vec<u8>, AssetError> {
        let resolved = self.resolve(path).ok_or_else(|| AssetError::NotFound(path.to_owned()))?;
        log::trace!("Reading asset {}", resolved.display());
        std::fs::read(&resolved).map_err(|source| AssetError::Io { path: resolved, source })
    }
}

/// Check that `bytes` looks like a SPIR-V module
///
/// # Errors
///
/// [`AssetError::InvalidSpirv`] for a length that is not whole words or a wrong magic number.
pub fn check_spirv(path: &str, bytes: &[u8]) -> Result<(), AssetError> {
    if bytes.len() < 4 || bytes.len() % 4 != 0 {
        return Err(AssetError::InvalidSpirv(path.to_owned()));
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != SPIRV_MAGIC {
        return Err(AssetError::InvalidSpirv(path.to_owned()));
    }
    Ok(())
}

/// Read a compute shader and create its pipeline
///
/// # Errors
///
/// Missing asset, invalid bytecode or pipeline creation failure.
pub fn load_compute_pipeline(
    device: &dyn GpuDevice,
    assets: &dyn AssetSource,
    path: &str,
    set_layouts: &[DescriptorSetLayoutHandle],
) -> Result<(PipelineHandle, PipelineLayoutHandle), AssetError> {
    let spirv = assets.read(path)?;
    check_spirv(path, &spirv)?;
    device
        .create_compute_pipeline(&ComputePipelineDesc {
            spirv: &spirv,
            entry_point: "main",
            set_layouts,
        })
        .map_err(|source| {
            log::error!("Failed to create compute pipeline from {path}: {source}");
            AssetError::Gpu {
                path: path.to_owned(),
                source,
            }
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::testing::MockDevice;

    struct MemoryAssets(HashMap<&'static str, Vec<u8>>);

    impl AssetSource for MemoryAssets {
        fn read(&self, path: &str) -> Result<Vec<u8>, AssetError> {
            self.0.get(path).cloned().ok_or_else(|| AssetError::NotFound(path.to_owned()))
        }
    }

    fn spirv() -> Vec<u8> {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 16]);
        bytes
    }

    #[test]
    fn spirv_check_rejects_bad_input() {
        assert!(check_spirv("ok", &spirv()).is_ok());
        assert!(check_spirv("short", &[3, 2]).is_err());
        assert!(check_spirv("odd", &spirv()[..7]).is_err());
        assert!(check_spirv("magic", &[0; 8]).is_err());
    }

    #[test]
    fn compute_pipeline_from_assets() {
        let device = MockDevice::new();
        let assets = MemoryAssets(HashMap::from([("particles.comp.spv", spirv()), ("junk.spv", vec![1; 8])]));

        let (pipeline, layout) = load_compute_pipeline(&device, &assets, "particles.comp.spv", &[]).unwrap();
        assert!(pipeline.is_valid() && layout.is_valid());
        assert!(matches!(
            load_compute_pipeline(&device, &assets, "junk.spv", &[]),
            Err(AssetError::InvalidSpirv(_))
        ));
        assert!(matches!(
            load_compute_pipeline(&device, &assets, "missing.spv", &[]),
            Err(AssetError::NotFound(_))
        ));
    }

    #[test]
    fn file_assets_search_in_order() {
        let root = std::env::temp_dir().join(format!("frame_engine_assets_{}", std::process::id()));
        let first = root.join("first");
        let second = root.join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(second.join("shader.spv"), b"second").unwrap();

        let assets = FileAssets::new([&first, &second]);
        assert_eq!(assets.read("shader.spv").unwrap(), b"second");

        std::fs::write(first.join("shader.spv"), b"first").unwrap();
        assert_eq!(assets.read("shader.spv").unwrap(), b"first");
        assert!(matches!(assets.read("other.spv"), Err(AssetError::NotFound(_))));

        std::fs::remove_dir_all(&root).ok();
    }
}
