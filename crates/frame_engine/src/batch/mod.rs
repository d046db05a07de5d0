//! Instanced draw batching
//!
//! Instances sharing a mesh and a material are drawn with one instanced call.
//! Each group keeps its packed instance data on the CPU and streams the
//! visible part into a per-frame region of a persistently mapped buffer.

/// Group routing
pub mod batcher;
/// Per (mesh, material) batch
pub mod group;
/// Instance capabilities and built-in instance kinds
pub mod instance;
/// Shader layout, material and mesh references
pub mod material;

pub use batcher::{BatchStats, DrawBatcher, GroupId};
pub use group::{instance_texture_extent, DrawInstanceGroup, GroupLimits, INSTANCE_TEXEL_SIZE};
pub use instance::{
    DrawInstance, InstanceRef, InstanceTransform, ModelData, ModelInstance, SkinnedInstance, SKIN_BUFFER,
};
pub use material::{Material, MaterialTexture, MeshRef, ShaderBinding, ShaderLayout};
