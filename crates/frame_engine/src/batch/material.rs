//! Shader layout, material and mesh references consumed by the batcher

use std::rc::Rc;

use crate::gpu::{
    BufferHandle, DescriptorKind, DescriptorSetLayoutHandle, ImageViewHandle, PipelineHandle,
    PipelineLayoutHandle, SamplerHandle, ShaderStages,
};

/// A shader-declared auxiliary buffer binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBinding {
    /// Name instances use to supply data, e.g. `"skin"`
    pub name: String,
    /// Binding index in the material's set
    pub binding: u32,
    /// Uniform or storage
    pub kind: DescriptorKind,
    /// Bytes per element
    pub stride: usize,
    /// Elements per instance
    pub capacity: usize,
    /// Visible stages
    pub stages: ShaderStages,
}

impl ShaderBinding {
    /// Bytes one instance occupies in the buffer
    #[must_use]
    pub const fn instance_bytes(&self) -> usize {
        self.stride * self.capacity
    }
}

/// Descriptor-set structure and instance layout declared by a shader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderLayout {
    /// Debug name
    pub name: String,
    /// Bytes of per-instance data each instance supplies
    pub instance_stride: usize,
    /// Binding of the instance buffer as a storage buffer, if the shader reads it that way
    pub instance_binding: Option<u32>,
    /// Named auxiliary buffers
    pub named_buffers: Vec<ShaderBinding>,
    /// Binding of the instance-data texture mirror, if any
    pub instance_texture_binding: Option<u32>,
    /// Set layout; null when the shader binds nothing per group
    pub set_layout: DescriptorSetLayoutHandle,
}

impl ShaderLayout {
    /// Layout with only per-instance vertex data
    pub fn new(name: impl Into<String>, instance_stride: usize) -> Self {
        Self {
            name: name.into(),
            instance_stride,
            instance_binding: None,
            named_buffers: Vec::new(),
            instance_texture_binding: None,
            set_layout: DescriptorSetLayoutHandle::NULL,
        }
    }
}

/// A texture bound into the material's set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialTexture {
    /// Binding index
    pub binding: u32,
    /// Image view
    pub view: ImageViewHandle,
    /// Sampler
    pub sampler: SamplerHandle,
}

/// Shader plus bound textures and the pipeline drawing with them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Material {
    /// Identity used to key draw groups
    pub id: u64,
    /// Shader declaration
    pub shader: Rc<ShaderLayout>,
    /// Textures written into every group set
    pub textures: Vec<MaterialTexture>,
    /// Externally created graphics pipeline; groups of a material without
    /// one are batched but not drawn
    pub pipeline: Option<(PipelineHandle, PipelineLayoutHandle)>,
}

/// Geometry shared by every instance of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRef {
    /// Identity used to key draw groups
    pub id: u64,
    /// Vertex buffer bound at binding 0
    pub vertex_buffer: BufferHandle,
    /// `u32` index buffer
    pub index_buffer: BufferHandle,
    /// Indices per instance
    pub index_count: u32,
}
