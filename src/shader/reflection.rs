//! Shader reflection interface.
//!
//! The core never parses shader source itself; the translation collaborator
//! supplies a [`ShaderInterface`] describing the attributes, uniforms,
//! buffer blocks and push-constant layout of a program. The pipeline cache
//! and the uniform setters react to this data only.

use bitflags::bitflags;

use crate::pso::VertexFormat;

/// One shader stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

bitflags! {
    /// Set of stages that reference a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStageFlags: u8 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

impl From<ShaderStage> for ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => ShaderStageFlags::COMPUTE,
        }
    }
}

/// One vertex input declared by the shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderAttribute {
    pub name: String,
    pub location: u32,
    /// The element format the shader expects to read.
    pub format: VertexFormat,
}

/// One loose uniform backed by the push-constant block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformInfo {
    pub name: String,
    /// Location handed out to the application.
    pub location: u32,
    /// Byte offset inside the push-constant block.
    pub offset: u32,
    /// Size in bytes.
    pub size: u32,
    pub stages: ShaderStageFlags,
}

/// One uniform block (UBO).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBlockInfo {
    pub name: String,
    /// Slot relative to the resolved uniform base.
    pub slot: u32,
    pub size: u32,
    pub stages: ShaderStageFlags,
}

/// One storage block (SSBO).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageBlockInfo {
    pub name: String,
    /// Slot relative to the resolved storage base.
    pub slot: u32,
    pub size: u32,
    pub stages: ShaderStageFlags,
}

/// Layout of the push-constant block backing the loose uniforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushConstantLayout {
    /// Total size in bytes. Zero when the program declares no uniforms.
    pub size: u32,
}

/// Reflection-derived interface of one shader program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderInterface {
    pub attributes: Vec<ShaderAttribute>,
    pub uniforms: Vec<UniformInfo>,
    pub uniform_blocks: Vec<UniformBlockInfo>,
    pub storage_blocks: Vec<StorageBlockInfo>,
    pub push_constants: PushConstantLayout,
}

impl ShaderInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalize table ordering. Not thread-safe with concurrent lookups;
    /// called once during create-info finalization before any fan-out.
    pub fn finalize(&mut self) {
        self.attributes.sort_by_key(|a| a.location);
        self.uniforms.sort_by_key(|u| u.location);
        self.uniform_blocks.sort_by_key(|b| b.slot);
        self.storage_blocks.sort_by_key(|b| b.slot);
    }

    pub fn uniform_block_count(&self) -> u32 {
        self.uniform_blocks.len() as u32
    }

    /// Find a loose uniform by its application-facing location.
    pub fn uniform_at(&self, location: u32) -> Option<&UniformInfo> {
        self.uniforms.iter().find(|u| u.location == location)
    }

    /// Find a loose uniform by name.
    pub fn uniform_named(&self, name: &str) -> Option<&UniformInfo> {
        self.uniforms.iter().find(|u| u.name == name)
    }

    /// Find an attribute by its shader location.
    pub fn attribute_at(&self, location: u32) -> Option<&ShaderAttribute> {
        self.attributes.iter().find(|a| a.location == location)
    }
}
