//! # Amaranth GPU
//!
//! The GPU core of the Amaranth engine: a uniform drawing/compute interface
//! over multiple native graphics APIs.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`GpuContext`] - Explicit context object: backend facade, capability
//!   snapshot, workaround flags and resource factory
//! - [`GraphicsBackend`] - Trait behind which the native APIs live
//!   (Vulkan via ash, plus a headless backend for testing)
//! - [`ShaderProgram`] - Compiled shader stages, reflection interface,
//!   push-constant staging and a per-shader pipeline state cache
//! - [`RenderGraph`] - Draw/dispatch recording with automatic data-hazard
//!   ordering
//! - [`ShaderCompiler`] - Bounded worker pool for background shader and
//!   pipeline compilation
//!
//! ## Example
//!
//! ```ignore
//! use amaranth_gpu::{ContextDescriptor, GpuContext, ShaderCreateInfo};
//!
//! let ctx = GpuContext::new(&ContextDescriptor::default())?;
//! let shader = ctx.shader_alloc(
//!     ShaderCreateInfo::new("unlit").with_vertex(vs).with_fragment(fs),
//! );
//! ```

pub mod backend;
pub mod capabilities;
pub mod compiler;
pub mod context;
pub mod error;
pub mod graph;
pub mod pso;
pub mod resources;
pub mod shader;

// Re-export main types for convenience
pub use backend::{
    AdapterInfo, AdapterRegistryEntry, AdapterSnapshot, AdapterType, BackendKind, GraphicsBackend,
};
pub use capabilities::{DeviceCapabilities, Workarounds};
pub use compiler::{BatchHandle, ShaderCompiler};
pub use context::{ContextDescriptor, GpuContext};
pub use error::{CompileDiagnostic, GraphicsError};
pub use graph::{
    AccessMode, BufferHandle, NodeHandle, RenderGraph, ResourceAccessSet, ResourceId,
    TextureHandle,
};
pub use pso::{
    BlendState, PipelineDescriptor, PipelineStateInstance, PrimitiveClass, SpecValue,
    SpecializationValues, StepFunction, TextureFormat, VertexAttribute, VertexFormat,
};
pub use resources::{Batch, Buffer, FrameBuffer, Texture};
pub use shader::{ShaderCreateInfo, ShaderInterface, ShaderProgram, ShaderStage};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the graphics subsystem.
///
/// This should be called before using any graphics functionality.
pub fn init() {
    log::info!("Amaranth GPU v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[cfg(feature = "headless")]
    #[test]
    fn test_headless_context_creation() {
        let ctx = GpuContext::new(&ContextDescriptor::headless()).unwrap();
        assert_eq!(ctx.backend().kind(), BackendKind::Headless);
    }
}
