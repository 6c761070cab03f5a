//! Common utilities for GPU integration tests.
//!
//! Shared test infrastructure reused across backend implementations.

use std::sync::Arc;

use amaranth_gpu::shader::{ShaderAttribute, ShaderStageFlags, UniformBlockInfo};
use amaranth_gpu::{
    BackendKind, ContextDescriptor, GpuContext, PipelineDescriptor, ShaderCreateInfo,
    ShaderInterface, StepFunction, TextureFormat, VertexAttribute, VertexFormat,
};

/// Available GPU backends for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Headless backend (no actual GPU operations).
    Headless,
    /// Vulkan backend (native via ash).
    Vulkan,
}

impl Backend {
    /// Check if this backend is currently available.
    pub fn is_available(&self) -> bool {
        match self {
            Backend::Headless => cfg!(feature = "headless"),
            Backend::Vulkan => {
                cfg!(feature = "vulkan-backend")
                    && GpuContext::backend_is_supported(BackendKind::Vulkan)
            }
        }
    }

    fn kind(&self) -> BackendKind {
        match self {
            Backend::Headless => BackendKind::Headless,
            Backend::Vulkan => BackendKind::Vulkan,
        }
    }
}

/// Context wrapper for one test run.
pub struct TestContext {
    pub ctx: Arc<GpuContext>,
}

impl TestContext {
    /// Create a context on the given backend, or `None` when the backend
    /// is not available on this host.
    pub fn new(backend: Backend) -> Option<Self> {
        if !backend.is_available() {
            return None;
        }
        let descriptor = ContextDescriptor {
            backend: Some(backend.kind()),
            headless: true,
            force_workarounds: false,
        };
        let ctx = GpuContext::new(&descriptor).ok()?;
        Some(Self { ctx })
    }
}

/// WGSL that compiles on every backend (the headless backend ignores it).
pub const UNLIT_VS: &str = r#"
@vertex
fn main(@location(0) position: vec3<f32>, @location(1) color: vec4<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position + color.rgb * 0.0, 1.0);
}
"#;

pub const UNLIT_FS: &str = r#"
@fragment
fn main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.0, 1.0, 1.0);
}
"#;

pub const FILL_CS: &str = r#"
@compute @workgroup_size(8, 8, 1)
fn main() {}
"#;

/// Interface matching [`UNLIT_VS`]: position + color inputs, one uniform
/// block.
pub fn unlit_interface() -> ShaderInterface {
    let mut interface = ShaderInterface::new();
    interface.attributes.push(ShaderAttribute {
        name: "position".into(),
        location: 0,
        format: VertexFormat::F32x3,
    });
    interface.attributes.push(ShaderAttribute {
        name: "color".into(),
        location: 1,
        format: VertexFormat::Unorm8x4,
    });
    interface.uniform_blocks.push(UniformBlockInfo {
        name: "SceneData".into(),
        slot: 0,
        size: 128,
        stages: ShaderStageFlags::VERTEX | ShaderStageFlags::FRAGMENT,
    });
    interface
}

/// Create-info for the unlit render shader.
pub fn unlit_create_info(name: &str) -> ShaderCreateInfo {
    ShaderCreateInfo::new(name)
        .with_vertex(UNLIT_VS)
        .with_fragment(UNLIT_FS)
        .with_interface(unlit_interface())
}

/// Descriptor binding only the position attribute, leaving `color` to the
/// null-attribute path.
pub fn position_only_descriptor() -> PipelineDescriptor {
    let mut descriptor = PipelineDescriptor::new();
    let buffer = descriptor.add_vertex_buffer(12, StepFunction::PerVertex);
    descriptor.add_attribute(VertexAttribute {
        location: 0,
        format: VertexFormat::F32x3,
        offset: 0,
        buffer_index: buffer,
    });
    descriptor.set_color_format(0, TextureFormat::Rgba8Unorm);
    descriptor.finalized()
}

/// Descriptor binding both attributes.
pub fn full_descriptor() -> PipelineDescriptor {
    let mut descriptor = PipelineDescriptor::new();
    let positions = descriptor.add_vertex_buffer(12, StepFunction::PerVertex);
    let colors = descriptor.add_vertex_buffer(4, StepFunction::PerVertex);
    descriptor.add_attribute(VertexAttribute {
        location: 0,
        format: VertexFormat::F32x3,
        offset: 0,
        buffer_index: positions,
    });
    descriptor.add_attribute(VertexAttribute {
        location: 1,
        format: VertexFormat::Unorm8x4,
        offset: 0,
        buffer_index: colors,
    });
    descriptor.set_color_format(0, TextureFormat::Rgba8Unorm);
    descriptor.finalized()
}
