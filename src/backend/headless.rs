//! Headless backend.
//!
//! A CPU-only implementation of [`GraphicsBackend`] used for tests, CI and
//! batch tooling. No GPU objects are created; pipeline "compilation" is
//! instant and deterministic, and reflection data is synthesized from the
//! declared block tables the way a driver would report it.
//!
//! Failure paths are testable without a GPU: a stage whose source contains
//! [`FORCE_ERROR_MARKER`] fails to compile, and a render pipeline whose
//! label contains `"warn"` succeeds with a benign diagnostic attached.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{
    AdapterExtensions, AdapterFeatures, AdapterInfo, AdapterLimits, AdapterSnapshot, AdapterType,
    BackendKind, BlockBinding, BufferBindingReflection, BufferUsage, CompiledPipeline,
    ComputePipelineRequest, determine_os_type, GpuBuffer, GpuPipeline, GraphicsBackend,
    PipelineReflection, RenderPipelineRequest, StageLibrary,
};
use crate::capabilities::REQUIRED_EXTENSIONS;
use crate::error::{CompileDiagnostic, GraphicsError, COMPILE_SUCCESS_MARKER};
use crate::graph::Submission;
use crate::pso::VertexFormat;
use crate::shader::ShaderStage;

/// Source marker that makes a headless stage compile fail.
pub const FORCE_ERROR_MARKER: &str = "//!headless:error";

/// Uniform block sizes are rounded up to this before being reported back,
/// mimicking driver padding.
const BLOCK_SIZE_GRANULARITY: u32 = 16;

/// CPU-only backend implementation.
pub struct HeadlessBackend {
    adapter: AdapterSnapshot,
    next_pipeline_id: AtomicU64,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            adapter: AdapterSnapshot {
                info: AdapterInfo {
                    name: "Headless Adapter".to_string(),
                    vendor_id: 0,
                    device_id: 0,
                    device_type: AdapterType::Software,
                    driver_version: env!("CARGO_PKG_VERSION").to_string(),
                    os: determine_os_type(),
                    index: 0,
                },
                limits: AdapterLimits::default(),
                features: AdapterFeatures::all_supported(),
                extensions: AdapterExtensions::from_names(REQUIRED_EXTENSIONS),
            },
            next_pipeline_id: AtomicU64::new(1),
        }
    }

    fn synthesize_reflection(
        uniform_blocks: &[BlockBinding],
        storage_blocks: &[BlockBinding],
    ) -> PipelineReflection {
        let pad = |size: u32| size.div_ceil(BLOCK_SIZE_GRANULARITY) * BLOCK_SIZE_GRANULARITY;
        let mut buffer_bindings = Vec::with_capacity(uniform_blocks.len() + storage_blocks.len());
        for block in uniform_blocks.iter().chain(storage_blocks) {
            buffer_bindings.push(BufferBindingReflection {
                index: block.index,
                size: pad(block.declared_size) as u64,
                alignment: 256,
                active: block.declared_size > 0,
                stages: block.stages,
            });
        }
        PipelineReflection { buffer_bindings }
    }

    fn next_pipeline(&self) -> GpuPipeline {
        GpuPipeline::Headless {
            id: self.next_pipeline_id.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn name(&self) -> &'static str {
        "Headless"
    }

    fn adapter(&self) -> &AdapterSnapshot {
        &self.adapter
    }

    fn format_supports_vertex_fetch(&self, _format: VertexFormat) -> bool {
        true
    }

    fn compile_stage(
        &self,
        stage: ShaderStage,
        source: &str,
        entry_point: &str,
    ) -> Result<StageLibrary, CompileDiagnostic> {
        if source.contains(FORCE_ERROR_MARKER) {
            return Err(CompileDiagnostic::new(format!(
                "error: forced compile failure in {stage:?} stage at '{entry_point}'"
            )));
        }
        Ok(StageLibrary::Headless {
            stage,
            entry: entry_point.to_string(),
        })
    }

    fn create_render_pipeline(
        &self,
        request: &RenderPipelineRequest<'_>,
    ) -> Result<CompiledPipeline, CompileDiagnostic> {
        let diagnostics = if request.label.contains("warn") {
            Some(CompileDiagnostic::new(format!(
                "{COMPILE_SUCCESS_MARKER}: 1 warning generated for '{}'",
                request.label
            )))
        } else {
            None
        };

        Ok(CompiledPipeline {
            pipeline: self.next_pipeline(),
            reflection: Self::synthesize_reflection(request.uniform_blocks, request.storage_blocks),
            diagnostics,
        })
    }

    fn create_compute_pipeline(
        &self,
        request: &ComputePipelineRequest<'_>,
    ) -> Result<CompiledPipeline, CompileDiagnostic> {
        Ok(CompiledPipeline {
            pipeline: self.next_pipeline(),
            reflection: Self::synthesize_reflection(request.uniform_blocks, request.storage_blocks),
            diagnostics: None,
        })
    }

    fn allocate_buffer(
        &self,
        size: u64,
        _usage: BufferUsage,
        name: &str,
    ) -> Result<GpuBuffer, GraphicsError> {
        if size == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "buffer '{name}' cannot have zero size"
            )));
        }
        Ok(GpuBuffer::Headless { size })
    }

    fn execute(&self, submission: &Submission) -> Result<(), GraphicsError> {
        log::trace!(
            "Headless execute: {} commands, {} barriers",
            submission.commands.len(),
            submission.barrier_count
        );
        Ok(())
    }
}

static_assertions::assert_impl_all!(HeadlessBackend: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_compile_succeeds() {
        let backend = HeadlessBackend::new();
        let library = backend
            .compile_stage(ShaderStage::Vertex, "fn main() {}", "main")
            .unwrap();
        assert_eq!(library.stage(), ShaderStage::Vertex);
        assert_eq!(library.entry_point(), "main");
    }

    #[test]
    fn test_error_marker_fails_stage_compile() {
        let backend = HeadlessBackend::new();
        let result = backend.compile_stage(
            ShaderStage::Fragment,
            "//!headless:error\nfn main() {}",
            "main",
        );
        let diag = result.err().unwrap();
        assert!(!diag.is_benign());
        assert!(diag.text.contains("Fragment"));
    }

    #[test]
    fn test_zero_sized_buffer_rejected() {
        let backend = HeadlessBackend::new();
        assert!(backend
            .allocate_buffer(0, BufferUsage::Vertex, "empty")
            .is_err());
    }

    #[test]
    fn test_reflection_pads_block_sizes() {
        use crate::shader::ShaderStageFlags;
        let reflection = HeadlessBackend::synthesize_reflection(
            &[BlockBinding {
                index: 4,
                declared_size: 20,
                stages: ShaderStageFlags::VERTEX,
            }],
            &[],
        );
        let binding = reflection.binding(4).unwrap();
        assert_eq!(binding.size, 32);
        assert!(binding.active);
    }

    #[test]
    fn test_adapter_meets_minimum_requirements() {
        use crate::capabilities::missing_capabilities;
        let backend = HeadlessBackend::new();
        let adapter = backend.adapter();
        assert!(missing_capabilities(&adapter.features, &adapter.extensions).is_empty());
    }
}
