//! Shader programs.
//!
//! A [`ShaderProgram`] owns its compiled stage libraries, the reflection
//! interface supplied by the translation collaborator, a dirty-tracked
//! push-constant backing store for loose uniforms, and the pipeline state
//! cache keyed by [`PipelineDescriptor`]. A program can reference a parent
//! program whose already-baked descriptors seed this program's cache.
//!
//! Destroying the program destroys its pipeline instances with it; the
//! cache has no life of its own.

pub mod reflection;

pub use reflection::{
    PushConstantLayout, ShaderAttribute, ShaderInterface, ShaderStage, ShaderStageFlags,
    StorageBlockInfo, UniformBlockInfo, UniformInfo,
};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::StageLibrary;
use crate::context::GpuContext;
use crate::pso::{
    PipelineDescriptor, PipelineStateInstance, PrimitiveClass, PsoCache, SpecializationValues,
};

/// Everything needed to create one shader program.
///
/// The application fills this in from its shader registry; the reflection
/// interface comes from the translation collaborator, never from parsing
/// source here. Call [`finalize`](Self::finalize) before compilation;
/// finalization is not thread-safe and must happen before any fan-out to
/// compiler workers.
#[derive(Debug, Clone, Default)]
pub struct ShaderCreateInfo {
    pub name: String,
    pub vertex_source: Option<String>,
    pub fragment_source: Option<String>,
    pub compute_source: Option<String>,
    /// Entry point used for every stage.
    pub entry_point: String,
    pub interface: ShaderInterface,
    /// Parent program whose baked descriptors seed this program's cache.
    pub parent: Option<Arc<ShaderProgram>>,
    finalized: bool,
}

impl ShaderCreateInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_point: "main".to_string(),
            ..Self::default()
        }
    }

    pub fn with_vertex(mut self, source: impl Into<String>) -> Self {
        self.vertex_source = Some(source.into());
        self
    }

    pub fn with_fragment(mut self, source: impl Into<String>) -> Self {
        self.fragment_source = Some(source.into());
        self
    }

    pub fn with_compute(mut self, source: impl Into<String>) -> Self {
        self.compute_source = Some(source.into());
        self
    }

    pub fn with_interface(mut self, interface: ShaderInterface) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_parent(mut self, parent: Arc<ShaderProgram>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Resolve defaults and canonicalize the reflection tables.
    ///
    /// Not thread-safe; must run on the submitting thread before the info
    /// is handed to compiler workers.
    pub fn finalize(&mut self) {
        if self.entry_point.is_empty() {
            self.entry_point = "main".to_string();
        }
        self.interface.finalize();
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// Compiled stage libraries of one program.
#[derive(Debug, Default)]
pub struct ShaderStages {
    pub vertex: Option<StageLibrary>,
    pub fragment: Option<StageLibrary>,
    pub compute: Option<StageLibrary>,
}

/// Push-constant backing store with dirty tracking.
///
/// Uniform setters stage bytes here; the upload is deferred and only
/// happens when the content actually changed (byte-for-byte comparison).
#[derive(Debug, Default)]
struct PushConstantStore {
    data: Vec<u8>,
    dirty: bool,
}

/// A compiled shader program.
pub struct ShaderProgram {
    name: String,
    stages: ShaderStages,
    interface: ShaderInterface,
    push: Mutex<PushConstantStore>,
    pso: PsoCache,
    parent: Option<Arc<ShaderProgram>>,
}

impl std::fmt::Debug for ShaderProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderProgram")
            .field("name", &self.name)
            .field("render_pipelines", &self.pso.render_len())
            .field("compute_pipelines", &self.pso.compute_len())
            .finish_non_exhaustive()
    }
}

impl ShaderProgram {
    /// Compile a program from a finalized create-info.
    ///
    /// Returns `None` on genuine compile failure; the full diagnostic text
    /// is logged. Safe to call from compiler worker threads.
    pub fn compile(ctx: &GpuContext, info: &ShaderCreateInfo) -> Option<Arc<ShaderProgram>> {
        debug_assert!(info.is_finalized(), "create-info must be finalized before compile");

        let backend = ctx.backend();
        let mut stages = ShaderStages::default();

        let stage_sources = [
            (ShaderStage::Vertex, info.vertex_source.as_deref()),
            (ShaderStage::Fragment, info.fragment_source.as_deref()),
            (ShaderStage::Compute, info.compute_source.as_deref()),
        ];
        for (stage, source) in stage_sources {
            let Some(source) = source else { continue };
            match backend.compile_stage(stage, source, &info.entry_point) {
                Ok(library) => match stage {
                    ShaderStage::Vertex => stages.vertex = Some(library),
                    ShaderStage::Fragment => stages.fragment = Some(library),
                    ShaderStage::Compute => stages.compute = Some(library),
                },
                Err(diag) => {
                    log::error!(
                        "Shader '{}' failed to compile ({:?} stage):\n{}",
                        info.name,
                        stage,
                        diag
                    );
                    return None;
                }
            }
        }

        if stages.vertex.is_none() && stages.compute.is_none() {
            log::error!(
                "Shader '{}' declares neither a vertex nor a compute stage",
                info.name
            );
            return None;
        }

        let push_size = info.interface.push_constants.size as usize;
        let program = Arc::new(ShaderProgram {
            name: info.name.clone(),
            stages,
            interface: info.interface.clone(),
            push: Mutex::new(PushConstantStore {
                data: vec![0u8; push_size],
                dirty: push_size > 0,
            }),
            pso: PsoCache::new(),
            parent: info.parent.clone(),
        });

        log::trace!("Compiled shader '{}'", program.name);
        Some(program)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interface(&self) -> &ShaderInterface {
        &self.interface
    }

    pub fn parent(&self) -> Option<&Arc<ShaderProgram>> {
        self.parent.as_ref()
    }

    /// Whether the program owns a compute stage library.
    pub fn has_compute_library(&self) -> bool {
        self.stages.compute.is_some()
    }

    /// Whether the program owns a vertex stage library.
    pub fn has_render_library(&self) -> bool {
        self.stages.vertex.is_some()
    }

    /// Number of render pipeline variants baked so far.
    pub fn baked_render_pipelines(&self) -> usize {
        self.pso.render_len()
    }

    /// Number of compute pipeline variants baked so far.
    pub fn baked_compute_pipelines(&self) -> usize {
        self.pso.compute_len()
    }

    // ========================================================================
    // Pipeline state baking
    // ========================================================================

    /// Deduplicate-or-compile the render pipeline variant for `descriptor`.
    ///
    /// The second call with an equal descriptor returns the same instance
    /// without recompiling.
    pub fn bake_pipeline_state(
        &self,
        ctx: &GpuContext,
        primitive: PrimitiveClass,
        descriptor: &PipelineDescriptor,
    ) -> Option<Arc<PipelineStateInstance>> {
        let Some(vertex) = self.stages.vertex.as_ref() else {
            log::warn!(
                "Shader '{}' has no vertex stage; cannot bake a render pipeline",
                self.name
            );
            return None;
        };
        self.pso.bake_render_pipeline(
            ctx,
            &self.name,
            &self.interface,
            vertex,
            self.stages.fragment.as_ref(),
            primitive,
            descriptor,
        )
    }

    /// Deduplicate-or-compile the compute pipeline variant for the given
    /// specialization values.
    pub fn bake_compute_pipeline_state(
        &self,
        ctx: &GpuContext,
        specialization: &SpecializationValues,
        required_threads: u32,
    ) -> Option<Arc<PipelineStateInstance>> {
        let Some(compute) = self.stages.compute.as_ref() else {
            log::warn!(
                "Shader '{}' has no compute stage; cannot bake a compute pipeline",
                self.name
            );
            return None;
        };
        self.pso.bake_compute_pipeline(
            ctx,
            &self.name,
            &self.interface,
            compute,
            specialization,
            required_threads,
        )
    }

    /// Seed this program's cache from its parent: copy the parent's
    /// known-good descriptors and pre-bake the same variants.
    pub fn warm_from_parent(&self, ctx: &GpuContext) {
        let Some(parent) = self.parent.as_ref() else {
            return;
        };
        let keys = parent.pso.render_keys();
        if keys.is_empty() {
            return;
        }
        log::debug!(
            "Warming shader '{}' from parent '{}' ({} descriptors)",
            self.name,
            parent.name,
            keys.len()
        );
        for (primitive, descriptor) in keys {
            self.bake_pipeline_state(ctx, primitive, &descriptor);
        }
    }

    // ========================================================================
    // Uniform staging (push constants)
    // ========================================================================

    /// Stage float values for the uniform at `location`.
    ///
    /// Out-of-range locations or oversized writes are logged and ignored;
    /// forward progress wins over strictness here.
    pub fn uniform_f32(&self, location: u32, values: &[f32]) {
        self.stage_uniform(location, bytemuck::cast_slice(values));
    }

    /// Stage signed integer values for the uniform at `location`.
    pub fn uniform_i32(&self, location: u32, values: &[i32]) {
        self.stage_uniform(location, bytemuck::cast_slice(values));
    }

    /// Stage unsigned integer values for the uniform at `location`.
    pub fn uniform_u32(&self, location: u32, values: &[u32]) {
        self.stage_uniform(location, bytemuck::cast_slice(values));
    }

    fn stage_uniform(&self, location: u32, bytes: &[u8]) {
        let Some(uniform) = self.interface.uniform_at(location) else {
            log::warn!(
                "Shader '{}': uniform location {} out of range; ignoring",
                self.name,
                location
            );
            return;
        };
        if bytes.len() as u32 > uniform.size {
            log::warn!(
                "Shader '{}': {} bytes written to uniform '{}' of size {}; ignoring",
                self.name,
                bytes.len(),
                uniform.name,
                uniform.size
            );
            return;
        }

        let offset = uniform.offset as usize;
        let mut push = self.push.lock();
        debug_assert!(offset + bytes.len() <= push.data.len());

        // Deferred upload: only mark dirty when the content changed.
        let target = &mut push.data[offset..offset + bytes.len()];
        if target != bytes {
            target.copy_from_slice(bytes);
            push.dirty = true;
        }
    }

    /// Whether staged uniform data awaits upload.
    pub fn push_constants_dirty(&self) -> bool {
        self.push.lock().dirty
    }

    /// Take the push-constant block for upload, clearing the dirty flag.
    ///
    /// Returns `None` when nothing changed since the last upload.
    pub fn take_push_constants(&self) -> Option<Vec<u8>> {
        let mut push = self.push.lock();
        if !push.dirty {
            return None;
        }
        push.dirty = false;
        Some(push.data.clone())
    }
}

static_assertions::assert_impl_all!(ShaderProgram: Send, Sync);

#[cfg(test)]
#[cfg(feature = "headless")]
mod tests {
    use super::*;
    use crate::context::{ContextDescriptor, GpuContext};
    use crate::pso::VertexFormat;

    fn test_context() -> Arc<GpuContext> {
        GpuContext::new(&ContextDescriptor::headless()).unwrap()
    }

    fn uniform_interface() -> ShaderInterface {
        let mut interface = ShaderInterface::new();
        interface.uniforms.push(UniformInfo {
            name: "color".into(),
            location: 0,
            offset: 0,
            size: 16,
            stages: ShaderStageFlags::FRAGMENT,
        });
        interface.uniforms.push(UniformInfo {
            name: "exposure".into(),
            location: 1,
            offset: 16,
            size: 4,
            stages: ShaderStageFlags::FRAGMENT,
        });
        interface.push_constants.size = 32;
        interface
    }

    fn compile_test_shader(ctx: &GpuContext) -> Arc<ShaderProgram> {
        let mut info = ShaderCreateInfo::new("test_shader")
            .with_vertex("fn main() {}")
            .with_fragment("fn main() {}")
            .with_interface(uniform_interface());
        info.finalize();
        ShaderProgram::compile(ctx, &info).unwrap()
    }

    #[test]
    fn test_compile_requires_a_stage() {
        let ctx = test_context();
        let mut info = ShaderCreateInfo::new("empty");
        info.finalize();
        assert!(ShaderProgram::compile(&ctx, &info).is_none());
    }

    #[test]
    fn test_uniform_staging_sets_dirty_once() {
        let ctx = test_context();
        let shader = compile_test_shader(&ctx);

        // Initial state uploads once (zero-filled block).
        assert!(shader.take_push_constants().is_some());
        assert!(!shader.push_constants_dirty());

        shader.uniform_f32(0, &[1.0, 0.5, 0.25, 1.0]);
        assert!(shader.push_constants_dirty());
        let block = shader.take_push_constants().unwrap();
        assert_eq!(block.len(), 32);
        assert!(!shader.push_constants_dirty());

        // Re-staging identical bytes must not re-dirty the block.
        shader.uniform_f32(0, &[1.0, 0.5, 0.25, 1.0]);
        assert!(!shader.push_constants_dirty());
        assert!(shader.take_push_constants().is_none());
    }

    #[test]
    fn test_uniform_out_of_range_is_noop() {
        let ctx = test_context();
        let shader = compile_test_shader(&ctx);
        shader.take_push_constants();

        shader.uniform_f32(42, &[1.0]);
        assert!(!shader.push_constants_dirty());
    }

    #[test]
    fn test_uniform_oversized_write_is_noop() {
        let ctx = test_context();
        let shader = compile_test_shader(&ctx);
        shader.take_push_constants();

        // 'exposure' is 4 bytes; writing 16 must be rejected.
        shader.uniform_f32(1, &[0.0, 1.0, 2.0, 3.0]);
        assert!(!shader.push_constants_dirty());
    }

    #[test]
    fn test_parent_seeds_child_cache() {
        let ctx = test_context();
        let parent = compile_test_shader(&ctx);

        let mut descriptor = crate::pso::PipelineDescriptor::new();
        let buffer = descriptor.add_vertex_buffer(12, crate::pso::StepFunction::PerVertex);
        descriptor.add_attribute(crate::pso::VertexAttribute {
            location: 0,
            format: VertexFormat::F32x3,
            offset: 0,
            buffer_index: buffer,
        });
        let descriptor = descriptor.finalized();

        parent
            .bake_pipeline_state(&ctx, PrimitiveClass::Triangle, &descriptor)
            .unwrap();
        assert_eq!(parent.baked_render_pipelines(), 1);

        let mut info = ShaderCreateInfo::new("child")
            .with_vertex("fn main() {}")
            .with_interface(uniform_interface())
            .with_parent(parent);
        info.finalize();
        let child = ShaderProgram::compile(&ctx, &info).unwrap();
        assert_eq!(child.baked_render_pipelines(), 0);

        child.warm_from_parent(&ctx);
        assert_eq!(child.baked_render_pipelines(), 1);
    }
}
