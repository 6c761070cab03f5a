//! The GPU context.
//!
//! [`GpuContext`] is the single entry point for resource creation and
//! capability reporting. It is an explicit context object, created once and
//! passed by reference into every component, rather than a process-wide
//! singleton, so initialization and teardown are ordinary lifecycle calls
//! with no hidden ordering.
//!
//! The context owns the backend connection, the ranked adapter registry,
//! the read-only capability snapshot, the workaround record, and the
//! deferred-reclamation machinery driven by [`render_begin`]/[`render_end`]
//! nesting.
//!
//! [`render_begin`]: GpuContext::render_begin
//! [`render_end`]: GpuContext::render_end

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use parking_lot::Mutex;

use crate::backend::{
    create_backend, AdapterRegistryEntry, BackendKind, BufferUsage, GpuBuffer, GraphicsBackend,
    sort_adapter_registry,
};
use crate::capabilities::{
    capabilities_init, detect_workarounds, DeviceCapabilities, Workarounds,
};
use crate::compiler::{CompilerPool, ShaderCompiler};
use crate::error::GraphicsError;
use crate::graph::{BufferHandle, NodeHandle, RenderGraph, ResourceAccessSet, TextureHandle};
use crate::pso::{PipelineStateInstance, PrimitiveClass, SpecializationValues, TextureFormat, VertexFormat};
use crate::resources::{Batch, Buffer, FrameBuffer, Texture};
use crate::shader::{ShaderCreateInfo, ShaderProgram};

/// Size of the shared null vertex buffer. Large enough for the widest
/// attribute format at constant stride.
const NULL_BUFFER_SIZE: u64 = 64;

/// Number of rotating resource pools. Matches the deepest practical
/// begin/end nesting between reclamation points.
const RESOURCE_POOL_COUNT: usize = 3;

/// Parameters for creating a [`GpuContext`].
#[derive(Debug, Clone, Default)]
pub struct ContextDescriptor {
    /// Backend to use; `None` auto-selects (Vulkan first, then headless).
    pub backend: Option<BackendKind>,
    /// Running without a display; enables deferred reclamation at
    /// `render_end` depth zero.
    pub headless: bool,
    /// Force every workaround to its most conservative value, for
    /// workaround-path testing.
    pub force_workarounds: bool,
}

impl ContextDescriptor {
    /// Descriptor for a headless testing context.
    pub fn headless() -> Self {
        Self {
            backend: Some(BackendKind::Headless),
            headless: true,
            force_workarounds: false,
        }
    }
}

/// Resources waiting for destruction once nothing references them.
#[derive(Debug, Default)]
struct DiscardPool {
    buffers: Vec<Arc<GpuBuffer>>,
    pipelines: Vec<Arc<PipelineStateInstance>>,
}

impl DiscardPool {
    /// Drop every entry nothing else references; returns how many were
    /// destroyed. Entries still referenced stay behind.
    fn destroy_ready(&mut self) -> usize {
        let before = self.buffers.len() + self.pipelines.len();
        self.buffers.retain(|b| Arc::strong_count(b) > 1);
        self.pipelines.retain(|p| Arc::strong_count(p) > 1);
        before - (self.buffers.len() + self.pipelines.len())
    }

    /// Move all remaining entries into `target`.
    fn move_into(&mut self, target: &mut DiscardPool) {
        target.buffers.append(&mut self.buffers);
        target.pipelines.append(&mut self.pipelines);
    }

    fn len(&self) -> usize {
        self.buffers.len() + self.pipelines.len()
    }
}

/// Rotating set of discard pools.
#[derive(Debug)]
struct ResourcePools {
    pools: Vec<DiscardPool>,
    current: usize,
}

impl ResourcePools {
    fn new() -> Self {
        Self {
            pools: (0..RESOURCE_POOL_COUNT).map(|_| DiscardPool::default()).collect(),
            current: 0,
        }
    }

    fn rotate(&mut self) {
        self.current = (self.current + 1) % self.pools.len();
    }

    fn current_mut(&mut self) -> &mut DiscardPool {
        &mut self.pools[self.current]
    }
}

/// The GPU context: backend facade, capability snapshot and resource
/// factory.
///
/// # Thread Safety
///
/// `GpuContext` is `Send + Sync`. Resource binding and graph recording are
/// expected on the render thread; pipeline baking may additionally run on
/// compiler worker threads.
pub struct GpuContext {
    /// Weak self-reference handed to compiler workers.
    self_ref: RwLock<Weak<GpuContext>>,
    backend: Arc<dyn GraphicsBackend>,
    adapters: Vec<AdapterRegistryEntry>,
    capabilities: DeviceCapabilities,
    workarounds: Workarounds,
    headless: bool,
    /// `render_begin`/`render_end` nesting depth. Never negative.
    render_depth: AtomicI32,
    null_buffer: Mutex<Option<Arc<GpuBuffer>>>,
    pools: Mutex<ResourcePools>,
    orphans: Mutex<DiscardPool>,
    compiler_pool: Mutex<Weak<CompilerPool>>,
    bound_shader: Mutex<Option<Arc<ShaderProgram>>>,
    next_resource_id: AtomicU64,
}

impl GpuContext {
    /// Create a context: select the backend, enumerate and rank adapters,
    /// snapshot capabilities and derive workarounds.
    ///
    /// # Errors
    ///
    /// Returns an error when no backend can be initialized.
    pub fn new(descriptor: &ContextDescriptor) -> Result<Arc<Self>, GraphicsError> {
        let backend = create_backend(descriptor.backend)?;

        let mut adapters = backend.enumerate_adapters();
        sort_adapter_registry(&mut adapters);
        for entry in &adapters {
            log::info!(
                "Registered adapter [{}] ({})",
                entry.name,
                entry.identifier
            );
        }

        let snapshot = backend.adapter();
        let capabilities = capabilities_init(snapshot);
        let r8g8b8_ok = backend.format_supports_vertex_fetch(VertexFormat::Unorm8x3);
        let workarounds = detect_workarounds(
            &snapshot.info,
            &snapshot.features,
            r8g8b8_ok,
            descriptor.force_workarounds,
        );

        let context = Arc::new(Self {
            self_ref: RwLock::new(Weak::new()),
            backend,
            adapters,
            capabilities,
            workarounds,
            headless: descriptor.headless,
            render_depth: AtomicI32::new(0),
            null_buffer: Mutex::new(None),
            pools: Mutex::new(ResourcePools::new()),
            orphans: Mutex::new(DiscardPool::default()),
            compiler_pool: Mutex::new(Weak::new()),
            bound_shader: Mutex::new(None),
            next_resource_id: AtomicU64::new(1),
        });

        if let Ok(mut self_ref) = context.self_ref.write() {
            *self_ref = Arc::downgrade(&context);
        }

        log::info!(
            "GpuContext created on '{}' ({} parallel compilations)",
            context.backend.name(),
            context.capabilities.max_parallel_compilations
        );
        Ok(context)
    }

    /// Whether the given backend can run on this host.
    pub fn backend_is_supported(kind: BackendKind) -> bool {
        match kind {
            BackendKind::Headless => cfg!(feature = "headless"),
            BackendKind::Vulkan => {
                #[cfg(feature = "vulkan-backend")]
                return crate::backend::vulkan::VulkanBackend::is_supported();
                #[cfg(not(feature = "vulkan-backend"))]
                false
            }
        }
    }

    pub(crate) fn arc_self(&self) -> Option<Arc<GpuContext>> {
        self.self_ref.read().ok().and_then(|r| r.upgrade())
    }

    /// The active backend.
    pub fn backend(&self) -> &Arc<dyn GraphicsBackend> {
        &self.backend
    }

    /// Ranked adapter registry (sorted by name, then enumeration index).
    pub fn adapters(&self) -> &[AdapterRegistryEntry] {
        &self.adapters
    }

    /// Read-only capability snapshot for this session.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Workaround flags for this adapter.
    pub fn workarounds(&self) -> &Workarounds {
        &self.workarounds
    }

    // ========================================================================
    // Render nesting and deferred reclamation
    // ========================================================================

    /// Enter a rendering scope. Reentrant.
    pub fn render_begin(&self) {
        let previous = self.render_depth.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous >= 0, "unbalanced render_begin/render_end");
    }

    /// Leave a rendering scope.
    ///
    /// When the nesting depth returns to zero on a headless context,
    /// deferred reclamation runs: the resource pool rotates, discarded GPU
    /// objects with no remaining references are destroyed, and leftovers
    /// move to the orphan list for later cleanup.
    pub fn render_end(&self) {
        let depth = self.render_depth.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(depth >= 0, "unbalanced render_begin/render_end");

        if self.headless && depth == 0 {
            self.reclaim_resources();
        }
    }

    /// Current nesting depth.
    pub fn render_depth(&self) -> i32 {
        self.render_depth.load(Ordering::Acquire)
    }

    fn reclaim_resources(&self) {
        let mut pools = self.pools.lock();
        pools.rotate();
        let pool = pools.current_mut();
        let destroyed = pool.destroy_ready();
        if pool.len() > 0 {
            pool.move_into(&mut self.orphans.lock());
        }
        if destroyed > 0 {
            log::trace!("Reclaimed {destroyed} discarded GPU objects");
        }
    }

    /// Queue a GPU buffer for deferred destruction.
    pub fn discard_buffer(&self, buffer: Arc<GpuBuffer>) {
        self.pools.lock().current_mut().buffers.push(buffer);
    }

    /// Queue a pipeline instance for deferred destruction.
    pub fn discard_pipeline(&self, pipeline: Arc<PipelineStateInstance>) {
        self.pools.lock().current_mut().pipelines.push(pipeline);
    }

    /// Number of resources parked on the orphan list.
    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Destroy orphans that have become unreferenced.
    pub fn purge_orphans(&self) -> usize {
        self.orphans.lock().destroy_ready()
    }

    /// Explicit teardown: reclaim everything reclaimable and clear the
    /// bound state. Later calls through this context still work; this only
    /// releases what can be released early.
    pub fn shutdown(&self) {
        debug_assert_eq!(self.render_depth(), 0, "shutdown inside a render scope");
        *self.bound_shader.lock() = None;
        {
            let mut pools = self.pools.lock();
            let mut orphans = self.orphans.lock();
            for pool in &mut pools.pools {
                pool.destroy_ready();
                pool.move_into(&mut orphans);
            }
            orphans.destroy_ready();
        }
        log::info!("GpuContext shut down ({} orphans remain)", self.orphan_count());
    }

    // ========================================================================
    // Resource factory methods
    // ========================================================================

    fn next_id(&self) -> u64 {
        self.next_resource_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a tracked buffer object.
    pub fn buffer_alloc(&self, name: &str, size: u64) -> Buffer {
        Buffer::new(BufferHandle(self.next_id()), name.to_string(), size)
    }

    /// Allocate a tracked texture object.
    pub fn texture_alloc(
        &self,
        name: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Texture {
        Texture::new(
            TextureHandle(self.next_id()),
            name.to_string(),
            width,
            height,
            format,
        )
    }

    /// Allocate an empty framebuffer.
    pub fn framebuffer_alloc(&self, name: &str) -> FrameBuffer {
        FrameBuffer::new(name.to_string())
    }

    /// Allocate an empty draw batch.
    pub fn batch_alloc(&self, name: &str, primitive: PrimitiveClass) -> Batch {
        Batch::new(name.to_string(), primitive)
    }

    /// Compile a shader program synchronously.
    ///
    /// The create-info is finalized here if the caller has not done so.
    /// Returns `None` on compile failure (diagnostics are logged).
    pub fn shader_alloc(&self, mut info: ShaderCreateInfo) -> Option<Arc<ShaderProgram>> {
        if !info.is_finalized() {
            info.finalize();
        }
        ShaderProgram::compile(self, &info)
    }

    /// The shared constant-stride null vertex buffer, allocated on first
    /// use and reused for every null-attribute redirection.
    pub fn null_vertex_buffer(&self) -> Result<Arc<GpuBuffer>, GraphicsError> {
        let mut slot = self.null_buffer.lock();
        if let Some(buffer) = slot.as_ref() {
            return Ok(buffer.clone());
        }
        let buffer = Arc::new(self.backend.allocate_buffer(
            NULL_BUFFER_SIZE,
            BufferUsage::Vertex,
            "null_attribute_buffer",
        )?);
        *slot = Some(buffer.clone());
        Ok(buffer)
    }

    // ========================================================================
    // Shader binding and dispatch recording
    // ========================================================================

    /// Bind a shader for subsequent dispatch recording.
    pub fn shader_bind(&self, shader: &Arc<ShaderProgram>) {
        *self.bound_shader.lock() = Some(shader.clone());
    }

    /// Unbind the current shader.
    pub fn shader_unbind(&self) {
        *self.bound_shader.lock() = None;
    }

    /// The currently bound shader, if any.
    pub fn bound_shader(&self) -> Option<Arc<ShaderProgram>> {
        self.bound_shader.lock().clone()
    }

    /// Record a compute dispatch for the bound shader.
    ///
    /// Bakes (or reuses) the compute pipeline for the given specialization
    /// values and appends a dispatch node. With no shader bound, or when
    /// the bake fails, the call logs and records nothing.
    pub fn compute_dispatch(
        &self,
        graph: &mut RenderGraph,
        groups: [u32; 3],
        specialization: &SpecializationValues,
        accesses: ResourceAccessSet,
    ) -> Option<NodeHandle> {
        let Some(shader) = self.bound_shader() else {
            log::warn!("compute_dispatch with no shader bound; ignoring");
            return None;
        };
        let required_threads = groups[0].saturating_mul(groups[1]).saturating_mul(groups[2]);
        let pipeline =
            shader.bake_compute_pipeline_state(self, specialization, required_threads)?;
        Some(graph.add_dispatch(shader.name().to_string(), pipeline, groups, accesses))
    }

    /// Record an indirect compute dispatch for the bound shader.
    pub fn compute_dispatch_indirect(
        &self,
        graph: &mut RenderGraph,
        indirect_buffer: &Buffer,
        offset: u64,
        specialization: &SpecializationValues,
        accesses: ResourceAccessSet,
    ) -> Option<NodeHandle> {
        let Some(shader) = self.bound_shader() else {
            log::warn!("compute_dispatch_indirect with no shader bound; ignoring");
            return None;
        };
        let pipeline = shader.bake_compute_pipeline_state(self, specialization, 1)?;
        Some(graph.add_dispatch_indirect(
            shader.name().to_string(),
            pipeline,
            indirect_buffer.handle(),
            offset,
            accesses,
        ))
    }

    // ========================================================================
    // Parallel compilation
    // ========================================================================

    /// Get a compiler front-end sharing this context's worker pool.
    ///
    /// Front-ends are reference-counted: the pool (and its threads) exists
    /// while at least one front-end is alive and is torn down with the
    /// last one.
    pub fn shader_compiler(&self) -> ShaderCompiler {
        let mut weak = self.compiler_pool.lock();
        if let Some(pool) = weak.upgrade() {
            return ShaderCompiler::from_pool(pool);
        }
        let ctx = self
            .arc_self()
            .expect("context self-reference must be initialized");
        let pool = CompilerPool::new(Arc::downgrade(&ctx), self.capabilities.max_parallel_compilations);
        *weak = Arc::downgrade(&pool);
        ShaderCompiler::from_pool(pool)
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("backend", &self.backend.name())
            .field("adapters", &self.adapters.len())
            .field("render_depth", &self.render_depth())
            .finish()
    }
}

static_assertions::assert_impl_all!(GpuContext: Send, Sync);

#[cfg(test)]
#[cfg(feature = "headless")]
mod tests {
    use super::*;

    fn test_context() -> Arc<GpuContext> {
        GpuContext::new(&ContextDescriptor::headless()).unwrap()
    }

    #[test]
    fn test_context_creation() {
        let ctx = test_context();
        assert_eq!(ctx.render_depth(), 0);
        assert!(!ctx.adapters().is_empty());
        assert!(ctx.capabilities().max_parallel_compilations >= 1);
    }

    #[test]
    fn test_headless_backend_is_supported() {
        assert!(GpuContext::backend_is_supported(BackendKind::Headless));
    }

    #[test]
    fn test_render_nesting_depth() {
        let ctx = test_context();
        ctx.render_begin();
        ctx.render_begin();
        assert_eq!(ctx.render_depth(), 2);
        ctx.render_end();
        assert_eq!(ctx.render_depth(), 1);
        ctx.render_end();
        assert_eq!(ctx.render_depth(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unbalanced render_begin/render_end")]
    fn test_unbalanced_render_end_asserts() {
        let ctx = test_context();
        ctx.render_end();
    }

    #[test]
    fn test_null_buffer_is_shared() {
        let ctx = test_context();
        let a = ctx.null_vertex_buffer().unwrap();
        let b = ctx.null_vertex_buffer().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_discarded_buffer_reclaimed_at_depth_zero() {
        let ctx = test_context();
        let buffer = Arc::new(
            ctx.backend()
                .allocate_buffer(128, BufferUsage::Storage, "scratch")
                .unwrap(),
        );
        ctx.discard_buffer(buffer);

        ctx.render_begin();
        ctx.render_end();
        // Nothing else references the buffer; a few rotations reach its pool.
        ctx.render_begin();
        ctx.render_end();
        ctx.render_begin();
        ctx.render_end();
        ctx.render_begin();
        ctx.render_end();
        assert_eq!(ctx.orphan_count(), 0);
    }

    #[test]
    fn test_still_referenced_discard_becomes_orphan() {
        let ctx = test_context();
        let buffer = Arc::new(
            ctx.backend()
                .allocate_buffer(128, BufferUsage::Storage, "held")
                .unwrap(),
        );
        ctx.discard_buffer(buffer.clone()); // caller keeps a reference

        for _ in 0..RESOURCE_POOL_COUNT + 1 {
            ctx.render_begin();
            ctx.render_end();
        }
        assert!(ctx.orphan_count() > 0);

        drop(buffer);
        assert_eq!(ctx.purge_orphans(), 1);
        assert_eq!(ctx.orphan_count(), 0);
    }

    #[test]
    fn test_resource_handles_are_unique() {
        let ctx = test_context();
        let a = ctx.buffer_alloc("a", 16);
        let b = ctx.buffer_alloc("b", 16);
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn test_shader_bind_unbind() {
        let ctx = test_context();
        let mut info = crate::shader::ShaderCreateInfo::new("bound").with_compute("fn main() {}");
        info.finalize();
        let shader = ctx.shader_alloc(info).unwrap();

        assert!(ctx.bound_shader().is_none());
        ctx.shader_bind(&shader);
        assert!(ctx.bound_shader().is_some());
        ctx.shader_unbind();
        assert!(ctx.bound_shader().is_none());
    }

    #[test]
    fn test_dispatch_without_bound_shader_is_noop() {
        let ctx = test_context();
        let mut graph = RenderGraph::new();
        let node = ctx.compute_dispatch(
            &mut graph,
            [1, 1, 1],
            &SpecializationValues::new(),
            ResourceAccessSet::new(),
        );
        assert!(node.is_none());
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_compute_dispatch_records_node() {
        let ctx = test_context();
        let mut info = crate::shader::ShaderCreateInfo::new("cs").with_compute("fn main() {}");
        info.finalize();
        let shader = ctx.shader_alloc(info).unwrap();
        ctx.shader_bind(&shader);

        let mut graph = RenderGraph::new();
        let node = ctx.compute_dispatch(
            &mut graph,
            [8, 8, 1],
            &SpecializationValues::new(),
            ResourceAccessSet::new(),
        );
        assert!(node.is_some());
        assert_eq!(graph.node_count(), 1);
        assert_eq!(shader.baked_compute_pipelines(), 1);
    }
}
