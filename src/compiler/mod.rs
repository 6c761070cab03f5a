//! Parallel shader compilation.
//!
//! Compilation is the only work allowed off the render thread. A bounded
//! pool of worker threads drains a FIFO queue of work items; requests are
//! grouped into batches whose completion the caller polls or blocks on.
//!
//! The pool is shared: every [`ShaderCompiler`] front-end obtained from a
//! context references one [`CompilerPool`], lazily spawned on first use
//! and torn down when the last front-end drops. Shutdown force-completes
//! all queued-but-unstarted items (their results stay empty) so no waiter
//! can hang; there is no mid-compile cancellation.
//!
//! # Worker state machine
//!
//! ```text
//! idle -> dequeue-or-wait -> compiling -> idle
//!                 |
//!                 v (terminate flag)
//!               join
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::context::GpuContext;
use crate::pso::SpecializationValues;
use crate::shader::{ShaderCreateInfo, ShaderProgram};

/// Handle to a batch of compilation work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchHandle(u64);

/// What one work item does.
enum WorkKind {
    /// Compile a program from source; warms the cache from the parent
    /// program afterwards.
    CompileSource(ShaderCreateInfo),
    /// Bake one compute pipeline variant for an existing program.
    BakeSpecialization {
        shader: Arc<ShaderProgram>,
        values: SpecializationValues,
    },
}

/// One unit of asynchronous work.
///
/// The completion flag and result are mutated only by the worker that
/// processes the item (or by shutdown force-completion); readiness is
/// monotonic: once set it never clears.
struct WorkItem {
    kind: Mutex<Option<WorkKind>>,
    ready: AtomicBool,
    result: Mutex<Option<Arc<ShaderProgram>>>,
}

impl WorkItem {
    fn new(kind: WorkKind) -> Arc<Self> {
        Arc::new(Self {
            kind: Mutex::new(Some(kind)),
            ready: AtomicBool::new(false),
            result: Mutex::new(None),
        })
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// State shared between front-ends and worker threads.
struct PoolShared {
    queue: Mutex<VecDeque<Arc<WorkItem>>>,
    work_available: Condvar,
    terminate: AtomicBool,
    batches: Mutex<HashMap<u64, Vec<Arc<WorkItem>>>>,
    next_batch: AtomicU64,
    context: Weak<GpuContext>,
}

/// The shared worker pool behind every compiler front-end.
pub struct CompilerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    workers_spawned: AtomicBool,
    worker_count: usize,
}

impl CompilerPool {
    /// Create a pool bound to a context.
    ///
    /// The worker count is the host parallelism minus one (the render
    /// thread keeps a core), clamped by the platform-reported maximum
    /// concurrent compilation count. Threads spawn lazily on first use.
    pub(crate) fn new(context: Weak<GpuContext>, max_parallel_compilations: usize) -> Arc<Self> {
        let host = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        let worker_count = host
            .saturating_sub(1)
            .clamp(1, max_parallel_compilations.max(1));

        Arc::new(Self {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(VecDeque::new()),
                work_available: Condvar::new(),
                terminate: AtomicBool::new(false),
                batches: Mutex::new(HashMap::new()),
                next_batch: AtomicU64::new(1),
                context,
            }),
            workers: Mutex::new(Vec::new()),
            workers_spawned: AtomicBool::new(false),
            worker_count,
        })
    }

    /// Spawn the worker threads on first use.
    fn ensure_workers(&self) {
        if self.workers_spawned.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.workers.lock();
        for index in 0..self.worker_count {
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("shader-compiler-{index}"))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn compiler worker");
            workers.push(handle);
        }
        log::debug!("Spawned {} shader compiler workers", self.worker_count);
    }

    fn enqueue_batch(&self, kinds: Vec<WorkKind>) -> BatchHandle {
        let items: Vec<Arc<WorkItem>> = kinds.into_iter().map(WorkItem::new).collect();
        let handle = BatchHandle(self.shared.next_batch.fetch_add(1, Ordering::Relaxed));

        self.shared.batches.lock().insert(handle.0, items.clone());
        {
            let mut queue = self.shared.queue.lock();
            for item in items {
                queue.push_back(item);
            }
        }
        self.shared.work_available.notify_all();
        handle
    }

    fn batch_is_ready(&self, handle: BatchHandle) -> bool {
        match self.shared.batches.lock().get(&handle.0) {
            Some(items) => items.iter().all(|item| item.is_ready()),
            // Already finalized or never existed: nothing is pending.
            None => true,
        }
    }

    fn batch_finalize(&self, handle: BatchHandle) -> Option<Vec<Option<Arc<ShaderProgram>>>> {
        // Snapshot the items first so the wait happens without the map lock.
        let items = self.shared.batches.lock().get(&handle.0).cloned()?;

        while !items.iter().all(|item| item.is_ready()) {
            std::thread::sleep(Duration::from_micros(500));
        }

        let items = self.shared.batches.lock().remove(&handle.0)?;
        Some(items.iter().map(|item| item.result.lock().take()).collect())
    }
}

impl Drop for CompilerPool {
    fn drop(&mut self) {
        self.shared.terminate.store(true, Ordering::Release);

        // Drain the queue, force-marking unstarted items ready so waiters
        // observe empty results instead of hanging.
        {
            let mut queue = self.shared.queue.lock();
            for item in queue.drain(..) {
                item.ready.store(true, Ordering::Release);
            }
        }
        self.shared.work_available.notify_all();

        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        log::debug!("Shader compiler pool shut down");
    }
}

fn worker_loop(shared: &Arc<PoolShared>) {
    loop {
        // idle -> dequeue-or-wait
        let item = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.terminate.load(Ordering::Acquire) {
                    return;
                }
                if let Some(item) = queue.pop_front() {
                    break item;
                }
                shared.work_available.wait(&mut queue);
            }
        };

        // compiling
        if let Some(kind) = item.kind.lock().take() {
            process_item(shared, &item, kind);
        }
        item.ready.store(true, Ordering::Release);
    }
}

fn process_item(shared: &Arc<PoolShared>, item: &WorkItem, kind: WorkKind) {
    let Some(ctx) = shared.context.upgrade() else {
        // Context already torn down; leave the result empty.
        return;
    };
    match kind {
        WorkKind::CompileSource(info) => {
            if let Some(program) = ShaderProgram::compile(&ctx, &info) {
                // Eagerly pre-bake the variants the parent already proved.
                program.warm_from_parent(&ctx);
                *item.result.lock() = Some(program);
            }
        }
        WorkKind::BakeSpecialization { shader, values } => {
            shader.bake_compute_pipeline_state(&ctx, &values, 1);
        }
    }
}

/// Compiler front-end.
///
/// Obtain as many front-ends from the context as needed; they all share
/// one pool.
pub struct ShaderCompiler {
    pool: Arc<CompilerPool>,
}

impl ShaderCompiler {
    pub(crate) fn from_pool(pool: Arc<CompilerPool>) -> Self {
        Self { pool }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Arc<CompilerPool> {
        &self.pool
    }

    /// Queue a set of shader programs for background compilation.
    ///
    /// Every create-info is finalized here, synchronously; finalization
    /// is not thread-safe and must happen before fan-out. Returns a batch
    /// handle to poll with [`batch_is_ready`](Self::batch_is_ready) and
    /// collect with [`batch_finalize`](Self::batch_finalize).
    pub fn batch_compile(&self, mut infos: Vec<ShaderCreateInfo>) -> BatchHandle {
        for info in &mut infos {
            info.finalize();
        }
        self.pool.ensure_workers();
        self.pool
            .enqueue_batch(infos.into_iter().map(WorkKind::CompileSource).collect())
    }

    /// Queue compute pipeline pre-baking for already-compiled programs.
    ///
    /// Programs without a compute library are skipped: render-pipeline
    /// specialization needs live framebuffer state that does not exist off
    /// the render thread.
    pub fn precompile_specializations(
        &self,
        requests: &[(Arc<ShaderProgram>, SpecializationValues)],
    ) -> BatchHandle {
        let mut kinds = Vec::with_capacity(requests.len());
        for (shader, values) in requests {
            if !shader.has_compute_library() {
                log::debug!(
                    "Skipping specialization pre-bake for '{}': no compute library",
                    shader.name()
                );
                continue;
            }
            kinds.push(WorkKind::BakeSpecialization {
                shader: shader.clone(),
                values: values.clone(),
            });
        }
        self.pool.ensure_workers();
        self.pool.enqueue_batch(kinds)
    }

    /// Whether every work item in the batch has completed.
    ///
    /// Readiness is monotonic: once this returns `true` for a live batch
    /// it stays `true` until the batch is finalized. A handle that was
    /// already finalized reports `true`.
    pub fn batch_is_ready(&self, handle: BatchHandle) -> bool {
        self.pool.batch_is_ready(handle)
    }

    /// Block until the batch completes, then remove it and return the
    /// compiled programs in submission order.
    ///
    /// Items that failed to compile (or were force-completed by shutdown)
    /// yield `None`. Returns `None` for a handle that was already
    /// finalized. There is no timeout: a stalled worker stalls the caller,
    /// visibly.
    pub fn batch_finalize(&self, handle: BatchHandle) -> Option<Vec<Option<Arc<ShaderProgram>>>> {
        self.pool.batch_finalize(handle)
    }
}

static_assertions::assert_impl_all!(ShaderCompiler: Send);

#[cfg(test)]
#[cfg(feature = "headless")]
mod tests {
    use super::*;
    use crate::context::ContextDescriptor;

    fn test_context() -> Arc<GpuContext> {
        GpuContext::new(&ContextDescriptor::headless()).unwrap()
    }

    fn create_info(name: &str) -> ShaderCreateInfo {
        ShaderCreateInfo::new(name)
            .with_vertex("fn main() {}")
            .with_fragment("fn main() {}")
    }

    #[test]
    fn test_batch_compile_and_finalize() {
        let ctx = test_context();
        let compiler = ctx.shader_compiler();

        let handle = compiler.batch_compile(vec![create_info("a"), create_info("b")]);
        let results = compiler.batch_finalize(handle).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().name(), "a");
        assert_eq!(results[1].as_ref().unwrap().name(), "b");

        // The batch is gone; readiness reports true, finalize fails.
        assert!(compiler.batch_is_ready(handle));
        assert!(compiler.batch_finalize(handle).is_none());
    }

    #[test]
    fn test_batch_readiness_becomes_permanently_true() {
        let ctx = test_context();
        let compiler = ctx.shader_compiler();

        let handle = compiler.batch_compile(vec![create_info("mono")]);
        while !compiler.batch_is_ready(handle) {
            std::thread::sleep(Duration::from_millis(1));
        }
        for _ in 0..10 {
            assert!(compiler.batch_is_ready(handle));
        }
    }

    #[test]
    fn test_failed_compile_yields_empty_result() {
        let ctx = test_context();
        let compiler = ctx.shader_compiler();

        // No stage source at all: compilation must fail, not hang.
        let handle = compiler.batch_compile(vec![ShaderCreateInfo::new("broken")]);
        let results = compiler.batch_finalize(handle).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_none());
    }

    #[test]
    fn test_front_ends_share_one_pool() {
        let ctx = test_context();
        let a = ctx.shader_compiler();
        let b = ctx.shader_compiler();
        assert!(Arc::ptr_eq(a.pool(), b.pool()));
    }

    #[test]
    fn test_pool_is_recreated_after_last_front_end_drops() {
        let ctx = test_context();
        {
            let compiler = ctx.shader_compiler();
            let handle = compiler.batch_compile(vec![create_info("first")]);
            compiler.batch_finalize(handle).unwrap();
        }
        // Last front-end dropped tore the pool down; the next request
        // builds a fresh one that works just as well.
        let compiler = ctx.shader_compiler();
        let handle = compiler.batch_compile(vec![create_info("again")]);
        assert!(compiler.batch_finalize(handle).is_some());
    }

    #[test]
    fn test_shutdown_force_completes_unstarted_items() {
        let ctx = test_context();
        let pool = CompilerPool::new(Arc::downgrade(&ctx), 2);

        // Enqueue without spawning workers: items can never be processed.
        let handle = pool.enqueue_batch(vec![
            WorkKind::CompileSource(create_info("never")),
            WorkKind::CompileSource(create_info("ever")),
        ]);
        let items = pool.shared.batches.lock().get(&handle.0).cloned().unwrap();
        assert!(!items.iter().all(|i| i.is_ready()));

        drop(pool);
        assert!(items.iter().all(|i| i.is_ready()));
        assert!(items.iter().all(|i| i.result.lock().is_none()));
    }

    #[test]
    fn test_precompile_skips_programs_without_compute_library() {
        let ctx = test_context();
        let compiler = ctx.shader_compiler();

        let render_only = ctx.shader_alloc(create_info("render_only")).unwrap();
        let mut compute_info = ShaderCreateInfo::new("kernel").with_compute("fn main() {}");
        compute_info.finalize();
        let kernel = ctx.shader_alloc(compute_info).unwrap();

        let handle = compiler.precompile_specializations(&[
            (render_only.clone(), SpecializationValues::new()),
            (kernel.clone(), SpecializationValues::new()),
        ]);
        compiler.batch_finalize(handle).unwrap();

        assert_eq!(render_only.baked_compute_pipelines(), 0);
        assert_eq!(kernel.baked_compute_pipelines(), 1);
    }
}
