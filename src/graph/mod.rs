//! Render graph / command recorder.
//!
//! The render graph accumulates draw and dispatch nodes for one frame
//! segment together with their resource-access declarations, resolves data
//! hazards into explicit dependency edges, and produces an ordered command
//! stream.
//!
//! # Ordering guarantees
//!
//! 1. Nodes that only read a resource may be reordered freely relative to
//!    each other.
//! 2. A node writing a resource previously read or written by an earlier
//!    node is serialized after those accesses via an inserted barrier.
//! 3. Nodes with no data dependency between them keep their submission
//!    order (stable ordering, never reordered for its own sake), which
//!    keeps results deterministic and debuggable.
//!
//! All recording happens on the render thread; the graph itself needs no
//! internal locking.

mod node;

pub use node::{
    AccessMode, BufferHandle, Node, NodeKind, ResourceAccess, ResourceAccessSet, ResourceId,
    TextureHandle,
};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::GraphicsError;
use crate::pso::PipelineStateInstance;

/// Handle to a node in the render graph.
///
/// `NodeHandle` is `Copy` and cheap to pass around. It is only valid within
/// the `RenderGraph` that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(u32);

impl NodeHandle {
    fn new(index: u32) -> Self {
        Self(index)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A barrier inserted between two nodes because of a data hazard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    /// Node whose access must complete first.
    pub before: NodeHandle,
    /// Node that must wait.
    pub after: NodeHandle,
    /// The resource the hazard is on.
    pub resource: ResourceId,
}

/// Per-resource hazard tracking state.
#[derive(Debug, Default)]
struct ResourceState {
    /// Last node that wrote the resource, in submission order.
    last_writer: Option<NodeHandle>,
    /// Nodes that read the resource since the last write.
    readers_since_write: Vec<NodeHandle>,
}

/// Errors that can occur during graph compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The graph contains a cyclic dependency.
    CyclicDependency,
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CyclicDependency => write!(f, "render graph contains cyclic dependency"),
        }
    }
}

impl std::error::Error for GraphError {}

/// The render graph accumulates GPU work for one frame segment.
#[derive(Debug, Default)]
pub struct RenderGraph {
    /// All nodes in submission order.
    nodes: Vec<Node>,
    /// Dependency edges stored as (dependent, dependency) pairs.
    edges: Vec<(NodeHandle, NodeHandle)>,
    /// Barriers derived from data hazards, for debugging and submission.
    barriers: Vec<Barrier>,
    /// Hazard tracking per resource.
    states: HashMap<ResourceId, ResourceState>,
}

impl RenderGraph {
    /// Create a new empty render graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a draw node.
    pub fn add_draw(
        &mut self,
        label: impl Into<String>,
        pipeline: Arc<PipelineStateInstance>,
        vertex_count: u32,
        instance_count: u32,
        accesses: ResourceAccessSet,
    ) -> NodeHandle {
        self.add_node(Node::new(
            label,
            pipeline,
            NodeKind::Draw {
                vertex_count,
                instance_count,
                first_vertex: 0,
                first_instance: 0,
            },
            accesses,
        ))
    }

    /// Record a compute dispatch node.
    pub fn add_dispatch(
        &mut self,
        label: impl Into<String>,
        pipeline: Arc<PipelineStateInstance>,
        groups: [u32; 3],
        accesses: ResourceAccessSet,
    ) -> NodeHandle {
        self.add_node(Node::new(label, pipeline, NodeKind::Dispatch { groups }, accesses))
    }

    /// Record an indirect compute dispatch node. The indirect argument
    /// buffer is implicitly declared as a read.
    pub fn add_dispatch_indirect(
        &mut self,
        label: impl Into<String>,
        pipeline: Arc<PipelineStateInstance>,
        buffer: BufferHandle,
        offset: u64,
        mut accesses: ResourceAccessSet,
    ) -> NodeHandle {
        accesses.add(ResourceId::Buffer(buffer), AccessMode::Read);
        self.add_node(Node::new(
            label,
            pipeline,
            NodeKind::DispatchIndirect { buffer, offset },
            accesses,
        ))
    }

    /// Add a fully-built node, deriving dependency edges from its declared
    /// resource accesses.
    pub fn add_node(&mut self, node: Node) -> NodeHandle {
        let handle = NodeHandle::new(self.nodes.len() as u32);

        for access in node.accesses.iter() {
            let state = self.states.entry(access.resource).or_default();

            if access.access.is_write() {
                // Write-after-read and write-after-write: serialize behind
                // every access since (and including) the last write.
                let writer = state.last_writer;
                let readers: Vec<NodeHandle> = state.readers_since_write.clone();
                if let Some(writer) = writer {
                    self.push_dependency(handle, writer, access.resource);
                }
                for reader in readers {
                    self.push_dependency(handle, reader, access.resource);
                }
            } else if let Some(writer) = state.last_writer {
                // Read-after-write. Readers do not depend on each other.
                self.push_dependency(handle, writer, access.resource);
            }
        }

        // Update tracking after edge derivation so a read-write node does
        // not depend on itself.
        for access in node.accesses.iter() {
            let state = self.states.entry(access.resource).or_default();
            if access.access.is_write() {
                state.last_writer = Some(handle);
                state.readers_since_write.clear();
            }
            if access.access.is_read() && !access.access.is_write() {
                state.readers_since_write.push(handle);
            }
        }

        self.nodes.push(node);
        handle
    }

    fn push_dependency(&mut self, dependent: NodeHandle, dependency: NodeHandle, resource: ResourceId) {
        debug_assert!(dependent != dependency, "node cannot depend on itself");
        let exists = self
            .edges
            .iter()
            .any(|&(d, dep)| d == dependent && dep == dependency);
        if !exists {
            self.edges.push((dependent, dependency));
        }
        self.barriers.push(Barrier {
            before: dependency,
            after: dependent,
            resource,
        });
    }

    /// Get all nodes in submission order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Get the number of recorded nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get the derived dependency edges as (dependent, dependency) pairs.
    pub fn edges(&self) -> &[(NodeHandle, NodeHandle)] {
        &self.edges
    }

    /// Get the barriers derived from data hazards.
    pub fn barriers(&self) -> &[Barrier] {
        &self.barriers
    }

    /// Get dependencies of a node.
    pub fn dependencies(&self, handle: NodeHandle) -> impl Iterator<Item = NodeHandle> + '_ {
        self.edges
            .iter()
            .filter(move |&&(dependent, _)| dependent == handle)
            .map(|&(_, dependency)| dependency)
    }

    /// Compile the graph into an ordered command stream.
    ///
    /// Performs a stable topological sort (Kahn's algorithm seeded in
    /// submission order) so independent nodes keep their recorded order.
    pub fn compile(&self) -> Result<CompiledGraph, GraphError> {
        let n = self.nodes.len();
        let mut order = Vec::with_capacity(n);

        if n == 0 {
            return Ok(CompiledGraph {
                node_order: order,
                barriers: self.barriers.clone(),
            });
        }

        let mut in_degree = vec![0u32; n];
        for &(dependent, _dependency) in &self.edges {
            in_degree[dependent.index()] += 1;
        }

        // Seed in submission order; processing the queue front-to-back
        // keeps independent nodes stable.
        let mut queue: VecDeque<NodeHandle> = (0..n as u32)
            .map(NodeHandle::new)
            .filter(|&h| in_degree[h.index()] == 0)
            .collect();

        while let Some(handle) = queue.pop_front() {
            order.push(handle);

            for &(dependent, dependency) in &self.edges {
                if dependency == handle {
                    in_degree[dependent.index()] -= 1;
                    if in_degree[dependent.index()] == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if order.len() != n {
            return Err(GraphError::CyclicDependency);
        }

        Ok(CompiledGraph {
            node_order: order,
            barriers: self.barriers.clone(),
        })
    }

    /// Compile and hand the command stream to the backend, then clear the
    /// graph for the next segment.
    pub fn submit(
        &mut self,
        backend: &dyn crate::backend::GraphicsBackend,
    ) -> Result<Submission, GraphicsError> {
        let compiled = self
            .compile()
            .map_err(|e| GraphicsError::Internal(e.to_string()))?;

        let submission = Submission {
            commands: compiled
                .node_order
                .iter()
                .map(|&h| {
                    let node = &self.nodes[h.index()];
                    SubmittedCommand {
                        label: node.label.clone(),
                        pipeline_index: node.pipeline.index,
                        kind: node.kind.clone(),
                    }
                })
                .collect(),
            barrier_count: compiled.barriers.len(),
        };

        backend.execute(&submission)?;
        self.clear();
        Ok(submission)
    }

    /// Clear all nodes, edges and hazard state.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
        self.barriers.clear();
        self.states.clear();
    }
}

/// A compiled render graph ready for execution.
#[derive(Debug)]
pub struct CompiledGraph {
    /// Node execution order respecting all dependencies.
    node_order: Vec<NodeHandle>,
    /// Barriers to insert, in hazard-discovery order.
    barriers: Vec<Barrier>,
}

impl CompiledGraph {
    /// Get the node execution order as handles.
    pub fn node_order(&self) -> &[NodeHandle] {
        &self.node_order
    }

    pub fn node_count(&self) -> usize {
        self.node_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_order.is_empty()
    }

    pub fn barriers(&self) -> &[Barrier] {
        &self.barriers
    }
}

/// One command in a submitted stream.
#[derive(Debug, Clone)]
pub struct SubmittedCommand {
    pub label: String,
    /// Cache-insertion index of the bound pipeline.
    pub pipeline_index: u64,
    pub kind: NodeKind,
}

/// An ordered command stream handed to the backend.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub commands: Vec<SubmittedCommand>,
    pub barrier_count: usize,
}

#[cfg(test)]
#[cfg(feature = "headless")]
mod tests {
    use super::*;
    use crate::backend::{GpuPipeline, PipelineReflection};
    use crate::pso::resolve_buffer_binding_bases;

    fn test_pipeline(index: u64) -> Arc<PipelineStateInstance> {
        Arc::new(PipelineStateInstance {
            index,
            pipeline: GpuPipeline::Headless { id: index },
            bases: resolve_buffer_binding_bases(0, 0),
            attributes: Vec::new(),
            null_attribute_bindings: Vec::new(),
            reflection: PipelineReflection::default(),
        })
    }

    fn position(order: &[NodeHandle], handle: NodeHandle) -> usize {
        order.iter().position(|&h| h == handle).unwrap()
    }

    #[test]
    fn test_empty_graph_compiles_empty() {
        let graph = RenderGraph::new();
        let compiled = graph.compile().unwrap();
        assert!(compiled.is_empty());
    }

    #[test]
    fn test_read_after_write_serializes() {
        let mut graph = RenderGraph::new();
        let buffer = BufferHandle(1);
        let pso = test_pipeline(0);

        let producer = graph.add_dispatch(
            "produce",
            pso.clone(),
            [8, 1, 1],
            ResourceAccessSet::new().writes(buffer),
        );
        let consumer = graph.add_dispatch(
            "consume",
            pso,
            [8, 1, 1],
            ResourceAccessSet::new().reads(buffer),
        );

        assert_eq!(graph.dependencies(consumer).collect::<Vec<_>>(), vec![producer]);

        let compiled = graph.compile().unwrap();
        let order = compiled.node_order();
        assert!(position(order, producer) < position(order, consumer));
        assert_eq!(compiled.barriers().len(), 1);
        assert_eq!(compiled.barriers()[0].resource, ResourceId::Buffer(buffer));
    }

    #[test]
    fn test_readers_do_not_depend_on_each_other() {
        let mut graph = RenderGraph::new();
        let buffer = BufferHandle(1);
        let pso = test_pipeline(0);

        graph.add_dispatch(
            "produce",
            pso.clone(),
            [1, 1, 1],
            ResourceAccessSet::new().writes(buffer),
        );
        let r1 = graph.add_dispatch(
            "read1",
            pso.clone(),
            [1, 1, 1],
            ResourceAccessSet::new().reads(buffer),
        );
        let r2 = graph.add_dispatch(
            "read2",
            pso,
            [1, 1, 1],
            ResourceAccessSet::new().reads(buffer),
        );

        // Both readers depend only on the producer, never on each other.
        assert_eq!(graph.dependencies(r1).count(), 1);
        assert_eq!(graph.dependencies(r2).count(), 1);
        assert!(graph.dependencies(r2).all(|d| d != r1));
    }

    #[test]
    fn test_write_after_read_serializes_behind_all_readers() {
        let mut graph = RenderGraph::new();
        let texture = TextureHandle(7);
        let pso = test_pipeline(0);

        let w0 = graph.add_dispatch(
            "init",
            pso.clone(),
            [1, 1, 1],
            ResourceAccessSet::new().writes(texture),
        );
        let r1 = graph.add_draw(
            "sample1",
            pso.clone(),
            3,
            1,
            ResourceAccessSet::new().reads(texture),
        );
        let r2 = graph.add_draw(
            "sample2",
            pso.clone(),
            3,
            1,
            ResourceAccessSet::new().reads(texture),
        );
        let w1 = graph.add_dispatch(
            "overwrite",
            pso,
            [1, 1, 1],
            ResourceAccessSet::new().writes(texture),
        );

        let deps: Vec<_> = graph.dependencies(w1).collect();
        assert!(deps.contains(&w0));
        assert!(deps.contains(&r1));
        assert!(deps.contains(&r2));

        let compiled = graph.compile().unwrap();
        let order = compiled.node_order();
        assert!(position(order, r1) < position(order, w1));
        assert!(position(order, r2) < position(order, w1));
    }

    #[test]
    fn test_independent_nodes_keep_submission_order() {
        let mut graph = RenderGraph::new();
        let pso = test_pipeline(0);

        let handles: Vec<_> = (0..5)
            .map(|i| {
                graph.add_dispatch(
                    format!("independent{i}"),
                    pso.clone(),
                    [1, 1, 1],
                    ResourceAccessSet::new().writes(BufferHandle(100 + i)),
                )
            })
            .collect();

        let compiled = graph.compile().unwrap();
        assert_eq!(compiled.node_order(), handles.as_slice());
    }

    #[test]
    fn test_write_after_write_serializes() {
        let mut graph = RenderGraph::new();
        let buffer = BufferHandle(1);
        let pso = test_pipeline(0);

        let w0 = graph.add_dispatch(
            "first",
            pso.clone(),
            [1, 1, 1],
            ResourceAccessSet::new().writes(buffer),
        );
        let w1 = graph.add_dispatch(
            "second",
            pso,
            [1, 1, 1],
            ResourceAccessSet::new().writes(buffer),
        );

        assert_eq!(graph.dependencies(w1).collect::<Vec<_>>(), vec![w0]);
    }

    #[test]
    fn test_read_write_node_does_not_self_depend() {
        let mut graph = RenderGraph::new();
        let buffer = BufferHandle(1);
        let pso = test_pipeline(0);

        let node = graph.add_dispatch(
            "in_place",
            pso,
            [1, 1, 1],
            ResourceAccessSet::new().reads_writes(buffer),
        );
        assert_eq!(graph.dependencies(node).count(), 0);
        graph.compile().unwrap();
    }

    #[test]
    fn test_indirect_dispatch_reads_argument_buffer() {
        let mut graph = RenderGraph::new();
        let args = BufferHandle(1);
        let pso = test_pipeline(0);

        let producer = graph.add_dispatch(
            "write_args",
            pso.clone(),
            [1, 1, 1],
            ResourceAccessSet::new().writes(args),
        );
        let indirect =
            graph.add_dispatch_indirect("indirect", pso, args, 0, ResourceAccessSet::new());

        assert_eq!(
            graph.dependencies(indirect).collect::<Vec<_>>(),
            vec![producer]
        );
    }

    #[test]
    fn test_clear_resets_hazard_state() {
        let mut graph = RenderGraph::new();
        let buffer = BufferHandle(1);
        let pso = test_pipeline(0);

        graph.add_dispatch(
            "w",
            pso.clone(),
            [1, 1, 1],
            ResourceAccessSet::new().writes(buffer),
        );
        graph.clear();

        let reader = graph.add_dispatch(
            "r",
            pso,
            [1, 1, 1],
            ResourceAccessSet::new().reads(buffer),
        );
        assert_eq!(graph.dependencies(reader).count(), 0);
        assert_eq!(graph.node_count(), 1);
    }
}
