//! Render graph node types and resource-access declarations.

use std::sync::Arc;

use crate::pso::PipelineStateInstance;

/// Handle to a tracked GPU buffer, allocated by the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a tracked GPU texture, allocated by the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Identity of a resource for hazard tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

impl From<BufferHandle> for ResourceId {
    fn from(handle: BufferHandle) -> Self {
        Self::Buffer(handle)
    }
}

impl From<TextureHandle> for ResourceId {
    fn from(handle: TextureHandle) -> Self {
        Self::Texture(handle)
    }
}

/// How a node accesses one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// One declared resource access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceAccess {
    pub resource: ResourceId,
    pub access: AccessMode,
}

/// The resource-access set of one node.
#[derive(Debug, Clone, Default)]
pub struct ResourceAccessSet {
    accesses: Vec<ResourceAccess>,
}

impl ResourceAccessSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a read of a resource (builder style).
    pub fn reads(mut self, resource: impl Into<ResourceId>) -> Self {
        self.add(resource.into(), AccessMode::Read);
        self
    }

    /// Declare a write of a resource (builder style).
    pub fn writes(mut self, resource: impl Into<ResourceId>) -> Self {
        self.add(resource.into(), AccessMode::Write);
        self
    }

    /// Declare a read-write access (builder style).
    pub fn reads_writes(mut self, resource: impl Into<ResourceId>) -> Self {
        self.add(resource.into(), AccessMode::ReadWrite);
        self
    }

    /// Declare one access, merging with an existing entry for the same
    /// resource (read + write collapses to read-write).
    pub fn add(&mut self, resource: ResourceId, access: AccessMode) {
        if let Some(existing) = self.accesses.iter_mut().find(|a| a.resource == resource) {
            if existing.access != access {
                existing.access = AccessMode::ReadWrite;
            }
            return;
        }
        self.accesses.push(ResourceAccess { resource, access });
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceAccess> {
        self.accesses.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.accesses.len()
    }
}

/// Parameters of one recorded unit of GPU work.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Rasterizing draw.
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    /// Compute dispatch with explicit group counts.
    Dispatch { groups: [u32; 3] },
    /// Compute dispatch with group counts sourced from a GPU buffer.
    DispatchIndirect { buffer: BufferHandle, offset: u64 },
}

/// One recorded render-graph node.
#[derive(Debug, Clone)]
pub struct Node {
    /// Debug label.
    pub label: String,
    /// Pipeline to bind for this node.
    pub pipeline: Arc<PipelineStateInstance>,
    pub kind: NodeKind,
    pub accesses: ResourceAccessSet,
}

impl Node {
    pub fn new(
        label: impl Into<String>,
        pipeline: Arc<PipelineStateInstance>,
        kind: NodeKind,
        accesses: ResourceAccessSet,
    ) -> Self {
        Self {
            label: label.into(),
            pipeline,
            kind,
            accesses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode_predicates() {
        assert!(AccessMode::Read.is_read());
        assert!(!AccessMode::Read.is_write());
        assert!(AccessMode::Write.is_write());
        assert!(!AccessMode::Write.is_read());
        assert!(AccessMode::ReadWrite.is_read());
        assert!(AccessMode::ReadWrite.is_write());
    }

    #[test]
    fn test_access_set_merges_same_resource() {
        let buffer = BufferHandle(1);
        let set = ResourceAccessSet::new().reads(buffer).writes(buffer);
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().access, AccessMode::ReadWrite);
    }

    #[test]
    fn test_access_set_distinct_resources() {
        let set = ResourceAccessSet::new()
            .reads(BufferHandle(1))
            .writes(TextureHandle(2));
        assert_eq!(set.len(), 2);
    }
}
