//! Thin tracked resource objects handed out by the context factory methods.
//!
//! The full resource type hierarchy lives outside this core; these objects
//! carry just enough identity for render-graph access declarations and
//! lifetime bookkeeping. Callers own the returned objects and release them
//! by dropping or by handing them to the context's discard lists.

use crate::graph::{BufferHandle, TextureHandle};
use crate::pso::{PrimitiveClass, TextureFormat};

/// A tracked GPU buffer.
#[derive(Debug)]
pub struct Buffer {
    pub(crate) handle: BufferHandle,
    name: String,
    size: u64,
}

impl Buffer {
    pub(crate) fn new(handle: BufferHandle, name: String, size: u64) -> Self {
        Self { handle, name, size }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A tracked GPU texture.
#[derive(Debug)]
pub struct Texture {
    pub(crate) handle: TextureHandle,
    name: String,
    width: u32,
    height: u32,
    format: TextureFormat,
}

impl Texture {
    pub(crate) fn new(
        handle: TextureHandle,
        name: String,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Self {
        Self {
            handle,
            name,
            width,
            height,
            format,
        }
    }

    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }
}

/// A framebuffer: a named set of attachment textures.
#[derive(Debug)]
pub struct FrameBuffer {
    name: String,
    colors: Vec<TextureHandle>,
    depth: Option<TextureHandle>,
}

impl FrameBuffer {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            colors: Vec::new(),
            depth: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a color texture to the next free slot.
    pub fn attach_color(&mut self, texture: &Texture) {
        self.colors.push(texture.handle());
    }

    /// Attach the depth texture.
    pub fn attach_depth(&mut self, texture: &Texture) {
        self.depth = Some(texture.handle());
    }

    pub fn color_attachments(&self) -> &[TextureHandle] {
        &self.colors
    }

    pub fn depth_attachment(&self) -> Option<TextureHandle> {
        self.depth
    }
}

/// A draw batch: vertex data plus a primitive class, ready to be recorded
/// against a baked pipeline.
#[derive(Debug)]
pub struct Batch {
    name: String,
    primitive: PrimitiveClass,
    vertex_buffers: Vec<BufferHandle>,
    vertex_count: u32,
}

impl Batch {
    pub(crate) fn new(name: String, primitive: PrimitiveClass) -> Self {
        Self {
            name,
            primitive,
            vertex_buffers: Vec::new(),
            vertex_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primitive(&self) -> PrimitiveClass {
        self.primitive
    }

    /// Bind one more vertex buffer; returns its binding index.
    pub fn add_vertex_buffer(&mut self, buffer: &Buffer) -> u32 {
        let index = self.vertex_buffers.len() as u32;
        self.vertex_buffers.push(buffer.handle());
        index
    }

    pub fn set_vertex_count(&mut self, count: u32) {
        self.vertex_count = count;
    }

    pub fn vertex_buffers(&self) -> &[BufferHandle] {
        &self.vertex_buffers
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framebuffer_attachments() {
        let mut fb = FrameBuffer::new("main".into());
        let color = Texture::new(TextureHandle(1), "color".into(), 64, 64, TextureFormat::Rgba8Unorm);
        let depth = Texture::new(
            TextureHandle(2),
            "depth".into(),
            64,
            64,
            TextureFormat::Depth32Float,
        );

        fb.attach_color(&color);
        fb.attach_depth(&depth);

        assert_eq!(fb.color_attachments().len(), 1);
        assert_eq!(fb.depth_attachment(), Some(TextureHandle(2)));
    }

    #[test]
    fn test_batch_vertex_buffer_indices() {
        let mut batch = Batch::new("quad".into(), PrimitiveClass::Triangle);
        let positions = Buffer::new(BufferHandle(1), "positions".into(), 256);
        let uvs = Buffer::new(BufferHandle(2), "uvs".into(), 128);

        assert_eq!(batch.add_vertex_buffer(&positions), 0);
        assert_eq!(batch.add_vertex_buffer(&uvs), 1);
        assert_eq!(batch.vertex_buffers().len(), 2);
    }
}
