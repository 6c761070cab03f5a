//! Pipeline state descriptors and cache.
//!
//! A [`PipelineDescriptor`] is the immutable structural key describing one
//! pipeline variant: vertex layout, attachment formats, blend state,
//! primitive class and specialization constants. The per-shader
//! [`PsoCache`](cache::PsoCache) maps descriptors to compiled
//! [`PipelineStateInstance`](cache::PipelineStateInstance)s and guarantees
//! at most one compile per unique descriptor on any single thread.
//!
//! Descriptors are canonicalized on [`PipelineDescriptor::finalize`] so that
//! construction order cannot affect hashing, but fields that are unused for
//! a given primitive type are *not* normalized away: two descriptors
//! differing only in an unused attachment slot are distinct cache keys.

pub mod cache;

pub use cache::{NullAttributeBinding, PipelineStateInstance, PsoCache};

use bitflags::bitflags;

/// Fixed maximum number of color attachments in a pipeline descriptor.
pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// Specialization constant id space reserved for synthesized per-attribute
/// enable flags. Attribute at location `L` gets constant `ATTR_FLAG_BASE + L`.
pub const ATTR_FLAG_BASE: u32 = 1000;

/// Format of one vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    F32,
    F32x2,
    F32x3,
    F32x4,
    I32,
    I32x2,
    I32x3,
    I32x4,
    U32,
    U32x2,
    U32x3,
    U32x4,
    Unorm8x4,
    Snorm8x4,
    /// Packed three-channel 8-bit format; gated by the
    /// `vertex_format_r8g8b8` workaround on some drivers.
    Unorm8x3,
}

impl VertexFormat {
    /// Size of one element in bytes.
    pub fn byte_size(self) -> u32 {
        match self {
            Self::F32 | Self::I32 | Self::U32 | Self::Unorm8x4 | Self::Snorm8x4 => 4,
            Self::Unorm8x3 => 3,
            Self::F32x2 | Self::I32x2 | Self::U32x2 => 8,
            Self::F32x3 | Self::I32x3 | Self::U32x3 => 12,
            Self::F32x4 | Self::I32x4 | Self::U32x4 => 16,
        }
    }
}

/// Pixel format of an attachment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Attachment slot not in use.
    #[default]
    Unknown,
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    Rg11B10Float,
    Rgb10A2Unorm,
    Depth32Float,
    Depth24PlusStencil8,
    Stencil8,
}

impl TextureFormat {
    /// Whether this is a depth-capable format.
    pub fn has_depth(self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24PlusStencil8)
    }

    /// Whether this is a stencil-capable format.
    pub fn has_stencil(self) -> bool {
        matches!(self, Self::Depth24PlusStencil8 | Self::Stencil8)
    }
}

/// How a vertex buffer advances between fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepFunction {
    PerVertex,
    PerInstance,
    /// Never advances; used for the shared null-attribute buffer.
    Constant,
}

/// Primitive topology class of a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveClass {
    Point,
    Line,
    Triangle,
}

bitflags! {
    /// Per-channel color write mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWriteMask: u8 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const ALL = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits() | Self::ALPHA.bits();
    }
}

/// Blend factor for one channel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
}

/// Blend operation for one channel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Fixed-function blend state shared by all color attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub enabled: bool,
    pub color_src: BlendFactor,
    pub color_dst: BlendFactor,
    pub color_op: BlendOp,
    pub alpha_src: BlendFactor,
    pub alpha_dst: BlendFactor,
    pub alpha_op: BlendOp,
    pub write_mask: ColorWriteMask,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            enabled: false,
            color_src: BlendFactor::One,
            color_dst: BlendFactor::Zero,
            color_op: BlendOp::Add,
            alpha_src: BlendFactor::One,
            alpha_dst: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
            write_mask: ColorWriteMask::ALL,
        }
    }
}

/// Value of one specialization constant.
///
/// Floats are deliberately absent: constants participate in cache keys and
/// must hash and compare exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecValue {
    Bool(bool),
    I32(i32),
    U32(u32),
}

impl SpecValue {
    /// Raw 32-bit payload handed to the native specialization entry.
    pub fn to_bits(self) -> u32 {
        match self {
            Self::Bool(v) => v as u32,
            Self::I32(v) => v as u32,
            Self::U32(v) => v,
        }
    }
}

/// A canonical set of specialization constant values.
///
/// Entries are kept sorted by constant id at insertion so equal sets hash
/// and compare equal regardless of the order values were set in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SpecializationValues {
    values: Vec<(u32, SpecValue)>,
}

impl SpecializationValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one constant, replacing any previous value for the same id.
    pub fn set(&mut self, id: u32, value: SpecValue) -> &mut Self {
        match self.values.binary_search_by_key(&id, |(i, _)| *i) {
            Ok(pos) => self.values[pos].1 = value,
            Err(pos) => self.values.insert(pos, (id, value)),
        }
        self
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, id: u32, value: SpecValue) -> Self {
        self.set(id, value);
        self
    }

    /// Get the value for a constant id.
    pub fn get(&self, id: u32) -> Option<SpecValue> {
        self.values
            .binary_search_by_key(&id, |(i, _)| *i)
            .ok()
            .map(|pos| self.values[pos].1)
    }

    /// Iterate entries in canonical (id-ascending) order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, SpecValue)> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merge `other` into a copy of `self`; `other` wins on id collisions.
    pub fn merged_with(&self, other: &SpecializationValues) -> SpecializationValues {
        let mut out = self.clone();
        for (id, value) in other.iter() {
            out.set(id, value);
        }
        out
    }
}

/// One vertex attribute in the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Shader input location.
    pub location: u32,
    pub format: VertexFormat,
    /// Byte offset within the bound buffer's element.
    pub offset: u32,
    /// Index of the vertex buffer binding this attribute reads from.
    pub buffer_index: u32,
}

/// One vertex buffer binding in the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub stride: u32,
    pub step: StepFunction,
}

/// Immutable structural key describing one pipeline variant.
///
/// Build with the `with_*` methods, then call [`finalize`](Self::finalize)
/// before handing the descriptor to the cache. Finalization canonicalizes
/// internal ordering; it never drops or rewrites fields, so unused state
/// still distinguishes descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PipelineDescriptor {
    attributes: Vec<VertexAttribute>,
    buffers: Vec<VertexBufferLayout>,
    color_formats: [TextureFormat; MAX_COLOR_ATTACHMENTS],
    depth_format: TextureFormat,
    stencil_format: TextureFormat,
    blend: BlendState,
    specialization: SpecializationValues,
    finalized: bool,
}

impl PipelineDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex buffer binding; returns its binding index.
    pub fn add_vertex_buffer(&mut self, stride: u32, step: StepFunction) -> u32 {
        let index = self.buffers.len() as u32;
        self.buffers.push(VertexBufferLayout { stride, step });
        index
    }

    /// Add a vertex attribute reading from a previously added buffer.
    pub fn add_attribute(&mut self, attribute: VertexAttribute) {
        debug_assert!(
            (attribute.buffer_index as usize) < self.buffers.len(),
            "attribute references vertex buffer {} which has not been added",
            attribute.buffer_index
        );
        self.attributes.push(attribute);
        self.finalized = false;
    }

    /// Set the pixel format of one color attachment slot.
    pub fn set_color_format(&mut self, slot: usize, format: TextureFormat) {
        debug_assert!(slot < MAX_COLOR_ATTACHMENTS, "color attachment slot {slot} out of range");
        self.color_formats[slot] = format;
    }

    pub fn set_depth_format(&mut self, format: TextureFormat) {
        self.depth_format = format;
    }

    pub fn set_stencil_format(&mut self, format: TextureFormat) {
        self.stencil_format = format;
    }

    pub fn set_blend(&mut self, blend: BlendState) {
        self.blend = blend;
    }

    /// Set one specialization constant value.
    pub fn set_specialization(&mut self, id: u32, value: SpecValue) {
        self.specialization.set(id, value);
    }

    /// Canonicalize internal ordering so bit-identical descriptors hash and
    /// compare equal regardless of construction order.
    pub fn finalize(&mut self) {
        self.attributes.sort_by_key(|a| a.location);
        // Specialization values are kept sorted at insertion.
        self.finalized = true;
    }

    /// Finalized builder-style variant.
    pub fn finalized(mut self) -> Self {
        self.finalize();
        self
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.attributes
    }

    pub fn vertex_buffers(&self) -> &[VertexBufferLayout] {
        &self.buffers
    }

    pub fn vertex_buffer_count(&self) -> u32 {
        self.buffers.len() as u32
    }

    pub fn color_formats(&self) -> &[TextureFormat; MAX_COLOR_ATTACHMENTS] {
        &self.color_formats
    }

    /// Number of leading color attachment slots that are in use.
    pub fn color_attachment_count(&self) -> u32 {
        self.color_formats
            .iter()
            .take_while(|f| **f != TextureFormat::Unknown)
            .count() as u32
    }

    pub fn depth_format(&self) -> TextureFormat {
        self.depth_format
    }

    pub fn stencil_format(&self) -> TextureFormat {
        self.stencil_format
    }

    pub fn blend(&self) -> &BlendState {
        &self.blend
    }

    pub fn specialization(&self) -> &SpecializationValues {
        &self.specialization
    }

    /// Find the attribute bound at a shader location, if any.
    pub fn attribute_at(&self, location: u32) -> Option<&VertexAttribute> {
        self.attributes.iter().find(|a| a.location == location)
    }
}

/// Resolved buffer-binding base indices for one pipeline.
///
/// Vertex buffers occupy bindings `0..vertex_buffer_count`; the slot right
/// after them holds the shared null-attribute buffer. Uniform and storage
/// blocks are packed above that, keeping binding numbers stable and
/// collision-free as the vertex buffer count varies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBindingBases {
    pub vertex_buffer_count: u32,
    /// Binding of the shared constant-stride null buffer.
    pub null_buffer_index: u32,
    /// First binding index for uniform blocks.
    pub uniform_base: u32,
    /// First binding index for storage blocks.
    pub storage_base: u32,
}

/// Compute binding bases for a pipeline with `vertex_buffer_count` vertex
/// buffers and `active_uniform_blocks` uniform blocks.
pub fn resolve_buffer_binding_bases(
    vertex_buffer_count: u32,
    active_uniform_blocks: u32,
) -> BufferBindingBases {
    let uniform_base = vertex_buffer_count + 1;
    let storage_base = if active_uniform_blocks > 0 {
        uniform_base + 1 + active_uniform_blocks
    } else {
        uniform_base + 1
    };
    BufferBindingBases {
        vertex_buffer_count,
        null_buffer_index: vertex_buffer_count,
        uniform_base,
        storage_base,
    }
}

/// One attribute after null-redirection and dead-slot flagging, as handed to
/// the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
    pub buffer_index: u32,
    /// False for descriptor slots the shader never reads; the matching
    /// specialization flag lets the shader skip dead conversions.
    pub enabled: bool,
}
