//! GPU backend abstraction layer.
//!
//! This module provides a trait-based abstraction for GPU backends,
//! allowing the graphics core to drive different native GPU APIs through
//! one uniform interface.
//!
//! # Available Backends
//!
//! - `headless` (default): CPU-only backend for testing and batch tooling
//! - `vulkan-backend`: Native Vulkan backend using ash
//!
//! # Architecture
//!
//! Each backend implements the [`GraphicsBackend`] trait, which provides:
//! - Adapter capability snapshots (features, limits, extensions)
//! - Shader stage compilation through the platform translator
//! - Render/compute pipeline creation with specialization constants
//! - Buffer allocation and command stream execution
//!
//! The set of implementations is closed and selected once at context
//! creation; all later calls go through a single `Arc<dyn GraphicsBackend>`.

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

#[cfg(feature = "headless")]
pub mod headless;

use std::sync::Arc;

#[cfg(feature = "vulkan-backend")]
use ash::vk;
#[cfg(feature = "vulkan-backend")]
use gpu_allocator::vulkan::Allocation;
#[cfg(feature = "vulkan-backend")]
use parking_lot::Mutex;

use crate::error::{CompileDiagnostic, GraphicsError};
use crate::graph::Submission;
use crate::pso::{
    BufferBindingBases, PipelineDescriptor, PrimitiveClass, ResolvedAttribute,
    SpecializationValues, VertexFormat,
};
use crate::shader::{ShaderStage, ShaderStageFlags};

/// Which concrete backend implementation is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// CPU-only backend, no GPU objects are created.
    Headless,
    /// Native Vulkan via ash.
    Vulkan,
}

/// Type of graphics adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterType {
    /// Discrete GPU (dedicated graphics card).
    Discrete,
    /// Integrated GPU (shared with CPU).
    Integrated,
    /// Software renderer.
    Software,
    /// Unknown adapter type.
    Unknown,
}

/// Host operating system class, used by workaround detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsType {
    Windows,
    MacOs,
    Unix,
}

/// Determine the host operating system class.
pub fn determine_os_type() -> OsType {
    if cfg!(target_os = "windows") {
        OsType::Windows
    } else if cfg!(target_os = "macos") {
        OsType::MacOs
    } else {
        OsType::Unix
    }
}

/// Information about a graphics adapter.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Adapter name as reported by the driver.
    pub name: String,
    /// PCI vendor identifier.
    pub vendor_id: u32,
    /// PCI device identifier.
    pub device_id: u32,
    /// Device type (discrete, integrated, etc.).
    pub device_type: AdapterType,
    /// Driver version string.
    pub driver_version: String,
    /// Host operating system class.
    pub os: OsType,
    /// Position in the native enumeration order.
    pub index: u32,
}

impl AdapterInfo {
    /// Stable identifier string (`vendor/device/index` in hex) used for
    /// reproducible adapter auto-selection across sessions.
    pub fn identifier(&self) -> String {
        format!("{:x}/{:x}/{}", self.vendor_id, self.device_id, self.index)
    }
}

/// Driver-reported resource limits of one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterLimits {
    pub max_texture_size: u32,
    pub max_texture_3d_size: u32,
    pub max_texture_layers: u32,
    pub max_textures_per_stage: u32,
    pub max_samplers: u32,
    pub max_images_per_stage: u32,
    pub max_work_group_count: [u32; 3],
    pub max_work_group_size: [u32; 3],
    /// Total invocations allowed in one workgroup.
    pub max_threads_per_workgroup: u32,
    pub max_uniform_buffers_per_stage: u32,
    pub max_storage_buffers_per_stage: u32,
    pub max_storage_buffer_size: u64,
    pub max_vertex_attributes: u32,
    pub max_color_attachments: u32,
    /// Minimum alignment the driver requires for uniform buffer offsets.
    pub min_uniform_buffer_alignment: u32,
}

impl Default for AdapterLimits {
    fn default() -> Self {
        Self {
            max_texture_size: 16384,
            max_texture_3d_size: 2048,
            max_texture_layers: 2048,
            max_textures_per_stage: 128,
            max_samplers: 4000,
            max_images_per_stage: 64,
            max_work_group_count: [65535; 3],
            max_work_group_size: [1024, 1024, 64],
            max_threads_per_workgroup: 1024,
            max_uniform_buffers_per_stage: 12,
            max_storage_buffers_per_stage: 16,
            max_storage_buffer_size: 1 << 30,
            max_vertex_attributes: 16,
            max_color_attachments: 8,
            min_uniform_buffer_alignment: 256,
        }
    }
}

/// Boolean feature set of one adapter, mirroring the required-feature table
/// in [`crate::capabilities`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterFeatures {
    pub geometry_shaders: bool,
    pub logic_ops: bool,
    pub dual_source_blending: bool,
    pub image_cube_arrays: bool,
    pub multi_draw_indirect: bool,
    pub multi_viewport: bool,
    pub shader_clip_distance: bool,
    pub draw_indirect_first_instance: bool,
    pub fragment_stores_and_atomics: bool,
    pub dynamic_rendering: bool,
    /// Shader may write `gl_Layer` outside geometry stages.
    pub shader_output_layer: bool,
    /// Shader may write `gl_ViewportIndex` outside geometry stages.
    pub shader_output_viewport_index: bool,
}

impl AdapterFeatures {
    /// Feature set with everything enabled, used by the headless backend.
    pub fn all_supported() -> Self {
        Self {
            geometry_shaders: true,
            logic_ops: true,
            dual_source_blending: true,
            image_cube_arrays: true,
            multi_draw_indirect: true,
            multi_viewport: true,
            shader_clip_distance: true,
            draw_indirect_first_instance: true,
            fragment_stores_and_atomics: true,
            dynamic_rendering: true,
            shader_output_layer: true,
            shader_output_viewport_index: true,
        }
    }
}

/// Extension names supported by one adapter.
#[derive(Debug, Clone, Default)]
pub struct AdapterExtensions {
    names: Vec<String>,
}

impl AdapterExtensions {
    /// Build from an iterator of extension names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the adapter advertises the given extension.
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// Complete probe result for one physical adapter.
#[derive(Debug, Clone)]
pub struct AdapterSnapshot {
    pub info: AdapterInfo,
    pub limits: AdapterLimits,
    pub features: AdapterFeatures,
    pub extensions: AdapterExtensions,
}

/// One entry in the context's ranked adapter registry.
#[derive(Debug, Clone)]
pub struct AdapterRegistryEntry {
    /// Stable `vendor/device/index` identifier.
    pub identifier: String,
    /// Position in the native enumeration order.
    pub index: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    /// Adapter name as reported by the driver.
    pub name: String,
}

/// Sort a registry for reproducible auto-selection: by name, then by
/// enumeration index for adapters with identical names.
pub fn sort_adapter_registry(entries: &mut [AdapterRegistryEntry]) {
    entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.index.cmp(&b.index)));
}

// ============================================================================
// Resource handles
// ============================================================================

/// Handle to a compiled GPU pipeline object.
pub enum GpuPipeline {
    /// Headless backend (no GPU object).
    #[cfg(feature = "headless")]
    Headless { id: u64 },
    /// Vulkan backend pipeline.
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
    },
}

impl std::fmt::Debug for GpuPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "headless")]
            Self::Headless { id } => f.debug_struct("GpuPipeline::Headless").field("id", id).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { pipeline, .. } => f
                .debug_struct("GpuPipeline::Vulkan")
                .field("pipeline", pipeline)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuPipeline {
    fn drop(&mut self) {
        if let GpuPipeline::Vulkan {
            device,
            pipeline,
            layout,
        } = self
        {
            unsafe {
                device.destroy_pipeline(*pipeline, None);
                device.destroy_pipeline_layout(*layout, None);
            }
        }
    }
}

/// Handle to one compiled shader stage library.
pub enum StageLibrary {
    /// Headless backend (keeps the entry point for debugging only).
    #[cfg(feature = "headless")]
    Headless { stage: ShaderStage, entry: String },
    /// Vulkan backend shader module.
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        module: vk::ShaderModule,
        stage: ShaderStage,
        entry: String,
    },
}

impl StageLibrary {
    /// The stage this library was compiled for.
    pub fn stage(&self) -> ShaderStage {
        match self {
            #[cfg(feature = "headless")]
            Self::Headless { stage, .. } => *stage,
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { stage, .. } => *stage,
        }
    }

    /// Entry point name.
    pub fn entry_point(&self) -> &str {
        match self {
            #[cfg(feature = "headless")]
            Self::Headless { entry, .. } => entry,
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { entry, .. } => entry,
        }
    }
}

impl std::fmt::Debug for StageLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "headless")]
            Self::Headless { stage, entry } => f
                .debug_struct("StageLibrary::Headless")
                .field("stage", stage)
                .field("entry", entry)
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { stage, entry, .. } => f
                .debug_struct("StageLibrary::Vulkan")
                .field("stage", stage)
                .field("entry", entry)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for StageLibrary {
    fn drop(&mut self) {
        if let StageLibrary::Vulkan { device, module, .. } = self {
            unsafe {
                device.destroy_shader_module(*module, None);
            }
        }
    }
}

/// Handle to a GPU buffer resource.
pub enum GpuBuffer {
    /// Headless backend (no GPU allocation).
    #[cfg(feature = "headless")]
    Headless { size: u64 },
    /// Vulkan backend buffer.
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        buffer: vk::Buffer,
        allocation: Mutex<Option<Allocation>>,
        size: u64,
    },
}

impl GpuBuffer {
    /// Size of the buffer in bytes.
    pub fn size(&self) -> u64 {
        match self {
            #[cfg(feature = "headless")]
            Self::Headless { size } => *size,
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { size, .. } => *size,
        }
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "headless")]
            Self::Headless { size } => f
                .debug_struct("GpuBuffer::Headless")
                .field("size", size)
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { buffer, size, .. } => f
                .debug_struct("GpuBuffer::Vulkan")
                .field("buffer", buffer)
                .field("size", size)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let GpuBuffer::Vulkan {
            device,
            buffer,
            allocation,
            ..
        } = self
        {
            // The allocation is returned to the allocator when the backend drops.
            let _ = allocation.lock().take();
            unsafe {
                device.destroy_buffer(*buffer, None);
            }
        }
    }
}

/// Intended use of an allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Uniform,
    Storage,
    Indirect,
}

// ============================================================================
// Pipeline creation requests and results
// ============================================================================

/// Uniform/storage block description handed to the backend so it can report
/// reflection data for each bound block.
#[derive(Debug, Clone, Copy)]
pub struct BlockBinding {
    /// Resolved buffer binding index.
    pub index: u32,
    /// Size of the block as declared by the shader interface.
    pub declared_size: u32,
    /// Stages that reference the block.
    pub stages: ShaderStageFlags,
}

/// Per-binding reflection data read back after a successful compile.
///
/// The sizes and alignments here are what the driver actually decided, which
/// may be larger than the declared sizes; binding calls compare against them
/// to reject under-sized buffers before they corrupt GPU memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBindingReflection {
    /// Buffer binding index.
    pub index: u32,
    /// Actual size in bytes required by the compiled pipeline.
    pub size: u64,
    /// Required offset alignment in bytes.
    pub alignment: u32,
    /// Whether the compiled pipeline actually references the binding.
    pub active: bool,
    /// Stages that reference the binding.
    pub stages: ShaderStageFlags,
}

/// Reflection data for a whole compiled pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineReflection {
    pub buffer_bindings: Vec<BufferBindingReflection>,
}

impl PipelineReflection {
    /// Look up reflection data for a buffer binding index.
    pub fn binding(&self, index: u32) -> Option<&BufferBindingReflection> {
        self.buffer_bindings.iter().find(|b| b.index == index)
    }
}

/// A compiled pipeline returned by the backend.
#[derive(Debug)]
pub struct CompiledPipeline {
    pub pipeline: GpuPipeline,
    pub reflection: PipelineReflection,
    /// Benign diagnostics produced alongside a successful compile.
    pub diagnostics: Option<CompileDiagnostic>,
}

/// Everything the backend needs to build one render pipeline variant.
pub struct RenderPipelineRequest<'a> {
    pub label: &'a str,
    pub vertex: &'a StageLibrary,
    pub fragment: Option<&'a StageLibrary>,
    pub primitive: PrimitiveClass,
    pub descriptor: &'a PipelineDescriptor,
    /// Attribute table after null-attribute redirection and dead-slot
    /// flagging.
    pub attributes: &'a [ResolvedAttribute],
    /// Merged specialization values (descriptor values plus synthesized
    /// attribute flags).
    pub specialization: &'a SpecializationValues,
    pub bases: BufferBindingBases,
    pub uniform_blocks: &'a [BlockBinding],
    pub storage_blocks: &'a [BlockBinding],
}

/// Everything the backend needs to build one compute pipeline variant.
pub struct ComputePipelineRequest<'a> {
    pub label: &'a str,
    pub compute: &'a StageLibrary,
    pub specialization: &'a SpecializationValues,
    /// Explicit widened threadgroup limit for the retry path.
    pub max_total_threads: Option<u32>,
    pub uniform_blocks: &'a [BlockBinding],
    pub storage_blocks: &'a [BlockBinding],
}

// ============================================================================
// Backend trait
// ============================================================================

/// GPU backend trait abstracting the native graphics APIs.
///
/// Implementations form a closed set selected once at context creation.
/// All methods must be callable from compiler worker threads; backends keep
/// their internal synchronization to the minimum required by the native API.
pub trait GraphicsBackend: Send + Sync + 'static {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Probe snapshot of the adapter this backend runs on.
    fn adapter(&self) -> &AdapterSnapshot;

    /// Enumerate every compatible adapter on the host for the registry.
    ///
    /// The default reports just the active adapter; backends with real
    /// enumeration override this.
    fn enumerate_adapters(&self) -> Vec<AdapterRegistryEntry> {
        let info = &self.adapter().info;
        vec![AdapterRegistryEntry {
            identifier: info.identifier(),
            index: info.index,
            vendor_id: info.vendor_id,
            device_id: info.device_id,
            name: info.name.clone(),
        }]
    }

    /// Live format query: can the given vertex format be fetched from a
    /// vertex buffer on this adapter?
    fn format_supports_vertex_fetch(&self, format: VertexFormat) -> bool;

    /// Compile one shader stage from source through the platform translator.
    fn compile_stage(
        &self,
        stage: ShaderStage,
        source: &str,
        entry_point: &str,
    ) -> Result<StageLibrary, CompileDiagnostic>;

    /// Create a render pipeline variant.
    fn create_render_pipeline(
        &self,
        request: &RenderPipelineRequest<'_>,
    ) -> Result<CompiledPipeline, CompileDiagnostic>;

    /// Create a compute pipeline variant.
    fn create_compute_pipeline(
        &self,
        request: &ComputePipelineRequest<'_>,
    ) -> Result<CompiledPipeline, CompileDiagnostic>;

    /// Allocate a GPU buffer.
    fn allocate_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        name: &str,
    ) -> Result<GpuBuffer, GraphicsError>;

    /// Execute a compiled command stream.
    fn execute(&self, submission: &Submission) -> Result<(), GraphicsError>;
}

/// Selects and creates the appropriate backend based on available features.
pub fn create_backend(kind: Option<BackendKind>) -> Result<Arc<dyn GraphicsBackend>, GraphicsError> {
    match kind {
        Some(BackendKind::Headless) => {
            #[cfg(feature = "headless")]
            {
                log::info!("Using headless backend");
                return Ok(Arc::new(headless::HeadlessBackend::new()));
            }
            #[cfg(not(feature = "headless"))]
            return Err(GraphicsError::InitializationFailed(
                "headless backend not compiled in".to_string(),
            ));
        }
        Some(BackendKind::Vulkan) => {
            #[cfg(feature = "vulkan-backend")]
            {
                let backend = vulkan::VulkanBackend::new()?;
                log::info!("Using Vulkan backend (ash)");
                return Ok(Arc::new(backend));
            }
            #[cfg(not(feature = "vulkan-backend"))]
            return Err(GraphicsError::InitializationFailed(
                "vulkan backend not compiled in".to_string(),
            ));
        }
        None => {}
    }

    // Auto-selection: try Vulkan first, fall back to headless.
    #[cfg(feature = "vulkan-backend")]
    {
        if vulkan::VulkanBackend::is_supported() {
            match vulkan::VulkanBackend::new() {
                Ok(backend) => {
                    log::info!("Using Vulkan backend (ash)");
                    return Ok(Arc::new(backend));
                }
                Err(e) => {
                    log::warn!("Failed to create Vulkan backend: {}", e);
                }
            }
        }
    }

    #[cfg(feature = "headless")]
    {
        log::info!("Using headless backend");
        return Ok(Arc::new(headless::HeadlessBackend::new()));
    }

    #[cfg(not(feature = "headless"))]
    Err(GraphicsError::InitializationFailed(
        "no backend available".to_string(),
    ))
}
