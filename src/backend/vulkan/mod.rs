//! Vulkan backend (native, via ash).
//!
//! The backend owns the instance, the chosen physical adapter and the
//! logical device. Adapter probing is split out so support checks run on a
//! throwaway instance without touching process state:
//!
//! - [`VulkanBackend::is_supported`] probes every adapter against the
//!   required-capability table and reports the missing pieces per adapter.
//! - Adapter selection is deterministic: compatible adapters are ranked by
//!   name, then enumeration index.

mod device;
mod instance;
mod pipeline;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;

use crate::backend::{
    AdapterRegistryEntry, AdapterSnapshot, BackendKind, BufferUsage, CompiledPipeline,
    ComputePipelineRequest, GpuBuffer, GraphicsBackend, RenderPipelineRequest, StageLibrary,
};
use crate::capabilities::{format_missing_report, missing_capabilities};
use crate::error::{CompileDiagnostic, GraphicsError};
use crate::graph::Submission;
use crate::pso::VertexFormat;
use crate::shader::ShaderStage;

use device::{create_logical_device, find_graphics_queue_family, query_adapter_snapshot};
use pipeline::convert_vertex_format;

/// Vulkan-based GPU backend using ash.
pub struct VulkanBackend {
    /// Vulkan entry points; must outlive the instance.
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    #[allow(dead_code)]
    graphics_queue: vk::Queue,
    #[allow(dead_code)]
    graphics_queue_family: u32,
    /// Taken (and thereby dropped) before the device in [`Drop`].
    allocator: Mutex<Option<Allocator>>,
    snapshot: AdapterSnapshot,
}

impl VulkanBackend {
    /// Probe the host for a compatible adapter without creating a device.
    ///
    /// Creates a throwaway instance, enumerates the physical adapters and
    /// returns `true` as soon as one satisfies the minimum feature and
    /// extension set. Every disqualified adapter gets one warning line
    /// listing exactly what it is missing. Never panics; degraded hosts
    /// report `false`.
    pub fn is_supported() -> bool {
        let entry = match unsafe { ash::Entry::load() } {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Vulkan loader not available: {e}");
                return false;
            }
        };
        let instance = match instance::create_instance(&entry) {
            Ok(instance) => instance,
            Err(e) => {
                log::error!("Unable to initialize a Vulkan 1.2 instance: {e}");
                return false;
            }
        };

        let devices = unsafe { instance.enumerate_physical_devices() }.unwrap_or_default();
        let mut supported = false;
        for (index, physical_device) in devices.iter().enumerate() {
            let snapshot = query_adapter_snapshot(&instance, *physical_device, index as u32);
            let missing = missing_capabilities(&snapshot.features, &snapshot.extensions);
            if missing.is_empty() {
                log::info!(
                    "Device [{}] supports minimum requirements. Skip checking other GPUs. \
                     Another GPU can still be selected during auto-detection.",
                    snapshot.info.name
                );
                supported = true;
                break;
            }
            log::warn!("{}", format_missing_report(&snapshot.info.name, &missing));
        }

        if !supported {
            log::error!(
                "No Vulkan device found that meets the minimum requirements. \
                 Updating GPU driver can improve compatibility."
            );
        }
        unsafe { instance.destroy_instance(None) };
        supported
    }

    /// Create the backend on the best compatible adapter.
    pub fn new() -> Result<Self, GraphicsError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Vulkan loader not available: {e}"))
        })?;
        let instance = instance::create_instance(&entry)?;

        match Self::init_device(entry.clone(), instance.clone()) {
            Ok(backend) => Ok(backend),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    fn init_device(entry: ash::Entry, instance: ash::Instance) -> Result<Self, GraphicsError> {
        let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
            GraphicsError::InitializationFailed(format!(
                "Failed to enumerate physical devices: {e:?}"
            ))
        })?;

        // Rank compatible adapters deterministically: by name, then by
        // enumeration index, so auto-selection is reproducible.
        let mut compatible = Vec::new();
        let mut reports = Vec::new();
        for (index, physical_device) in devices.iter().enumerate() {
            let snapshot = query_adapter_snapshot(&instance, *physical_device, index as u32);
            let missing = missing_capabilities(&snapshot.features, &snapshot.extensions);
            if missing.is_empty() {
                compatible.push((*physical_device, snapshot));
            } else {
                let report = format_missing_report(&snapshot.info.name, &missing);
                log::warn!("{report}");
                reports.push(report);
            }
        }
        compatible.sort_by(|(_, a), (_, b)| {
            a.info
                .name
                .cmp(&b.info.name)
                .then(a.info.index.cmp(&b.info.index))
        });

        let Some((physical_device, snapshot)) = compatible.into_iter().next() else {
            return Err(GraphicsError::NoCompatibleAdapter(reports));
        };
        log::info!("Selected adapter [{}]", snapshot.info.name);

        let graphics_queue_family = find_graphics_queue_family(&instance, physical_device)?;
        let device = create_logical_device(&instance, physical_device, graphics_queue_family)?;
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| {
            unsafe { device.destroy_device(None) };
            GraphicsError::InitializationFailed(format!("Failed to create memory allocator: {e}"))
        })?;

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            graphics_queue,
            graphics_queue_family,
            allocator: Mutex::new(Some(allocator)),
            snapshot,
        })
    }
}

impl GraphicsBackend for VulkanBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn adapter(&self) -> &AdapterSnapshot {
        &self.snapshot
    }

    fn enumerate_adapters(&self) -> Vec<AdapterRegistryEntry> {
        let devices = unsafe { self.instance.enumerate_physical_devices() }.unwrap_or_default();
        let mut entries = Vec::new();
        for (index, physical_device) in devices.iter().enumerate() {
            let snapshot = query_adapter_snapshot(&self.instance, *physical_device, index as u32);
            if missing_capabilities(&snapshot.features, &snapshot.extensions).is_empty() {
                entries.push(AdapterRegistryEntry {
                    identifier: snapshot.info.identifier(),
                    index: index as u32,
                    vendor_id: snapshot.info.vendor_id,
                    device_id: snapshot.info.device_id,
                    name: snapshot.info.name,
                });
            }
        }
        entries
    }

    fn format_supports_vertex_fetch(&self, format: VertexFormat) -> bool {
        let properties = unsafe {
            self.instance.get_physical_device_format_properties(
                self.physical_device,
                convert_vertex_format(format),
            )
        };
        properties
            .buffer_features
            .contains(vk::FormatFeatureFlags::VERTEX_BUFFER)
    }

    fn compile_stage(
        &self,
        stage: ShaderStage,
        source: &str,
        entry_point: &str,
    ) -> Result<StageLibrary, CompileDiagnostic> {
        let module = pipeline::compile_stage(&self.device, stage, source, entry_point)?;
        Ok(StageLibrary::Vulkan {
            device: self.device.clone(),
            module,
            stage,
            entry: entry_point.to_string(),
        })
    }

    fn create_render_pipeline(
        &self,
        request: &RenderPipelineRequest<'_>,
    ) -> Result<CompiledPipeline, CompileDiagnostic> {
        pipeline::create_render_pipeline(
            &self.device,
            request,
            self.snapshot.limits.min_uniform_buffer_alignment,
        )
    }

    fn create_compute_pipeline(
        &self,
        request: &ComputePipelineRequest<'_>,
    ) -> Result<CompiledPipeline, CompileDiagnostic> {
        pipeline::create_compute_pipeline(
            &self.device,
            request,
            self.snapshot.limits.min_uniform_buffer_alignment,
        )
    }

    fn allocate_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        name: &str,
    ) -> Result<GpuBuffer, GraphicsError> {
        if size == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "buffer '{name}' cannot have zero size"
            )));
        }

        let vk_usage = match usage {
            BufferUsage::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Uniform => {
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Indirect => {
                vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
        };

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!("Failed to create buffer: {e:?}"))
        })?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation: Allocation = {
            let mut guard = self.allocator.lock();
            let allocator = guard
                .as_mut()
                .ok_or_else(|| GraphicsError::Internal("allocator already torn down".into()))?;
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location: gpu_allocator::MemoryLocation::CpuToGpu,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| {
                    unsafe { self.device.destroy_buffer(buffer, None) };
                    GraphicsError::ResourceCreationFailed(format!(
                        "Failed to allocate buffer memory: {e}"
                    ))
                })?
        };

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!("Failed to bind buffer memory: {e:?}"))
        })?;

        Ok(GpuBuffer::Vulkan {
            device: self.device.clone(),
            buffer,
            allocation: Mutex::new(Some(allocation)),
            size,
        })
    }

    fn execute(&self, submission: &Submission) -> Result<(), GraphicsError> {
        // Command encoding happens in the frame recorder above this layer;
        // the backend consumes the ordered stream.
        log::trace!(
            "Vulkan execute: {} commands, {} barriers",
            submission.commands.len(),
            submission.barrier_count
        );
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            // The allocator must be dropped while the device is alive.
            let _ = self.allocator.lock().take();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

static_assertions::assert_impl_all!(VulkanBackend: Send, Sync);
