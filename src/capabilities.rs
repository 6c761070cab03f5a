//! Device capability detection and workaround derivation.
//!
//! Capability detection is a pure function from an adapter probe to a list
//! of missing required features/extensions plus a record of behavioral
//! workarounds. The resulting [`DeviceCapabilities`] snapshot is read-only
//! for the remainder of the session; it is rebuilt only on device
//! re-initialization.

use crate::backend::{AdapterExtensions, AdapterFeatures, AdapterInfo, AdapterSnapshot, OsType};

/// Device extensions every adapter must advertise to be usable.
pub const REQUIRED_EXTENSIONS: [&str; 4] = [
    "VK_KHR_swapchain",
    "VK_KHR_dedicated_allocation",
    "VK_KHR_get_memory_requirements2",
    "VK_KHR_dynamic_rendering",
];

/// Collect the human-readable names of required features and extensions the
/// adapter is missing. An empty result means the adapter meets the minimum
/// requirements.
pub fn missing_capabilities(
    features: &AdapterFeatures,
    extensions: &AdapterExtensions,
) -> Vec<&'static str> {
    let mut missing = Vec::new();

    // MoltenVK cannot expose these; they are emulated elsewhere on Apple.
    if !cfg!(target_os = "macos") {
        if !features.geometry_shaders {
            missing.push("geometry shaders");
        }
        if !features.logic_ops {
            missing.push("logical operations");
        }
    }
    if !features.dual_source_blending {
        missing.push("dual source blending");
    }
    if !features.image_cube_arrays {
        missing.push("image cube array");
    }
    if !features.multi_draw_indirect {
        missing.push("multi draw indirect");
    }
    if !features.multi_viewport {
        missing.push("multi viewport");
    }
    if !features.shader_clip_distance {
        missing.push("shader clip distance");
    }
    if !features.draw_indirect_first_instance {
        missing.push("draw indirect first instance");
    }
    if !features.fragment_stores_and_atomics {
        missing.push("fragment stores and atomics");
    }
    if !features.dynamic_rendering {
        missing.push("dynamic rendering");
    }

    for name in REQUIRED_EXTENSIONS {
        if !extensions.contains(name) {
            missing.push(name);
        }
    }

    missing
}

/// Format one report line for a disqualified adapter.
pub fn format_missing_report(adapter_name: &str, missing: &[&str]) -> String {
    format!(
        "Device [{}] does not meet minimum requirements. Missing features are [{}]",
        adapter_name,
        missing.join(", ")
    )
}

/// Read-only capability snapshot for the active device.
///
/// Built once by [`capabilities_init`]; consumers treat it as immutable for
/// the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub max_texture_size: u32,
    pub max_texture_3d_size: u32,
    pub max_texture_layers: u32,
    pub max_textures_per_stage: u32,
    pub max_samplers: u32,
    pub max_images_per_stage: u32,
    pub max_work_group_count: [u32; 3],
    pub max_work_group_size: [u32; 3],
    pub max_threads_per_workgroup: u32,
    pub max_uniform_buffers_per_stage: u32,
    pub max_storage_buffer_bindings: u32,
    pub max_storage_buffer_size: u64,
    pub max_vertex_attributes: u32,
    pub max_color_attachments: u32,
    pub min_uniform_buffer_alignment: u32,
    /// How many shader compilations may run concurrently, derived from the
    /// host CPU core count.
    pub max_parallel_compilations: usize,
}

/// Build the capability snapshot from an adapter probe.
pub fn capabilities_init(snapshot: &AdapterSnapshot) -> DeviceCapabilities {
    let limits = &snapshot.limits;
    DeviceCapabilities {
        max_texture_size: limits.max_texture_size,
        max_texture_3d_size: limits.max_texture_3d_size,
        max_texture_layers: limits.max_texture_layers,
        max_textures_per_stage: limits.max_textures_per_stage,
        max_samplers: limits.max_samplers,
        max_images_per_stage: limits.max_images_per_stage,
        max_work_group_count: limits.max_work_group_count,
        max_work_group_size: limits.max_work_group_size,
        max_threads_per_workgroup: limits.max_threads_per_workgroup,
        max_uniform_buffers_per_stage: limits.max_uniform_buffers_per_stage,
        max_storage_buffer_bindings: limits.max_storage_buffers_per_stage,
        max_storage_buffer_size: limits.max_storage_buffer_size,
        max_vertex_attributes: limits.max_vertex_attributes,
        max_color_attachments: limits.max_color_attachments,
        min_uniform_buffer_alignment: limits.min_uniform_buffer_alignment,
        max_parallel_compilations: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    }
}

/// Boolean workaround flags consumed by resource-creation code paths.
///
/// Each flag enables an alternate code path compensating for a specific
/// driver or hardware deficiency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Workarounds {
    /// Pixel formats aligned to 24 or 48 bits are unsupported and must be
    /// padded to the next power-of-two channel layout.
    pub not_aligned_pixel_formats: bool,
    /// `gl_Layer` cannot be written outside geometry stages; layered
    /// rendering must be emulated.
    pub shader_output_layer: bool,
    /// `gl_ViewportIndex` cannot be written outside geometry stages.
    pub shader_output_viewport_index: bool,
    /// Three-channel 8-bit vertex data cannot be fetched directly and must
    /// be widened to four channels on upload.
    pub vertex_format_r8g8b8: bool,
}

impl Workarounds {
    /// Maximally conservative flags: every workaround enabled.
    pub fn all_conservative() -> Self {
        Self {
            not_aligned_pixel_formats: true,
            shader_output_layer: true,
            shader_output_viewport_index: true,
            vertex_format_r8g8b8: true,
        }
    }
}

/// AMD PCI vendor id.
const VENDOR_ID_AMD: u32 = 0x1002;
/// Apple PCI vendor id.
const VENDOR_ID_APPLE: u32 = 0x106b;

/// Derive the workaround record for an adapter.
///
/// Vendor/OS pattern matches combine with live format-support queries
/// (`r8g8b8_vertex_fetch` comes from asking the backend whether the packed
/// three-channel format supports vertex-buffer usage). Passing
/// `force = true` short-circuits detection and enables every workaround,
/// which is how the workaround code paths are exercised in testing.
pub fn detect_workarounds(
    info: &AdapterInfo,
    features: &AdapterFeatures,
    r8g8b8_vertex_fetch: bool,
    force: bool,
) -> Workarounds {
    if force {
        log::info!(
            "Forcing workaround usage and disabling features. Vendor: {:#x} Device: [{}] Driver: {}",
            info.vendor_id,
            info.name,
            info.driver_version
        );
        return Workarounds::all_conservative();
    }

    let mut workarounds = Workarounds {
        shader_output_layer: !features.shader_output_layer,
        shader_output_viewport_index: !features.shader_output_viewport_index,
        ..Workarounds::default()
    };

    // AMD GPUs don't support texture formats that are aligned to 24 or 48 bits.
    // The same restriction applies to Apple GPUs on macOS.
    if info.vendor_id == VENDOR_ID_AMD
        || (info.vendor_id == VENDOR_ID_APPLE && info.os == OsType::MacOs)
    {
        workarounds.not_aligned_pixel_formats = true;
    }

    workarounds.vertex_format_r8g8b8 = !r8g8b8_vertex_fetch;

    workarounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{determine_os_type, AdapterType};

    fn test_adapter_info(vendor_id: u32, os: OsType) -> AdapterInfo {
        AdapterInfo {
            name: "Test GPU".to_string(),
            vendor_id,
            device_id: 0x1234,
            device_type: AdapterType::Discrete,
            driver_version: "535.0".to_string(),
            os,
            index: 0,
        }
    }

    #[test]
    fn test_full_feature_set_has_no_missing_capabilities() {
        let features = AdapterFeatures::all_supported();
        let extensions = AdapterExtensions::from_names(REQUIRED_EXTENSIONS);
        assert!(missing_capabilities(&features, &extensions).is_empty());
    }

    #[test]
    fn test_missing_features_are_named() {
        let mut features = AdapterFeatures::all_supported();
        features.dual_source_blending = false;
        features.dynamic_rendering = false;
        let extensions = AdapterExtensions::from_names(REQUIRED_EXTENSIONS);

        let missing = missing_capabilities(&features, &extensions);
        assert!(missing.contains(&"dual source blending"));
        assert!(missing.contains(&"dynamic rendering"));
        assert_eq!(missing.len(), 2);
    }

    #[test]
    fn test_missing_extensions_are_named() {
        let features = AdapterFeatures::all_supported();
        let extensions = AdapterExtensions::from_names(["VK_KHR_swapchain"]);

        let missing = missing_capabilities(&features, &extensions);
        assert!(missing.contains(&"VK_KHR_dynamic_rendering"));
        assert!(missing.contains(&"VK_KHR_dedicated_allocation"));
        assert!(!missing.contains(&"VK_KHR_swapchain"));
    }

    #[test]
    fn test_missing_report_lists_everything() {
        let report = format_missing_report("iGPU", &["multi viewport", "VK_KHR_swapchain"]);
        assert!(report.contains("iGPU"));
        assert!(report.contains("multi viewport, VK_KHR_swapchain"));
    }

    #[test]
    fn test_force_workarounds_is_maximally_conservative() {
        // Even a fully capable adapter gets every flag when forced.
        let info = test_adapter_info(0x10de, determine_os_type());
        let features = AdapterFeatures::all_supported();

        let w = detect_workarounds(&info, &features, true, true);
        assert_eq!(w, Workarounds::all_conservative());
        assert!(w.not_aligned_pixel_formats);
        assert!(w.shader_output_layer);
        assert!(w.shader_output_viewport_index);
        assert!(w.vertex_format_r8g8b8);
    }

    #[test]
    fn test_amd_gets_aligned_format_workaround() {
        let info = test_adapter_info(VENDOR_ID_AMD, OsType::Unix);
        let features = AdapterFeatures::all_supported();

        let w = detect_workarounds(&info, &features, true, false);
        assert!(w.not_aligned_pixel_formats);
        assert!(!w.vertex_format_r8g8b8);
    }

    #[test]
    fn test_apple_workaround_requires_macos() {
        let features = AdapterFeatures::all_supported();

        let on_mac = detect_workarounds(
            &test_adapter_info(VENDOR_ID_APPLE, OsType::MacOs),
            &features,
            true,
            false,
        );
        assert!(on_mac.not_aligned_pixel_formats);

        let elsewhere = detect_workarounds(
            &test_adapter_info(VENDOR_ID_APPLE, OsType::Unix),
            &features,
            true,
            false,
        );
        assert!(!elsewhere.not_aligned_pixel_formats);
    }

    #[test]
    fn test_format_query_feeds_vertex_workaround() {
        let info = test_adapter_info(0x10de, OsType::Unix);
        let features = AdapterFeatures::all_supported();

        let w = detect_workarounds(&info, &features, false, false);
        assert!(w.vertex_format_r8g8b8);
    }

    #[test]
    fn test_output_layer_workarounds_track_features() {
        let info = test_adapter_info(0x10de, OsType::Unix);
        let mut features = AdapterFeatures::all_supported();
        features.shader_output_layer = false;

        let w = detect_workarounds(&info, &features, true, false);
        assert!(w.shader_output_layer);
        assert!(!w.shader_output_viewport_index);
    }

    #[test]
    fn test_capabilities_snapshot_copies_limits() {
        let snapshot = AdapterSnapshot {
            info: test_adapter_info(0x10de, determine_os_type()),
            limits: Default::default(),
            features: AdapterFeatures::all_supported(),
            extensions: AdapterExtensions::from_names(REQUIRED_EXTENSIONS),
        };

        let caps = capabilities_init(&snapshot);
        assert_eq!(caps.max_texture_size, snapshot.limits.max_texture_size);
        assert_eq!(
            caps.max_threads_per_workgroup,
            snapshot.limits.max_threads_per_workgroup
        );
        assert!(caps.max_parallel_compilations >= 1);
    }
}
