//! Vulkan physical and logical device management.

use std::ffi::CStr;

use ash::vk;

use crate::backend::{
    AdapterExtensions, AdapterFeatures, AdapterInfo, AdapterLimits, AdapterSnapshot, AdapterType,
    determine_os_type,
};
use crate::error::GraphicsError;

/// Probe one physical device into a backend-neutral snapshot.
pub fn query_adapter_snapshot(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    index: u32,
) -> AdapterSnapshot {
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };

    // Chain the feature structs the capability table needs.
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut dynamic_rendering = vk::PhysicalDeviceDynamicRenderingFeatures::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_12)
        .push_next(&mut dynamic_rendering);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
    let features = features2.features;

    let extension_properties =
        unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .unwrap_or_default();
    let extensions = AdapterExtensions::from_names(extension_properties.iter().map(|ext| {
        unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }));

    let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    let device_type = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => AdapterType::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterType::Integrated,
        vk::PhysicalDeviceType::CPU => AdapterType::Software,
        _ => AdapterType::Unknown,
    };

    let driver_version = format!(
        "{}.{}.{}",
        vk::api_version_major(properties.driver_version),
        vk::api_version_minor(properties.driver_version),
        vk::api_version_patch(properties.driver_version)
    );

    let limits = &properties.limits;
    AdapterSnapshot {
        info: AdapterInfo {
            name: device_name,
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            device_type,
            driver_version,
            os: determine_os_type(),
            index,
        },
        limits: AdapterLimits {
            max_texture_size: limits.max_image_dimension1_d.max(limits.max_image_dimension2_d),
            max_texture_3d_size: limits.max_image_dimension3_d,
            max_texture_layers: limits.max_image_array_layers,
            max_textures_per_stage: limits.max_per_stage_descriptor_sampled_images,
            max_samplers: limits.max_sampler_allocation_count,
            max_images_per_stage: limits.max_per_stage_descriptor_storage_images,
            max_work_group_count: limits.max_compute_work_group_count,
            max_work_group_size: limits.max_compute_work_group_size,
            max_threads_per_workgroup: limits.max_compute_work_group_invocations,
            max_uniform_buffers_per_stage: limits.max_per_stage_descriptor_uniform_buffers,
            max_storage_buffers_per_stage: limits.max_per_stage_descriptor_storage_buffers,
            max_storage_buffer_size: u64::from(limits.max_storage_buffer_range),
            max_vertex_attributes: limits.max_vertex_input_attributes,
            max_color_attachments: limits.max_color_attachments,
            min_uniform_buffer_alignment: limits.min_uniform_buffer_offset_alignment as u32,
        },
        features: AdapterFeatures {
            geometry_shaders: features.geometry_shader == vk::TRUE,
            logic_ops: features.logic_op == vk::TRUE,
            dual_source_blending: features.dual_src_blend == vk::TRUE,
            image_cube_arrays: features.image_cube_array == vk::TRUE,
            multi_draw_indirect: features.multi_draw_indirect == vk::TRUE,
            multi_viewport: features.multi_viewport == vk::TRUE,
            shader_clip_distance: features.shader_clip_distance == vk::TRUE,
            draw_indirect_first_instance: features.draw_indirect_first_instance == vk::TRUE,
            fragment_stores_and_atomics: features.fragment_stores_and_atomics == vk::TRUE,
            dynamic_rendering: dynamic_rendering.dynamic_rendering == vk::TRUE,
            shader_output_layer: vulkan_12.shader_output_layer == vk::TRUE,
            shader_output_viewport_index: vulkan_12.shader_output_viewport_index == vk::TRUE,
        },
        extensions,
    }
}

/// Find a queue family that supports graphics and compute operations.
pub fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32, GraphicsError> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    for (index, family) in queue_families.iter().enumerate() {
        if family
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        {
            return Ok(index as u32);
        }
    }

    Err(GraphicsError::InitializationFailed(
        "No graphics+compute queue family found".to_string(),
    ))
}

/// Create a logical device with the required features and extensions.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
) -> Result<ash::Device, GraphicsError> {
    let queue_priorities = [1.0f32];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(&queue_priorities);

    let queue_create_infos = [queue_create_info];

    let device_extensions = [
        ash::khr::swapchain::NAME.as_ptr(),
        ash::khr::dynamic_rendering::NAME.as_ptr(),
        ash::khr::dedicated_allocation::NAME.as_ptr(),
        ash::khr::get_memory_requirements2::NAME.as_ptr(),
    ];

    let features = vk::PhysicalDeviceFeatures::default()
        .geometry_shader(!cfg!(target_os = "macos"))
        .logic_op(!cfg!(target_os = "macos"))
        .dual_src_blend(true)
        .image_cube_array(true)
        .multi_draw_indirect(true)
        .multi_viewport(true)
        .shader_clip_distance(true)
        .draw_indirect_first_instance(true)
        .fragment_stores_and_atomics(true);

    let mut dynamic_rendering =
        vk::PhysicalDeviceDynamicRenderingFeatures::default().dynamic_rendering(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .enabled_features(&features)
        .push_next(&mut dynamic_rendering);

    let device =
        unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to create logical device: {e:?}"))
        })?;

    Ok(device)
}
