//! Vulkan instance creation.

use std::ffi::CString;

use ash::vk;

use crate::error::GraphicsError;

/// Required Vulkan API version.
/// On macOS with MoltenVK, only Vulkan 1.2 is supported.
pub const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

/// Create the Vulkan instance used for probing and for the device
/// connection. The same minimal configuration serves both: feature queries
/// go through core Vulkan 1.2 entry points, no surface is needed here.
pub fn create_instance(entry: &ash::Entry) -> Result<ash::Instance, GraphicsError> {
    let app_name = CString::new("Amaranth").unwrap();
    let engine_name = CString::new("Amaranth Engine").unwrap();

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    #[allow(unused_mut)]
    let mut extensions: Vec<*const std::ffi::c_char> = Vec::new();

    #[allow(unused_mut)]
    let mut create_flags = vk::InstanceCreateFlags::empty();

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let create_info = vk::InstanceCreateInfo::default()
        .flags(create_flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions);

    let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create Vulkan instance: {e:?}"))
    })?;

    Ok(instance)
}
