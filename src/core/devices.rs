use std::collections::HashSet;

use crate::core::{
    context::{PORTABILITY_MACOS_VERSION, VALIDATION_ENABLED, VALIDATION_LAYER},
    queues::*,
    swapchain::get_swapchain_support,
};

use thiserror::Error;
use vulkanalia::{
    prelude::v1_3::*,
    vk::Handle,
};
use anyhow::{anyhow, Result};
use log::*;

/// Extensions every device must expose. Dynamic rendering and
/// synchronization2 are core in 1.3, but some drivers still
/// report them separately, so they are checked explicitly.
pub const REQUIRED_EXTENSIONS: &[vk::ExtensionName] = &[
    vk::KHR_DYNAMIC_RENDERING_EXTENSION.name,
    vk::KHR_SYNCHRONIZATION2_EXTENSION.name,
];

/// Extra extensions needed when rendering to a surface.
pub const PRESENT_EXTENSIONS: &[vk::ExtensionName] = &[
    vk::KHR_SWAPCHAIN_EXTENSION.name,
];

/// Portability subset, mandatory on MoltenVK. vulkanalia only
/// generates the constant for it behind its `provisional`
/// feature, so the name is spelled out here.
pub static PORTABILITY_SUBSET_EXTENSION: vk::ExtensionName =
    vk::ExtensionName::from_bytes(b"VK_KHR_portability_subset");

#[derive(Error, Debug)]
#[error("{0}")]
pub struct SuitabilityError(pub &'static str);

fn required_extensions(surface: vk::SurfaceKHR) -> Vec<vk::ExtensionName> {
    let mut extensions = REQUIRED_EXTENSIONS.to_vec();
    if !surface.is_null() {
        extensions.extend_from_slice(PRESENT_EXTENSIONS);
    }
    extensions
}

fn check_physical_device_extensions(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Result<()> {
    let extensions = unsafe {
        instance
            .enumerate_device_extension_properties(physical_device, None)?
            .iter()
            .map(|e| e.extension_name)
            .collect::<HashSet<_>>()
    };

    if required_extensions(surface).iter().all(|e| extensions.contains(e)) {
        Ok(())
    } else {
        Err(anyhow!(SuitabilityError("Missing required device extensions.")))
    }
}

fn check_physical_device_features(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    if properties.api_version < vk::make_version(1, 3, 0) {
        return Err(anyhow!(SuitabilityError("Device does not support Vulkan 1.3.")));
    }

    let mut features12 = vk::PhysicalDeviceVulkan12Features::builder();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::builder();
    let mut features = vk::PhysicalDeviceFeatures2::builder()
        .push_next(&mut features12)
        .push_next(&mut features13);

    unsafe { instance.get_physical_device_features2(physical_device, &mut features) };

    if features12.buffer_device_address != vk::TRUE {
        return Err(anyhow!(SuitabilityError("Device does not support buffer device addresses.")));
    }
    if features12.descriptor_indexing != vk::TRUE {
        return Err(anyhow!(SuitabilityError("Device does not support descriptor indexing.")));
    }
    if features13.dynamic_rendering != vk::TRUE || features13.synchronization2 != vk::TRUE {
        return Err(anyhow!(SuitabilityError("Device does not support dynamic rendering and synchronization2.")));
    }

    Ok(())
}

fn check_physical_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Result<u32> {
    let family = get_graphics_family_index(instance, physical_device)?;
    check_present_support(instance, physical_device, family, surface)?;
    check_physical_device_extensions(instance, physical_device, surface)?;
    check_physical_device_features(instance, physical_device)?;

    if !surface.is_null() {
        let support = get_swapchain_support(instance, surface, physical_device)?;
        if support.formats.is_empty() || support.present_modes.is_empty() {
            return Err(anyhow!(SuitabilityError("Insufficient swapchain support.")));
        }
    }

    Ok(family)
}

/// Picks the first physical device that satisfies every
/// requirement, returning it along with its graphics queue
/// family index.
pub fn pick_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    for device in unsafe { instance.enumerate_physical_devices()? } {
        let properties = unsafe { instance.get_physical_device_properties(device) };

        match check_physical_device(instance, device, surface) {
            Ok(family) => {
                info!("Selected physical device: {}", properties.device_name);
                return Ok((device, family));
            }
            Err(error) => {
                warn!("Skipping physical device ({}): {}", properties.device_name, error);
            }
        }
    }

    Err(anyhow!(SuitabilityError("Failed to find suitable physical device.")))
}

pub fn create_logical_device(
    entry: &Entry,
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    graphics_family: u32,
    surface: vk::SurfaceKHR,
) -> Result<(Device, vk::Queue)> {
    let priorities = &[1.0];
    let graphics_queues = &[
        vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_family)
            .queue_priorities(priorities)
            .build()
    ];

    let layers = if VALIDATION_ENABLED {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let names = required_extensions(surface);
    let mut extensions = names
        .iter()
        .map(|e| e.as_ptr())
        .collect::<Vec<_>>();

    if cfg!(target_os = "macos") && entry.version()? >= PORTABILITY_MACOS_VERSION {
        extensions.push(PORTABILITY_SUBSET_EXTENSION.as_ptr());
    }

    let features = vk::PhysicalDeviceFeatures::builder();

    // Vertex data is fetched through buffer device addresses
    // pushed as constants, so there is no vertex input state
    // anywhere in the renderer.
    let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
        .buffer_device_address(true)
        .descriptor_indexing(true);

    let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
        .synchronization2(true)
        .dynamic_rendering(true);

    let info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(graphics_queues)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut features12)
        .push_next(&mut features13);

    let device = unsafe { instance.create_device(physical_device, &info, None)? };
    let queue = unsafe { device.get_device_queue(graphics_family, 0) };

    info!("Logical device created.");
    Ok((device, queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portability_subset_name_matches_the_registry() {
        assert_eq!(PORTABILITY_SUBSET_EXTENSION.to_string_lossy(), "VK_KHR_portability_subset");
    }

    #[test]
    fn headless_devices_do_not_need_a_swapchain() {
        let headless = required_extensions(vk::SurfaceKHR::null());
        assert!(!headless.contains(&vk::KHR_SWAPCHAIN_EXTENSION.name));
    }
}
