use crate::core::devices::SuitabilityError;

use vulkanalia::{
    prelude::v1_3::*,
    vk::{Handle, KhrSurfaceExtension},
};
use anyhow::{anyhow, Result};

/// Index of the first queue family that supports graphics
/// operations. Compute and transfer work is submitted to the
/// same family, so a single queue covers the whole renderer.
pub fn get_graphics_family_index(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let properties = unsafe {
        instance.get_physical_device_queue_family_properties(physical_device)
    };

    properties
        .iter()
        .position(|p| p.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
        .map(|i| i as u32)
        .ok_or_else(|| anyhow!(SuitabilityError("Missing graphics queue family.")))
}

/// Checks that the graphics family can also present to the
/// given surface. Headless contexts pass a null surface and skip
/// the check.
pub fn check_present_support(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    family: u32,
    surface: vk::SurfaceKHR,
) -> Result<()> {
    if surface.is_null() {
        return Ok(());
    }

    let supported = unsafe {
        instance.get_physical_device_surface_support_khr(physical_device, family, surface)?
    };

    if supported {
        Ok(())
    } else {
        Err(anyhow!(SuitabilityError("Graphics queue family cannot present.")))
    }
}
