use vulkanalia::prelude::v1_3::*;
use anyhow::Result;

pub fn create_semaphore(device: &Device) -> Result<vk::Semaphore> {
    let info = vk::SemaphoreCreateInfo::builder();
    Ok(unsafe { device.create_semaphore(&info, None)? })
}

/// Creates a fence. Fences guarding frame slots start in the
/// signaled state, otherwise the first wait on a slot would
/// never return.
pub fn create_fence(device: &Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let info = vk::FenceCreateInfo::builder().flags(flags);
    Ok(unsafe { device.create_fence(&info, None)? })
}

pub fn semaphore_submit(
    stage_mask: vk::PipelineStageFlags2,
    semaphore: vk::Semaphore,
) -> vk::SemaphoreSubmitInfo {
    // Binary semaphores ignore the value field; the device index
    // is always 0 since there is a single device.
    vk::SemaphoreSubmitInfo::builder()
        .semaphore(semaphore)
        .stage_mask(stage_mask)
        .device_index(0)
        .value(1)
        .build()
}

pub fn command_buffer_submit(command_buffer: vk::CommandBuffer) -> vk::CommandBufferSubmitInfo {
    vk::CommandBufferSubmitInfo::builder()
        .command_buffer(command_buffer)
        .device_mask(0)
        .build()
}
