use crate::core::sync::*;

use vulkanalia::prelude::v1_3::*;
use anyhow::{anyhow, Result};
use log::*;

pub fn create_command_pool(device: &Device, queue_family: u32) -> Result<vk::CommandPool> {
    // Buffers from these pools are re-recorded individually every
    // time they are used, hence RESET_COMMAND_BUFFER.
    let info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(queue_family);

    Ok(unsafe { device.create_command_pool(&info, None)? })
}

pub fn allocate_command_buffer(
    device: &Device,
    pool: vk::CommandPool,
) -> Result<vk::CommandBuffer> {
    let info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    unsafe { device.allocate_command_buffers(&info)? }
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Command buffer allocation returned nothing."))
}

pub fn begin_one_time(device: &Device, command_buffer: vk::CommandBuffer) -> Result<()> {
    let info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe { device.begin_command_buffer(command_buffer, &info)? };
    Ok(())
}

/// Dedicated command buffer and fence for blocking, setup-time
/// GPU work (uploads, mip generation, readbacks).
///
/// Every call to [`ImmediateSubmit::submit`] stalls the calling
/// thread until the device has finished the recorded commands.
/// It must stay out of the per-frame path.
#[derive(Default)]
pub struct ImmediateSubmit {
    fence: vk::Fence,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

impl ImmediateSubmit {
    pub fn create(device: &Device, queue_family: u32) -> Result<Self> {
        let command_pool = create_command_pool(device, queue_family)?;
        let command_buffer = allocate_command_buffer(device, command_pool)?;
        let fence = create_fence(device, false)?;

        info!("Immediate submit objects created.");
        Ok(Self { fence, command_pool, command_buffer })
    }

    /// Records `record` into the dedicated command buffer,
    /// submits it and blocks until the fence signals.
    pub fn submit<F>(&self, device: &Device, queue: vk::Queue, record: F) -> Result<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer),
    {
        let command_buffer = self.command_buffer;

        unsafe {
            device.reset_fences(&[self.fence])?;
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
        }

        begin_one_time(device, command_buffer)?;
        record(device, command_buffer);
        unsafe { device.end_command_buffer(command_buffer)? };

        let command_infos = &[command_buffer_submit(command_buffer)];
        let submit_info = vk::SubmitInfo2::builder()
            .command_buffer_infos(command_infos);

        unsafe {
            device.queue_submit2(queue, &[submit_info], self.fence)?;
            device.wait_for_fences(&[self.fence], true, u64::MAX)?;
        }

        trace!("Immediate submission completed.");
        Ok(())
    }

    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_fence(self.fence, None);
        }
    }
}
