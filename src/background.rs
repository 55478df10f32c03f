use crate::{
    core::image::subresource_range,
    deletion::DeletionQueue,
    descriptors::*,
    pipeline::build_compute_pipeline,
    resources::AllocatedImage,
    shaders::load_shader_or_null,
};

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use vulkanalia::{
    prelude::v1_3::*,
    vk::Handle,
};
use anyhow::Result;
use log::*;

const WORK_GROUP_SIZE: u32 = 16;

/// Free-form parameters of the background compute shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ComputePushConstants {
    pub data1: Vec4,
    pub data2: Vec4,
    pub data3: Vec4,
    pub data4: Vec4,
}

/// Work groups needed to cover `extent`.
pub fn work_groups(extent: vk::Extent2D) -> (u32, u32) {
    (
        extent.width.div_ceil(WORK_GROUP_SIZE),
        extent.height.div_ceil(WORK_GROUP_SIZE),
    )
}

/// Clear color used when the compute shader is unavailable: blue
/// pulsing over 120 frames.
pub fn flash_color(frame_number: u64) -> [f32; 4] {
    let flash = (frame_number as f32 / 120.0).sin().abs();
    [0.0, 0.0, flash, 1.0]
}

/// Fills the draw image before geometry is drawn over it.
#[derive(Default)]
pub struct Background {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    descriptor_layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    pub push_constants: ComputePushConstants,
}

impl Background {
    pub fn create(
        device: &Device,
        shader_dir: &Path,
        allocator: &DescriptorAllocator,
        draw_image: &AllocatedImage,
    ) -> Result<Self> {
        let descriptor_layout = DescriptorLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::STORAGE_IMAGE)
            .build(
                device,
                vk::ShaderStageFlags::COMPUTE,
                vk::DescriptorSetLayoutCreateFlags::empty(),
            )?;

        let set = allocator.allocate(device, descriptor_layout)?;

        let push_constant_ranges = &[vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(std::mem::size_of::<ComputePushConstants>() as u32)];

        let set_layouts = &[descriptor_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };

        let module = load_shader_or_null(device, &shader_dir.join("gradient.comp.spv"));
        let pipeline = build_compute_pipeline(device, layout, module);
        unsafe { device.destroy_shader_module(module, None) };

        if pipeline.is_null() {
            warn!("Background shader unavailable, falling back to a clear.");
        }

        let background = Self {
            pipeline,
            layout,
            descriptor_layout,
            set,
            push_constants: ComputePushConstants {
                data1: Vec4::new(1.0, 0.0, 0.0, 1.0),
                data2: Vec4::new(0.0, 0.0, 1.0, 1.0),
                ..Default::default()
            },
        };
        background.bind_target(device, draw_image);

        info!("Background effect created.");
        Ok(background)
    }

    /// Points the storage image descriptor at `draw_image`, after
    /// creation and whenever the draw image is recreated.
    pub fn bind_target(&self, device: &Device, draw_image: &AllocatedImage) {
        let mut writer = DescriptorWriter::new();
        writer.write_image(
            0,
            draw_image.view,
            vk::Sampler::null(),
            vk::ImageLayout::GENERAL,
            vk::DescriptorType::STORAGE_IMAGE,
        );
        writer.update_set(device, self.set);
    }

    /// Records the fill. `draw_image` must be in GENERAL layout.
    pub fn record(
        &self,
        device: &Device,
        command_buffer: vk::CommandBuffer,
        draw_image: &AllocatedImage,
        extent: vk::Extent2D,
        frame_number: u64,
    ) {
        if self.pipeline.is_null() {
            let clear_color = vk::ClearColorValue { float32: flash_color(frame_number) };
            let ranges = &[subresource_range(vk::ImageAspectFlags::COLOR)];
            unsafe {
                device.cmd_clear_color_image(
                    command_buffer,
                    draw_image.image,
                    vk::ImageLayout::GENERAL,
                    &clear_color,
                    ranges,
                )
            };
            return;
        }

        let (groups_x, groups_y) = work_groups(extent);
        unsafe {
            device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.layout,
                0,
                &[self.set],
                &[],
            );
            device.cmd_push_constants(
                command_buffer,
                self.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&self.push_constants),
            );
            device.cmd_dispatch(command_buffer, groups_x, groups_y, 1);
        }
    }

    /// Queues the pipeline and its layouts for destruction. The
    /// descriptor set goes away with the pool it came from.
    pub fn defer_destroy(&self, queue: &mut DeletionQueue) {
        queue.push(self.descriptor_layout);
        queue.push(self.layout);
        queue.push(self.pipeline);
    }
}
