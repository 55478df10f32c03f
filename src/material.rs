use crate::{
    deletion::DeletionQueue,
    descriptors::*,
    pipeline::*,
    resources::{AllocatedImage, GpuDrawPushConstants},
    shaders::load_shader_or_null,
};

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use vulkanalia::prelude::v1_3::*;
use anyhow::Result;
use log::*;

/// Which pass a material is drawn in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MaterialPass {
    #[default]
    Opaque,
    Transparent,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaterialPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

/// A pipeline plus the descriptor set holding one material's
/// parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaterialInstance {
    pub pipeline: MaterialPipeline,
    pub set: vk::DescriptorSet,
    pub pass: MaterialPass,
}

/// Uniform block of the metallic-roughness material. Padded to
/// 256 bytes so consecutive constants honour the usual uniform
/// offset alignment.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MaterialConstants {
    pub color_factors: Vec4,
    pub metal_rough_factors: Vec4,
    pub extra: [Vec4; 14],
}

impl Default for MaterialConstants {
    fn default() -> Self {
        Self {
            color_factors: Vec4::ONE,
            metal_rough_factors: Vec4::new(1.0, 0.5, 0.0, 0.0),
            extra: [Vec4::ZERO; 14],
        }
    }
}

/// Everything a material descriptor set points at.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaterialResources {
    pub color_image: AllocatedImage,
    pub color_sampler: vk::Sampler,
    pub metal_rough_image: AllocatedImage,
    pub metal_rough_sampler: vk::Sampler,
    pub data_buffer: vk::Buffer,
    pub data_offset: u64,
}

/// The metallic-roughness material model: one opaque and one
/// transparent pipeline over a shared layout.
#[derive(Default)]
pub struct MetallicRoughness {
    pub opaque: MaterialPipeline,
    pub transparent: MaterialPipeline,
    pub material_layout: vk::DescriptorSetLayout,
    writer: DescriptorWriter,
}

impl MetallicRoughness {
    pub fn build_pipelines(
        device: &Device,
        shader_dir: &Path,
        scene_layout: vk::DescriptorSetLayout,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<Self> {
        let vertex = load_shader_or_null(device, &shader_dir.join("mesh.vert.spv"));
        let fragment = load_shader_or_null(device, &shader_dir.join("mesh.frag.spv"));

        let material_layout = DescriptorLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
            .add_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .add_binding(2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .build(
                device,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                vk::DescriptorSetLayoutCreateFlags::empty(),
            )?;

        let push_constant_ranges = &[vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(std::mem::size_of::<GpuDrawPushConstants>() as u32)];

        let set_layouts = &[scene_layout, material_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };

        // Depth is reversed: near is 1, far is 0.
        let mut builder = PipelineBuilder::new();
        builder
            .set_shaders(vertex, fragment)
            .set_input_topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .set_polygon_mode(vk::PolygonMode::FILL)
            .set_cull_mode(vk::CullModeFlags::NONE, vk::FrontFace::CLOCKWISE)
            .set_blending(BlendMode::Disabled)
            .set_depth_test(DepthTest::Enabled {
                compare: vk::CompareOp::GREATER_OR_EQUAL,
                write: true,
            })
            .set_color_attachment_format(color_format)
            .set_depth_format(depth_format)
            .set_layout(layout);

        let opaque = builder.build_pipeline(device);

        builder
            .set_blending(BlendMode::Additive)
            .set_depth_test(DepthTest::Enabled {
                compare: vk::CompareOp::GREATER_OR_EQUAL,
                write: false,
            });

        let transparent = builder.build_pipeline(device);

        unsafe {
            device.destroy_shader_module(vertex, None);
            device.destroy_shader_module(fragment, None);
        }

        info!("Material pipelines created.");
        Ok(Self {
            opaque: MaterialPipeline { pipeline: opaque, layout },
            transparent: MaterialPipeline { pipeline: transparent, layout },
            material_layout,
            writer: DescriptorWriter::new(),
        })
    }

    /// Allocates and fills a descriptor set for one material.
    pub fn write_material(
        &mut self,
        device: &Device,
        pass: MaterialPass,
        resources: &MaterialResources,
        allocator: &mut DescriptorAllocatorGrowable,
    ) -> Result<MaterialInstance> {
        let pipeline = match pass {
            MaterialPass::Opaque => self.opaque,
            MaterialPass::Transparent => self.transparent,
        };

        let set = allocator.allocate(device, self.material_layout)?;

        self.writer.clear();
        self.writer
            .write_buffer(
                0,
                resources.data_buffer,
                std::mem::size_of::<MaterialConstants>() as u64,
                resources.data_offset,
                vk::DescriptorType::UNIFORM_BUFFER,
            )
            .write_image(
                1,
                resources.color_image.view,
                resources.color_sampler,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            )
            .write_image(
                2,
                resources.metal_rough_image.view,
                resources.metal_rough_sampler,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            );
        self.writer.update_set(device, set);

        Ok(MaterialInstance { pipeline, set, pass })
    }

    /// Queues the pipelines and layouts for destruction. Both
    /// pipelines share one layout, which is queued once.
    pub fn defer_destroy(&self, queue: &mut DeletionQueue) {
        queue.push(self.material_layout);
        queue.push(self.opaque.layout);
        queue.push(self.opaque.pipeline);
        queue.push(self.transparent.pipeline);
    }
}
