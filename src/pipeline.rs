use vulkanalia::{
    prelude::v1_3::*,
    vk::Handle,
};
use log::*;

/// Canned color blending setups.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlendMode {
    #[default]
    Disabled,
    /// `src * src_alpha + dst`
    Additive,
    /// `src * src_alpha + dst * (1 - src_alpha)`
    Alpha,
}

impl BlendMode {
    pub fn attachment_state(self) -> vk::PipelineColorBlendAttachmentState {
        let builder = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::all());

        let dst_color = match self {
            BlendMode::Disabled => return builder.blend_enable(false).build(),
            BlendMode::Additive => vk::BlendFactor::ONE,
            BlendMode::Alpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        };

        builder
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(dst_color)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build()
    }
}

/// Depth test configuration. Stencil testing is never used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DepthTest {
    #[default]
    Disabled,
    Enabled {
        compare: vk::CompareOp,
        write: bool,
    },
}

impl DepthTest {
    pub fn state(self) -> vk::PipelineDepthStencilStateCreateInfo {
        let (enabled, write, compare) = match self {
            DepthTest::Disabled => (false, false, vk::CompareOp::NEVER),
            DepthTest::Enabled { compare, write } => (true, write, compare),
        };

        vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(enabled)
            .depth_write_enable(write)
            .depth_compare_op(compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
            .build()
    }
}

/// Accumulates graphics pipeline state for dynamic rendering.
///
/// Viewport and scissor are always dynamic, and multisampling is
/// always off. Building leaves the accumulated state untouched;
/// [`PipelineBuilder::clear`] is the only way to reset it.
#[derive(Clone, Debug)]
pub struct PipelineBuilder {
    pub shader_stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub blend: BlendMode,
    pub depth: DepthTest,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub layout: vk::PipelineLayout,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            shader_stages: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            blend: BlendMode::Disabled,
            depth: DepthTest::Disabled,
            color_format: vk::Format::UNDEFINED,
            depth_format: vk::Format::UNDEFINED,
            layout: vk::PipelineLayout::null(),
        }
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn set_shaders(&mut self, vertex: vk::ShaderModule, fragment: vk::ShaderModule) -> &mut Self {
        self.shader_stages.clear();
        self.shader_stages.push((vk::ShaderStageFlags::VERTEX, vertex));
        self.shader_stages.push((vk::ShaderStageFlags::FRAGMENT, fragment));
        self
    }

    pub fn set_input_topology(&mut self, topology: vk::PrimitiveTopology) -> &mut Self {
        self.topology = topology;
        self
    }

    pub fn set_polygon_mode(&mut self, mode: vk::PolygonMode) -> &mut Self {
        self.polygon_mode = mode;
        self
    }

    pub fn set_cull_mode(&mut self, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) -> &mut Self {
        self.cull_mode = cull_mode;
        self.front_face = front_face;
        self
    }

    pub fn set_blending(&mut self, blend: BlendMode) -> &mut Self {
        self.blend = blend;
        self
    }

    pub fn set_depth_test(&mut self, depth: DepthTest) -> &mut Self {
        self.depth = depth;
        self
    }

    pub fn set_color_attachment_format(&mut self, format: vk::Format) -> &mut Self {
        self.color_format = format;
        self
    }

    pub fn set_depth_format(&mut self, format: vk::Format) -> &mut Self {
        self.depth_format = format;
        self
    }

    pub fn set_layout(&mut self, layout: vk::PipelineLayout) -> &mut Self {
        self.layout = layout;
        self
    }

    /// Builds the pipeline, or logs the failure and returns a
    /// null handle.
    pub fn build_pipeline(&self, device: &Device) -> vk::Pipeline {
        if self.shader_stages.iter().any(|(_, module)| module.is_null()) {
            error!("Pipeline not built: missing shader module.");
            return vk::Pipeline::null();
        }

        let stages = self
            .shader_stages
            .iter()
            .map(|&(stage, module)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage)
                    .module(module)
                    .name(b"main\0")
                    .build()
            })
            .collect::<Vec<_>>();

        // Vertices come from a buffer address, never from vertex
        // input bindings.
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::builder();

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(self.topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(self.polygon_mode)
            .line_width(1.0)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::_1)
            .min_sample_shading(1.0)
            .alpha_to_coverage_enable(false)
            .alpha_to_one_enable(false);

        let attachments = &[self.blend.attachment_state()];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(attachments);

        let depth_stencil_state = self.depth.state();

        let dynamic_states = &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(dynamic_states);

        let color_formats = &[self.color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(color_formats)
            .depth_attachment_format(self.depth_format);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .depth_stencil_state(&depth_stencil_state)
            .dynamic_state(&dynamic_state)
            .layout(self.layout)
            .push_next(&mut rendering_info);

        match unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None) } {
            Ok((pipelines, _)) => pipelines[0],
            Err(e) => {
                error!("Failed to create graphics pipeline: {e}");
                vk::Pipeline::null()
            }
        }
    }
}

/// Builds a compute pipeline from a single shader module, with
/// the same null-on-failure contract as [`PipelineBuilder`].
pub fn build_compute_pipeline(
    device: &Device,
    layout: vk::PipelineLayout,
    module: vk::ShaderModule,
) -> vk::Pipeline {
    if module.is_null() {
        error!("Compute pipeline not built: missing shader module.");
        return vk::Pipeline::null();
    }

    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(b"main\0");

    let info = vk::ComputePipelineCreateInfo::builder()
        .layout(layout)
        .stage(stage);

    match unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None) } {
        Ok((pipelines, _)) => pipelines[0],
        Err(e) => {
            error!("Failed to create compute pipeline: {e}");
            vk::Pipeline::null()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additive_and_alpha_blending_differ_only_in_destination_factor() {
        let additive = BlendMode::Additive.attachment_state();
        let alpha = BlendMode::Alpha.attachment_state();

        assert_eq!(additive.blend_enable, vk::TRUE);
        assert_eq!(additive.dst_color_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(additive.src_color_blend_factor, alpha.src_color_blend_factor);
    }

    #[test]
    fn disabled_blending_still_writes_every_channel() {
        let state = BlendMode::Disabled.attachment_state();
        assert_eq!(state.blend_enable, vk::FALSE);
        assert_eq!(state.color_write_mask, vk::ColorComponentFlags::all());
    }

    #[test]
    fn depth_state_reflects_compare_and_write() {
        let state = DepthTest::Enabled {
            compare: vk::CompareOp::GREATER_OR_EQUAL,
            write: false,
        }
        .state();

        assert_eq!(state.depth_test_enable, vk::TRUE);
        assert_eq!(state.depth_write_enable, vk::FALSE);
        assert_eq!(state.depth_compare_op, vk::CompareOp::GREATER_OR_EQUAL);

        let disabled = DepthTest::Disabled.state();
        assert_eq!(disabled.depth_test_enable, vk::FALSE);
    }

    #[test]
    fn clear_is_the_only_reset() {
        let mut builder = PipelineBuilder::new();
        builder
            .set_blending(BlendMode::Alpha)
            .set_color_attachment_format(vk::Format::R16G16B16A16_SFLOAT)
            .set_cull_mode(vk::CullModeFlags::BACK, vk::FrontFace::COUNTER_CLOCKWISE);

        assert_eq!(builder.blend, BlendMode::Alpha);
        assert_eq!(builder.color_format, vk::Format::R16G16B16A16_SFLOAT);

        builder.clear();
        assert_eq!(builder.blend, BlendMode::Disabled);
        assert_eq!(builder.color_format, vk::Format::UNDEFINED);
        assert_eq!(builder.cull_mode, vk::CullModeFlags::NONE);
    }
}
