use crate::{
    culling::DrawOrder,
    material::{MaterialInstance, MaterialPipeline},
    resources::GpuDrawPushConstants,
    scene::{DrawContext, RenderObject},
};

use vulkanalia::{
    prelude::v1_3::*,
    vk::Handle,
};
use log::*;

/// Sink for geometry commands. The Vulkan implementation writes
/// into a command buffer; tests record the calls.
pub trait DrawRecorder {
    fn bind_pipeline(&mut self, pipeline: &MaterialPipeline);
    fn bind_material(&mut self, material: &MaterialInstance);
    fn bind_index_buffer(&mut self, buffer: vk::Buffer);
    fn push_constants(&mut self, layout: vk::PipelineLayout, constants: &GpuDrawPushConstants);
    fn draw_indexed(&mut self, index_count: u32, first_index: u32);
}

/// Counters of one geometry pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub pipeline_binds: u32,
    pub material_binds: u32,
    pub index_buffer_binds: u32,
    pub draw_calls: u32,
    pub triangles: u32,
}

#[derive(Default)]
struct BoundState {
    pipeline: Option<vk::Pipeline>,
    material: Option<*const MaterialInstance>,
    index_buffer: Option<vk::Buffer>,
}

fn record_object<R: DrawRecorder + ?Sized>(
    recorder: &mut R,
    object: &RenderObject,
    bound: &mut BoundState,
    stats: &mut DrawStats,
) {
    let material = &*object.material;
    if material.pipeline.pipeline.is_null() {
        trace!("Skipping draw with a null pipeline.");
        return;
    }

    let material_ptr = material as *const MaterialInstance;
    if bound.material != Some(material_ptr) {
        if bound.pipeline != Some(material.pipeline.pipeline) {
            recorder.bind_pipeline(&material.pipeline);
            bound.pipeline = Some(material.pipeline.pipeline);
            stats.pipeline_binds += 1;
        }

        recorder.bind_material(material);
        bound.material = Some(material_ptr);
        stats.material_binds += 1;
    }

    if bound.index_buffer != Some(object.index_buffer) {
        recorder.bind_index_buffer(object.index_buffer);
        bound.index_buffer = Some(object.index_buffer);
        stats.index_buffer_binds += 1;
    }

    let constants = GpuDrawPushConstants::new(object.transform, object.vertex_buffer_address);
    recorder.push_constants(material.pipeline.layout, &constants);
    recorder.draw_indexed(object.index_count, object.first_index);

    stats.draw_calls += 1;
    stats.triangles += object.index_count / 3;
}

/// Records the opaque then the transparent objects of `context`
/// in `order`, binding state only when it changes.
pub fn record_draws<R: DrawRecorder + ?Sized>(
    recorder: &mut R,
    context: &DrawContext,
    order: &DrawOrder,
) -> DrawStats {
    let mut bound = BoundState::default();
    let mut stats = DrawStats::default();

    let opaque = order.opaque.iter().map(|&i| &context.opaque[i]);
    let transparent = order.transparent.iter().map(|&i| &context.transparent[i]);

    for object in opaque.chain(transparent) {
        record_object(recorder, object, &mut bound, &mut stats);
    }

    stats
}

/// Records geometry into a command buffer inside an active
/// dynamic rendering scope.
pub struct CommandRecorder<'a> {
    device: &'a Device,
    command_buffer: vk::CommandBuffer,
    /// Per-frame scene data, bound at set 0 with every pipeline.
    scene_set: vk::DescriptorSet,
    extent: vk::Extent2D,
}

impl<'a> CommandRecorder<'a> {
    pub fn new(
        device: &'a Device,
        command_buffer: vk::CommandBuffer,
        scene_set: vk::DescriptorSet,
        extent: vk::Extent2D,
    ) -> Self {
        Self { device, command_buffer, scene_set, extent }
    }
}

impl DrawRecorder for CommandRecorder<'_> {
    fn bind_pipeline(&mut self, pipeline: &MaterialPipeline) {
        let viewport = vk::Viewport::builder()
            .x(0.0)
            .y(0.0)
            .width(self.extent.width as f32)
            .height(self.extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0);

        let scissor = vk::Rect2D::builder()
            .offset(vk::Offset2D::default())
            .extent(self.extent);

        unsafe {
            self.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.pipeline,
            );
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout,
                0,
                &[self.scene_set],
                &[],
            );
            self.device.cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }

    fn bind_material(&mut self, material: &MaterialInstance) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                material.pipeline.layout,
                1,
                &[material.set],
                &[],
            );
        }
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer) {
        unsafe {
            self.device.cmd_bind_index_buffer(self.command_buffer, buffer, 0, vk::IndexType::UINT32);
        }
    }

    fn push_constants(&mut self, layout: vk::PipelineLayout, constants: &GpuDrawPushConstants) {
        unsafe {
            self.device.cmd_push_constants(
                self.command_buffer,
                layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(constants),
            );
        }
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32) {
        unsafe {
            self.device.cmd_draw_indexed(self.command_buffer, index_count, 1, first_index, 0, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Bounds;

    use std::rc::Rc;

    use glam::Mat4;

    #[derive(Default)]
    struct Counter {
        calls: Vec<&'static str>,
    }

    impl DrawRecorder for Counter {
        fn bind_pipeline(&mut self, _: &MaterialPipeline) {
            self.calls.push("pipeline");
        }
        fn bind_material(&mut self, _: &MaterialInstance) {
            self.calls.push("material");
        }
        fn bind_index_buffer(&mut self, _: vk::Buffer) {
            self.calls.push("index");
        }
        fn push_constants(&mut self, _: vk::PipelineLayout, _: &GpuDrawPushConstants) {
            self.calls.push("push");
        }
        fn draw_indexed(&mut self, _: u32, _: u32) {
            self.calls.push("draw");
        }
    }

    fn material(pipeline: u64) -> Rc<MaterialInstance> {
        Rc::new(MaterialInstance {
            pipeline: MaterialPipeline {
                pipeline: vk::Pipeline::from_raw(pipeline),
                layout: vk::PipelineLayout::from_raw(1),
            },
            ..Default::default()
        })
    }

    fn object(material: &Rc<MaterialInstance>, index_buffer: u64) -> RenderObject {
        RenderObject {
            index_count: 6,
            first_index: 0,
            index_buffer: vk::Buffer::from_raw(index_buffer),
            bounds: Bounds::default(),
            material: Rc::clone(material),
            transform: Mat4::IDENTITY,
            vertex_buffer_address: 0,
        }
    }

    fn all(context: &DrawContext) -> DrawOrder {
        DrawOrder {
            opaque: (0..context.opaque.len()).collect(),
            transparent: (0..context.transparent.len()).collect(),
        }
    }

    #[test]
    fn a_run_of_one_material_binds_once() {
        let shared = material(1);
        let context = DrawContext {
            opaque: (0..4).map(|_| object(&shared, 7)).collect(),
            transparent: vec![],
        };

        let mut counter = Counter::default();
        let stats = record_draws(&mut counter, &context, &all(&context));

        assert_eq!(stats.pipeline_binds, 1);
        assert_eq!(stats.material_binds, 1);
        assert_eq!(stats.index_buffer_binds, 1);
        assert_eq!(stats.draw_calls, 4);
        assert_eq!(stats.triangles, 8);
        assert_eq!(counter.calls.iter().filter(|&&c| c == "push").count(), 4);
    }

    #[test]
    fn materials_sharing_a_pipeline_only_rebind_the_set() {
        let a = material(1);
        let b = material(1);
        let context = DrawContext {
            opaque: vec![object(&a, 7), object(&b, 7), object(&a, 8)],
            transparent: vec![],
        };

        let mut counter = Counter::default();
        let stats = record_draws(&mut counter, &context, &all(&context));

        assert_eq!(stats.pipeline_binds, 1);
        assert_eq!(stats.material_binds, 3);
        assert_eq!(stats.index_buffer_binds, 2);
        assert_eq!(
            counter.calls[..6],
            ["pipeline", "material", "index", "push", "draw", "material"],
        );
    }

    #[test]
    fn null_pipelines_are_skipped() {
        let broken = material(0);
        let fine = material(2);
        let context = DrawContext {
            opaque: vec![object(&broken, 7)],
            transparent: vec![object(&fine, 7)],
        };

        let mut counter = Counter::default();
        let stats = record_draws(&mut counter, &context, &all(&context));

        assert_eq!(stats.draw_calls, 1);
        assert_eq!(stats.pipeline_binds, 1);
    }

    #[test]
    fn order_selects_and_sequences_objects() {
        let a = material(1);
        let context = DrawContext {
            opaque: vec![object(&a, 1), object(&a, 2), object(&a, 3)],
            transparent: vec![],
        };
        let order = DrawOrder {
            opaque: vec![2, 0],
            transparent: vec![],
        };

        let mut counter = Counter::default();
        let stats = record_draws(&mut counter, &context, &order);

        assert_eq!(stats.draw_calls, 2);
        assert_eq!(stats.index_buffer_binds, 2);
    }
}
