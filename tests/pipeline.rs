//! Scene flattening, culling, sorting and draw recording, end to
//! end on the CPU side.

use lumina::{
    camera::{projection, Camera},
    culling::build_draw_order,
    draw::{record_draws, DrawRecorder, DrawStats},
    material::{MaterialInstance, MaterialPass, MaterialPipeline},
    resources::{AllocatedBuffer, GpuDrawPushConstants, GpuMeshBuffers},
    scene::*,
};

use std::rc::Rc;

use glam::{Mat4, Vec3};
use vulkanalia::{
    prelude::v1_3::*,
    vk::Handle,
};

#[derive(Default)]
struct Recorder {
    index_buffers: Vec<u64>,
    materials: Vec<*const MaterialInstance>,
    pushes: Vec<GpuDrawPushConstants>,
    draws: Vec<(u32, u32)>,
}

impl DrawRecorder for Recorder {
    fn bind_pipeline(&mut self, _: &MaterialPipeline) {}

    fn bind_material(&mut self, material: &MaterialInstance) {
        self.materials.push(material as *const _);
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer) {
        self.index_buffers.push(buffer.as_raw());
    }

    fn push_constants(&mut self, _: vk::PipelineLayout, constants: &GpuDrawPushConstants) {
        self.pushes.push(*constants);
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32) {
        self.draws.push((index_count, first_index));
    }
}

fn material(pipeline: u64, pass: MaterialPass) -> Rc<MaterialInstance> {
    Rc::new(MaterialInstance {
        pipeline: MaterialPipeline {
            pipeline: vk::Pipeline::from_raw(pipeline),
            layout: vk::PipelineLayout::from_raw(1),
        },
        set: vk::DescriptorSet::null(),
        pass,
    })
}

fn cube(name: &str, index_buffer: u64, material: &Rc<MaterialInstance>) -> MeshAsset {
    MeshAsset {
        name: name.into(),
        surfaces: vec![GeoSurface {
            start_index: 0,
            count: 36,
            bounds: Bounds::from_points([Vec3::splat(-0.5), Vec3::splat(0.5)]),
            material: Rc::clone(material),
        }],
        buffers: GpuMeshBuffers {
            index_buffer: AllocatedBuffer {
                buffer: vk::Buffer::from_raw(index_buffer),
                ..Default::default()
            },
            vertex_buffer_address: index_buffer << 16,
            ..Default::default()
        },
    }
}

struct Fixture {
    draw_context: DrawContext,
    view_proj: Mat4,
}

/// Five opaque cubes alternating between two meshes in front of
/// the camera, one more behind it, and a glass cube.
fn fixture() -> Fixture {
    let red = material(1, MaterialPass::Opaque);
    let blue = material(1, MaterialPass::Opaque);
    let glass = material(2, MaterialPass::Transparent);

    let mut scene = Scene::new();
    let a = scene.add_mesh(cube("a", 10, &red));
    let b = scene.add_mesh(cube("b", 20, &blue));
    let c = scene.add_mesh(cube("c", 30, &glass));

    let root = scene.add_node(NodeKind::Group, Mat4::from_translation(Vec3::new(0.0, 0.0, -10.0)), None);
    for (i, x) in [-4.0, -2.0, 0.0, 2.0, 4.0].into_iter().enumerate() {
        let mesh = if i % 2 == 0 { a } else { b };
        scene.add_node(NodeKind::Mesh(mesh), Mat4::from_translation(Vec3::new(x, 0.0, 0.0)), Some(root));
    }
    scene.add_node(NodeKind::Mesh(a), Mat4::from_translation(Vec3::new(0.0, 0.0, 20.0)), Some(root));
    scene.add_node(NodeKind::Mesh(c), Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0)), Some(root));
    scene.refresh_transforms();

    let mut draw_context = DrawContext::default();
    scene.draw(Mat4::IDENTITY, &mut draw_context);

    let camera = Camera::default();
    let view_proj = projection(70f32.to_radians(), 1024, 576) * camera.view_matrix();

    Fixture { draw_context, view_proj }
}

fn run(fixture: &Fixture, cull: bool, sort: bool) -> (Recorder, DrawStats) {
    let order = build_draw_order(&fixture.draw_context, fixture.view_proj, cull, sort);
    let mut recorder = Recorder::default();
    let stats = record_draws(&mut recorder, &fixture.draw_context, &order);
    (recorder, stats)
}

#[test]
fn scene_flattens_into_passes() {
    let fixture = fixture();
    assert_eq!(fixture.draw_context.opaque.len(), 6);
    assert_eq!(fixture.draw_context.transparent.len(), 1);

    // World transforms compose parent then child.
    let glass = &fixture.draw_context.transparent[0];
    assert_eq!(glass.transform.w_axis.truncate(), Vec3::new(0.0, 2.0, -10.0));
    assert_eq!(glass.vertex_buffer_address, 30 << 16);
}

#[test]
fn cull_and_sort_minimise_state_changes() {
    let (recorder, stats) = run(&fixture(), true, true);

    // The cube behind the camera is gone.
    assert_eq!(stats.draw_calls, 6);
    assert_eq!(stats.triangles, 6 * 12);

    // One run per opaque material, then the glass.
    assert_eq!(stats.material_binds, 3);
    assert_eq!(stats.pipeline_binds, 2);
    assert_eq!(stats.index_buffer_binds, 3);
    assert_eq!(recorder.index_buffers.last(), Some(&30));

    // Every draw still gets its own constants.
    assert_eq!(recorder.pushes.len(), 6);
    assert!(recorder.draws.iter().all(|&draw| draw == (36, 0)));
}

#[test]
fn unsorted_draws_rebind_on_every_change() {
    let (recorder, stats) = run(&fixture(), true, false);

    assert_eq!(stats.draw_calls, 6);
    assert_eq!(stats.material_binds, 6);
    assert_eq!(stats.index_buffer_binds, 6);
    assert_eq!(recorder.index_buffers, vec![10, 20, 10, 20, 10, 30]);
}

#[test]
fn disabling_culling_draws_everything() {
    let (recorder, stats) = run(&fixture(), false, true);

    assert_eq!(stats.draw_calls, 7);
    let behind = recorder
        .pushes
        .iter()
        .filter(|push| push.world_matrix.w_axis.z > 0.0)
        .count();
    assert_eq!(behind, 1);
}

#[test]
fn transparent_objects_come_last() {
    let (recorder, _) = run(&fixture(), true, true);

    let last = recorder.pushes.last().map(|push| push.world_matrix.w_axis.y);
    assert_eq!(last, Some(2.0));
    assert_eq!(recorder.materials.len(), 3);
}
