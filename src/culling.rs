use crate::scene::{Bounds, DrawContext, RenderObject};

use std::rc::Rc;

use glam::{Mat4, Vec3};
use vulkanalia::{
    prelude::v1_3::*,
    vk::Handle,
};

const CORNERS: [Vec3; 8] = [
    Vec3::new(1.0, 1.0, 1.0),
    Vec3::new(1.0, 1.0, -1.0),
    Vec3::new(1.0, -1.0, 1.0),
    Vec3::new(1.0, -1.0, -1.0),
    Vec3::new(-1.0, 1.0, 1.0),
    Vec3::new(-1.0, 1.0, -1.0),
    Vec3::new(-1.0, -1.0, 1.0),
    Vec3::new(-1.0, -1.0, -1.0),
];

/// Conservative frustum test: projects the bounding box corners
/// and rejects the object only when their clip-space box lies
/// entirely outside `[-1,1]x[-1,1]x[0,1]`.
pub fn is_visible(bounds: &Bounds, transform: Mat4, view_proj: Mat4) -> bool {
    let matrix = view_proj * transform;

    let mut min = Vec3::splat(f32::INFINITY);
    let mut max = Vec3::splat(f32::NEG_INFINITY);

    for corner in CORNERS {
        let clip = matrix * (bounds.origin + corner * bounds.extents).extend(1.0);
        let ndc = clip.truncate() / clip.w;

        min = min.min(ndc);
        max = max.max(ndc);
    }

    !(min.z > 1.0 || max.z < 0.0 || min.x > 1.0 || max.x < -1.0 || min.y > 1.0 || max.y < -1.0)
}

pub fn is_object_visible(object: &RenderObject, view_proj: Mat4) -> bool {
    is_visible(&object.bounds, object.transform, view_proj)
}

/// Key grouping draws that can share pipeline, descriptor and
/// index buffer bindings.
fn state_key(object: &RenderObject) -> (usize, u64) {
    (Rc::as_ptr(&object.material) as usize, object.index_buffer.as_raw())
}

/// Order in which to record the objects of a [`DrawContext`],
/// as indices into its lists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrawOrder {
    pub opaque: Vec<usize>,
    pub transparent: Vec<usize>,
}

/// Culls both lists when `cull` is set and sorts the opaque one
/// by material then index buffer when `sort` is set. The sort is
/// stable; transparent objects keep their scene order.
pub fn build_draw_order(context: &DrawContext, view_proj: Mat4, cull: bool, sort: bool) -> DrawOrder {
    let visible = |objects: &[RenderObject]| {
        objects
            .iter()
            .enumerate()
            .filter(|(_, o)| !cull || is_object_visible(o, view_proj))
            .map(|(i, _)| i)
            .collect::<Vec<_>>()
    };

    let mut opaque = visible(&context.opaque);
    let transparent = visible(&context.transparent);

    if sort {
        opaque.sort_by_key(|&i| state_key(&context.opaque[i]));
    }

    DrawOrder { opaque, transparent }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::MaterialInstance;

    fn unit_bounds() -> Bounds {
        Bounds {
            origin: Vec3::ZERO,
            extents: Vec3::splat(0.5),
            sphere_radius: 0.75f32.sqrt(),
        }
    }

    fn object(material: &Rc<MaterialInstance>, index_buffer: u64, at: Vec3) -> RenderObject {
        RenderObject {
            index_count: 3,
            first_index: 0,
            index_buffer: vk::Buffer::from_raw(index_buffer),
            bounds: unit_bounds(),
            material: Rc::clone(material),
            transform: Mat4::from_translation(at),
            vertex_buffer_address: 0,
        }
    }

    #[test]
    fn box_inside_the_volume_is_kept() {
        let at = Mat4::from_translation(Vec3::new(0.0, 0.0, 0.5));
        assert!(is_visible(&unit_bounds(), at, Mat4::IDENTITY));
    }

    #[test]
    fn box_behind_the_near_plane_is_rejected() {
        // Clip-space z in [-3.5, -2.5].
        let at = Mat4::from_translation(Vec3::new(0.0, 0.0, -3.0));
        assert!(!is_visible(&unit_bounds(), at, Mat4::IDENTITY));
    }

    #[test]
    fn box_past_a_side_plane_is_rejected() {
        let right = Mat4::from_translation(Vec3::new(2.0, 0.0, 0.5));
        let below = Mat4::from_translation(Vec3::new(0.0, -2.0, 0.5));
        assert!(!is_visible(&unit_bounds(), right, Mat4::IDENTITY));
        assert!(!is_visible(&unit_bounds(), below, Mat4::IDENTITY));
    }

    #[test]
    fn box_straddling_a_plane_is_kept() {
        let edge = Mat4::from_translation(Vec3::new(1.2, 0.0, 0.5));
        assert!(is_visible(&unit_bounds(), edge, Mat4::IDENTITY));
    }

    #[test]
    fn culling_under_a_real_projection() {
        let proj = Mat4::perspective_rh(70f32.to_radians(), 16.0 / 9.0, 10000.0, 0.1);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let view_proj = proj * view;

        let ahead = Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0));
        let behind = Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0));
        assert!(is_visible(&unit_bounds(), ahead, view_proj));
        assert!(!is_visible(&unit_bounds(), behind, view_proj));
    }

    #[test]
    fn opaque_sort_groups_by_material_then_index_buffer() {
        let a = Rc::new(MaterialInstance::default());
        let b = Rc::new(MaterialInstance::default());
        let here = Vec3::new(0.0, 0.0, 0.5);

        let context = DrawContext {
            opaque: vec![
                object(&a, 2, here),
                object(&b, 1, here),
                object(&a, 1, here),
                object(&b, 1, here),
                object(&a, 2, here),
            ],
            transparent: vec![object(&b, 1, here), object(&a, 1, here)],
        };

        let order = build_draw_order(&context, Mat4::IDENTITY, false, true);
        let keys = order.opaque.iter().map(|&i| state_key(&context.opaque[i])).collect::<Vec<_>>();

        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        // Stable within equal keys.
        let a_2 = order.opaque.iter().filter(|&&i| i == 0 || i == 4).copied().collect::<Vec<_>>();
        assert_eq!(a_2, vec![0, 4]);

        // Transparent objects are never reordered.
        assert_eq!(order.transparent, vec![0, 1]);
    }

    #[test]
    fn toggles_disable_cull_and_sort() {
        let a = Rc::new(MaterialInstance::default());
        let b = Rc::new(MaterialInstance::default());

        let context = DrawContext {
            opaque: vec![
                object(&b, 1, Vec3::new(0.0, 0.0, 0.5)),
                object(&a, 1, Vec3::new(0.0, 0.0, -3.0)),
            ],
            transparent: vec![],
        };

        let untouched = build_draw_order(&context, Mat4::IDENTITY, false, false);
        assert_eq!(untouched.opaque, vec![0, 1]);

        let culled = build_draw_order(&context, Mat4::IDENTITY, true, false);
        assert_eq!(culled.opaque, vec![0]);
    }
}
