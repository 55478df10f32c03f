use crate::{
    material::{MaterialInstance, MaterialPass},
    resources::GpuMeshBuffers,
};

use std::rc::Rc;

use glam::{Mat4, Vec3};
use vulkanalia::prelude::v1_3::*;

/// Axis-aligned bounds of a surface in model space, with the
/// radius of the enclosing sphere.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bounds {
    pub origin: Vec3,
    pub extents: Vec3,
    pub sphere_radius: f32,
}

impl Bounds {
    /// Bounds of a point set; empty sets give zero-sized bounds
    /// at the origin.
    pub fn from_points<I: IntoIterator<Item = Vec3>>(points: I) -> Self {
        let mut points = points.into_iter();
        let Some(first) = points.next() else {
            return Self::default();
        };

        let (min, max) = points.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));
        let extents = (max - min) / 2.0;

        Self {
            origin: (max + min) / 2.0,
            extents,
            sphere_radius: extents.length(),
        }
    }
}

/// A range of a mesh's indices drawn with one material.
#[derive(Clone, Debug)]
pub struct GeoSurface {
    pub start_index: u32,
    pub count: u32,
    pub bounds: Bounds,
    pub material: Rc<MaterialInstance>,
}

#[derive(Clone, Debug)]
pub struct MeshAsset {
    pub name: String,
    pub surfaces: Vec<GeoSurface>,
    pub buffers: GpuMeshBuffers,
}

/// One draw, flattened out of the scene for the current frame.
#[derive(Clone, Debug)]
pub struct RenderObject {
    pub index_count: u32,
    pub first_index: u32,
    pub index_buffer: vk::Buffer,
    pub bounds: Bounds,
    pub material: Rc<MaterialInstance>,
    pub transform: Mat4,
    pub vertex_buffer_address: vk::DeviceAddress,
}

/// Render objects of one frame, split by pass.
#[derive(Default, Debug)]
pub struct DrawContext {
    pub opaque: Vec<RenderObject>,
    pub transparent: Vec<RenderObject>,
}

impl DrawContext {
    pub fn clear(&mut self) {
        self.opaque.clear();
        self.transparent.clear();
    }

    pub fn len(&self) -> usize {
        self.opaque.len() + self.transparent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Group,
    Mesh(MeshId),
}

#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    /// Back-link only; the parent owns nothing through it.
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub local_transform: Mat4,
    /// Cached by [`Scene::refresh_transforms`].
    pub world_transform: Mat4,
}

/// Scene graph stored as an arena. Nodes are never removed, so
/// ids stay valid for the lifetime of the scene.
#[derive(Default, Debug)]
pub struct Scene {
    nodes: Vec<Node>,
    meshes: Vec<MeshAsset>,
    roots: Vec<NodeId>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mesh(&mut self, mesh: MeshAsset) -> MeshId {
        self.meshes.push(mesh);
        MeshId(self.meshes.len() - 1)
    }

    /// Adds a node under `parent`, or as a new root.
    pub fn add_node(&mut self, kind: NodeKind, local_transform: Mat4, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent,
            children: Vec::new(),
            local_transform,
            world_transform: local_transform,
        });

        match parent {
            Some(parent) => self.nodes[parent.0].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn mesh(&self, id: MeshId) -> &MeshAsset {
        &self.meshes[id.0]
    }

    pub fn meshes(&self) -> &[MeshAsset] {
        &self.meshes
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn set_local_transform(&mut self, id: NodeId, transform: Mat4) {
        self.nodes[id.0].local_transform = transform;
    }

    /// Recomputes every cached world transform, parents before
    /// children.
    pub fn refresh_transforms(&mut self) {
        let mut stack = self
            .roots
            .iter()
            .rev()
            .map(|&id| (id, Mat4::IDENTITY))
            .collect::<Vec<_>>();

        while let Some((id, parent_matrix)) = stack.pop() {
            let node = &mut self.nodes[id.0];
            node.world_transform = parent_matrix * node.local_transform;

            let world = node.world_transform;
            stack.extend(node.children.iter().rev().map(|&child| (child, world)));
        }
    }

    /// Flattens every mesh surface into `context`, with `top`
    /// applied on top of the cached world transforms.
    pub fn draw(&self, top: Mat4, context: &mut DrawContext) {
        for node in &self.nodes {
            let NodeKind::Mesh(mesh) = node.kind else {
                continue;
            };

            let mesh = &self.meshes[mesh.0];
            let transform = top * node.world_transform;

            for surface in &mesh.surfaces {
                let object = RenderObject {
                    index_count: surface.count,
                    first_index: surface.start_index,
                    index_buffer: mesh.buffers.index_buffer.buffer,
                    bounds: surface.bounds,
                    material: Rc::clone(&surface.material),
                    transform,
                    vertex_buffer_address: mesh.buffers.vertex_buffer_address,
                };

                match surface.material.pass {
                    MaterialPass::Opaque => context.opaque.push(object),
                    MaterialPass::Transparent => context.transparent.push(object),
                }
            }
        }
    }
}
