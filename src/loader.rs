use crate::{
    core::{allocator::MemoryUse, context::Context},
    deletion::DeletionQueue,
    descriptors::{DescriptorAllocatorGrowable, PoolSizeRatio},
    material::*,
    resources::*,
    scene::*,
};

use std::{
    fs::File,
    path::Path,
    rc::Rc,
};

use glam::{vec3, vec4, Mat4, Vec3, Vec4};
use lazy_static::lazy_static;
use vulkanalia::prelude::v1_3::*;
use anyhow::{anyhow, Result};
use log::*;

const MATERIAL_RATIOS: &[PoolSizeRatio] = &[
    PoolSizeRatio::new(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 3.0),
    PoolSizeRatio::new(vk::DescriptorType::STORAGE_IMAGE, 3.0),
    PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 1.0),
];

/// A scene together with every GPU object created to draw it.
pub struct LoadedScene {
    pub name: String,
    pub scene: Scene,
    images: Vec<AllocatedImage>,
    material_buffer: AllocatedBuffer,
    descriptors: DescriptorAllocatorGrowable,
}

impl LoadedScene {
    pub fn images(&self) -> &[AllocatedImage] {
        &self.images
    }

    /// Queues every GPU object of the scene for destruction. The
    /// scene must not be drawn afterwards.
    pub fn defer_destroy(&mut self, queue: &mut DeletionQueue) {
        for mesh in self.scene.meshes() {
            queue.push(mesh.buffers.index_buffer);
            queue.push(mesh.buffers.vertex_buffer);
        }
        for image in self.images.drain(..) {
            queue.push(image);
        }

        queue.push(self.material_buffer);
        self.material_buffer = AllocatedBuffer::default();
        self.descriptors.defer_destroy(queue);

        debug!("Scene '{}' destroyed.", self.name);
    }
}

/// Material description gathered before any GPU work.
struct MaterialSource {
    constants: MaterialConstants,
    color_image: Option<AllocatedImage>,
    pass: MaterialPass,
}

/// Writes every material's constants into one uniform buffer,
/// then allocates and fills their descriptor sets.
fn build_materials(
    context: &Context,
    materials: &mut MetallicRoughness,
    defaults: &DefaultResources,
    sources: &[MaterialSource],
) -> Result<(AllocatedBuffer, DescriptorAllocatorGrowable, Vec<Rc<MaterialInstance>>)> {
    let stride = std::mem::size_of::<MaterialConstants>();

    let buffer = create_buffer(
        context,
        (stride * sources.len().max(1)) as u64,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        MemoryUse::CpuToGpu,
    )?;

    let mut descriptors = DescriptorAllocatorGrowable::new(
        &context.device,
        sources.len().max(1) as u32,
        MATERIAL_RATIOS,
    )?;

    let mut instances = Vec::with_capacity(sources.len());
    for (i, source) in sources.iter().enumerate() {
        let offset = i * stride;
        buffer.write(offset, bytemuck::bytes_of(&source.constants))?;

        let resources = MaterialResources {
            color_image: source.color_image.unwrap_or(defaults.white_image),
            color_sampler: defaults.sampler_linear,
            metal_rough_image: defaults.white_image,
            metal_rough_sampler: defaults.sampler_linear,
            data_buffer: buffer.buffer,
            data_offset: offset as u64,
        };

        let instance = materials.write_material(&context.device, source.pass, &resources, &mut descriptors)?;
        instances.push(Rc::new(instance));
    }

    Ok((buffer, descriptors, instances))
}

/// Expands decoded PNG samples to tightly packed RGBA8.
pub fn to_rgba8(samples: &[u8], color_type: png::ColorType) -> Result<Vec<u8>> {
    let rgba = match color_type {
        png::ColorType::Rgba => samples.to_vec(),
        png::ColorType::Rgb => samples
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], 255])
            .collect(),
        png::ColorType::Grayscale => samples
            .iter()
            .flat_map(|&g| [g, g, g, 255])
            .collect(),
        png::ColorType::GrayscaleAlpha => samples
            .chunks_exact(2)
            .flat_map(|p| [p[0], p[0], p[0], p[1]])
            .collect(),
        png::ColorType::Indexed => return Err(anyhow!("Indexed PNG data was not expanded.")),
    };
    Ok(rgba)
}

/// Decodes a PNG file to RGBA8, returning the pixels and size.
pub fn load_png(path: &Path) -> Result<(Vec<u8>, u32, u32)> {
    let mut decoder = png::Decoder::new(File::open(path)?);
    decoder.set_transformations(png::Transformations::normalize_to_color8());

    let mut reader = decoder.read_info()?;
    let mut samples = vec![0; reader.output_buffer_size()];
    let info = reader.next_frame(&mut samples)?;

    let pixels = to_rgba8(&samples[..info.buffer_size()], info.color_type)?;
    Ok((pixels, info.width, info.height))
}

fn load_texture(context: &Context, path: &Path) -> Result<AllocatedImage> {
    let (pixels, width, height) = load_png(path)?;
    create_image_with_data(
        context,
        &pixels,
        vk::Extent3D { width, height, depth: 1 },
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::SAMPLED,
        true,
    )
}

/// Converts a single-indexed OBJ mesh into engine vertices.
pub fn obj_vertices(mesh: &tobj::Mesh) -> Vec<Vertex> {
    (0..mesh.positions.len() / 3)
        .map(|i| {
            let position = vec3(mesh.positions[3 * i], mesh.positions[3 * i + 1], mesh.positions[3 * i + 2]);

            let normal = if mesh.normals.len() >= 3 * (i + 1) {
                vec3(mesh.normals[3 * i], mesh.normals[3 * i + 1], mesh.normals[3 * i + 2])
            } else {
                Vec3::Y
            };

            // OBJ texture coordinates start at the bottom.
            let uv = if mesh.texcoords.len() >= 2 * (i + 1) {
                [mesh.texcoords[2 * i], 1.0 - mesh.texcoords[2 * i + 1]]
            } else {
                [0.0, 0.0]
            };

            let color = if mesh.vertex_color.len() >= 3 * (i + 1) {
                vec4(mesh.vertex_color[3 * i], mesh.vertex_color[3 * i + 1], mesh.vertex_color[3 * i + 2], 1.0)
            } else {
                Vec4::ONE
            };

            Vertex::new(position, normal, uv, color)
        })
        .collect()
}

fn material_source(context: &Context, material: &tobj::Material, base: &Path) -> MaterialSource {
    let diffuse = material.diffuse.unwrap_or([1.0, 1.0, 1.0]);
    let alpha = material.dissolve.unwrap_or(1.0);

    let color_image = material.diffuse_texture.as_ref().and_then(|texture| {
        let path = base.join(texture);
        match load_texture(context, &path) {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("Failed to load texture {}: {e}", path.display());
                None
            }
        }
    });

    MaterialSource {
        constants: MaterialConstants {
            color_factors: vec4(diffuse[0], diffuse[1], diffuse[2], alpha),
            ..Default::default()
        },
        color_image,
        pass: if alpha < 1.0 { MaterialPass::Transparent } else { MaterialPass::Opaque },
    }
}

/// Loads an OBJ file and its materials. Each OBJ model becomes a
/// root mesh node with a single surface.
pub fn load_obj(
    context: &Context,
    materials: &mut MetallicRoughness,
    defaults: &DefaultResources,
    path: &Path,
) -> Result<LoadedScene> {
    let (models, obj_materials) = tobj::load_obj(path, &tobj::GPU_LOAD_OPTIONS)?;
    let obj_materials = obj_materials.unwrap_or_else(|e| {
        warn!("No materials for {}: {e}", path.display());
        Vec::new()
    });

    let base = path.parent().unwrap_or_else(|| Path::new("."));

    // The last source is the fallback for models without one.
    let mut sources = obj_materials
        .iter()
        .map(|m| material_source(context, m, base))
        .collect::<Vec<_>>();
    sources.push(MaterialSource {
        constants: MaterialConstants::default(),
        color_image: None,
        pass: MaterialPass::Opaque,
    });

    let images = sources.iter().filter_map(|s| s.color_image).collect::<Vec<_>>();
    let (material_buffer, descriptors, instances) = build_materials(context, materials, defaults, &sources)?;
    let fallback = instances.len() - 1;

    let mut scene = Scene::new();
    for model in &models {
        let mesh = &model.mesh;
        if mesh.indices.is_empty() {
            continue;
        }

        let vertices = obj_vertices(mesh);
        let buffers = upload_mesh(context, &mesh.indices, &vertices)?;

        let material = mesh.material_id.filter(|&id| id < fallback).unwrap_or(fallback);
        let id = scene.add_mesh(MeshAsset {
            name: model.name.clone(),
            surfaces: vec![GeoSurface {
                start_index: 0,
                count: mesh.indices.len() as u32,
                bounds: Bounds::from_points(vertices.iter().map(|v| v.position)),
                material: Rc::clone(&instances[material]),
            }],
            buffers,
        });
        scene.add_node(NodeKind::Mesh(id), Mat4::IDENTITY, None);
    }

    let name = path.display().to_string();
    info!("Loaded {} meshes from {name}.", scene.meshes().len());

    Ok(LoadedScene {
        name,
        scene,
        images,
        material_buffer,
        descriptors,
    })
}

lazy_static! {
    static ref CUBE_VERTICES: Vec<Vertex> = {
        // One quad per face, so each face has its own normal.
        let faces = [
            (Vec3::X, Vec3::Y, Vec3::Z),
            (Vec3::NEG_X, Vec3::Y, Vec3::NEG_Z),
            (Vec3::Y, Vec3::Z, Vec3::X),
            (Vec3::NEG_Y, Vec3::NEG_Z, Vec3::X),
            (Vec3::Z, Vec3::Y, Vec3::NEG_X),
            (Vec3::NEG_Z, Vec3::Y, Vec3::X),
        ];

        faces
            .iter()
            .flat_map(|&(normal, up, right)| {
                [(-1.0, -1.0), (1.0, -1.0), (-1.0, 1.0), (1.0, 1.0)].map(|(u, v)| {
                    let position = (normal + right * u + up * v) * 0.5;
                    Vertex::new(position, normal, [(u + 1.0) / 2.0, (v + 1.0) / 2.0], Vec4::ONE)
                })
            })
            .collect()
    };

    static ref CUBE_INDICES: Vec<u32> = (0..6u32)
        .flat_map(|face| [0, 1, 2, 2, 1, 3].map(|i| face * 4 + i))
        .collect();
}

/// Demo scene: a ring of opaque cubes around a translucent one,
/// all sharing one mesh.
pub fn cube_scene(
    context: &Context,
    materials: &mut MetallicRoughness,
    defaults: &DefaultResources,
) -> Result<LoadedScene> {
    let sources = [
        MaterialSource {
            constants: MaterialConstants::default(),
            color_image: None,
            pass: MaterialPass::Opaque,
        },
        MaterialSource {
            constants: MaterialConstants {
                color_factors: vec4(0.2, 0.6, 1.0, 0.5),
                ..Default::default()
            },
            color_image: None,
            pass: MaterialPass::Transparent,
        },
    ];

    let (material_buffer, descriptors, instances) = build_materials(context, materials, defaults, &sources)?;
    let buffers = upload_mesh(context, &CUBE_INDICES, &CUBE_VERTICES)?;

    let surface = |material: &Rc<MaterialInstance>| GeoSurface {
        start_index: 0,
        count: CUBE_INDICES.len() as u32,
        bounds: Bounds::from_points(CUBE_VERTICES.iter().map(|v| v.position)),
        material: Rc::clone(material),
    };

    // Each asset owns its buffers, so the glass cube gets its
    // own copy of the mesh.
    let glass_buffers = upload_mesh(context, &CUBE_INDICES, &CUBE_VERTICES)?;

    let mut scene = Scene::new();
    let opaque = scene.add_mesh(MeshAsset {
        name: "cube".into(),
        surfaces: vec![surface(&instances[0])],
        buffers,
    });
    let glass = scene.add_mesh(MeshAsset {
        name: "glass cube".into(),
        surfaces: vec![surface(&instances[1])],
        buffers: glass_buffers,
    });

    let root = scene.add_node(NodeKind::Group, Mat4::from_translation(vec3(0.0, 0.0, -8.0)), None);
    for i in 0..8 {
        let angle = i as f32 * std::f32::consts::TAU / 8.0;
        let at = vec3(angle.cos() * 4.0, 0.0, angle.sin() * 4.0);
        scene.add_node(NodeKind::Mesh(opaque), Mat4::from_translation(at), Some(root));
    }
    scene.add_node(NodeKind::Mesh(glass), Mat4::from_scale(Vec3::splat(2.0)), Some(root));

    info!("Demo cube scene created.");
    Ok(LoadedScene {
        name: "cubes".into(),
        scene,
        images: Vec::new(),
        material_buffer,
        descriptors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_mesh_is_closed_and_unit_sized() {
        assert_eq!(CUBE_VERTICES.len(), 24);
        assert_eq!(CUBE_INDICES.len(), 36);
        assert!(CUBE_INDICES.iter().all(|&i| (i as usize) < CUBE_VERTICES.len()));

        let bounds = Bounds::from_points(CUBE_VERTICES.iter().map(|v| v.position));
        assert_eq!(bounds.origin, Vec3::ZERO);
        assert_eq!(bounds.extents, Vec3::splat(0.5));
    }

    #[test]
    fn rgb_and_grey_expand_to_opaque_rgba() {
        let rgb = to_rgba8(&[1, 2, 3, 4, 5, 6], png::ColorType::Rgb).unwrap();
        assert_eq!(rgb, vec![1, 2, 3, 255, 4, 5, 6, 255]);

        let grey = to_rgba8(&[9, 7], png::ColorType::GrayscaleAlpha).unwrap();
        assert_eq!(grey, vec![9, 9, 9, 7]);

        assert!(to_rgba8(&[0], png::ColorType::Indexed).is_err());
    }

    #[test]
    fn obj_vertices_fill_missing_attributes() {
        let mesh = tobj::Mesh {
            positions: vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0],
            texcoords: vec![0.25, 0.0, 0.5, 1.0],
            indices: vec![0, 1, 0],
            ..Default::default()
        };

        let vertices = obj_vertices(&mesh);
        assert_eq!(vertices.len(), 2);
        assert_eq!(vertices[1].position, vec3(1.0, 2.0, 3.0));
        assert_eq!(vertices[0].normal, Vec3::Y);
        assert_eq!((vertices[0].uv_x, vertices[0].uv_y), (0.25, 1.0));
        assert_eq!(vertices[1].color, Vec4::ONE);
    }
}
