use crate::{
    core::{
        allocator::{Allocation, Allocator, MemoryUse, ResourceType},
        context::Context,
        image::*,
    },
    deletion::{release_on_error, DeletionQueue},
};

use std::ptr::copy_nonoverlapping as memcpy;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use vulkanalia::prelude::v1_3::*;
use anyhow::{anyhow, Result};
use log::*;

/// A buffer together with the memory backing it.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Allocation,
}

impl AllocatedBuffer {
    /// Copies `bytes` into the buffer's mapped memory at
    /// `offset`. Only host-visible buffers can be written.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mapped = self.allocation.mapped
            .ok_or_else(|| anyhow!("Buffer memory is not host visible."))?;

        if (offset + bytes.len()) as u64 > self.allocation.size {
            return Err(anyhow!(
                "Write of {} bytes at offset {offset} overruns a {}-byte buffer.",
                bytes.len(),
                self.allocation.size,
            ));
        }

        unsafe { memcpy(bytes.as_ptr(), mapped.as_ptr().add(offset), bytes.len()) };
        Ok(())
    }

    /// Destroys the buffer and frees its memory. Must be called
    /// exactly once per buffer.
    pub fn destroy(&self, device: &Device, allocator: &Allocator) {
        unsafe { device.destroy_buffer(self.buffer, None) };
        allocator.free(self.allocation);
    }
}

/// An image, its full view and the memory backing it.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocatedImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Allocation,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub mip_levels: u32,
}

impl AllocatedImage {
    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }

    /// Destroys the view, the image and its memory as one unit.
    pub fn destroy(&self, device: &Device, allocator: &Allocator) {
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
        }
        allocator.free(self.allocation);
    }
}

/// Vertex as fetched by the mesh shaders through the vertex
/// buffer's device address. The texture coordinates are split
/// to keep every field 16-byte aligned.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub uv_x: f32,
    pub normal: Vec3,
    pub uv_y: f32,
    pub color: Vec4,
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, uv: [f32; 2], color: Vec4) -> Self {
        Self {
            position,
            uv_x: uv[0],
            normal,
            uv_y: uv[1],
            color,
        }
    }
}

/// Device-local buffers of an uploaded mesh.
#[derive(Clone, Copy, Debug, Default)]
pub struct GpuMeshBuffers {
    pub index_buffer: AllocatedBuffer,
    pub vertex_buffer: AllocatedBuffer,
    pub vertex_buffer_address: vk::DeviceAddress,
}

impl GpuMeshBuffers {
    pub fn destroy(&self, device: &Device, allocator: &Allocator) {
        self.index_buffer.destroy(device, allocator);
        self.vertex_buffer.destroy(device, allocator);
    }
}

/// Per-draw push constants of the mesh pipelines.
///
/// The matrix forces 16-byte alignment on the whole struct, so
/// the 72 bytes the shader reads are rounded up to 80. The tail
/// is spelled out as `padding` rather than left to the compiler:
/// every byte handed to `cmd_push_constants` has to be
/// initialized, and `Pod` refuses to derive otherwise.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuDrawPushConstants {
    pub world_matrix: Mat4,
    pub vertex_buffer: vk::DeviceAddress,
    pub padding: u64,
}

impl GpuDrawPushConstants {
    pub fn new(world_matrix: Mat4, vertex_buffer: vk::DeviceAddress) -> Self {
        Self {
            world_matrix,
            vertex_buffer,
            padding: 0,
        }
    }
}

pub fn create_buffer(
    context: &Context,
    size: u64,
    usage: vk::BufferUsageFlags,
    memory_use: MemoryUse,
) -> Result<AllocatedBuffer> {
    let device = &context.device;

    let info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.create_buffer(&info, None)? };
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

    let allocation = match context.allocator.allocate(device, requirements, memory_use, ResourceType::Linear) {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    // The buffer only owns a chunk of a shared block, so it is
    // bound at the chunk's offset.
    if let Err(e) = unsafe { device.bind_buffer_memory(buffer, allocation.memory, allocation.offset) } {
        unsafe { device.destroy_buffer(buffer, None) };
        context.allocator.free(allocation);
        return Err(e.into());
    }

    trace!("Buffer created ({size} bytes, {usage:?}).");
    Ok(AllocatedBuffer { buffer, allocation })
}

pub fn destroy_buffer(context: &Context, buffer: &AllocatedBuffer) {
    buffer.destroy(&context.device, &context.allocator);
}

fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT
        | vk::Format::D16_UNORM
        | vk::Format::X8_D24_UNORM_PACK32 => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

pub fn create_image(
    context: &Context,
    extent: vk::Extent3D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    mipmapped: bool,
) -> Result<AllocatedImage> {
    let device = &context.device;

    let mip_levels = if mipmapped {
        mip_levels(extent.width, extent.height)
    } else {
        1
    };

    let info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::_2D)
        .format(format)
        .extent(extent)
        .mip_levels(mip_levels)
        .array_layers(1)
        .samples(vk::SampleCountFlags::_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe { device.create_image(&info, None)? };
    let requirements = unsafe { device.get_image_memory_requirements(image) };

    let allocation = match context.allocator.allocate(device, requirements, MemoryUse::GpuOnly, ResourceType::NonLinear) {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            return Err(e);
        }
    };

    let bound = unsafe { device.bind_image_memory(image, allocation.memory, allocation.offset) }
        .map_err(anyhow::Error::from)
        .and_then(|_| create_image_view(device, image, format, aspect_for(format), mip_levels));

    let view = match bound {
        Ok(view) => view,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            context.allocator.free(allocation);
            return Err(e);
        }
    };

    trace!("Image created ({}x{}, {format:?}, {mip_levels} mips).", extent.width, extent.height);
    Ok(AllocatedImage {
        image,
        view,
        allocation,
        extent,
        format,
        mip_levels,
    })
}

/// Creates a sampled image filled with `data` (tightly packed,
/// four bytes per texel) through a staging buffer and one
/// blocking submission. Mip levels are generated on the GPU when
/// requested.
pub fn create_image_with_data(
    context: &Context,
    data: &[u8],
    extent: vk::Extent3D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    mipmapped: bool,
) -> Result<AllocatedImage> {
    let size = extent.width as usize * extent.height as usize * extent.depth as usize * 4;
    if data.len() < size {
        return Err(anyhow!(
            "Image data holds {} bytes, {size} needed for {}x{}.",
            data.len(),
            extent.width,
            extent.height,
        ));
    }

    let staging = create_buffer(
        context,
        size as u64,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryUse::CpuToGpu,
    )?;

    let image: Result<AllocatedImage> = release_on_error(context, |created: &mut DeletionQueue| {
        staging.write(0, &data[..size])?;

        // Mip generation blits from the image into itself.
        let image = create_image(
            context,
            extent,
            format,
            usage | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
            mipmapped,
        )?;
        created.push(image);

        context.immediate_submit(|device, cb| {
            record_image_upload(device, cb, staging.buffer, &image, mipmapped)
        })?;

        Ok(image)
    });

    // The submission has completed (or failed) by now, so the
    // staging memory can go right away.
    staging.destroy(&context.device, &context.allocator);
    image
}

fn record_image_upload(
    device: &Device,
    cb: vk::CommandBuffer,
    staging: vk::Buffer,
    image: &AllocatedImage,
    mipmapped: bool,
) {
    transition_image(
        device,
        cb,
        image.image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    );

    let subresource = vk::ImageSubresourceLayers::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1);

    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(subresource)
        .image_offset(vk::Offset3D::default())
        .image_extent(image.extent);

    unsafe {
        device.cmd_copy_buffer_to_image(
            cb,
            staging,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        )
    };

    if mipmapped {
        generate_mipmaps(device, cb, image.image, image.extent_2d());
    } else {
        transition_image(
            device,
            cb,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
    }
}

pub fn destroy_image(context: &Context, image: &AllocatedImage) {
    image.destroy(&context.device, &context.allocator);
}

/// Uploads a mesh into device-local buffers through one staging
/// buffer and a single blocking submission.
pub fn upload_mesh(context: &Context, indices: &[u32], vertices: &[Vertex]) -> Result<GpuMeshBuffers> {
    if indices.is_empty() || vertices.is_empty() {
        return Err(anyhow!("Cannot upload an empty mesh."));
    }

    let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
    let index_bytes: &[u8] = bytemuck::cast_slice(indices);
    let vertex_size = vertex_bytes.len() as u64;
    let index_size = index_bytes.len() as u64;

    // Whichever step fails, the device buffers created before it
    // are released on the way out.
    let mesh: Result<GpuMeshBuffers> = release_on_error(context, |created: &mut DeletionQueue| {
        // Vertices are pulled from a storage buffer by address;
        // both buffers stay copyable so their contents can be
        // read back.
        let vertex_buffer = create_buffer(
            context,
            vertex_size,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryUse::GpuOnly,
        )?;
        created.push(vertex_buffer);

        let address_info = vk::BufferDeviceAddressInfo::builder().buffer(vertex_buffer.buffer);
        let vertex_buffer_address = unsafe { context.device.get_buffer_device_address(&address_info) };

        let index_buffer = create_buffer(
            context,
            index_size,
            vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryUse::GpuOnly,
        )?;
        created.push(index_buffer);

        let staging = create_buffer(
            context,
            vertex_size + index_size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryUse::CpuToGpu,
        )?;

        let submitted = staging.write(0, vertex_bytes)
            .and_then(|_| staging.write(vertex_size as usize, index_bytes))
            .and_then(|_| context.immediate_submit(|device, cb| {
                let vertex_copy = vk::BufferCopy::builder()
                    .src_offset(0)
                    .dst_offset(0)
                    .size(vertex_size);

                let index_copy = vk::BufferCopy::builder()
                    .src_offset(vertex_size)
                    .dst_offset(0)
                    .size(index_size);

                unsafe {
                    device.cmd_copy_buffer(cb, staging.buffer, vertex_buffer.buffer, &[vertex_copy]);
                    device.cmd_copy_buffer(cb, staging.buffer, index_buffer.buffer, &[index_copy]);
                }
            }));

        // The staging buffer goes in every case, and before the
        // error is looked at.
        staging.destroy(&context.device, &context.allocator);
        submitted?;

        Ok(GpuMeshBuffers {
            index_buffer,
            vertex_buffer,
            vertex_buffer_address,
        })
    });
    let mesh = mesh?;

    debug!("Mesh uploaded ({} vertices, {} indices).", vertices.len(), indices.len());
    Ok(mesh)
}

/// Copies the first `size` bytes of a device buffer back to the
/// host. Blocks until the copy completes; setup-time only.
pub fn read_buffer(context: &Context, buffer: &AllocatedBuffer, size: u64) -> Result<Vec<u8>> {
    let staging = create_buffer(
        context,
        size,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryUse::GpuToCpu,
    )?;

    let submitted = context.immediate_submit(|device, cb| {
        let region = vk::BufferCopy::builder().size(size);
        unsafe { device.cmd_copy_buffer(cb, buffer.buffer, staging.buffer, &[region]) };
    });

    let bytes = submitted.and_then(|_| {
        let mapped = staging.allocation.mapped
            .ok_or_else(|| anyhow!("Readback memory is not host visible."))?;

        let mut bytes = vec![0u8; size as usize];
        unsafe { memcpy(mapped.as_ptr(), bytes.as_mut_ptr(), bytes.len()) };
        Ok(bytes)
    });

    staging.destroy(&context.device, &context.allocator);
    bytes
}

pub fn create_sampler(device: &Device, filter: vk::Filter) -> Result<vk::Sampler> {
    let info = vk::SamplerCreateInfo::builder()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE);

    Ok(unsafe { device.create_sampler(&info, None)? })
}

const ERROR_IMAGE_SIZE: u32 = 16;

/// 16x16 magenta and black checkerboard, RGBA8.
pub fn checkerboard_pixels() -> Vec<u8> {
    const MAGENTA: [u8; 4] = [255, 0, 255, 255];
    const BLACK: [u8; 4] = [0, 0, 0, 255];

    (0..ERROR_IMAGE_SIZE * ERROR_IMAGE_SIZE)
        .flat_map(|i| {
            let (x, y) = (i % ERROR_IMAGE_SIZE, i / ERROR_IMAGE_SIZE);
            if (x + y) % 2 == 0 { MAGENTA } else { BLACK }
        })
        .collect()
}

/// Placeholder textures and samplers available to every
/// material.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultResources {
    pub white_image: AllocatedImage,
    pub grey_image: AllocatedImage,
    pub black_image: AllocatedImage,
    pub error_image: AllocatedImage,
    pub sampler_linear: vk::Sampler,
    pub sampler_nearest: vk::Sampler,
}

impl DefaultResources {
    pub fn create(context: &Context) -> Result<Self> {
        let texel = vk::Extent3D { width: 1, height: 1, depth: 1 };
        let solid = |rgba: [u8; 4]| create_image_with_data(
            context,
            &rgba,
            texel,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
            false,
        );

        let white_image = solid([255, 255, 255, 255])?;
        let grey_image = solid([168, 168, 168, 255])?;
        let black_image = solid([0, 0, 0, 255])?;

        let error_image = create_image_with_data(
            context,
            &checkerboard_pixels(),
            vk::Extent3D { width: ERROR_IMAGE_SIZE, height: ERROR_IMAGE_SIZE, depth: 1 },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
            false,
        )?;

        let sampler_linear = create_sampler(&context.device, vk::Filter::LINEAR)?;
        let sampler_nearest = create_sampler(&context.device, vk::Filter::NEAREST)?;

        info!("Default resources created.");
        Ok(Self {
            white_image,
            grey_image,
            black_image,
            error_image,
            sampler_linear,
            sampler_nearest,
        })
    }

    /// Hands every default object over to `queue`.
    pub fn defer_destroy(&self, queue: &mut DeletionQueue) {
        for image in [self.white_image, self.grey_image, self.black_image, self.error_image] {
            queue.push(image);
        }
        queue.push(self.sampler_linear);
        queue.push(self.sampler_nearest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_the_shader_block() {
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
        assert_eq!(std::mem::offset_of!(Vertex, uv_x), 12);
        assert_eq!(std::mem::offset_of!(Vertex, normal), 16);
        assert_eq!(std::mem::offset_of!(Vertex, uv_y), 28);
        assert_eq!(std::mem::offset_of!(Vertex, color), 32);
    }

    #[test]
    fn push_constants_fit_the_guaranteed_budget() {
        assert!(std::mem::size_of::<GpuDrawPushConstants>() <= 128);
        assert_eq!(std::mem::offset_of!(GpuDrawPushConstants, vertex_buffer), 64);
    }

    #[test]
    fn push_constants_have_no_hidden_padding() {
        let fields = std::mem::size_of::<Mat4>()
            + std::mem::size_of::<vk::DeviceAddress>()
            + std::mem::size_of::<u64>();
        assert_eq!(std::mem::size_of::<GpuDrawPushConstants>(), fields);

        let constants = GpuDrawPushConstants::new(Mat4::IDENTITY, 0xdead_beef);
        let bytes = bytemuck::bytes_of(&constants);
        assert_eq!(bytes.len(), 80);
        assert_eq!(&bytes[64..72], &0xdead_beef_u64.to_ne_bytes());
        assert!(bytes[72..].iter().all(|&b| b == 0));
    }

    #[test]
    fn checkerboard_alternates_colors() {
        let pixels = checkerboard_pixels();
        assert_eq!(pixels.len(), 16 * 16 * 4);
        assert_eq!(&pixels[0..4], &[255, 0, 255, 255]);
        assert_eq!(&pixels[4..8], &[0, 0, 0, 255]);
        // Second row starts with black.
        assert_eq!(&pixels[64..68], &[0, 0, 0, 255]);
    }

    #[test]
    fn index_bytes_cover_every_element() {
        let indices = [0u32, 1, 2, 2, 1, 3];
        let bytes: &[u8] = bytemuck::cast_slice(&indices);
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[4..8], &1u32.to_ne_bytes());
    }

    #[test]
    fn writes_to_unmapped_buffers_fail() {
        let buffer = AllocatedBuffer::default();
        assert!(buffer.write(0, &[1, 2, 3]).is_err());
    }
}
