use vulkanalia::prelude::v1_3::*;
use anyhow::Result;

/// Number of mip levels for a full chain down to 1x1:
/// `floor(log2(max(width, height))) + 1`.
pub fn mip_levels(width: u32, height: u32) -> u32 {
    width.max(height).max(1).ilog2() + 1
}

pub fn subresource_range(aspects: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::builder()
        .aspect_mask(aspects)
        .base_mip_level(0)
        .level_count(vk::REMAINING_MIP_LEVELS)
        .base_array_layer(0)
        .layer_count(vk::REMAINING_ARRAY_LAYERS)
        .build()
}

pub fn create_image_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspects: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let subresource_range = vk::ImageSubresourceRange::builder()
        .aspect_mask(aspects)
        .base_mip_level(0)
        .level_count(mip_levels)
        .base_array_layer(0)
        .layer_count(1)
        .build();

    let info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::_2D)
        .format(format)
        .subresource_range(subresource_range);

    Ok(unsafe { device.create_image_view(&info, None)? })
}

/// Records a full-image layout transition.
///
/// The barrier waits on every prior command and blocks every
/// following one. That is coarser than per-usage stage masks but
/// the transitions happen a handful of times per frame.
pub fn transition_image(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    // The depth image is the only one ever moved to a depth
    // layout; everything else (draw image, swapchain images,
    // textures) only has a color aspect.
    let aspects = match new_layout {
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    };

    // A barrier does two things here. The execution dependency
    // (the stage masks) makes every command recorded after it
    // wait for the ones recorded before it to finish. The
    // memory dependency (the access masks) makes the writes of
    // the earlier commands available, then visible to the reads
    // and writes of the later ones; without it, a blit could
    // read stale data from a cache the compute shader wrote to.
    // The layout change itself happens in between, once the
    // source side is done with the image and before the
    // destination side touches it. Since the old contents are
    // discarded when the old layout is UNDEFINED, that form is
    // used whenever the previous contents do not matter.
    let barrier = vk::ImageMemoryBarrier2::builder()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range(aspects));

    let barriers = &[barrier];
    let info = vk::DependencyInfo::builder().image_memory_barriers(barriers);

    unsafe { device.cmd_pipeline_barrier2(command_buffer, &info) };
}

fn mip_barrier(
    image: vk::Image,
    level: u32,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> vk::ImageMemoryBarrier2 {
    let range = vk::ImageSubresourceRange::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(level)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
        .build();

    vk::ImageMemoryBarrier2::builder()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .build()
}

fn color_layers(level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(level)
        .base_array_layer(0)
        .layer_count(1)
        .build()
}

fn corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

/// Blits the whole of `source` (in TRANSFER_SRC_OPTIMAL) into the
/// whole of `destination` (in TRANSFER_DST_OPTIMAL), scaling with
/// linear filtering when the extents differ.
pub fn copy_image_to_image(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    source: vk::Image,
    destination: vk::Image,
    source_extent: vk::Extent2D,
    destination_extent: vk::Extent2D,
) {
    let origin = vk::Offset3D::default();
    let region = vk::ImageBlit2::builder()
        .src_offsets([origin, corner(source_extent)])
        .dst_offsets([origin, corner(destination_extent)])
        .src_subresource(color_layers(0))
        .dst_subresource(color_layers(0));

    let regions = &[region];
    let info = vk::BlitImageInfo2::builder()
        .src_image(source)
        .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .dst_image(destination)
        .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .filter(vk::Filter::LINEAR)
        .regions(regions);

    unsafe { device.cmd_blit_image2(command_buffer, &info) };
}

/// Fills mip levels 1.. from level 0 with successive half-size
/// blits. Expects every level in TRANSFER_DST_OPTIMAL and leaves
/// every level in SHADER_READ_ONLY_OPTIMAL.
pub fn generate_mipmaps(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    extent: vk::Extent2D,
) {
    let levels = mip_levels(extent.width, extent.height);
    let mut size = extent;

    for level in 0..levels {
        let half = vk::Extent2D {
            width: (size.width / 2).max(1),
            height: (size.height / 2).max(1),
        };

        // The current level becomes the blit source.
        let barriers = &[mip_barrier(
            image,
            level,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )];
        let info = vk::DependencyInfo::builder().image_memory_barriers(barriers);
        unsafe { device.cmd_pipeline_barrier2(command_buffer, &info) };

        if level + 1 < levels {
            let origin = vk::Offset3D::default();
            let region = vk::ImageBlit2::builder()
                .src_offsets([origin, corner(size)])
                .dst_offsets([origin, corner(half)])
                .src_subresource(color_layers(level))
                .dst_subresource(color_layers(level + 1));

            let regions = &[region];
            let blit = vk::BlitImageInfo2::builder()
                .src_image(image)
                .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .dst_image(image)
                .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .filter(vk::Filter::LINEAR)
                .regions(regions);

            unsafe { device.cmd_blit_image2(command_buffer, &blit) };
            size = half;
        }
    }

    // Every level ended up as a transfer source.
    let barriers = &[vk::ImageMemoryBarrier2::builder()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
        .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR))];
    let info = vk::DependencyInfo::builder().image_memory_barriers(barriers);
    unsafe { device.cmd_pipeline_barrier2(command_buffer, &info) };
}
