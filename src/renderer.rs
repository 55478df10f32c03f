use crate::{
    background::Background,
    camera::{projection, Camera, GpuSceneData},
    config::RenderSettings,
    core::{
        allocator::MemoryUse,
        commands::begin_one_time,
        context::Context,
        frame::{FrameData, FrameRing},
        image::{copy_image_to_image, transition_image},
        swapchain::Swapchain,
        sync::*,
    },
    culling::build_draw_order,
    deletion::DeletionQueue,
    descriptors::*,
    draw::{record_draws, CommandRecorder, DrawStats},
    loader::{cube_scene, load_obj, LoadedScene},
    material::*,
    resources::*,
    scene::DrawContext,
};

use std::{
    path::Path,
    time::{Duration, Instant},
};

use glam::{vec4, Mat4};
use thiserror::Error;
use winit::window::Window;
use vulkanalia::{
    prelude::v1_3::*,
    vk::KhrSwapchainExtension,
};
use anyhow::Result;
use log::*;

/// Format of the internal color target. Wider than the swapchain
/// so lighting has headroom before the final blit.
pub const DRAW_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

const FIELD_OF_VIEW_DEGREES: f32 = 70.0;

const GLOBAL_DESCRIPTOR_SETS: u32 = 10;
const GLOBAL_DESCRIPTOR_RATIOS: &[PoolSizeRatio] = &[
    PoolSizeRatio::new(vk::DescriptorType::STORAGE_IMAGE, 1.0),
];

const DEFAULT_MATERIAL_RATIOS: &[PoolSizeRatio] = &[
    PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 1.0),
    PoolSizeRatio::new(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2.0),
];

/// Steady-state failures of the frame loop. Both mean the device
/// stopped making progress.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame fence still unsignaled after {0} ns.")]
    FenceTimeout(u64),
    #[error("No swapchain image could be acquired within {0} ns.")]
    AcquireTimeout(u64),
}

/// UI recorded on top of the final image. `target_view` is the
/// acquired swapchain image, in COLOR_ATTACHMENT_OPTIMAL layout.
pub trait Overlay {
    fn record(
        &mut self,
        device: &Device,
        command_buffer: vk::CommandBuffer,
        target_view: vk::ImageView,
        extent: vk::Extent2D,
    );
}

/// Timings (in milliseconds) and counters of the last frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStats {
    pub frame_time: f32,
    pub scene_update_time: f32,
    pub mesh_draw_time: f32,
    pub triangle_count: u32,
    pub drawcall_count: u32,
    pub draw: DrawStats,
}

fn millis(duration: Duration) -> f32 {
    duration.as_secs_f32() * 1000.0
}

/// Internal color and depth targets, recreated with the
/// swapchain.
fn create_render_targets(
    context: &Context,
    extent: vk::Extent2D,
) -> Result<(AllocatedImage, AllocatedImage)> {
    let extent = vk::Extent3D {
        width: extent.width,
        height: extent.height,
        depth: 1,
    };

    let draw_image = create_image(
        context,
        extent,
        DRAW_FORMAT,
        vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::STORAGE
            | vk::ImageUsageFlags::COLOR_ATTACHMENT,
        false,
    )?;

    let depth_image = create_image(
        context,
        extent,
        DEPTH_FORMAT,
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        false,
    )?;

    debug!("Render targets created ({}x{}).", extent.width, extent.height);
    Ok((draw_image, depth_image))
}

/// Owns the device context and everything drawn with it, and runs
/// the per-frame loop.
pub struct Renderer {
    // - Context: device, queue, allocator; destroyed last
    // - Frames: per-slot command buffers, sync objects, deletion
    //   queues and scratch descriptors
    // - Deletion queue: objects living as long as the renderer,
    //   released in reverse order at shutdown
    // - Draw/depth images: internal targets the scene is drawn
    //   into before being blitted to the swapchain
    // - Draw context: render objects of the current frame,
    //   rebuilt every frame
    // - Resize requested: set when the swapchain no longer
    //   matches the surface; the owner of the window calls
    //   `resize` with the new size
    pub context: Context,
    pub settings: RenderSettings,
    pub camera: Camera,
    pub scene_data: GpuSceneData,
    pub stats: EngineStats,
    swapchain: Swapchain,
    frames: FrameRing<FrameData>,
    deletion_queue: DeletionQueue,
    global_descriptors: DescriptorAllocator,
    draw_image: AllocatedImage,
    depth_image: AllocatedImage,
    scene_data_layout: vk::DescriptorSetLayout,
    background: Background,
    materials: MetallicRoughness,
    defaults: DefaultResources,
    default_material: MaterialInstance,
    material_descriptors: DescriptorAllocatorGrowable,
    scenes: Vec<LoadedScene>,
    draw_context: DrawContext,
    resize_requested: bool,
    overlay: Option<Box<dyn Overlay>>,
    last_frame: Instant,
}

impl Renderer {
    pub fn create(window: &Window, settings: RenderSettings) -> Result<Self> {
        let context = Context::create(window)?;
        let device = &context.device;

        let size = window.inner_size();
        let swapchain = Swapchain::create(&context, size.width, size.height, settings.vsync)?;
        let (draw_image, depth_image) = create_render_targets(&context, swapchain.extent)?;

        let frames = FrameRing::try_new(|_| FrameData::create(device, context.graphics_queue_family))?;
        info!("Frame data created.");

        // Everything created from here on that lives as long as
        // the renderer is queued for destruction right away;
        // teardown is then a single flush, newest object first.
        let mut deletion_queue = DeletionQueue::new();

        let global_descriptors = DescriptorAllocator::new(
            device,
            GLOBAL_DESCRIPTOR_SETS,
            GLOBAL_DESCRIPTOR_RATIOS,
        )?;
        global_descriptors.defer_destroy(&mut deletion_queue);

        let scene_data_layout = DescriptorLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
            .build(
                device,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                vk::DescriptorSetLayoutCreateFlags::empty(),
            )?;
        deletion_queue.push(scene_data_layout);

        let background = Background::create(
            device,
            &settings.shader_dir,
            &global_descriptors,
            &draw_image,
        )?;
        background.defer_destroy(&mut deletion_queue);

        let mut materials = MetallicRoughness::build_pipelines(
            device,
            &settings.shader_dir,
            scene_data_layout,
            DRAW_FORMAT,
            DEPTH_FORMAT,
        )?;
        materials.defer_destroy(&mut deletion_queue);

        let defaults = DefaultResources::create(&context)?;
        defaults.defer_destroy(&mut deletion_queue);

        // The default material samples the white image, so the
        // vertex color and constants show through unchanged.
        let constants = MaterialConstants {
            color_factors: vec4(1.0, 1.0, 1.0, 1.0),
            metal_rough_factors: vec4(1.0, 0.5, 0.0, 0.0),
            ..Default::default()
        };
        let default_material_buffer = create_buffer(
            &context,
            std::mem::size_of::<MaterialConstants>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryUse::CpuToGpu,
        )?;
        deletion_queue.push(default_material_buffer);
        default_material_buffer.write(0, bytemuck::bytes_of(&constants))?;

        let mut material_descriptors = DescriptorAllocatorGrowable::new(device, 1, DEFAULT_MATERIAL_RATIOS)?;
        let default_material = materials.write_material(
            device,
            MaterialPass::Opaque,
            &MaterialResources {
                color_image: defaults.white_image,
                color_sampler: defaults.sampler_linear,
                metal_rough_image: defaults.white_image,
                metal_rough_sampler: defaults.sampler_linear,
                data_buffer: default_material_buffer.buffer,
                data_offset: 0,
            },
            &mut material_descriptors,
        )?;

        let mut camera = Camera::default();
        camera.position.z = 5.0;
        let scene_data = GpuSceneData::new(
            camera.view_matrix(),
            projection(FIELD_OF_VIEW_DEGREES.to_radians(), swapchain.extent.width, swapchain.extent.height),
        );

        info!("Renderer created.");
        Ok(Self {
            context,
            settings,
            camera,
            scene_data,
            stats: EngineStats::default(),
            swapchain,
            frames,
            deletion_queue,
            global_descriptors,
            draw_image,
            depth_image,
            scene_data_layout,
            background,
            materials,
            defaults,
            default_material,
            material_descriptors,
            scenes: Vec::new(),
            draw_context: DrawContext::default(),
            resize_requested: false,
            overlay: None,
            last_frame: Instant::now(),
        })
    }

    pub fn resize_requested(&self) -> bool {
        self.resize_requested
    }

    pub fn frame_number(&self) -> u64 {
        self.frames.frame_number()
    }

    pub fn default_material(&self) -> &MaterialInstance {
        &self.default_material
    }

    pub fn set_overlay(&mut self, overlay: Box<dyn Overlay>) {
        self.overlay = Some(overlay);
    }

    /// Loads the OBJ at `path`, or the demo cube scene when no
    /// path is given, and draws it from the next frame on.
    pub fn load_scene(&mut self, path: Option<&Path>) -> Result<()> {
        let loaded = match path {
            Some(path) => load_obj(&self.context, &mut self.materials, &self.defaults, path)?,
            None => cube_scene(&self.context, &mut self.materials, &self.defaults)?,
        };
        self.scenes.push(loaded);
        Ok(())
    }

    /// Recreates the swapchain and the render targets at the new
    /// window size, then clears the resize request.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            // Minimized; keep the request pending.
            return Ok(());
        }

        self.context.wait_idle()?;

        self.swapchain.destroy(&self.context.device);
        self.draw_image.destroy(&self.context.device, &self.context.allocator);
        self.depth_image.destroy(&self.context.device, &self.context.allocator);

        self.swapchain = Swapchain::create(&self.context, width, height, self.settings.vsync)?;
        let (draw_image, depth_image) = create_render_targets(&self.context, self.swapchain.extent)?;
        self.draw_image = draw_image;
        self.depth_image = depth_image;
        self.background.bind_target(&self.context.device, &self.draw_image);

        self.resize_requested = false;
        info!("Resized to {width}x{height}.");
        Ok(())
    }

    /// Refreshes the camera, the scene data and the draw context.
    fn update_scene(&mut self, delta: Duration) {
        self.camera.update(delta.as_secs_f32());

        let extent = self.swapchain.extent;
        let view = self.camera.view_matrix();
        let proj = projection(FIELD_OF_VIEW_DEGREES.to_radians(), extent.width, extent.height);

        self.scene_data.view = view;
        self.scene_data.proj = proj;
        self.scene_data.view_proj = proj * view;

        self.draw_context.clear();
        for loaded in &mut self.scenes {
            loaded.scene.refresh_transforms();
            loaded.scene.draw(Mat4::IDENTITY, &mut self.draw_context);
        }
    }

    /// Draws one frame. Returns early, without submitting, when
    /// the swapchain is out of date.
    pub fn draw(&mut self) -> Result<()> {
        let frame_start = Instant::now();
        let delta = frame_start.duration_since(self.last_frame);
        self.last_frame = frame_start;

        self.update_scene(delta);
        self.stats.scene_update_time = millis(frame_start.elapsed());

        let timeout = self.settings.frame_timeout_ns;

        // Wait until the GPU has retired this slot's previous
        // frame before touching any of its objects.
        let fence = self.frames.current().in_flight_fence;
        let status = unsafe { self.context.device.wait_for_fences(&[fence], true, timeout)? };
        if status == vk::SuccessCode::TIMEOUT {
            return Err(FrameError::FenceTimeout(timeout).into());
        }

        self.frames.current_mut().reclaim(&mut self.context)?;

        let image_available = self.frames.current().image_available_semaphore;
        let result = unsafe {
            self.context.device.acquire_next_image_khr(
                self.swapchain.handle,
                timeout,
                image_available,
                vk::Fence::null(),
            )
        };

        let image_index = match result {
            Ok((_, vk::SuccessCode::TIMEOUT | vk::SuccessCode::NOT_READY)) => {
                return Err(FrameError::AcquireTimeout(timeout).into());
            }
            Ok((index, _)) => index as usize,
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => {
                debug!("Swapchain out of date on acquire, skipping the frame.");
                self.resize_requested = true;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // The fence is only reset once an image was acquired,
        // that is once a submission signaling it again is certain
        // to follow. Resetting it before the acquire and then
        // skipping the frame on an out of date swapchain would
        // leave the slot with an unsignaled fence nobody ever
        // signals, and the next wait on it would never return.
        let command_buffer = self.frames.current().main_buffer;
        unsafe {
            self.context.device.reset_fences(&[fence])?;
            self.context.device.reset_command_buffer(
                command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )?;
        }

        let scene_set = self.upload_scene_data()?;
        self.record(command_buffer, image_index, scene_set)?;
        self.submit(command_buffer)?;
        self.present(image_index)?;

        self.frames.advance();
        self.stats.frame_time = millis(frame_start.elapsed());
        trace!("Frame {} done in {:.2} ms.", self.frames.frame_number(), self.stats.frame_time);

        Ok(())
    }

    /// Writes this frame's scene data into a fresh uniform buffer
    /// and returns the set pointing at it. Both are released when
    /// the slot is reclaimed.
    fn upload_scene_data(&mut self) -> Result<vk::DescriptorSet> {
        let size = std::mem::size_of::<GpuSceneData>() as u64;
        let buffer = create_buffer(
            &self.context,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryUse::CpuToGpu,
        )?;

        let frame = self.frames.current_mut();
        frame.deletion_queue.push(buffer);
        buffer.write(0, bytemuck::bytes_of(&self.scene_data))?;

        let device = &self.context.device;
        let set = frame.descriptors.allocate(device, self.scene_data_layout)?;

        let mut writer = DescriptorWriter::new();
        writer.write_buffer(0, buffer.buffer, size, 0, vk::DescriptorType::UNIFORM_BUFFER);
        writer.update_set(device, set);

        Ok(set)
    }

    fn record(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image_index: usize,
        scene_set: vk::DescriptorSet,
    ) -> Result<()> {
        let draw_extent = vk::Extent2D {
            width: self.draw_image.extent.width.min(self.swapchain.extent.width),
            height: self.draw_image.extent.height.min(self.swapchain.extent.height),
        };
        let frame_number = self.frames.frame_number();

        let device = &self.context.device;
        begin_one_time(device, command_buffer)?;

        transition_image(
            device,
            command_buffer,
            self.draw_image.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        );
        self.background.record(device, command_buffer, &self.draw_image, draw_extent, frame_number);

        transition_image(
            device,
            command_buffer,
            self.draw_image.image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        transition_image(
            device,
            command_buffer,
            self.depth_image.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        );

        self.draw_geometry(command_buffer, scene_set, draw_extent);

        let device = &self.context.device;
        let swapchain_image = self.swapchain.images[image_index];
        let swapchain_view = self.swapchain.image_views[image_index];

        transition_image(
            device,
            command_buffer,
            self.draw_image.image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        transition_image(
            device,
            command_buffer,
            swapchain_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        copy_image_to_image(
            device,
            command_buffer,
            self.draw_image.image,
            swapchain_image,
            draw_extent,
            self.swapchain.extent,
        );

        transition_image(
            device,
            command_buffer,
            swapchain_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        if let Some(overlay) = self.overlay.as_mut() {
            overlay.record(device, command_buffer, swapchain_view, self.swapchain.extent);
        }

        transition_image(
            device,
            command_buffer,
            swapchain_image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        unsafe { device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    /// Culls, sorts and records the scene inside one dynamic
    /// rendering scope over the draw and depth images.
    fn draw_geometry(
        &mut self,
        command_buffer: vk::CommandBuffer,
        scene_set: vk::DescriptorSet,
        extent: vk::Extent2D,
    ) {
        let start = Instant::now();

        let order = build_draw_order(
            &self.draw_context,
            self.scene_data.view_proj,
            self.settings.frustum_culling,
            self.settings.sort_opaque,
        );

        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(self.draw_image.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE);

        // Reversed depth: 0 is the far plane.
        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(self.depth_image.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 0.0, stencil: 0 },
            });

        let color_attachments = &[color_attachment];
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D { offset: vk::Offset2D::default(), extent })
            .layer_count(1)
            .color_attachments(color_attachments)
            .depth_attachment(&depth_attachment);

        let device = &self.context.device;
        unsafe { device.cmd_begin_rendering(command_buffer, &rendering_info) };

        let mut recorder = CommandRecorder::new(device, command_buffer, scene_set, extent);
        let stats = record_draws(&mut recorder, &self.draw_context, &order);

        unsafe { device.cmd_end_rendering(command_buffer) };

        self.stats.draw = stats;
        self.stats.drawcall_count = stats.draw_calls;
        self.stats.triangle_count = stats.triangles;
        self.stats.mesh_draw_time = millis(start.elapsed());
    }

    fn submit(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let frame = self.frames.current();

        // The commands wait for the acquired image to be released
        // by the presentation engine, but only from the color
        // attachment output stage on: the background and the
        // geometry go to the draw image and may start right away,
        // while the swapchain image transition (an all-commands
        // barrier) chains to the wait. The render finished
        // semaphore is signaled once all graphics work is done,
        // for presentation to wait on. The fence goes with the
        // same submission, so the CPU learns when this slot's
        // objects are free again.
        let wait_info = &[semaphore_submit(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            frame.image_available_semaphore,
        )];
        let signal_info = &[semaphore_submit(
            vk::PipelineStageFlags2::ALL_GRAPHICS,
            frame.render_finished_semaphore,
        )];
        let command_buffer_info = &[command_buffer_submit(command_buffer)];

        let submit_info = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(wait_info)
            .signal_semaphore_infos(signal_info)
            .command_buffer_infos(command_buffer_info);

        unsafe {
            self.context.device.queue_submit2(
                self.context.graphics_queue,
                &[submit_info],
                frame.in_flight_fence,
            )?
        };
        Ok(())
    }

    fn present(&mut self, image_index: usize) -> Result<()> {
        let wait_semaphores = &[self.frames.current().render_finished_semaphore];
        let swapchains = &[self.swapchain.handle];
        let image_indices = &[image_index as u32];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(swapchains)
            .image_indices(image_indices);

        let result = unsafe {
            self.context.device.queue_present_khr(self.context.graphics_queue, &present_info)
        };

        match result {
            Ok(vk::SuccessCode::SUBOPTIMAL_KHR) | Err(vk::ErrorCode::OUT_OF_DATE_KHR) => {
                debug!("Swapchain no longer matches the surface.");
                self.resize_requested = true;
            }
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Waits for the device, then releases everything in reverse
    /// creation order.
    pub fn destroy(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            error!("Failed to wait for the device before teardown: {e}");
        }

        for frame in self.frames.iter_mut() {
            frame.destroy(&mut self.context);
        }

        // Objects whose lifetime is not known at creation join
        // the queue now, on top of the ones queued by `create`.
        for mut loaded in self.scenes.drain(..) {
            loaded.defer_destroy(&mut self.deletion_queue);
        }
        self.material_descriptors.defer_destroy(&mut self.deletion_queue);
        self.deletion_queue.push(self.draw_image);
        self.deletion_queue.push(self.depth_image);
        self.swapchain.defer_destroy_views(&mut self.deletion_queue);

        self.deletion_queue.flush(&mut self.context);

        self.swapchain.destroy(&self.context.device);

        self.context.destroy();
        info!("Renderer destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_errors_name_the_timeout() {
        let fence = FrameError::FenceTimeout(1_000_000_000).to_string();
        assert!(fence.contains("1000000000 ns"));

        let acquire = FrameError::AcquireTimeout(5).to_string();
        assert!(acquire.starts_with("No swapchain image"));
    }

    #[test]
    fn millis_converts_durations() {
        assert!((millis(Duration::from_millis(16)) - 16.0).abs() < 1e-3);
        assert_eq!(millis(Duration::ZERO), 0.0);
    }
}
