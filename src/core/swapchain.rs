use crate::{
    core::{context::Context, image::create_image_view},
    deletion::DeletionQueue,
};

use vulkanalia::{
    prelude::v1_3::*,
    vk::{KhrSurfaceExtension, KhrSwapchainExtension},
};

use log::*;
use anyhow::Result;

pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

pub fn get_swapchain_support(
    instance: &Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<SwapchainSupport> {
    Ok(SwapchainSupport {
        capabilities: unsafe {
            instance.get_physical_device_surface_capabilities_khr(physical_device, surface)?
        },
        formats: unsafe {
            instance.get_physical_device_surface_formats_khr(physical_device, surface)?
        },
        present_modes: unsafe {
            instance.get_physical_device_surface_present_modes_khr(physical_device, surface)?
        },
    })
}

fn get_swapchain_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> vk::SurfaceFormatKHR {
    // The internal draw image is blitted into the swapchain, so
    // a UNORM target keeps the blit a plain copy.
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
            && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .cloned()
        .unwrap_or(formats[0])
}

fn get_swapchain_present_mode(
    present_modes: &[vk::PresentModeKHR],
    vsync: bool,
) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    present_modes
        .iter()
        .cloned()
        .find(|&m| m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn get_swapchain_extent(
    width: u32,
    height: u32,
    capabilities: vk::SurfaceCapabilitiesKHR,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D::builder()
            .width(width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ))
            .height(height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ))
            .build()
    }
}

/// Presentable images tied to the context's surface. Recreated
/// whenever the surface goes out of date.
#[derive(Default)]
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub format: vk::Format,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn create(
        context: &Context,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Self> {
        let support = get_swapchain_support(
            &context.instance,
            context.surface,
            context.physical_device,
        )?;

        let surface_format = get_swapchain_surface_format(&support.formats);
        let present_mode = get_swapchain_present_mode(&support.present_modes, vsync);
        let extent = get_swapchain_extent(width, height, support.capabilities);

        let mut image_count = support.capabilities.min_image_count + 1;
        if support.capabilities.max_image_count != 0
            && image_count > support.capabilities.max_image_count {
            image_count = support.capabilities.max_image_count;
        }

        let queue_family_indices = &[context.graphics_queue_family];
        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(context.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(queue_family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        let device = &context.device;
        let handle = unsafe { device.create_swapchain_khr(&info, None)? };
        let images = unsafe { device.get_swapchain_images_khr(handle)? };

        let image_views = images
            .iter()
            .map(|&i| create_image_view(
                device,
                i,
                surface_format.format,
                vk::ImageAspectFlags::COLOR,
                1,
            ))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "Swapchain created ({}x{}, {:?}, {} images).",
            extent.width,
            extent.height,
            present_mode,
            images.len(),
        );

        Ok(Self {
            handle,
            format: surface_format.format,
            images,
            image_views,
            extent,
        })
    }

    /// Queues the image views for destruction; the swapchain
    /// itself still has to be destroyed afterwards.
    pub fn defer_destroy_views(&mut self, queue: &mut DeletionQueue) {
        for view in self.image_views.drain(..) {
            queue.push(view);
        }
    }

    pub fn destroy(&mut self, device: &Device) {
        self.image_views
            .drain(..)
            .for_each(|v| unsafe { device.destroy_image_view(v, None) });

        unsafe { device.destroy_swapchain_khr(self.handle, None) };
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();

        info!("Destroyed the swapchain and related objects.");
    }
}
