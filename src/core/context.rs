use crate::{
    core::{
        allocator::Allocator,
        commands::ImmediateSubmit,
        devices::*,
    },
    deletion::{Disposable, Release},
};

use std::collections::HashSet;

use winit::window::Window;
use vulkanalia::{
    prelude::v1_3::*,
    window as vk_window,
    loader::{LibloadingLoader, LIBRARY},
    Version,
    vk::ExtDebugUtilsExtension,
    vk::KhrSurfaceExtension,
    vk::Handle,
};
use anyhow::{anyhow, Result};
use log::*;

pub const VALIDATION_ENABLED: bool = cfg!(debug_assertions);
pub const VALIDATION_LAYER: vk::ExtensionName = vk::ExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation");
pub const PORTABILITY_MACOS_VERSION: Version = Version::new(1, 3, 216);

/// Everything tied to the lifetime of the Vulkan device: the
/// instance, the (optional) surface, the device and its graphics
/// queue, the memory allocator and the immediate submit objects.
///
/// The context is created once and torn down last; renderer
/// state that depends on it is destroyed before
/// [`Context::destroy`] is called.
pub struct Context {
    // - Entry: the loaded Vulkan library, kept alive for as long
    //   as the instance exists
    // - Surface: null when the context renders offscreen only
    //   (tests, tools); no swapchain can be created then
    // - Immediate: blocking submission path for uploads
    pub entry: Entry,
    pub instance: Instance,
    pub debug_messenger: vk::DebugUtilsMessengerEXT,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub allocator: Allocator,
    pub immediate: ImmediateSubmit,
}

impl Context {
    /// Creates a context presenting to `window`.
    pub fn create(window: &Window) -> Result<Self> {
        Self::init(Some(window))
    }

    /// Creates a context without a surface, for offscreen work.
    pub fn create_headless() -> Result<Self> {
        Self::init(None)
    }

    fn init(window: Option<&Window>) -> Result<Self> {
        let loader = unsafe { LibloadingLoader::new(LIBRARY)? };
        let entry = unsafe { Entry::new(loader) }.map_err(|b| anyhow!("{}", b))?;

        let (instance, debug_messenger) = create_instance(window, &entry)?;

        let surface = match window {
            Some(window) => {
                let surface = unsafe { vk_window::create_surface(&instance, window, window)? };
                info!("Surface created.");
                surface
            }
            None => vk::SurfaceKHR::null(),
        };

        let (physical_device, graphics_queue_family) = pick_physical_device(&instance, surface)?;
        let (device, graphics_queue) = create_logical_device(
            &entry,
            &instance,
            physical_device,
            graphics_queue_family,
            surface,
        )?;

        let allocator = Allocator::new(&instance, physical_device);
        let immediate = ImmediateSubmit::create(&device, graphics_queue_family)?;

        Ok(Self {
            entry,
            instance,
            debug_messenger,
            surface,
            physical_device,
            device,
            graphics_queue,
            graphics_queue_family,
            allocator,
            immediate,
        })
    }

    pub fn is_headless(&self) -> bool {
        self.surface.is_null()
    }

    /// Runs `record` on the graphics queue and blocks until it
    /// has completed.
    pub fn immediate_submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer),
    {
        self.immediate.submit(&self.device, self.graphics_queue, record)
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    pub fn destroy(&mut self) {
        self.immediate.destroy(&self.device);
        self.allocator.destroy(&self.device);

        unsafe {
            self.device.destroy_device(None);

            if !self.surface.is_null() {
                self.instance.destroy_surface_khr(self.surface, None);
            }

            if VALIDATION_ENABLED {
                self.instance.destroy_debug_utils_messenger_ext(self.debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
        info!("Destroyed the Vulkan instance.");
    }
}

impl Release<Disposable> for Context {
    fn release(&mut self, resource: Disposable) {
        self.dispose(resource);
    }
}

impl Release<Disposable> for &Context {
    fn release(&mut self, resource: Disposable) {
        self.dispose(resource);
    }
}

impl Context {
    /// Destroys a deferred object right away. The device must no
    /// longer be using it.
    pub fn dispose(&self, resource: Disposable) {
        let device = &self.device;
        match resource {
            Disposable::Buffer(buffer) => buffer.destroy(device, &self.allocator),
            Disposable::Image(image) => image.destroy(device, &self.allocator),
            Disposable::ImageView(view) => unsafe { device.destroy_image_view(view, None) },
            Disposable::Sampler(sampler) => unsafe { device.destroy_sampler(sampler, None) },
            Disposable::DescriptorPool(pool) => unsafe { device.destroy_descriptor_pool(pool, None) },
            Disposable::DescriptorSetLayout(layout) => unsafe {
                device.destroy_descriptor_set_layout(layout, None)
            },
            Disposable::Pipeline(pipeline) => unsafe { device.destroy_pipeline(pipeline, None) },
            Disposable::PipelineLayout(layout) => unsafe {
                device.destroy_pipeline_layout(layout, None)
            },
        }
    }
}

fn create_instance(
    window: Option<&Window>,
    entry: &Entry,
) -> Result<(Instance, vk::DebugUtilsMessengerEXT)> {
    // Validation layers are only checked for (and enabled) in
    // debug builds; a missing layer there is an error rather
    // than a silent downgrade.
    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? }
        .iter()
        .map(|l| l.layer_name)
        .collect::<HashSet<_>>();

    if VALIDATION_ENABLED && !available_layers.contains(&VALIDATION_LAYER) {
        return Err(anyhow!("Validation layer not available."));
    }

    let layers = if VALIDATION_ENABLED {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let application_info = vk::ApplicationInfo::builder()
        .application_name(b"lumina-app\0")
        .application_version(vk::make_version(1, 0, 0))
        .engine_name(b"lumina\0")
        .engine_version(vk::make_version(1, 0, 0))
        .api_version(vk::make_version(1, 3, 0));

    // Window integration extensions, when there is a window.
    let mut extensions = match window {
        Some(window) => vk_window::get_required_instance_extensions(window)
            .iter()
            .map(|e| e.as_ptr())
            .collect::<Vec<_>>(),
        None => Vec::new(),
    };

    if VALIDATION_ENABLED {
        extensions.push(vk::EXT_DEBUG_UTILS_EXTENSION.name.as_ptr());
    }

    // Non-conformant implementations (MoltenVK) are only listed
    // when portability enumeration is requested, starting with
    // 1.3.216.
    let flags = if
        cfg!(target_os = "macos") &&
        entry.version()? >= PORTABILITY_MACOS_VERSION
    {
        info!("Enabling extensions for macOS portability.");
        extensions.push(vk::KHR_GET_PHYSICAL_DEVICE_PROPERTIES2_EXTENSION.name.as_ptr());
        extensions.push(vk::KHR_PORTABILITY_ENUMERATION_EXTENSION.name.as_ptr());

        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    }
    else {
        vk::InstanceCreateFlags::empty()
    };

    let mut info = vk::InstanceCreateInfo::builder()
        .application_info(&application_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions)
        .flags(flags);

    let mut debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::all())
        .message_type(vk::DebugUtilsMessageTypeFlagsEXT::all())
        .user_callback(Some(debug_callback));

    if VALIDATION_ENABLED {
        // Chaining the messenger info also covers messages
        // emitted during instance creation and destruction.
        info = info.push_next(&mut debug_info);
    }

    let instance = unsafe { entry.create_instance(&info, None)? };

    let debug_messenger = if VALIDATION_ENABLED {
        unsafe { instance.create_debug_utils_messenger_ext(&debug_info, None)? }
    } else {
        vk::DebugUtilsMessengerEXT::null()
    };

    info!("Vulkan instance created.");
    Ok((instance, debug_messenger))
}

/// Forwards validation layer messages to the log, mapping the
/// Vulkan severity onto log levels.
extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    type_: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let data = unsafe { *data };
    let message = unsafe { std::ffi::CStr::from_ptr(data.message) }.to_string_lossy();

    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        error!("({type_:?}) {message}");
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        warn!("({type_:?}) {message}");
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        debug!("({type_:?}) {message}");
    } else {
        trace!("({type_:?}) {message}");
    }

    // Returning true would abort the triggering call.
    vk::FALSE
}
