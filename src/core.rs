pub mod allocator;
pub mod commands;
pub mod context;
pub mod devices;
pub mod frame;
pub mod image;
pub mod queues;
pub mod swapchain;
pub mod sync;
