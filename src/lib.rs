pub mod background;
pub mod camera;
pub mod config;
pub mod core;
pub mod culling;
pub mod deletion;
pub mod descriptors;
pub mod draw;
pub mod loader;
pub mod material;
pub mod pipeline;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod shaders;
