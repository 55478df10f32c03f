mod app;
mod window;

use lumina::config::RenderSettings;

use std::path::PathBuf;

use winit::event_loop::{ControlFlow, EventLoop};
use anyhow::Result;

use app::App;

fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let settings = RenderSettings::from_env();
    let scene_path = std::env::args_os().nth(1).map(PathBuf::from);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(settings, scene_path);
    event_loop.run_app(&mut app)?;
    Ok(())
}
