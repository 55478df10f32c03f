use lumina::{config::RenderSettings, renderer::Renderer};

use std::path::PathBuf;

use winit::window::Window;
use anyhow::Result;
use log::*;

/// The demo application: one window, one renderer, one scene.
pub struct App {
    // - Window: created on the first `resumed` event
    // - Renderer: created together with the window
    // - Scene path: OBJ file to load, or none for the demo cubes
    // - Minimised: no frames are drawn while the window has a
    //   zero-sized surface
    // - Mouse look: camera rotation follows the mouse while the
    //   left button is held
    pub window: Option<Window>,
    pub renderer: Option<Renderer>,
    pub settings: RenderSettings,
    pub scene_path: Option<PathBuf>,
    pub minimised: bool,
    pub mouse_look: bool,
}

impl App {
    pub fn new(settings: RenderSettings, scene_path: Option<PathBuf>) -> Self {
        Self {
            window: None,
            renderer: None,
            settings,
            scene_path,
            minimised: false,
            mouse_look: false,
        }
    }

    pub fn init(&mut self, window: Window) -> Result<()> {
        let mut renderer = Renderer::create(&window, self.settings.clone())?;
        renderer.load_scene(self.scene_path.as_deref())?;

        self.renderer = Some(renderer);
        self.window = Some(window);
        info!("App initialised.");
        Ok(())
    }

    pub fn render(&mut self) -> Result<()> {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return Ok(());
        };

        if renderer.resize_requested() {
            let size = window.inner_size();
            renderer.resize(size.width, size.height)?;
        }
        if self.minimised {
            return Ok(());
        }

        renderer.draw()?;
        window.request_redraw();
        Ok(())
    }

    pub fn destroy(&mut self) {
        if let Some(mut renderer) = self.renderer.take() {
            let stats = renderer.stats;
            debug!(
                "Last frame: {:.2} ms, {} draws, {} triangles.",
                stats.frame_time,
                stats.drawcall_count,
                stats.triangle_count,
            );
            renderer.destroy();
        }
        info!("Destroyed the app.");
    }
}

/// Logs `error` and aborts. Device failures past initialisation
/// are not recoverable.
pub fn fatal(error: anyhow::Error) -> ! {
    error!("Fatal: {error:?}");
    std::process::abort()
}
