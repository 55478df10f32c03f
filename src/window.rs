use crate::app::{fatal, App};

use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::{DeviceEvent, DeviceId, ElementState, MouseButton, WindowEvent},
    event_loop::ActiveEventLoop,
    keyboard::PhysicalKey,
    window::{Window, WindowId},
};

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let (width, height) = self.settings.window_extent;
        let window_attr = Window::default_attributes()
            .with_title("lumina")
            .with_inner_size(LogicalSize::new(width, height));

        let window = event_loop
            .create_window(window_attr)
            .unwrap_or_else(|e| fatal(e.into()));

        if let Err(e) = self.init(window) {
            fatal(e);
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                // The renderer waits for the device to go idle
                // before releasing anything.
                self.destroy();
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                self.minimised = size.width == 0 || size.height == 0;
                if let Some(renderer) = self.renderer.as_mut() {
                    if !self.minimised {
                        if let Err(e) = renderer.resize(size.width, size.height) {
                            fatal(e);
                        }
                    }
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if let (PhysicalKey::Code(code), Some(renderer)) = (event.physical_key, self.renderer.as_mut()) {
                    renderer.camera.process_key(code, event.state == ElementState::Pressed);
                }
            }
            WindowEvent::MouseInput { state, button: MouseButton::Left, .. } => {
                self.mouse_look = state == ElementState::Pressed;
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render() {
                    fatal(e);
                }
            }
            _ => (),
        }
    }

    fn device_event(
        &mut self,
        _: &ActiveEventLoop,
        _: DeviceId,
        event: DeviceEvent,
    ) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            if let (true, Some(renderer)) = (self.mouse_look, self.renderer.as_mut()) {
                renderer.camera.process_mouse(dx, dy);
            }
        }
    }

    fn about_to_wait(&mut self, _: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}
