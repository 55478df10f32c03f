use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3, Vec4};
use winit::keyboard::KeyCode;

/// Free-flying camera driven by WASD and mouse motion.
#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub position: Vec3,
    /// Movement direction in camera space, each axis in [-1, 1].
    pub velocity: Vec3,
    /// Units per second.
    pub speed: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            speed: 20.0,
            pitch: 0.0,
            yaw: 0.0,
        }
    }
}

impl Camera {
    pub fn new(position: Vec3) -> Self {
        Self { position, ..Default::default() }
    }

    pub fn rotation_matrix(&self) -> Mat4 {
        let pitch = Quat::from_axis_angle(Vec3::X, self.pitch);
        let yaw = Quat::from_axis_angle(Vec3::NEG_Y, self.yaw);
        Mat4::from_quat(yaw) * Mat4::from_quat(pitch)
    }

    pub fn view_matrix(&self) -> Mat4 {
        (Mat4::from_translation(self.position) * self.rotation_matrix()).inverse()
    }

    /// Moves the camera along its current velocity.
    pub fn update(&mut self, delta_seconds: f32) {
        let step = (self.velocity * self.speed * delta_seconds).extend(0.0);
        self.position += (self.rotation_matrix() * step).truncate();
    }

    pub fn process_key(&mut self, key: KeyCode, pressed: bool) {
        let amount = if pressed { 1.0 } else { 0.0 };
        match key {
            KeyCode::KeyW => self.velocity.z = -amount,
            KeyCode::KeyS => self.velocity.z = amount,
            KeyCode::KeyA => self.velocity.x = -amount,
            KeyCode::KeyD => self.velocity.x = amount,
            _ => {}
        }
    }

    pub fn process_mouse(&mut self, dx: f64, dy: f64) {
        self.yaw += dx as f32 / 200.0;
        self.pitch -= dy as f32 / 200.0;
    }
}

/// Reversed-Z perspective projection (near maps to depth 1) with
/// Y flipped to match Vulkan's downward Y axis.
pub fn projection(fov_y_radians: f32, width: u32, height: u32) -> Mat4 {
    let aspect = width as f32 / height.max(1) as f32;
    let mut proj = Mat4::perspective_rh(fov_y_radians, aspect, 10000.0, 0.1);
    proj.y_axis.y *= -1.0;
    proj
}

/// Per-frame uniform block shared by every mesh shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuSceneData {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_proj: Mat4,
    pub ambient_color: Vec4,
    /// `w` holds the sunlight intensity.
    pub sunlight_direction: Vec4,
    pub sunlight_color: Vec4,
}

impl GpuSceneData {
    pub fn new(view: Mat4, proj: Mat4) -> Self {
        Self {
            view,
            proj,
            view_proj: proj * view,
            ambient_color: Vec4::splat(0.1),
            sunlight_direction: Vec4::new(0.0, 1.0, 0.5, 1.0),
            sunlight_color: Vec4::ONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn view_matrix_moves_the_world_opposite_the_camera() {
        let camera = Camera::new(Vec3::new(0.0, 0.0, 5.0));
        let origin = camera.view_matrix().transform_point3(Vec3::ZERO);
        assert!(close(origin, Vec3::new(0.0, 0.0, -5.0)));
    }

    #[test]
    fn forward_follows_the_yaw() {
        let mut camera = Camera::default();
        camera.process_key(KeyCode::KeyW, true);
        camera.update(1.0);
        assert!(close(camera.position, Vec3::new(0.0, 0.0, -20.0)));

        camera.process_key(KeyCode::KeyW, false);
        camera.update(1.0);
        assert!(close(camera.position, Vec3::new(0.0, 0.0, -20.0)));
    }

    #[test]
    fn projection_is_reversed_and_flipped() {
        let proj = projection(70f32.to_radians(), 1600, 900);

        let near = proj * Vec4::new(0.0, 1.0, -0.1, 1.0);
        let far = proj * Vec4::new(0.0, 0.0, -10000.0, 1.0);
        assert!((near.z / near.w - 1.0).abs() < 1e-4);
        assert!((far.z / far.w).abs() < 1e-4);

        // Up in view space is down in clip space.
        assert!(near.y < 0.0);
    }

    #[test]
    fn scene_data_matches_the_uniform_layout() {
        assert_eq!(std::mem::size_of::<GpuSceneData>(), 3 * 64 + 3 * 16);
        let data = GpuSceneData::new(Mat4::IDENTITY, Mat4::from_scale(Vec3::splat(2.0)));
        assert_eq!(data.view_proj, Mat4::from_scale(Vec3::splat(2.0)));
    }
}
