use serde::{Deserialize, Serialize};
use ultraviolet::{projection, Mat4, Vec3};

use crate::render::{shader_types, Viewport};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CameraSettings {
    pub z_near: f32,
    pub z_far: f32,
    /// Vertical field of view.
    pub fov_y_degrees: f32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            z_near: 0.1,
            z_far: 100.0,
            fov_y_degrees: 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub focal_point: Vec3,
    pub look_at: Vec3,
    pub up: Vec3,
    pub settings: CameraSettings,
    pub viewport: Viewport,
}

impl Camera {
    pub fn new(
        focal_point: Vec3,
        look_at: Vec3,
        up: Vec3,
        settings: CameraSettings,
        viewport: Viewport,
    ) -> Self {
        Self {
            focal_point,
            look_at,
            up,
            settings,
            viewport,
        }
    }

    /// Positions the camera
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at(self.focal_point, self.look_at, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        projection::rh_yup::perspective_vk(
            self.settings.fov_y_degrees.to_radians(),
            self.viewport.aspect_ratio(),
            self.settings.z_near,
            self.settings.z_far,
        )
    }

    /// in world-space
    pub fn forward(&self) -> Vec3 {
        (self.look_at - self.focal_point).normalized()
    }

    pub fn constants(&self) -> shader_types::Camera {
        let view = self.view_matrix();
        let proj = self.projection_matrix();
        shader_types::Camera {
            view,
            proj,
            view_inv: view.inversed(),
            proj_inv: proj.inversed(),
            position: self.focal_point,
            z_near: self.settings.z_near,
            z_far: self.settings.z_far,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ultraviolet::Vec4;

    fn camera() -> Camera {
        Camera::new(
            Vec3::new(0.0, 0.0, 2.0),
            Vec3::zero(),
            Vec3::unit_y(),
            CameraSettings::default(),
            Viewport::new(64, 32),
        )
    }

    #[test]
    fn inverse_view_recovers_the_focal_point() {
        let constants = camera().constants();
        let origin = constants.view_inv * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!((origin.xyz() - Vec3::new(0.0, 0.0, 2.0)).mag() < 1e-5);
    }

    #[test]
    fn looks_towards_the_target() {
        let camera = camera();
        assert!((camera.forward() - Vec3::new(0.0, 0.0, -1.0)).mag() < 1e-6);
        // The image center maps onto the view direction.
        let constants = camera.constants();
        let target = constants.proj_inv * Vec4::new(0.0, 0.0, 0.5, 1.0);
        let direction = (target.xyz() / target.w).normalized();
        assert!((direction - Vec3::new(0.0, 0.0, -1.0)).mag() < 1e-4);
    }
}
