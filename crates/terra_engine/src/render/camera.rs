//! Perspective camera and frustum extraction

use crate::foundation::math::{Mat4, Mat4Ext, Vec3, Vec4};

/// Perspective camera looking from `position` at `target`
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    /// Eye position in world space
    pub position: Vec3,
    /// Point the camera looks at
    pub target: Vec3,
    /// World up direction
    pub up: Vec3,
    /// Vertical field of view in radians
    pub fov: f32,
    /// Width over height
    pub aspect: f32,
    /// Near clip distance
    pub near: f32,
    /// Far clip distance
    pub far: f32,
}

impl Camera {
    /// Create a perspective camera
    pub fn perspective(position: Vec3, fov_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            position,
            target: Vec3::zeros(),
            up: Vec3::y(),
            fov: fov_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    /// Move the eye
    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    /// Point the camera at `target`
    pub fn look_at(&mut self, target: Vec3) {
        self.target = target;
    }

    /// Update the aspect ratio from a framebuffer size
    pub fn set_aspect_ratio(&mut self, width: u32, height: u32) {
        if height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    /// World to view
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at(self.position, self.target, self.up)
    }

    /// View to clip, including the flip into Vulkan's Y-down convention
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective(self.fov, self.aspect, self.near, self.far) * Mat4::vulkan_coordinate_transform()
    }

    /// Six normalized planes (left, right, bottom, top, near, far) with inward normals.
    ///
    /// A point `p` is inside plane `n` when `n.xyz · p + n.w >= 0`.
    pub fn frustum_planes(&self) -> [Vec4; 6] {
        let m = self.projection_matrix() * self.view_matrix();
        let row = |i: usize| -> Vec4 { m.row(i).transpose() };
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));

        // Clip space is -w <= x,y <= w and 0 <= z <= w
        let mut planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2];
        for plane in &mut planes {
            let length = plane.xyz().norm();
            if length > f32::EPSILON {
                *plane /= length;
            }
        }
        planes
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::perspective(Vec3::new(0.0, 2.0, 5.0), 60.0, 16.0 / 9.0, 0.1, 500.0)
    }
}

/// Signed distance from `point` to a normalized plane
pub fn plane_distance(plane: &Vec4, point: &Vec3) -> f32 {
    plane.xyz().dot(point) + plane.w
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> Camera {
        let mut camera = Camera::perspective(Vec3::new(0.0, 0.0, 10.0), 60.0, 1.0, 0.1, 50.0);
        camera.look_at(Vec3::zeros());
        camera
    }

    fn inside(planes: &[Vec4; 6], point: Vec3) -> bool {
        planes.iter().all(|plane| plane_distance(plane, &point) >= 0.0)
    }

    #[test]
    fn test_point_in_front_is_inside() {
        let planes = camera().frustum_planes();
        assert!(inside(&planes, Vec3::zeros()));
        assert!(inside(&planes, Vec3::new(1.0, 1.0, 0.0)));
    }

    #[test]
    fn test_point_behind_camera_is_outside() {
        let planes = camera().frustum_planes();
        assert!(!inside(&planes, Vec3::new(0.0, 0.0, 12.0)));
    }

    #[test]
    fn test_point_beyond_far_plane_is_outside() {
        let planes = camera().frustum_planes();
        assert!(!inside(&planes, Vec3::new(0.0, 0.0, -45.0)));
        assert!(inside(&planes, Vec3::new(0.0, 0.0, -35.0)));
    }

    #[test]
    fn test_point_far_to_the_side_is_outside() {
        let planes = camera().frustum_planes();
        assert!(!inside(&planes, Vec3::new(30.0, 0.0, 0.0)));
        assert!(!inside(&planes, Vec3::new(0.0, -30.0, 0.0)));
    }

    #[test]
    fn test_planes_are_normalized() {
        for plane in camera().frustum_planes() {
            assert_relative_eq!(plane.xyz().norm(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_near_plane_distance_matches_clip_distance() {
        let planes = camera().frustum_planes();
        // Eye at z=10 looking down -z, so the near plane sits at z=9.9
        assert_relative_eq!(plane_distance(&planes[4], &Vec3::new(0.0, 0.0, 9.9)), 0.0, epsilon = 1e-3);
    }
}
