//! Per-frame data shared by every renderer

use ash::vk;

use crate::foundation::math::{utils, GpuMat4, Mat4, Vec4};
use crate::render::camera::Camera;

/// Camera data uploaded to the scene uniform buffer (set 0, binding 0)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneUniform {
    /// World to view
    pub view: GpuMat4,
    /// View to clip
    pub proj: GpuMat4,
    /// Eye position, w unused
    pub camera_position: [f32; 4],
}

unsafe impl bytemuck::Zeroable for SceneUniform {}
unsafe impl bytemuck::Pod for SceneUniform {}

impl SceneUniform {
    /// Snapshot the camera
    pub fn from_camera(camera: &Camera) -> Self {
        let position = camera.position;
        Self {
            view: utils::to_gpu(&camera.view_matrix()),
            proj: utils::to_gpu(&camera.projection_matrix()),
            camera_position: [position.x, position.y, position.z, 1.0],
        }
    }
}

/// Frustum planes read by the terrain culling shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrustumUniform {
    /// Left, right, bottom, top, near, far
    pub planes: [[f32; 4]; 6],
}

unsafe impl bytemuck::Zeroable for FrustumUniform {}
unsafe impl bytemuck::Pod for FrustumUniform {}

impl FrustumUniform {
    /// Snapshot the camera's planes
    pub fn from_camera(camera: &Camera) -> Self {
        let planes = camera.frustum_planes().map(|plane: Vec4| [plane.x, plane.y, plane.z, plane.w]);
        Self { planes }
    }

    /// Planes expressed in the object space of `model`, renormalized.
    ///
    /// With `p_world = model * p_local`, a world plane `n` becomes `modelᵀ n`,
    /// so boxes stored before `model` is applied can be tested directly.
    pub fn to_local_space(&self, model: &Mat4) -> Self {
        let transpose = model.transpose();
        let planes = self.planes.map(|[x, y, z, w]| {
            let mut local = transpose * Vec4::new(x, y, z, w);
            let length = local.xyz().norm();
            if length > f32::EPSILON {
                local /= length;
            }
            [local.x, local.y, local.z, local.w]
        });
        Self { planes }
    }
}

/// What the orchestrator hands every renderer at construction
#[derive(Debug, Clone)]
pub struct RenderInheritanceData {
    /// Main render pass the graphics secondaries continue
    pub render_pass: vk::RenderPass,
    /// Layout of the scene set, bound as set 0 by every graphics pipeline
    pub scene_layout: vk::DescriptorSetLayout,
    /// Scene set per swapchain image
    pub scene_sets: Vec<vk::DescriptorSet>,
    /// Swapchain extent
    pub extent: vk::Extent2D,
    /// Swapchain image count
    pub image_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layouts_match_std140() {
        assert_eq!(std::mem::size_of::<SceneUniform>(), 144);
        assert_eq!(std::mem::size_of::<FrustumUniform>(), 96);
    }

    use crate::foundation::math::{Transform, Vec3};

    // Same test as the culling shader: the most positive corner must not be behind any plane
    fn box_visible(frustum: &FrustumUniform, min: [f32; 3], max: [f32; 3]) -> bool {
        frustum.planes.iter().all(|plane| {
            let corner: [f32; 3] = std::array::from_fn(|axis| if plane[axis] >= 0.0 { max[axis] } else { min[axis] });
            plane[0] * corner[0] + plane[1] * corner[1] + plane[2] * corner[2] + plane[3] >= 0.0
        })
    }

    #[test]
    fn test_translated_terrain_is_culled_in_its_own_space() {
        let mut camera = Camera::perspective(Vec3::new(1008.0, 10.0, -20.0), 60.0, 16.0 / 9.0, 0.1, 500.0);
        camera.look_at(Vec3::new(1008.0, 0.0, 8.0));
        let world = FrustumUniform::from_camera(&camera);
        let model = Transform::from_position(Vec3::new(1000.0, 0.0, 0.0)).to_matrix();

        // Region box before the terrain transform is applied
        let (min, max) = ([0.0, -5.0, 0.0], [16.0, 5.0, 16.0]);
        assert!(!box_visible(&world, min, max));
        assert!(box_visible(&world.to_local_space(&model), min, max));

        // A region far behind the camera stays culled after the move
        let behind = ([0.0, -5.0, -200.0], [16.0, 5.0, -184.0]);
        assert!(!box_visible(&world.to_local_space(&model), behind.0, behind.1));
    }

    #[test]
    fn test_identity_transform_keeps_planes() {
        let world = FrustumUniform::from_camera(&Camera::default());
        let local = world.to_local_space(&Mat4::identity());
        for (a, b) in world.planes.iter().zip(&local.planes) {
            for axis in 0..4 {
                approx::assert_relative_eq!(a[axis], b[axis], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_scene_uniform_captures_eye() {
        let camera = Camera::default();
        let uniform = SceneUniform::from_camera(&camera);
        assert_eq!(&uniform.camera_position[..3], camera.position.as_slice());
    }
}
