//! Region grid arithmetic and CPU-side terrain generation
//!
//! The streamed area is a square of `proximity_width` x `proximity_width`
//! regions centred on the camera's region. Each region is a
//! `region_size` x `region_size` quad grid with its own vertices; all regions
//! share one index list and differ only by vertex offset.

use crate::assets::model::grid_indices;
use crate::config::TerrainConfig;
use crate::foundation::math::Vec3;
use crate::render::vertex::Vertex;

/// Derived region constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerrainLayout {
    /// Quads per region side
    pub region_size: u32,
    /// Regions kept on each side of the centre region
    pub proximity_radius: u32,
    /// `region_size^2 * 6`
    pub indices_per_region: u32,
    /// `(region_size + 1)^2`
    pub vertices_per_region: u32,
    /// `2 * proximity_radius + 1`
    pub proximity_width: u32,
    /// `proximity_width^2`
    pub region_count: u32,
}

impl TerrainLayout {
    /// Derive every constant from the two configured values.
    ///
    /// `None` when a derived count overflows `u32`, or when the last region's
    /// vertex offset would not fit the `i32` of an indexed indirect command.
    pub fn new(region_size: u32, proximity_radius: u32) -> Option<Self> {
        let proximity_width = proximity_radius.checked_mul(2)?.checked_add(1)?;
        let region_count = proximity_width.checked_mul(proximity_width)?;
        let side = region_size.checked_add(1)?;
        let vertices_per_region = side.checked_mul(side)?;
        let indices_per_region = region_size.checked_mul(region_size)?.checked_mul(6)?;

        let total_vertices = region_count.checked_mul(vertices_per_region)?;
        i32::try_from(total_vertices).ok()?;

        Some(Self {
            region_size,
            proximity_radius,
            indices_per_region,
            vertices_per_region,
            proximity_width,
            region_count,
        })
    }

    /// Layout from the terrain config section
    pub fn from_config(config: &TerrainConfig) -> Option<Self> {
        Self::new(config.region_size, config.proximity_radius)
    }

    /// Region containing world position `position`
    pub fn region_of(&self, position: &Vec3, spacing: f32) -> (i32, i32) {
        let extent = self.region_size as f32 * spacing;
        ((position.x / extent).floor() as i32, (position.z / extent).floor() as i32)
    }

    /// Regions around `center`, row-major by z then x; the slot index is the region index
    pub fn proximity_regions(&self, center: (i32, i32)) -> Vec<(i32, i32)> {
        let r = self.proximity_radius as i32;
        (-r..=r)
            .flat_map(|dz| (-r..=r).map(move |dx| (center.0 + dx, center.1 + dz)))
            .collect()
    }

    /// One indexed indirect command per region, every region visible.
    ///
    /// `first_instance` carries the region index to the shaders.
    pub fn indirect_commands(&self) -> Vec<IndirectCommand> {
        (0..self.region_count)
            .map(|region| IndirectCommand {
                index_count: self.indices_per_region,
                instance_count: 1,
                first_index: 0,
                // Bounded by the i32 check in `new`
                vertex_offset: (region * self.vertices_per_region) as i32,
                first_instance: region,
            })
            .collect()
    }

    /// Index list shared by every region
    pub fn region_indices(&self) -> Vec<u32> {
        grid_indices(self.region_size)
    }
}

/// Byte-compatible with `VkDrawIndexedIndirectCommand`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectCommand {
    /// Indices per draw
    pub index_count: u32,
    /// 0 when culled, 1 when visible
    pub instance_count: u32,
    /// First index
    pub first_index: u32,
    /// Start of the region's vertices
    pub vertex_offset: i32,
    /// Region index
    pub first_instance: u32,
}

unsafe impl bytemuck::Zeroable for IndirectCommand {}
unsafe impl bytemuck::Pod for IndirectCommand {}

/// Axis-aligned box of one region, padded to `vec4` for std430
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionBounds {
    /// Minimum corner, w unused
    pub min: [f32; 4],
    /// Maximum corner, w unused
    pub max: [f32; 4],
}

unsafe impl bytemuck::Zeroable for RegionBounds {}
unsafe impl bytemuck::Pod for RegionBounds {}

/// Deterministic rolling-hills height field
pub fn height_at(x: f32, z: f32, height_scale: f32) -> f32 {
    let broad = (x * 0.021).sin() * (z * 0.017).cos();
    let medium = 0.35 * (x * 0.063 + 1.3).sin() * (z * 0.071 - 0.7).sin();
    let fine = 0.1 * (x * 0.21 + z * 0.19).sin();
    (broad + medium + fine) * height_scale
}

fn normal_at(x: f32, z: f32, spacing: f32, height_scale: f32) -> [f32; 3] {
    let dx = height_at(x + spacing, z, height_scale) - height_at(x - spacing, z, height_scale);
    let dz = height_at(x, z + spacing, height_scale) - height_at(x, z - spacing, height_scale);
    let n = Vec3::new(-dx, 2.0 * spacing, -dz).normalize();
    [n.x, n.y, n.z]
}

/// Vertices and bounds of every proximity region around `center`, in region-index order
pub fn generate_proximity(
    layout: &TerrainLayout,
    center: (i32, i32),
    spacing: f32,
    height_scale: f32,
) -> (Vec<Vertex>, Vec<RegionBounds>) {
    let mut vertices = Vec::with_capacity((layout.region_count * layout.vertices_per_region) as usize);
    let mut bounds = Vec::with_capacity(layout.region_count as usize);
    for region in layout.proximity_regions(center) {
        bounds.push(generate_region(layout, region, spacing, height_scale, &mut vertices));
    }
    (vertices, bounds)
}

fn generate_region(
    layout: &TerrainLayout,
    region: (i32, i32),
    spacing: f32,
    height_scale: f32,
    out: &mut Vec<Vertex>,
) -> RegionBounds {
    let side = layout.region_size + 1;
    let extent = layout.region_size as f32 * spacing;
    let (origin_x, origin_z) = (region.0 as f32 * extent, region.1 as f32 * extent);

    let mut min = [f32::MAX; 3];
    let mut max = [f32::MIN; 3];
    for j in 0..side {
        for i in 0..side {
            let x = origin_x + i as f32 * spacing;
            let z = origin_z + j as f32 * spacing;
            let y = height_at(x, z, height_scale);
            let position = [x, y, z];
            for axis in 0..3 {
                min[axis] = min[axis].min(position[axis]);
                max[axis] = max[axis].max(position[axis]);
            }
            let uv = [i as f32 / layout.region_size as f32, j as f32 / layout.region_size as f32];
            out.push(Vertex::new(position, normal_at(x, z, spacing, height_scale), uv));
        }
    }
    RegionBounds {
        min: [min[0], min[1], min[2], 0.0],
        max: [max[0], max[1], max[2], 0.0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_constants() {
        let layout = TerrainLayout::new(32, 2).unwrap();
        assert_eq!(layout.indices_per_region, 32 * 32 * 6);
        assert_eq!(layout.vertices_per_region, 33 * 33);
        assert_eq!(layout.proximity_width, 5);
        assert_eq!(layout.region_count, 25);
        assert_eq!(layout.region_indices().len() as u32, layout.indices_per_region);
    }

    #[test]
    fn test_oversized_constants_are_rejected() {
        assert!(TerrainLayout::new(30_000, 2).is_none());
        assert!(TerrainLayout::new(u32::MAX, 0).is_none());
        assert!(TerrainLayout::new(8, u32::MAX / 2).is_none());
        // Each fits u32 alone, but the last vertex offset overflows i32
        assert!(TerrainLayout::new(1023, 23).is_none());
        assert!(TerrainLayout::new(1023, 0).is_some());
    }

    #[test]
    fn test_zero_radius_streams_one_region() {
        let layout = TerrainLayout::new(8, 0).unwrap();
        assert_eq!(layout.region_count, 1);
        assert_eq!(layout.proximity_regions((3, -4)), vec![(3, -4)]);
    }

    #[test]
    fn test_indirect_commands_start_visible() {
        let layout = TerrainLayout::new(4, 1).unwrap();
        let commands = layout.indirect_commands();
        assert_eq!(commands.len(), 9);
        for (index, command) in commands.iter().enumerate() {
            assert_eq!(command.instance_count, 1);
            assert_eq!(command.first_instance, index as u32);
            assert_eq!(command.vertex_offset as u32, index as u32 * layout.vertices_per_region);
            assert_eq!(command.index_count, layout.indices_per_region);
        }
    }

    #[test]
    fn test_indirect_command_matches_vulkan_layout() {
        assert_eq!(
            std::mem::size_of::<IndirectCommand>(),
            std::mem::size_of::<ash::vk::DrawIndexedIndirectCommand>()
        );
        assert_eq!(std::mem::size_of::<RegionBounds>(), 32);
    }

    #[test]
    fn test_region_of_floors_negative_positions() {
        let layout = TerrainLayout::new(10, 1).unwrap();
        assert_eq!(layout.region_of(&Vec3::new(5.0, 0.0, 5.0), 1.0), (0, 0));
        assert_eq!(layout.region_of(&Vec3::new(-0.5, 0.0, 25.0), 1.0), (-1, 2));
        assert_eq!(layout.region_of(&Vec3::new(39.0, 0.0, 0.0), 2.0), (1, 0));
    }

    #[test]
    fn test_proximity_regions_are_centred_row_major() {
        let layout = TerrainLayout::new(4, 1).unwrap();
        let regions = layout.proximity_regions((10, 20));
        assert_eq!(regions[0], (9, 19));
        assert_eq!(regions[1], (10, 19));
        assert_eq!(regions[4], (10, 20));
        assert_eq!(regions[8], (11, 21));
    }

    #[test]
    fn test_generation_is_deterministic_and_bounded() {
        let layout = TerrainLayout::new(4, 1).unwrap();
        let (vertices, bounds) = generate_proximity(&layout, (0, 0), 1.0, 8.0);
        let (again, _) = generate_proximity(&layout, (0, 0), 1.0, 8.0);
        assert_eq!(vertices, again);
        assert_eq!(vertices.len() as u32, layout.region_count * layout.vertices_per_region);
        assert_eq!(bounds.len() as u32, layout.region_count);

        let per_region = layout.vertices_per_region as usize;
        for (region, bound) in bounds.iter().enumerate() {
            for v in &vertices[region * per_region..(region + 1) * per_region] {
                for axis in 0..3 {
                    assert!(v.position[axis] >= bound.min[axis] && v.position[axis] <= bound.max[axis]);
                }
            }
        }
    }

    #[test]
    fn test_adjacent_regions_share_edge_heights() {
        let layout = TerrainLayout::new(4, 1).unwrap();
        let (vertices, _) = generate_proximity(&layout, (0, 0), 1.0, 8.0);
        let per_region = layout.vertices_per_region as usize;
        let side = (layout.region_size + 1) as usize;
        // Region 3 is (-1, 0) and region 4 is (0, 0): 3's right column meets 4's left column
        for j in 0..side {
            let right_of_3 = vertices[3 * per_region + j * side + side - 1];
            let left_of_4 = vertices[4 * per_region + j * side];
            assert_eq!(right_of_3.position, left_of_4.position);
        }
    }

    #[test]
    fn test_normals_point_up() {
        let layout = TerrainLayout::new(4, 0).unwrap();
        let (vertices, _) = generate_proximity(&layout, (2, 2), 0.5, 4.0);
        assert!(vertices.iter().all(|v| v.normal[1] > 0.0));
    }
}
