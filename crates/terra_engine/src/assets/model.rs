//! Models: CPU-side scene graphs and their GPU counterparts
//!
//! A [`ModelData`] is what a loader produces off the main thread. It is
//! consumed by [`Model::upload`], which creates every buffer, texture and
//! descriptor set on the main thread and drops the decoded pixels.

use ash::vk;

use crate::assets::{AssetError, ImageData};
use crate::foundation::math::{utils, GpuMat4, Mat4, Vec3};
use crate::render::layouts::SetLayouts;
use crate::render::vertex::Vertex;
use crate::render::vulkan::{
    Buffer, CommandPool, DescriptorPool, Memory, Texture, VulkanContext, VulkanError, VulkanResult,
};

/// Surface description of a material
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialData {
    /// Linear RGBA multiplier
    pub base_color: [f32; 4],
    /// Base color texture; a white pixel is used when absent
    pub image: Option<ImageData>,
}

impl MaterialData {
    /// Untextured material of one color
    pub fn colored(base_color: [f32; 4]) -> Self {
        Self { base_color, image: None }
    }
}

/// One indexed draw inside a mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitiveData {
    /// First index in the model's index buffer
    pub first_index: u32,
    /// Number of indices
    pub index_count: u32,
    /// Added to every index
    pub vertex_offset: i32,
    /// Index into the model's materials
    pub material: usize,
}

/// Scene graph node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeData {
    /// Transform relative to the parent
    pub transform: Mat4,
    /// Mesh primitives, empty for pure transform nodes
    pub primitives: Vec<PrimitiveData>,
    /// Child node indices
    pub children: Vec<usize>,
}

/// Everything a loader extracts from a model file
#[derive(Debug, Clone, PartialEq)]
pub struct ModelData {
    /// Shared vertex array
    pub vertices: Vec<Vertex>,
    /// Shared index array
    pub indices: Vec<u32>,
    /// Materials referenced by primitives
    pub materials: Vec<MaterialData>,
    /// Flat node storage
    pub nodes: Vec<NodeData>,
    /// Nodes without a parent
    pub roots: Vec<usize>,
}

impl ModelData {
    /// Single node holding one primitive over all indices
    pub fn single_mesh(vertices: Vec<Vertex>, indices: Vec<u32>, material: MaterialData) -> Self {
        let index_count = indices.len() as u32;
        Self {
            vertices,
            indices,
            materials: vec![material],
            nodes: vec![NodeData {
                transform: Mat4::identity(),
                primitives: vec![PrimitiveData {
                    first_index: 0,
                    index_count,
                    vertex_offset: 0,
                    material: 0,
                }],
                children: Vec::new(),
            }],
            roots: vec![0],
        }
    }

    /// Axis-aligned cube of edge `size` centred on the origin, outward-facing
    pub fn cube(size: f32, material: MaterialData) -> Self {
        let half = size * 0.5;
        // (normal, u, v) with u x v = normal so each face winds counter-clockwise from outside
        let faces: [(Vec3, Vec3, Vec3); 6] = [
            (Vec3::x(), -Vec3::z(), Vec3::y()),
            (-Vec3::x(), Vec3::z(), Vec3::y()),
            (Vec3::y(), Vec3::x(), -Vec3::z()),
            (-Vec3::y(), Vec3::x(), Vec3::z()),
            (Vec3::z(), Vec3::x(), Vec3::y()),
            (-Vec3::z(), -Vec3::x(), Vec3::y()),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, u, v) in faces {
            let base = vertices.len() as u32;
            for (su, sv, uv) in [(-1.0, -1.0, [0.0, 1.0]), (1.0, -1.0, [1.0, 1.0]), (1.0, 1.0, [1.0, 0.0]), (-1.0, 1.0, [0.0, 0.0])] {
                let p = (normal + u * su + v * sv) * half;
                vertices.push(Vertex::new([p.x, p.y, p.z], [normal.x, normal.y, normal.z], uv));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::single_mesh(vertices, indices, material)
    }

    /// Square grid in the XZ plane facing +Y, `cells` quads per side
    pub fn plane(size: f32, cells: u32, material: MaterialData) -> Self {
        let cells = cells.max(1);
        let side = cells + 1;
        let step = size / cells as f32;
        let origin = -size * 0.5;

        let vertices = (0..side)
            .flat_map(|j| (0..side).map(move |i| (i, j)))
            .map(|(i, j)| {
                let (x, z) = (origin + i as f32 * step, origin + j as f32 * step);
                Vertex::new([x, 0.0, z], [0.0, 1.0, 0.0], [i as f32 / cells as f32, j as f32 / cells as f32])
            })
            .collect();
        let indices = grid_indices(cells);
        Self::single_mesh(vertices, indices, material)
    }

    /// Check every cross reference and that the nodes form a forest
    pub fn validate(&self) -> Result<(), AssetError> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(AssetError::Invalid("model has no geometry".to_string()));
        }
        if let Some(bad) = self.indices.iter().find(|&&i| i as usize >= self.vertices.len()) {
            return Err(AssetError::Invalid(format!("index {bad} is past the vertex array")));
        }

        let mut visited = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = self.roots.clone();
        while let Some(index) = stack.pop() {
            let node = self
                .nodes
                .get(index)
                .ok_or_else(|| AssetError::Invalid(format!("node {index} does not exist")))?;
            if std::mem::replace(&mut visited[index], true) {
                return Err(AssetError::Invalid(format!("node {index} is reachable twice")));
            }
            for primitive in &node.primitives {
                let end = primitive.first_index as usize + primitive.index_count as usize;
                if end > self.indices.len() {
                    return Err(AssetError::Invalid(format!("node {index} draws past the index buffer")));
                }
                if primitive.material >= self.materials.len() {
                    return Err(AssetError::Invalid(format!("node {index} uses missing material {}", primitive.material)));
                }
            }
            stack.extend(node.children.iter().copied());
        }
        Ok(())
    }

    /// Model-space transform of every node (parent transforms applied)
    pub fn world_transforms(&self) -> Vec<Mat4> {
        let mut world = vec![Mat4::identity(); self.nodes.len()];
        let mut stack: Vec<(usize, Mat4)> = self.roots.iter().map(|&root| (root, Mat4::identity())).collect();
        while let Some((index, parent)) = stack.pop() {
            let Some(node) = self.nodes.get(index) else { continue };
            let transform = parent * node.transform;
            world[index] = transform;
            stack.extend(node.children.iter().map(|&child| (child, transform)));
        }
        world
    }
}

/// Indices for a `cells` x `cells` grid of `(cells + 1)^2` row-major vertices, counter-clockwise from +Y
pub fn grid_indices(cells: u32) -> Vec<u32> {
    let side = cells + 1;
    let mut indices = Vec::with_capacity((cells * cells * 6) as usize);
    for j in 0..cells {
        for i in 0..cells {
            let p00 = j * side + i;
            let p10 = p00 + 1;
            let p01 = p00 + side;
            let p11 = p01 + 1;
            indices.extend_from_slice(&[p01, p11, p10, p01, p10, p00]);
        }
    }
    indices
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NodeUniform {
    model: GpuMat4,
}

unsafe impl bytemuck::Zeroable for NodeUniform {}
unsafe impl bytemuck::Pod for NodeUniform {}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct MaterialUniform {
    base_color: [f32; 4],
}

unsafe impl bytemuck::Zeroable for MaterialUniform {}
unsafe impl bytemuck::Pod for MaterialUniform {}

/// Primitive as a recording job sees it
#[derive(Debug, Clone, Copy)]
pub struct PrimitiveDraw {
    /// First index
    pub first_index: u32,
    /// Index count
    pub index_count: u32,
    /// Vertex offset
    pub vertex_offset: i32,
    /// Material set (set 2)
    pub material_set: vk::DescriptorSet,
}

/// Node as a recording job sees it
#[derive(Debug, Clone)]
pub struct NodeDraw {
    /// Node transform set (set 1)
    pub node_set: vk::DescriptorSet,
    /// Primitives drawn with this node's transform
    pub primitives: Vec<PrimitiveDraw>,
    /// Child node indices
    pub children: Vec<usize>,
}

/// Handles a worker thread needs to record one model, detached from the model itself
#[derive(Debug, Clone)]
pub struct ModelDrawData {
    /// Vertex buffer
    pub vertex_buffer: vk::Buffer,
    /// 32-bit index buffer
    pub index_buffer: vk::Buffer,
    /// Flat node storage
    pub nodes: Vec<NodeDraw>,
    /// Root nodes
    pub roots: Vec<usize>,
}

struct GpuMaterial {
    set: vk::DescriptorSet,
    _uniform: Buffer,
    _texture: Texture,
}

struct GpuNode {
    primitives: Vec<PrimitiveData>,
    children: Vec<usize>,
    set: vk::DescriptorSet,
    _uniform: Buffer,
}

struct ModelGpu {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    // Declared after the buffers it backs
    _memory: Memory,
    materials: Vec<GpuMaterial>,
    nodes: Vec<GpuNode>,
    roots: Vec<usize>,
    _descriptor_pool: DescriptorPool,
}

/// A model registered with the scene; drawable once [`Self::has_loaded`] is true
pub struct Model {
    name: String,
    gpu: Option<ModelGpu>,
}

impl Model {
    /// Placeholder for a model still loading
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gpu: None,
        }
    }

    /// Name given at registration
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the GPU upload finished
    pub fn has_loaded(&self) -> bool {
        self.gpu.is_some()
    }

    /// Create every GPU resource for `data`, consuming it.
    ///
    /// Runs on the main thread. Node transforms are fixed once uploaded, so
    /// every swapchain image shares each node's uniform buffer and set.
    pub fn upload(
        &mut self,
        ctx: &VulkanContext,
        pool: &CommandPool,
        layouts: &SetLayouts,
        data: ModelData,
    ) -> VulkanResult<()> {
        data.validate().map_err(|e| VulkanError::InvalidOperation {
            reason: format!("model '{}': {e}", self.name),
        })?;
        let device = ctx.device();
        let queue = ctx.graphics_queue();

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&data.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&data.indices);
        let vertex_buffer = Buffer::new(
            device,
            vertex_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        let index_buffer = Buffer::new(
            device,
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        let (memory, _) = Memory::for_buffers(ctx, &[&vertex_buffer, &index_buffer], vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        vertex_buffer.upload_via_staging(ctx, pool, queue, vertex_bytes)?;
        index_buffer.upload_via_staging(ctx, pool, queue, index_bytes)?;

        let world = data.world_transforms();
        let mut descriptor_pool = DescriptorPool::new();
        descriptor_pool.add_descriptor_layout(&layouts.material, data.materials.len() as u32);
        descriptor_pool.add_descriptor_layout(&layouts.node, data.nodes.len() as u32);
        descriptor_pool.init(device, 1)?;

        let mut materials = Vec::with_capacity(data.materials.len());
        for material in data.materials {
            let texture = match &material.image {
                Some(image) => Texture::from_rgba(ctx, pool, image.width, image.height, &[&image.data])?,
                None => Texture::solid(ctx, pool, [255, 255, 255, 255])?,
            };
            let uniform = Buffer::from_bytes(
                ctx,
                bytemuck::bytes_of(&MaterialUniform {
                    base_color: material.base_color,
                }),
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )?;
            let mut set = descriptor_pool.allocate(&layouts.material)?;
            set.set_buffer_desc(0, uniform.descriptor_info())?;
            set.set_image_desc(1, texture.descriptor_info())?;
            set.update(device);
            materials.push(GpuMaterial {
                set: set.handle(),
                _uniform: uniform,
                _texture: texture,
            });
        }

        let mut nodes = Vec::with_capacity(data.nodes.len());
        for (node, transform) in data.nodes.into_iter().zip(world) {
            let uniform = NodeUniform {
                model: utils::to_gpu(&transform),
            };
            let buffer = Buffer::from_bytes(ctx, bytemuck::bytes_of(&uniform), vk::BufferUsageFlags::UNIFORM_BUFFER)?;
            let mut set = descriptor_pool.allocate(&layouts.node)?;
            set.set_buffer_desc(0, buffer.descriptor_info())?;
            set.update(device);
            nodes.push(GpuNode {
                primitives: node.primitives,
                children: node.children,
                set: set.handle(),
                _uniform: buffer,
            });
        }

        log::info!(
            "Uploaded model '{}': {} vertices, {} indices, {} nodes, {} materials",
            self.name,
            data.vertices.len(),
            data.indices.len(),
            nodes.len(),
            materials.len()
        );

        self.gpu = Some(ModelGpu {
            vertex_buffer,
            index_buffer,
            _memory: memory,
            materials,
            nodes,
            roots: data.roots,
            _descriptor_pool: descriptor_pool,
        });
        Ok(())
    }

    /// Snapshot for recording; `None` until loaded
    pub fn draw_data(&self) -> Option<ModelDrawData> {
        let gpu = self.gpu.as_ref()?;
        let nodes = gpu
            .nodes
            .iter()
            .map(|node| NodeDraw {
                node_set: node.set,
                primitives: node
                    .primitives
                    .iter()
                    .map(|p| PrimitiveDraw {
                        first_index: p.first_index,
                        index_count: p.index_count,
                        vertex_offset: p.vertex_offset,
                        material_set: gpu.materials[p.material].set,
                    })
                    .collect(),
                children: node.children.clone(),
            })
            .collect();
        Some(ModelDrawData {
            vertex_buffer: gpu.vertex_buffer.handle(),
            index_buffer: gpu.index_buffer.handle(),
            nodes,
            roots: gpu.roots.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn white() -> MaterialData {
        MaterialData::colored([1.0; 4])
    }

    fn position(v: &Vertex) -> Vec3 {
        Vec3::new(v.position[0], v.position[1], v.position[2])
    }

    fn assert_faces_point_along_normals(data: &ModelData) {
        for tri in data.indices.chunks(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| &data.vertices[i as usize]);
            let face = (position(b) - position(a)).cross(&(position(c) - position(a)));
            let normal = Vec3::new(a.normal[0], a.normal[1], a.normal[2]);
            assert!(face.dot(&normal) > 0.0, "triangle {tri:?} winds clockwise");
        }
    }

    #[test]
    fn test_cube_is_valid_and_outward_facing() {
        let cube = ModelData::cube(2.0, white());
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        cube.validate().unwrap();
        assert_faces_point_along_normals(&cube);
        for v in &cube.vertices {
            assert!(v.position.iter().all(|c| (c.abs() - 1.0).abs() < 1e-6));
        }
    }

    #[test]
    fn test_plane_winds_counter_clockwise_from_above() {
        let plane = ModelData::plane(4.0, 3, white());
        assert_eq!(plane.vertices.len(), 16);
        assert_eq!(plane.indices.len(), 54);
        plane.validate().unwrap();
        assert_faces_point_along_normals(&plane);
    }

    #[test]
    fn test_world_transforms_compose_parents() {
        let mut data = ModelData::cube(1.0, white());
        data.nodes[0].transform = Mat4::new_translation(&Vec3::new(1.0, 0.0, 0.0));
        data.nodes[0].children.push(1);
        data.nodes.push(NodeData {
            transform: Mat4::new_translation(&Vec3::new(0.0, 2.0, 0.0)),
            primitives: Vec::new(),
            children: Vec::new(),
        });

        let world = data.world_transforms();
        let child_origin = world[1].transform_point(&crate::foundation::math::Point3::origin());
        assert_relative_eq!(child_origin.coords, Vec3::new(1.0, 2.0, 0.0), epsilon = 1e-6);
        data.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_cycles_and_bad_references() {
        let mut cyclic = ModelData::cube(1.0, white());
        cyclic.nodes[0].children.push(0);
        assert!(matches!(cyclic.validate(), Err(AssetError::Invalid(_))));

        let mut bad_material = ModelData::cube(1.0, white());
        bad_material.nodes[0].primitives[0].material = 3;
        assert!(bad_material.validate().is_err());

        let mut bad_index = ModelData::cube(1.0, white());
        bad_index.indices[0] = 999;
        assert!(bad_index.validate().is_err());

        let mut bad_range = ModelData::cube(1.0, white());
        bad_range.nodes[0].primitives[0].index_count = 100;
        assert!(bad_range.validate().is_err());
    }

    #[test]
    fn test_unloaded_model_has_no_draw_data() {
        let model = Model::new("pending");
        assert!(!model.has_loaded());
        assert!(model.draw_data().is_none());
    }
}
