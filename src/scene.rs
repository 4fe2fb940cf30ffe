// Scene-facing interface types
//
// The scene owns objects and the camera; the render core consumes an
// ordered, frame-stable snapshot of them each frame. Registries map the
// ids carried by objects to realized GPU resources.

use ash::vk;
use glam::{Mat4, Vec3};

/// Identifies a material (pipeline + descriptor bindings) owned by the
/// application's resource layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialId(pub u32);

/// Identifies a mesh (vertex/index buffers) owned by the resource layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshId(pub u32);

/// A bounding sphere in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Sphere {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }
}

/// One renderable object as exposed by the scene.
///
/// Objects without a mesh or material (`mesh`/`material` set to `None`)
/// and inactive objects are skipped by batching but still advance the
/// linear scene index.
#[derive(Debug, Clone)]
pub struct RenderObject {
    pub material: Option<MaterialId>,
    pub mesh: Option<MeshId>,
    pub active: bool,
    pub transform: Mat4,
    pub bounds: Sphere,
    /// Index count of the referenced mesh, snapshotted on the object so
    /// batching needs no registry lookups.
    pub index_count: u32,
}

/// The active camera as exposed by the scene.
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub view: Mat4,
    pub projection: Mat4,
    pub near: f32,
    pub far: f32,
}

/// Realized GPU state for one material.
pub struct GpuMaterial {
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_sets: Vec<vk::DescriptorSet>,
}

/// Realized GPU state for one mesh.
pub struct GpuMesh {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
}

/// Maps `MaterialId` to realized pipelines. Ids are dense and assigned by
/// the resource layer in registration order.
#[derive(Default)]
pub struct MaterialRegistry {
    materials: Vec<GpuMaterial>,
}

impl MaterialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, material: GpuMaterial) -> MaterialId {
        let id = MaterialId(self.materials.len() as u32);
        self.materials.push(material);
        id
    }

    pub fn get(&self, id: MaterialId) -> Option<&GpuMaterial> {
        self.materials.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

/// Maps `MeshId` to realized buffers.
#[derive(Default)]
pub struct MeshRegistry {
    meshes: Vec<GpuMesh>,
}

impl MeshRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mesh: GpuMesh) -> MeshId {
        let id = MeshId(self.meshes.len() as u32);
        self.meshes.push(mesh);
        id
    }

    pub fn get(&self, id: MeshId) -> Option<&GpuMesh> {
        self.meshes.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}
