// Render batch construction
//
// One linear pass over the scene's object list groups maximal contiguous
// runs sharing (material, mesh) into batches, and emits the per-object
// records the culling kernel consumes. The `#[repr(C)]` structs here are
// the wire contract with the compute shader; their layouts must match
// the GLSL block declarations exactly.

use bytemuck::{Pod, Zeroable};

use crate::error::ConfigError;
use crate::scene::{MaterialId, MeshId, RenderObject};

/// Marker for compacted-index slots no visible object claimed.
pub const COMPACTED_UNSET: u32 = u32::MAX;

/// A maximal contiguous run of scene objects sharing (material, mesh).
///
/// `first_index` is the batch's base slot in the global indirect-command
/// array, i.e. the number of included objects before the run;
/// `index_count` is the run's object count, so a cull with everything
/// visible resolves each batch's instance count to exactly it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderBatch {
    pub material: MaterialId,
    pub mesh: MeshId,
    pub first_index: u32,
    pub index_count: u32,
}

/// Per-batch record mirrored on the GPU. `instance_count` starts at zero
/// and is resolved by the culling kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GpuRenderBatch {
    pub first_index: u32,
    pub index_count: u32,
    pub instance_count: u32,
}

/// Per-included-object record mirrored on the GPU: one kernel invocation
/// per entry. `object_id` is the object's global included-object index,
/// `scene_index` its position in the full scene list.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GpuObjectBatch {
    pub object_id: u32,
    pub batch_id: u32,
    pub scene_index: u32,
    pub indices_count: u32,
}

/// Per-scene-object data the kernel and the vertex stage both read,
/// indexed by scene position. `sphere` packs the world-space bounding
/// sphere as (center.xyz, radius).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuObjectData {
    pub model: [[f32; 4]; 4],
    pub sphere: [f32; 4],
}

/// One indirect draw, layout-identical to `vk::DrawIndexedIndirectCommand`
/// so the buffer feeds `cmd_draw_indexed_indirect` directly. Declared
/// here because the kernel writes it through mapped (Pod) slices.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GpuIndirectCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// The per-dispatch uniform block. std140-compatible: mat4 columns and
/// vec4 plane rows are 16-byte aligned, the scalar tail is packed.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuSceneData {
    pub view: [[f32; 4]; 4],
    pub frustum_planes: [[f32; 4]; 4],
    pub z_near: f32,
    pub z_far: f32,
    pub object_count: u32,
    pub _pad: u32,
}

/// Output of one batching pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSet {
    pub batches: Vec<RenderBatch>,
    pub objects: Vec<GpuObjectBatch>,
}

impl BatchSet {
    pub fn gpu_batches(&self) -> Vec<GpuRenderBatch> {
        self.batches
            .iter()
            .map(|b| GpuRenderBatch {
                first_index: b.first_index,
                index_count: b.index_count,
                instance_count: 0,
            })
            .collect()
    }
}

// Accumulator for the run in progress. An absent run and a run starting
// at slot 0 are distinct states, so this lives behind an Option.
struct RunState {
    material: MaterialId,
    mesh: MeshId,
    first_index: u32,
    index_count: u32,
}

/// Group `objects` into contiguous (material, mesh) batches.
///
/// Inactive objects and objects lacking a mesh or material terminate the
/// current run without starting one; the scene index keeps advancing so
/// `scene_index` stays a stable pointer into the caller's list.
pub fn create_batches(
    objects: &[RenderObject],
    capacity: usize,
) -> Result<BatchSet, ConfigError> {
    if objects.len() > capacity {
        return Err(ConfigError::CapacityExceeded {
            count: objects.len(),
            capacity,
        });
    }

    let mut set = BatchSet::default();
    let mut run: Option<RunState> = None;

    for (scene_index, object) in objects.iter().enumerate() {
        let (material, mesh) = match (object.active, object.material, object.mesh) {
            (true, Some(material), Some(mesh)) => (material, mesh),
            _ => {
                if let Some(state) = run.take() {
                    flush(&mut set.batches, state);
                }
                continue;
            }
        };

        match run.as_mut() {
            Some(state) if state.material == material && state.mesh == mesh => {
                state.index_count += 1;
            }
            _ => {
                if let Some(state) = run.take() {
                    flush(&mut set.batches, state);
                }
                run = Some(RunState {
                    material,
                    mesh,
                    first_index: set.objects.len() as u32,
                    index_count: 1,
                });
            }
        }

        // While a run is open its batch id is the flushed-batch count.
        set.objects.push(GpuObjectBatch {
            object_id: set.objects.len() as u32,
            batch_id: set.batches.len() as u32,
            scene_index: scene_index as u32,
            indices_count: object.index_count,
        });
    }

    if let Some(state) = run.take() {
        flush(&mut set.batches, state);
    }

    Ok(set)
}

fn flush(batches: &mut Vec<RenderBatch>, state: RunState) {
    batches.push(RenderBatch {
        material: state.material,
        mesh: state.mesh,
        first_index: state.first_index,
        index_count: state.index_count,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Sphere;
    use glam::{Mat4, Vec3};

    fn object(material: u32, mesh: u32, index_count: u32) -> RenderObject {
        RenderObject {
            material: Some(MaterialId(material)),
            mesh: Some(MeshId(mesh)),
            active: true,
            transform: Mat4::IDENTITY,
            bounds: Sphere::new(Vec3::ZERO, 1.0),
            index_count,
        }
    }

    #[test]
    fn groups_contiguous_runs() {
        // [A, A, B] -> two batches of 2 and 1
        let objects = vec![object(0, 0, 36), object(0, 0, 36), object(1, 1, 12)];
        let set = create_batches(&objects, 16).unwrap();

        assert_eq!(set.batches.len(), 2);
        assert_eq!(set.batches[0].first_index, 0);
        assert_eq!(set.batches[0].index_count, 2);
        assert_eq!(set.batches[1].first_index, 2);
        assert_eq!(set.batches[1].index_count, 1);

        assert_eq!(set.objects.len(), 3);
        assert_eq!(set.objects[2].batch_id, 1);
        assert_eq!(set.objects[2].object_id, 2);
    }

    #[test]
    fn same_pair_after_gap_starts_a_new_batch() {
        // [A, B, A] never merges the two A runs
        let objects = vec![object(0, 0, 36), object(1, 0, 36), object(0, 0, 36)];
        let set = create_batches(&objects, 16).unwrap();
        assert_eq!(set.batches.len(), 3);
    }

    #[test]
    fn inactive_object_splits_the_run() {
        let mut inactive = object(0, 0, 36);
        inactive.active = false;
        let objects = vec![object(0, 0, 36), object(0, 0, 36), inactive, object(0, 0, 36)];
        let set = create_batches(&objects, 16).unwrap();

        assert_eq!(set.batches.len(), 2);
        assert_eq!(set.batches[0].first_index, 0);
        assert_eq!(set.batches[0].index_count, 2);
        assert_eq!(set.batches[1].first_index, 2);
        assert_eq!(set.batches[1].index_count, 1);

        // the excluded object still advanced the scene index
        assert_eq!(set.objects.len(), 3);
        assert_eq!(set.objects[2].scene_index, 3);
    }

    #[test]
    fn index_count_is_the_run_length() {
        // [A, B] share a material/mesh whose mesh has 36 indices; the
        // batch still counts two objects, not 36 indices
        let objects = vec![object(0, 0, 36), object(0, 0, 36), object(1, 0, 36)];
        let set = create_batches(&objects, 16).unwrap();

        assert_eq!(set.batches[0].index_count, 2);
        assert_eq!(set.batches[1].index_count, 1);
        // the run length flows into the GPU mirror unchanged
        assert_eq!(set.gpu_batches()[0].index_count, 2);
        // per-object mesh index counts live on the entries instead
        assert!(set.objects.iter().all(|o| o.indices_count == 36));
    }

    #[test]
    fn unresolved_mesh_or_material_is_excluded() {
        let mut no_mesh = object(0, 0, 36);
        no_mesh.mesh = None;
        let objects = vec![object(0, 0, 36), no_mesh, object(0, 0, 36)];
        let set = create_batches(&objects, 16).unwrap();
        assert_eq!(set.batches.len(), 2);
        assert_eq!(set.objects.len(), 2);
    }

    #[test]
    fn included_object_count_matches_entries() {
        let mut inactive = object(2, 2, 6);
        inactive.active = false;
        let objects = vec![
            object(0, 0, 36),
            object(0, 0, 36),
            object(1, 1, 12),
            inactive,
            object(1, 1, 12),
        ];
        let set = create_batches(&objects, 16).unwrap();

        // run lengths sum to the entry count, and with the excluded
        // object they cover the whole scene
        let total: u32 = set.batches.iter().map(|b| b.index_count).sum();
        assert_eq!(total as usize, set.objects.len());
        assert_eq!(total as usize + 1, objects.len());
        assert_eq!(set.objects.len(), 4);
    }

    #[test]
    fn batching_is_idempotent() {
        let objects = vec![object(0, 0, 36), object(1, 0, 12), object(1, 1, 12)];
        let first = create_batches(&objects, 16).unwrap();
        let second = create_batches(&objects, 16).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_scenes_over_capacity() {
        let objects = vec![object(0, 0, 36); 5];
        assert_eq!(
            create_batches(&objects, 4),
            Err(ConfigError::CapacityExceeded {
                count: 5,
                capacity: 4
            })
        );
    }

    #[test]
    fn empty_scene_builds_nothing() {
        let set = create_batches(&[], 16).unwrap();
        assert!(set.batches.is_empty());
        assert!(set.objects.is_empty());
    }

    #[test]
    fn gpu_struct_layouts_match_the_shader_blocks() {
        use std::mem::size_of;
        assert_eq!(size_of::<GpuRenderBatch>(), 12);
        assert_eq!(size_of::<GpuObjectBatch>(), 16);
        assert_eq!(size_of::<GpuObjectData>(), 80);
        assert_eq!(size_of::<GpuSceneData>(), 144);
        assert_eq!(
            size_of::<GpuIndirectCommand>(),
            size_of::<ash::vk::DrawIndexedIndirectCommand>()
        );
        assert_eq!(bytemuck::offset_of!(GpuSceneData::zeroed(), GpuSceneData, frustum_planes), 64);
        assert_eq!(bytemuck::offset_of!(GpuSceneData::zeroed(), GpuSceneData, object_count), 136);
    }
}
