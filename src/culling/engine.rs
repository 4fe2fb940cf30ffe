// GPU-driven culling engine
//
// Per frame: build batches from the scene snapshot, run the visibility
// kernel (compute dispatch or the same kernel on the frame thread), then
// record one indirect draw per surviving batch. The engine is a strict
// phase machine; calling an operation out of phase is a typed error.

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Vec4, Vec4Swizzles};
use std::path::Path;
use std::sync::Arc;

use crate::backend::{CommandPool, DeviceBuffer, VulkanDevice};
use crate::binding::{
    BindingDesc, ComputePipelineDesc, DescriptorSetDesc, Pipeline, ResourceBinder,
};
use crate::config::CullingConfig;
use crate::error::ConfigError;
use crate::scene::{Camera, MaterialId, MaterialRegistry, MeshId, MeshRegistry, RenderObject};

use super::batch::{
    self, BatchSet, GpuIndirectCommand, GpuObjectBatch, GpuObjectData, GpuRenderBatch,
    GpuSceneData, RenderBatch, COMPACTED_UNSET,
};
use super::frustum;

const CULL_WORKGROUP_SIZE: u32 = 256;

/// Where the engine sits in its per-frame cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullPhase {
    Idle,
    BatchesBuilt,
    Culled,
    Rendered,
}

/// One recorded draw in material/mesh submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    pub material: MaterialId,
    pub mesh: MeshId,
    /// False when the previous surviving batch already bound this material.
    pub bind_material: bool,
    pub draw_count: u32,
    pub indirect_offset: vk::DeviceSize,
}

/// Reference semantics of the culling compute shader; the CPU fallback
/// path runs it directly against the mapped GPU buffers.
///
/// One invocation per included object: transform the world-space bounding
/// sphere into view space, test it, and on visibility take the next
/// compacted slot in the object's batch and emit its indirect command.
pub fn cull_kernel(
    scene: &GpuSceneData,
    objects: &[GpuObjectData],
    entries: &[GpuObjectBatch],
    batches: &mut [GpuRenderBatch],
    indirect: &mut [GpuIndirectCommand],
    compacted: &mut [u32],
) {
    let view = Mat4::from_cols_array_2d(&scene.view);

    for entry in entries.iter().take(scene.object_count as usize) {
        let data = &objects[entry.scene_index as usize];
        let sphere = Vec4::from_array(data.sphere);
        let center = (view * sphere.xyz().extend(1.0)).xyz();

        if !frustum::sphere_visible(
            &scene.frustum_planes,
            scene.z_near,
            scene.z_far,
            center,
            sphere.w,
        ) {
            continue;
        }

        let batch = &mut batches[entry.batch_id as usize];
        let slot = batch.first_index + batch.instance_count;
        batch.instance_count += 1;

        indirect[slot as usize] = GpuIndirectCommand {
            index_count: entry.indices_count,
            instance_count: 1,
            first_index: 0,
            vertex_offset: 0,
            first_instance: slot,
        };
        compacted[slot as usize] = entry.scene_index;
    }
}

/// Build the submission list from GPU-resolved instance counts: batches
/// nothing survived in are skipped, and a material is rebound only when
/// it differs from the previous surviving batch's.
pub fn draw_list(batches: &[RenderBatch], resolved: &[GpuRenderBatch]) -> Vec<DrawCall> {
    let stride = std::mem::size_of::<GpuIndirectCommand>() as vk::DeviceSize;
    let mut calls = Vec::new();
    let mut bound: Option<MaterialId> = None;

    for (batch, gpu) in batches.iter().zip(resolved) {
        if gpu.instance_count == 0 {
            continue;
        }
        calls.push(DrawCall {
            material: batch.material,
            mesh: batch.mesh,
            bind_material: bound != Some(batch.material),
            draw_count: gpu.instance_count,
            indirect_offset: vk::DeviceSize::from(batch.first_index) * stride,
        });
        bound = Some(batch.material);
    }
    calls
}

/// Owns the culling buffers, the compute pipeline, and the per-frame
/// phase machine.
pub struct CullingEngine {
    device: Arc<VulkanDevice>,
    capacity: usize,
    use_gpu: bool,
    phase: CullPhase,

    batches: Vec<RenderBatch>,
    entries: Vec<GpuObjectBatch>,
    object_data: Vec<GpuObjectData>,

    scene_buffer: DeviceBuffer,
    object_data_buffer: DeviceBuffer,
    entry_buffer: DeviceBuffer,
    batch_buffer: DeviceBuffer,
    indirect_buffer: DeviceBuffer,
    compacted_buffer: DeviceBuffer,

    binder: ResourceBinder,
    pipeline: Option<Pipeline>,
    command_pool: CommandPool,
}

impl CullingEngine {
    pub fn new(
        device: Arc<VulkanDevice>,
        config: &CullingConfig,
        cull_shader: &Path,
    ) -> Result<Self> {
        let capacity = config.max_scene_objects;
        anyhow::ensure!(capacity > 0, "culling.max_scene_objects must be positive");

        let per_object = |elem: usize, usage: vk::BufferUsageFlags| {
            DeviceBuffer::host_visible(device.clone(), (capacity * elem) as vk::DeviceSize, usage)
        };

        let storage = vk::BufferUsageFlags::STORAGE_BUFFER;
        let scene_buffer = DeviceBuffer::host_visible(
            device.clone(),
            std::mem::size_of::<GpuSceneData>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;
        let object_data_buffer = per_object(std::mem::size_of::<GpuObjectData>(), storage)?;
        let entry_buffer = per_object(std::mem::size_of::<GpuObjectBatch>(), storage)?;
        // worst case is one batch per object
        let batch_buffer = per_object(std::mem::size_of::<GpuRenderBatch>(), storage)?;
        let indirect_buffer = per_object(
            std::mem::size_of::<GpuIndirectCommand>(),
            storage | vk::BufferUsageFlags::INDIRECT_BUFFER,
        )?;
        let compacted_buffer = per_object(
            std::mem::size_of::<u32>(),
            storage | vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;

        let stages = vk::ShaderStageFlags::COMPUTE;
        let buffer_binding = |buffer: &DeviceBuffer| BindingDesc::StorageBuffer {
            buffer: buffer.buffer,
            range: buffer.size,
        };
        let mut binder = ResourceBinder::new();
        binder.register_set(
            0,
            DescriptorSetDesc::new()
                .binding(
                    BindingDesc::UniformBuffer {
                        buffer: scene_buffer.buffer,
                        range: scene_buffer.size,
                    },
                    stages,
                )
                .binding(buffer_binding(&object_data_buffer), stages)
                .binding(buffer_binding(&entry_buffer), stages)
                .binding(buffer_binding(&batch_buffer), stages)
                .binding(buffer_binding(&indirect_buffer), stages)
                .binding(buffer_binding(&compacted_buffer), stages),
        )?;
        binder.realize(device.clone(), None)?;

        let pipeline = if config.gpu {
            Some(ComputePipelineDesc::new(cull_shader).compile(device.clone(), binder.layouts())?)
        } else {
            None
        };

        let command_pool = CommandPool::new(device.clone())?;

        log::info!(
            "Culling engine ready: capacity {}, {} path",
            capacity,
            if config.gpu { "GPU" } else { "CPU" }
        );

        Ok(Self {
            device,
            capacity,
            use_gpu: config.gpu,
            phase: CullPhase::Idle,
            batches: Vec::new(),
            entries: Vec::new(),
            object_data: Vec::new(),
            scene_buffer,
            object_data_buffer,
            entry_buffer,
            batch_buffer,
            indirect_buffer,
            compacted_buffer,
            binder,
            pipeline,
            command_pool,
        })
    }

    pub fn phase(&self) -> CullPhase {
        self.phase
    }

    /// The compacted slot->scene-index buffer, read by the vertex stage
    /// to resolve per-instance object data.
    pub fn compacted_buffer(&self) -> &DeviceBuffer {
        &self.compacted_buffer
    }

    /// The per-object model/bounds storage buffer.
    pub fn object_data_buffer(&self) -> &DeviceBuffer {
        &self.object_data_buffer
    }

    fn expect_phase(&self, operation: &'static str, allowed: &[CullPhase]) -> Result<(), ConfigError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(ConfigError::OutOfPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    /// Snapshot the scene into batches and upload the per-object records.
    /// A snapshot that was never culled (skipped frame) may be replaced.
    pub fn create_batches(&mut self, objects: &[RenderObject]) -> Result<()> {
        self.expect_phase("create_batches", &[CullPhase::Idle, CullPhase::BatchesBuilt])?;

        let set: BatchSet = batch::create_batches(objects, self.capacity)?;

        self.object_data = objects
            .iter()
            .map(|o| GpuObjectData {
                model: o.transform.to_cols_array_2d(),
                sphere: [
                    o.bounds.center.x,
                    o.bounds.center.y,
                    o.bounds.center.z,
                    o.bounds.radius,
                ],
            })
            .collect();

        if !self.object_data.is_empty() {
            self.object_data_buffer.write_slice(&self.object_data)?;
        }
        if !set.objects.is_empty() {
            self.entry_buffer.write_slice(&set.objects)?;
        }
        let gpu_batches = set.gpu_batches();
        if !gpu_batches.is_empty() {
            self.batch_buffer.write_slice(&gpu_batches)?;
        }

        log::debug!(
            "Built {} batches over {} of {} scene objects",
            set.batches.len(),
            set.objects.len(),
            objects.len()
        );

        self.batches = set.batches;
        self.entries = set.objects;
        self.phase = CullPhase::BatchesBuilt;
        Ok(())
    }

    /// Run the visibility kernel for the current batches.
    pub fn cull(&mut self, camera: Option<&Camera>) -> Result<()> {
        self.expect_phase("cull", &[CullPhase::BatchesBuilt])?;
        let camera = camera.ok_or(ConfigError::NoActiveCamera)?;

        let scene = GpuSceneData {
            view: camera.view.to_cols_array_2d(),
            frustum_planes: frustum::frustum_planes(&camera.projection),
            z_near: camera.near,
            z_far: camera.far,
            object_count: self.entries.len() as u32,
            _pad: 0,
        };
        self.scene_buffer.write_slice(&[scene])?;

        if self.entries.is_empty() {
            self.phase = CullPhase::Culled;
            return Ok(());
        }

        // Reset per-batch counters and unclaim every compacted slot the
        // kernel could fill.
        self.batch_buffer.write_slice(
            &self
                .batches
                .iter()
                .map(|b| GpuRenderBatch {
                    first_index: b.first_index,
                    index_count: b.index_count,
                    instance_count: 0,
                })
                .collect::<Vec<_>>(),
        )?;
        self.compacted_buffer
            .write_slice(&vec![COMPACTED_UNSET; self.entries.len()])?;

        if self.use_gpu {
            self.dispatch(self.entries.len() as u32)?;
        } else {
            let mut batches = self.batch_buffer.map_slice::<GpuRenderBatch>(self.batches.len())?;
            let mut indirect = self
                .indirect_buffer
                .map_slice::<GpuIndirectCommand>(self.entries.len())?;
            let mut compacted = self.compacted_buffer.map_slice::<u32>(self.entries.len())?;
            cull_kernel(
                &scene,
                &self.object_data,
                &self.entries,
                &mut batches,
                &mut indirect,
                &mut compacted,
            );
        }

        self.phase = CullPhase::Culled;
        Ok(())
    }

    // Blocking one-time submit: the resolved counts are read back on the
    // frame thread before draw recording.
    fn dispatch(&self, object_count: u32) -> Result<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .context("GPU culling enabled without a compute pipeline")?;
        let set = self
            .binder
            .set(0)
            .context("culling descriptor set not realized")?;
        let groups = object_count.div_ceil(CULL_WORKGROUP_SIZE);
        let device = &self.device.device;

        self.command_pool.submit_and_wait(|cmd| unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout,
                0,
                &[set],
                &[],
            );
            device.cmd_dispatch(cmd, groups, 1, 1);

            let barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(
                    vk::AccessFlags::INDIRECT_COMMAND_READ
                        | vk::AccessFlags::SHADER_READ
                        | vk::AccessFlags::HOST_READ,
                )
                .build();
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::DRAW_INDIRECT
                    | vk::PipelineStageFlags::VERTEX_SHADER
                    | vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        })
    }

    /// Record one indirect draw per surviving batch into `cmd`.
    pub fn render(
        &mut self,
        cmd: vk::CommandBuffer,
        materials: &MaterialRegistry,
        meshes: &MeshRegistry,
    ) -> Result<()> {
        self.expect_phase("render", &[CullPhase::Culled])?;

        let resolved: Vec<GpuRenderBatch> = if self.batches.is_empty() {
            Vec::new()
        } else {
            self.batch_buffer
                .map_slice::<GpuRenderBatch>(self.batches.len())?
                .to_vec()
        };

        let calls = draw_list(&self.batches, &resolved);
        log::trace!("{} of {} batches survived culling", calls.len(), self.batches.len());

        let device = &self.device.device;
        let stride = std::mem::size_of::<GpuIndirectCommand>() as u32;

        for call in &calls {
            let material = materials
                .get(call.material)
                .with_context(|| format!("batch references unknown {:?}", call.material))?;
            let mesh = meshes
                .get(call.mesh)
                .with_context(|| format!("batch references unknown {:?}", call.mesh))?;

            unsafe {
                if call.bind_material {
                    device.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        material.pipeline,
                    );
                    if !material.descriptor_sets.is_empty() {
                        device.cmd_bind_descriptor_sets(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            material.pipeline_layout,
                            0,
                            &material.descriptor_sets,
                            &[],
                        );
                    }
                }

                device.cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertex_buffer], &[0]);
                device.cmd_bind_index_buffer(cmd, mesh.index_buffer, 0, vk::IndexType::UINT32);
                device.cmd_draw_indexed_indirect(
                    cmd,
                    self.indirect_buffer.buffer,
                    call.indirect_offset,
                    call.draw_count,
                    stride,
                );
            }
        }

        self.phase = CullPhase::Rendered;
        Ok(())
    }

    /// Close the cycle once the frame's draws have been submitted.
    pub fn finish_frame(&mut self) -> Result<(), ConfigError> {
        self.expect_phase("finish_frame", &[CullPhase::Rendered])?;
        self.phase = CullPhase::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Sphere;
    use bytemuck::Zeroable;
    use glam::Vec3;

    fn object(material: u32, mesh: u32, center: Vec3) -> RenderObject {
        RenderObject {
            material: Some(MaterialId(material)),
            mesh: Some(MeshId(mesh)),
            active: true,
            transform: Mat4::from_translation(center),
            bounds: Sphere::new(center, 1.0),
            index_count: 36,
        }
    }

    fn scene_data(entry_count: u32) -> GpuSceneData {
        let camera = Camera {
            view: Mat4::IDENTITY,
            projection: Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, 100.0),
            near: 0.1,
            far: 100.0,
        };
        GpuSceneData {
            view: camera.view.to_cols_array_2d(),
            frustum_planes: frustum::frustum_planes(&camera.projection),
            z_near: camera.near,
            z_far: camera.far,
            object_count: entry_count,
            _pad: 0,
        }
    }

    fn run_kernel(objects: &[RenderObject]) -> (Vec<RenderBatch>, Vec<GpuRenderBatch>, Vec<GpuIndirectCommand>, Vec<u32>) {
        let set = batch::create_batches(objects, 64).unwrap();
        let data: Vec<GpuObjectData> = objects
            .iter()
            .map(|o| GpuObjectData {
                model: o.transform.to_cols_array_2d(),
                sphere: [
                    o.bounds.center.x,
                    o.bounds.center.y,
                    o.bounds.center.z,
                    o.bounds.radius,
                ],
            })
            .collect();
        let mut gpu_batches = set.gpu_batches();
        let mut indirect = vec![GpuIndirectCommand::zeroed(); set.objects.len()];
        let mut compacted = vec![COMPACTED_UNSET; set.objects.len()];
        let scene = scene_data(set.objects.len() as u32);
        cull_kernel(&scene, &data, &set.objects, &mut gpu_batches, &mut indirect, &mut compacted);
        (set.batches, gpu_batches, indirect, compacted)
    }

    #[test]
    fn everything_in_front_survives() {
        let objects = vec![
            object(0, 0, Vec3::new(0.0, 0.0, -10.0)),
            object(0, 0, Vec3::new(2.0, 1.0, -12.0)),
            object(1, 1, Vec3::new(-2.0, 0.0, -8.0)),
        ];
        let (batches, resolved, indirect, compacted) = run_kernel(&objects);

        assert_eq!(resolved[0].instance_count, 2);
        assert_eq!(resolved[1].instance_count, 1);

        // with nothing culled every batch resolves to its run length
        for (batch, gpu) in batches.iter().zip(&resolved) {
            assert_eq!(gpu.instance_count, batch.index_count);
        }

        // compacted slots are dense per batch and point back at the scene
        assert_eq!(compacted, vec![0, 1, 2]);
        assert_eq!(indirect[0].first_instance, 0);
        assert_eq!(indirect[2].first_instance, 2);
        assert_eq!(indirect[2].index_count, 36);
        assert_eq!(indirect[2].instance_count, 1);

        let calls = draw_list(&batches, &resolved);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].draw_count, 2);
        assert!(calls[0].bind_material);
        assert!(calls[1].bind_material);
    }

    #[test]
    fn nothing_behind_the_camera_survives() {
        let objects = vec![
            object(0, 0, Vec3::new(0.0, 0.0, 10.0)),
            object(0, 0, Vec3::new(5.0, 0.0, 20.0)),
        ];
        let (batches, resolved, _, compacted) = run_kernel(&objects);

        assert_eq!(resolved[0].instance_count, 0);
        assert!(compacted.iter().all(|&slot| slot == COMPACTED_UNSET));
        assert!(draw_list(&batches, &resolved).is_empty());
    }

    #[test]
    fn culled_object_leaves_its_batch_slot_compact() {
        // middle object of the first batch is far off to the side
        let objects = vec![
            object(0, 0, Vec3::new(0.0, 0.0, -10.0)),
            object(0, 0, Vec3::new(500.0, 0.0, -10.0)),
            object(0, 0, Vec3::new(1.0, 0.0, -10.0)),
        ];
        let (batches, resolved, indirect, compacted) = run_kernel(&objects);

        assert_eq!(resolved[0].instance_count, 2);
        // survivors packed into the batch's first two slots
        assert_eq!(compacted[0], 0);
        assert_eq!(compacted[1], 2);
        assert_eq!(compacted[2], COMPACTED_UNSET);
        assert_eq!(indirect[1].first_instance, 1);

        let calls = draw_list(&batches, &resolved);
        assert_eq!(calls[0].draw_count, 2);
        assert_eq!(calls[0].indirect_offset, 0);
    }

    #[test]
    fn draw_list_skips_empty_batches_and_tracks_material() {
        let batches = vec![
            RenderBatch { material: MaterialId(0), mesh: MeshId(0), first_index: 0, index_count: 2 },
            RenderBatch { material: MaterialId(1), mesh: MeshId(1), first_index: 2, index_count: 1 },
            RenderBatch { material: MaterialId(1), mesh: MeshId(2), first_index: 3, index_count: 1 },
        ];
        let resolved = vec![
            GpuRenderBatch { first_index: 0, index_count: 2, instance_count: 0 },
            GpuRenderBatch { first_index: 2, index_count: 1, instance_count: 1 },
            GpuRenderBatch { first_index: 3, index_count: 1, instance_count: 1 },
        ];

        let calls = draw_list(&batches, &resolved);
        assert_eq!(calls.len(), 2);
        assert!(calls[0].bind_material);
        // same material as the previous surviving batch
        assert!(!calls[1].bind_material);
        let stride = std::mem::size_of::<GpuIndirectCommand>() as vk::DeviceSize;
        assert_eq!(calls[0].indirect_offset, 2 * stride);
        assert_eq!(calls[1].indirect_offset, 3 * stride);
    }
}
