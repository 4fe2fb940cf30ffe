// GPU-driven visibility culling: contiguous (material, mesh) batches,
// a bounding-sphere kernel compacting survivors into indirect draws,
// and the per-frame phase machine driving both.

pub mod batch;
pub mod engine;
pub mod frustum;

pub use batch::{
    create_batches, BatchSet, GpuIndirectCommand, GpuObjectBatch, GpuObjectData,
    GpuRenderBatch, GpuSceneData, RenderBatch, COMPACTED_UNSET,
};
pub use engine::{cull_kernel, draw_list, CullPhase, CullingEngine, DrawCall};
pub use frustum::{frustum_planes, sphere_visible};
