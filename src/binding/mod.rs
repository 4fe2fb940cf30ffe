// Resource binding: ordered descriptor sets and frozen pipeline
// descriptions compiled against the render graph.

pub mod descriptor;
pub mod pipeline;

pub use descriptor::{BindingDesc, DescriptorSetDesc, ResourceBinder};
pub use pipeline::{
    ComputePipelineDesc, DepthMode, GraphicsPipelineDesc, Pipeline, PushConstantRange,
    VertexLayout,
};
