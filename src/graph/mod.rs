// Render graph: declarative pass/subpass/attachment structure, compiled
// once and realized against the swapchain.

pub mod attachment;
pub mod render_graph;
pub mod structure;

pub use attachment::{AttachmentDesc, AttachmentKind, ClearSpec};
pub use render_graph::RenderGraph;
pub use structure::{
    CompiledGraph, DependencyMasks, PassDesc, RenderGraphStructure, SubpassDesc,
};
