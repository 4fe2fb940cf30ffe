// Typed setup-time errors
//
// Fatal configuration errors indicate a programming error in the owning
// application: they abort setup and are never silently recovered.
// Runtime Vulkan failures stay on anyhow with context, as in backend/.

use thiserror::Error;

/// A fatal, setup-time configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pass ids must be dense ascending from 0: expected {expected}, found {found}")]
    NonDensePassIds { expected: u32, found: u32 },

    #[error("subpass ids in pass {pass} must be dense ascending from 0: expected {expected}, found {found}")]
    NonDenseSubpassIds { pass: u32, expected: u32, found: u32 },

    #[error("pass {pass} declares no subpasses")]
    EmptyPass { pass: u32 },

    #[error("pass {pass}, subpass {subpass} references unknown attachment {attachment}")]
    MissingAttachment { pass: u32, subpass: u32, attachment: u32 },

    #[error("pass {pass}, subpass {subpass} reads depth attachment {attachment}; depth attachments may never be inputs")]
    DepthAttachmentRead { pass: u32, subpass: u32, attachment: u32 },

    #[error("pass {pass}, subpass {subpass} writes more than one depth attachment")]
    MultipleDepthTargets { pass: u32, subpass: u32 },

    #[error("attachment ids must be dense ascending from 0: expected {expected}, found {found}")]
    NonDenseAttachmentIds { expected: u32, found: u32 },

    #[error("descriptor set {index} registered before sets 0..{index} exist")]
    DescriptorSetOrder { index: u32 },

    #[error("push constant range added after pipeline compilation")]
    PushConstantAfterCompile,

    #[error("pipeline targets pass {pass}, subpass {subpass}, which does not exist")]
    UnknownRenderTarget { pass: u32, subpass: u32 },

    #[error("culling invoked with no active camera")]
    NoActiveCamera,

    #[error("scene object count {count} exceeds culling buffer capacity {capacity}")]
    CapacityExceeded { count: usize, capacity: usize },

    #[error("culling {operation} called in phase {phase:?}")]
    OutOfPhase { operation: &'static str, phase: crate::culling::CullPhase },

    #[error("subpass {requested} started out of order (expected {expected})")]
    SubpassOrder { requested: u32, expected: u32 },
}
