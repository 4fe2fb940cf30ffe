// Attachment descriptions
//
// Attachments are declared up front with dense ids; the graph owns their
// backing images for the pipeline's lifetime and recreates them wholesale
// on resize.

use ash::vk;

/// What an attachment is backed by and how pipelines may use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// A dedicated color image owned by the graph.
    Color,
    /// The single shared depth image. Never readable as an input.
    Depth,
    /// The swapchain image being presented this frame.
    Swapchain,
}

/// Clear value applied when the attachment is loaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearSpec {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearSpec {
    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            ClearSpec::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            ClearSpec::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// One declared attachment. Ids must be dense ascending from 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentDesc {
    pub id: u32,
    pub kind: AttachmentKind,
    /// Ignored for Swapchain attachments (the surface format wins) and for
    /// Depth (always D32_SFLOAT).
    pub format: vk::Format,
    pub clear: ClearSpec,
}

impl AttachmentDesc {
    pub fn color(id: u32, format: vk::Format, clear: [f32; 4]) -> Self {
        Self {
            id,
            kind: AttachmentKind::Color,
            format,
            clear: ClearSpec::Color(clear),
        }
    }

    pub fn depth(id: u32) -> Self {
        Self {
            id,
            kind: AttachmentKind::Depth,
            format: vk::Format::D32_SFLOAT,
            clear: ClearSpec::DepthStencil {
                depth: 1.0,
                stencil: 0,
            },
        }
    }

    pub fn swapchain(id: u32, clear: [f32; 4]) -> Self {
        Self {
            id,
            kind: AttachmentKind::Swapchain,
            format: vk::Format::UNDEFINED,
            clear: ClearSpec::Color(clear),
        }
    }
}
