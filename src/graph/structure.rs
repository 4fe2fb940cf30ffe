// Render-graph structure: validation and device-independent compilation
//
// A structure is compiled exactly once into per-subpass attachment
// reference layouts and a dependency chain. Realization (render passes,
// framebuffers, backing images) happens separately so a resize can
// discard and rebuild the Vulkan objects while the compiled structure is
// retained untouched.

use ash::vk;

use super::attachment::{AttachmentDesc, AttachmentKind};
use crate::error::ConfigError;

/// Stage/access masks carried by a subpass's dependency edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyMasks {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl Default for DependencyMasks {
    fn default() -> Self {
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        Self {
            src_stage: stages,
            dst_stage: stages,
            src_access: access,
            dst_access: access,
        }
    }
}

/// One subpass: which attachments it reads (as input attachments) and
/// which it writes (color, or depth for the Depth-kind attachment).
#[derive(Debug, Clone, Default)]
pub struct SubpassDesc {
    pub id: u32,
    pub reads: Vec<u32>,
    pub writes: Vec<u32>,
    pub masks: DependencyMasks,
}

/// One pass: an ordered list of subpasses sharing the attachment set.
#[derive(Debug, Clone, Default)]
pub struct PassDesc {
    pub id: u32,
    pub subpasses: Vec<SubpassDesc>,
}

/// The full declarative structure handed to the graph.
#[derive(Debug, Clone, Default)]
pub struct RenderGraphStructure {
    pub attachments: Vec<AttachmentDesc>,
    pub passes: Vec<PassDesc>,
}

/// Attachment references for one subpass, resolved by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubpassLayout {
    pub colors: Vec<u32>,
    pub depth: Option<u32>,
    pub inputs: Vec<u32>,
    pub masks: DependencyMasks,
}

/// One dependency edge. `None` endpoints are VK_SUBPASS_EXTERNAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyDesc {
    pub src: Option<u32>,
    pub dst: Option<u32>,
    pub masks: DependencyMasks,
}

/// Compiled form of one pass.
#[derive(Debug, Clone)]
pub struct CompiledPass {
    pub id: u32,
    pub subpasses: Vec<SubpassLayout>,
    pub dependencies: Vec<DependencyDesc>,
}

/// The compiled graph: everything realization needs, nothing Vulkan owns.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub attachments: Vec<AttachmentDesc>,
    pub passes: Vec<CompiledPass>,
}

impl RenderGraphStructure {
    /// Validate ids and attachment usage, then lay out every subpass's
    /// references and the dependency chain.
    pub fn compile(&self) -> Result<CompiledGraph, ConfigError> {
        for (expected, attachment) in self.attachments.iter().enumerate() {
            if attachment.id != expected as u32 {
                return Err(ConfigError::NonDenseAttachmentIds {
                    expected: expected as u32,
                    found: attachment.id,
                });
            }
        }

        let mut passes = Vec::with_capacity(self.passes.len());
        for (expected, pass) in self.passes.iter().enumerate() {
            if pass.id != expected as u32 {
                return Err(ConfigError::NonDensePassIds {
                    expected: expected as u32,
                    found: pass.id,
                });
            }
            passes.push(self.compile_pass(pass)?);
        }

        Ok(CompiledGraph {
            attachments: self.attachments.clone(),
            passes,
        })
    }

    fn compile_pass(&self, pass: &PassDesc) -> Result<CompiledPass, ConfigError> {
        let mut subpasses = Vec::with_capacity(pass.subpasses.len());

        for (expected, subpass) in pass.subpasses.iter().enumerate() {
            if subpass.id != expected as u32 {
                return Err(ConfigError::NonDenseSubpassIds {
                    pass: pass.id,
                    expected: expected as u32,
                    found: subpass.id,
                });
            }
            subpasses.push(self.compile_subpass(pass.id, subpass)?);
        }

        if subpasses.is_empty() {
            return Err(ConfigError::EmptyPass { pass: pass.id });
        }

        // External edge in, one edge per adjacent subpass pair, external
        // edge out: S + 1 edges total. Each edge carries the downstream
        // subpass's masks (the outgoing external edge carries the last's).
        let mut dependencies = Vec::with_capacity(subpasses.len() + 1);
        dependencies.push(DependencyDesc {
            src: None,
            dst: Some(0),
            masks: subpasses[0].masks,
        });
        for i in 1..subpasses.len() as u32 {
            dependencies.push(DependencyDesc {
                src: Some(i - 1),
                dst: Some(i),
                masks: subpasses[i as usize].masks,
            });
        }
        dependencies.push(DependencyDesc {
            src: Some(subpasses.len() as u32 - 1),
            dst: None,
            masks: subpasses.last().unwrap().masks,
        });

        Ok(CompiledPass {
            id: pass.id,
            subpasses,
            dependencies,
        })
    }

    fn compile_subpass(
        &self,
        pass_id: u32,
        subpass: &SubpassDesc,
    ) -> Result<SubpassLayout, ConfigError> {
        let kind_of = |attachment: u32| -> Result<AttachmentKind, ConfigError> {
            self.attachments
                .get(attachment as usize)
                .map(|a| a.kind)
                .ok_or(ConfigError::MissingAttachment {
                    pass: pass_id,
                    subpass: subpass.id,
                    attachment,
                })
        };

        // Color references come from all non-depth writes; the single
        // Depth-kind write becomes the depth reference.
        let mut colors = Vec::new();
        let mut depth = None;
        for &written in &subpass.writes {
            match kind_of(written)? {
                AttachmentKind::Depth => {
                    if depth.replace(written).is_some() {
                        return Err(ConfigError::MultipleDepthTargets {
                            pass: pass_id,
                            subpass: subpass.id,
                        });
                    }
                }
                AttachmentKind::Color | AttachmentKind::Swapchain => colors.push(written),
            }
        }

        let mut inputs = Vec::new();
        for &read in &subpass.reads {
            if kind_of(read)? == AttachmentKind::Depth {
                return Err(ConfigError::DepthAttachmentRead {
                    pass: pass_id,
                    subpass: subpass.id,
                    attachment: read,
                });
            }
            inputs.push(read);
        }

        Ok(SubpassLayout {
            colors,
            depth,
            inputs,
            masks: subpass.masks,
        })
    }
}

impl CompiledGraph {
    /// Whether any subpass of `pass` reads `attachment` as an input.
    pub fn is_input_source(&self, pass: u32, attachment: u32) -> bool {
        self.passes
            .get(pass as usize)
            .map(|p| {
                p.subpasses
                    .iter()
                    .any(|s| s.inputs.contains(&attachment))
            })
            .unwrap_or(false)
    }

    /// Color attachment count of (pass, subpass), if that target exists.
    /// Pipelines validate their blend-state array against this.
    pub fn color_attachment_count(&self, pass: u32, subpass: u32) -> Option<usize> {
        self.passes
            .get(pass as usize)?
            .subpasses
            .get(subpass as usize)
            .map(|s| s.colors.len())
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    pub fn subpass_count(&self, pass: u32) -> usize {
        self.passes
            .get(pass as usize)
            .map(|p| p.subpasses.len())
            .unwrap_or(0)
    }

    pub fn dependency_count(&self, pass: u32) -> usize {
        self.passes
            .get(pass as usize)
            .map(|p| p.dependencies.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::attachment::AttachmentDesc;

    fn two_subpass_structure() -> RenderGraphStructure {
        RenderGraphStructure {
            attachments: vec![
                AttachmentDesc::swapchain(0, [0.0; 4]),
                AttachmentDesc::depth(1),
                AttachmentDesc::color(2, vk::Format::R8G8B8A8_UNORM, [0.0; 4]),
            ],
            passes: vec![PassDesc {
                id: 0,
                subpasses: vec![
                    SubpassDesc {
                        id: 0,
                        reads: vec![],
                        writes: vec![2, 1],
                        masks: DependencyMasks::default(),
                    },
                    SubpassDesc {
                        id: 1,
                        reads: vec![2],
                        writes: vec![0],
                        masks: DependencyMasks::default(),
                    },
                ],
            }],
        }
    }

    #[test]
    fn compiles_references_by_kind() {
        let compiled = two_subpass_structure().compile().unwrap();
        let pass = &compiled.passes[0];

        assert_eq!(pass.subpasses[0].colors, vec![2]);
        assert_eq!(pass.subpasses[0].depth, Some(1));
        assert!(pass.subpasses[0].inputs.is_empty());

        assert_eq!(pass.subpasses[1].colors, vec![0]);
        assert_eq!(pass.subpasses[1].depth, None);
        assert_eq!(pass.subpasses[1].inputs, vec![2]);

        assert!(compiled.is_input_source(0, 2));
        assert!(!compiled.is_input_source(0, 0));
    }

    #[test]
    fn dependency_chain_has_external_edges() {
        let compiled = two_subpass_structure().compile().unwrap();
        let deps = &compiled.passes[0].dependencies;

        // external -> 0, 0 -> 1, 1 -> external
        assert_eq!(deps.len(), 3);
        assert_eq!((deps[0].src, deps[0].dst), (None, Some(0)));
        assert_eq!((deps[1].src, deps[1].dst), (Some(0), Some(1)));
        assert_eq!((deps[2].src, deps[2].dst), (Some(1), None));
    }

    #[test]
    fn rejects_subpass_id_gap() {
        let mut structure = two_subpass_structure();
        structure.passes[0].subpasses[1].id = 2; // {0, 2}
        assert_eq!(
            structure.compile().unwrap_err(),
            ConfigError::NonDenseSubpassIds {
                pass: 0,
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn rejects_pass_id_gap() {
        let mut structure = two_subpass_structure();
        structure.passes[0].id = 1;
        assert_eq!(
            structure.compile().unwrap_err(),
            ConfigError::NonDensePassIds {
                expected: 0,
                found: 1
            }
        );
    }

    #[test]
    fn rejects_depth_attachment_as_input() {
        let mut structure = two_subpass_structure();
        structure.passes[0].subpasses[1].reads.push(1);
        assert_eq!(
            structure.compile().unwrap_err(),
            ConfigError::DepthAttachmentRead {
                pass: 0,
                subpass: 1,
                attachment: 1
            }
        );
    }

    #[test]
    fn rejects_two_depth_writes() {
        let mut structure = two_subpass_structure();
        structure.attachments.push(AttachmentDesc::depth(3));
        structure.passes[0].subpasses[0].writes.push(3);
        assert_eq!(
            structure.compile().unwrap_err(),
            ConfigError::MultipleDepthTargets {
                pass: 0,
                subpass: 0
            }
        );
    }

    #[test]
    fn rejects_unknown_attachment() {
        let mut structure = two_subpass_structure();
        structure.passes[0].subpasses[0].writes.push(9);
        assert_eq!(
            structure.compile().unwrap_err(),
            ConfigError::MissingAttachment {
                pass: 0,
                subpass: 0,
                attachment: 9
            }
        );
    }

    #[test]
    fn recompile_is_stable() {
        // Resize retains the structure and recompiles it; counts must not
        // drift between compilations.
        let structure = two_subpass_structure();
        let first = structure.compile().unwrap();
        let second = structure.compile().unwrap();
        assert_eq!(first.attachment_count(), second.attachment_count());
        assert_eq!(first.subpass_count(0), second.subpass_count(0));
        assert_eq!(first.dependency_count(0), second.dependency_count(0));
    }
}
