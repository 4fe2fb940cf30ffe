// Render graph realization and recording
//
// The compiled structure is realized into one vk::RenderPass per pass and
// one framebuffer per swapchain image. Swapchain attachments bind that
// image's view, the Depth attachment binds the single shared depth image,
// Color attachments each get a dedicated backing image (tagged as an
// input-attachment source when any subpass reads them).
//
// On resize everything Vulkan-owned is discarded and rebuilt from the
// retained structure; there is no incremental patch path.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

use super::attachment::AttachmentKind;
use super::structure::{CompiledGraph, CompiledPass, RenderGraphStructure};
use crate::backend::{ImageResource, Swapchain, VulkanDevice};
use crate::error::ConfigError;

struct RealizedPass {
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    /// Dedicated backing images for Color-kind attachments, keyed by id.
    color_images: HashMap<u32, ImageResource>,
    clear_values: Vec<vk::ClearValue>,
}

impl RealizedPass {
    fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            for &fb in &self.framebuffers {
                device.destroy_framebuffer(fb, None);
            }
            device.destroy_render_pass(self.render_pass, None);
        }
        self.framebuffers.clear();
        self.color_images.clear();
    }
}

/// Where recording currently stands within a pass.
struct RecordState {
    pass: u32,
    next_subpass: u32,
}

pub struct RenderGraph {
    device: Arc<VulkanDevice>,
    structure: RenderGraphStructure,
    compiled: CompiledGraph,
    passes: Vec<RealizedPass>,
    depth: Option<ImageResource>,
    extent: vk::Extent2D,
    recording: Option<RecordState>,
}

impl RenderGraph {
    /// Validate and compile `structure`, then realize it against the
    /// current swapchain.
    pub fn new(
        device: Arc<VulkanDevice>,
        structure: RenderGraphStructure,
        swapchain: &Swapchain,
    ) -> Result<Self> {
        let compiled = structure.compile()?;
        let mut graph = Self {
            device,
            structure,
            compiled,
            passes: Vec::new(),
            depth: None,
            extent: vk::Extent2D::default(),
            recording: None,
        };
        graph.realize(swapchain)?;
        Ok(graph)
    }

    /// Discard all Vulkan objects and re-realize from the retained
    /// structure. Attachment, subpass, and dependency counts are invariant
    /// across this call; only backing images and framebuffers change.
    pub fn rebuild(&mut self, swapchain: &Swapchain) -> Result<()> {
        log::info!(
            "Rebuilding render graph: {}x{}",
            swapchain.extent.width,
            swapchain.extent.height
        );
        self.destroy_realized();
        self.realize(swapchain)
    }

    fn destroy_realized(&mut self) {
        for pass in &mut self.passes {
            pass.destroy(&self.device.device);
        }
        self.passes.clear();
        self.depth = None;
    }

    fn realize(&mut self, swapchain: &Swapchain) -> Result<()> {
        self.extent = swapchain.extent;

        let needs_depth = self
            .compiled
            .attachments
            .iter()
            .any(|a| a.kind == AttachmentKind::Depth);
        if needs_depth {
            self.depth = Some(ImageResource::new_depth(
                self.device.clone(),
                swapchain.extent,
            )?);
        }

        let compiled_passes = self.compiled.passes.clone();
        for pass in &compiled_passes {
            let realized = self.realize_pass(pass, swapchain)?;
            self.passes.push(realized);
        }

        log::info!(
            "Realized {} render pass(es), {} attachment(s)",
            self.passes.len(),
            self.compiled.attachments.len()
        );
        Ok(())
    }

    fn realize_pass(&self, pass: &CompiledPass, swapchain: &Swapchain) -> Result<RealizedPass> {
        let device = &self.device.device;

        // Attachment descriptions in declared id order
        let mut attachment_descs = Vec::with_capacity(self.compiled.attachments.len());
        for attachment in &self.compiled.attachments {
            let desc = match attachment.kind {
                AttachmentKind::Swapchain => vk::AttachmentDescription::builder()
                    .format(swapchain.format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .build(),
                AttachmentKind::Depth => vk::AttachmentDescription::builder()
                    .format(vk::Format::D32_SFLOAT)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
                AttachmentKind::Color => {
                    let read_later = self.compiled.is_input_source(pass.id, attachment.id);
                    vk::AttachmentDescription::builder()
                        .format(attachment.format)
                        .samples(vk::SampleCountFlags::TYPE_1)
                        .load_op(vk::AttachmentLoadOp::CLEAR)
                        .store_op(vk::AttachmentStoreOp::STORE)
                        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                        .initial_layout(vk::ImageLayout::UNDEFINED)
                        .final_layout(if read_later {
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                        } else {
                            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                        })
                        .build()
                }
            };
            attachment_descs.push(desc);
        }

        // Per-subpass reference arrays; kept alive until render pass
        // creation so the raw pointers below stay valid.
        struct SubpassRefs {
            colors: Vec<vk::AttachmentReference>,
            inputs: Vec<vk::AttachmentReference>,
            depth: Option<vk::AttachmentReference>,
        }

        let all_refs: Vec<SubpassRefs> = pass
            .subpasses
            .iter()
            .map(|layout| SubpassRefs {
                colors: layout
                    .colors
                    .iter()
                    .map(|&id| vk::AttachmentReference {
                        attachment: id,
                        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    })
                    .collect(),
                inputs: layout
                    .inputs
                    .iter()
                    .map(|&id| vk::AttachmentReference {
                        attachment: id,
                        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    })
                    .collect(),
                depth: layout.depth.map(|id| vk::AttachmentReference {
                    attachment: id,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                }),
            })
            .collect();

        let subpass_descs: Vec<vk::SubpassDescription> = all_refs
            .iter()
            .map(|refs| {
                let mut builder = vk::SubpassDescription::builder()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&refs.colors)
                    .input_attachments(&refs.inputs);
                if let Some(ref depth) = refs.depth {
                    builder = builder.depth_stencil_attachment(depth);
                }
                builder.build()
            })
            .collect();

        let dependencies: Vec<vk::SubpassDependency> = pass
            .dependencies
            .iter()
            .map(|dep| {
                vk::SubpassDependency::builder()
                    .src_subpass(dep.src.unwrap_or(vk::SUBPASS_EXTERNAL))
                    .dst_subpass(dep.dst.unwrap_or(vk::SUBPASS_EXTERNAL))
                    .src_stage_mask(dep.masks.src_stage)
                    .dst_stage_mask(dep.masks.dst_stage)
                    .src_access_mask(dep.masks.src_access)
                    .dst_access_mask(dep.masks.dst_access)
                    .dependency_flags(vk::DependencyFlags::BY_REGION)
                    .build()
            })
            .collect();

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachment_descs)
            .subpasses(&subpass_descs)
            .dependencies(&dependencies);

        let render_pass = unsafe {
            device
                .create_render_pass(&render_pass_info, None)
                .context("Failed to create render pass")?
        };

        // Dedicated backing images for Color attachments
        let mut color_images = HashMap::new();
        for attachment in &self.compiled.attachments {
            if attachment.kind == AttachmentKind::Color {
                let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
                if self.compiled.is_input_source(pass.id, attachment.id) {
                    usage |= vk::ImageUsageFlags::INPUT_ATTACHMENT;
                }
                let image = ImageResource::new_2d(
                    self.device.clone(),
                    swapchain.extent,
                    attachment.format,
                    usage,
                    vk::ImageAspectFlags::COLOR,
                )?;
                color_images.insert(attachment.id, image);
            }
        }

        // One framebuffer per swapchain image
        let framebuffers: Result<Vec<_>> = swapchain
            .image_views
            .iter()
            .map(|&swapchain_view| {
                let views: Vec<vk::ImageView> = self
                    .compiled
                    .attachments
                    .iter()
                    .map(|attachment| match attachment.kind {
                        AttachmentKind::Swapchain => swapchain_view,
                        AttachmentKind::Depth => {
                            self.depth.as_ref().expect("depth image realized").view
                        }
                        AttachmentKind::Color => color_images[&attachment.id].view,
                    })
                    .collect();

                let framebuffer_info = vk::FramebufferCreateInfo::builder()
                    .render_pass(render_pass)
                    .attachments(&views)
                    .width(swapchain.extent.width)
                    .height(swapchain.extent.height)
                    .layers(1);

                unsafe {
                    device
                        .create_framebuffer(&framebuffer_info, None)
                        .context("Failed to create framebuffer")
                }
            })
            .collect();

        let clear_values = self
            .compiled
            .attachments
            .iter()
            .map(|a| a.clear.to_vk())
            .collect();

        Ok(RealizedPass {
            render_pass,
            framebuffers: framebuffers?,
            color_images,
            clear_values,
        })
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Begin recording `pass` into `cmd` targeting swapchain image
    /// `image_index`. Sets the viewport once, flipped vertically to the
    /// engine's convention.
    pub fn start(&mut self, pass: u32, cmd: vk::CommandBuffer, image_index: u32) -> Result<()> {
        let realized = self
            .passes
            .get(pass as usize)
            .with_context(|| format!("pass {} not realized", pass))?;

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(realized.render_pass)
            .framebuffer(realized.framebuffers[image_index as usize])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            })
            .clear_values(&realized.clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: self.extent.height as f32,
            width: self.extent.width as f32,
            height: -(self.extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        };

        unsafe {
            self.device.device.cmd_begin_render_pass(
                cmd,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
            self.device.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }

        self.recording = Some(RecordState {
            pass,
            next_subpass: 0,
        });
        Ok(())
    }

    /// Step to subpass `index`. Subpass 0 emits no advance command; every
    /// later subpass emits one. Out-of-order stepping is a configuration
    /// error.
    pub fn start_subpass(&mut self, index: u32, cmd: vk::CommandBuffer) -> Result<()> {
        let state = self
            .recording
            .as_mut()
            .context("start_subpass outside start/end")?;

        if index != state.next_subpass {
            return Err(ConfigError::SubpassOrder {
                requested: index,
                expected: state.next_subpass,
            }
            .into());
        }

        if index > 0 {
            unsafe {
                self.device
                    .device
                    .cmd_next_subpass(cmd, vk::SubpassContents::INLINE);
            }
        }
        state.next_subpass += 1;
        Ok(())
    }

    pub fn end_subpass(&mut self, _index: u32) {}

    /// End the pass opened by `start`.
    pub fn end(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        anyhow::ensure!(self.recording.is_some(), "end without start");
        unsafe {
            self.device.device.cmd_end_render_pass(cmd);
        }
        self.recording = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// The image view currently backing (pass, attachment), for lazy
    /// input-attachment resolution. Returns None for Swapchain attachments
    /// (never readable as inputs) and unknown ids.
    pub fn input_attachment_view(&self, pass: u32, attachment: u32) -> Option<vk::ImageView> {
        self.passes
            .get(pass as usize)?
            .color_images
            .get(&attachment)
            .map(|image| image.view)
    }

    /// The realized vk::RenderPass for pipeline creation.
    pub fn vk_render_pass(&self, pass: u32) -> Option<vk::RenderPass> {
        self.passes.get(pass as usize).map(|p| p.render_pass)
    }

    pub fn compiled(&self) -> &CompiledGraph {
        &self.compiled
    }

    pub fn structure(&self) -> &RenderGraphStructure {
        &self.structure
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.destroy_realized();
    }
}
