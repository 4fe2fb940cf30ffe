// Pipeline descriptions and compilation
//
// A pipeline description is assembled incrementally (shaders, push
// constants, raster state, render target) and compiled once. After
// compilation the description is frozen: adding push constant ranges to
// a compiled pipeline is a fatal configuration error.

use anyhow::{Context, Result};
use ash::vk;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{shader, VulkanDevice};
use crate::error::ConfigError;
use crate::graph::{CompiledGraph, RenderGraph};

/// How a graphics pipeline interacts with the subpass depth attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepthMode {
    None,
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl DepthMode {
    fn test_enable(self) -> bool {
        matches!(self, DepthMode::Read | DepthMode::ReadWrite)
    }

    fn write_enable(self) -> bool {
        matches!(self, DepthMode::Write | DepthMode::ReadWrite)
    }
}

/// A push constant range declared against a pipeline layout.
#[derive(Debug, Clone, Copy)]
pub struct PushConstantRange {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

impl PushConstantRange {
    fn to_vk(self) -> vk::PushConstantRange {
        vk::PushConstantRange {
            stage_flags: self.stages,
            offset: self.offset,
            size: self.size,
        }
    }
}

/// Vertex buffer layout fed to a graphics pipeline.
#[derive(Debug, Clone, Default)]
pub struct VertexLayout {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexLayout {
    /// Interleaved position + normal + color, all vec3, one binding.
    pub fn position_normal_color() -> Self {
        let binding = vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride((9 * std::mem::size_of::<f32>()) as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build();

        let attribute = |location: u32, offset: u32| {
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(location)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset)
                .build()
        };

        Self {
            bindings: vec![binding],
            attributes: vec![attribute(0, 0), attribute(1, 12), attribute(2, 24)],
        }
    }
}

/// A compiled graphics or compute pipeline plus its layout.
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device
                .device
                .destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Incrementally assembled description of a graphics pipeline.
pub struct GraphicsPipelineDesc {
    vertex_shader: PathBuf,
    fragment_shader: PathBuf,
    target_pass: u32,
    target_subpass: u32,
    push_constants: Vec<PushConstantRange>,
    vertex_layout: VertexLayout,
    topology: vk::PrimitiveTopology,
    polygon_mode: vk::PolygonMode,
    cull_mode: vk::CullModeFlags,
    depth: DepthMode,
    compiled: bool,
}

impl GraphicsPipelineDesc {
    pub fn new<P: AsRef<Path>>(
        vertex_shader: P,
        fragment_shader: P,
        target_pass: u32,
        target_subpass: u32,
    ) -> Self {
        Self {
            vertex_shader: vertex_shader.as_ref().to_path_buf(),
            fragment_shader: fragment_shader.as_ref().to_path_buf(),
            target_pass,
            target_subpass,
            push_constants: Vec::new(),
            vertex_layout: VertexLayout::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            depth: DepthMode::ReadWrite,
            compiled: false,
        }
    }

    pub fn push_constant_range(&mut self, range: PushConstantRange) -> Result<&mut Self, ConfigError> {
        if self.compiled {
            return Err(ConfigError::PushConstantAfterCompile);
        }
        self.push_constants.push(range);
        Ok(self)
    }

    pub fn vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = layout;
        self
    }

    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn polygon_mode(mut self, mode: vk::PolygonMode) -> Self {
        self.polygon_mode = mode;
        self
    }

    pub fn cull_mode(mut self, mode: vk::CullModeFlags) -> Self {
        self.cull_mode = mode;
        self
    }

    pub fn depth(mut self, mode: DepthMode) -> Self {
        self.depth = mode;
        self
    }

    /// Check the target (pass, subpass) against the compiled graph and
    /// return the subpass color attachment count, which sizes the blend
    /// state array.
    pub fn validate_target(&self, graph: &CompiledGraph) -> Result<usize, ConfigError> {
        graph
            .color_attachment_count(self.target_pass, self.target_subpass)
            .ok_or(ConfigError::UnknownRenderTarget {
                pass: self.target_pass,
                subpass: self.target_subpass,
            })
    }

    /// Compile against the realized graph. Freezes the description.
    pub fn compile(
        &mut self,
        device: Arc<VulkanDevice>,
        set_layouts: &[vk::DescriptorSetLayout],
        graph: &RenderGraph,
    ) -> Result<Pipeline> {
        let color_count = self.validate_target(graph.compiled())?;
        let render_pass = graph
            .vk_render_pass(self.target_pass)
            .context("render pass not realized")?;
        self.compiled = true;

        let vk_device = &device.device;

        let push_constant_ranges: Vec<vk::PushConstantRange> =
            self.push_constants.iter().map(|r| r.to_vk()).collect();
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe {
            vk_device
                .create_pipeline_layout(&layout_info, None)
                .context("Failed to create pipeline layout")?
        };

        let vert_module = shader::load_shader_module(&device, &self.vertex_shader)?;
        let frag_module = shader::load_shader_module(&device, &self.fragment_shader)?;

        let entry_point = std::ffi::CString::new("main").unwrap();
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(&entry_point)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(&entry_point)
                .build(),
        ];

        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&self.vertex_layout.bindings)
            .vertex_attribute_descriptions(&self.vertex_layout.attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(self.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic; the graph sets them when a
        // pass starts, so resizes never require pipeline rebuilds.
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(self.polygon_mode)
            .line_width(1.0)
            .cull_mode(self.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(self.depth.test_enable())
            .depth_write_enable(self.depth.write_enable())
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // One opaque blend state per subpass color attachment
        let blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();
        let color_blend_attachments = vec![blend_attachment; color_count];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .dynamic_state(&dynamic_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(self.target_subpass)
            .build();

        let result = unsafe {
            vk_device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
                .context("Failed to create graphics pipeline")
        };

        unsafe {
            vk_device.destroy_shader_module(vert_module, None);
            vk_device.destroy_shader_module(frag_module, None);
        }

        let pipelines = match result {
            Ok(p) => p,
            Err(e) => {
                unsafe { vk_device.destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        Ok(Pipeline {
            pipeline: pipelines[0],
            layout,
            device,
        })
    }
}

/// Description of a compute pipeline.
pub struct ComputePipelineDesc {
    shader: PathBuf,
    push_constants: Vec<PushConstantRange>,
    compiled: bool,
}

impl ComputePipelineDesc {
    pub fn new<P: AsRef<Path>>(shader: P) -> Self {
        Self {
            shader: shader.as_ref().to_path_buf(),
            push_constants: Vec::new(),
            compiled: false,
        }
    }

    pub fn push_constant_range(&mut self, range: PushConstantRange) -> Result<&mut Self, ConfigError> {
        if self.compiled {
            return Err(ConfigError::PushConstantAfterCompile);
        }
        self.push_constants.push(range);
        Ok(self)
    }

    pub fn compile(
        &mut self,
        device: Arc<VulkanDevice>,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Pipeline> {
        self.compiled = true;
        let vk_device = &device.device;

        let push_constant_ranges: Vec<vk::PushConstantRange> =
            self.push_constants.iter().map(|r| r.to_vk()).collect();
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe {
            vk_device
                .create_pipeline_layout(&layout_info, None)
                .context("Failed to create compute pipeline layout")?
        };

        let module = shader::load_shader_module(&device, &self.shader)?;
        let entry_point = std::ffi::CString::new("main").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point)
            .build();

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();

        let result = unsafe {
            vk_device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
                .context("Failed to create compute pipeline")
        };

        unsafe { vk_device.destroy_shader_module(module, None) };

        let pipelines = match result {
            Ok(p) => p,
            Err(e) => {
                unsafe { vk_device.destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        Ok(Pipeline {
            pipeline: pipelines[0],
            layout,
            device,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{
        AttachmentDesc, DependencyMasks, PassDesc, RenderGraphStructure, SubpassDesc,
    };

    fn single_pass_graph() -> CompiledGraph {
        RenderGraphStructure {
            attachments: vec![
                AttachmentDesc::swapchain(0, [0.0; 4]),
                AttachmentDesc::depth(1),
            ],
            passes: vec![PassDesc {
                id: 0,
                subpasses: vec![SubpassDesc {
                    id: 0,
                    reads: vec![],
                    writes: vec![0, 1],
                    masks: DependencyMasks::default(),
                }],
            }],
        }
        .compile()
        .unwrap()
    }

    #[test]
    fn validates_existing_target() {
        let graph = single_pass_graph();
        let desc = GraphicsPipelineDesc::new("a.vert.spv", "a.frag.spv", 0, 0);
        // one color attachment; the depth write is not a color target
        assert_eq!(desc.validate_target(&graph), Ok(1));
    }

    #[test]
    fn rejects_unknown_target() {
        let graph = single_pass_graph();
        let desc = GraphicsPipelineDesc::new("a.vert.spv", "a.frag.spv", 0, 3);
        assert_eq!(
            desc.validate_target(&graph),
            Err(ConfigError::UnknownRenderTarget { pass: 0, subpass: 3 })
        );
        let desc = GraphicsPipelineDesc::new("a.vert.spv", "a.frag.spv", 2, 0);
        assert_eq!(
            desc.validate_target(&graph),
            Err(ConfigError::UnknownRenderTarget { pass: 2, subpass: 0 })
        );
    }

    #[test]
    fn rejects_push_constants_after_compile() {
        let mut desc = GraphicsPipelineDesc::new("a.vert.spv", "a.frag.spv", 0, 0);
        let range = PushConstantRange {
            stages: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: 128,
        };
        desc.push_constant_range(range).unwrap();
        desc.compiled = true; // compile() sets this before device work
        assert_eq!(
            desc.push_constant_range(range).err(),
            Some(ConfigError::PushConstantAfterCompile)
        );
    }

    #[test]
    fn depth_modes_map_to_test_and_write() {
        assert!(!DepthMode::None.test_enable() && !DepthMode::None.write_enable());
        assert!(DepthMode::Read.test_enable() && !DepthMode::Read.write_enable());
        assert!(!DepthMode::Write.test_enable() && DepthMode::Write.write_enable());
        assert!(DepthMode::ReadWrite.test_enable() && DepthMode::ReadWrite.write_enable());
    }

    #[test]
    fn default_vertex_layout_is_interleaved() {
        let layout = VertexLayout::position_normal_color();
        assert_eq!(layout.bindings.len(), 1);
        assert_eq!(layout.bindings[0].stride, 36);
        assert_eq!(layout.attributes.len(), 3);
        assert_eq!(layout.attributes[2].offset, 24);
    }
}
