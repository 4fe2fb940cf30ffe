// Descriptor sets - ordered GPU resource binding
//
// Sets are registered in ascending index order and realized in one shot.
// Every binding resolves eagerly except input attachments, which resolve
// lazily to whatever image view the named (pass, attachment) currently
// owns, and are re-resolved whenever that pass's backing images are
// rebuilt.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::backend::VulkanDevice;
use crate::error::ConfigError;
use crate::graph::RenderGraph;

/// One descriptor binding. Binding index within the set is positional.
#[derive(Debug, Clone, Copy)]
pub enum BindingDesc {
    UniformBuffer {
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    },
    StorageBuffer {
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    },
    CombinedImageSampler {
        view: vk::ImageView,
        sampler: vk::Sampler,
    },
    StorageImage {
        view: vk::ImageView,
    },
    /// Resolved lazily against the render graph's current backing image.
    InputAttachment {
        pass: u32,
        attachment: u32,
    },
}

impl BindingDesc {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            BindingDesc::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
            BindingDesc::StorageBuffer { .. } => vk::DescriptorType::STORAGE_BUFFER,
            BindingDesc::CombinedImageSampler { .. } => {
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            }
            BindingDesc::StorageImage { .. } => vk::DescriptorType::STORAGE_IMAGE,
            BindingDesc::InputAttachment { .. } => vk::DescriptorType::INPUT_ATTACHMENT,
        }
    }
}

/// An ordered list of bindings forming one descriptor set.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetDesc {
    pub bindings: Vec<(BindingDesc, vk::ShaderStageFlags)>,
}

impl DescriptorSetDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binding(mut self, desc: BindingDesc, stages: vk::ShaderStageFlags) -> Self {
        self.bindings.push((desc, stages));
        self
    }
}

struct RealizedSets {
    device: Arc<VulkanDevice>,
    layouts: Vec<vk::DescriptorSetLayout>,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
}

impl Drop for RealizedSets {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_descriptor_pool(self.pool, None);
            for &layout in &self.layouts {
                self.device
                    .device
                    .destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}

/// Builds ordered descriptor sets and their layouts.
#[derive(Default)]
pub struct ResourceBinder {
    descs: Vec<DescriptorSetDesc>,
    realized: Option<RealizedSets>,
}

impl ResourceBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register descriptor set `index`. Sets must be registered in
    /// ascending index order 0..N-1; anything else is a fatal
    /// configuration error.
    pub fn register_set(&mut self, index: u32, desc: DescriptorSetDesc) -> Result<(), ConfigError> {
        if index as usize != self.descs.len() {
            return Err(ConfigError::DescriptorSetOrder { index });
        }
        self.descs.push(desc);
        Ok(())
    }

    pub fn set_count(&self) -> usize {
        self.descs.len()
    }

    /// Create layouts, allocate sets, and write every eager binding.
    /// Input attachments need a realized graph to resolve against; sets
    /// without input attachments (compute) may pass `None`.
    pub fn realize(&mut self, device: Arc<VulkanDevice>, graph: Option<&RenderGraph>) -> Result<()> {
        anyhow::ensure!(self.realized.is_none(), "descriptor sets already realized");

        let vk_device = &device.device;

        // Layouts: binding index is the position within the set
        let mut layouts = Vec::with_capacity(self.descs.len());
        for desc in &self.descs {
            let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
                .bindings
                .iter()
                .enumerate()
                .map(|(i, (binding, stages))| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(i as u32)
                        .descriptor_type(binding.descriptor_type())
                        .descriptor_count(1)
                        .stage_flags(*stages)
                        .build()
                })
                .collect();

            let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
            let layout = unsafe {
                vk_device
                    .create_descriptor_set_layout(&layout_info, None)
                    .context("Failed to create descriptor set layout")?
            };
            layouts.push(layout);
        }

        // Pool sized by per-type totals
        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for desc in &self.descs {
            for (binding, _) in &desc.bindings {
                let ty = binding.descriptor_type();
                match pool_sizes.iter_mut().find(|s| s.ty == ty) {
                    Some(size) => size.descriptor_count += 1,
                    None => pool_sizes.push(vk::DescriptorPoolSize {
                        ty,
                        descriptor_count: 1,
                    }),
                }
            }
        }

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(self.descs.len() as u32)
            .pool_sizes(&pool_sizes);
        let pool = unsafe {
            vk_device
                .create_descriptor_pool(&pool_info, None)
                .context("Failed to create descriptor pool")?
        };

        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe {
            vk_device
                .allocate_descriptor_sets(&alloc_info)
                .context("Failed to allocate descriptor sets")?
        };

        self.realized = Some(RealizedSets {
            device,
            layouts,
            pool,
            sets,
        });

        self.write_bindings(false, graph)?;
        self.write_bindings(true, graph)
    }

    /// Re-resolve every input-attachment binding against the graph's
    /// current backing images. Must be called after a graph rebuild.
    pub fn refresh_input_attachments(&self, graph: &RenderGraph) -> Result<()> {
        self.write_bindings(true, Some(graph))
    }

    fn write_bindings(&self, input_attachments_only: bool, graph: Option<&RenderGraph>) -> Result<()> {
        let realized = self
            .realized
            .as_ref()
            .context("descriptor sets not realized")?;
        let vk_device = &realized.device.device;

        // Info structs must outlive the update call
        let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::new();
        let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::new();
        // (set, binding, type, buffer_info index or image_info index)
        enum Slot {
            Buffer(usize),
            Image(usize),
        }
        let mut writes_meta: Vec<(u32, u32, vk::DescriptorType, Slot)> = Vec::new();

        for (set_index, desc) in self.descs.iter().enumerate() {
            for (binding_index, (binding, _)) in desc.bindings.iter().enumerate() {
                let is_input = matches!(binding, BindingDesc::InputAttachment { .. });
                if input_attachments_only != is_input {
                    continue;
                }

                match *binding {
                    BindingDesc::UniformBuffer { buffer, range }
                    | BindingDesc::StorageBuffer { buffer, range } => {
                        buffer_infos.push(vk::DescriptorBufferInfo {
                            buffer,
                            offset: 0,
                            range,
                        });
                        writes_meta.push((
                            set_index as u32,
                            binding_index as u32,
                            binding.descriptor_type(),
                            Slot::Buffer(buffer_infos.len() - 1),
                        ));
                    }
                    BindingDesc::CombinedImageSampler { view, sampler } => {
                        image_infos.push(vk::DescriptorImageInfo {
                            sampler,
                            image_view: view,
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        });
                        writes_meta.push((
                            set_index as u32,
                            binding_index as u32,
                            binding.descriptor_type(),
                            Slot::Image(image_infos.len() - 1),
                        ));
                    }
                    BindingDesc::StorageImage { view } => {
                        image_infos.push(vk::DescriptorImageInfo {
                            sampler: vk::Sampler::null(),
                            image_view: view,
                            image_layout: vk::ImageLayout::GENERAL,
                        });
                        writes_meta.push((
                            set_index as u32,
                            binding_index as u32,
                            binding.descriptor_type(),
                            Slot::Image(image_infos.len() - 1),
                        ));
                    }
                    BindingDesc::InputAttachment { pass, attachment } => {
                        let graph = graph.context(
                            "input attachment bindings need a realized render graph",
                        )?;
                        let view =
                            graph.input_attachment_view(pass, attachment).with_context(
                                || {
                                    format!(
                                        "input attachment (pass {}, attachment {}) has no backing image",
                                        pass, attachment
                                    )
                                },
                            )?;
                        image_infos.push(vk::DescriptorImageInfo {
                            sampler: vk::Sampler::null(),
                            image_view: view,
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        });
                        writes_meta.push((
                            set_index as u32,
                            binding_index as u32,
                            binding.descriptor_type(),
                            Slot::Image(image_infos.len() - 1),
                        ));
                    }
                }
            }
        }

        let writes: Vec<vk::WriteDescriptorSet> = writes_meta
            .iter()
            .map(|(set, binding, ty, slot)| {
                let mut write = vk::WriteDescriptorSet::builder()
                    .dst_set(realized.sets[*set as usize])
                    .dst_binding(*binding)
                    .descriptor_type(*ty);
                match slot {
                    Slot::Buffer(i) => {
                        write = write.buffer_info(std::slice::from_ref(&buffer_infos[*i]));
                    }
                    Slot::Image(i) => {
                        write = write.image_info(std::slice::from_ref(&image_infos[*i]));
                    }
                }
                write.build()
            })
            .collect();

        if !writes.is_empty() {
            unsafe {
                vk_device.update_descriptor_sets(&writes, &[]);
            }
        }
        Ok(())
    }

    pub fn layouts(&self) -> &[vk::DescriptorSetLayout] {
        self.realized
            .as_ref()
            .map(|r| r.layouts.as_slice())
            .unwrap_or(&[])
    }

    pub fn set(&self, index: u32) -> Option<vk::DescriptorSet> {
        self.realized
            .as_ref()
            .and_then(|r| r.sets.get(index as usize).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_sets_in_order() {
        let mut binder = ResourceBinder::new();
        binder.register_set(0, DescriptorSetDesc::new()).unwrap();
        binder.register_set(1, DescriptorSetDesc::new()).unwrap();
        assert_eq!(binder.set_count(), 2);
    }

    #[test]
    fn rejects_out_of_order_registration() {
        let mut binder = ResourceBinder::new();
        assert_eq!(
            binder.register_set(1, DescriptorSetDesc::new()),
            Err(ConfigError::DescriptorSetOrder { index: 1 })
        );

        binder.register_set(0, DescriptorSetDesc::new()).unwrap();
        assert_eq!(
            binder.register_set(3, DescriptorSetDesc::new()),
            Err(ConfigError::DescriptorSetOrder { index: 3 })
        );
        // re-registering an existing index is equally invalid
        assert_eq!(
            binder.register_set(0, DescriptorSetDesc::new()),
            Err(ConfigError::DescriptorSetOrder { index: 0 })
        );
    }

    #[test]
    fn binding_types_map_to_vulkan() {
        let cases = [
            (
                BindingDesc::UniformBuffer {
                    buffer: vk::Buffer::null(),
                    range: 16,
                },
                vk::DescriptorType::UNIFORM_BUFFER,
            ),
            (
                BindingDesc::StorageBuffer {
                    buffer: vk::Buffer::null(),
                    range: 16,
                },
                vk::DescriptorType::STORAGE_BUFFER,
            ),
            (
                BindingDesc::InputAttachment {
                    pass: 0,
                    attachment: 0,
                },
                vk::DescriptorType::INPUT_ATTACHMENT,
            ),
        ];
        for (binding, expected) in cases {
            assert_eq!(binding.descriptor_type(), expected);
        }
    }
}
