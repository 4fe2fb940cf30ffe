// Buffer and image utilities
//
// GPU-accessible memory with RAII cleanup, plus scoped mapped views so
// every map is paired with an unmap on all exit paths.

use anyhow::{Context, Result};
use ash::vk;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::VulkanDevice;

/// Find a suitable memory type index
pub fn find_memory_type(
    device: &VulkanDevice,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let mem_properties = &device.memory_properties;

    for i in 0..mem_properties.memory_type_count {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = mem_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);

        if has_type && has_properties {
            return Ok(i);
        }
    }

    anyhow::bail!("Failed to find suitable memory type")
}

/// A GPU buffer with its backing memory, destroyed on drop.
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    host_visible: bool,
    device: Arc<VulkanDevice>,
}

impl DeviceBuffer {
    pub fn new(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .device
                .create_buffer(&buffer_info, None)
                .context("Failed to create buffer")?
        };

        let mem_requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let memory_type_index = find_memory_type(
            &device,
            mem_requirements.memory_type_bits,
            memory_properties,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device
                .device
                .allocate_memory(&alloc_info, None)
                .context("Failed to allocate buffer memory")?
        };

        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, memory, 0)
                .context("Failed to bind buffer memory")?;
        }

        Ok(Self {
            buffer,
            memory,
            size,
            host_visible: memory_properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
            device,
        })
    }

    /// Create a host-visible, host-coherent buffer the frame thread can map.
    pub fn host_visible(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::new(
            device,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Map `len` elements of `T` starting at the front of the buffer.
    ///
    /// The returned guard unmaps when it goes out of scope, including on
    /// early returns and error paths.
    pub fn map_slice<T: bytemuck::Pod>(&self, len: usize) -> Result<MappedSlice<'_, T>> {
        anyhow::ensure!(self.host_visible, "buffer is not host visible");
        let byte_len = (std::mem::size_of::<T>() * len) as vk::DeviceSize;
        anyhow::ensure!(
            byte_len <= self.size,
            "mapping {} bytes out of a {}-byte buffer",
            byte_len,
            self.size
        );

        let ptr = unsafe {
            self.device
                .device
                .map_memory(self.memory, 0, byte_len, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")?
        };

        Ok(MappedSlice {
            device: &self.device.device,
            memory: self.memory,
            ptr: ptr as *mut T,
            len,
            _marker: PhantomData,
        })
    }

    /// Copy `data` into the buffer through a scoped mapping.
    pub fn write_slice<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        let mut mapped = self.map_slice::<T>(data.len())?;
        mapped.copy_from_slice(data);
        Ok(())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Scoped view of mapped buffer memory. Unmaps on drop.
pub struct MappedSlice<'a, T: bytemuck::Pod> {
    device: &'a ash::Device,
    memory: vk::DeviceMemory,
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<T: bytemuck::Pod> Deref for MappedSlice<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T: bytemuck::Pod> DerefMut for MappedSlice<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<T: bytemuck::Pod> Drop for MappedSlice<'_, T> {
    fn drop(&mut self) {
        unsafe {
            self.device.unmap_memory(self.memory);
        }
    }
}

/// A 2D image with backing memory and a view, destroyed on drop.
/// Used for the shared depth image and dedicated attachment images.
pub struct ImageResource {
    pub image: vk::Image,
    memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    device: Arc<VulkanDevice>,
}

impl ImageResource {
    pub fn new_2d(
        device: Arc<VulkanDevice>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            device
                .device
                .create_image(&image_info, None)
                .context("Failed to create image")?
        };

        let mem_requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let memory_type_index = find_memory_type(
            &device,
            mem_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device
                .device
                .allocate_memory(&alloc_info, None)
                .context("Failed to allocate image memory")?
        };

        unsafe {
            device
                .device
                .bind_image_memory(image, memory, 0)
                .context("Failed to bind image memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe {
            device
                .device
                .create_image_view(&view_info, None)
                .context("Failed to create image view")?
        };

        Ok(Self {
            image,
            memory,
            view,
            format,
            device,
        })
    }

    /// The shared depth image every graph framebuffer binds.
    pub fn new_depth(device: Arc<VulkanDevice>, extent: vk::Extent2D) -> Result<Self> {
        Self::new_2d(
            device,
            extent,
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )
    }
}

impl Drop for ImageResource {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}
