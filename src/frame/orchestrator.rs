// Per-frame orchestration
//
// Owns the surface, swapchain, per-image command buffers, and the
// in-flight sync slots. Each tick waits out the slot fence, acquires an
// image, re-records that image's command buffer through a caller-supplied
// recorder, submits, and presents. A stale surface sets a resize flag;
// the next tick rebuilds the swapchain and the render graph before
// recording again.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

use crate::backend::{
    AcquireOutcome, CommandPool, DeviceBuffer, FrameSync, Swapchain, VulkanDevice,
};
use crate::binding::ResourceBinder;
use crate::config::GraphicsConfig;
use crate::graph::RenderGraph;
use crate::scene::Camera;

/// The global per-frame camera block, refreshed before every recording.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniform {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
}

impl CameraUniform {
    fn from_camera(camera: &Camera) -> Self {
        Self {
            view: camera.view.to_cols_array_2d(),
            projection: camera.projection.to_cols_array_2d(),
        }
    }
}

/// In-flight slot count: never more slots than swapchain images, never
/// fewer than one.
pub fn in_flight_slots(configured: usize, image_count: usize) -> usize {
    configured.min(image_count).max(1)
}

pub struct FrameOrchestrator {
    device: Arc<VulkanDevice>,
    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,
    swapchain: Option<Swapchain>,

    command_pool: CommandPool,
    /// One persistent command buffer per swapchain image, re-recorded
    /// each time its image is acquired.
    command_buffers: Vec<vk::CommandBuffer>,

    frame_sync: Vec<FrameSync>,
    current_frame: usize,
    wait_stages: [vk::PipelineStageFlags; 1],

    camera_buffer: DeviceBuffer,

    preferred_present_mode: vk::PresentModeKHR,
    configured_frames: usize,
    needs_resize: bool,
    minimized: bool,
}

impl FrameOrchestrator {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        surface_loader: ash::extensions::khr::Surface,
        extent: (u32, u32),
        config: &GraphicsConfig,
    ) -> Result<Self> {
        let command_pool = CommandPool::new(device.clone())?;
        let camera_buffer = DeviceBuffer::host_visible(
            device.clone(),
            std::mem::size_of::<CameraUniform>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;

        let mut orchestrator = Self {
            device,
            surface,
            surface_loader,
            swapchain: None,
            command_pool,
            command_buffers: Vec::new(),
            frame_sync: Vec::new(),
            current_frame: 0,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            camera_buffer,
            preferred_present_mode: config.get_present_mode(),
            configured_frames: config.max_frames_in_flight,
            needs_resize: false,
            minimized: false,
        };
        orchestrator.build_swapchain(extent)?;
        Ok(orchestrator)
    }

    pub fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("swapchain not created")
    }

    /// The camera uniform buffer, for binding in application descriptor
    /// sets.
    pub fn camera_buffer(&self) -> &DeviceBuffer {
        &self.camera_buffer
    }

    /// Note a window resize event. A zero-sized window suspends
    /// rendering until it grows back.
    pub fn note_resized(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            self.minimized = true;
        } else {
            self.minimized = false;
            self.needs_resize = true;
        }
    }

    fn build_swapchain(&mut self, extent: (u32, u32)) -> Result<()> {
        let (width, height) = extent;
        if width == 0 || height == 0 {
            self.minimized = true;
            return Ok(());
        }
        self.minimized = false;

        // The surface holds one swapchain at a time
        self.swapchain = None;
        let swapchain = Swapchain::new(
            self.device.clone(),
            self.surface,
            &self.surface_loader,
            width,
            height,
            self.preferred_present_mode,
        )?;

        self.command_pool.free(&self.command_buffers);
        self.command_buffers = self.command_pool.allocate(swapchain.images.len() as u32)?;

        let slots = in_flight_slots(self.configured_frames, swapchain.images.len());
        if slots != self.frame_sync.len() {
            for sync in &self.frame_sync {
                sync.destroy(&self.device.device);
            }
            self.frame_sync = (0..slots)
                .map(|_| FrameSync::new(&self.device))
                .collect::<Result<Vec<_>>>()?;
            self.current_frame = 0;
            log::info!("{} frames in flight", slots);
        }

        self.needs_resize = false;
        Ok(())
    }

    /// Run one frame. Returns false when nothing was rendered (minimized
    /// window or a stale surface that will be rebuilt next tick).
    ///
    /// The recorder is handed a begun command buffer, the acquired image
    /// index, and the graph; it drives pass recording and the culling
    /// engine.
    pub fn tick<F>(
        &mut self,
        extent: (u32, u32),
        camera: Option<&Camera>,
        graph: &mut RenderGraph,
        binder: &ResourceBinder,
        recorder: F,
    ) -> Result<bool>
    where
        F: FnOnce(vk::CommandBuffer, u32, &mut RenderGraph) -> Result<()>,
    {
        if self.minimized {
            return Ok(false);
        }

        if self.needs_resize {
            self.device.wait_idle()?;
            self.build_swapchain(extent)?;
            if self.minimized {
                return Ok(false);
            }
            let swapchain = self.swapchain.as_ref().context("swapchain not created")?;
            graph.rebuild(swapchain)?;
            binder.refresh_input_attachments(graph)?;
        }

        let swapchain = self.swapchain.as_ref().context("swapchain not created")?;
        let sync = &self.frame_sync[self.current_frame];

        // The slot's previous submit must retire before its semaphores
        // can be handed to the driver again.
        sync.wait(&self.device.device)?;

        let image_index = match swapchain.acquire_next_image(u64::MAX, sync.image_available)? {
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    self.needs_resize = true;
                }
                index
            }
            AcquireOutcome::OutOfDate => {
                self.needs_resize = true;
                return Ok(false);
            }
        };

        if let Some(camera) = camera {
            self.camera_buffer
                .write_slice(&[CameraUniform::from_camera(camera)])?;
        }

        let cmd = self.command_buffers[image_index as usize];
        let device = &self.device.device;
        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::builder();
            device.begin_command_buffer(cmd, &begin_info)?;
        }
        recorder(cmd, image_index, graph)?;
        unsafe {
            device.end_command_buffer(cmd)?;
        }

        let wait_semaphores = [sync.image_available];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        sync.reset(&self.device.device)?;
        unsafe {
            device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                sync.in_flight_fence,
            )?;
        }

        let rebuild = swapchain.present(
            self.device.graphics_queue,
            image_index,
            &[sync.render_finished],
        )?;
        if rebuild {
            self.needs_resize = true;
        }

        self.current_frame = (self.current_frame + 1) % self.frame_sync.len();
        Ok(true)
    }
}

impl Drop for FrameOrchestrator {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        for sync in &self.frame_sync {
            sync.destroy(&self.device.device);
        }
        self.swapchain = None;
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_clamp_to_image_count() {
        assert_eq!(in_flight_slots(3, 3), 3);
        assert_eq!(in_flight_slots(3, 2), 2);
        assert_eq!(in_flight_slots(2, 4), 2);
        assert_eq!(in_flight_slots(0, 4), 1);
    }

    #[test]
    fn camera_uniform_layout_is_two_mat4s() {
        assert_eq!(std::mem::size_of::<CameraUniform>(), 128);
    }
}
