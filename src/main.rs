// draw-forge demo driver
//
// Builds a single-pass forward graph (swapchain color + depth), a grid
// of cubes sharing one material, and drives the per-frame cycle:
// snapshot -> cull -> indirect draw -> present.

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Vec3};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

use draw_forge::backend::{DeviceBuffer, VulkanDevice};
use draw_forge::binding::{
    BindingDesc, DescriptorSetDesc, GraphicsPipelineDesc, Pipeline, ResourceBinder, VertexLayout,
};
use draw_forge::config::Config;
use draw_forge::culling::CullingEngine;
use draw_forge::frame::FrameOrchestrator;
use draw_forge::graph::{
    AttachmentDesc, PassDesc, RenderGraph, RenderGraphStructure, SubpassDesc,
};
use draw_forge::scene::{
    Camera, GpuMaterial, GpuMesh, MaterialRegistry, MeshRegistry, RenderObject, Sphere,
};

fn main() -> Result<()> {
    let config = Config::load();
    init_logging();
    log::info!("Starting draw-forge");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

/// Everything device-side, created once the window exists.
struct Renderer {
    device: Arc<VulkanDevice>,
    engine: CullingEngine,
    binder: ResourceBinder,
    graph: RenderGraph,
    // registries hold raw handles; the owning pipeline and buffers live here
    _pipeline: Pipeline,
    _cube_vertices: DeviceBuffer,
    _cube_indices: DeviceBuffer,
    materials: MaterialRegistry,
    meshes: MeshRegistry,
    objects: Vec<RenderObject>,
    camera: Camera,
    orchestrator: FrameOrchestrator,
}

impl Renderer {
    fn new(window: &Window, config: &Config) -> Result<Self> {
        use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(&config.window.title, enable_validation, display_handle)?;

        let surface_loader =
            ash::extensions::khr::Surface::new(&device.entry, &device.instance);
        let surface = unsafe {
            ash_window::create_surface(
                &device.entry,
                &device.instance,
                display_handle,
                window_handle,
                None,
            )
            .context("Failed to create window surface")?
        };

        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )?
        };
        anyhow::ensure!(supported, "GPU cannot present to this surface");

        let size = window.inner_size();
        let orchestrator = FrameOrchestrator::new(
            device.clone(),
            surface,
            surface_loader,
            (size.width, size.height),
            &config.graphics,
        )?;

        // Forward pass: swapchain color target + shared depth
        let structure = RenderGraphStructure {
            attachments: vec![
                AttachmentDesc::swapchain(0, config.graphics.clear_color),
                AttachmentDesc::depth(1),
            ],
            passes: vec![PassDesc {
                id: 0,
                subpasses: vec![SubpassDesc {
                    id: 0,
                    reads: vec![],
                    writes: vec![0, 1],
                    ..Default::default()
                }],
            }],
        };
        let graph = RenderGraph::new(device.clone(), structure, orchestrator.swapchain()?)?;

        let engine = CullingEngine::new(
            device.clone(),
            &config.culling,
            Path::new("shaders/cull.comp.spv"),
        )?;

        // Set 0: camera block + the engine's object/compacted buffers,
        // resolved by the vertex stage per instance
        let vertex = vk::ShaderStageFlags::VERTEX;
        let mut binder = ResourceBinder::new();
        binder.register_set(
            0,
            DescriptorSetDesc::new()
                .binding(
                    BindingDesc::UniformBuffer {
                        buffer: orchestrator.camera_buffer().buffer,
                        range: orchestrator.camera_buffer().size,
                    },
                    vertex,
                )
                .binding(
                    BindingDesc::StorageBuffer {
                        buffer: engine.object_data_buffer().buffer,
                        range: engine.object_data_buffer().size,
                    },
                    vertex,
                )
                .binding(
                    BindingDesc::StorageBuffer {
                        buffer: engine.compacted_buffer().buffer,
                        range: engine.compacted_buffer().size,
                    },
                    vertex,
                ),
        )?;
        binder.realize(device.clone(), Some(&graph))?;

        let pipeline = GraphicsPipelineDesc::new(
            Path::new("shaders/mesh.vert.spv"),
            Path::new("shaders/mesh.frag.spv"),
            0,
            0,
        )
        .vertex_layout(VertexLayout::position_normal_color())
        .compile(device.clone(), binder.layouts(), &graph)?;

        let (cube_vertices, cube_indices, index_count) = upload_cube_mesh(&device)?;

        let mut materials = MaterialRegistry::new();
        let material = materials.insert(GpuMaterial {
            pipeline: pipeline.pipeline,
            pipeline_layout: pipeline.layout,
            descriptor_sets: binder.set(0).into_iter().collect(),
        });

        let mut meshes = MeshRegistry::new();
        let mesh = meshes.insert(GpuMesh {
            vertex_buffer: cube_vertices.buffer,
            index_buffer: cube_indices.buffer,
            index_count,
        });

        // 9x9 grid of cubes on the XZ plane
        let mut objects = Vec::new();
        for x in -4i32..=4 {
            for z in -4i32..=4 {
                let center = Vec3::new(x as f32 * 3.0, 0.0, z as f32 * 3.0);
                objects.push(RenderObject {
                    material: Some(material),
                    mesh: Some(mesh),
                    active: true,
                    transform: Mat4::from_translation(center),
                    bounds: Sphere::new(center, 0.9),
                    index_count,
                });
            }
        }
        log::info!("Scene: {} objects", objects.len());

        let camera = make_camera(size.width, size.height);

        Ok(Self {
            device,
            engine,
            binder,
            graph,
            _pipeline: pipeline,
            _cube_vertices: cube_vertices,
            _cube_indices: cube_indices,
            materials,
            meshes,
            objects,
            camera,
            orchestrator,
        })
    }

    fn render(&mut self, extent: (u32, u32)) -> Result<bool> {
        if extent.0 > 0 && extent.1 > 0 {
            self.camera = make_camera(extent.0, extent.1);
        }

        self.engine.create_batches(&self.objects)?;

        let camera = self.camera;
        let engine = &mut self.engine;
        let materials = &self.materials;
        let meshes = &self.meshes;

        let rendered = self.orchestrator.tick(
            extent,
            Some(&camera),
            &mut self.graph,
            &self.binder,
            |cmd, image_index, graph| {
                engine.cull(Some(&camera))?;
                graph.start(0, cmd, image_index)?;
                graph.start_subpass(0, cmd)?;
                engine.render(cmd, materials, meshes)?;
                graph.end_subpass(0);
                graph.end(cmd)
            },
        )?;
        if rendered {
            self.engine.finish_frame()?;
        }
        Ok(rendered)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
    }
}

fn make_camera(width: u32, height: u32) -> Camera {
    let aspect = width as f32 / height.max(1) as f32;
    Camera {
        view: Mat4::look_at_rh(Vec3::new(0.0, 6.0, 14.0), Vec3::ZERO, Vec3::Y),
        projection: Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 100.0),
        near: 0.1,
        far: 100.0,
    }
}

/// Unit cube, 24 vertices of interleaved position/normal/color, 36
/// indices.
fn upload_cube_mesh(device: &Arc<VulkanDevice>) -> Result<(DeviceBuffer, DeviceBuffer, u32)> {
    // (normal, tangent, bitangent, face color)
    let faces: [(Vec3, Vec3, Vec3, Vec3); 6] = [
        (Vec3::Z, Vec3::X, Vec3::Y, Vec3::new(0.9, 0.3, 0.3)),
        (-Vec3::Z, -Vec3::X, Vec3::Y, Vec3::new(0.3, 0.9, 0.3)),
        (Vec3::X, -Vec3::Z, Vec3::Y, Vec3::new(0.3, 0.3, 0.9)),
        (-Vec3::X, Vec3::Z, Vec3::Y, Vec3::new(0.9, 0.9, 0.3)),
        (Vec3::Y, Vec3::X, -Vec3::Z, Vec3::new(0.3, 0.9, 0.9)),
        (-Vec3::Y, Vec3::X, Vec3::Z, Vec3::new(0.9, 0.3, 0.9)),
    ];

    let mut vertices: Vec<f32> = Vec::with_capacity(24 * 9);
    let mut indices: Vec<u32> = Vec::with_capacity(36);

    for (i, (normal, tangent, bitangent, color)) in faces.iter().enumerate() {
        let base = (i * 4) as u32;
        for (u, v) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let position = (*normal + *tangent * u + *bitangent * v) * 0.5;
            vertices.extend_from_slice(&position.to_array());
            vertices.extend_from_slice(&normal.to_array());
            vertices.extend_from_slice(&color.to_array());
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    let vertex_buffer = DeviceBuffer::host_visible(
        device.clone(),
        (vertices.len() * std::mem::size_of::<f32>()) as vk::DeviceSize,
        vk::BufferUsageFlags::VERTEX_BUFFER,
    )?;
    vertex_buffer.write_slice(&vertices)?;

    let index_buffer = DeviceBuffer::host_visible(
        device.clone(),
        (indices.len() * std::mem::size_of::<u32>()) as vk::DeviceSize,
        vk::BufferUsageFlags::INDEX_BUFFER,
    )?;
    index_buffer.write_slice(&indices)?;

    Ok((vertex_buffer, index_buffer, indices.len() as u32))
}

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
    is_fullscreen: bool,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            window: None,
            renderer: None,
            is_fullscreen,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match Renderer::new(&window, &self.config) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                log::error!("Failed to initialize renderer: {:?}", e);
                event_loop.exit();
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut renderer) = self.renderer {
                    renderer.orchestrator.note_resized(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                let extent = self
                    .window
                    .as_ref()
                    .map(|w| {
                        let size = w.inner_size();
                        (size.width, size.height)
                    })
                    .unwrap_or((0, 0));

                if let Some(ref mut renderer) = self.renderer {
                    match renderer.render(extent) {
                        Ok(true) => self.update_fps(),
                        Ok(false) => {}
                        Err(e) => {
                            log::error!("Render error: {:?}", e);
                            event_loop.exit();
                        }
                    }
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
