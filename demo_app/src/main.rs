//! Instancing demo application
//!
//! Opens a window and drives the frame engine with a field of instanced
//! cubes. Space spawns a ring, H hides every other instance, X destroys the
//! oldest ring, Escape quits. A pre-pass offscreen target stands in for a
//! shadow map so both submission stages run every frame.

use std::cell::RefCell;
use std::rc::Rc;

use bytemuck::{Pod, Zeroable};
use frame_engine::foundation::logging;
use frame_engine::frame::TrashEntry;
use frame_engine::gpu::{BufferHandle, BufferUsage, GpuDevice, MemoryHandle, MemoryProperties};
use frame_engine::prelude::*;
use glfw::{Action, Key, WindowEvent};

type DemoRenderer = FrameRenderer<VulkanDevice, VulkanSurface<Window>>;

const RING_SIZE: usize = 24;
const CONFIG_PATH: &str = "frame_engine.toml";

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
}

const CUBE_VERTICES: [Vertex; 8] = [
    Vertex { position: [-0.5, -0.5, -0.5] },
    Vertex { position: [0.5, -0.5, -0.5] },
    Vertex { position: [0.5, 0.5, -0.5] },
    Vertex { position: [-0.5, 0.5, -0.5] },
    Vertex { position: [-0.5, -0.5, 0.5] },
    Vertex { position: [0.5, -0.5, 0.5] },
    Vertex { position: [0.5, 0.5, 0.5] },
    Vertex { position: [-0.5, 0.5, 0.5] },
];

const CUBE_INDICES: [u32; 36] = [
    0, 1, 2, 2, 3, 0, // back
    4, 6, 5, 6, 4, 7, // front
    0, 3, 7, 7, 4, 0, // left
    1, 5, 6, 6, 2, 1, // right
    3, 2, 6, 6, 7, 3, // top
    0, 4, 5, 5, 1, 0, // bottom
];

/// Upload `bytes` into a fresh host-visible buffer
fn create_static_buffer(
    device: &dyn GpuDevice,
    bytes: &[u8],
    usage: BufferUsage,
) -> GpuResult<(BufferHandle, MemoryHandle)> {
    let (buffer, memory) = device.create_buffer(bytes.len() as u64, usage, MemoryProperties::HOST_STREAMING)?;
    let written = device
        .map_memory(memory, bytes.len() as u64)
        .and_then(|()| device.write_mapped(memory, 0, bytes));
    device.unmap_memory(memory);
    if let Err(err) = written {
        device.destroy_buffer(buffer);
        device.free_memory(memory);
        return Err(err);
    }
    Ok((buffer, memory))
}

struct InstancingDemo {
    renderer: DemoRenderer,
    mesh: MeshRef,
    mesh_buffers: Vec<(BufferHandle, MemoryHandle)>,
    material: Rc<Material>,
    rings: Vec<Vec<Rc<RefCell<ModelInstance>>>>,
    frames: u64,
}

impl InstancingDemo {
    fn new(config: &FrameEngineConfig) -> Result<Self, Box<dyn std::error::Error>> {
        log::info!("Creating window...");
        let mut window = Window::new("Frame Engine - Instancing Demo", 1280, 720)?;

        log::info!("Creating Vulkan context...");
        let context = Rc::new(VulkanContext::new(&mut window, config)?);
        let device = VulkanDevice::new(Rc::clone(&context));
        let surface = VulkanSurface::new(context, window);
        let mut renderer = FrameRenderer::new(device, surface, config)?;
        renderer.set_clear_color([0.02, 0.02, 0.05, 1.0]);

        let shadow_format = renderer.swapchain().format();
        renderer.register_pass(
            -10,
            Box::new(OffscreenPass::new("shadow", shadow_format, PaintStage::PrePass).with_scale(0.5)),
        )?;

        let vertices = create_static_buffer(renderer.device(), bytemuck::cast_slice(&CUBE_VERTICES), BufferUsage::VERTEX)?;
        let indices = create_static_buffer(renderer.device(), bytemuck::cast_slice(&CUBE_INDICES), BufferUsage::INDEX)?;
        let mesh = MeshRef {
            id: 1,
            vertex_buffer: vertices.0,
            index_buffer: indices.0,
            index_count: CUBE_INDICES.len() as u32,
        };

        // no graphics pipeline: groups are batched and uploaded but not drawn
        let material = Rc::new(Material {
            id: 1,
            shader: Rc::new(ShaderLayout::new("model", frame_engine::batch::ModelData::SIZE)),
            textures: Vec::new(),
            pipeline: None,
        });

        Ok(Self {
            renderer,
            mesh,
            mesh_buffers: vec![vertices, indices],
            material,
            rings: Vec::new(),
            frames: 0,
        })
    }

    fn spawn_ring(&mut self) {
        let radius = 2.0 + self.rings.len() as f32;
        let ring: Vec<_> = (0..RING_SIZE)
            .map(|i| {
                let angle = i as f32 / RING_SIZE as f32 * std::f32::consts::TAU;
                let position = Vec3::new(radius * angle.cos(), 0.0, radius * angle.sin());
                let hue = i as f32 / RING_SIZE as f32;
                ModelInstance::new(Transform::from_position(position), [hue, 1.0 - hue, 0.5, 1.0]).shared()
            })
            .collect();
        for instance in &ring {
            let instance: InstanceRef = instance.clone();
            self.renderer.add_instance(self.mesh, &self.material, instance);
        }
        log::info!("Spawned ring {} ({} instances)", self.rings.len(), ring.len());
        self.rings.push(ring);
    }

    fn toggle_every_other(&mut self) {
        for (i, instance) in self.rings.iter().flatten().enumerate() {
            if i % 2 == 0 {
                let mut instance = instance.borrow_mut();
                let active = instance.is_active();
                instance.set_active(!active);
            }
        }
    }

    fn destroy_oldest_ring(&mut self) {
        if self.rings.is_empty() {
            return;
        }
        for instance in self.rings.remove(0) {
            instance.borrow_mut().destroy();
        }
    }

    fn animate(&mut self, time: f32) {
        for (r, ring) in self.rings.iter().enumerate() {
            for (i, instance) in ring.iter().enumerate() {
                let mut instance = instance.borrow_mut();
                let mut position = instance.transform_mut().get().position;
                position.y = (time * 2.0 + i as f32 * 0.4 + r as f32).sin() * 0.5;
                instance.transform_mut().set_position(position);
            }
        }
    }

    fn handle_event(&mut self, event: &WindowEvent) {
        if let WindowEvent::Key(key, _, Action::Press, _) = event {
            match key {
                Key::Escape => self.renderer.surface_mut().window_mut().set_should_close(true),
                Key::Space => self.spawn_ring(),
                Key::H => self.toggle_every_other(),
                Key::X => self.destroy_oldest_ring(),
                _ => {}
            }
        }
    }

    fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_ring();

        while !self.renderer.surface().window().should_close() {
            let events = self.renderer.surface_mut().window_mut().poll_events();
            for event in &events {
                self.handle_event(event);
            }
            if self.renderer.surface_mut().window_mut().take_resized() {
                self.renderer.request_rebuild();
            }

            let time = self.renderer.surface().window().time() as f32;
            self.animate(time);

            match self.renderer.render_frame()? {
                Some(stats) => {
                    self.frames += 1;
                    if stats.frame_number % 600 == 0 {
                        log::info!(
                            "frame {}: {} groups, {} visible, {} reallocations, {} trash entries, {} pools",
                            stats.frame_number,
                            stats.groups,
                            stats.visible_instances,
                            stats.reallocations,
                            stats.trash_depth,
                            stats.descriptor_pools
                        );
                    }
                }
                None if self.renderer.surface().drawable_size().is_empty() => {
                    self.renderer.surface_mut().window_mut().wait_events();
                }
                None => {}
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        for (buffer, memory) in self.mesh_buffers.drain(..) {
            self.renderer.context_mut().retire(TrashEntry::new().buffer(buffer, memory));
        }
        self.renderer.shutdown();
        log::info!("Rendered {} frames", self.frames);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();
    log::info!("Starting frame engine instancing demo");

    let config = FrameEngineConfig::load_or_default(CONFIG_PATH)?;
    config.validate()?;

    let mut app = InstancingDemo::new(&config)?;
    let result = app.run();
    app.shutdown();

    if let Err(err) = &result {
        log::error!("Application error: {err}");
    }
    result
}
