// =============================================================================
// RT RENDERER - demo application
// =============================================================================
//
// Opens a window, uploads the configured scene, builds its acceleration
// structures and renders it with ray-query shadows until closed.
//
// FRAME FLOW:
// 1. Recreate swapchain if the window changed
// 2. Advance object motion
// 3. Renderer::begin  (slot reset, BLAS/TLAS refresh, clear, bind TLAS)
// 4. Renderer::submit (one draw per object)
// 5. Renderer::end    (execute, signal, present, wait for next slot)
//
// =============================================================================

use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use rt_renderer::backend::{shader, ContextDesc, GraphicsPipeline, VulkanContext};
use rt_renderer::config::{Config, ModelKind, SceneConfig};
use rt_renderer::gpu::Viewport;
use rt_renderer::{logging, FrameView, MeshData, Renderer, Scene};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    logging::init_logging(&config);
    log::info!("Starting RT renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Present mode: {}, {} frames",
        config.graphics.present_mode,
        config.graphics.frame_count
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Everything that lives on the GPU.
///
/// IMPORTANT: Field order matters for Drop! The renderer and scene release
/// their buffers before the context tears down the device.
struct GpuState {
    renderer: Renderer<VulkanContext>,
    scene: Scene<VulkanContext>,
    context: VulkanContext,
}

pub struct App {
    // ─────────────────────────────────────────────────────────────────────────
    // CONFIGURATION
    // ─────────────────────────────────────────────────────────────────────────
    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // GPU & WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    gpu: Option<GpuState>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // STATE FLAGS
    // ─────────────────────────────────────────────────────────────────────────
    /// Set to true when window is resized - triggers swapchain recreation
    needs_resize: bool,
    /// Set to true when window is minimized (size = 0) - skip rendering
    is_minimized: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // TIMING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
    last_update: Instant,
    last_profile_report: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            gpu: None,
            window: None,
            is_fullscreen,
            needs_resize: false,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
            last_update: now,
            last_profile_report: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Device, pipeline, renderer and scene for `window`.
    fn init_gpu(&self, window: &Window) -> Result<GpuState> {
        let size = window.inner_size();
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let mut context = VulkanContext::new(
            window,
            &ContextDesc {
                app_name: &self.config.window.title,
                enable_validation,
                width: size.width,
                height: size.height,
                present_mode: self.config.present_mode(),
                frame_count: self.config.graphics.frame_count as u32,
            },
        )?;

        match load_pipeline(&context, &self.config) {
            Ok(pipeline) => context.set_pipeline(pipeline),
            Err(e) => log::warn!("No graphics pipeline ({:#}), frames will only clear", e),
        }

        let mut renderer = Renderer::new(&context, &self.config.renderer_desc())?;
        let mut scene = Scene::new(self.config.acceleration_options()?);

        // ─────────────────────────────────────────────────────────────────────
        // Upload meshes and place objects
        // ─────────────────────────────────────────────────────────────────────
        let objects = self.config.scene_objects();
        renderer.immediate_submit(&context, |ctx, fence| {
            for (kind, placement, motion) in &objects {
                let model = scene.add_model(ctx, fence, kind.name(), &mesh_for(*kind))?;
                scene.add_object(model, *placement, *motion)?;
            }
            Ok(())
        })?;

        // ─────────────────────────────────────────────────────────────────────
        // Initial BLAS/TLAS build
        // ─────────────────────────────────────────────────────────────────────
        renderer.immediate_submit(&context, |ctx, fence| scene.build_acceleration_structures(ctx, fence))?;
        log::info!(
            "Scene ready: {} models, {} objects, {} bottom-level structures",
            scene.model_count(),
            scene.object_count(),
            scene.acceleration().bottom_level_count()
        );

        Ok(GpuState {
            renderer,
            scene,
            context,
        })
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Render one frame. Returns false when nothing was drawn.
    fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        let (Some(gpu), Some(window)) = (self.gpu.as_mut(), self.window.as_ref()) else {
            return Ok(false);
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Handle resize
        // ─────────────────────────────────────────────────────────────────────
        if self.needs_resize || gpu.context.needs_recreate() {
            let size = window.inner_size();
            if size.width == 0 || size.height == 0 {
                return Ok(false);
            }
            gpu.context.recreate_swapchain(size.width, size.height)?;
            gpu.renderer.resize(&gpu.context)?;
            self.needs_resize = false;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Animate
        // ─────────────────────────────────────────────────────────────────────
        let now = Instant::now();
        let dt = now.duration_since(self.last_update).as_secs_f32();
        self.last_update = now;
        gpu.scene.update(dt);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Begin / Submit / End
        // ─────────────────────────────────────────────────────────────────────
        let view = FrameView {
            view_projection: view_projection(&self.config.scene, gpu.renderer.viewport()),
        };
        gpu.renderer.begin(&gpu.context, &mut gpu.scene, &view)?;
        gpu.renderer.submit(&gpu.context, &gpu.scene)?;
        gpu.renderer.end(&gpu.context)?;

        let interval = self.config.debug.profile_report_interval;
        if interval > 0.0 && now.duration_since(self.last_profile_report).as_secs_f32() >= interval {
            gpu.renderer.profiler().report();
            self.last_profile_report = now;
        }

        Ok(true)
    }

    /// Drain the GPU before the event loop exits.
    fn shut_down(&mut self) {
        if let Some(gpu) = self.gpu.as_mut() {
            if let Err(e) = gpu.renderer.on_shut_down() {
                log::error!("Shutdown flush failed: {:?}", e);
            }
            log::info!("Rendered {} frames", gpu.renderer.frames_rendered());
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                // Exit fullscreen
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_resize = true;
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    pub fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// SCENE HELPERS
// =============================================================================

fn mesh_for(kind: ModelKind) -> MeshData {
    match kind {
        ModelKind::Triangle => MeshData::triangle([1.0, 0.55, 0.1, 1.0]),
        ModelKind::Quad => MeshData::quad([0.6, 0.6, 0.65, 1.0]),
        ModelKind::Cube => MeshData::cube([0.2, 0.45, 0.9, 1.0]),
    }
}

fn view_projection(scene: &SceneConfig, viewport: Viewport) -> Mat4 {
    let aspect = viewport.width as f32 / viewport.height.max(1) as f32;
    let view = Mat4::look_at_rh(
        Vec3::from(scene.camera_position),
        Vec3::from(scene.camera_target),
        Vec3::Y,
    );
    let projection = Mat4::perspective_rh(scene.field_of_view.to_radians(), aspect, 0.1, 100.0);
    projection * view
}

/// Load both SPIR-V stages and build the pipeline; the modules are only
/// needed during creation.
fn load_pipeline(context: &VulkanContext, config: &Config) -> Result<GraphicsPipeline> {
    let device = context.device();
    let vert = shader::load_shader_module(device, &config.graphics.vertex_shader)?;
    let frag = match shader::load_shader_module(device, &config.graphics.fragment_shader) {
        Ok(frag) => frag,
        Err(e) => {
            unsafe { device.device.destroy_shader_module(vert, None) };
            return Err(e);
        }
    };

    let pipeline = GraphicsPipeline::new(
        device,
        context.pipeline_layout(),
        context.color_format(),
        vert,
        frag,
    );

    unsafe {
        device.device.destroy_shader_module(vert, None);
        device.device.destroy_shader_module(frag, None);
    }
    pipeline.context("Failed to create graphics pipeline")
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Create window with settings from config
        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        // Set fullscreen if configured
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match self.init_gpu(&window) {
            Ok(gpu) => self.gpu = Some(gpu),
            Err(e) => {
                log::error!("Failed to initialize renderer: {:?}", e);
                event_loop.exit();
                return;
            }
        }

        self.window = Some(window);
    }

    /// Handle window events.
    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shut_down();
                event_loop.exit();
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // REDRAW REQUESTED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    // No recovery path: a failed frame leaves the slot open
                    log::error!("Render error: {:?}", e);
                    self.shut_down();
                    event_loop.exit();
                }
            },

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            // ESC - Quit application
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shut_down();
                                event_loop.exit();
                            }
                            // F11 - Toggle fullscreen
                            KeyCode::F11 => {
                                self.toggle_fullscreen();
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Called when the event loop is about to block waiting for events.
    /// We use this to request continuous redraws for maximum FPS.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up GPU resources...");
        // Renderer, scene, then context (see GpuState field order)
        self.gpu = None;
        log::info!("Cleanup complete");
    }
}
