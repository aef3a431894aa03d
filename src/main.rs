// =============================================================================
// MODEL RENDERER - textured model on Vulkan
// =============================================================================
//
// FRAME FLOW:
// 1. Wait for the current frame slot's fence
// 2. Acquire a swapchain image (stale swapchain: rebuild, skip the frame)
// 3. Wait for whichever slot last rendered into that image
// 4. Update the image's uniform buffer and submit its pre-recorded commands
// 5. Present, then move on to the next slot
//
// Window events only set flags; all GPU work happens on RedrawRequested.
// =============================================================================

mod backend;
mod config;
mod mesh;
mod renderer;

use anyhow::{Context, Result};
use ash::vk;
use config::{AssetsConfig, Config};
use mesh::{Mesh, TextureData};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use renderer::{Renderer, RendererSettings, SceneAssets};
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

use backend::{FrameStatus, SurfaceTarget};

/// Side of the built-in checkerboard texture
const FALLBACK_TEXTURE_SIZE: u32 = 256;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    let config = Config::load();
    log::info!("Starting model renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Drop GPU resources before reporting
    drop(app.renderer.take());

    match app.fatal.take() {
        Some(e) => {
            log::error!("Fatal error: {:#}", e);
            Err(e)
        }
        None => Ok(()),
    }
}

/// `info` unless overridden through RUST_LOG
fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Read every input the renderer needs, substituting built-ins where unset
fn load_assets(assets: &AssetsConfig) -> Result<SceneAssets> {
    let mesh = match &assets.model {
        Some(path) => Mesh::load_obj(path)?,
        None => {
            log::info!("No model configured, using the built-in quad");
            Mesh::quad()
        }
    };

    let texture = match &assets.texture {
        Some(path) => TextureData::load(path)?,
        None => {
            log::info!("No texture configured, using a checkerboard");
            TextureData::checkerboard(FALLBACK_TEXTURE_SIZE)
        }
    };

    let vertex_spv = std::fs::read(&assets.vertex_shader)
        .with_context(|| format!("Failed to read shader {:?}", assets.vertex_shader))?;
    let fragment_spv = std::fs::read(&assets.fragment_shader)
        .with_context(|| format!("Failed to read shader {:?}", assets.fragment_shader))?;

    Ok(SceneAssets {
        mesh,
        texture,
        vertex_spv,
        fragment_spv,
    })
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,

    // Renderer before window: the surface must go before the window it targets
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,

    needs_recreate: bool,
    is_minimized: bool,
    is_fullscreen: bool,

    /// First unrecoverable error; ends the event loop
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            renderer: None,
            window: None,
            needs_recreate: false,
            is_minimized: false,
            is_fullscreen,
            fatal: None,
        }
    }

    fn init_renderer(&self, window: &Window) -> Result<Renderer> {
        log::info!("Initializing Vulkan...");

        let target = SurfaceTarget {
            display: window.display_handle()?.as_raw(),
            window: window.window_handle()?.as_raw(),
        };

        let settings = RendererSettings {
            app_name: self.config.window.title.clone(),
            validation: self.config.debug.validation_layers,
            present_mode: self.config.present_mode(),
            max_frames_in_flight: self.config.graphics.max_frames_in_flight,
            clear_color: self.config.graphics.clear_color,
        };

        let assets = load_assets(&self.config.assets)?;
        let renderer = Renderer::new(target, window_extent(window), &settings, assets)?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    /// Render a single frame, rebuilding the swapchain first if it went stale
    fn render_frame(&mut self) -> Result<()> {
        if self.is_minimized {
            return Ok(());
        }
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return Ok(());
        };

        if self.needs_recreate {
            if !renderer.recreate_swapchain(window_extent(window))? {
                return Ok(());
            }
            self.needs_recreate = false;
        }

        match renderer.draw_frame().context("Failed to draw frame")? {
            FrameStatus::Presented => {}
            FrameStatus::SwapchainStale | FrameStatus::NeedsRecreate => {
                self.needs_recreate = true;
            }
        }

        Ok(())
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

            self.needs_recreate = true;
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }
}

fn window_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match self.init_renderer(&window) {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                self.window = Some(window);
            }
            Err(e) => self.fail(event_loop, e.context("Failed to initialize renderer")),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref renderer) = self.renderer {
                    if let Err(e) = renderer.wait_idle() {
                        log::warn!("Failed to wait for the GPU before exit: {}", e);
                    }
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                // Minimized windows report a zero size; resume on the next real one
                self.is_minimized = size.width == 0 || size.height == 0;
                self.needs_recreate = true;
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    self.fail(event_loop, e);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
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

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
