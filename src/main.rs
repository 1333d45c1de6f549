// =============================================================================
// VULKAN FRAME CORE - windowing shell
// =============================================================================
//
// Thin winit front end over the library: it owns the window, builds the
// rendering core once the window exists, and forwards resize and redraw
// events to it.
//
// CONSTRUCTION ORDER:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Window (winit)                                                 │
// │    └── DeviceContext (instance, surface, device, queues, pool)  │
// │          └── ImageChain (swapchain, views, depth)               │
// │                └── FrameBackend (render pass, pipeline, slots)  │
// └─────────────────────────────────────────────────────────────────┘
//
// Teardown runs bottom-up: FrameBackend, ImageChain, then DeviceContext once
// the last Arc goes away.
//
// =============================================================================

use anyhow::{Context, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use std::time::Instant;
use vk_frame_core::backend::{DeviceContext, FrameBackend, FrameStatus, ImageChain};
use vk_frame_core::config::Config;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting Vulkan frame core");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app).context("Event loop terminated with an error")?;

    Ok(())
}

/// Install env_logger; `RUST_LOG` overrides the configured filter.
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .filter_level(config.log_level())
        .parse_env("RUST_LOG")
        .init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the backend goes before the window its
/// surface was created from.
struct App {
    backend: Option<FrameBackend>,
    window: Option<Arc<Window>>,
    config: Config,
    is_fullscreen: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            backend: None,
            window: None,
            config,
            is_fullscreen,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    /// Device context, image chain and frame backend for `window`.
    fn init_renderer(&self, window: &Window) -> Result<FrameBackend> {
        let settings = self.config.renderer_settings();
        let size = window.inner_size();

        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let context = DeviceContext::new(display, handle, &settings)
            .context("Failed to create device context")?;
        let chain = ImageChain::new(
            context.clone(),
            size.width,
            size.height,
            settings.preferred_present_mode,
            settings.depth_attachment,
        )
        .context("Failed to create image chain")?;
        let backend = FrameBackend::new(context, chain, &settings, size.width, size.height)
            .context("Failed to create frame backend")?;

        log::info!(
            "Renderer ready: {:?} {:?}, {} images",
            backend.chain().format(),
            backend.chain().present_mode(),
            backend.chain().image_count()
        );
        Ok(backend)
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

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
            // winit follows up with a Resized event
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
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

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut backend) = self.backend.take() {
            log::info!(
                "Shutting down after {} presented frames",
                backend.frames_presented()
            );
            backend.cleanup();
        }
        event_loop.exit();
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

        match self.init_renderer(&window) {
            Ok(backend) => self.backend = Some(backend),
            Err(e) => {
                log::error!("Failed to initialize renderer: {:?}", e);
                event_loop.exit();
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                if let Some(ref mut backend) = self.backend {
                    backend.on_window_resized(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => {
                let Some(ref mut backend) = self.backend else {
                    return;
                };

                match backend.draw_frame() {
                    Ok(FrameStatus::Presented) => self.update_fps(),
                    Ok(FrameStatus::Dropped | FrameStatus::Skipped) => {}
                    Err(e) => {
                        log::error!("Render error: {}", e);
                        self.shutdown(event_loop);
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown(event_loop);
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

    /// Continuous redraw.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
