// Frame backend
//
// Owns the render pass set and the frame slots, borrows the image chain for
// framebuffers, and runs the per-frame protocol through `FrameScheduler`.

use ash::vk;
use std::sync::Arc;

use super::frame::{Acquire, FrameOps, FrameScheduler, FrameStatus, Present, Recreate};
use super::pipeline::RenderPassSet;
use super::shader::{ShaderPaths, ShaderWatcher};
use super::swapchain::ImageChain;
use super::sync::FrameSlot;
use super::DeviceContext;
use crate::config::RendererSettings;
use crate::error::{RenderError, Result, VkResultExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendState {
    Uninitialized,
    Ready,
    Recreating,
}

/// Clear values in attachment order: color, then depth when present.
pub fn clear_values(color: [f32; 4], depth: bool) -> Vec<vk::ClearValue> {
    let mut values = vec![vk::ClearValue {
        color: vk::ClearColorValue { float32: color },
    }];
    if depth {
        values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        });
    }
    values
}

/// Everything the GPU half of the frame protocol touches. Fields drop in
/// dependency order: slots and passes before the chain, the context last.
struct FrameResources {
    slots: Vec<FrameSlot>,
    passes: Option<RenderPassSet>,
    chain: ImageChain,
    context: Arc<DeviceContext>,
    shaders: ShaderPaths,
    clear_color: [f32; 4],
    depth_attachment: bool,
    state: BackendState,
}

impl FrameResources {
    fn initialize(&mut self, width: u32, height: u32, frames_in_flight: usize) -> Result<()> {
        if !self.chain.is_created() && !self.chain.recreate(width, height)? {
            return Err(RenderError::InvalidState("image chain has no images"));
        }

        self.build_pass_set()?;
        self.slots = FrameSlot::create_all(&self.context, frames_in_flight)?;

        self.state = BackendState::Ready;
        Ok(())
    }

    /// Render pass + pipeline for the chain's current format and extent, then
    /// framebuffers against it.
    fn build_pass_set(&mut self) -> Result<()> {
        let depth_format = if self.depth_attachment {
            self.chain.depth_format()
        } else {
            None
        };

        let passes = self.passes.insert(RenderPassSet::create(
            self.context.device(),
            self.chain.format(),
            depth_format,
            self.chain.extent(),
            &self.shaders,
        )?);

        self.chain.create_framebuffers(passes.render_pass, passes.has_depth)
    }

    fn destroy_pass_set(&mut self) {
        self.chain.destroy_framebuffers();
        self.passes = None;
    }

    /// Swap in a pipeline built from the current shader files.
    fn reload_shaders(&mut self) {
        let Some(passes) = self.passes.as_mut() else {
            return;
        };

        if let Err(e) = self.context.wait_idle() {
            log::warn!("{}", e);
        }

        match passes.reload_pipeline(self.chain.extent(), &self.shaders) {
            Ok(()) => log::info!("Shaders reloaded"),
            Err(e) => log::error!("Shader reload failed, keeping previous pipeline: {}", e),
        }
    }

    fn slot(&self, slot: usize) -> Result<&FrameSlot> {
        self.slots
            .get(slot)
            .ok_or(RenderError::InvalidState("frame slot out of range"))
    }

    fn release(&mut self) {
        if self.state == BackendState::Uninitialized
            && self.slots.is_empty()
            && self.passes.is_none()
            && !self.chain.is_created()
        {
            return;
        }

        if let Err(e) = self.context.wait_idle() {
            log::warn!("{}", e);
        }

        self.slots.clear();
        self.destroy_pass_set();
        self.chain.cleanup();

        self.state = BackendState::Uninitialized;
        log::info!("Frame backend released");
    }
}

impl FrameOps for FrameResources {
    fn wait_slot(&mut self, slot: usize) -> Result<()> {
        self.slot(slot)?.wait(self.context.device())
    }

    fn acquire(&mut self, slot: usize) -> Result<Acquire> {
        let semaphore = self.slot(slot)?.sync.image_available;
        self.chain.acquire_next_image(semaphore)
    }

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let device = self.context.device();
        let frame = self.slot(slot)?;
        let passes = self
            .passes
            .as_ref()
            .ok_or(RenderError::InvalidState("render pass not created"))?;
        let framebuffer = self
            .chain
            .framebuffer(image_index)
            .ok_or(RenderError::InvalidState("no framebuffer for acquired image"))?;

        frame.reset(device)?;

        let command_buffer = frame.command_buffer;
        let begin_info = vk::CommandBufferBeginInfo::builder();
        let clear_values = clear_values(self.clear_color, passes.has_depth);
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(passes.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.chain.extent(),
            })
            .clear_values(&clear_values);

        unsafe {
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .during("Begin command buffer")?;

            device.cmd_begin_render_pass(command_buffer, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, passes.pipeline);
            device.cmd_draw(command_buffer, 3, 1, 0, 0);
            device.cmd_end_render_pass(command_buffer);

            device
                .end_command_buffer(command_buffer)
                .during("End command buffer")
        }
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let frame = self.slot(slot)?;

        let wait_semaphores = [frame.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [frame.sync.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.context.device().queue_submit(
                self.context.graphics_queue(),
                &[submit_info],
                frame.sync.in_flight_fence,
            )
        }
        .during("Submit draw command buffer")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<Present> {
        let render_finished = self.slot(slot)?.sync.render_finished;
        self.chain
            .present(self.context.present_queue(), image_index, render_finished)
    }

    fn recreate(&mut self, width: u32, height: u32) -> Result<Recreate> {
        // Negotiate first: a surface with no area leaves everything in place
        let Some(plan) = self.chain.plan(width, height)? else {
            log::debug!("Surface has no area, keeping frame resources");
            return Ok(Recreate::Deferred);
        };

        self.state = BackendState::Recreating;

        self.context.wait_idle()?;
        self.destroy_pass_set();
        self.chain.rebuild(plan)?;
        self.build_pass_set()?;

        self.state = BackendState::Ready;
        log::info!("Recreated frame resources for {}x{}", width, height);
        Ok(Recreate::Rebuilt)
    }
}

impl Drop for FrameResources {
    fn drop(&mut self) {
        self.release();
    }
}

/// Drives rendering into an `ImageChain`.
///
/// Holds the chain for its whole life; the `DeviceContext` is shared and
/// outlives both.
pub struct FrameBackend {
    scheduler: FrameScheduler,
    gpu: FrameResources,
    watcher: Option<ShaderWatcher>,
}

impl FrameBackend {
    pub fn new(
        context: Arc<DeviceContext>,
        chain: ImageChain,
        settings: &RendererSettings,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let shaders = ShaderPaths {
            vertex: settings.vertex_shader.clone(),
            fragment: settings.fragment_shader.clone(),
        };

        let watcher = if settings.hot_reload_shaders {
            match ShaderWatcher::new(&shaders) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Shader hot reload disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut backend = Self {
            scheduler: FrameScheduler::new(width, height),
            gpu: FrameResources {
                slots: Vec::new(),
                passes: None,
                chain,
                context,
                shaders,
                clear_color: settings.clear_color,
                depth_attachment: settings.depth_attachment,
                state: BackendState::Uninitialized,
            },
            watcher,
        };

        backend.initialize()?;
        Ok(backend)
    }

    /// Build the render pass set and frame slots. Partial state is released on
    /// failure.
    pub fn initialize(&mut self) -> Result<()> {
        if self.gpu.state == BackendState::Ready {
            return Ok(());
        }

        let (width, height) = self.scheduler.surface_size();
        match self
            .gpu
            .initialize(width, height, self.scheduler.frames_in_flight())
        {
            Ok(()) => {
                log::info!(
                    "Frame backend ready: {} frames in flight, {}x{}",
                    self.scheduler.frames_in_flight(),
                    self.gpu.chain.extent().width,
                    self.gpu.chain.extent().height
                );
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to initialize frame backend: {}", e);
                self.gpu.release();
                Err(e)
            }
        }
    }

    /// Render and present one frame.
    pub fn draw_frame(&mut self) -> Result<FrameStatus> {
        if self.gpu.state != BackendState::Ready {
            return Err(RenderError::InvalidState("draw_frame on a backend that is not ready"));
        }

        if self.watcher.as_ref().is_some_and(|w| w.poll_changed()) {
            self.gpu.reload_shaders();
        }

        self.scheduler.draw_frame(&mut self.gpu)
    }

    /// Flag a resize; acted on at the start of the next `draw_frame`.
    pub fn on_window_resized(&mut self, width: u32, height: u32) {
        self.scheduler.on_window_resized(width, height);
    }

    pub fn state(&self) -> BackendState {
        self.gpu.state
    }

    pub fn cleanup(&mut self) {
        self.gpu.release();
    }

    pub fn chain(&self) -> &ImageChain {
        &self.gpu.chain
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.gpu.context
    }

    pub fn frames_presented(&self) -> u64 {
        self.scheduler.frames_presented()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::frame::MAX_FRAMES_IN_FLIGHT;

    #[test]
    fn color_only_pass_clears_one_attachment() {
        let values = clear_values([0.1, 0.2, 0.3, 1.0], false);
        assert_eq!(values.len(), 1);
        assert_eq!(unsafe { values[0].color.float32 }, [0.1, 0.2, 0.3, 1.0]);
    }

    #[test]
    fn depth_clears_to_far_plane() {
        let values = clear_values([0.0, 0.0, 0.0, 1.0], true);
        assert_eq!(values.len(), 2);
        let depth = unsafe { values[1].depth_stencil };
        assert_eq!(depth.depth, 1.0);
        assert_eq!(depth.stencil, 0);
    }

    #[test]
    fn slot_count_matches_frames_in_flight() {
        let scheduler = FrameScheduler::new(800, 600);
        assert_eq!(scheduler.frames_in_flight(), MAX_FRAMES_IN_FLIGHT);
    }
}
