//! Frame context: render targets, command buffers and the draw loop step
//!
//! Owns everything that depends on the swapchain: the optional depth target,
//! the render pass, one framebuffer, one command buffer and one fence per
//! swapchain image, plus the acquire/render-complete semaphore pair.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use crate::core::config::RendererConfig;
use crate::render::frame::{run_frame, FrameContent, FrameOps, FrameState};
use crate::render::vulkan::framebuffer::framebuffer_attachments;
use crate::render::vulkan::{
    DepthBuffer, DeviceContext, Framebuffer, FrameSync, PresentationSurface, RenderPass, VulkanError, VulkanResult,
};

/// Depth clear value used when a depth target is attached
pub const DEPTH_CLEAR: vk::ClearDepthStencilValue = vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 };

/// Frame settings taken from [`RendererConfig`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSettings {
    /// Force FIFO presentation
    pub vsync: bool,
    /// Attach a depth/stencil target
    pub use_depth: bool,
    /// Bound for acquire and fence waits
    pub fence_timeout_ns: u64,
    /// Color attachment clear value
    pub clear_color: [f32; 4],
}

impl From<&RendererConfig> for FrameSettings {
    fn from(config: &RendererConfig) -> Self {
        Self {
            vsync: config.vsync,
            use_depth: config.use_depth,
            fence_timeout_ns: config.fence_timeout_ns,
            clear_color: config.clear_color,
        }
    }
}

/// Clear values in attachment order
pub fn clear_values(color: [f32; 4], with_depth: bool) -> Vec<vk::ClearValue> {
    let mut values = vec![vk::ClearValue {
        color: vk::ClearColorValue { float32: color },
    }];
    if with_depth {
        values.push(vk::ClearValue {
            depth_stencil: DEPTH_CLEAR,
        });
    }
    values
}

/// Viewport covering the whole extent with depth range 0..1
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Scissor covering the whole extent
pub fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// Steps of a swapchain rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStep {
    /// Destroy framebuffers referencing the old image views
    ReleaseFramebuffers,
    /// Destroy the old depth target
    ReleaseDepth,
    /// New swapchain and views; the old views and swapchain are destroyed here
    Swapchain,
    /// Depth target at the new extent
    Depth,
    /// One framebuffer per new image
    Framebuffers,
    /// One command buffer per new image
    CommandBuffers,
    /// Fences and semaphores, when stale or the image count changed
    Sync,
}

/// Order in which [`FrameContext::window_resize`] runs the rebuild
pub const REBUILD_ORDER: [RebuildStep; 7] = [
    RebuildStep::ReleaseFramebuffers,
    RebuildStep::ReleaseDepth,
    RebuildStep::Swapchain,
    RebuildStep::Depth,
    RebuildStep::Framebuffers,
    RebuildStep::CommandBuffers,
    RebuildStep::Sync,
];

/// Swapchain-bound rendering state
pub struct FrameContext {
    command_buffers: Vec<vk::CommandBuffer>,
    framebuffers: Vec<Framebuffer>,
    render_pass: Option<RenderPass>,
    depth: Option<DepthBuffer>,
    sync: Option<FrameSync>,
    surface: PresentationSurface,
    current_image: u32,
    // Set when a frame failed between acquire and submit
    sync_stale: bool,
    // Set when the last rebuild stopped part way
    needs_rebuild: bool,
    state: FrameState,
    settings: FrameSettings,
    context: Arc<DeviceContext>,
}

impl FrameContext {
    /// Create the window surface. Nothing else exists until [`prepare`](Self::prepare)
    pub fn new<W>(context: &Arc<DeviceContext>, window: &W, settings: FrameSettings) -> VulkanResult<Self>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        let surface = PresentationSurface::init_surface(context, window)?;

        Ok(Self {
            command_buffers: Vec::new(),
            framebuffers: Vec::new(),
            render_pass: None,
            depth: None,
            sync: None,
            surface,
            current_image: 0,
            sync_stale: false,
            needs_rebuild: false,
            state: FrameState::Uninitialized,
            settings,
            context: Arc::clone(context),
        })
    }

    /// Build swapchain, depth target, render pass, framebuffers, command buffers and fences
    pub fn prepare(&mut self, width: u32, height: u32) -> VulkanResult<()> {
        if self.state != FrameState::Uninitialized {
            return Err(VulkanError::InvalidState {
                operation: "prepare frame context",
                state: self.state.to_string(),
            });
        }

        self.surface.create(width, height, self.settings.vsync)?;
        self.create_depth()?;

        let depth_format = self.depth.as_ref().map(DepthBuffer::format);
        let render_pass = RenderPass::new(
            self.context.device().clone(),
            self.surface.format().format,
            depth_format,
        )?;
        self.context.set_object_name(render_pass.handle(), "camera-render-pass");
        self.render_pass = Some(render_pass);

        self.create_framebuffers()?;
        self.allocate_command_buffers()?;
        self.sync = Some(FrameSync::new(self.context.device(), self.surface.image_count())?);

        self.state.finish_prepare()?;
        log::info!(
            "Frame context prepared: {} images, {}x{}, depth {}",
            self.surface.image_count(),
            self.surface.extent().width,
            self.surface.extent().height,
            self.depth.is_some()
        );
        Ok(())
    }

    /// Rebuild every swapchain-sized object for a new window size
    ///
    /// Only valid while prepared. The context is prepared again afterwards
    /// even when the rebuild fails; draws then report
    /// [`VulkanError::SwapchainOutOfDate`] until a resize succeeds.
    pub fn window_resize(&mut self, width: u32, height: u32) -> VulkanResult<()> {
        self.state.begin_resize()?;
        log::info!("Resizing frame context to {}x{}", width, height);

        let rebuilt = self.rebuild(width, height);
        self.needs_rebuild = rebuilt.is_err();
        if let Err(err) = &rebuilt {
            log::warn!("Resize to {}x{} failed: {}", width, height, err);
        }
        self.state.settle_resize(rebuilt)
    }

    fn rebuild(&mut self, width: u32, height: u32) -> VulkanResult<()> {
        self.context.wait_idle()?;
        for step in REBUILD_ORDER {
            self.run_rebuild_step(step, width, height)?;
        }
        self.context.wait_idle()
    }

    fn run_rebuild_step(&mut self, step: RebuildStep, width: u32, height: u32) -> VulkanResult<()> {
        match step {
            RebuildStep::ReleaseFramebuffers => {
                self.framebuffers.clear();
                Ok(())
            }
            RebuildStep::ReleaseDepth => {
                self.depth = None;
                Ok(())
            }
            RebuildStep::Swapchain => self.surface.create(width, height, self.settings.vsync),
            RebuildStep::Depth => self.create_depth(),
            RebuildStep::Framebuffers => self.create_framebuffers(),
            RebuildStep::CommandBuffers => {
                self.free_command_buffers();
                self.allocate_command_buffers()
            }
            RebuildStep::Sync => {
                let fence_count = self.sync.as_ref().map_or(0, |sync| sync.fences.len());
                if self.sync_stale || fence_count != self.surface.image_count() {
                    self.sync = Some(FrameSync::new(self.context.device(), self.surface.image_count())?);
                    self.sync_stale = false;
                }
                Ok(())
            }
        }
    }

    /// Produce and present one frame
    ///
    /// Returns the presented image index. Errors leave the context prepared;
    /// [`VulkanError::SwapchainOutOfDate`] asks the caller to resize.
    pub fn draw<C: FrameContent + ?Sized>(&mut self, content: &mut C) -> VulkanResult<u32> {
        self.state.begin_draw()?;

        if self.needs_rebuild {
            self.state.end_draw()?;
            return Err(VulkanError::SwapchainOutOfDate);
        }

        if self.sync_stale {
            if let Err(err) = self.recreate_sync() {
                self.state.end_draw()?;
                return Err(err);
            }
        }

        let mut ops = DeviceFrameOps {
            frame: &*self,
            content,
            acquired: false,
            submitted: false,
        };
        let result = run_frame(&mut ops);
        let stale = ops.acquired && !ops.submitted;

        self.state.end_draw()?;
        match result {
            Ok(index) => {
                self.current_image = index;
                Ok(index)
            }
            Err(err) => {
                if stale {
                    // The image could not be handed back, so the acquire
                    // semaphore may be signalled with nobody waiting on it
                    self.sync_stale = true;
                }
                Err(err)
            }
        }
    }

    /// Render pass handle for pipeline creation
    pub fn render_pass(&self) -> VulkanResult<vk::RenderPass> {
        self.render_pass
            .as_ref()
            .map(RenderPass::handle)
            .ok_or_else(|| VulkanError::InvalidState {
                operation: "get render pass",
                state: self.state.to_string(),
            })
    }

    /// Lifecycle state
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Current swapchain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.surface.extent()
    }

    /// Number of swapchain images
    pub fn image_count(&self) -> usize {
        self.surface.image_count()
    }

    /// Index presented by the last successful draw
    pub fn current_image(&self) -> u32 {
        self.current_image
    }

    /// The presentation surface
    pub fn surface(&self) -> &PresentationSurface {
        &self.surface
    }

    fn create_depth(&mut self) -> VulkanResult<()> {
        self.depth = None;
        if !self.settings.use_depth {
            return Ok(());
        }
        let format = self.context.supported_depth_format()?;
        self.depth = Some(DepthBuffer::new(&self.context, format, self.surface.extent())?);
        Ok(())
    }

    fn create_framebuffers(&mut self) -> VulkanResult<()> {
        let render_pass = self.render_pass()?;
        let extent = self.surface.extent();
        let depth_view = self.depth.as_ref().map(DepthBuffer::image_view);

        self.framebuffers = self
            .surface
            .buffers()
            .iter()
            .map(|buffer| {
                let attachments = framebuffer_attachments(buffer.view, depth_view);
                Framebuffer::new(self.context.device().clone(), render_pass, &attachments, extent)
            })
            .collect::<VulkanResult<Vec<_>>>()?;
        Ok(())
    }

    fn allocate_command_buffers(&mut self) -> VulkanResult<()> {
        let count = u32::try_from(self.surface.image_count()).map_err(|_| VulkanError::InvalidOperation {
            reason: "swapchain image count does not fit in u32".to_string(),
        })?;
        self.command_buffers = self.context.command_pool().allocate_command_buffers(count)?;
        Ok(())
    }

    fn free_command_buffers(&mut self) {
        let command_buffers = std::mem::take(&mut self.command_buffers);
        self.context.command_pool().free_command_buffers(&command_buffers);
    }

    fn recreate_sync(&mut self) -> VulkanResult<()> {
        log::debug!("Recreating frame synchronization after an aborted frame");
        self.context.wait_idle()?;
        self.sync = Some(FrameSync::new(self.context.device(), self.surface.image_count())?);
        self.sync_stale = false;
        Ok(())
    }

    fn sync(&self) -> VulkanResult<&FrameSync> {
        self.sync.as_ref().ok_or_else(|| VulkanError::InvalidState {
            operation: "synchronize frame",
            state: self.state.to_string(),
        })
    }

    fn command_buffer(&self, index: u32) -> VulkanResult<vk::CommandBuffer> {
        self.command_buffers
            .get(index as usize)
            .copied()
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: format!("no command buffer for image index {}", index),
            })
    }

    /// Record the render pass for `index`; without content it only clears
    fn record<C: FrameContent + ?Sized>(&self, index: u32, content: Option<&C>) -> VulkanResult<()> {
        let command_buffer = self.command_buffer(index)?;
        let framebuffer = self
            .framebuffers
            .get(index as usize)
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: format!("no framebuffer for image index {}", index),
            })?;
        let device = self.context.device();
        let extent = self.surface.extent();
        let clear = clear_values(self.settings.clear_color, self.depth.is_some());

        let begin_info = vk::CommandBufferBeginInfo::builder();
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass()?)
            .framebuffer(framebuffer.handle())
            .render_area(full_scissor(extent))
            .clear_values(&clear);

        unsafe {
            device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
            device.cmd_begin_render_pass(command_buffer, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(command_buffer, 0, &[full_viewport(extent)]);
            device.cmd_set_scissor(command_buffer, 0, &[full_scissor(extent)]);
        }

        if let Some(content) = content {
            content.record(device, command_buffer);
        }

        unsafe {
            device.cmd_end_render_pass(command_buffer);
            device.end_command_buffer(command_buffer).map_err(VulkanError::Api)
        }
    }
}

impl Drop for FrameContext {
    fn drop(&mut self) {
        if let Err(err) = self.context.wait_idle() {
            log::error!("Device wait failed during frame context teardown: {}", err);
        }
        self.free_command_buffers();
        self.state.destroy();
        // Framebuffers, render pass, depth, sync and surface drop in field order
    }
}

/// [`FrameOps`] over a live device
struct DeviceFrameOps<'a, C: FrameContent + ?Sized> {
    frame: &'a FrameContext,
    content: &'a mut C,
    acquired: bool,
    submitted: bool,
}

impl<C: FrameContent + ?Sized> FrameOps for DeviceFrameOps<'_, C> {
    fn acquire(&mut self) -> VulkanResult<u32> {
        let semaphore = self.frame.sync()?.image_acquired.handle();
        let index = self
            .frame
            .surface
            .acquire_next_image(semaphore, self.frame.settings.fence_timeout_ns)?;
        self.acquired = true;
        Ok(index)
    }

    fn wait_fence(&mut self, index: u32) -> VulkanResult<()> {
        self.frame
            .sync()?
            .fence(index as usize)?
            .wait(self.frame.settings.fence_timeout_ns)
    }

    fn update(&mut self, index: u32) -> VulkanResult<()> {
        self.content.update(index as usize)
    }

    fn record(&mut self, index: u32) -> VulkanResult<()> {
        self.frame.record(index, Some(&*self.content))
    }

    fn reset_fence(&mut self, index: u32) -> VulkanResult<()> {
        self.frame.sync()?.fence(index as usize)?.reset()
    }

    fn submit(&mut self, index: u32) -> VulkanResult<()> {
        let sync = self.frame.sync()?;
        let fence = sync.fence(index as usize)?;

        let wait_semaphores = [sync.image_acquired.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.frame.command_buffer(index)?];
        let signal_semaphores = [sync.render_complete.handle()];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.frame
                .context
                .device()
                .queue_submit(self.frame.context.graphics_queue(), &[submit_info.build()], fence.handle())
                .map_err(VulkanError::Api)?;
        }
        self.submitted = true;
        Ok(())
    }

    fn present(&mut self, index: u32) -> VulkanResult<()> {
        let render_complete = self.frame.sync()?.render_complete.handle();
        self.frame
            .surface
            .queue_present(self.frame.context.graphics_queue(), index, render_complete)
    }

    fn release(&mut self, index: u32) -> VulkanResult<()> {
        // Every fence is signalled or reset without pending work once idle
        self.frame.context.wait_idle()?;
        self.frame.record(index, None::<&C>)?;
        self.reset_fence(index)?;
        self.submit(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EPSILON: f32 = 1e-6;

    fn position(step: RebuildStep) -> usize {
        REBUILD_ORDER.iter().position(|&s| s == step).unwrap()
    }

    #[test]
    fn test_rebuild_releases_framebuffers_before_swapchain() {
        assert!(position(RebuildStep::ReleaseFramebuffers) < position(RebuildStep::Swapchain));
        assert!(position(RebuildStep::ReleaseDepth) < position(RebuildStep::Depth));
        assert!(position(RebuildStep::Swapchain) < position(RebuildStep::Depth));
        assert!(position(RebuildStep::Depth) < position(RebuildStep::Framebuffers));
        assert!(position(RebuildStep::Swapchain) < position(RebuildStep::CommandBuffers));
        assert_eq!(position(RebuildStep::Sync), REBUILD_ORDER.len() - 1);
    }

    #[test]
    fn test_settings_from_config() {
        let config = RendererConfig::default().with_vsync(true).with_depth(true);
        let settings = FrameSettings::from(&config);
        assert!(settings.vsync);
        assert!(settings.use_depth);
        assert_eq!(settings.fence_timeout_ns, config.fence_timeout_ns);
        assert_eq!(settings.clear_color, [0.0, 0.0, 0.2, 1.0]);
    }

    #[test]
    fn test_clear_values_follow_attachments() {
        let color_only = clear_values([0.0, 0.0, 0.2, 1.0], false);
        assert_eq!(color_only.len(), 1);
        let color = unsafe { color_only[0].color.float32 };
        assert_relative_eq!(color[2], 0.2, epsilon = EPSILON);
        assert_relative_eq!(color[3], 1.0, epsilon = EPSILON);

        let with_depth = clear_values([0.0, 0.0, 0.2, 1.0], true);
        assert_eq!(with_depth.len(), 2);
        let depth = unsafe { with_depth[1].depth_stencil };
        assert_relative_eq!(depth.depth, 1.0, epsilon = EPSILON);
        assert_eq!(depth.stencil, 0);
    }

    #[test]
    fn test_viewport_and_scissor_cover_extent() {
        let extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        let viewport = full_viewport(extent);
        assert_relative_eq!(viewport.width, 1920.0, epsilon = EPSILON);
        assert_relative_eq!(viewport.height, 1080.0, epsilon = EPSILON);
        assert_relative_eq!(viewport.min_depth, 0.0, epsilon = EPSILON);
        assert_relative_eq!(viewport.max_depth, 1.0, epsilon = EPSILON);

        let scissor = full_scissor(extent);
        assert_eq!(scissor.offset.x, 0);
        assert_eq!(scissor.extent, extent);
    }
}
