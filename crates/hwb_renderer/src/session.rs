//! Render session
//!
//! The entry point used by the platform bridge. A session owns one device
//! context, the frame context bound to the current window and the active
//! engine. All methods are called from the render thread; only
//! [`StopHandle`] crosses threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use crate::assets::AssetSource;
use crate::core::config::RendererConfig;
use crate::foundation::math::Orientation;
use crate::render::engines::{CameraHwbEngine, EngineKind};
use crate::render::frame_context::{FrameContext, FrameSettings};
use crate::render::vulkan::{DeviceContext, ExternalBuffer, VulkanError, VulkanResult};

/// Raises the stop flag of a render loop from any thread
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Ask the loop to return after the current frame
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What happened to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Image `index` was presented
    Presented(u32),
    /// The swapchain had to be rebuilt; nothing was presented
    Resized,
    /// A bounded wait expired; the frame was dropped
    Skipped,
}

/// Map a draw result onto what the render loop should do next
///
/// Out-of-date swapchains ask for a resize, expired waits drop the frame,
/// everything else is passed through.
pub fn classify_frame(result: VulkanResult<u32>) -> VulkanResult<Option<FrameOutcome>> {
    match result {
        Ok(index) => Ok(Some(FrameOutcome::Presented(index))),
        Err(VulkanError::SwapchainOutOfDate) => Ok(None),
        Err(VulkanError::Timeout { what, timeout_ns }) => {
            log::warn!("Dropped frame: {} not ready after {} ns", what, timeout_ns);
            Ok(Some(FrameOutcome::Skipped))
        }
        Err(err) => Err(err),
    }
}

/// Map the result of the rebuild that follows an out-of-date swapchain
///
/// An empty window extent drops the frame; the next draw asks for another
/// rebuild.
pub fn classify_resize(result: VulkanResult<()>) -> VulkanResult<FrameOutcome> {
    match result {
        Ok(()) => Ok(FrameOutcome::Resized),
        Err(VulkanError::InvalidOperation { reason }) => {
            log::warn!("Dropped frame: swapchain not rebuilt ({})", reason);
            Ok(FrameOutcome::Skipped)
        }
        Err(VulkanError::SwapchainOutOfDate) => Ok(FrameOutcome::Skipped),
        Err(err) => Err(err),
    }
}

/// One camera preview session
pub struct RenderSession {
    engine: CameraHwbEngine,
    frame: Option<FrameContext>,
    stop: StopHandle,
    config: RendererConfig,
    context: Arc<DeviceContext>,
}

impl RenderSession {
    /// Create the device context and the configured engine
    pub fn create(assets: Arc<dyn AssetSource>, config: RendererConfig) -> VulkanResult<Self> {
        config.validate().map_err(VulkanError::InitializationFailed)?;
        config.engine.ensure_implemented()?;

        let context = DeviceContext::initialize(assets, &config)?;
        let engine = CameraHwbEngine::new(&context, config.shaders.clone())?;
        log::info!("Render session created with the {} engine", config.engine.name());

        Ok(Self {
            engine,
            frame: None,
            stop: StopHandle(Arc::new(AtomicBool::new(false))),
            config,
            context,
        })
    }

    /// Select the engine variant
    pub fn configure_engine(&mut self, kind: EngineKind) -> VulkanResult<()> {
        kind.ensure_implemented()?;
        if kind != self.config.engine {
            log::info!("Switching engine to {}", kind.name());
            self.config.engine = kind;
        }
        Ok(())
    }

    /// Bind the session to a window and prepare its swapchain
    ///
    /// Replaces any previous window.
    pub fn set_window<W>(&mut self, window: &W, width: u32, height: u32) -> VulkanResult<()>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        if self.frame.is_some() {
            self.context.wait_idle()?;
            self.engine.detach();
            self.frame = None;
        }

        let mut frame = FrameContext::new(&self.context, window, FrameSettings::from(&self.config))?;
        frame.prepare(width, height)?;
        self.engine.attach(frame.render_pass()?, frame.extent());
        self.frame = Some(frame);
        Ok(())
    }

    /// Queue a camera buffer; it is imported at the start of the next frame
    pub fn push_hardware_buffer(&mut self, buffer: Arc<dyn ExternalBuffer>, orientation: Orientation) {
        self.engine.push_hardware_buffer(buffer, orientation);
    }

    /// Draw one frame, rebuilding the swapchain when it went out of date
    pub fn draw_frame(&mut self) -> VulkanResult<FrameOutcome> {
        let frame = self.frame.as_mut().ok_or_else(|| VulkanError::InvalidState {
            operation: "draw frame",
            state: "no window".to_string(),
        })?;

        if let Some(outcome) = classify_frame(frame.draw(&mut self.engine))? {
            return Ok(outcome);
        }

        log::info!("Swapchain out of date, rebuilding");
        let extent = frame.extent();
        let outcome = classify_resize(frame.window_resize(extent.width, extent.height))?;
        if outcome == FrameOutcome::Resized {
            self.engine.set_window_size(frame.extent());
        }
        Ok(outcome)
    }

    /// Draw frames until [`stop_render_loop`](Self::stop_render_loop) is called
    ///
    /// The stop flag is checked once per frame and cleared on return, so the
    /// loop can be started again.
    pub fn render(&mut self) -> VulkanResult<()> {
        log::info!("Render loop started");
        let mut presented = 0_u64;

        let result = loop {
            if self.stop.is_stopped() {
                break Ok(());
            }
            match self.draw_frame() {
                Ok(FrameOutcome::Presented(_)) => presented += 1,
                Ok(_) => {}
                Err(err) => break Err(err),
            }
        };

        self.stop.clear();
        match &result {
            Ok(()) => log::info!("Render loop stopped after {} frames", presented),
            Err(err) => log::error!("Render loop failed after {} frames: {}", presented, err),
        }
        result
    }

    /// Ask a running render loop to return
    pub fn stop_render_loop(&self) {
        self.stop.stop();
    }

    /// Handle for stopping the loop from another thread
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Rebuild swapchain-sized state for a new window size
    pub fn on_window_resized(&mut self, width: u32, height: u32) -> VulkanResult<()> {
        let frame = self.frame.as_mut().ok_or_else(|| VulkanError::InvalidState {
            operation: "resize",
            state: "no window".to_string(),
        })?;
        frame.window_resize(width, height)?;
        self.engine.set_window_size(frame.extent());
        Ok(())
    }

    /// Active configuration
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Shared device context
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    /// The camera engine
    pub fn engine(&self) -> &CameraHwbEngine {
        &self.engine
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        if let Err(err) = self.context.wait_idle() {
            log::error!("Device wait failed during session teardown: {}", err);
        }
        // Engine resources reference the frame's render pass
        self.engine.detach();
        self.frame = None;
        log::info!("Render session destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use ash::vk;

    use super::*;

    #[test]
    fn test_stop_handle_crosses_threads() {
        let handle = StopHandle(Arc::new(AtomicBool::new(false)));
        let remote = handle.clone();

        thread::spawn(move || remote.stop()).join().unwrap();
        assert!(handle.is_stopped());

        handle.clear();
        assert!(!handle.is_stopped());
    }

    #[test]
    fn test_out_of_date_requests_resize() {
        assert_eq!(classify_frame(Err(VulkanError::SwapchainOutOfDate)).unwrap(), None);
        assert_eq!(
            classify_frame(Ok(2)).unwrap(),
            Some(FrameOutcome::Presented(2))
        );
    }

    #[test]
    fn test_timeouts_drop_the_frame() {
        let timeout = Err(VulkanError::Timeout {
            what: "fence",
            timeout_ns: 1_000,
        });
        assert_eq!(classify_frame(timeout).unwrap(), Some(FrameOutcome::Skipped));
    }

    #[test]
    fn test_empty_window_skips_instead_of_failing() {
        let minimized = Err(VulkanError::InvalidOperation {
            reason: "swapchain extent 0x0 is empty".to_string(),
        });
        assert_eq!(classify_resize(minimized).unwrap(), FrameOutcome::Skipped);
        assert_eq!(classify_resize(Ok(())).unwrap(), FrameOutcome::Resized);
        assert!(classify_resize(Err(VulkanError::Api(vk::Result::ERROR_SURFACE_LOST_KHR))).is_err());
    }

    #[test]
    fn test_device_loss_stops_the_loop() {
        let lost = Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST));
        assert!(matches!(
            classify_frame(lost),
            Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST))
        ));
    }
}
