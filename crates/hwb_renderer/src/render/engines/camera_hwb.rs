//! Camera preview engine
//!
//! Imports the latest camera hardware buffer, samples it through its YCbCr
//! conversion and draws it as a letterboxed, rotated full-screen quad.
//!
//! The descriptor set and the uniform buffer are shared by every swapchain
//! image, so they are only rewritten after the device went idle: when a new
//! buffer was imported or the window size changed.

use std::sync::Arc;

use ash::{vk, Device};
use bytemuck::{Pod, Zeroable};

use crate::core::config::ShaderConfig;
use crate::foundation::math::{fit_rotated_content, Mat4, Orientation};
use crate::render::frame::FrameContent;
use crate::render::vulkan::descriptor_set::{camera_pool_sizes, CAMERA_POOL_MAX_SETS};
use crate::render::vulkan::{
    BufferResource, DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetWriter,
    DeviceContext, ExternalBuffer, GraphicsPipeline, ImageBasicInfo, ImageResource, UniformSink, VulkanError,
    VulkanResult, QUAD_VERTICES,
};

/// Uniform block of the camera shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniforms {
    /// Projection matrix, column-major
    pub projection: [[f32; 4]; 4],
    /// Model matrix, column-major
    pub model: [[f32; 4]; 4],
    /// View matrix, column-major
    pub view: [[f32; 4]; 4],
}

impl CameraUniforms {
    /// Identity projection and view, model fitting `content` into `window`
    pub fn new(window: (u32, u32), content: (u32, u32), orientation: Orientation) -> Self {
        Self {
            projection: Mat4::identity().into(),
            model: fit_rotated_content(window, content, orientation).into(),
            view: Mat4::identity().into(),
        }
    }

    /// Model matrix
    pub fn model_matrix(&self) -> Mat4 {
        Mat4::from(self.model)
    }
}

/// A buffer waiting to be imported on the next frame
pub struct PendingFrame {
    /// The hardware buffer
    pub buffer: Arc<dyn ExternalBuffer>,
    /// Rotation to apply once shown
    pub orientation: Orientation,
}

/// Incoming buffers and the values the uniforms are derived from
#[derive(Default)]
pub struct CameraFeed {
    pending: Option<PendingFrame>,
    orientation: Orientation,
    window: (u32, u32),
    dirty: bool,
}

impl CameraFeed {
    /// Queue a buffer. A newer buffer replaces one that was not imported yet
    pub fn push(&mut self, buffer: Arc<dyn ExternalBuffer>, orientation: Orientation) {
        if self.pending.is_some() {
            log::trace!("Dropping camera buffer that was never shown");
        }
        self.pending = Some(PendingFrame { buffer, orientation });
    }

    /// Take the buffer to import this frame
    pub fn take_pending(&mut self) -> Option<PendingFrame> {
        self.pending.take()
    }

    /// Whether a buffer is waiting
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Apply the outcome of importing `frame`
    ///
    /// Import failures never abort the frame. Retryable ones put the buffer
    /// back unless a newer one arrived; the rest drop it. Other errors are
    /// returned.
    pub fn finish_import(&mut self, frame: PendingFrame, result: VulkanResult<()>) -> VulkanResult<()> {
        match result {
            Ok(()) => {
                self.orientation = frame.orientation;
                self.dirty = true;
                Ok(())
            }
            Err(VulkanError::Import(err)) if err.is_retryable() => {
                log::warn!("Camera buffer import deferred: {}", err);
                if self.pending.is_none() {
                    self.pending = Some(frame);
                }
                Ok(())
            }
            Err(VulkanError::Import(err)) => {
                log::error!("Camera buffer rejected: {}", err);
                self.dirty = true;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Record the drawable size
    pub fn set_window_size(&mut self, width: u32, height: u32) {
        if self.window != (width, height) {
            self.window = (width, height);
            self.dirty = true;
        }
    }

    /// Drawable size
    pub fn window_size(&self) -> (u32, u32) {
        self.window
    }

    /// Orientation of the buffer currently shown
    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    /// Whether uniforms and descriptors need rewriting
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Force a rewrite on the next frame
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Uniforms for content of the given size
    pub fn uniforms(&self, content: (u32, u32)) -> CameraUniforms {
        CameraUniforms::new(self.window, content, self.orientation)
    }
}

/// Descriptor layout, pool, set and pipeline built around the image's sampler
struct CameraBindings {
    pipeline: GraphicsPipeline,
    descriptor_set: vk::DescriptorSet,
    _pool: DescriptorPool,
    _layout: DescriptorSetLayout,
}

impl CameraBindings {
    fn new(
        context: &DeviceContext,
        render_pass: vk::RenderPass,
        shaders: &ShaderConfig,
        sampler: Option<vk::Sampler>,
    ) -> VulkanResult<Self> {
        let device = context.device();

        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT, sampler)
            .build(device)?;

        let pool = DescriptorPool::new(device.clone(), &camera_pool_sizes(), CAMERA_POOL_MAX_SETS)?;
        let descriptor_set = pool
            .allocate_descriptor_sets(&[layout.handle()])?
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: "Descriptor set allocation returned nothing".to_string(),
            })?;
        context.set_object_name(descriptor_set, "camera-descriptor-set");

        let pipeline = GraphicsPipeline::new_quad(context, render_pass, shaders, layout.handle())?;

        Ok(Self {
            pipeline,
            descriptor_set,
            _pool: pool,
            _layout: layout,
        })
    }
}

/// Camera preview engine
pub struct CameraHwbEngine {
    bindings: Option<CameraBindings>,
    image: Option<ImageResource>,
    vertex_buffer: BufferResource,
    uniform_buffer: BufferResource,
    feed: CameraFeed,
    bound: bool,
    render_pass: Option<vk::RenderPass>,
    shaders: ShaderConfig,
    context: Arc<DeviceContext>,
}

impl CameraHwbEngine {
    /// Upload the quad and allocate the uniform buffer
    pub fn new(context: &Arc<DeviceContext>, shaders: ShaderConfig) -> VulkanResult<Self> {
        let vertex_buffer = BufferResource::create_device_local(
            context,
            bytemuck::cast_slice(&QUAD_VERTICES),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        context.set_object_name(vertex_buffer.handle(), "camera-quad-vertices");

        let uniform_buffer = BufferResource::create(
            context,
            std::mem::size_of::<CameraUniforms>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        context.set_object_name(uniform_buffer.handle(), "camera-uniforms");

        Ok(Self {
            bindings: None,
            image: None,
            vertex_buffer,
            uniform_buffer,
            feed: CameraFeed::default(),
            bound: false,
            render_pass: None,
            shaders,
            context: Arc::clone(context),
        })
    }

    /// Target a (new) render pass and drawable size
    ///
    /// The pipeline is rebuilt on the next frame that has an image.
    pub fn attach(&mut self, render_pass: vk::RenderPass, extent: vk::Extent2D) {
        self.bindings = None;
        self.bound = false;
        self.render_pass = Some(render_pass);
        self.feed.set_window_size(extent.width, extent.height);
        self.feed.mark_dirty();
    }

    /// Drop everything tied to the current render pass
    pub fn detach(&mut self) {
        self.bindings = None;
        self.bound = false;
        self.render_pass = None;
    }

    /// New drawable size after a resize
    pub fn set_window_size(&mut self, extent: vk::Extent2D) {
        self.feed.set_window_size(extent.width, extent.height);
    }

    /// Queue a buffer for import on the next frame
    pub fn push_hardware_buffer(&mut self, buffer: Arc<dyn ExternalBuffer>, orientation: Orientation) {
        self.feed.push(buffer, orientation);
    }

    /// The camera image, once a buffer has been imported
    pub fn image(&self) -> Option<&ImageResource> {
        self.image.as_ref()
    }

    /// Incoming buffer state
    pub fn feed(&self) -> &CameraFeed {
        &self.feed
    }

    fn import(&mut self, frame: &PendingFrame) -> VulkanResult<()> {
        match self.image.as_mut() {
            Some(image) => {
                // Frames still in flight sample the previous content
                self.context.wait_idle()?;
                image.set_content_from_hardware_buffer(Arc::clone(&frame.buffer))
            }
            None => {
                let info = ImageBasicInfo::default().with_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                let image = ImageResource::create_from_hardware_buffer(
                    &self.context,
                    self.context.graphics_queue(),
                    Arc::clone(&frame.buffer),
                    info,
                )?;
                self.bindings = None;
                self.image = Some(image);
                Ok(())
            }
        }
    }

    fn ensure_bindings(&mut self) -> VulkanResult<()> {
        if self.bindings.is_some() {
            return Ok(());
        }
        let (Some(render_pass), Some(image)) = (self.render_pass, self.image.as_ref()) else {
            return Ok(());
        };
        self.bindings = Some(CameraBindings::new(
            &self.context,
            render_pass,
            &self.shaders,
            image.sampler(),
        )?);
        Ok(())
    }

    fn refresh_bindings(&mut self) -> VulkanResult<()> {
        self.ensure_bindings()?;
        let (Some(image), Some(bindings)) = (self.image.as_ref(), self.bindings.as_ref()) else {
            return Ok(());
        };
        if image.view().is_none() {
            self.bound = false;
            self.feed.clear_dirty();
            return Ok(());
        }

        // The set and the uniform buffer are shared by every frame in flight
        self.context.wait_idle()?;

        let uniforms = self.feed.uniforms((image.width(), image.height()));
        self.uniform_buffer.write_uniforms(bytemuck::bytes_of(&uniforms))?;

        DescriptorSetWriter::new()
            .write_buffer(
                bindings.descriptor_set,
                0,
                self.uniform_buffer
                    .descriptor(std::mem::size_of::<CameraUniforms>() as vk::DeviceSize, 0),
            )
            .write_image(bindings.descriptor_set, 1, image.descriptor())
            .update(self.context.device());

        log::debug!(
            "Camera bindings refreshed: {}x{} content, {} degrees, window {:?}",
            image.width(),
            image.height(),
            self.feed.orientation().degrees(),
            self.feed.window_size()
        );
        self.bound = true;
        self.feed.clear_dirty();
        Ok(())
    }
}

impl FrameContent for CameraHwbEngine {
    fn update(&mut self, _image_index: usize) -> VulkanResult<()> {
        if let Some(frame) = self.feed.take_pending() {
            let result = self.import(&frame);
            if result.is_err() {
                self.bound = false;
            }
            self.feed.finish_import(frame, result)?;
        }

        if self.feed.is_dirty() || (!self.bound && self.image.is_some()) {
            self.refresh_bindings()?;
        }
        Ok(())
    }

    fn record(&self, device: &Device, command_buffer: vk::CommandBuffer) {
        let Some(bindings) = self.bindings.as_ref().filter(|_| self.bound) else {
            return;
        };

        unsafe {
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                bindings.pipeline.layout(),
                0,
                &[bindings.descriptor_set],
                &[],
            );
            device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, bindings.pipeline.handle());
            device.cmd_bind_vertex_buffers(command_buffer, 0, &[self.vertex_buffer.handle()], &[0]);
            device.cmd_draw(command_buffer, QUAD_VERTICES.len() as u32, 1, 0, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::vulkan::hardware_buffer::testing::FakeHardwareBuffer;
    use crate::render::vulkan::hardware_buffer::{formats, HardwareBufferDesc};
    use crate::render::vulkan::ImportError;
    use approx::assert_relative_eq;

    const EPSILON: f32 = 1e-6;

    fn camera_buffer() -> Arc<dyn ExternalBuffer> {
        Arc::new(FakeHardwareBuffer::new(HardwareBufferDesc::new(
            4032,
            3024,
            formats::Y8CB8CR8_420,
        )))
    }

    #[test]
    fn test_uniform_block_layout() {
        assert_eq!(std::mem::size_of::<CameraUniforms>(), 3 * 64);
        let uniforms = CameraUniforms::new((100, 100), (100, 100), Orientation::Deg0);
        assert_relative_eq!(Mat4::from(uniforms.projection), Mat4::identity(), epsilon = EPSILON);
        assert_relative_eq!(Mat4::from(uniforms.view), Mat4::identity(), epsilon = EPSILON);
        assert_relative_eq!(uniforms.model_matrix(), Mat4::identity(), epsilon = EPSILON);
    }

    #[test]
    fn test_portrait_sensor_in_landscape_window() {
        let mut feed = CameraFeed::default();
        feed.set_window_size(1920, 1080);
        feed.push(camera_buffer(), Orientation::Deg90);
        let frame = feed.take_pending().unwrap();
        feed.finish_import(frame, Ok(())).unwrap();

        let model = feed.uniforms((4032, 3024)).model_matrix();
        assert_relative_eq!(model[(0, 0)], 0.0, epsilon = EPSILON);
        assert_relative_eq!(model[(0, 1)], -0.421_875, epsilon = EPSILON);
        assert_relative_eq!(model[(1, 0)], 1.0, epsilon = EPSILON);
        assert_relative_eq!(model[(1, 1)], 0.0, epsilon = EPSILON);

        // Column-major in the uniform block: column 1, row 0
        let uniforms = feed.uniforms((4032, 3024));
        assert_relative_eq!(uniforms.model[1][0], -0.421_875, epsilon = EPSILON);
    }

    #[test]
    fn test_newer_buffer_replaces_pending() {
        let mut feed = CameraFeed::default();
        let first = camera_buffer();
        let second = camera_buffer();
        feed.push(Arc::clone(&first), Orientation::Deg0);
        feed.push(Arc::clone(&second), Orientation::Deg270);

        let frame = feed.take_pending().unwrap();
        assert!(Arc::ptr_eq(&frame.buffer, &second));
        assert_eq!(frame.orientation, Orientation::Deg270);
        assert!(!feed.has_pending());
        // The replaced buffer was released by the feed
        assert_eq!(Arc::strong_count(&first), 1);
    }

    #[test]
    fn test_retryable_import_is_requeued() {
        let mut feed = CameraFeed::default();
        feed.push(camera_buffer(), Orientation::Deg90);
        let frame = feed.take_pending().unwrap();

        let busy = Err(ImportError::Retryable("out of device memory".to_string()).into());
        feed.finish_import(frame, busy).unwrap();
        assert!(feed.has_pending());
        assert_eq!(feed.orientation(), Orientation::Deg0);
    }

    #[test]
    fn test_retry_does_not_overwrite_newer_buffer() {
        let mut feed = CameraFeed::default();
        feed.push(camera_buffer(), Orientation::Deg0);
        let stale = feed.take_pending().unwrap();
        let newer = camera_buffer();
        feed.push(Arc::clone(&newer), Orientation::Deg180);

        feed.finish_import(stale, Err(ImportError::Retryable("busy".to_string()).into()))
            .unwrap();
        let next = feed.take_pending().unwrap();
        assert!(Arc::ptr_eq(&next.buffer, &newer));
    }

    #[test]
    fn test_unsupported_import_is_dropped() {
        let mut feed = CameraFeed::default();
        feed.push(camera_buffer(), Orientation::Deg90);
        let frame = feed.take_pending().unwrap();

        let rejected = Err(ImportError::Unsupported("no dedicated allocation".to_string()).into());
        feed.finish_import(frame, rejected).unwrap();
        assert!(!feed.has_pending());
        assert!(feed.is_dirty());
    }

    #[test]
    fn test_device_errors_propagate() {
        let mut feed = CameraFeed::default();
        feed.push(camera_buffer(), Orientation::Deg0);
        let frame = feed.take_pending().unwrap();

        let lost = Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST));
        assert!(matches!(
            feed.finish_import(frame, lost),
            Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST))
        ));
    }

    #[test]
    fn test_window_size_marks_dirty_only_on_change() {
        let mut feed = CameraFeed::default();
        feed.set_window_size(800, 600);
        assert!(feed.is_dirty());
        feed.clear_dirty();

        feed.set_window_size(800, 600);
        assert!(!feed.is_dirty());
        feed.set_window_size(600, 800);
        assert!(feed.is_dirty());
    }
}
