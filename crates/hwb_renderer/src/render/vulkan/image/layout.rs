//! Image layout transitions
//!
//! One barrier per transition. Access masks are derived from the layout class
//! on each side; layouts outside the table contribute no access bits.

use ash::{vk, Device};

/// Sink for image memory barriers
pub trait BarrierRecorder {
    /// Record one image barrier between `src_stage` and `dst_stage`
    fn image_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: vk::ImageMemoryBarrier,
    );
}

/// Records barriers into a command buffer in the recording state
pub struct CommandBufferBarriers<'a> {
    device: &'a Device,
    command_buffer: vk::CommandBuffer,
}

impl<'a> CommandBufferBarriers<'a> {
    /// Wrap a command buffer that is currently recording
    pub fn new(device: &'a Device, command_buffer: vk::CommandBuffer) -> Self {
        Self { device, command_buffer }
    }
}

impl BarrierRecorder for CommandBufferBarriers<'_> {
    fn image_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: vk::ImageMemoryBarrier,
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

/// Accesses that must complete before leaving `layout`
pub fn src_access_mask(layout: vk::ImageLayout) -> Option<vk::AccessFlags> {
    match layout {
        vk::ImageLayout::UNDEFINED => Some(vk::AccessFlags::NONE),
        vk::ImageLayout::PREINITIALIZED => Some(vk::AccessFlags::HOST_WRITE),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => Some(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => Some(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => Some(vk::AccessFlags::TRANSFER_READ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => Some(vk::AccessFlags::TRANSFER_WRITE),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => Some(vk::AccessFlags::SHADER_READ),
        _ => None,
    }
}

/// Accesses in `layout` that wait on the transition
pub fn dst_access_mask(layout: vk::ImageLayout) -> Option<vk::AccessFlags> {
    match layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => Some(vk::AccessFlags::TRANSFER_WRITE),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => Some(vk::AccessFlags::TRANSFER_READ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => Some(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => Some(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => Some(vk::AccessFlags::SHADER_READ),
        _ => None,
    }
}

/// Source and destination masks for `old` → `new`
pub fn access_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> (vk::AccessFlags, vk::AccessFlags) {
    let mut src = src_access_mask(old).unwrap_or_else(|| {
        log::debug!("No source access mask for {:?}", old);
        vk::AccessFlags::empty()
    });
    let dst = dst_access_mask(new).unwrap_or_else(|| {
        log::debug!("No destination access mask for {:?}", new);
        vk::AccessFlags::empty()
    });

    // Sampling after an upload with no tracked writer
    if new == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL && src.is_empty() {
        src = vk::AccessFlags::HOST_WRITE | vk::AccessFlags::TRANSFER_WRITE;
    }

    (src, dst)
}

/// One layout transition request
#[derive(Debug, Clone, Copy)]
pub struct LayoutTransition {
    /// Layout to move to
    pub new_layout: vk::ImageLayout,
    /// Layout to move from; `None` uses the recorded layout
    pub old_layout: Option<vk::ImageLayout>,
    /// Stages that must finish first
    pub src_stage: vk::PipelineStageFlags,
    /// Stages that wait
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    /// Transition from the recorded layout with ALL_COMMANDS on both sides
    pub fn to(new_layout: vk::ImageLayout) -> Self {
        Self {
            new_layout,
            old_layout: None,
            src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
        }
    }

    /// Override the layout the image is assumed to be in
    pub fn from_layout(mut self, old_layout: vk::ImageLayout) -> Self {
        self.old_layout = Some(old_layout);
        self
    }

    /// Override the stage masks
    pub fn stages(mut self, src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags) -> Self {
        self.src_stage = src_stage;
        self.dst_stage = dst_stage;
        self
    }
}

/// Record a layout transition and update `recorded_layout`
///
/// Moving to UNDEFINED or PREINITIALIZED is not a valid transition; such a
/// request records nothing and leaves `recorded_layout` untouched.
pub fn transition_image_layout(
    recorder: &mut impl BarrierRecorder,
    image: vk::Image,
    subresource_range: vk::ImageSubresourceRange,
    recorded_layout: &mut vk::ImageLayout,
    transition: LayoutTransition,
) {
    let new_layout = transition.new_layout;
    if new_layout == vk::ImageLayout::UNDEFINED || new_layout == vk::ImageLayout::PREINITIALIZED {
        return;
    }

    let old_layout = transition.old_layout.unwrap_or(*recorded_layout);
    let (src_access, dst_access) = access_masks(old_layout, new_layout);

    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range)
        .build();

    recorder.image_barrier(transition.src_stage, transition.dst_stage, barrier);
    *recorded_layout = new_layout;
}

/// Color subresource range covering `levels` mips and `layers` layers
pub fn color_range(levels: u32, layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: levels,
        base_array_layer: 0,
        layer_count: layers,
    }
}
