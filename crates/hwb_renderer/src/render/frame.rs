//! Per-frame protocol
//!
//! One frame is: acquire an image, wait for that image's fence, run the
//! per-frame update, re-record its command buffer, reset the fence, submit and
//! present. The fence of an index is always waited before its command buffer
//! is touched again, so there is at most one submission in flight per image.
//! An acquired image is always presented, even when its frame failed.
//!
//! The steps are expressed through [`FrameOps`] so the ordering can be
//! checked without a GPU.

use std::fmt;

use ash::{vk, Device};

use crate::render::vulkan::{VulkanError, VulkanResult};

/// Lifecycle of a frame context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    /// Nothing created yet
    #[default]
    Uninitialized,
    /// Swapchain, targets and command buffers exist
    Prepared,
    /// A frame is being produced
    Drawing,
    /// Targets are being rebuilt for a new size
    Resizing,
    /// Torn down
    Destroyed,
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Prepared => "prepared",
            Self::Drawing => "drawing",
            Self::Resizing => "resizing",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

impl FrameState {
    fn transition(&mut self, operation: &'static str, from: Self, to: Self) -> VulkanResult<()> {
        if *self != from {
            return Err(VulkanError::InvalidState {
                operation,
                state: self.to_string(),
            });
        }
        *self = to;
        Ok(())
    }

    /// Uninitialized -> Prepared
    pub fn finish_prepare(&mut self) -> VulkanResult<()> {
        self.transition("prepare frame context", Self::Uninitialized, Self::Prepared)
    }

    /// Prepared -> Drawing
    pub fn begin_draw(&mut self) -> VulkanResult<()> {
        self.transition("draw", Self::Prepared, Self::Drawing)
    }

    /// Drawing -> Prepared
    pub fn end_draw(&mut self) -> VulkanResult<()> {
        self.transition("finish draw", Self::Drawing, Self::Prepared)
    }

    /// Prepared -> Resizing
    pub fn begin_resize(&mut self) -> VulkanResult<()> {
        self.transition("resize", Self::Prepared, Self::Resizing)
    }

    /// Resizing -> Prepared
    pub fn end_resize(&mut self) -> VulkanResult<()> {
        self.transition("finish resize", Self::Resizing, Self::Prepared)
    }

    /// Leave Resizing whatever the rebuild returned, then hand that result back
    pub fn settle_resize(&mut self, rebuilt: VulkanResult<()>) -> VulkanResult<()> {
        self.end_resize()?;
        rebuilt
    }

    /// Any state -> Destroyed
    pub fn destroy(&mut self) {
        *self = Self::Destroyed;
    }
}

/// What gets drawn into each frame
pub trait FrameContent {
    /// Per-frame work after the image's fence has signalled
    fn update(&mut self, image_index: usize) -> VulkanResult<()>;

    /// Record bind and draw commands inside the active render pass
    fn record(&self, device: &Device, command_buffer: vk::CommandBuffer);
}

/// The steps of one frame
pub trait FrameOps {
    /// Acquire the next swapchain image
    fn acquire(&mut self) -> VulkanResult<u32>;

    /// Bounded wait on the fence of `index`
    fn wait_fence(&mut self, index: u32) -> VulkanResult<()>;

    /// Per-frame update
    fn update(&mut self, index: u32) -> VulkanResult<()>;

    /// Re-record the command buffer of `index`
    fn record(&mut self, index: u32) -> VulkanResult<()>;

    /// Unsignal the fence of `index`
    fn reset_fence(&mut self, index: u32) -> VulkanResult<()>;

    /// Submit the command buffer of `index`, signalling its fence
    fn submit(&mut self, index: u32) -> VulkanResult<()>;

    /// Make an acquired image whose frame failed presentable again
    ///
    /// Consumes the acquire semaphore and signals what [`present`](Self::present)
    /// waits on, leaving the fence of `index` with pending work.
    fn release(&mut self, index: u32) -> VulkanResult<()>;

    /// Present `index`
    fn present(&mut self, index: u32) -> VulkanResult<()>;
}

/// Run one frame and return the image index that was presented
///
/// The fence is reset only after recording succeeded, right before it is
/// handed to the submit. When any step after the acquire fails the image is
/// released and presented anyway, and the original error is returned.
pub fn run_frame<O: FrameOps + ?Sized>(ops: &mut O) -> VulkanResult<u32> {
    let index = ops.acquire()?;
    if let Err(err) = render_acquired(ops, index) {
        match ops.release(index).and_then(|()| ops.present(index)) {
            Ok(()) => log::debug!("Presented image {} without new content after: {}", index, err),
            Err(release_err) => log::warn!("Could not hand back image {}: {}", index, release_err),
        }
        return Err(err);
    }
    ops.present(index)?;
    Ok(index)
}

fn render_acquired<O: FrameOps + ?Sized>(ops: &mut O, index: u32) -> VulkanResult<()> {
    ops.wait_fence(index)?;
    ops.update(index)?;
    ops.record(index)?;
    ops.reset_fence(index)?;
    ops.submit(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        let mut state = FrameState::default();
        assert!(state.begin_draw().is_err());
        assert!(state.begin_resize().is_err());

        state.finish_prepare().unwrap();
        state.begin_draw().unwrap();
        assert!(matches!(
            state.begin_resize(),
            Err(VulkanError::InvalidState { operation: "resize", .. })
        ));
        state.end_draw().unwrap();

        state.begin_resize().unwrap();
        assert!(state.begin_draw().is_err());
        state.end_resize().unwrap();
        assert_eq!(state, FrameState::Prepared);

        state.destroy();
        assert!(state.begin_draw().is_err());
        assert_eq!(state.to_string(), "destroyed");
    }

    #[test]
    fn test_failed_resize_can_be_retried() {
        let mut state = FrameState::default();
        state.finish_prepare().unwrap();

        state.begin_resize().unwrap();
        let failed = state.settle_resize(Err(VulkanError::InvalidOperation {
            reason: "swapchain extent 0x0 is empty".to_string(),
        }));
        assert!(matches!(failed, Err(VulkanError::InvalidOperation { .. })));
        assert_eq!(state, FrameState::Prepared);

        state.begin_resize().unwrap();
        state.settle_resize(Ok(())).unwrap();
        state.begin_draw().unwrap();
        state.end_draw().unwrap();

        // Settling outside a resize is still rejected
        assert!(state.settle_resize(Ok(())).is_err());
    }

    /// GPU that finishes each submission only after `latency` more submits
    struct SlowGpu {
        image_count: u32,
        next_image: u32,
        latency: usize,
        // Submission order of indices still executing
        executing: Vec<u32>,
        fence_signaled: Vec<bool>,
        blocked_waits: usize,
        events: Vec<String>,
        fail_wait_on_frame: Option<usize>,
        fail_update_on_frame: Option<usize>,
        frame: usize,
    }

    impl SlowGpu {
        fn new(image_count: u32, latency: usize) -> Self {
            Self {
                image_count,
                next_image: 0,
                latency,
                executing: Vec::new(),
                fence_signaled: vec![true; image_count as usize],
                blocked_waits: 0,
                events: Vec::new(),
                fail_wait_on_frame: None,
                fail_update_on_frame: None,
                frame: 0,
            }
        }

        fn complete_oldest(&mut self) {
            let done = self.executing.remove(0);
            self.fence_signaled[done as usize] = true;
        }
    }

    impl FrameOps for SlowGpu {
        fn acquire(&mut self) -> VulkanResult<u32> {
            self.frame += 1;
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            self.events.push(format!("acquire {index}"));
            Ok(index)
        }

        fn wait_fence(&mut self, index: u32) -> VulkanResult<()> {
            if self.fail_wait_on_frame == Some(self.frame) {
                return Err(VulkanError::Timeout {
                    what: "frame fence",
                    timeout_ns: 1,
                });
            }
            if !self.fence_signaled[index as usize] {
                self.blocked_waits += 1;
            }
            while !self.fence_signaled[index as usize] {
                self.complete_oldest();
            }
            self.events.push(format!("wait {index}"));
            Ok(())
        }

        fn update(&mut self, index: u32) -> VulkanResult<()> {
            if self.fail_update_on_frame == Some(self.frame) {
                return Err(VulkanError::Unsupported("update".to_string()));
            }
            self.events.push(format!("update {index}"));
            Ok(())
        }

        fn record(&mut self, index: u32) -> VulkanResult<()> {
            assert!(
                !self.executing.contains(&index),
                "command buffer {index} re-recorded while still executing"
            );
            self.events.push(format!("record {index}"));
            Ok(())
        }

        fn reset_fence(&mut self, index: u32) -> VulkanResult<()> {
            assert!(self.fence_signaled[index as usize]);
            self.fence_signaled[index as usize] = false;
            self.events.push(format!("reset {index}"));
            Ok(())
        }

        fn submit(&mut self, index: u32) -> VulkanResult<()> {
            self.executing.push(index);
            if self.executing.len() > self.latency {
                self.complete_oldest();
            }
            self.events.push(format!("submit {index}"));
            Ok(())
        }

        fn present(&mut self, index: u32) -> VulkanResult<()> {
            self.events.push(format!("present {index}"));
            Ok(())
        }

        fn release(&mut self, index: u32) -> VulkanResult<()> {
            while !self.executing.is_empty() {
                self.complete_oldest();
            }
            self.fence_signaled[index as usize] = false;
            self.executing.push(index);
            self.events.push(format!("release {index}"));
            Ok(())
        }
    }

    fn count(events: &[String], prefix: &str) -> usize {
        events.iter().filter(|event| event.starts_with(prefix)).count()
    }

    #[test]
    fn test_slow_gpu_never_rerecords_in_flight_buffer() {
        let mut gpu = SlowGpu::new(3, 5);

        for expected in (0..30).map(|frame| frame % 3) {
            assert_eq!(run_frame(&mut gpu).unwrap(), expected);
            // Never more submissions in flight than images
            assert!(gpu.executing.len() <= 3);
        }
        assert!(gpu.blocked_waits > 0);
    }

    #[test]
    fn test_step_order() {
        let mut gpu = SlowGpu::new(2, 1);
        run_frame(&mut gpu).unwrap();
        assert_eq!(
            gpu.events,
            vec!["acquire 0", "wait 0", "update 0", "record 0", "reset 0", "submit 0", "present 0"]
        );
    }

    #[test]
    fn test_timeout_still_presents_acquired_image() {
        let mut gpu = SlowGpu::new(2, 1);
        gpu.fail_wait_on_frame = Some(1);

        let err = run_frame(&mut gpu).unwrap_err();
        assert!(matches!(err, VulkanError::Timeout { .. }));
        assert_eq!(gpu.events, vec!["acquire 0", "release 0", "present 0"]);
        assert_eq!(gpu.executing, vec![0]);
        assert!(!gpu.fence_signaled[0]);
    }

    #[test]
    fn test_failed_update_skips_new_content() {
        let mut gpu = SlowGpu::new(2, 1);
        gpu.fail_update_on_frame = Some(2);

        run_frame(&mut gpu).unwrap();
        assert!(run_frame(&mut gpu).is_err());
        let tail: Vec<&str> = gpu.events[gpu.events.len() - 3..].iter().map(String::as_str).collect();
        assert_eq!(tail, vec!["wait 1", "release 1", "present 1"]);
        assert_eq!(count(&gpu.events, "record 1"), 0);

        // The next frame proceeds normally
        assert_eq!(run_frame(&mut gpu).unwrap(), 0);
    }

    #[test]
    fn test_every_acquired_image_is_presented() {
        let mut gpu = SlowGpu::new(3, 2);
        let mut failures = 0;

        for frame in 1..=40 {
            gpu.fail_wait_on_frame = (frame % 5 == 0).then_some(frame);
            gpu.fail_update_on_frame = (frame % 7 == 0).then_some(frame);
            if run_frame(&mut gpu).is_err() {
                failures += 1;
            }
            assert!(gpu.executing.len() <= 3);
        }

        assert_eq!(failures, 12);
        assert_eq!(count(&gpu.events, "acquire"), 40);
        assert_eq!(count(&gpu.events, "present"), 40);
        assert_eq!(count(&gpu.events, "release"), 12);
    }
}
