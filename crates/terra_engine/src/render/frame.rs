//! Frame-in-flight bookkeeping and swapchain result classification

use ash::prelude::VkResult;
use ash::vk;

use crate::render::vulkan::{InheritanceTarget, VulkanError, VulkanResult};

/// Map an acquire result to `Some(image)`, `None` when the swapchain is stale, or a fatal error.
///
/// A suboptimal acquire still yields a usable image.
pub fn classify_acquire(result: VkResult<(u32, bool)>) -> VulkanResult<Option<u32>> {
    match result {
        Ok((image_index, _suboptimal)) => Ok(Some(image_index)),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
        Err(err) => Err(VulkanError::Api(err)),
    }
}

/// Map a present result to `true` (fresh) or `false` (recreate), or a fatal error
pub fn classify_present(result: VkResult<bool>) -> VulkanResult<bool> {
    match result {
        Ok(suboptimal) => Ok(!suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR) => Ok(false),
        Err(err) => Err(VulkanError::Api(err)),
    }
}

/// Which frame slot is current and which slot last rendered each swapchain image
#[derive(Debug, Clone)]
pub struct FrameCycle {
    frames_in_flight: usize,
    current_frame: usize,
    image_owners: Vec<Option<usize>>,
    acquired: Option<u32>,
}

impl FrameCycle {
    /// One frame slot fewer than there are images, but at least one
    pub fn new(image_count: usize) -> Self {
        Self {
            frames_in_flight: image_count.saturating_sub(1).max(1),
            current_frame: 0,
            image_owners: vec![None; image_count],
            acquired: None,
        }
    }

    /// Number of frame slots
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Slot used by the frame being built
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Image acquired by the frame being built
    pub fn acquired(&self) -> Option<u32> {
        self.acquired
    }

    /// Give `image` to the current slot, returning the slot whose fence must be waited first
    pub fn claim_image(&mut self, image: u32) -> Option<usize> {
        let previous = self.image_owners[image as usize].replace(self.current_frame);
        self.acquired = Some(image);
        previous
    }

    /// Finish the frame and move to the next slot
    pub fn advance(&mut self) {
        self.acquired = None;
        self.current_frame = (self.current_frame + 1) % self.frames_in_flight;
    }

    /// Start over for a rebuilt swapchain of `image_count` images; the device must be idle
    pub fn reset(&mut self, image_count: usize) {
        *self = Self::new(image_count);
    }
}

/// Something that starts recording when an image is acquired
pub trait FrameStage {
    /// Begin recording for `image` into `target`
    fn begin_stage(&mut self, image: usize, target: InheritanceTarget) -> VulkanResult<()>;
}

/// Acquire-side half of a frame.
///
/// Returns `Ok(false)` without touching any stage when the swapchain is stale.
/// Otherwise waits for the slot that last rendered the image, then begins every stage.
pub fn start_frame(
    cycle: &mut FrameCycle,
    acquire: VkResult<(u32, bool)>,
    mut wait_for_slot: impl FnMut(usize) -> VulkanResult<()>,
    target: impl Fn(usize) -> InheritanceTarget,
    stages: &mut [&mut dyn FrameStage],
) -> VulkanResult<bool> {
    let Some(image) = classify_acquire(acquire)? else {
        log::debug!("Swapchain out of date on acquire");
        return Ok(false);
    };

    if let Some(slot) = cycle.claim_image(image) {
        wait_for_slot(slot)?;
    }

    let image = image as usize;
    let target = target(image);
    for stage in stages.iter_mut() {
        stage.begin_stage(image, target)?;
    }
    log::trace!("Frame {} begins on image {image}", cycle.current_frame());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingStage {
        begun: Vec<usize>,
    }

    impl FrameStage for CountingStage {
        fn begin_stage(&mut self, image: usize, _target: InheritanceTarget) -> VulkanResult<()> {
            self.begun.push(image);
            Ok(())
        }
    }

    fn target(_image: usize) -> InheritanceTarget {
        InheritanceTarget {
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            subpass: 0,
        }
    }

    #[test]
    fn test_frames_in_flight_is_one_less_than_images() {
        assert_eq!(FrameCycle::new(3).frames_in_flight(), 2);
        assert_eq!(FrameCycle::new(2).frames_in_flight(), 1);
        assert_eq!(FrameCycle::new(1).frames_in_flight(), 1);
    }

    #[test]
    fn test_current_frame_wraps() {
        let mut cycle = FrameCycle::new(3);
        let seen: Vec<usize> = (0..5)
            .map(|_| {
                let frame = cycle.current_frame();
                cycle.advance();
                frame
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_claim_reports_previous_owner() {
        let mut cycle = FrameCycle::new(3);
        assert_eq!(cycle.claim_image(2), None);
        cycle.advance();
        assert_eq!(cycle.claim_image(2), Some(0));
        assert_eq!(cycle.acquired(), Some(2));
        cycle.reset(3);
        assert_eq!(cycle.claim_image(2), None);
    }

    #[test]
    fn test_reset_follows_new_image_count() {
        let mut cycle = FrameCycle::new(3);
        cycle.advance();
        cycle.claim_image(2);

        cycle.reset(5);
        assert_eq!(cycle.frames_in_flight(), 4);
        assert_eq!(cycle.current_frame(), 0);
        assert_eq!(cycle.acquired(), None);
        // Images beyond the old count are claimable and the slots wrap at the new width
        assert_eq!(cycle.claim_image(4), None);
        for _ in 0..3 {
            cycle.advance();
        }
        assert_eq!(cycle.current_frame(), 3);
        assert_eq!(cycle.claim_image(4), Some(0));

        cycle.reset(2);
        assert_eq!(cycle.frames_in_flight(), 1);
        assert_eq!(cycle.claim_image(1), None);
    }

    #[test]
    fn test_acquire_classification() {
        assert_eq!(classify_acquire(Ok((1, false))).unwrap(), Some(1));
        assert_eq!(classify_acquire(Ok((2, true))).unwrap(), Some(2));
        assert_eq!(classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(), None);
        assert!(classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST)).is_err());
    }

    #[test]
    fn test_present_classification() {
        assert!(classify_present(Ok(false)).unwrap());
        assert!(!classify_present(Ok(true)).unwrap());
        assert!(!classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap());
        assert!(classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR)).is_err());
    }

    #[test]
    fn test_stale_acquire_forwards_nothing() {
        let mut cycle = FrameCycle::new(3);
        let (mut models, mut terrain) = (CountingStage::default(), CountingStage::default());
        let mut waits = 0;

        let fresh = start_frame(
            &mut cycle,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
            |_| {
                waits += 1;
                Ok(())
            },
            target,
            &mut [&mut models, &mut terrain],
        )
        .unwrap();

        assert!(!fresh);
        assert_eq!(waits, 0);
        assert!(models.begun.is_empty());
        assert!(terrain.begun.is_empty());
        assert_eq!(cycle.acquired(), None);
    }

    #[test]
    fn test_acquired_image_reaches_every_stage() {
        let mut cycle = FrameCycle::new(3);
        let (mut models, mut terrain) = (CountingStage::default(), CountingStage::default());

        let fresh = start_frame(&mut cycle, Ok((1, true)), |_| Ok(()), target, &mut [&mut models, &mut terrain]).unwrap();

        assert!(fresh);
        assert_eq!(models.begun, vec![1]);
        assert_eq!(terrain.begun, vec![1]);
    }

    #[test]
    fn test_reused_image_waits_for_its_last_slot() {
        let mut cycle = FrameCycle::new(3);
        let mut stage = CountingStage::default();
        start_frame(&mut cycle, Ok((0, false)), |_| Ok(()), target, &mut [&mut stage]).unwrap();
        cycle.advance();

        let mut waited = Vec::new();
        start_frame(
            &mut cycle,
            Ok((0, false)),
            |slot| {
                waited.push(slot);
                Ok(())
            },
            target,
            &mut [&mut stage],
        )
        .unwrap();
        assert_eq!(waited, vec![0]);
    }
}
