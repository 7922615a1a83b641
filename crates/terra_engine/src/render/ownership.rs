//! Queue-family ownership of the terrain indirect-draw buffer
//!
//! Each frame the buffer travels compute -> graphics -> compute. Every hop is
//! a release barrier on the queue giving it up and a matching acquire barrier
//! on the queue taking it. [`QueueOwnership`] tracks where the buffer is and
//! refuses hooks called out of order; the acquire hooks return guards that the
//! matching post hook consumes.

use ash::{vk, Device};

use crate::render::vulkan::{VulkanError, VulkanResult};

/// Where the buffer currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState {
    /// Released by graphics, not yet acquired by compute
    ReleasedToCompute,
    /// Acquired by compute; the culling dispatch may write it
    ComputeOwned,
    /// Released by compute, not yet acquired by graphics
    ReleasedToGraphics,
    /// Acquired by graphics; indirect draws may read it
    GraphicsOwned,
}

impl OwnershipState {
    fn name(self) -> &'static str {
        match self {
            Self::ReleasedToCompute => "released to compute",
            Self::ComputeOwned => "compute owned",
            Self::ReleasedToGraphics => "released to graphics",
            Self::GraphicsOwned => "graphics owned",
        }
    }
}

/// One buffer memory barrier, described without a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTransfer {
    /// Buffer moved
    pub buffer: vk::Buffer,
    /// Bytes covered
    pub size: vk::DeviceSize,
    /// Releasing family, or `QUEUE_FAMILY_IGNORED`
    pub src_family: u32,
    /// Acquiring family, or `QUEUE_FAMILY_IGNORED`
    pub dst_family: u32,
    /// Access made available
    pub src_access: vk::AccessFlags,
    /// Access made visible
    pub dst_access: vk::AccessFlags,
    /// Stage waited on
    pub src_stage: vk::PipelineStageFlags,
    /// Stage blocked
    pub dst_stage: vk::PipelineStageFlags,
}

/// Receives barriers; a command buffer in practice, a recorder in tests
pub trait BarrierSink {
    /// Record `transfer`
    fn buffer_barrier(&mut self, transfer: &BufferTransfer);
}

/// Records barriers into a command buffer
pub struct CommandBufferSink<'a> {
    device: &'a Device,
    command_buffer: vk::CommandBuffer,
}

impl<'a> CommandBufferSink<'a> {
    /// Sink for `command_buffer`, which must be recording outside a render pass
    pub fn new(device: &'a Device, command_buffer: vk::CommandBuffer) -> Self {
        Self { device, command_buffer }
    }
}

impl BarrierSink for CommandBufferSink<'_> {
    fn buffer_barrier(&mut self, transfer: &BufferTransfer) {
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(transfer.src_access)
            .dst_access_mask(transfer.dst_access)
            .src_queue_family_index(transfer.src_family)
            .dst_queue_family_index(transfer.dst_family)
            .buffer(transfer.buffer)
            .offset(0)
            .size(transfer.size)
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                transfer.src_stage,
                transfer.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }
}

/// Proof that compute holds the buffer; consumed by [`QueueOwnership::release_to_graphics`]
#[must_use = "release the buffer back to graphics after the dispatch"]
pub struct ComputeAcquired {
    buffer: vk::Buffer,
    consumed: bool,
}

/// Proof that graphics holds the buffer; consumed by [`QueueOwnership::release_to_compute`]
#[must_use = "release the buffer back to compute after the draws"]
#[derive(Debug)]
pub struct GraphicsAcquired {
    buffer: vk::Buffer,
    consumed: bool,
}

impl Drop for ComputeAcquired {
    fn drop(&mut self) {
        if !self.consumed {
            log::error!("Indirect buffer {:?} acquired by compute was never released", self.buffer);
        }
    }
}

impl Drop for GraphicsAcquired {
    fn drop(&mut self) {
        if !self.consumed {
            log::error!("Indirect buffer {:?} acquired by graphics was never released", self.buffer);
        }
    }
}

/// Ownership state machine for one indirect buffer
#[derive(Debug)]
pub struct QueueOwnership {
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    graphics_family: u32,
    compute_family: u32,
    state: OwnershipState,
    cycling: bool,
}

impl QueueOwnership {
    /// Track `buffer`, which starts out owned by graphics (it was just filled there)
    pub fn new(buffer: vk::Buffer, size: vk::DeviceSize, graphics_family: u32, compute_family: u32) -> Self {
        Self {
            buffer,
            size,
            graphics_family,
            compute_family,
            state: OwnershipState::GraphicsOwned,
            cycling: false,
        }
    }

    /// Current state
    pub fn state(&self) -> OwnershipState {
        self.state
    }

    fn families(&self, from: u32, to: u32) -> (u32, u32) {
        if self.graphics_family == self.compute_family {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        } else {
            (from, to)
        }
    }

    fn expect(&self, expected: OwnershipState) -> VulkanResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(VulkanError::Ownership {
                expected: expected.name(),
                actual: self.state.name(),
            })
        }
    }

    /// First hand-off after the buffer was filled on graphics; recorded once at setup
    pub fn release_initial_to_compute(&mut self, sink: &mut impl BarrierSink) -> VulkanResult<()> {
        if self.cycling {
            return Err(VulkanError::InvalidOperation {
                reason: "indirect buffer was already released to compute".to_string(),
            });
        }
        self.expect(OwnershipState::GraphicsOwned)?;
        self.cycling = true;
        self.record_release_to_compute(sink);
        Ok(())
    }

    /// Graphics gives the buffer up after its indirect reads; recorded on the graphics queue
    pub fn release_to_compute(&mut self, sink: &mut impl BarrierSink, mut proof: GraphicsAcquired) -> VulkanResult<()> {
        self.expect(OwnershipState::GraphicsOwned)?;
        proof.consumed = true;
        self.record_release_to_compute(sink);
        Ok(())
    }

    fn record_release_to_compute(&mut self, sink: &mut impl BarrierSink) {
        let (src_family, dst_family) = self.families(self.graphics_family, self.compute_family);
        sink.buffer_barrier(&BufferTransfer {
            buffer: self.buffer,
            size: self.size,
            src_family,
            dst_family,
            src_access: vk::AccessFlags::INDIRECT_COMMAND_READ,
            dst_access: vk::AccessFlags::empty(),
            src_stage: vk::PipelineStageFlags::DRAW_INDIRECT,
            dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        });
        self.state = OwnershipState::ReleasedToCompute;
    }

    /// Compute takes the buffer before the culling dispatch; recorded on the compute queue
    pub fn acquire_for_compute(&mut self, sink: &mut impl BarrierSink) -> VulkanResult<ComputeAcquired> {
        self.expect(OwnershipState::ReleasedToCompute)?;
        let (src_family, dst_family) = self.families(self.graphics_family, self.compute_family);
        sink.buffer_barrier(&BufferTransfer {
            buffer: self.buffer,
            size: self.size,
            src_family,
            dst_family,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            src_stage: vk::PipelineStageFlags::DRAW_INDIRECT,
            dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        });
        self.state = OwnershipState::ComputeOwned;
        Ok(ComputeAcquired {
            buffer: self.buffer,
            consumed: false,
        })
    }

    /// Compute hands the culled commands to graphics; recorded on the compute queue
    pub fn release_to_graphics(&mut self, sink: &mut impl BarrierSink, mut proof: ComputeAcquired) -> VulkanResult<()> {
        self.expect(OwnershipState::ComputeOwned)?;
        proof.consumed = true;
        let (src_family, dst_family) = self.families(self.compute_family, self.graphics_family);
        sink.buffer_barrier(&BufferTransfer {
            buffer: self.buffer,
            size: self.size,
            src_family,
            dst_family,
            src_access: vk::AccessFlags::SHADER_WRITE,
            dst_access: vk::AccessFlags::empty(),
            src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        });
        self.state = OwnershipState::ReleasedToGraphics;
        Ok(())
    }

    /// Graphics takes the buffer before the indirect draws; recorded on the graphics queue
    pub fn acquire_for_graphics(&mut self, sink: &mut impl BarrierSink) -> VulkanResult<GraphicsAcquired> {
        self.expect(OwnershipState::ReleasedToGraphics)?;
        let (src_family, dst_family) = self.families(self.compute_family, self.graphics_family);
        sink.buffer_barrier(&BufferTransfer {
            buffer: self.buffer,
            size: self.size,
            src_family,
            dst_family,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::INDIRECT_COMMAND_READ,
            src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_stage: vk::PipelineStageFlags::DRAW_INDIRECT,
        });
        self.state = OwnershipState::GraphicsOwned;
        Ok(GraphicsAcquired {
            buffer: self.buffer,
            consumed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        barriers: Vec<BufferTransfer>,
    }

    impl BarrierSink for Recorder {
        fn buffer_barrier(&mut self, transfer: &BufferTransfer) {
            self.barriers.push(*transfer);
        }
    }

    const GRAPHICS: u32 = 0;
    const COMPUTE: u32 = 1;

    fn ownership() -> QueueOwnership {
        QueueOwnership::new(vk::Buffer::null(), 256, GRAPHICS, COMPUTE)
    }

    fn run_frame(ownership: &mut QueueOwnership, compute: &mut Recorder, graphics: &mut Recorder) {
        let acquired = ownership.acquire_for_compute(compute).unwrap();
        ownership.release_to_graphics(compute, acquired).unwrap();
        let acquired = ownership.acquire_for_graphics(graphics).unwrap();
        ownership.release_to_compute(graphics, acquired).unwrap();
    }

    #[test]
    fn test_full_cycle_returns_to_released_to_compute() {
        let mut ownership = ownership();
        let mut setup = Recorder::default();
        ownership.release_initial_to_compute(&mut setup).unwrap();

        let (mut compute, mut graphics) = (Recorder::default(), Recorder::default());
        for _ in 0..3 {
            run_frame(&mut ownership, &mut compute, &mut graphics);
        }
        assert_eq!(ownership.state(), OwnershipState::ReleasedToCompute);
        assert_eq!(compute.barriers.len(), 6);
        assert_eq!(graphics.barriers.len(), 6);
    }

    #[test]
    fn test_compute_barriers_use_dispatch_stages() {
        let mut ownership = ownership();
        ownership.release_initial_to_compute(&mut Recorder::default()).unwrap();

        let mut compute = Recorder::default();
        let acquired = ownership.acquire_for_compute(&mut compute).unwrap();
        ownership.release_to_graphics(&mut compute, acquired).unwrap();

        let [acquire, release] = [compute.barriers[0], compute.barriers[1]];
        assert_eq!(acquire.src_stage, vk::PipelineStageFlags::DRAW_INDIRECT);
        assert_eq!(acquire.dst_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!((acquire.src_family, acquire.dst_family), (GRAPHICS, COMPUTE));
        assert_eq!(release.src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!((release.src_family, release.dst_family), (COMPUTE, GRAPHICS));
    }

    #[test]
    fn test_acquire_and_release_pair_up_across_queues() {
        let mut ownership = ownership();
        let mut graphics = Recorder::default();
        ownership.release_initial_to_compute(&mut graphics).unwrap();
        let mut compute = Recorder::default();
        let acquired = ownership.acquire_for_compute(&mut compute).unwrap();

        // Release on one queue and acquire on the other name the same family pair
        let release = graphics.barriers[0];
        let acquire = compute.barriers[0];
        assert_eq!((release.src_family, release.dst_family), (acquire.src_family, acquire.dst_family));
        ownership.release_to_graphics(&mut compute, acquired).unwrap();
    }

    #[test]
    fn test_graphics_acquire_before_compute_release_is_rejected() {
        let mut ownership = ownership();
        ownership.release_initial_to_compute(&mut Recorder::default()).unwrap();
        let err = ownership.acquire_for_graphics(&mut Recorder::default()).unwrap_err();
        assert!(matches!(err, VulkanError::Ownership { expected: "released to graphics", .. }));
    }

    #[test]
    fn test_double_compute_acquire_is_rejected() {
        let mut ownership = ownership();
        ownership.release_initial_to_compute(&mut Recorder::default()).unwrap();
        let mut compute = Recorder::default();
        let acquired = ownership.acquire_for_compute(&mut compute).unwrap();
        assert!(ownership.acquire_for_compute(&mut compute).is_err());
        assert_eq!(compute.barriers.len(), 1);
        ownership.release_to_graphics(&mut compute, acquired).unwrap();
    }

    #[test]
    fn test_shared_family_ignores_queue_indices() {
        let mut ownership = QueueOwnership::new(vk::Buffer::null(), 64, 0, 0);
        let mut sink = Recorder::default();
        ownership.release_initial_to_compute(&mut sink).unwrap();
        assert_eq!(sink.barriers[0].src_family, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(sink.barriers[0].dst_family, vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn test_initial_release_only_happens_once() {
        let mut ownership = ownership();
        ownership.release_initial_to_compute(&mut Recorder::default()).unwrap();
        let (mut compute, mut graphics) = (Recorder::default(), Recorder::default());
        let acquired = ownership.acquire_for_compute(&mut compute).unwrap();
        ownership.release_to_graphics(&mut compute, acquired).unwrap();
        let acquired = ownership.acquire_for_graphics(&mut graphics).unwrap();

        // Graphics owns the buffer again, but only the per-frame release may hand it over
        let err = ownership.release_initial_to_compute(&mut graphics).unwrap_err();
        assert!(matches!(err, VulkanError::InvalidOperation { .. }));
        assert_eq!(graphics.barriers.len(), 1);
        ownership.release_to_compute(&mut graphics, acquired).unwrap();
        assert_eq!(ownership.state(), OwnershipState::ReleasedToCompute);
    }
}
