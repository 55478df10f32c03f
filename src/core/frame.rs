use crate::{
    core::{commands::*, context::Context, sync::*},
    deletion::DeletionQueue,
    descriptors::{DescriptorAllocatorGrowable, PoolSizeRatio},
};

use vulkanalia::prelude::v1_3::*;
use anyhow::{anyhow, Result};

/// Number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

const FRAME_DESCRIPTOR_SETS: u32 = 1000;

const FRAME_DESCRIPTOR_RATIOS: &[PoolSizeRatio] = &[
    PoolSizeRatio::new(vk::DescriptorType::STORAGE_IMAGE, 3.0),
    PoolSizeRatio::new(vk::DescriptorType::STORAGE_BUFFER, 3.0),
    PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 3.0),
    PoolSizeRatio::new(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4.0),
];

/// Data for a single render frame.
pub struct FrameData {
    /// Command pool where the main buffer is allocated.
    pub command_pool: vk::CommandPool,
    /// Main buffer to handle frame commands.
    pub main_buffer: vk::CommandBuffer,
    /// Signaled by the presentation engine once the acquired
    /// image can be rendered to. Acquiring returns as soon as an
    /// image index is known, which can be before the image is
    /// actually released by the display, so the submission waits
    /// on this semaphore at the color attachment output stage:
    /// the compute background and everything before it may
    /// already run while the image is still on screen.
    pub image_available_semaphore: vk::Semaphore,
    /// Signaled when the frame's commands have executed, waited
    /// on by presentation. Semaphores only order work on the GPU
    /// side, so the CPU never waits on this one.
    pub render_finished_semaphore: vk::Semaphore,
    /// Signaled when the GPU is done with this slot. This is the
    /// only GPU to CPU synchronization of the frame: until it
    /// signals, the command buffer, the descriptor sets and
    /// every object queued for deletion in this slot may still
    /// be in use. It is created signaled so the first wait on a
    /// slot that was never submitted returns at once.
    pub in_flight_fence: vk::Fence,
    /// Transient objects released once the slot comes around
    /// again.
    pub deletion_queue: DeletionQueue,
    /// Scratch descriptor sets, reset every time the slot is
    /// reused.
    pub descriptors: DescriptorAllocatorGrowable,
}

impl FrameData {
    pub fn create(device: &Device, queue_family: u32) -> Result<Self> {
        let command_pool = create_command_pool(device, queue_family)?;
        let main_buffer = allocate_command_buffer(device, command_pool)?;

        Ok(Self {
            command_pool,
            main_buffer,
            image_available_semaphore: create_semaphore(device)?,
            render_finished_semaphore: create_semaphore(device)?,
            in_flight_fence: create_fence(device, true)?,
            deletion_queue: DeletionQueue::new(),
            descriptors: DescriptorAllocatorGrowable::new(
                device,
                FRAME_DESCRIPTOR_SETS,
                FRAME_DESCRIPTOR_RATIOS,
            )?,
        })
    }

    /// Releases the slot's transient objects and resets its
    /// descriptor pools. The slot's fence must have signaled.
    pub fn reclaim(&mut self, context: &mut Context) -> Result<()> {
        self.deletion_queue.flush(context);
        self.descriptors.clear_pools(&context.device)
    }

    /// The device must be idle.
    pub fn destroy(&mut self, context: &mut Context) {
        self.descriptors.defer_destroy(&mut self.deletion_queue);
        self.deletion_queue.flush(context);

        let device = &context.device;
        unsafe {
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_semaphore(self.image_available_semaphore, None);
            device.destroy_semaphore(self.render_finished_semaphore, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Fixed ring of per-frame slots, selected by the frame counter
/// modulo [`MAX_FRAMES_IN_FLIGHT`].
pub struct FrameRing<T> {
    slots: [T; MAX_FRAMES_IN_FLIGHT],
    frame_number: u64,
}

impl<T> FrameRing<T> {
    pub fn new(slots: [T; MAX_FRAMES_IN_FLIGHT]) -> Self {
        Self { slots, frame_number: 0 }
    }

    /// Builds every slot with `create`, failing on the first
    /// slot that cannot be created.
    pub fn try_new<F>(mut create: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<T>,
    {
        let slots = (0..MAX_FRAMES_IN_FLIGHT)
            .map(&mut create)
            .collect::<Result<Vec<_>>>()?;

        let slots = slots
            .try_into()
            .map_err(|_| anyhow!("Frame ring needs exactly {MAX_FRAMES_IN_FLIGHT} slots."))?;

        Ok(Self::new(slots))
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Index of the slot the current frame uses.
    pub fn index(&self) -> usize {
        (self.frame_number % MAX_FRAMES_IN_FLIGHT as u64) as usize
    }

    pub fn current(&self) -> &T {
        &self.slots[self.index()]
    }

    pub fn current_mut(&mut self) -> &mut T {
        let index = self.index();
        &mut self.slots[index]
    }

    pub fn advance(&mut self) {
        self.frame_number += 1;
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deletion::Release;

    #[test]
    fn slots_cycle_through_the_ring() {
        let mut ring = FrameRing::new([(), ()]);
        let mut used = Vec::new();

        for _ in 0..3 {
            used.push(ring.index());
            ring.advance();
        }

        assert_eq!(used, vec![0, 1, 0]);
        assert_eq!(ring.frame_number(), 3);
    }

    #[test]
    fn slot_queues_are_isolated() {
        struct Sink(Vec<u32>);
        impl Release<u32> for Sink {
            fn release(&mut self, resource: u32) {
                self.0.push(resource);
            }
        }

        let mut ring = FrameRing::<DeletionQueue<u32>>::try_new(|_| Ok(DeletionQueue::new()))
            .unwrap();

        ring.current_mut().push(10u32);
        ring.current_mut().push(11u32);
        ring.advance();
        ring.current_mut().push(20u32);

        // Flushing slot 1 leaves slot 0 alone.
        let mut sink = Sink(Vec::new());
        ring.current_mut().flush(&mut sink);
        assert_eq!(sink.0, vec![20]);

        ring.advance();
        assert_eq!(ring.current().len(), 2);
        ring.current_mut().flush(&mut sink);
        assert_eq!(sink.0, vec![20, 11, 10]);
    }

    #[test]
    fn try_new_stops_at_the_first_failure() {
        let ring = FrameRing::<u32>::try_new(|i| match i {
            0 => Ok(0),
            _ => Err(anyhow!("slot {i} failed")),
        });
        assert!(ring.is_err());
    }
}
