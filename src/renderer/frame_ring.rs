//! Per-frame ring of upload buffers
//!
//! Each window owns N (normally 2) slots of vertex, index and
//! shape-property buffers. Frame `k` records into slot `k % N`; a slot is
//! reused only after the fence of the frame that last used it has
//! completed, so the CPU never overwrites bytes the GPU is still reading.

use super::buffer::{BufferRole, GrowableBuffer};
use super::context::GpuContext;
use super::fence::FenceValue;
use super::painter::FrameSinks;
use crate::error::GpuError;
use crate::gpu::DrawCall;
use log::trace;

/// Default number of frames in flight
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Initial byte capacity of each buffer in a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCapacities {
    pub vertices: u64,
    pub indices: u64,
    pub properties: u64,
}

impl Default for RingCapacities {
    fn default() -> Self {
        Self {
            vertices: 64 * 1024,
            indices: 16 * 1024,
            properties: 16 * 1024,
        }
    }
}

#[derive(Debug)]
pub struct FrameSlot {
    pub vertices: GrowableBuffer,
    pub indices: GrowableBuffer,
    pub properties: GrowableBuffer,
    draws: Vec<DrawCall>,
    /// Fence of the last frame submitted from this slot
    fence: FenceValue,
}

impl FrameSlot {
    fn new(ctx: &GpuContext, label: &str, capacities: RingCapacities) -> Result<Self, GpuError> {
        Ok(Self {
            vertices: GrowableBuffer::new(ctx, BufferRole::Vertex, label, capacities.vertices)?,
            indices: GrowableBuffer::new(ctx, BufferRole::Index, label, capacities.indices)?,
            properties: GrowableBuffer::new(
                ctx,
                BufferRole::ShapeProperties,
                label,
                capacities.properties,
            )?,
            draws: Vec::new(),
            fence: FenceValue::ZERO,
        })
    }

    pub fn fence(&self) -> FenceValue {
        self.fence
    }

    pub fn draws(&self) -> &[DrawCall] {
        &self.draws
    }

    pub fn is_free(&self, completed: FenceValue) -> bool {
        completed >= self.fence
    }

    fn reset(&mut self) {
        self.vertices.clear();
        self.indices.clear();
        self.properties.clear();
        self.draws.clear();
    }

    /// Sinks the drawing layer appends into
    pub fn sinks(&mut self, width: u32, height: u32) -> FrameSinks<'_> {
        FrameSinks {
            vertices: &mut self.vertices,
            indices: &mut self.indices,
            properties: &mut self.properties,
            draws: &mut self.draws,
            width,
            height,
        }
    }
}

#[derive(Debug)]
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    index: usize,
}

impl FrameRing {
    pub fn new(
        ctx: &GpuContext,
        label: &str,
        frames_in_flight: usize,
        capacities: RingCapacities,
    ) -> Result<Self, GpuError> {
        let slots = (0..frames_in_flight.max(1))
            .map(|i| FrameSlot::new(ctx, &format!("{} slot {}", label, i), capacities))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { slots, index: 0 })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn frame_index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.index]
    }

    pub fn current_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.index]
    }

    /// Fence the current slot is waiting on before it can be reused
    pub fn current_fence(&self) -> FenceValue {
        self.current().fence
    }

    /// Claim the current slot for recording, or `None` while the GPU still
    /// reads it
    pub fn begin_frame(&mut self, completed: FenceValue) -> Option<&mut FrameSlot> {
        let slot = &mut self.slots[self.index];
        if !slot.is_free(completed) {
            trace!(
                "ring slot {} busy until {} (completed {})",
                self.index,
                slot.fence,
                completed
            );
            return None;
        }
        slot.reset();
        Some(slot)
    }

    /// Tag the recorded slot with its submission fence and move on
    pub fn finish_frame(&mut self, fence: FenceValue) {
        self.slots[self.index].fence = fence;
        self.index = (self.index + 1) % self.slots.len();
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;
    use std::sync::Arc;

    fn ring() -> (Arc<HeadlessDevice>, GpuContext, FrameRing) {
        let device = Arc::new(HeadlessDevice::new());
        let ctx = GpuContext::new(device.clone(), [4, 4, 4]).unwrap();
        let ring = FrameRing::new(&ctx, "test", FRAMES_IN_FLIGHT, RingCapacities::default()).unwrap();
        (device, ctx, ring)
    }

    #[test]
    fn test_slots_alternate() {
        let (_, ctx, mut ring) = ring();
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.frame_index(), 0);
        ring.begin_frame(FenceValue::ZERO).unwrap();
        ring.finish_frame(ctx.clock.signal().unwrap());
        assert_eq!(ring.frame_index(), 1);
        ring.begin_frame(FenceValue::ZERO).unwrap();
        ring.finish_frame(ctx.clock.signal().unwrap());
        assert_eq!(ring.frame_index(), 0);
    }

    #[test]
    fn test_busy_slot_is_not_reused() {
        let (device, ctx, mut ring) = ring();
        for _ in 0..2 {
            let slot = ring.begin_frame(ctx.clock.completed_value().unwrap()).unwrap();
            slot.vertices.append(&[1u8; 64]).unwrap();
            ring.finish_frame(ctx.clock.signal().unwrap());
        }
        // slot 0 carries fence 1, which has not completed
        assert!(ring.begin_frame(ctx.clock.completed_value().unwrap()).is_none());

        device.timeline().complete_through(1);
        let slot = ring.begin_frame(ctx.clock.completed_value().unwrap()).unwrap();
        assert!(slot.vertices.is_empty(), "reused slot starts empty");
    }

    #[test]
    fn test_sinks_record_draws_into_slot() {
        let (_, _, mut ring) = ring();
        let slot = ring.begin_frame(FenceValue::ZERO).unwrap();
        let mut sinks = slot.sinks(100, 100);
        sinks
            .fill_rect(crate::gpu::Rect::new(0, 0, 10, 10), [1.0; 4])
            .unwrap();
        assert_eq!(ring.current().draws().len(), 1);
        assert_eq!(ring.current().indices.len(), 24);
    }
}
