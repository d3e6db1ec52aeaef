//! Shared GPU services
//!
//! The device, fence clock, deferred reclaimer and descriptor pool are
//! process-wide. Instead of globals they travel together in a cheaply
//! cloneable [`GpuContext`] handed to every resource constructor.

use super::descriptors::DescriptorPool;
use super::fence::{FenceClock, FenceValue};
use super::reclaim::DeferredReclaimer;
use crate::error::GpuError;
use crate::gpu::GpuDevice;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct GpuContext {
    pub device: Arc<dyn GpuDevice>,
    pub clock: Arc<FenceClock>,
    pub reclaimer: DeferredReclaimer,
    pub descriptors: DescriptorPool,
}

impl GpuContext {
    /// `descriptor_capacity` is the initial heap size per
    /// [`HeapKind`](crate::gpu::HeapKind), by index
    pub fn new(device: Arc<dyn GpuDevice>, descriptor_capacity: [u32; 3]) -> Result<Self, GpuError> {
        let clock = Arc::new(FenceClock::new(device.create_timeline()?));
        let reclaimer = DeferredReclaimer::new();
        let descriptors = DescriptorPool::new(
            device.clone(),
            clock.clone(),
            reclaimer.clone(),
            descriptor_capacity,
        )?;
        Ok(Self {
            device,
            clock,
            reclaimer,
            descriptors,
        })
    }

    /// Free `resource` once the frame being recorded has completed on the GPU
    pub fn retire<T: Send + 'static>(&self, resource: T) -> FenceValue {
        let tag = self.clock.pending_value();
        self.reclaimer.defer(tag, move || drop(resource));
        tag
    }

    /// Run every deferred cleanup the GPU has caught up with
    pub fn reclaim(&self) -> Result<usize, GpuError> {
        let completed = self.clock.completed_value()?;
        Ok(self.reclaimer.drain(completed))
    }
}
