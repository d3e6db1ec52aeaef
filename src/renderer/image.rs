//! Image resources
//!
//! An [`ImageResource`] pairs a raw image with the state the GPU last saw it
//! in and a descriptor slot in the heap matching its kind. `set_state` is
//! the only way the state changes, and it records exactly one transition
//! barrier when the state actually differs.
//!
//! The descriptor slot's recreate function holds a reference to the raw
//! image, so the image stays alive until the slot is released, which
//! happens through the reclaimer once in-flight frames are done with it.

use super::context::GpuContext;
use super::descriptors::DescriptorHandle;
use super::fence::FenceValue;
use super::reclaim::DeferredReclaimer;
use crate::error::GpuError;
use crate::gpu::{
    align_up, BufferDesc, BufferUsage, Command, CommandList, ImageDesc, ImageFormat, ImageKind,
    RawBuffer, RawImage, Rect, ResourceState,
};
use log::trace;
use std::sync::Arc;

/// Row pitch alignment of image-to-buffer copies
pub const READBACK_ROW_ALIGNMENT: u64 = 256;

pub struct ImageResource {
    ctx: GpuContext,
    raw: Arc<dyn RawImage>,
    state: ResourceState,
    descriptor: Option<DescriptorHandle>,
}

impl std::fmt::Debug for ImageResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageResource")
            .field("desc", self.raw.desc())
            .field("state", &self.state)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl ImageResource {
    /// Create an image in its kind's default state with an eager view
    pub fn new(
        ctx: &GpuContext,
        label: impl Into<String>,
        kind: ImageKind,
        format: ImageFormat,
        width: u32,
        height: u32,
    ) -> Result<Self, GpuError> {
        let raw = ctx.device.create_image(&ImageDesc {
            label: label.into(),
            kind,
            format,
            width,
            height,
        })?;
        Self::wrap(ctx, raw, kind.initial_state())
    }

    /// Track an image created elsewhere (a swapchain back buffer)
    pub fn wrap(
        ctx: &GpuContext,
        raw: Arc<dyn RawImage>,
        state: ResourceState,
    ) -> Result<Self, GpuError> {
        let heap_kind = raw.desc().kind.heap_kind();
        let view = raw.clone();
        let descriptor = ctx
            .descriptors
            .pop_handle(heap_kind, Box::new(move |heap, slot| heap.write_view(slot, &view)))?;
        Ok(Self {
            ctx: ctx.clone(),
            raw,
            state,
            descriptor: Some(descriptor),
        })
    }

    pub fn desc(&self) -> &ImageDesc {
        self.raw.desc()
    }

    pub fn raw(&self) -> &Arc<dyn RawImage> {
        &self.raw
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn descriptor(&self) -> Option<DescriptorHandle> {
        self.descriptor
    }

    pub fn cpu_descriptor(&self) -> Option<u64> {
        self.descriptor
            .as_ref()
            .map(|handle| self.ctx.descriptors.cpu_handle(handle))
    }

    pub fn gpu_descriptor(&self) -> Option<u64> {
        self.descriptor
            .as_ref()
            .and_then(|handle| self.ctx.descriptors.gpu_handle(handle))
    }

    /// Transition to `state`, recording a barrier only if it changes
    pub fn set_state(&mut self, cmd: &mut CommandList, state: ResourceState) {
        if self.state == state {
            return;
        }
        cmd.push(Command::Transition {
            image: self.raw.clone(),
            before: self.state,
            after: state,
        });
        self.state = state;
    }

    /// Fill a storage image with a constant value
    pub fn clear_storage(&mut self, cmd: &mut CommandList, value: [u32; 4]) {
        debug_assert_eq!(
            self.desc().kind,
            ImageKind::Storage,
            "clear_storage on non-storage image '{}'",
            self.desc().label
        );
        self.set_state(cmd, ResourceState::UnorderedAccess);
        cmd.push(Command::ClearStorage {
            image: self.raw.clone(),
            value,
        });
    }

    /// Record a copy of `rect` into a CPU-visible staging buffer.
    ///
    /// The image returns to its previous state afterwards. The data is
    /// available once the recording frame's fence completes.
    pub fn readback(&mut self, cmd: &mut CommandList, rect: Rect) -> Result<Readback, GpuError> {
        let desc = self.raw.desc();
        debug_assert!(
            rect.x + rect.width <= desc.width && rect.y + rect.height <= desc.height,
            "readback {:?} outside '{}'",
            rect,
            desc.label
        );
        let bytes_per_pixel = desc.format.bytes_per_pixel();
        let row_pitch = align_up(rect.width as u64 * bytes_per_pixel as u64, READBACK_ROW_ALIGNMENT);
        let buffer = self.ctx.device.create_buffer(&BufferDesc {
            label: format!("{} readback", desc.label),
            size: row_pitch * rect.height.max(1) as u64,
            usage: BufferUsage::Readback,
        })?;

        let previous = self.state;
        self.set_state(cmd, ResourceState::CopySource);
        cmd.push(Command::CopyImageToBuffer {
            image: self.raw.clone(),
            rect,
            buffer: buffer.clone(),
            row_pitch: row_pitch as u32,
        });
        self.set_state(cmd, previous);

        let fence = self.ctx.clock.pending_value();
        trace!("readback of '{}' ready at {}", self.raw.desc().label, fence);
        Ok(Readback {
            buffer: Some(buffer),
            fence,
            rect,
            row_pitch: row_pitch as u32,
            bytes_per_pixel,
            reclaimer: self.ctx.reclaimer.clone(),
        })
    }

    /// Release the descriptor slot right away.
    ///
    /// Only valid once the GPU is idle, e.g. during a swapchain resize
    /// after the full stall.
    pub fn release_now(mut self) {
        if let Some(handle) = self.descriptor.take() {
            self.ctx.descriptors.release(handle);
        }
    }
}

impl Drop for ImageResource {
    fn drop(&mut self) {
        if let Some(handle) = self.descriptor.take() {
            let descriptors = self.ctx.descriptors.clone();
            self.ctx
                .reclaimer
                .defer(self.ctx.clock.pending_value(), move || descriptors.release(handle));
        }
    }
}

/// Mapped readback rows, `row_pitch` bytes apart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRows {
    pub data: Vec<u8>,
    pub row_pitch: u32,
    pub row_bytes: u32,
    pub height: u32,
}

impl MappedRows {
    pub fn row(&self, y: u32) -> &[u8] {
        let start = (y * self.row_pitch) as usize;
        &self.data[start..start + self.row_bytes as usize]
    }

    /// Rows without pitch padding
    pub fn packed(&self) -> Vec<u8> {
        (0..self.height).flat_map(|y| self.row(y).iter().copied()).collect()
    }
}

/// Pending image-to-buffer copy
#[derive(Debug)]
pub struct Readback {
    buffer: Option<Arc<dyn RawBuffer>>,
    fence: FenceValue,
    rect: Rect,
    row_pitch: u32,
    bytes_per_pixel: u32,
    reclaimer: DeferredReclaimer,
}

impl Readback {
    pub fn fence(&self) -> FenceValue {
        self.fence
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn row_pitch(&self) -> u32 {
        self.row_pitch
    }

    /// Map the staging buffer; `None` until the copy's fence has completed
    pub fn try_map(&self, completed: FenceValue) -> Result<Option<MappedRows>, GpuError> {
        if completed < self.fence {
            return Ok(None);
        }
        let Some(buffer) = self.buffer.as_ref() else {
            return Ok(None);
        };
        let len = self.row_pitch as usize * self.rect.height as usize;
        Ok(Some(MappedRows {
            data: buffer.read(0, len)?,
            row_pitch: self.row_pitch,
            row_bytes: self.rect.width * self.bytes_per_pixel,
            height: self.rect.height,
        }))
    }
}

impl Drop for Readback {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.reclaimer.defer(self.fence, move || drop(buffer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{HeadlessDevice, HeadlessImage};
    use crate::gpu::HeapKind;

    fn context() -> (Arc<HeadlessDevice>, GpuContext) {
        let device = Arc::new(HeadlessDevice::new());
        let ctx = GpuContext::new(device.clone(), [8, 8, 8]).unwrap();
        (device, ctx)
    }

    #[test]
    fn test_initial_state_and_descriptor_heap() {
        let (_, ctx) = context();
        let storage =
            ImageResource::new(&ctx, "s", ImageKind::Storage, ImageFormat::Rgba8Unorm, 8, 8).unwrap();
        assert_eq!(storage.state(), ResourceState::UnorderedAccess);
        assert_eq!(storage.descriptor().unwrap().kind(), HeapKind::ShaderResource);
        assert!(storage.gpu_descriptor().is_some());

        let target =
            ImageResource::new(&ctx, "rt", ImageKind::RenderTarget, ImageFormat::Bgra8Unorm, 8, 8)
                .unwrap();
        assert_eq!(target.state(), ResourceState::RenderTarget);
        assert_eq!(target.descriptor().unwrap().kind(), HeapKind::RenderTarget);
        assert!(target.gpu_descriptor().is_none());

        let depth =
            ImageResource::new(&ctx, "d", ImageKind::DepthStencil, ImageFormat::Depth32Float, 8, 8)
                .unwrap();
        assert_eq!(depth.descriptor().unwrap().kind(), HeapKind::DepthStencil);
    }

    #[test]
    fn test_set_state_emits_at_most_one_barrier() {
        let (_, ctx) = context();
        let mut image =
            ImageResource::new(&ctx, "s", ImageKind::Sampled, ImageFormat::Rgba8Unorm, 4, 4).unwrap();
        let mut cmd = CommandList::new("test");
        image.set_state(&mut cmd, ResourceState::ShaderResource);
        assert_eq!(cmd.barrier_count(), 0);
        image.set_state(&mut cmd, ResourceState::CopyDest);
        image.set_state(&mut cmd, ResourceState::CopyDest);
        assert_eq!(cmd.barrier_count(), 1);
        assert_eq!(image.state(), ResourceState::CopyDest);
    }

    #[test]
    fn test_barriers_validate_on_the_device() {
        let (device, ctx) = context();
        let mut image =
            ImageResource::new(&ctx, "s", ImageKind::Storage, ImageFormat::Rgba8Unorm, 4, 4).unwrap();
        let mut cmd = CommandList::new("test");
        image.set_state(&mut cmd, ResourceState::ShaderResource);
        image.set_state(&mut cmd, ResourceState::CopySource);
        ctx.device.submit(cmd).unwrap();
        let raw = image.raw().as_any().downcast_ref::<HeadlessImage>().unwrap();
        assert_eq!(raw.device_state(), ResourceState::CopySource);
        assert_eq!(device.submissions()[0].barriers, 2);
    }

    #[test]
    fn test_readback_row_pitch_and_readiness() {
        let (device, ctx) = context();
        let mut image =
            ImageResource::new(&ctx, "s", ImageKind::Storage, ImageFormat::Rgba8Unorm, 16, 4).unwrap();
        let mut cmd = CommandList::new("readback");
        image.clear_storage(&mut cmd, [0x11, 0x22, 0x33, 0x44]);
        let readback = image.readback(&mut cmd, Rect::new(0, 0, 10, 2)).unwrap();
        assert_eq!(readback.row_pitch(), 256);
        assert_eq!(image.state(), ResourceState::UnorderedAccess);

        ctx.device.submit(cmd).unwrap();
        let fence = ctx.clock.signal().unwrap();
        assert_eq!(fence, readback.fence());
        assert!(readback.try_map(ctx.clock.completed_value().unwrap()).unwrap().is_none());

        device.timeline().complete_all();
        let rows = readback
            .try_map(ctx.clock.completed_value().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(rows.row(1).len(), 40);
        assert_eq!(&rows.row(1)[..4], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(rows.packed().len(), 80);
    }

    #[test]
    fn test_drop_releases_descriptor_after_fence() {
        let (device, ctx) = context();
        let image =
            ImageResource::new(&ctx, "s", ImageKind::Sampled, ImageFormat::Rgba8Unorm, 4, 4).unwrap();
        let handle = image.descriptor().unwrap();
        drop(image);
        assert!(ctx.descriptors.is_live(&handle));
        assert_eq!(device.live_objects().images, 1);

        ctx.clock.signal().unwrap();
        device.timeline().complete_all();
        ctx.reclaim().unwrap();
        assert!(!ctx.descriptors.is_live(&handle));
        assert_eq!(device.live_objects().images, 0);
    }
}
