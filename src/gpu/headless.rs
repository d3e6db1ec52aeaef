//! Headless GPU simulation
//!
//! A [`GpuDevice`] whose "GPU" is host memory. Buffers and images keep their
//! bytes in `Vec`s, descriptor heaps get synthetic address ranges, and the
//! timeline only advances when told to (or on every signal in auto mode).
//! Submission validates barriers against the state the device believes each
//! image is in, the way a validation layer would.
//!
//! Live-object counters make the deferred-free behaviour observable: a
//! buffer handed to the reclaimer is still counted until its closure runs.

use super::{
    AddressSpace, BufferDesc, Command, CommandList, CompositionVisual, GpuDevice, HeapKind,
    ImageDesc, ImageKind, NativeSurface, RawBuffer, RawDescriptorHeap, RawImage, RawSwapchain,
    RawTimeline, ResourceState, SwapchainDesc,
};
use crate::error::GpuError;
use log::{debug, trace};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Sentinel reported by a lost device
pub const DEVICE_LOST: u64 = u64::MAX;

/// Largest single buffer the simulated device accepts (1 GiB)
const MAX_BUFFER_SIZE: u64 = 1 << 30;

/// Live object counters, shared with every object the device creates
#[derive(Debug, Default)]
pub struct LiveCounters {
    buffers: AtomicUsize,
    images: AtomicUsize,
    heaps: AtomicUsize,
    swapchains: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub buffers: usize,
    pub images: usize,
    pub heaps: usize,
    pub swapchains: usize,
}

/// What happened to one native surface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurfaceStats {
    pub presents: u64,
    pub resizes: u64,
    pub size: (u32, u32),
    pub visual_binds: u64,
    pub visual_commits: u64,
}

/// Summary of one submitted command list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub label: String,
    pub commands: usize,
    pub barriers: usize,
    pub draws: usize,
    pub heap_binds: usize,
}

#[derive(Debug)]
pub struct HeadlessDevice {
    buffer_addresses: AddressSpace,
    heap_addresses: AddressSpace,
    next_image_id: AtomicU64,
    live: Arc<LiveCounters>,
    timeline: Arc<HeadlessTimeline>,
    surfaces: Arc<Mutex<HashMap<u64, SurfaceStats>>>,
    submissions: Mutex<Vec<SubmissionRecord>>,
    fail_submissions: AtomicBool,
}

impl HeadlessDevice {
    /// Device whose timeline only advances under caller control
    pub fn new() -> Self {
        Self::with_timeline(HeadlessTimeline::manual())
    }

    /// Device whose timeline completes every signal immediately
    pub fn auto_complete() -> Self {
        Self::with_timeline(HeadlessTimeline::auto())
    }

    fn with_timeline(timeline: HeadlessTimeline) -> Self {
        Self {
            buffer_addresses: AddressSpace::new(0x0001_0000_0000),
            heap_addresses: AddressSpace::new(0x7f00_0000_0000),
            next_image_id: AtomicU64::new(1),
            live: Arc::new(LiveCounters::default()),
            timeline: Arc::new(timeline),
            surfaces: Arc::new(Mutex::new(HashMap::new())),
            submissions: Mutex::new(Vec::new()),
            fail_submissions: AtomicBool::new(false),
        }
    }

    /// The one timeline every `create_timeline` call shares
    pub fn timeline(&self) -> &Arc<HeadlessTimeline> {
        &self.timeline
    }

    pub fn live_objects(&self) -> LiveObjects {
        LiveObjects {
            buffers: self.live.buffers.load(Ordering::SeqCst),
            images: self.live.images.load(Ordering::SeqCst),
            heaps: self.live.heaps.load(Ordering::SeqCst),
            swapchains: self.live.swapchains.load(Ordering::SeqCst),
        }
    }

    pub fn surface_stats(&self, surface_id: u64) -> Option<SurfaceStats> {
        self.surfaces.lock().get(&surface_id).cloned()
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.submissions.lock().clone()
    }

    /// Make every later submission fail, as a hung or removed device would
    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submissions.store(fail, Ordering::SeqCst);
    }

    fn new_image(&self, desc: ImageDesc, state: ResourceState) -> HeadlessImage {
        let bytes = desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel() as usize;
        self.live.images.fetch_add(1, Ordering::SeqCst);
        HeadlessImage {
            id: self.next_image_id.fetch_add(1, Ordering::Relaxed),
            desc,
            pixels: Mutex::new(vec![0; bytes]),
            device_state: Mutex::new(state),
            live: self.live.clone(),
        }
    }

    fn execute(&self, list: &CommandList) -> Result<SubmissionRecord, GpuError> {
        let mut record = SubmissionRecord {
            label: list.label().to_string(),
            commands: list.len(),
            barriers: 0,
            draws: 0,
            heap_binds: 0,
        };
        for command in list.commands() {
            match command {
                Command::Transition {
                    image,
                    before,
                    after,
                } => {
                    let image = downcast_image(image.as_ref())?;
                    let mut state = image.device_state.lock();
                    if *state != *before {
                        return Err(GpuError::Submit(format!(
                            "barrier on '{}' expects {:?} but the image is in {:?}",
                            image.desc.label, before, *state
                        )));
                    }
                    *state = *after;
                    record.barriers += 1;
                }
                Command::BindDescriptorHeaps { heaps } => {
                    record.heap_binds += heaps.len();
                }
                Command::BeginPass { target, clear } => {
                    let image = downcast_image(target.as_ref())?;
                    let state = *image.device_state.lock();
                    if state != ResourceState::RenderTarget {
                        return Err(GpuError::Submit(format!(
                            "render pass target '{}' is in {:?}",
                            image.desc.label, state
                        )));
                    }
                    if let Some(color) = clear {
                        image.fill(&color_to_rgba8(*color));
                    }
                }
                Command::ClearStorage { image, value } => {
                    let image = downcast_image(image.as_ref())?;
                    let state = *image.device_state.lock();
                    if state != ResourceState::UnorderedAccess {
                        return Err(GpuError::Submit(format!(
                            "storage clear of '{}' in {:?}",
                            image.desc.label, state
                        )));
                    }
                    image.fill(&image.desc.format.clear_pattern(*value));
                }
                Command::CopyImageToBuffer {
                    image,
                    rect,
                    buffer,
                    row_pitch,
                } => {
                    let image = downcast_image(image.as_ref())?;
                    let state = *image.device_state.lock();
                    if state != ResourceState::CopySource {
                        return Err(GpuError::Submit(format!(
                            "copy source '{}' is in {:?}",
                            image.desc.label, state
                        )));
                    }
                    let bpp = image.desc.format.bytes_per_pixel() as usize;
                    let pixels = image.pixels.lock();
                    let src_pitch = image.desc.width as usize * bpp;
                    let row_bytes = rect.width as usize * bpp;
                    for row in 0..rect.height as usize {
                        let src = (rect.y as usize + row) * src_pitch + rect.x as usize * bpp;
                        let dst = row * *row_pitch as usize;
                        buffer.write(dst as u64, &pixels[src..src + row_bytes]);
                    }
                }
                Command::Draw(_) => record.draws += 1,
                Command::SetVertexBuffer { .. }
                | Command::SetIndexBuffer { .. }
                | Command::SetShapeProperties { .. }
                | Command::EndPass => {}
            }
        }
        Ok(record)
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast_image(image: &dyn RawImage) -> Result<&HeadlessImage, GpuError> {
    image
        .as_any()
        .downcast_ref::<HeadlessImage>()
        .ok_or_else(|| GpuError::Submit("image was not created by the headless device".into()))
}

fn color_to_rgba8(color: [f32; 4]) -> [u8; 4] {
    color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
}

impl GpuDevice for HeadlessDevice {
    fn adapter_name(&self) -> String {
        "headless".to_string()
    }

    fn max_buffer_size(&self) -> u64 {
        MAX_BUFFER_SIZE
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn RawBuffer>, GpuError> {
        if desc.size > MAX_BUFFER_SIZE {
            return Err(GpuError::BufferTooLarge {
                requested: desc.size,
                limit: MAX_BUFFER_SIZE,
            });
        }
        self.live.buffers.fetch_add(1, Ordering::SeqCst);
        let address = self.buffer_addresses.reserve(desc.size);
        trace!("headless buffer '{}' {} bytes @ {:#x}", desc.label, desc.size, address);
        Ok(Arc::new(HeadlessBuffer {
            desc: desc.clone(),
            address,
            data: Mutex::new(vec![0; desc.size as usize]),
            live: self.live.clone(),
        }))
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<Arc<dyn RawImage>, GpuError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::creation("image", format!("'{}' has zero extent", desc.label)));
        }
        Ok(Arc::new(self.new_image(desc.clone(), desc.kind.initial_state())))
    }

    fn create_descriptor_heap(
        &self,
        kind: HeapKind,
        capacity: u32,
    ) -> Result<Arc<dyn RawDescriptorHeap>, GpuError> {
        let layout = kind.layout();
        let bytes = capacity as u64 * layout.descriptor_size;
        let cpu_base = self.heap_addresses.reserve(bytes);
        let gpu_base = layout
            .shader_visible
            .then(|| self.heap_addresses.reserve(bytes));
        self.live.heaps.fetch_add(1, Ordering::SeqCst);
        debug!("headless {:?} heap with {} slots @ {:#x}", kind, capacity, cpu_base);
        Ok(Arc::new(HeadlessHeap {
            kind,
            capacity,
            cpu_base,
            gpu_base,
            slots: Mutex::new(vec![None; capacity as usize]),
            live: self.live.clone(),
        }))
    }

    fn create_timeline(&self) -> Result<Arc<dyn RawTimeline>, GpuError> {
        Ok(self.timeline.clone())
    }

    fn create_swapchain(
        &self,
        surface: &NativeSurface,
        desc: &SwapchainDesc,
    ) -> Result<Box<dyn RawSwapchain>, GpuError> {
        if desc.image_count < 2 {
            return Err(GpuError::Swapchain(format!(
                "{} images requested, at least 2 are required",
                desc.image_count
            )));
        }
        self.surfaces.lock().insert(
            surface.id,
            SurfaceStats {
                size: (desc.width, desc.height),
                ..Default::default()
            },
        );
        self.live.swapchains.fetch_add(1, Ordering::SeqCst);
        let mut swapchain = HeadlessSwapchain {
            surface_id: surface.id,
            desc: desc.clone(),
            images: Vec::new(),
            next: 0,
            acquired: None,
            device: HeadlessImageFactory {
                next_image_id: AtomicU64::new(self.next_image_id.fetch_add(1 << 20, Ordering::Relaxed)),
                live: self.live.clone(),
            },
            surfaces: self.surfaces.clone(),
        };
        swapchain.create_images();
        Ok(Box::new(swapchain))
    }

    fn create_composition(
        &self,
        surface: &NativeSurface,
    ) -> Result<Box<dyn CompositionVisual>, GpuError> {
        Ok(Box::new(HeadlessComposition {
            surface_id: surface.id,
            surfaces: self.surfaces.clone(),
        }))
    }

    fn submit(&self, commands: CommandList) -> Result<(), GpuError> {
        if self.fail_submissions.load(Ordering::SeqCst) {
            return Err(GpuError::Submit(format!("'{}' rejected", commands.label())));
        }
        let record = self.execute(&commands)?;
        trace!(
            "headless submit '{}': {} commands, {} draws",
            record.label,
            record.commands,
            record.draws
        );
        self.submissions.lock().push(record);
        Ok(())
    }
}

#[derive(Debug)]
pub struct HeadlessBuffer {
    desc: BufferDesc,
    address: u64,
    data: Mutex<Vec<u8>>,
    live: Arc<LiveCounters>,
}

impl RawBuffer for HeadlessBuffer {
    fn size(&self) -> u64 {
        self.desc.size
    }

    fn gpu_address(&self) -> u64 {
        self.address
    }

    fn write(&self, offset: u64, bytes: &[u8]) {
        let offset = offset as usize;
        let mut data = self.data.lock();
        debug_assert!(offset + bytes.len() <= data.len(), "write past end of '{}'", self.desc.label);
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, GpuError> {
        let offset = offset as usize;
        let data = self.data.lock();
        data.get(offset..offset + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| GpuError::creation("buffer read", format!("{}+{} out of range", offset, len)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HeadlessBuffer {
    fn drop(&mut self) {
        self.live.buffers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct HeadlessImage {
    id: u64,
    desc: ImageDesc,
    pixels: Mutex<Vec<u8>>,
    device_state: Mutex<ResourceState>,
    live: Arc<LiveCounters>,
}

impl HeadlessImage {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// State the simulated GPU believes the image is in
    pub fn device_state(&self) -> ResourceState {
        *self.device_state.lock()
    }

    pub fn pixels(&self) -> Vec<u8> {
        self.pixels.lock().clone()
    }

    /// Overwrite pixel contents directly, standing in for an upload
    pub fn upload(&self, bytes: &[u8]) {
        let mut pixels = self.pixels.lock();
        let n = bytes.len().min(pixels.len());
        pixels[..n].copy_from_slice(&bytes[..n]);
    }

    fn fill(&self, pattern: &[u8]) {
        if pattern.is_empty() {
            return;
        }
        let mut pixels = self.pixels.lock();
        for chunk in pixels.chunks_mut(pattern.len()) {
            chunk.copy_from_slice(&pattern[..chunk.len()]);
        }
    }
}

impl RawImage for HeadlessImage {
    fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HeadlessImage {
    fn drop(&mut self) {
        self.live.images.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct HeadlessHeap {
    kind: HeapKind,
    capacity: u32,
    cpu_base: u64,
    gpu_base: Option<u64>,
    /// Image id installed in each slot
    slots: Mutex<Vec<Option<u64>>>,
    live: Arc<LiveCounters>,
}

impl HeadlessHeap {
    pub fn slot_contents(&self, slot: u32) -> Option<u64> {
        self.slots.lock().get(slot as usize).copied().flatten()
    }
}

impl RawDescriptorHeap for HeadlessHeap {
    fn kind(&self) -> HeapKind {
        self.kind
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn cpu_base(&self) -> u64 {
        self.cpu_base
    }

    fn gpu_base(&self) -> Option<u64> {
        self.gpu_base
    }

    fn write_view(&self, slot: u32, image: &Arc<dyn RawImage>) -> Result<(), GpuError> {
        let image = downcast_image(image.as_ref())?;
        let mut slots = self.slots.lock();
        let entry = slots.get_mut(slot as usize).ok_or_else(|| {
            GpuError::creation("descriptor view", format!("slot {} outside {:?} heap", slot, self.kind))
        })?;
        *entry = Some(image.id);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HeadlessHeap {
    fn drop(&mut self) {
        self.live.heaps.fetch_sub(1, Ordering::SeqCst);
    }
}

type CompletionCallback = Box<dyn FnOnce() + Send>;

/// Simulated GPU timeline.
///
/// In manual mode `completed` only moves through [`complete_through`]
/// (and [`complete_all`]); in auto mode every signal completes at once.
///
/// [`complete_through`]: HeadlessTimeline::complete_through
/// [`complete_all`]: HeadlessTimeline::complete_all
pub struct HeadlessTimeline {
    auto: bool,
    signaled: AtomicU64,
    completed: AtomicU64,
    waiters: Mutex<Vec<(u64, CompletionCallback)>>,
}

impl std::fmt::Debug for HeadlessTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessTimeline")
            .field("auto", &self.auto)
            .field("signaled", &self.signaled.load(Ordering::SeqCst))
            .field("completed", &self.completed.load(Ordering::SeqCst))
            .finish()
    }
}

impl HeadlessTimeline {
    pub fn manual() -> Self {
        Self::new(false)
    }

    pub fn auto() -> Self {
        Self::new(true)
    }

    fn new(auto: bool) -> Self {
        Self {
            auto,
            signaled: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn signaled(&self) -> u64 {
        self.signaled.load(Ordering::SeqCst)
    }

    /// Let the simulated GPU finish everything up to `value`.
    ///
    /// Completion never runs ahead of what has been signaled.
    pub fn complete_through(&self, value: u64) {
        let target = value.min(self.signaled());
        let previous = self.completed.fetch_max(target, Ordering::SeqCst);
        if previous == DEVICE_LOST {
            self.completed.store(DEVICE_LOST, Ordering::SeqCst);
            return;
        }
        self.fire_ready();
    }

    pub fn complete_all(&self) {
        self.complete_through(self.signaled());
    }

    /// Simulate device removal
    pub fn lose_device(&self) {
        self.completed.store(DEVICE_LOST, Ordering::SeqCst);
    }

    fn fire_ready(&self) {
        let completed = self.completed.load(Ordering::SeqCst);
        let ready: Vec<CompletionCallback> = {
            let mut waiters = self.waiters.lock();
            let (ready, pending): (Vec<_>, Vec<_>) =
                waiters.drain(..).partition(|(value, _)| *value <= completed);
            *waiters = pending;
            ready.into_iter().map(|(_, callback)| callback).collect()
        };
        for callback in ready {
            callback();
        }
    }
}

impl RawTimeline for HeadlessTimeline {
    fn signal(&self, value: u64) -> Result<(), GpuError> {
        if self.completed.load(Ordering::SeqCst) == DEVICE_LOST {
            return Err(GpuError::DeviceLost);
        }
        self.signaled.fetch_max(value, Ordering::SeqCst);
        if self.auto {
            self.complete_through(value);
        }
        Ok(())
    }

    fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    fn on_completion(&self, value: u64, callback: Box<dyn FnOnce() + Send>) {
        {
            let mut waiters = self.waiters.lock();
            if self.completed.load(Ordering::SeqCst) < value {
                waiters.push((value, callback));
                return;
            }
        }
        callback();
    }
}

/// Image allocation state a swapchain keeps after its device call returns
#[derive(Debug)]
struct HeadlessImageFactory {
    next_image_id: AtomicU64,
    live: Arc<LiveCounters>,
}

#[derive(Debug)]
pub struct HeadlessSwapchain {
    surface_id: u64,
    desc: SwapchainDesc,
    images: Vec<Arc<HeadlessImage>>,
    next: u32,
    acquired: Option<u32>,
    device: HeadlessImageFactory,
    surfaces: Arc<Mutex<HashMap<u64, SurfaceStats>>>,
}

impl HeadlessSwapchain {
    fn create_images(&mut self) {
        self.images = (0..self.desc.image_count)
            .map(|index| {
                let desc = ImageDesc {
                    label: format!("surface {} back buffer {}", self.surface_id, index),
                    kind: ImageKind::RenderTarget,
                    format: self.desc.format,
                    width: self.desc.width,
                    height: self.desc.height,
                };
                let bytes = desc.width as usize
                    * desc.height as usize
                    * desc.format.bytes_per_pixel() as usize;
                self.device.live.images.fetch_add(1, Ordering::SeqCst);
                Arc::new(HeadlessImage {
                    id: self.device.next_image_id.fetch_add(1, Ordering::Relaxed),
                    desc,
                    pixels: Mutex::new(vec![0; bytes]),
                    device_state: Mutex::new(ResourceState::Present),
                    live: self.device.live.clone(),
                })
            })
            .collect();
    }

    /// Pixels of present image `index`
    pub fn image_pixels(&self, index: u32) -> Option<Vec<u8>> {
        self.images.get(index as usize).map(|image| image.pixels())
    }
}

impl RawSwapchain for HeadlessSwapchain {
    fn image_count(&self) -> u32 {
        self.desc.image_count
    }

    fn image(&self, index: u32) -> Result<Arc<dyn RawImage>, GpuError> {
        self.images
            .get(index as usize)
            .map(|image| image.clone() as Arc<dyn RawImage>)
            .ok_or_else(|| GpuError::Swapchain(format!("no present image {}", index)))
    }

    fn acquire(&mut self) -> Result<u32, GpuError> {
        let index = self.next;
        self.next = (self.next + 1) % self.desc.image_count;
        self.acquired = Some(index);
        Ok(index)
    }

    fn present(&mut self) -> Result<(), GpuError> {
        let index = self
            .acquired
            .take()
            .ok_or_else(|| GpuError::Present("present without an acquired image".into()))?;
        let state = self.images[index as usize].device_state();
        if state != ResourceState::Present {
            return Err(GpuError::Present(format!(
                "back buffer {} presented while in {:?}",
                index, state
            )));
        }
        if let Some(stats) = self.surfaces.lock().get_mut(&self.surface_id) {
            stats.presents += 1;
        }
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        let outstanding = self
            .images
            .iter()
            .filter(|image| Arc::strong_count(image) > 1)
            .count();
        if outstanding > 0 {
            return Err(GpuError::Swapchain(format!(
                "resize with {} present images still referenced",
                outstanding
            )));
        }
        self.images.clear();
        self.desc.width = width;
        self.desc.height = height;
        self.next = 0;
        self.acquired = None;
        self.create_images();
        if let Some(stats) = self.surfaces.lock().get_mut(&self.surface_id) {
            stats.resizes += 1;
            stats.size = (width, height);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HeadlessSwapchain {
    fn drop(&mut self) {
        self.device.live.swapchains.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct HeadlessComposition {
    surface_id: u64,
    surfaces: Arc<Mutex<HashMap<u64, SurfaceStats>>>,
}

impl CompositionVisual for HeadlessComposition {
    fn set_content(&mut self, _swapchain: &dyn RawSwapchain) -> Result<(), GpuError> {
        if let Some(stats) = self.surfaces.lock().get_mut(&self.surface_id) {
            stats.visual_binds += 1;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), GpuError> {
        if let Some(stats) = self.surfaces.lock().get_mut(&self.surface_id) {
            stats.visual_commits += 1;
        }
        Ok(())
    }
}
