//! Per-window GPU resources
//!
//! A [`WindowResource`] owns everything one native window needs on the GPU:
//! its swapchain, its ring of upload buffers and the fence value of its last
//! submission. Lifecycle:
//!
//! ```text
//! Created -> Active -> ClosePending -> Drained
//! ```
//!
//! A window becomes `Active` after its first successful present, which is
//! when the native window may be shown without a blank flash. Closing is
//! two-phase: the window leaves the active set at once, and a reclaimer
//! entry tagged with the frame being recorded owns every resource until the
//! GPU is past it.

use super::context::GpuContext;
use super::fence::FenceValue;
use super::frame_ring::{FrameRing, RingCapacities};
use super::painter::{FramePainter, FrameSinks, ShapeVertex};
use super::swapchain::SwapchainResource;
use crate::error::GpuError;
use crate::gpu::{Command, CommandList, NativeSurface, ResourceState};
use crate::window::{WindowGeometry, WindowHooks, WindowId, WindowOptions};
use log::{debug, info, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowState {
    /// Resources allocated, nothing presented yet
    Created,
    Active,
    /// Closed by the window system; GPU work may still reference it
    ClosePending,
    /// Resources freed
    Drained,
}

/// Shared view of every window's lifecycle state.
///
/// Each creation under an id gets a new generation. Updates from an older
/// generation (a closed window whose surface id was reused) are dropped, so
/// `state` always describes the newest window with that id.
#[derive(Debug, Clone, Default)]
pub struct WindowLifecycle {
    inner: Arc<Mutex<LifecycleTable>>,
}

#[derive(Debug, Default)]
struct LifecycleTable {
    states: HashMap<WindowId, (u64, WindowState)>,
    next_generation: u64,
}

impl WindowLifecycle {
    pub fn state(&self, id: WindowId) -> Option<WindowState> {
        self.inner.lock().states.get(&id).map(|(_, state)| *state)
    }

    /// Start a new generation for `id` in the `Created` state
    pub(crate) fn register(&self, id: WindowId) -> u64 {
        let mut table = self.inner.lock();
        table.next_generation += 1;
        let generation = table.next_generation;
        table.states.insert(id, (generation, WindowState::Created));
        trace!("{} -> Created (generation {})", id, generation);
        generation
    }

    pub(crate) fn set(&self, id: WindowId, generation: u64, state: WindowState) {
        let mut table = self.inner.lock();
        match table.states.get_mut(&id) {
            Some(entry) if entry.0 == generation => {
                trace!("{} -> {:?}", id, state);
                entry.1 = state;
            }
            _ => trace!("{} generation {} is stale, {:?} not recorded", id, generation, state),
        }
    }

    pub fn count(&self, state: WindowState) -> usize {
        self.inner
            .lock()
            .states
            .values()
            .filter(|(_, s)| *s == state)
            .count()
    }
}

/// Result of asking a window to record a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded { draws: usize },
    /// The ring slot is still in flight until this fence
    Busy(FenceValue),
}

pub struct WindowResource {
    id: WindowId,
    generation: u64,
    ctx: GpuContext,
    geometry: WindowGeometry,
    options: WindowOptions,
    state: WindowState,
    minimized: bool,
    swapchain: SwapchainResource,
    ring: FrameRing,
    last_submitted: FenceValue,
    frames_presented: u64,
    hooks: WindowHooks,
    lifecycle: WindowLifecycle,
}

impl std::fmt::Debug for WindowResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowResource")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("geometry", &self.geometry)
            .field("minimized", &self.minimized)
            .field("last_submitted", &self.last_submitted)
            .finish()
    }
}

impl WindowResource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &GpuContext,
        id: WindowId,
        surface: NativeSurface,
        geometry: WindowGeometry,
        options: WindowOptions,
        hooks: WindowHooks,
        frames_in_flight: usize,
        capacities: RingCapacities,
        lifecycle: WindowLifecycle,
    ) -> Result<Self, GpuError> {
        let swapchain = SwapchainResource::new(
            ctx,
            surface,
            geometry.width,
            geometry.height,
            options.swapchain(),
        )?;
        let ring = FrameRing::new(ctx, &id.to_string(), frames_in_flight, capacities)?;
        let generation = lifecycle.register(id);
        let (width, height) = swapchain.size();
        Ok(Self {
            id,
            generation,
            ctx: ctx.clone(),
            geometry: WindowGeometry { width, height, ..geometry },
            options,
            state: WindowState::Created,
            minimized: false,
            swapchain,
            ring,
            last_submitted: FenceValue::ZERO,
            frames_presented: 0,
            hooks,
            lifecycle,
        })
    }

    pub fn id(&self) -> WindowId {
        self.id
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn geometry(&self) -> WindowGeometry {
        self.geometry
    }

    pub fn options(&self) -> &WindowOptions {
        &self.options
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn set_minimized(&mut self, minimized: bool) {
        if self.minimized != minimized {
            debug!("{} minimized={}", self.id, minimized);
        }
        self.minimized = minimized;
    }

    /// Fence of the last frame submitted for this window
    pub fn last_submitted(&self) -> FenceValue {
        self.last_submitted
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn swapchain(&self) -> &SwapchainResource {
        &self.swapchain
    }

    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    /// Resize to the window system's size; zero extents are kept at 1
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        self.swapchain.resize(width, height)?;
        (self.geometry.width, self.geometry.height) = self.swapchain.size();
        Ok(())
    }

    /// Move and/or resize; only a size change touches the GPU
    pub fn set_geometry(&mut self, geometry: WindowGeometry) -> Result<(), GpuError> {
        if geometry.size() != self.geometry.size() {
            self.swapchain.resize(geometry.width, geometry.height)?;
        }
        let (width, height) = self.swapchain.size();
        self.geometry = WindowGeometry { width, height, ..geometry };
        Ok(())
    }

    /// Sinks of the ring slot being recorded
    pub fn current_frame_buffer(&mut self) -> FrameSinks<'_> {
        let (width, height) = self.swapchain.size();
        self.ring.current_mut().sinks(width, height)
    }

    /// Paint and record this window's pass into `cmd`.
    ///
    /// Returns [`RecordOutcome::Busy`] without touching anything when the
    /// ring slot is still being read by the GPU.
    pub fn record(
        &mut self,
        cmd: &mut CommandList,
        painter: &mut dyn FramePainter,
    ) -> Result<RecordOutcome, GpuError> {
        debug_assert!(matches!(self.state, WindowState::Created | WindowState::Active));
        let completed = self.ctx.clock.completed_value()?;
        let busy_until = self.ring.current_fence();
        if self.ring.begin_frame(completed).is_none() {
            return Ok(RecordOutcome::Busy(busy_until));
        }

        let id = self.id;
        painter.paint(id, &mut self.current_frame_buffer())?;

        self.swapchain.acquire_next()?;
        let slot = self.ring.current();
        let back = self
            .swapchain
            .back_buffer()
            .ok_or_else(|| GpuError::Swapchain(format!("{} has no back buffer", id)))?;
        back.set_state(cmd, ResourceState::RenderTarget);
        cmd.push(Command::BeginPass {
            target: back.raw().clone(),
            clear: Some(self.options.clear_color),
        });
        let draws = slot.draws();
        if !draws.is_empty() {
            // addresses re-read after painting; a grow may have moved them
            cmd.push(Command::SetVertexBuffer {
                buffer: slot.vertices.raw().clone(),
                address: slot.vertices.gpu_address(),
                size: slot.vertices.len(),
                stride: std::mem::size_of::<ShapeVertex>() as u32,
            });
            cmd.push(Command::SetIndexBuffer {
                buffer: slot.indices.raw().clone(),
                address: slot.indices.gpu_address(),
                size: slot.indices.len(),
            });
            cmd.push(Command::SetShapeProperties {
                buffer: slot.properties.raw().clone(),
                address: slot.properties.gpu_address(),
            });
            for call in draws {
                cmd.push(Command::Draw(*call));
            }
        }
        cmd.push(Command::EndPass);
        back.set_state(cmd, ResourceState::Present);
        trace!("{} recorded {} draws", id, draws.len());
        Ok(RecordOutcome::Recorded { draws: draws.len() })
    }

    /// Present the recorded frame, submitted under `fence`
    pub fn present(&mut self, fence: FenceValue) -> Result<(), GpuError> {
        self.swapchain.present()?;
        self.ring.finish_frame(fence);
        self.last_submitted = fence;
        self.frames_presented += 1;
        if self.state == WindowState::Created {
            self.state = WindowState::Active;
            self.lifecycle.set(self.id, self.generation, WindowState::Active);
            info!("🪟 {} presented its first frame", self.id);
            if let Some(hook) = self.hooks.on_first_frame.take() {
                hook(self.id);
            }
        }
        Ok(())
    }

    /// Leave the active set and hand every resource to the reclaimer.
    ///
    /// Returns the fence after which the window's resources are freed and
    /// its `on_destroyed` hook runs.
    pub fn close(mut self) -> FenceValue {
        self.state = WindowState::ClosePending;
        self.lifecycle.set(self.id, self.generation, WindowState::ClosePending);
        let ctx = self.ctx.clone();
        let tag = ctx.clock.pending_value();
        info!("🚪 {} closing, resources freed after {}", self.id, tag);
        ctx.reclaimer.defer(tag, move || self.drain());
        tag
    }

    fn drain(mut self) {
        let (id, generation) = (self.id, self.generation);
        let on_destroyed = self.hooks.on_destroyed.take();
        let lifecycle = self.lifecycle.clone();
        self.state = WindowState::Drained;
        let Self { swapchain, ring, .. } = self;
        swapchain.destroy();
        drop(ring);
        lifecycle.set(id, generation, WindowState::Drained);
        debug!("{} drained", id);
        if let Some(hook) = on_destroyed {
            hook(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;
    use crate::gpu::{HeapKind, Rect};
    use crate::renderer::painter::ClearOnly;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        device: Arc<HeadlessDevice>,
        ctx: GpuContext,
        lifecycle: WindowLifecycle,
    }

    fn fixture() -> Fixture {
        let device = Arc::new(HeadlessDevice::new());
        let ctx = GpuContext::new(device.clone(), [8, 8, 8]).unwrap();
        Fixture {
            device,
            ctx,
            lifecycle: WindowLifecycle::default(),
        }
    }

    fn window(f: &Fixture, id: u64, hooks: WindowHooks) -> WindowResource {
        WindowResource::new(
            &f.ctx,
            WindowId(id),
            NativeSurface::offscreen(id),
            WindowGeometry::new(0, 0, 64, 64),
            WindowOptions::default(),
            hooks,
            2,
            RingCapacities::default(),
            f.lifecycle.clone(),
        )
        .unwrap()
    }

    fn frame(f: &Fixture, window: &mut WindowResource, painter: &mut dyn FramePainter) -> RecordOutcome {
        let mut cmd = CommandList::new("frame");
        let outcome = window.record(&mut cmd, painter).unwrap();
        if let RecordOutcome::Recorded { .. } = outcome {
            f.ctx.device.submit(cmd).unwrap();
            let fence = f.ctx.clock.pending_value();
            window.present(fence).unwrap();
            assert_eq!(f.ctx.clock.signal().unwrap(), fence);
        }
        outcome
    }

    #[test]
    fn test_first_present_activates_and_fires_hook() {
        let f = fixture();
        let shown = Arc::new(AtomicU32::new(0));
        let counter = shown.clone();
        let mut w = window(
            &f,
            1,
            WindowHooks::default().on_first_frame(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(w.state(), WindowState::Created);
        assert_eq!(frame(&f, &mut w, &mut ClearOnly), RecordOutcome::Recorded { draws: 0 });
        assert_eq!(w.state(), WindowState::Active);
        assert_eq!(f.lifecycle.state(WindowId(1)), Some(WindowState::Active));

        f.device.timeline().complete_all();
        frame(&f, &mut w, &mut ClearOnly);
        assert_eq!(shown.load(Ordering::SeqCst), 1, "hook fires once");
        assert_eq!(f.device.surface_stats(1).unwrap().presents, 2);
    }

    #[test]
    fn test_busy_ring_slot_skips_recording() {
        let f = fixture();
        let mut w = window(&f, 2, WindowHooks::default());
        frame(&f, &mut w, &mut ClearOnly);
        frame(&f, &mut w, &mut ClearOnly);
        // slot 0 still waits on fence 1
        assert_eq!(frame(&f, &mut w, &mut ClearOnly), RecordOutcome::Busy(FenceValue(1)));
        f.device.timeline().complete_through(1);
        assert!(matches!(frame(&f, &mut w, &mut ClearOnly), RecordOutcome::Recorded { .. }));
    }

    #[test]
    fn test_painter_draws_reach_the_device() {
        let f = fixture();
        let mut w = window(&f, 3, WindowHooks::default());
        let mut painter = |_: WindowId, sinks: &mut FrameSinks<'_>| -> Result<(), GpuError> {
            sinks.fill_rect(Rect::new(0, 0, 8, 8), [1.0, 0.0, 0.0, 1.0])?;
            sinks.fill_rect(Rect::new(8, 8, 8, 8), [0.0, 1.0, 0.0, 1.0])?;
            Ok(())
        };
        assert_eq!(frame(&f, &mut w, &mut painter), RecordOutcome::Recorded { draws: 2 });
        let submission = f.device.submissions().pop().unwrap();
        assert_eq!(submission.draws, 2);
        assert_eq!(submission.barriers, 2);
    }

    #[test]
    fn test_close_is_two_phase() {
        let f = fixture();
        let destroyed = Arc::new(AtomicU32::new(0));
        let counter = destroyed.clone();
        let mut w = window(
            &f,
            4,
            WindowHooks::default().on_destroyed(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        frame(&f, &mut w, &mut ClearOnly);
        let before = f.device.live_objects();
        assert_eq!(before.swapchains, 1);

        let tag = w.close();
        assert_eq!(tag, FenceValue(2));
        assert_eq!(f.lifecycle.state(WindowId(4)), Some(WindowState::ClosePending));

        f.ctx.clock.signal().unwrap();
        f.device.timeline().complete_through(1);
        f.ctx.reclaim().unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(f.device.live_objects().swapchains, 1);

        f.device.timeline().complete_through(2);
        f.ctx.reclaim().unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(f.lifecycle.state(WindowId(4)), Some(WindowState::Drained));
        let after = f.device.live_objects();
        assert_eq!(after.swapchains, 0);
        assert_eq!(after.buffers, 0);
        assert_eq!(after.images, 0);
        assert_eq!(f.ctx.descriptors.stats(HeapKind::RenderTarget).live, 0);
    }

    #[test]
    fn test_geometry_move_does_not_resize() {
        let f = fixture();
        let mut w = window(&f, 5, WindowHooks::default());
        w.set_geometry(WindowGeometry::new(100, 50, 64, 64)).unwrap();
        assert_eq!(f.device.surface_stats(5).unwrap().resizes, 0);
        w.set_geometry(WindowGeometry::new(100, 50, 80, 64)).unwrap();
        assert_eq!(f.device.surface_stats(5).unwrap().resizes, 1);
        assert_eq!(w.geometry().x, 100);
    }

    #[test]
    fn test_zero_extent_resize_matches_swapchain() {
        let f = fixture();
        let mut w = window(&f, 6, WindowHooks::default());
        w.resize(0, 0).unwrap();
        assert_eq!(w.geometry().size(), (1, 1));
        assert_eq!(w.geometry().size(), w.swapchain().size());
        assert_eq!(w.current_frame_buffer().size(), (1, 1));

        w.set_geometry(WindowGeometry::new(10, 10, 0, 48)).unwrap();
        assert_eq!(w.geometry(), WindowGeometry::new(10, 10, 1, 48));
        assert_eq!(w.swapchain().size(), (1, 48));
    }

    #[test]
    fn test_reused_id_is_not_drained_by_the_closed_window() {
        let f = fixture();
        let mut old = window(&f, 7, WindowHooks::default());
        frame(&f, &mut old, &mut ClearOnly);
        let tag = old.close();
        assert_eq!(f.lifecycle.state(WindowId(7)), Some(WindowState::ClosePending));

        // the window system hands the same surface id to a new window
        let mut reused = window(&f, 7, WindowHooks::default());
        assert_eq!(f.lifecycle.state(WindowId(7)), Some(WindowState::Created));

        f.ctx.clock.signal().unwrap();
        f.device.timeline().complete_through(tag.get());
        f.ctx.reclaim().unwrap();
        assert_eq!(f.lifecycle.state(WindowId(7)), Some(WindowState::Created));
        assert_eq!(f.lifecycle.count(WindowState::Drained), 0);

        f.device.timeline().complete_all();
        frame(&f, &mut reused, &mut ClearOnly);
        assert_eq!(f.lifecycle.state(WindowId(7)), Some(WindowState::Active));
    }
}
