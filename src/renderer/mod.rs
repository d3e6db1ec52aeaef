//! Per-window GPU frame resources and the render loop driving them
//!
//! The [`Renderer`] lives on a single render thread. Each wake it drains the
//! window message queue, records every visible window into one command
//! list, submits, presents, advances the fence clock and frees whatever the
//! GPU has finished with. Nothing here waits on the GPU except swapchain
//! resizes and shutdown.

pub mod buffer;
pub mod context;
pub mod descriptors;
pub mod fence;
pub mod frame_ring;
pub mod image;
pub mod messages;
pub mod painter;
pub mod reclaim;
pub mod swapchain;
pub mod window_resource;

pub use context::GpuContext;
pub use fence::{FenceClock, FenceValue};
pub use frame_ring::{RingCapacities, FRAMES_IN_FLIGHT};
pub use messages::{RenderSignal, Wake, WindowMessage};
pub use painter::{ClearOnly, FramePainter, FrameSinks, ShapeProperties, ShapeVertex};
pub use reclaim::{DeferredReclaimer, Readiness};
pub use window_resource::{RecordOutcome, WindowLifecycle, WindowResource, WindowState};

use crate::config::VitrineConfig;
use crate::error::{fatal, GpuError};
use crate::gpu::{Command, CommandList, GpuDevice};
use crate::window::{WindowId, WindowOptions, WindowSystemBridge};
use anyhow::Context;
use log::{debug, info, trace, warn};
use messages::{window_channel, WindowEventReceiver};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Renderer construction parameters
#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub frames_in_flight: usize,
    pub capacities: RingCapacities,
    /// Initial slots per heap kind, by `HeapKind::index`
    pub descriptor_capacities: [u32; 3],
    pub message_queue_capacity: usize,
    pub window_defaults: WindowOptions,
}

impl From<&VitrineConfig> for RendererSettings {
    fn from(config: &VitrineConfig) -> Self {
        Self {
            frames_in_flight: config.renderer.frames_in_flight,
            capacities: RingCapacities {
                vertices: config.renderer.vertex_capacity,
                indices: config.renderer.index_capacity,
                properties: config.renderer.property_capacity,
            },
            descriptor_capacities: config.descriptors.capacities(),
            message_queue_capacity: config.renderer.message_queue_capacity,
            window_defaults: WindowOptions::from(&config.window),
        }
    }
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self::from(&VitrineConfig::default())
    }
}

/// Running totals since the renderer started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RendererStats {
    /// Iterations that ran
    pub frames: u64,
    pub submissions: u64,
    pub presents: u64,
    pub draws: u64,
    pub minimized_skips: u64,
    /// Windows skipped because their ring slot was still in flight
    pub busy_skips: u64,
    pub windows_created: u64,
    pub windows_closed: u64,
    pub resizes: u64,
    pub reclaimed: u64,
}

/// What one iteration did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// Fence signaled this iteration, if any
    pub fence: Option<FenceValue>,
    pub presented: usize,
    pub draws: usize,
    pub minimized: usize,
    pub busy: usize,
    pub reclaimed: usize,
}

pub struct Renderer {
    ctx: GpuContext,
    settings: RendererSettings,
    windows: BTreeMap<WindowId, WindowResource>,
    receiver: WindowEventReceiver,
    signal: Arc<RenderSignal>,
    painter: Box<dyn FramePainter>,
    lifecycle: WindowLifecycle,
    /// Highest fence a busy-slot wake-up is registered for
    armed_wake: FenceValue,
    stats: RendererStats,
    shared_stats: Arc<Mutex<RendererStats>>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("adapter", &self.ctx.device.adapter_name())
            .field("windows", &self.windows.keys().collect::<Vec<_>>())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Renderer {
    /// Renderer plus the bridge the window system talks to it through
    pub fn new(
        device: Arc<dyn GpuDevice>,
        settings: RendererSettings,
        painter: Box<dyn FramePainter>,
    ) -> Result<(Self, WindowSystemBridge), GpuError> {
        info!("🎨 Creating renderer on {}", device.adapter_name());
        let ctx = GpuContext::new(device, settings.descriptor_capacities)?;
        let (sender, receiver) = window_channel(settings.message_queue_capacity);
        let signal = Arc::new(RenderSignal::new());
        let bridge = WindowSystemBridge::new(sender, signal.clone(), settings.window_defaults);
        debug!("renderer settings: {:?}", settings);
        Ok((
            Self {
                ctx,
                settings,
                windows: BTreeMap::new(),
                receiver,
                signal,
                painter,
                lifecycle: WindowLifecycle::default(),
                armed_wake: FenceValue::ZERO,
                stats: RendererStats::default(),
                shared_stats: Arc::new(Mutex::new(RendererStats::default())),
            },
            bridge,
        ))
    }

    pub fn create(
        device: Arc<dyn GpuDevice>,
        config: &VitrineConfig,
        painter: Box<dyn FramePainter>,
    ) -> Result<(Self, WindowSystemBridge), GpuError> {
        Self::new(device, RendererSettings::from(config), painter)
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    pub fn stats(&self) -> RendererStats {
        self.stats
    }

    pub fn lifecycle(&self) -> &WindowLifecycle {
        &self.lifecycle
    }

    pub fn window(&self, id: WindowId) -> Option<&WindowResource> {
        self.windows.get(&id)
    }

    /// Windows in the active set, in id order
    pub fn window_ids(&self) -> Vec<WindowId> {
        self.windows.keys().copied().collect()
    }

    /// Handle for other threads to queue their own fence-gated cleanup
    pub fn reclaimer(&self) -> DeferredReclaimer {
        self.ctx.reclaimer.clone()
    }

    /// Run `cleanup` once `readiness` holds
    pub fn add_deferred_cleanup(
        &self,
        readiness: impl Into<Readiness>,
        cleanup: impl FnOnce() + Send + 'static,
    ) {
        self.ctx.reclaimer.defer(readiness, cleanup);
    }

    pub fn request_render(&self) {
        self.signal.request();
    }

    pub fn signal(&self) -> &Arc<RenderSignal> {
        &self.signal
    }

    /// Apply one window-system notification
    pub fn apply(&mut self, message: WindowMessage) -> Result<(), GpuError> {
        trace!("applying {:?}", message);
        match message {
            WindowMessage::Created {
                id,
                surface,
                geometry,
                options,
                hooks,
            } => {
                if self.windows.contains_key(&id) {
                    warn!("{} created twice, ignoring", id);
                    return Ok(());
                }
                let window = WindowResource::new(
                    &self.ctx,
                    id,
                    surface,
                    geometry,
                    options,
                    hooks,
                    self.settings.frames_in_flight,
                    self.settings.capacities,
                    self.lifecycle.clone(),
                )?;
                info!(
                    "🪟 {} created {}x{}{}",
                    id,
                    geometry.width,
                    geometry.height,
                    if options.transparent { " (transparent)" } else { "" }
                );
                self.windows.insert(id, window);
                self.stats.windows_created += 1;
            }
            WindowMessage::Closed(id) => match self.windows.remove(&id) {
                Some(window) => {
                    window.close();
                    self.stats.windows_closed += 1;
                }
                None => debug!("close for unknown {}", id),
            },
            WindowMessage::Resized { id, width, height } => {
                if let Some(window) = self.windows.get_mut(&id) {
                    window.resize(width, height)?;
                    self.stats.resizes += 1;
                }
            }
            WindowMessage::MinimizedChanged { id, minimized } => {
                if let Some(window) = self.windows.get_mut(&id) {
                    window.set_minimized(minimized);
                }
            }
            WindowMessage::GeometryChanged { id, geometry } => {
                if let Some(window) = self.windows.get_mut(&id) {
                    let resized = window.geometry().size() != geometry.size();
                    window.set_geometry(geometry)?;
                    if resized {
                        self.stats.resizes += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn drain_messages(&mut self) -> Result<usize, GpuError> {
        let messages: Vec<WindowMessage> = self.receiver.drain().collect();
        let count = messages.len();
        for message in messages {
            self.apply(message)?;
        }
        Ok(count)
    }

    /// One pass of the render loop: messages, record, submit, present,
    /// signal, reclaim
    pub fn run_iteration(&mut self) -> Result<FrameReport, GpuError> {
        let applied = self.drain_messages()?;
        let mut report = FrameReport::default();

        let mut cmd = CommandList::new("frame");
        cmd.push(Command::BindDescriptorHeaps {
            heaps: self.ctx.descriptors.shader_visible_heaps(),
        });
        let mut recorded = Vec::new();
        for (id, window) in self.windows.iter_mut() {
            if window.is_minimized() {
                report.minimized += 1;
                continue;
            }
            match window.record(&mut cmd, self.painter.as_mut())? {
                RecordOutcome::Recorded { draws } => {
                    report.draws += draws;
                    recorded.push(*id);
                }
                RecordOutcome::Busy(fence) => {
                    report.busy += 1;
                    if fence > self.armed_wake {
                        self.armed_wake = fence;
                        let signal = self.signal.clone();
                        self.ctx.clock.on_reached(fence, move || signal.request());
                    }
                }
            }
        }

        if !recorded.is_empty() {
            let fence = self.ctx.clock.pending_value();
            self.ctx.device.submit(cmd.take())?;
            for id in &recorded {
                if let Some(window) = self.windows.get_mut(id) {
                    window.present(fence)?;
                }
            }
            let signaled = self.ctx.clock.signal()?;
            debug_assert_eq!(signaled, fence);
            report.fence = Some(signaled);
            report.presented = recorded.len();
            self.stats.submissions += 1;
        } else if !self.ctx.reclaimer.is_empty() {
            // nothing drawn, but retired resources still need a fence to pass
            report.fence = Some(self.ctx.clock.signal()?);
        }

        report.reclaimed = self.ctx.reclaim()?;

        self.stats.frames += 1;
        self.stats.presents += report.presented as u64;
        self.stats.draws += report.draws as u64;
        self.stats.minimized_skips += report.minimized as u64;
        self.stats.busy_skips += report.busy as u64;
        self.stats.reclaimed += report.reclaimed as u64;
        *self.shared_stats.lock() = self.stats;
        trace!(
            "iteration: {} messages, {:?}, {} windows live",
            applied,
            report,
            self.windows.len()
        );
        Ok(report)
    }

    /// Drain every window and free everything; blocks until the GPU is idle
    pub fn shutdown(&mut self) -> Result<RendererStats, GpuError> {
        info!("🛑 Renderer shutting down, draining {} windows", self.windows.len());
        self.drain_messages()?;
        for window in self.windows.values() {
            self.ctx.clock.wait_until(window.last_submitted())?;
        }
        for (_, window) in std::mem::take(&mut self.windows) {
            window.close();
            self.stats.windows_closed += 1;
        }
        self.ctx.clock.wait_idle()?;
        self.stats.reclaimed += self.ctx.reclaimer.drain_all() as u64;
        *self.shared_stats.lock() = self.stats;
        info!("✅ Renderer drained: {:?}", self.stats);
        Ok(self.stats)
    }

    /// Render loop; returns after shutdown is signaled.
    ///
    /// GPU failures are unrecoverable and abort the process.
    pub fn run(mut self) -> RendererStats {
        info!("🖥️ Render loop started");
        loop {
            match self.signal.wait() {
                Wake::Shutdown => break,
                Wake::Render(requests) => {
                    trace!("woke for {} render requests", requests);
                    if let Err(e) = self.run_iteration() {
                        fatal("rendering a frame", &e);
                    }
                }
            }
        }
        match self.shutdown() {
            Ok(stats) => stats,
            Err(e) => fatal("shutting down the renderer", &e),
        }
    }
}

/// A [`Renderer`] running on its own thread
#[derive(Debug)]
pub struct RenderThread {
    signal: Arc<RenderSignal>,
    stats: Arc<Mutex<RendererStats>>,
    handle: Option<JoinHandle<RendererStats>>,
}

impl RenderThread {
    pub fn spawn(renderer: Renderer) -> anyhow::Result<Self> {
        let signal = renderer.signal.clone();
        let stats = renderer.shared_stats.clone();
        let handle = std::thread::Builder::new()
            .name("vitrine-render".to_string())
            .spawn(move || renderer.run())
            .context("Failed to spawn render thread")?;
        Ok(Self {
            signal,
            stats,
            handle: Some(handle),
        })
    }

    /// Stats as of the last finished iteration
    pub fn stats(&self) -> RendererStats {
        *self.stats.lock()
    }

    pub fn request_render(&self) {
        self.signal.request();
    }

    /// Stop the loop, drain every window and join the thread
    pub fn shutdown(mut self) -> anyhow::Result<RendererStats> {
        self.signal.shutdown();
        let handle = self
            .handle
            .take()
            .context("Render thread already joined")?;
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("Render thread panicked"))
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.signal.shutdown();
            if handle.join().is_err() {
                warn!("Render thread panicked during shutdown");
            }
        }
    }
}
