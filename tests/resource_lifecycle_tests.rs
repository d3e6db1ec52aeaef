// Resource lifecycle integration tests for Vitrine
//
// Drives the renderer through the window-system bridge against the headless
// device, advancing the GPU timeline by hand to check when resources are
// (and are not) freed.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use vitrine::error::GpuError;
use vitrine::gpu::headless::HeadlessDevice;
use vitrine::gpu::{HeapKind, NativeSurface, Rect};
use vitrine::renderer::{
    ClearOnly, FenceValue, FramePainter, FrameSinks, RendererSettings, RingCapacities, WindowState,
};
use vitrine::window::{WindowGeometry, WindowHooks, WindowId, WindowSystemBridge};
use vitrine::Renderer;

fn settings(vertices: u64) -> RendererSettings {
    RendererSettings {
        capacities: RingCapacities {
            vertices,
            indices: 1024,
            properties: 1024,
        },
        ..Default::default()
    }
}

fn setup(
    settings: RendererSettings,
    painter: impl FramePainter + 'static,
) -> (Arc<HeadlessDevice>, Renderer, WindowSystemBridge) {
    let device = Arc::new(HeadlessDevice::new());
    let (renderer, bridge) = Renderer::new(device.clone(), settings, Box::new(painter)).unwrap();
    (device, renderer, bridge)
}

fn open(bridge: &WindowSystemBridge, id: u64, width: u32, height: u32) -> WindowId {
    bridge
        .on_window_created(NativeSurface::offscreen(id), WindowGeometry::new(0, 0, width, height))
        .unwrap()
}

#[test]
fn test_two_window_scenario() {
    let a = WindowId(1);
    let painter = move |id: WindowId, sinks: &mut FrameSinks<'_>| -> Result<(), GpuError> {
        if id == a {
            // raw upload bigger than the initial 1024-byte vertex buffer
            sinks.vertices().append(&[0xab; 2000])?;
        } else {
            sinks.fill_rect(Rect::new(10, 10, 100, 100), [1.0, 1.0, 1.0, 1.0])?;
        }
        Ok(())
    };
    let (device, mut renderer, bridge) = setup(settings(1024), painter);
    let destroyed = Arc::new(AtomicU32::new(0));
    let counter = destroyed.clone();
    bridge
        .create_window(
            NativeSurface::offscreen(1),
            WindowGeometry::new(0, 0, 200, 200),
            bridge.defaults(),
            WindowHooks::default().on_destroyed(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    let b = open(&bridge, 2, 500, 500);

    // Frame 1: A's vertex buffer grows once, preserving its bytes
    let report = renderer.run_iteration().unwrap();
    assert_eq!(report.fence, Some(FenceValue(1)));
    assert_eq!(report.presented, 2);
    let slot = &renderer.window(a).unwrap().ring().slots()[0];
    assert_eq!(slot.vertices.grow_count(), 1);
    assert_eq!(slot.vertices.capacity(), 2048);
    assert_eq!(slot.vertices.len(), 2000);
    assert!(slot.vertices.bytes().unwrap()[..2000].iter().all(|b| *b == 0xab));
    assert_eq!(renderer.window(b).unwrap().ring().slots()[0].vertices.grow_count(), 0);

    // Frame 2
    assert_eq!(renderer.run_iteration().unwrap().fence, Some(FenceValue(2)));
    device.timeline().complete_through(2);

    // Close A: frame 3 no longer includes it
    bridge.on_window_closed(a).unwrap();
    let report = renderer.run_iteration().unwrap();
    assert_eq!(report.fence, Some(FenceValue(3)));
    assert_eq!(report.presented, 1);
    assert_eq!(renderer.window_ids(), vec![b]);
    assert_eq!(device.submissions()[2].draws, 1);
    assert_eq!(device.surface_stats(1).unwrap().presents, 2);
    assert_eq!(device.surface_stats(2).unwrap().presents, 3);

    // ...and frees it only after frame 3's fence
    assert_eq!(renderer.lifecycle().state(a), Some(WindowState::ClosePending));
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    assert_eq!(device.live_objects().swapchains, 2);

    device.timeline().complete_through(3);
    renderer.context().reclaim().unwrap();
    assert_eq!(renderer.lifecycle().state(a), Some(WindowState::Drained));
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(device.live_objects().swapchains, 1);
    assert_eq!(renderer.lifecycle().state(b), Some(WindowState::Active));
}

#[test]
fn test_first_frame_hook_waits_for_present() {
    let (device, mut renderer, bridge) = setup(RendererSettings::default(), ClearOnly);
    let shown = Arc::new(Mutex::new(Vec::new()));
    let log = shown.clone();
    bridge
        .create_window(
            NativeSurface::offscreen(5),
            WindowGeometry::new(0, 0, 300, 200),
            bridge.defaults(),
            WindowHooks::default().on_first_frame(move |id| log.lock().push(id)),
        )
        .unwrap();
    bridge.on_window_minimized_changed(WindowId(5), true).unwrap();

    renderer.run_iteration().unwrap();
    assert!(shown.lock().is_empty(), "nothing presented while minimized");
    assert_eq!(renderer.lifecycle().state(WindowId(5)), Some(WindowState::Created));

    bridge.on_window_minimized_changed(WindowId(5), false).unwrap();
    renderer.run_iteration().unwrap();
    assert_eq!(*shown.lock(), vec![WindowId(5)]);
    assert_eq!(device.surface_stats(5).unwrap().presents, 1);
}

#[test]
fn test_minimized_window_records_nothing() {
    let (device, mut renderer, bridge) = setup(RendererSettings::default(), ClearOnly);
    let a = open(&bridge, 1, 100, 100);
    let b = open(&bridge, 2, 100, 100);
    bridge.on_window_minimized_changed(a, true).unwrap();

    for _ in 0..2 {
        let report = renderer.run_iteration().unwrap();
        assert_eq!(report.minimized, 1);
        assert_eq!(report.presented, 1);
        device.timeline().complete_all();
    }
    assert!(device.surface_stats(1).unwrap().presents == 0);
    assert_eq!(device.surface_stats(2).unwrap().presents, 2);
    assert_eq!(renderer.stats().minimized_skips, 2);
    assert!(renderer.window(b).unwrap().last_submitted() > FenceValue::ZERO);
    assert_eq!(renderer.window(a).unwrap().last_submitted(), FenceValue::ZERO);
}

#[test]
fn test_busy_window_is_skipped_not_waited_for() {
    let (device, mut renderer, bridge) = setup(RendererSettings::default(), ClearOnly);
    open(&bridge, 1, 64, 64);
    renderer.run_iteration().unwrap();
    renderer.run_iteration().unwrap();

    // the GPU has finished nothing: both ring slots are in flight
    let report = renderer.run_iteration().unwrap();
    assert_eq!(report.busy, 1);
    assert_eq!(report.presented, 0);
    assert_eq!(device.submissions().len(), 2);

    device.timeline().complete_through(1);
    let report = renderer.run_iteration().unwrap();
    assert_eq!(report.presented, 1);
    assert_eq!(report.fence, Some(FenceValue(3)));
}

#[test]
fn test_close_of_never_presented_window() {
    let (device, mut renderer, bridge) = setup(RendererSettings::default(), ClearOnly);
    let id = open(&bridge, 1, 64, 64);
    bridge.on_window_closed(id).unwrap();

    // nothing to draw, but the close still gets a fence to wait on
    let report = renderer.run_iteration().unwrap();
    assert_eq!(report.presented, 0);
    assert_eq!(report.fence, Some(FenceValue(1)));
    assert_eq!(device.live_objects().swapchains, 1);

    device.timeline().complete_all();
    renderer.run_iteration().unwrap();
    assert_eq!(renderer.lifecycle().state(id), Some(WindowState::Drained));
    assert_eq!(device.live_objects().swapchains, 0);
}

#[test]
fn test_surface_id_reused_before_old_window_drains() {
    let (device, mut renderer, bridge) = setup(RendererSettings::default(), ClearOnly);
    let id = open(&bridge, 1, 64, 64);
    renderer.run_iteration().unwrap();

    let destroyed = Arc::new(AtomicU32::new(0));
    let counter = destroyed.clone();
    bridge.on_window_closed(id).unwrap();
    bridge
        .create_window(
            NativeSurface::offscreen(1),
            WindowGeometry::new(0, 0, 64, 64),
            bridge.defaults(),
            WindowHooks::default().on_destroyed(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    let report = renderer.run_iteration().unwrap();
    assert_eq!(report.fence, Some(FenceValue(2)));
    assert_eq!(renderer.lifecycle().state(id), Some(WindowState::Active));

    // the old window drains; the new one keeps its state and its hook
    device.timeline().complete_through(2);
    renderer.context().reclaim().unwrap();
    assert_eq!(renderer.lifecycle().state(id), Some(WindowState::Active));
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    assert_eq!(renderer.window_ids(), vec![id]);
    assert_eq!(device.live_objects().swapchains, 1);
}

#[test]
fn test_resize_keeps_window_rendering() {
    let (device, mut renderer, bridge) = setup(RendererSettings::default(), ClearOnly);
    let id = open(&bridge, 1, 200, 200);
    renderer.run_iteration().unwrap();
    device.timeline().complete_all();

    bridge.on_window_resized(id, 640, 480).unwrap();
    bridge.on_window_geometry_changed(id, 10, 20, 640, 480).unwrap();
    renderer.run_iteration().unwrap();

    let stats = device.surface_stats(1).unwrap();
    assert_eq!(stats.size, (640, 480));
    assert_eq!(stats.resizes, 1, "same-size geometry change is a move");
    assert_eq!(stats.presents, 2);
    assert_eq!(renderer.window(id).unwrap().geometry(), WindowGeometry::new(10, 20, 640, 480));
}

#[test]
fn test_descriptor_heap_growth_under_window_churn() {
    let settings = RendererSettings {
        // two back buffers per window: the third window overflows the heap
        descriptor_capacities: {
            let mut capacities = RendererSettings::default().descriptor_capacities;
            capacities[HeapKind::RenderTarget.index()] = 4;
            capacities
        },
        ..Default::default()
    };
    let (device, mut renderer, bridge) = setup(settings, ClearOnly);
    open(&bridge, 1, 64, 64);
    open(&bridge, 2, 64, 64);
    renderer.run_iteration().unwrap();
    let heaps_before = device.live_objects().heaps;

    open(&bridge, 3, 64, 64);
    renderer.run_iteration().unwrap();
    let stats = renderer.context().descriptors.stats(HeapKind::RenderTarget);
    assert_eq!(stats.growths, 1);
    assert_eq!(stats.capacity, 8);
    assert_eq!(stats.live, 6);
    // the old heap lives until frame 2 has completed
    assert_eq!(device.live_objects().heaps, heaps_before + 1);

    device.timeline().complete_all();
    renderer.context().reclaim().unwrap();
    assert_eq!(device.live_objects().heaps, heaps_before);
}

#[test]
fn test_shutdown_leaves_nothing_behind() {
    let device = Arc::new(HeadlessDevice::auto_complete());
    let painter = |_: WindowId, sinks: &mut FrameSinks<'_>| -> Result<(), GpuError> {
        for i in 0..200 {
            sinks.fill_rect(Rect::new(i % 50, i % 40, 8, 8), [0.5, 0.5, 0.5, 1.0])?;
        }
        Ok(())
    };
    let (mut renderer, bridge) = Renderer::new(device.clone(), settings(256), Box::new(painter)).unwrap();
    for id in 1..=3 {
        open(&bridge, id, 128, 128);
    }
    for _ in 0..5 {
        renderer.run_iteration().unwrap();
    }
    bridge.on_window_resized(WindowId(2), 32, 32).unwrap();
    bridge.on_window_closed(WindowId(3)).unwrap();

    let stats = renderer.shutdown().unwrap();
    assert_eq!(stats.windows_created, 3);
    assert_eq!(stats.windows_closed, 3);
    let live = device.live_objects();
    assert_eq!((live.buffers, live.images, live.swapchains), (0, 0, 0));
    assert!(renderer.context().reclaimer.is_empty());
}
