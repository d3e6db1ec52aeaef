//! On-screen presenter (winit + wgpu) for Vitrine
//!
//! This binary runs only when built with the `wgpu-present` feature. It
//! opens borderless, transparent winit windows and forwards their events
//! through the `WindowSystemBridge` to a wgpu-backed render thread. Windows
//! stay hidden until their first frame is presented and are destroyed only
//! once the renderer has released their GPU resources.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vitrine::error::GpuError;
use vitrine::gpu::wgpu_backend::WgpuDevice;
use vitrine::gpu::{NativeSurface, Rect};
use vitrine::renderer::{FrameSinks, RenderThread, Renderer};
use vitrine::window::{WindowGeometry, WindowHooks, WindowId};
use vitrine::VitrineConfig;
use winit::dpi::{LogicalSize, PhysicalPosition};
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoopBuilder};
use winit::window::{Window, WindowBuilder};

/// Presenter CLI
#[derive(Parser, Debug)]
#[command(name = "run_present_winit")]
#[command(about = "Present borderless Vitrine windows with winit + wgpu")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/vitrine/vitrine.toml")]
    config: String,

    /// GPU backend: auto|vulkan|metal|dx12|gl
    #[arg(long, default_value = "auto")]
    backend: String,

    /// Number of windows to open
    #[arg(short, long, default_value_t = 2)]
    windows: u32,

    /// Use opaque windows with native decorations
    #[arg(long, default_value_t = false)]
    opaque: bool,

    /// Frames per second to animate at
    #[arg(long, default_value_t = 60)]
    fps: u32,
}

/// Events the render thread sends back to the event loop
#[derive(Debug)]
enum PresenterEvent {
    /// GPU resources are gone; the native window may be destroyed
    Destroyed(WindowId),
}

fn backends_from_str(s: &str) -> wgpu::Backends {
    match s.to_lowercase().as_str() {
        "vulkan" => wgpu::Backends::VULKAN,
        "metal" => wgpu::Backends::METAL,
        "dx12" => wgpu::Backends::DX12,
        "gl" => wgpu::Backends::GL,
        _ => wgpu::Backends::all(),
    }
}

/// Title bar plus a panel sweeping across the window
fn demo_painter() -> impl FnMut(WindowId, &mut FrameSinks<'_>) -> Result<(), GpuError> + Send {
    let started = Instant::now();
    move |id, sinks| {
        let (width, height) = sinks.size();
        let t = started.elapsed().as_secs_f32() + id.0 as f32;
        let bar = height.min(32);
        sinks.fill_rect(Rect::new(0, 0, width, bar), [0.10, 0.10, 0.12, 0.95])?;
        let body = height.saturating_sub(bar);
        if body > 0 {
            sinks.fill_rect(Rect::new(0, bar, width, body), [0.02, 0.02, 0.03, 0.6])?;
            let panel = (width / 4).max(1);
            let travel = width.saturating_sub(panel) as f32;
            let x = ((t.sin() * 0.5 + 0.5) * travel) as u32;
            let alpha = 0.8;
            sinks.fill_rect(
                Rect::new(x, bar, panel, body),
                [0.25 * alpha, 0.45 * alpha, 0.9 * alpha, alpha],
            )?;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    info!("🎛️ Presenter backend: {}", cli.backend);

    let config = VitrineConfig::load(&cli.config).unwrap_or_else(|e| {
        warn!("📝 Using default configuration ({:#})", e);
        VitrineConfig::default()
    });

    let event_loop = EventLoopBuilder::<PresenterEvent>::with_user_event().build()?;
    let proxy = event_loop.create_proxy();

    let device = WgpuDevice::new_blocking(backends_from_str(&cli.backend))
        .context("Failed to create wgpu device")?;
    let (renderer, bridge) = Renderer::create(Arc::new(device), &config, Box::new(demo_painter()))?;
    let render_thread = RenderThread::spawn(renderer)?;

    let mut options = bridge.defaults();
    if cli.opaque {
        options.transparent = false;
        options.borderless = false;
        options.clear_color = [0.1, 0.1, 0.12, 1.0];
    }

    // winit id -> (vitrine id, window); closed windows stay here until destroyed
    let mut windows: HashMap<winit::window::WindowId, (WindowId, Arc<Window>)> = HashMap::new();
    let mut open = 0u32;
    for index in 0..cli.windows {
        let window = Arc::new(
            WindowBuilder::new()
                .with_title(format!("Vitrine {}", index + 1))
                .with_decorations(!options.borderless)
                .with_transparent(options.transparent)
                .with_visible(false)
                .with_inner_size(LogicalSize::new(480.0, 320.0))
                .build(&event_loop)?,
        );
        let size = window.inner_size();
        let position = window.outer_position().unwrap_or(PhysicalPosition::new(0, 0));
        let geometry = WindowGeometry::new(position.x, position.y, size.width, size.height);

        let shown = window.clone();
        let proxy = proxy.clone();
        let hooks = WindowHooks::default()
            .on_first_frame(move |id| {
                info!("✅ {} has content, showing it", id);
                shown.set_visible(true);
            })
            .on_destroyed(move |id| {
                if proxy.send_event(PresenterEvent::Destroyed(id)).is_err() {
                    warn!("event loop gone before {} was destroyed", id);
                }
            });

        let surface = NativeSurface::from_window(index as u64 + 1, window.clone());
        let id = bridge.create_window(surface, geometry, options, hooks)?;
        windows.insert(window.id(), (id, window));
        open += 1;
    }

    let frame_interval = Duration::from_secs_f64(1.0 / cli.fps.max(1) as f64);
    event_loop.run(|event, elwt| match event {
        Event::WindowEvent { window_id, event } => {
            let Some((id, window)) = windows.get(&window_id) else {
                return;
            };
            let id = *id;
            let result = match event {
                WindowEvent::CloseRequested => {
                    open = open.saturating_sub(1);
                    bridge.on_window_closed(id)
                }
                WindowEvent::Resized(size) => bridge.on_window_resized(id, size.width, size.height),
                WindowEvent::Moved(position) => {
                    let size = window.inner_size();
                    bridge.on_window_geometry_changed(id, position.x, position.y, size.width, size.height)
                }
                WindowEvent::Occluded(occluded) => bridge.on_window_minimized_changed(id, occluded),
                WindowEvent::RedrawRequested => {
                    bridge.request_render();
                    Ok(())
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                error!("render thread is gone: {}", e);
                elwt.exit();
            }
        }
        Event::UserEvent(PresenterEvent::Destroyed(id)) => {
            windows.retain(|_, (window_id, _)| *window_id != id);
            info!("🗑️ {} destroyed, {} native windows left", id, windows.len());
            if windows.is_empty() {
                elwt.exit();
            }
        }
        Event::AboutToWait => {
            if open > 0 {
                bridge.request_render();
                elwt.set_control_flow(ControlFlow::WaitUntil(Instant::now() + frame_interval));
            }
        }
        _ => {}
    })?;

    let stats = render_thread.shutdown()?;
    info!("✅ Presenter finished: {:?}", stats);
    Ok(())
}
