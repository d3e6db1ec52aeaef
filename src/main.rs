//! # Vitrine soak runner
//!
//! Drives the renderer against the headless device with a simulated window
//! system: windows open, resize, minimize, move and close at random while
//! frames are recorded, then everything is drained and the totals printed.
//! A leak shows up as non-zero live objects at the end.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vitrine::error::GpuError;
use vitrine::gpu::headless::HeadlessDevice;
use vitrine::gpu::wgpu_backend::WgpuDevice;
use vitrine::gpu::{GpuDevice, NativeSurface, Rect};
use vitrine::renderer::{FrameSinks, RenderThread, Renderer};
use vitrine::window::{WindowGeometry, WindowId, WindowSystemBridge};
use vitrine::VitrineConfig;

#[derive(Parser)]
#[command(name = "vitrine")]
#[command(about = "Headless soak run of the Vitrine window renderer")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/vitrine/vitrine.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Windows open at the start
    #[arg(short, long, default_value_t = 4)]
    windows: usize,

    /// Frames to request
    #[arg(short, long, default_value_t = 600)]
    frames: u64,

    /// Chance per frame of a window event (resize, minimize, move, close)
    #[arg(long, default_value_t = 0.05)]
    churn: f64,

    /// Shapes painted per window per frame, at most
    #[arg(long, default_value_t = 64)]
    shapes: u32,

    /// RNG seed for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// Run the renderer on its own thread instead of stepping it inline
    #[arg(long)]
    threaded: bool,

    /// Pause between frames in threaded mode (milliseconds)
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Only open the wgpu adapter, print its name and exit
    #[arg(long)]
    probe_gpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting Vitrine soak run");
    info!(
        "📄 Version: {} ({} {}, built {})",
        vitrine::VERSION,
        option_env!("VITRINE_GIT_COMMIT").unwrap_or("unknown commit"),
        env!("VITRINE_TARGET"),
        env!("VITRINE_BUILD_DATE")
    );

    if cli.probe_gpu {
        let device = WgpuDevice::new_blocking(wgpu::Backends::all()).context("Failed to open a GPU adapter")?;
        println!("{}", device.adapter_name());
        return Ok(());
    }

    // Load configuration
    let mut config = match VitrineConfig::load(&cli.config) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            error!("❌ Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
            VitrineConfig::default()
        }
    };
    if config.renderer.backend != "headless" {
        warn!(
            "backend '{}' needs real windows (see run_present_winit); soaking on headless",
            config.renderer.backend
        );
        config.renderer.backend = "headless".to_string();
    }

    let seed = cli.seed.unwrap_or_else(rand::random);
    info!("🎲 Seed: {}", seed);
    let device = Arc::new(HeadlessDevice::auto_complete());
    let painter = shape_painter(StdRng::seed_from_u64(seed ^ 0x5eed), cli.shapes);
    let (renderer, bridge) = Renderer::create(device.clone(), &config, Box::new(painter))?;

    let mut session = Session {
        bridge,
        rng: StdRng::seed_from_u64(seed),
        open: BTreeSet::new(),
        minimized: BTreeSet::new(),
        next_id: 1,
    };
    for _ in 0..cli.windows {
        session.open_window()?;
    }

    let started = Instant::now();
    let stats = if cli.threaded {
        let thread = RenderThread::spawn(renderer)?;
        for _ in 0..cli.frames {
            session.churn(cli.churn)?;
            session.bridge.request_render();
            if cli.interval_ms > 0 {
                std::thread::sleep(Duration::from_millis(cli.interval_ms));
            }
        }
        session.close_all()?;
        thread.shutdown()?
    } else {
        let mut renderer = renderer;
        for _ in 0..cli.frames {
            session.churn(cli.churn)?;
            renderer.run_iteration()?;
        }
        session.close_all()?;
        renderer.shutdown()?
    };
    let elapsed = started.elapsed();

    let live = device.live_objects();
    println!("frames:           {}", stats.frames);
    println!("submissions:      {}", stats.submissions);
    println!("presents:         {}", stats.presents);
    println!("draws:            {}", stats.draws);
    println!("windows created:  {}", stats.windows_created);
    println!("windows closed:   {}", stats.windows_closed);
    println!("resizes:          {}", stats.resizes);
    println!("minimized skips:  {}", stats.minimized_skips);
    println!("busy skips:       {}", stats.busy_skips);
    println!("reclaimed:        {}", stats.reclaimed);
    println!("elapsed:          {:.2?}", elapsed);
    println!(
        "live after drain: {} buffers, {} images, {} swapchains",
        live.buffers, live.images, live.swapchains
    );
    if live.buffers + live.images + live.swapchains > 0 {
        anyhow::bail!("GPU objects leaked: {:?}", live);
    }
    Ok(())
}

/// Simulated window system
struct Session {
    bridge: WindowSystemBridge,
    rng: StdRng,
    open: BTreeSet<WindowId>,
    minimized: BTreeSet<WindowId>,
    next_id: u64,
}

impl Session {
    fn open_window(&mut self) -> Result<()> {
        let (width, height) = (self.rng.gen_range(120..1280), self.rng.gen_range(90..900));
        let geometry = WindowGeometry::new(self.rng.gen_range(0..800), self.rng.gen_range(0..600), width, height);
        let id = self
            .bridge
            .on_window_created(NativeSurface::offscreen(self.next_id), geometry)?;
        self.next_id += 1;
        self.open.insert(id);
        Ok(())
    }

    fn pick(&mut self) -> Option<WindowId> {
        if self.open.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..self.open.len());
        self.open.iter().nth(index).copied()
    }

    fn churn(&mut self, chance: f64) -> Result<()> {
        if !self.rng.gen_bool(chance.clamp(0.0, 1.0)) {
            return Ok(());
        }
        let Some(id) = self.pick() else {
            return self.open_window();
        };
        match self.rng.gen_range(0..5) {
            0 => {
                let (w, h) = (self.rng.gen_range(1..1600), self.rng.gen_range(1..1200));
                self.bridge.on_window_resized(id, w, h)?;
            }
            1 => {
                let minimized = !self.minimized.remove(&id);
                if minimized {
                    self.minimized.insert(id);
                }
                self.bridge.on_window_minimized_changed(id, minimized)?;
            }
            2 => {
                let (x, y) = (self.rng.gen_range(-200..1600), self.rng.gen_range(-200..1000));
                let (w, h) = (self.rng.gen_range(64..1280), self.rng.gen_range(64..900));
                self.bridge.on_window_geometry_changed(id, x, y, w, h)?;
            }
            3 => {
                self.bridge.on_window_closed(id)?;
                self.open.remove(&id);
                self.minimized.remove(&id);
            }
            _ => self.open_window()?,
        }
        Ok(())
    }

    fn close_all(&mut self) -> Result<()> {
        for id in std::mem::take(&mut self.open) {
            self.bridge.on_window_closed(id)?;
        }
        self.minimized.clear();
        Ok(())
    }
}

/// Borderless-window look: a title bar across the top, then random panels
fn shape_painter(
    mut rng: StdRng,
    max_shapes: u32,
) -> impl FnMut(WindowId, &mut FrameSinks<'_>) -> Result<(), GpuError> + Send {
    move |_, sinks| {
        let (width, height) = sinks.size();
        sinks.fill_rect(Rect::new(0, 0, width, height.min(32)), [0.12, 0.12, 0.14, 1.0])?;
        for _ in 0..rng.gen_range(0..=max_shapes) {
            let x = rng.gen_range(0..width);
            let y = rng.gen_range(0..height);
            let rect = Rect::new(
                x,
                y,
                rng.gen_range(1..=width - x),
                rng.gen_range(1..=height - y),
            );
            let alpha = rng.gen_range(0.2f32..1.0);
            sinks.fill_rect(rect, [rng.gen::<f32>() * alpha, rng.gen::<f32>() * alpha, 0.5 * alpha, alpha])?;
        }
        Ok(())
    }
}
