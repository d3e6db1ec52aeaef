//! # Vitrine
//!
//! GPU frame-resource lifecycle management for borderless, compositor-backed
//! desktop windows.
//!
//! ## Architecture
//!
//! - `gpu`: backend seam (`GpuDevice`) with a headless and a wgpu backend
//! - `renderer`: fence clock, deferred reclaimer, descriptor pool, growable
//!   buffers, frame rings, images, swapchains, window resources and the
//!   render loop
//! - `window`: the bridge the native window system reports changes through
//! - `config`: TOML configuration
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vitrine::gpu::headless::HeadlessDevice;
//! use vitrine::gpu::NativeSurface;
//! use vitrine::renderer::{ClearOnly, RenderThread, Renderer};
//! use vitrine::window::WindowGeometry;
//! use vitrine::VitrineConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let device = Arc::new(HeadlessDevice::auto_complete());
//!     let (renderer, bridge) =
//!         Renderer::create(device, &VitrineConfig::default(), Box::new(ClearOnly))?;
//!     let thread = RenderThread::spawn(renderer)?;
//!     let id = bridge.on_window_created(NativeSurface::offscreen(1), WindowGeometry::new(0, 0, 640, 480))?;
//!     bridge.on_window_closed(id)?;
//!     println!("{:?}", thread.shutdown()?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod gpu;
pub mod renderer;
pub mod window;

// Re-export main types for easy access
pub use config::VitrineConfig;
pub use error::GpuError;
pub use renderer::{RenderThread, Renderer, RendererStats};
pub use window::{WindowGeometry, WindowId, WindowSystemBridge};

/// Version information for Vitrine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
