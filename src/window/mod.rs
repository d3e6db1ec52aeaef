//! Window-system bridge
//!
//! Native window creation, hit-testing and the message pump belong to the
//! platform layer. What reaches this crate is a small set of notifications:
//! a window was created, closed, resized, minimized or moved. The
//! [`WindowSystemBridge`] turns each one into a [`WindowMessage`] for the
//! render thread and requests a render.

use crate::config::WindowConfig;
use crate::gpu::{ImageFormat, NativeSurface};
use crate::renderer::messages::{RenderSignal, RenderThreadGone, WindowEventSender, WindowMessage};
use crate::renderer::swapchain::SwapchainOptions;
use log::debug;
use std::fmt;
use std::sync::Arc;

/// Identity of a native window
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

/// Screen position and client size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl WindowGeometry {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Presentation options of one window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowOptions {
    /// Custom chrome instead of native decorations
    pub borderless: bool,
    /// Per-pixel alpha composition with the desktop
    pub transparent: bool,
    /// Premultiplied RGBA the back buffer is cleared to every frame
    pub clear_color: [f32; 4],
    pub image_count: u32,
    pub format: ImageFormat,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self::from(&WindowConfig::default())
    }
}

impl From<&WindowConfig> for WindowOptions {
    fn from(config: &WindowConfig) -> Self {
        Self {
            borderless: config.borderless,
            transparent: config.transparent,
            clear_color: config.clear_color,
            image_count: config.swapchain_images,
            format: ImageFormat::Bgra8Unorm,
        }
    }
}

impl WindowOptions {
    pub fn swapchain(&self) -> SwapchainOptions {
        SwapchainOptions {
            image_count: self.image_count,
            format: self.format,
            transparent: self.transparent,
        }
    }
}

type Hook = Box<dyn FnOnce(WindowId) + Send>;

/// Callbacks into the window system
#[derive(Default)]
pub struct WindowHooks {
    /// After the first successful present; show the native window now
    pub on_first_frame: Option<Hook>,
    /// After the window's GPU resources are gone; destroy the native window
    pub on_destroyed: Option<Hook>,
}

impl WindowHooks {
    pub fn on_first_frame(mut self, hook: impl FnOnce(WindowId) + Send + 'static) -> Self {
        self.on_first_frame = Some(Box::new(hook));
        self
    }

    pub fn on_destroyed(mut self, hook: impl FnOnce(WindowId) + Send + 'static) -> Self {
        self.on_destroyed = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for WindowHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowHooks")
            .field("on_first_frame", &self.on_first_frame.is_some())
            .field("on_destroyed", &self.on_destroyed.is_some())
            .finish()
    }
}

/// UI-thread side of the renderer
pub struct WindowSystemBridge {
    sender: WindowEventSender,
    signal: Arc<RenderSignal>,
    defaults: WindowOptions,
}

impl WindowSystemBridge {
    pub fn new(sender: WindowEventSender, signal: Arc<RenderSignal>, defaults: WindowOptions) -> Self {
        Self {
            sender,
            signal,
            defaults,
        }
    }

    fn post(&self, message: WindowMessage) -> Result<(), RenderThreadGone> {
        debug!("posting {:?}", message);
        self.sender.send(message)?;
        self.signal.request();
        Ok(())
    }

    /// New native window with default options; its id is the surface id
    pub fn on_window_created(
        &self,
        surface: NativeSurface,
        geometry: WindowGeometry,
    ) -> Result<WindowId, RenderThreadGone> {
        self.create_window(surface, geometry, self.defaults, WindowHooks::default())
    }

    pub fn create_window(
        &self,
        surface: NativeSurface,
        geometry: WindowGeometry,
        options: WindowOptions,
        hooks: WindowHooks,
    ) -> Result<WindowId, RenderThreadGone> {
        let id = WindowId(surface.id);
        self.post(WindowMessage::Created {
            id,
            surface,
            geometry,
            options,
            hooks,
        })?;
        Ok(id)
    }

    pub fn on_window_closed(&self, id: WindowId) -> Result<(), RenderThreadGone> {
        self.post(WindowMessage::Closed(id))
    }

    pub fn on_window_resized(&self, id: WindowId, width: u32, height: u32) -> Result<(), RenderThreadGone> {
        self.post(WindowMessage::Resized { id, width, height })
    }

    pub fn on_window_minimized_changed(
        &self,
        id: WindowId,
        minimized: bool,
    ) -> Result<(), RenderThreadGone> {
        self.post(WindowMessage::MinimizedChanged { id, minimized })
    }

    pub fn on_window_geometry_changed(
        &self,
        id: WindowId,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<(), RenderThreadGone> {
        self.post(WindowMessage::GeometryChanged {
            id,
            geometry: WindowGeometry::new(x, y, width, height),
        })
    }

    /// Ask for a frame without any window change (animation, new content)
    pub fn request_render(&self) {
        self.signal.request();
    }

    pub fn defaults(&self) -> WindowOptions {
        self.defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::messages::{window_channel, Wake};

    #[test]
    fn test_bridge_posts_and_requests_render() {
        let (tx, rx) = window_channel(8);
        let signal = Arc::new(RenderSignal::new());
        let bridge = WindowSystemBridge::new(tx, signal.clone(), WindowOptions::default());

        let id = bridge
            .on_window_created(NativeSurface::offscreen(7), WindowGeometry::new(0, 0, 10, 10))
            .unwrap();
        assert_eq!(id, WindowId(7));
        bridge.on_window_minimized_changed(id, true).unwrap();
        bridge.on_window_geometry_changed(id, 5, 5, 20, 20).unwrap();
        bridge.on_window_closed(id).unwrap();

        assert_eq!(signal.wait(), Wake::Render(4));
        let messages: Vec<WindowMessage> = rx.drain().collect();
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], WindowMessage::Created { .. }));
        assert!(matches!(
            messages[2],
            WindowMessage::GeometryChanged {
                geometry: WindowGeometry { x: 5, width: 20, .. },
                ..
            }
        ));
        assert!(matches!(messages[3], WindowMessage::Closed(WindowId(7))));
    }

    #[test]
    fn test_options_follow_config() {
        let config = WindowConfig {
            transparent: false,
            swapchain_images: 3,
            ..Default::default()
        };
        let options = WindowOptions::from(&config);
        assert!(!options.transparent);
        assert!(!options.swapchain().transparent);
        assert_eq!(options.swapchain().image_count, 3);
    }
}
