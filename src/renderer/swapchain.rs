//! Swapchain resources
//!
//! N presentable back buffers bound to a native window surface, each
//! wrapped as an [`ImageResource`] with a render-target descriptor. For
//! transparent windows a compositor visual is bound to the swapchain so
//! the desktop composes the window with per-pixel alpha.
//!
//! Resizing is the one operation allowed to stall on the GPU: the wrappers
//! have to be released before the surface can be resized, and they can only
//! be released once nothing in flight references them.

use super::context::GpuContext;
use super::image::ImageResource;
use crate::error::GpuError;
use crate::gpu::{CompositionVisual, ImageFormat, NativeSurface, RawSwapchain, ResourceState, SwapchainDesc};
use log::{debug, info};

/// Default number of back buffers
pub const DEFAULT_IMAGE_COUNT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainOptions {
    pub image_count: u32,
    pub format: ImageFormat,
    pub transparent: bool,
}

impl Default for SwapchainOptions {
    fn default() -> Self {
        Self {
            image_count: DEFAULT_IMAGE_COUNT,
            format: ImageFormat::Bgra8Unorm,
            transparent: true,
        }
    }
}

pub struct SwapchainResource {
    ctx: GpuContext,
    surface: NativeSurface,
    raw: Box<dyn RawSwapchain>,
    images: Vec<ImageResource>,
    visual: Option<Box<dyn CompositionVisual>>,
    options: SwapchainOptions,
    width: u32,
    height: u32,
    acquired: Option<u32>,
}

impl std::fmt::Debug for SwapchainResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapchainResource")
            .field("surface", &self.surface)
            .field("size", &(self.width, self.height))
            .field("options", &self.options)
            .field("acquired", &self.acquired)
            .finish()
    }
}

impl SwapchainResource {
    pub fn new(
        ctx: &GpuContext,
        surface: NativeSurface,
        width: u32,
        height: u32,
        options: SwapchainOptions,
    ) -> Result<Self, GpuError> {
        let (width, height) = (width.max(1), height.max(1));
        let raw = ctx.device.create_swapchain(
            &surface,
            &SwapchainDesc {
                width,
                height,
                image_count: options.image_count,
                format: options.format,
                transparent: options.transparent,
            },
        )?;
        let mut swapchain = Self {
            ctx: ctx.clone(),
            surface,
            raw,
            images: Vec::new(),
            visual: None,
            options,
            width,
            height,
            acquired: None,
        };
        swapchain.wrap_images()?;

        if options.transparent {
            let mut visual = ctx.device.create_composition(&swapchain.surface)?;
            visual.set_content(swapchain.raw.as_ref())?;
            visual.commit()?;
            swapchain.visual = Some(visual);
        }
        debug!(
            "swapchain for surface {} created: {}x{}, {} images{}",
            swapchain.surface.id,
            width,
            height,
            options.image_count,
            if options.transparent { ", composited" } else { "" }
        );
        Ok(swapchain)
    }

    fn wrap_images(&mut self) -> Result<(), GpuError> {
        self.images = (0..self.raw.image_count())
            .map(|index| {
                let raw = self.raw.image(index)?;
                ImageResource::wrap(&self.ctx, raw, ResourceState::Present)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn is_transparent(&self) -> bool {
        self.options.transparent
    }

    pub fn surface(&self) -> &NativeSurface {
        &self.surface
    }

    pub fn images(&self) -> &[ImageResource] {
        &self.images
    }

    /// Resize the surface; zero extents are clamped to 1x1.
    ///
    /// Waits for the GPU to go idle first, since every back buffer wrapper
    /// has to be released before the surface can change size.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        self.ctx.clock.wait_idle()?;

        for image in self.images.drain(..) {
            image.release_now();
        }
        self.acquired = None;
        self.raw.resize(width, height)?;
        self.wrap_images()?;
        if let Some(visual) = self.visual.as_mut() {
            visual.set_content(self.raw.as_ref())?;
            visual.commit()?;
        }
        info!(
            "🔧 surface {} resized {}x{} -> {}x{}",
            self.surface.id, self.width, self.height, width, height
        );
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Tear down with every descriptor slot released at once.
    ///
    /// Only valid once the GPU has finished with all of this swapchain's
    /// frames.
    pub fn destroy(mut self) {
        for image in self.images.drain(..) {
            image.release_now();
        }
        self.visual = None;
        debug!("swapchain for surface {} destroyed", self.surface.id);
    }

    /// Acquire the next back buffer for rendering
    pub fn acquire_next(&mut self) -> Result<u32, GpuError> {
        let index = self.raw.acquire()?;
        self.acquired = Some(index);
        Ok(index)
    }

    /// The acquired back buffer, if any
    pub fn back_buffer(&mut self) -> Option<&mut ImageResource> {
        let index = self.acquired?;
        self.images.get_mut(index as usize)
    }

    pub fn present(&mut self) -> Result<(), GpuError> {
        debug_assert!(
            self.back_buffer()
                .map(|image| image.state() == ResourceState::Present)
                .unwrap_or(false),
            "presenting a back buffer not in the present state"
        );
        self.raw.present()?;
        self.acquired = None;
        Ok(())
    }
}
