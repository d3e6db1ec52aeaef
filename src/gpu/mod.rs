//! GPU backend seam
//!
//! The lifecycle core (fence clock, reclaimer, descriptor pool, buffers,
//! images, swapchains) never talks to a graphics API directly. It drives a
//! [`GpuDevice`] and the raw objects it hands out. Two devices exist:
//!
//! - [`headless::HeadlessDevice`]: host-memory simulation with a timeline
//!   that tests can advance by hand
//! - [`wgpu_backend::WgpuDevice`]: the real thing, on top of `wgpu`
//!
//! Raw objects are reference counted. Dropping the last `Arc` is the actual
//! free, which is why stale objects are moved into deferred-reclaim closures
//! instead of being dropped in place.

use crate::error::GpuError;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub mod command;
pub mod headless;
pub mod wgpu_backend;

pub use command::{Command, CommandList, DrawCall};

/// Kinds of descriptor heap the pool manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Shader-visible heap for sampled, storage and uniform views
    ShaderResource,
    /// Render target views
    RenderTarget,
    /// Depth-stencil views
    DepthStencil,
}

/// Native size and flags of one heap kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    pub descriptor_size: u64,
    pub shader_visible: bool,
    pub max_slots: u32,
}

impl HeapKind {
    pub const ALL: [HeapKind; 3] = [
        HeapKind::ShaderResource,
        HeapKind::RenderTarget,
        HeapKind::DepthStencil,
    ];

    /// Fixed kind -> native layout table
    pub const fn layout(self) -> HeapLayout {
        match self {
            HeapKind::ShaderResource => HeapLayout {
                descriptor_size: 32,
                shader_visible: true,
                max_slots: 1 << 20,
            },
            HeapKind::RenderTarget => HeapLayout {
                descriptor_size: 32,
                shader_visible: false,
                max_slots: 1 << 16,
            },
            HeapKind::DepthStencil => HeapLayout {
                descriptor_size: 8,
                shader_visible: false,
                max_slots: 1 << 16,
            },
        }
    }

    pub fn index(self) -> usize {
        match self {
            HeapKind::ShaderResource => 0,
            HeapKind::RenderTarget => 1,
            HeapKind::DepthStencil => 2,
        }
    }
}

/// Memory placement of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// CPU-written, GPU-read (vertex, index, constant data)
    Upload,
    /// GPU-written, CPU-read (image readback staging)
    Readback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Typed view an image is created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    /// Unordered-access (storage) image
    Storage,
    RenderTarget,
    /// Sampled (shader-resource) image
    Sampled,
    DepthStencil,
}

impl ImageKind {
    /// Heap the image's descriptor view lives in
    pub fn heap_kind(self) -> HeapKind {
        match self {
            ImageKind::Storage | ImageKind::Sampled => HeapKind::ShaderResource,
            ImageKind::RenderTarget => HeapKind::RenderTarget,
            ImageKind::DepthStencil => HeapKind::DepthStencil,
        }
    }

    /// State a freshly created image of this kind is in
    pub fn initial_state(self) -> ResourceState {
        match self {
            ImageKind::Storage => ResourceState::UnorderedAccess,
            ImageKind::RenderTarget => ResourceState::RenderTarget,
            ImageKind::Sampled => ResourceState::ShaderResource,
            ImageKind::DepthStencil => ResourceState::DepthWrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    R32Float,
    Depth32Float,
}

impl ImageFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            ImageFormat::Rgba8Unorm | ImageFormat::Bgra8Unorm => 4,
            ImageFormat::Rgba16Float => 8,
            ImageFormat::R32Float | ImageFormat::Depth32Float => 4,
        }
    }

    /// One pixel of a storage clear. Channel values are raw bits, truncated
    /// to the channel width.
    pub fn clear_pattern(self, value: [u32; 4]) -> Vec<u8> {
        let [r, g, b, a] = value;
        match self {
            ImageFormat::Rgba8Unorm => vec![r as u8, g as u8, b as u8, a as u8],
            ImageFormat::Bgra8Unorm => vec![b as u8, g as u8, r as u8, a as u8],
            ImageFormat::Rgba16Float => [r, g, b, a]
                .iter()
                .flat_map(|c| (*c as u16).to_le_bytes())
                .collect(),
            ImageFormat::R32Float | ImageFormat::Depth32Float => r.to_le_bytes().to_vec(),
        }
    }
}

/// GPU-tracked usage mode of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    Present,
    RenderTarget,
    ShaderResource,
    UnorderedAccess,
    DepthWrite,
    CopySource,
    CopyDest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub label: String,
    pub kind: ImageKind,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Native window surface handed over by the window system
#[derive(Clone)]
pub struct NativeSurface {
    pub id: u64,
    /// Raw window/display handles; `None` for off-screen surfaces
    pub window: Option<Arc<dyn wgpu::WindowHandle>>,
}

impl NativeSurface {
    pub fn offscreen(id: u64) -> Self {
        Self { id, window: None }
    }

    pub fn from_window(id: u64, window: Arc<dyn wgpu::WindowHandle>) -> Self {
        Self {
            id,
            window: Some(window),
        }
    }
}

impl fmt::Debug for NativeSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeSurface")
            .field("id", &self.id)
            .field("windowed", &self.window.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub image_count: u32,
    pub format: ImageFormat,
    /// Per-pixel alpha composition with the desktop
    pub transparent: bool,
}

/// CPU-visible linear GPU allocation
pub trait RawBuffer: Send + Sync {
    fn size(&self) -> u64;
    /// Base address baked into recorded commands
    fn gpu_address(&self) -> u64;
    /// Write through the persistent mapping
    fn write(&self, offset: u64, bytes: &[u8]);
    /// Read back `len` bytes starting at `offset`
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, GpuError>;
    fn as_any(&self) -> &dyn Any;
}

pub trait RawImage: Send + Sync {
    fn desc(&self) -> &ImageDesc;
    fn as_any(&self) -> &dyn Any;
}

/// Fixed-size contiguous table of descriptors
pub trait RawDescriptorHeap: Send + Sync {
    fn kind(&self) -> HeapKind;
    fn capacity(&self) -> u32;
    fn cpu_base(&self) -> u64;
    /// Only shader-visible heaps have a GPU address
    fn gpu_base(&self) -> Option<u64>;
    /// Install a view of `image` into `slot`
    fn write_view(&self, slot: u32, image: &Arc<dyn RawImage>) -> Result<(), GpuError>;
    fn as_any(&self) -> &dyn Any;
}

/// GPU-side signal primitive behind the fence clock
pub trait RawTimeline: Send + Sync {
    /// Signal `value` once all previously submitted work completes
    fn signal(&self, value: u64) -> Result<(), GpuError>;
    /// Highest value the GPU has reached; `u64::MAX` means the device is gone
    fn completed(&self) -> u64;
    /// Run `callback` once `value` is reached (immediately if it already is)
    fn on_completion(&self, value: u64, callback: Box<dyn FnOnce() + Send>);
}

/// Presentable images bound to a native surface
pub trait RawSwapchain: Send {
    fn image_count(&self) -> u32;
    /// Wrap present image `index`; the wrapper must be dropped before `resize`
    fn image(&self, index: u32) -> Result<Arc<dyn RawImage>, GpuError>;
    /// Index of the back buffer to render into
    fn acquire(&mut self) -> Result<u32, GpuError>;
    fn present(&mut self) -> Result<(), GpuError>;
    fn resize(&mut self, width: u32, height: u32) -> Result<(), GpuError>;
    fn as_any(&self) -> &dyn Any;
}

/// Compositor device/target/visual chain used for transparent windows
pub trait CompositionVisual: Send {
    fn set_content(&mut self, swapchain: &dyn RawSwapchain) -> Result<(), GpuError>;
    fn commit(&mut self) -> Result<(), GpuError>;
}

pub trait GpuDevice: Send + Sync {
    fn adapter_name(&self) -> String;
    fn max_buffer_size(&self) -> u64;
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn RawBuffer>, GpuError>;
    fn create_image(&self, desc: &ImageDesc) -> Result<Arc<dyn RawImage>, GpuError>;
    fn create_descriptor_heap(
        &self,
        kind: HeapKind,
        capacity: u32,
    ) -> Result<Arc<dyn RawDescriptorHeap>, GpuError>;
    fn create_timeline(&self) -> Result<Arc<dyn RawTimeline>, GpuError>;
    fn create_swapchain(
        &self,
        surface: &NativeSurface,
        desc: &SwapchainDesc,
    ) -> Result<Box<dyn RawSwapchain>, GpuError>;
    fn create_composition(
        &self,
        surface: &NativeSurface,
    ) -> Result<Box<dyn CompositionVisual>, GpuError>;
    /// Execute a recorded command list on the device queue
    fn submit(&self, commands: CommandList) -> Result<(), GpuError>;
}

impl fmt::Debug for dyn RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawBuffer({} bytes @ {:#x})", self.size(), self.gpu_address())
    }
}

impl fmt::Debug for dyn GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDevice({})", self.adapter_name())
    }
}

/// Hands out non-overlapping synthetic address ranges.
///
/// Neither backend exposes real virtual addresses, but the lifecycle core
/// reasons in addresses (a grown buffer or heap lives at a new range), so
/// every allocation gets a fresh, 64KiB-aligned range.
#[derive(Debug)]
pub struct AddressSpace {
    next: AtomicU64,
}

const ADDRESS_GRANULARITY: u64 = 64 * 1024;

impl AddressSpace {
    pub const fn new(base: u64) -> Self {
        Self {
            next: AtomicU64::new(base),
        }
    }

    pub fn reserve(&self, size: u64) -> u64 {
        let span = align_up(size.max(1), ADDRESS_GRANULARITY);
        self.next.fetch_add(span, Ordering::Relaxed)
    }
}

/// Round `value` up to a multiple of `alignment` (any non-zero alignment)
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value.div_ceil(alignment) * alignment
}
