//! wgpu device
//!
//! Maps the backend seam onto `wgpu`:
//!
//! - upload buffers keep a host shadow (the "persistent mapping") and flush
//!   dirty ranges with `Queue::write_buffer` right before the submission
//!   that reads them
//! - descriptor heaps are tables of texture views with synthetic addresses
//! - the timeline signals through `Queue::on_submitted_work_done`; a poller
//!   thread drives `Device::poll` while signals are outstanding so the
//!   callbacks actually fire
//! - swapchains wrap a configured `Surface`; transparent windows pick a
//!   premultiplied/postmultiplied alpha mode, which is how wgpu expresses
//!   per-pixel composition with the desktop
//! - draws run through one built-in vertex-colour pipeline per target format
//!
//! wgpu tracks resource states itself, so transition barriers only need to
//! be well-formed; they are not replayed.

use super::{
    AddressSpace, BufferDesc, BufferUsage, Command, CommandList, CompositionVisual, GpuDevice,
    HeapKind, ImageDesc, ImageFormat, ImageKind, NativeSurface, RawBuffer, RawDescriptorHeap,
    RawImage, RawSwapchain, RawTimeline, SwapchainDesc,
};
use crate::error::GpuError;
use crate::renderer::painter::{ShapeProperties, ShapeVertex};
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

const SHAPE_SHADER: &str = r#"
struct ShapeProperties {
    transform: vec4<f32>,
    tint: vec4<f32>,
};

@group(0) @binding(0) var<uniform> props: ShapeProperties;

struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) color: vec4<f32>,
};

@vertex
fn vs_main(@location(0) position: vec2<f32>, @location(1) color: vec4<f32>) -> VsOut {
    var out: VsOut;
    let p = position * props.transform.xy + props.transform.zw;
    out.position = vec4<f32>(p, 0.0, 1.0);
    out.color = color * props.tint;
    return out;
}

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    return in.color;
}
"#;

const SHAPE_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
    wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x4];

/// Device-lost flag plus the timelines to force to the lost value
#[derive(Default)]
struct DeviceLoss {
    lost: AtomicBool,
    timelines: Mutex<Vec<Weak<TimelineShared>>>,
}

impl DeviceLoss {
    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn track(&self, timeline: &Arc<TimelineShared>) {
        let mut timelines = self.timelines.lock();
        timelines.retain(|t| t.strong_count() > 0);
        timelines.push(Arc::downgrade(timeline));
    }

    /// Mark the device lost and release every completion waiter
    fn mark(&self, reason: &str) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("💥 GPU device lost: {}", reason);
        let timelines: Vec<_> = self.timelines.lock().drain(..).collect();
        for timeline in timelines.iter().filter_map(Weak::upgrade) {
            timeline.reach(u64::MAX);
        }
    }
}

/// Keeps `Device::poll` running while signals are in flight
#[derive(Default)]
struct Poller {
    outstanding: Mutex<u64>,
    wake: Condvar,
    stop: AtomicBool,
}

impl Poller {
    fn begin(&self) {
        *self.outstanding.lock() += 1;
        self.wake.notify_one();
    }

    fn end(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_all();
    }

    fn run(&self, device: &wgpu::Device) {
        loop {
            {
                let mut outstanding = self.outstanding.lock();
                while *outstanding == 0 && !self.stop.load(Ordering::SeqCst) {
                    self.wake.wait(&mut outstanding);
                }
            }
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            let _ = device.poll(wgpu::Maintain::Wait);
        }
    }
}

pub struct WgpuDevice {
    instance: wgpu::Instance,
    adapter: Arc<wgpu::Adapter>,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    buffer_addresses: AddressSpace,
    heap_addresses: AddressSpace,
    poller: Arc<Poller>,
    lost: Arc<DeviceLoss>,
    shader: wgpu::ShaderModule,
    property_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: Mutex<HashMap<wgpu::TextureFormat, Arc<wgpu::RenderPipeline>>>,
}

impl WgpuDevice {
    /// Pick an adapter and open a device on the requested backends
    pub async fn new(backends: wgpu::Backends) -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let mut chosen = None;
        for power in [wgpu::PowerPreference::HighPerformance, wgpu::PowerPreference::LowPower] {
            chosen = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: power,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await;
            if chosen.is_some() {
                break;
            }
        }
        let adapter = chosen.ok_or(GpuError::NoAdapter)?;
        info!("🖥️ Using GPU: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("vitrine device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| GpuError::DeviceCreation(e.to_string()))?;

        let lost = Arc::new(DeviceLoss::default());
        let on_error = lost.clone();
        device.on_uncaptured_error(Box::new(move |err| {
            error!("wgpu error: {}", err);
            if matches!(err, wgpu::Error::OutOfMemory { .. }) {
                on_error.mark("out of memory");
            }
        }));
        let on_lost = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            on_lost.mark(&format!("{:?}: {}", reason, message));
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("vitrine shape shader"),
            source: wgpu::ShaderSource::Wgsl(SHAPE_SHADER.into()),
        });
        let property_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("shape properties layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(ShapeProperties::SIZE),
                },
                count: None,
            }],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("shape pipeline layout"),
            bind_group_layouts: &[&property_layout],
            push_constant_ranges: &[],
        });

        let device = Arc::new(device);
        let poller = Arc::new(Poller::default());
        {
            let device = device.clone();
            let poller = poller.clone();
            std::thread::Builder::new()
                .name("vitrine-gpu-poll".into())
                .spawn(move || poller.run(&device))
                .map_err(|e| GpuError::DeviceCreation(format!("poll thread: {}", e)))?;
        }

        Ok(Self {
            instance,
            adapter: Arc::new(adapter),
            device,
            queue: Arc::new(queue),
            buffer_addresses: AddressSpace::new(0x0001_0000_0000),
            heap_addresses: AddressSpace::new(0x7f00_0000_0000),
            poller,
            lost,
            shader,
            property_layout,
            pipeline_layout,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    pub fn new_blocking(backends: wgpu::Backends) -> Result<Self, GpuError> {
        pollster::block_on(Self::new(backends))
    }

    fn pipeline_for(&self, format: wgpu::TextureFormat) -> Arc<wgpu::RenderPipeline> {
        let mut pipelines = self.pipelines.lock();
        pipelines
            .entry(format)
            .or_insert_with(|| {
                debug!("building shape pipeline for {:?}", format);
                Arc::new(self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("vitrine shape pipeline"),
                    layout: Some(&self.pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &self.shader,
                        entry_point: "vs_main",
                        buffers: &[wgpu::VertexBufferLayout {
                            array_stride: std::mem::size_of::<ShapeVertex>() as u64,
                            step_mode: wgpu::VertexStepMode::Vertex,
                            attributes: &SHAPE_ATTRIBUTES,
                        }],
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &self.shader,
                        entry_point: "fs_main",
                        targets: &[Some(wgpu::ColorTargetState {
                            format,
                            blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                    }),
                    primitive: wgpu::PrimitiveState::default(),
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                }))
            })
            .clone()
    }

    fn encode_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &dyn RawImage,
        clear: Option<[f32; 4]>,
        body: &[Command],
    ) -> Result<(), GpuError> {
        let image = downcast_image(target)?;
        let frame_guard;
        let (view, format) = match &image.source {
            ImageSource::Owned { texture, view } => (view, texture.format()),
            ImageSource::Surface(slot) => {
                frame_guard = slot.lock();
                let frame = frame_guard.as_ref().ok_or_else(|| {
                    GpuError::Submit(format!("'{}' rendered before acquire", image.desc.label))
                })?;
                (&frame.view, frame.texture.texture.format())
            }
        };
        let pipeline = self.pipeline_for(format);

        let mut bind_groups = Vec::new();
        for command in body {
            if let Command::SetShapeProperties { buffer, .. } = command {
                let buffer = downcast_buffer(buffer.as_ref())?;
                bind_groups.push(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("shape properties"),
                    layout: &self.property_layout,
                    entries: &[wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &buffer.buffer,
                            offset: 0,
                            size: NonZeroU64::new(ShapeProperties::SIZE),
                        }),
                    }],
                }));
            }
        }

        let load = match clear {
            Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                r: r as f64,
                g: g as f64,
                b: b as f64,
                a: a as f64,
            }),
            None => wgpu::LoadOp::Load,
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("window pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&pipeline);

        let mut groups = bind_groups.iter();
        let mut current_group = None;
        for command in body {
            match command {
                Command::SetVertexBuffer { buffer, .. } => {
                    let buffer = downcast_buffer(buffer.as_ref())?;
                    pass.set_vertex_buffer(0, buffer.buffer.slice(..));
                }
                Command::SetIndexBuffer { buffer, .. } => {
                    let buffer = downcast_buffer(buffer.as_ref())?;
                    pass.set_index_buffer(buffer.buffer.slice(..), wgpu::IndexFormat::Uint32);
                }
                Command::SetShapeProperties { .. } => current_group = groups.next(),
                Command::Draw(call) => {
                    let Some(group) = current_group else {
                        warn!("draw without shape properties skipped");
                        continue;
                    };
                    pass.set_bind_group(0, group, &[call.property_offset as u32]);
                    pass.draw_indexed(
                        call.first_index..call.first_index + call.index_count,
                        call.base_vertex,
                        0..1,
                    );
                }
                Command::Transition { .. } | Command::BindDescriptorHeaps { .. } => {}
                other => {
                    return Err(GpuError::Submit(format!(
                        "{} is not allowed inside a render pass",
                        other.name()
                    )))
                }
            }
        }
        Ok(())
    }

    fn clear_storage(&self, image: &dyn RawImage, value: [u32; 4]) -> Result<(), GpuError> {
        let image = downcast_image(image)?;
        let ImageSource::Owned { texture, .. } = &image.source else {
            return Err(GpuError::Submit("surface images cannot be cleared as storage".into()));
        };
        let desc = &image.desc;
        let bpp = desc.format.bytes_per_pixel() as usize;
        let data = desc
            .format
            .clear_pattern(value)
            .repeat(desc.width as usize * desc.height as usize);
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(desc.width * bpp as u32),
                rows_per_image: Some(desc.height),
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }
}

impl Drop for WgpuDevice {
    fn drop(&mut self) {
        self.poller.shutdown();
    }
}

fn downcast_image(image: &dyn RawImage) -> Result<&WgpuImage, GpuError> {
    image
        .as_any()
        .downcast_ref::<WgpuImage>()
        .ok_or_else(|| GpuError::Submit("image was not created by the wgpu device".into()))
}

fn downcast_buffer(buffer: &dyn RawBuffer) -> Result<&WgpuBuffer, GpuError> {
    buffer
        .as_any()
        .downcast_ref::<WgpuBuffer>()
        .ok_or_else(|| GpuError::Submit("buffer was not created by the wgpu device".into()))
}

fn texture_format(format: ImageFormat) -> wgpu::TextureFormat {
    match format {
        ImageFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        ImageFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        ImageFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        ImageFormat::R32Float => wgpu::TextureFormat::R32Float,
        ImageFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

fn texture_usage(kind: ImageKind) -> wgpu::TextureUsages {
    use wgpu::TextureUsages as U;
    match kind {
        ImageKind::Storage => U::STORAGE_BINDING | U::TEXTURE_BINDING | U::COPY_SRC | U::COPY_DST,
        ImageKind::RenderTarget => U::RENDER_ATTACHMENT | U::TEXTURE_BINDING | U::COPY_SRC,
        ImageKind::Sampled => U::TEXTURE_BINDING | U::COPY_SRC | U::COPY_DST,
        ImageKind::DepthStencil => U::RENDER_ATTACHMENT,
    }
}

impl GpuDevice for WgpuDevice {
    fn adapter_name(&self) -> String {
        self.adapter.get_info().name
    }

    fn max_buffer_size(&self) -> u64 {
        self.device.limits().max_buffer_size
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn RawBuffer>, GpuError> {
        let limit = self.max_buffer_size();
        if desc.size > limit {
            return Err(GpuError::BufferTooLarge {
                requested: desc.size,
                limit,
            });
        }
        let size = super::align_up(desc.size.max(4), wgpu::COPY_BUFFER_ALIGNMENT);
        let usage = match desc.usage {
            BufferUsage::Upload => {
                wgpu::BufferUsages::VERTEX
                    | wgpu::BufferUsages::INDEX
                    | wgpu::BufferUsages::UNIFORM
                    | wgpu::BufferUsages::COPY_DST
            }
            BufferUsage::Readback => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        };
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size,
            usage,
            mapped_at_creation: false,
        });
        Ok(Arc::new(WgpuBuffer {
            size: desc.size,
            usage: desc.usage,
            address: self.buffer_addresses.reserve(size),
            buffer,
            shadow: Mutex::new(ShadowMemory {
                bytes: vec![0; size as usize],
                dirty: None,
            }),
            device: self.device.clone(),
            queue: self.queue.clone(),
        }))
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<Arc<dyn RawImage>, GpuError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::creation("image", format!("'{}' has zero extent", desc.label)));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(desc.format),
            usage: texture_usage(desc.kind),
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(Arc::new(WgpuImage {
            desc: desc.clone(),
            source: ImageSource::Owned { texture, view },
        }))
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
        let mut views = Vec::with_capacity(capacity as usize);
        views.resize_with(capacity as usize, || None);
        Ok(Arc::new(WgpuHeap {
            kind,
            capacity,
            cpu_base,
            gpu_base,
            views: Mutex::new(views),
        }))
    }

    fn create_timeline(&self) -> Result<Arc<dyn RawTimeline>, GpuError> {
        let shared = Arc::new(TimelineShared::default());
        self.lost.track(&shared);
        Ok(Arc::new(WgpuTimeline {
            queue: self.queue.clone(),
            poller: self.poller.clone(),
            lost: self.lost.clone(),
            shared,
        }))
    }

    fn create_swapchain(
        &self,
        surface: &NativeSurface,
        desc: &SwapchainDesc,
    ) -> Result<Box<dyn RawSwapchain>, GpuError> {
        let window = surface
            .window
            .clone()
            .ok_or_else(|| GpuError::Swapchain("off-screen surfaces cannot present".into()))?;
        let wgpu_surface = self
            .instance
            .create_surface(window)
            .map_err(|e| GpuError::Swapchain(e.to_string()))?;

        let caps = wgpu_surface.get_capabilities(&self.adapter);
        if caps.formats.is_empty() {
            return Err(GpuError::Swapchain("surface is incompatible with the adapter".into()));
        }
        let wanted = texture_format(desc.format);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| *f == wanted)
            .unwrap_or(caps.formats[0]);
        let alpha_mode = if desc.transparent {
            [
                wgpu::CompositeAlphaMode::PreMultiplied,
                wgpu::CompositeAlphaMode::PostMultiplied,
            ]
            .into_iter()
            .find(|m| caps.alpha_modes.contains(m))
            .unwrap_or(caps.alpha_modes[0])
        } else {
            caps.alpha_modes[0]
        };
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if caps.usages.contains(wgpu::TextureUsages::COPY_SRC) {
            usage |= wgpu::TextureUsages::COPY_SRC;
        }
        info!(
            "🔧 surface {}: format={:?}, alpha_mode={:?}, {} images",
            surface.id, format, alpha_mode, desc.image_count
        );
        let config = wgpu::SurfaceConfiguration {
            usage,
            format,
            width: desc.width.max(1),
            height: desc.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: desc.image_count.saturating_sub(1).max(1),
        };
        wgpu_surface.configure(&self.device, &config);

        Ok(Box::new(WgpuSwapchain {
            surface_id: surface.id,
            desc: desc.clone(),
            surface: wgpu_surface,
            config,
            device: self.device.clone(),
            slot: Arc::new(Mutex::new(None)),
            next: 0,
        }))
    }

    fn create_composition(
        &self,
        surface: &NativeSurface,
    ) -> Result<Box<dyn CompositionVisual>, GpuError> {
        Ok(Box::new(WgpuComposition {
            surface_id: surface.id,
        }))
    }

    fn submit(&self, commands: CommandList) -> Result<(), GpuError> {
        if self.lost.is_lost() {
            return Err(GpuError::DeviceLost);
        }
        let cmds = commands.commands();
        for command in cmds {
            match command {
                Command::SetVertexBuffer { buffer, .. }
                | Command::SetIndexBuffer { buffer, .. }
                | Command::SetShapeProperties { buffer, .. } => {
                    downcast_buffer(buffer.as_ref())?.flush();
                }
                _ => {}
            }
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(commands.label()),
            });
        let mut i = 0;
        while i < cmds.len() {
            match &cmds[i] {
                Command::BeginPass { target, clear } => {
                    let end = cmds[i + 1..]
                        .iter()
                        .position(|c| matches!(c, Command::EndPass))
                        .map(|p| i + 1 + p)
                        .ok_or_else(|| GpuError::Submit("render pass is never ended".into()))?;
                    self.encode_pass(&mut encoder, target.as_ref(), *clear, &cmds[i + 1..end])?;
                    i = end + 1;
                    continue;
                }
                Command::CopyImageToBuffer {
                    image,
                    rect,
                    buffer,
                    row_pitch,
                } => {
                    let src = downcast_image(image.as_ref())?;
                    let dst = downcast_buffer(buffer.as_ref())?;
                    let frame_guard;
                    let texture = match &src.source {
                        ImageSource::Owned { texture, .. } => texture,
                        ImageSource::Surface(slot) => {
                            frame_guard = slot.lock();
                            &frame_guard
                                .as_ref()
                                .ok_or_else(|| GpuError::Submit("readback before acquire".into()))?
                                .texture
                                .texture
                        }
                    };
                    encoder.copy_texture_to_buffer(
                        wgpu::ImageCopyTexture {
                            texture,
                            mip_level: 0,
                            origin: wgpu::Origin3d {
                                x: rect.x,
                                y: rect.y,
                                z: 0,
                            },
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::ImageCopyBuffer {
                            buffer: &dst.buffer,
                            layout: wgpu::ImageDataLayout {
                                offset: 0,
                                bytes_per_row: Some(*row_pitch),
                                rows_per_image: Some(rect.height),
                            },
                        },
                        wgpu::Extent3d {
                            width: rect.width,
                            height: rect.height,
                            depth_or_array_layers: 1,
                        },
                    );
                }
                Command::ClearStorage { image, value } => self.clear_storage(image.as_ref(), *value)?,
                Command::Transition { .. } | Command::BindDescriptorHeaps { .. } => {}
                other => {
                    return Err(GpuError::Submit(format!(
                        "{} recorded outside a render pass",
                        other.name()
                    )))
                }
            }
            i += 1;
        }
        self.queue.submit(Some(encoder.finish()));
        trace!("submitted '{}' ({} commands)", commands.label(), cmds.len());
        Ok(())
    }
}

struct ShadowMemory {
    bytes: Vec<u8>,
    dirty: Option<Range<u64>>,
}

pub struct WgpuBuffer {
    size: u64,
    usage: BufferUsage,
    address: u64,
    buffer: wgpu::Buffer,
    shadow: Mutex<ShadowMemory>,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

impl WgpuBuffer {
    /// Push the dirty part of the shadow to the GPU copy
    fn flush(&self) {
        let mut shadow = self.shadow.lock();
        let Some(dirty) = shadow.dirty.take() else {
            return;
        };
        let align = wgpu::COPY_BUFFER_ALIGNMENT;
        let start = dirty.start / align * align;
        let end = super::align_up(dirty.end, align).min(shadow.bytes.len() as u64);
        self.queue
            .write_buffer(&self.buffer, start, &shadow.bytes[start as usize..end as usize]);
    }
}

impl RawBuffer for WgpuBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn gpu_address(&self) -> u64 {
        self.address
    }

    fn write(&self, offset: u64, bytes: &[u8]) {
        let mut shadow = self.shadow.lock();
        let end = offset + bytes.len() as u64;
        shadow.bytes[offset as usize..end as usize].copy_from_slice(bytes);
        shadow.dirty = Some(match shadow.dirty.take() {
            Some(range) => range.start.min(offset)..range.end.max(end),
            None => offset..end,
        });
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, GpuError> {
        if self.usage == BufferUsage::Upload {
            let shadow = self.shadow.lock();
            return shadow
                .bytes
                .get(offset as usize..offset as usize + len)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| GpuError::creation("buffer read", "range out of bounds"));
        }
        let slice = self.buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| GpuError::Submit(format!("readback map dropped: {}", e)))?
            .map_err(|e| GpuError::Submit(format!("readback map failed: {}", e)))?;
        let out = {
            let mapped = slice.get_mapped_range();
            mapped
                .get(offset as usize..offset as usize + len)
                .map(<[u8]>::to_vec)
        };
        self.buffer.unmap();
        out.ok_or_else(|| GpuError::creation("buffer read", "range out of bounds"))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct AcquiredFrame {
    texture: wgpu::SurfaceTexture,
    view: wgpu::TextureView,
}

enum ImageSource {
    Owned {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
    },
    /// Whatever surface texture is currently acquired
    Surface(Arc<Mutex<Option<AcquiredFrame>>>),
}

pub struct WgpuImage {
    desc: ImageDesc,
    source: ImageSource,
}

impl RawImage for WgpuImage {
    fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

enum SlotView {
    Texture(wgpu::TextureView),
    /// Per-frame surface view, resolved at pass time
    Surface,
}

pub struct WgpuHeap {
    kind: HeapKind,
    capacity: u32,
    cpu_base: u64,
    gpu_base: Option<u64>,
    views: Mutex<Vec<Option<SlotView>>>,
}

impl RawDescriptorHeap for WgpuHeap {
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
        let view = match &image.source {
            ImageSource::Owned { texture, .. } => {
                SlotView::Texture(texture.create_view(&wgpu::TextureViewDescriptor::default()))
            }
            ImageSource::Surface(_) => SlotView::Surface,
        };
        let mut views = self.views.lock();
        let entry = views.get_mut(slot as usize).ok_or_else(|| {
            GpuError::creation("descriptor view", format!("slot {} outside {:?} heap", slot, self.kind))
        })?;
        *entry = Some(view);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type CompletionCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TimelineShared {
    completed: AtomicU64,
    waiters: Mutex<Vec<(u64, CompletionCallback)>>,
}

impl TimelineShared {
    fn reach(&self, value: u64) {
        self.completed.fetch_max(value, Ordering::SeqCst);
        let completed = self.completed.load(Ordering::SeqCst);
        let ready: Vec<CompletionCallback> = {
            let mut waiters = self.waiters.lock();
            let (ready, pending): (Vec<_>, Vec<_>) =
                waiters.drain(..).partition(|(v, _)| *v <= completed);
            *waiters = pending;
            ready.into_iter().map(|(_, cb)| cb).collect()
        };
        for callback in ready {
            callback();
        }
    }
}

pub struct WgpuTimeline {
    queue: Arc<wgpu::Queue>,
    poller: Arc<Poller>,
    lost: Arc<DeviceLoss>,
    shared: Arc<TimelineShared>,
}

impl RawTimeline for WgpuTimeline {
    fn signal(&self, value: u64) -> Result<(), GpuError> {
        if self.lost.is_lost() {
            return Err(GpuError::DeviceLost);
        }
        self.poller.begin();
        let shared = self.shared.clone();
        let poller = self.poller.clone();
        self.queue.on_submitted_work_done(move || {
            shared.reach(value);
            poller.end();
        });
        Ok(())
    }

    fn completed(&self) -> u64 {
        if self.lost.is_lost() {
            return u64::MAX;
        }
        self.shared.completed.load(Ordering::SeqCst)
    }

    fn on_completion(&self, value: u64, callback: Box<dyn FnOnce() + Send>) {
        {
            let mut waiters = self.shared.waiters.lock();
            if self.shared.completed.load(Ordering::SeqCst) < value {
                waiters.push((value, callback));
                return;
            }
        }
        callback();
    }
}

pub struct WgpuSwapchain {
    surface_id: u64,
    desc: SwapchainDesc,
    slot: Arc<Mutex<Option<AcquiredFrame>>>,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    device: Arc<wgpu::Device>,
    next: u32,
}

impl RawSwapchain for WgpuSwapchain {
    fn image_count(&self) -> u32 {
        self.desc.image_count
    }

    fn image(&self, index: u32) -> Result<Arc<dyn RawImage>, GpuError> {
        if index >= self.desc.image_count {
            return Err(GpuError::Swapchain(format!("no present image {}", index)));
        }
        Ok(Arc::new(WgpuImage {
            desc: ImageDesc {
                label: format!("surface {} back buffer {}", self.surface_id, index),
                kind: ImageKind::RenderTarget,
                format: self.desc.format,
                width: self.config.width,
                height: self.config.height,
            },
            source: ImageSource::Surface(self.slot.clone()),
        }))
    }

    fn acquire(&mut self) -> Result<u32, GpuError> {
        let texture = match self.surface.get_current_texture() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Lost) | Err(wgpu::SurfaceError::Outdated) => {
                debug!("surface {} outdated, reconfiguring", self.surface_id);
                self.surface.configure(&self.device, &self.config);
                self.surface
                    .get_current_texture()
                    .map_err(|e| GpuError::Swapchain(e.to_string()))?
            }
            Err(e) => return Err(GpuError::Swapchain(e.to_string())),
        };
        let view = texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        *self.slot.lock() = Some(AcquiredFrame { texture, view });
        let index = self.next;
        self.next = (self.next + 1) % self.desc.image_count;
        Ok(index)
    }

    fn present(&mut self) -> Result<(), GpuError> {
        let frame = self
            .slot
            .lock()
            .take()
            .ok_or_else(|| GpuError::Present("present without an acquired image".into()))?;
        drop(frame.view);
        frame.texture.present();
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        if Arc::strong_count(&self.slot) > 1 {
            return Err(GpuError::Swapchain(format!(
                "resize with {} present image wrappers alive",
                Arc::strong_count(&self.slot) - 1
            )));
        }
        self.slot.lock().take();
        self.config.width = width.max(1);
        self.config.height = height.max(1);
        self.desc.width = self.config.width;
        self.desc.height = self.config.height;
        self.surface.configure(&self.device, &self.config);
        self.next = 0;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// wgpu composes transparent surfaces through the alpha mode chosen at
/// configure time, so the visual only has to acknowledge content changes.
struct WgpuComposition {
    surface_id: u64,
}

impl CompositionVisual for WgpuComposition {
    fn set_content(&mut self, swapchain: &dyn RawSwapchain) -> Result<(), GpuError> {
        debug!(
            "surface {} composition bound to {} present images",
            self.surface_id,
            swapchain.image_count()
        );
        Ok(())
    }

    fn commit(&mut self) -> Result<(), GpuError> {
        Ok(())
    }
}
