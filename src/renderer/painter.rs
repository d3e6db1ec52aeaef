//! Drawing-API seam
//!
//! The immediate-mode drawing layer lives outside this crate. Once per
//! window per frame the renderer hands it a [`FrameSinks`]: the append-only
//! vertex, index and shape-property buffers of the ring slot being recorded.
//! Whatever it appends becomes indexed draws in that window's pass.

use super::buffer::GrowableBuffer;
use crate::error::GpuError;
use crate::gpu::{align_up, DrawCall, Rect};
use crate::window::WindowId;
use bytemuck::{Pod, Zeroable};

/// One vertex of a filled shape, in window pixels
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct ShapeVertex {
    pub position: [f32; 2],
    /// Premultiplied RGBA
    pub color: [f32; 4],
}

/// Per-draw constants: `position * transform.xy + transform.zw`, then tint
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct ShapeProperties {
    pub transform: [f32; 4],
    pub tint: [f32; 4],
}

impl ShapeProperties {
    pub const SIZE: u64 = std::mem::size_of::<ShapeProperties>() as u64;

    /// Map window pixels (origin top-left) to clip space
    pub fn pixel_space(width: u32, height: u32) -> Self {
        let width = width.max(1) as f32;
        let height = height.max(1) as f32;
        Self {
            transform: [2.0 / width, -2.0 / height, -1.0, 1.0],
            tint: [1.0; 4],
        }
    }

    pub fn with_tint(mut self, tint: [f32; 4]) -> Self {
        self.tint = tint;
        self
    }
}

/// Append-only sinks for the window and frame being recorded
pub struct FrameSinks<'a> {
    pub(crate) vertices: &'a mut GrowableBuffer,
    pub(crate) indices: &'a mut GrowableBuffer,
    pub(crate) properties: &'a mut GrowableBuffer,
    pub(crate) draws: &'a mut Vec<DrawCall>,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

impl FrameSinks<'_> {
    /// Drawable size of the window in pixels
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn vertices(&mut self) -> &mut GrowableBuffer {
        self.vertices
    }

    pub fn indices(&mut self) -> &mut GrowableBuffer {
        self.indices
    }

    pub fn properties(&mut self) -> &mut GrowableBuffer {
        self.properties
    }

    pub fn draw_count(&self) -> usize {
        self.draws.len()
    }

    /// Append an indexed shape and queue its draw
    pub fn fill_shape(
        &mut self,
        vertices: &[ShapeVertex],
        indices: &[u32],
        properties: ShapeProperties,
    ) -> Result<DrawCall, GpuError> {
        let stride = std::mem::size_of::<ShapeVertex>() as u64;
        // appends land at the role-aligned cursor, so pad from there
        let cursor = align_up(self.vertices.len(), self.vertices.role().alignment());
        let misalignment = cursor % stride;
        if misalignment != 0 {
            let padding = vec![0u8; (stride - misalignment) as usize];
            self.vertices.append(&padding)?;
        }
        let vertex_offset = self.vertices.append_pod(vertices)?;
        debug_assert_eq!(vertex_offset % stride, 0);
        let index_offset = self.indices.append_pod(indices)?;
        let property_offset = self.properties.append_pod(&[properties])?;

        let call = DrawCall {
            first_index: (index_offset / 4) as u32,
            index_count: indices.len() as u32,
            base_vertex: (vertex_offset / stride) as i32,
            property_offset,
        };
        self.draws.push(call);
        Ok(call)
    }

    /// Axis-aligned rectangle in window pixels
    pub fn fill_rect(&mut self, rect: Rect, color: [f32; 4]) -> Result<DrawCall, GpuError> {
        let (x0, y0) = (rect.x as f32, rect.y as f32);
        let (x1, y1) = (x0 + rect.width as f32, y0 + rect.height as f32);
        let vertices = [
            ShapeVertex { position: [x0, y0], color },
            ShapeVertex { position: [x1, y0], color },
            ShapeVertex { position: [x1, y1], color },
            ShapeVertex { position: [x0, y1], color },
        ];
        let properties = ShapeProperties::pixel_space(self.width, self.height);
        self.fill_shape(&vertices, &[0, 1, 2, 0, 2, 3], properties)
    }
}

/// Fills one window's frame; implemented by the drawing layer
pub trait FramePainter: Send {
    fn paint(&mut self, window: WindowId, frame: &mut FrameSinks<'_>) -> Result<(), GpuError>;
}

impl<F> FramePainter for F
where
    F: FnMut(WindowId, &mut FrameSinks<'_>) -> Result<(), GpuError> + Send,
{
    fn paint(&mut self, window: WindowId, frame: &mut FrameSinks<'_>) -> Result<(), GpuError> {
        self(window, frame)
    }
}

/// Draws nothing; windows show their clear colour only
#[derive(Debug, Default, Clone, Copy)]
pub struct ClearOnly;

impl FramePainter for ClearOnly {
    fn paint(&mut self, _window: WindowId, _frame: &mut FrameSinks<'_>) -> Result<(), GpuError> {
        Ok(())
    }
}
