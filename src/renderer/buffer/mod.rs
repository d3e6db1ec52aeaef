//! Growable upload buffer
//!
//! An append-only linear buffer in CPU-writable GPU memory. Each append is
//! aligned to the buffer's role (4 bytes for vertex and index data, 256 for
//! constant and shape-property data) and returns the offset it landed at.
//!
//! When an append does not fit, the buffer grows:
//!
//! 1. the valid prefix `[0, cursor)` is snapshotted host-side
//! 2. the old allocation is retired to the deferred reclaimer, tagged with
//!    the fence value of the frame being recorded
//! 3. a larger allocation is made per [`growth_capacity`]
//! 4. the snapshot is re-appended, so earlier offsets stay valid
//!
//! Addresses already baked into submitted commands keep pointing at the old
//! allocation, which stays alive until the GPU is done with it. New
//! recording must re-read [`GrowableBuffer::gpu_address`] after appending.

use super::context::GpuContext;
use crate::error::GpuError;
use crate::gpu::{align_up, BufferDesc, BufferUsage, RawBuffer};
use log::{debug, info};
use std::sync::Arc;

#[cfg(test)]
mod property_tests;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Below this capacity a grow doubles
pub const FAST_GROWTH_LIMIT: u64 = 256 * KIB;
/// Below this capacity a grow adds half
pub const MEDIUM_GROWTH_LIMIT: u64 = 8 * MIB;
/// Beyond this, grow to exactly what is needed
pub const GROWTH_CEILING: u64 = 128 * MIB;

/// What a buffer holds, which fixes its append alignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    Vertex,
    Index,
    /// Per-draw shape properties (constant-buffer views)
    ShapeProperties,
    Constant,
}

impl BufferRole {
    pub fn alignment(self) -> u64 {
        match self {
            BufferRole::Vertex | BufferRole::Index => 4,
            BufferRole::ShapeProperties | BufferRole::Constant => 256,
        }
    }

    fn label(self) -> &'static str {
        match self {
            BufferRole::Vertex => "vertices",
            BufferRole::Index => "indices",
            BufferRole::ShapeProperties => "shape properties",
            BufferRole::Constant => "constants",
        }
    }
}

/// Capacity to grow an `old`-byte buffer to so that `needed` bytes fit.
///
/// `align(max(needed, old * factor))` where factor is 2.0 below 256 KiB,
/// 1.5 below 8 MiB and 1.25 above. Once that would pass the 128 MiB
/// ceiling, only `align(needed)` is allocated.
pub fn growth_capacity(old: u64, needed: u64, alignment: u64) -> u64 {
    let grown = if old < FAST_GROWTH_LIMIT {
        old.saturating_mul(2)
    } else if old < MEDIUM_GROWTH_LIMIT {
        old.saturating_add(old / 2)
    } else {
        old.saturating_add(old / 4)
    };
    let candidate = align_up(needed.max(grown), alignment);
    if candidate > GROWTH_CEILING {
        align_up(needed, alignment)
    } else {
        candidate
    }
}

pub struct GrowableBuffer {
    ctx: GpuContext,
    role: BufferRole,
    label: String,
    raw: Arc<dyn RawBuffer>,
    cursor: u64,
    grow_count: u32,
}

impl std::fmt::Debug for GrowableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowableBuffer")
            .field("label", &self.label)
            .field("role", &self.role)
            .field("capacity", &self.capacity())
            .field("cursor", &self.cursor)
            .field("grow_count", &self.grow_count)
            .finish()
    }
}

impl GrowableBuffer {
    pub fn new(
        ctx: &GpuContext,
        role: BufferRole,
        label: impl Into<String>,
        initial_capacity: u64,
    ) -> Result<Self, GpuError> {
        let label = label.into();
        let capacity = align_up(initial_capacity.max(role.alignment()), role.alignment());
        let raw = ctx.device.create_buffer(&BufferDesc {
            label: format!("{} ({})", label, role.label()),
            size: capacity,
            usage: BufferUsage::Upload,
        })?;
        Ok(Self {
            ctx: ctx.clone(),
            role,
            label,
            raw,
            cursor: 0,
            grow_count: 0,
        })
    }

    /// Append `bytes` at the next aligned offset and return that offset
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64, GpuError> {
        let offset = align_up(self.cursor, self.role.alignment());
        let end = offset + bytes.len() as u64;
        if end > self.capacity() {
            self.grow(end)?;
        }
        if !bytes.is_empty() {
            self.raw.write(offset, bytes);
        }
        self.cursor = end;
        Ok(offset)
    }

    pub fn append_pod<T: bytemuck::Pod>(&mut self, items: &[T]) -> Result<u64, GpuError> {
        self.append(bytemuck::cast_slice(items))
    }

    /// Reset the cursor; the allocation is kept for reuse
    pub fn clear(&mut self) {
        self.cursor = 0;
    }

    pub fn len(&self) -> u64 {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    pub fn capacity(&self) -> u64 {
        self.raw.size()
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn grow_count(&self) -> u32 {
        self.grow_count
    }

    /// Base address of the current allocation; stale after any grow
    pub fn gpu_address(&self) -> u64 {
        self.raw.gpu_address()
    }

    pub fn raw(&self) -> &Arc<dyn RawBuffer> {
        &self.raw
    }

    /// Host copy of the valid prefix
    pub fn bytes(&self) -> Result<Vec<u8>, GpuError> {
        self.raw.read(0, self.cursor as usize)
    }

    fn grow(&mut self, needed: u64) -> Result<(), GpuError> {
        let old_capacity = self.capacity();
        let new_capacity = growth_capacity(old_capacity, needed, self.role.alignment());
        let limit = self.ctx.device.max_buffer_size();
        if new_capacity > limit {
            return Err(GpuError::BufferTooLarge {
                requested: new_capacity,
                limit,
            });
        }

        let snapshot = self.bytes()?;
        let replacement = self.ctx.device.create_buffer(&BufferDesc {
            label: format!("{} ({})", self.label, self.role.label()),
            size: new_capacity,
            usage: BufferUsage::Upload,
        })?;
        let old = std::mem::replace(&mut self.raw, replacement);
        let tag = self.ctx.retire(old);
        if !snapshot.is_empty() {
            self.raw.write(0, &snapshot);
        }
        self.grow_count += 1;

        if new_capacity >= MEDIUM_GROWTH_LIMIT {
            info!(
                "📈 '{}' {} buffer grew {} -> {} bytes (old freed after {})",
                self.label,
                self.role.label(),
                old_capacity,
                new_capacity,
                tag
            );
        } else {
            debug!(
                "'{}' {} buffer grew {} -> {} bytes (old freed after {})",
                self.label,
                self.role.label(),
                old_capacity,
                new_capacity,
                tag
            );
        }
        Ok(())
    }
}
