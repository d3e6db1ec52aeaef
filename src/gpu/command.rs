//! Backend-neutral command recording
//!
//! Window resources and images record into a [`CommandList`]; the device
//! interprets it on [`GpuDevice::submit`](super::GpuDevice::submit). Commands
//! hold their resources by `Arc`, so a list keeps everything it references
//! alive until the device has consumed it.

use super::{RawBuffer, RawDescriptorHeap, RawImage, Rect, ResourceState};
use std::fmt;
use std::sync::Arc;

/// One indexed draw, relative to the bound vertex/index/property buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    pub first_index: u32,
    pub index_count: u32,
    pub base_vertex: i32,
    /// Byte offset of this draw's shape properties (256-byte aligned)
    pub property_offset: u64,
}

pub enum Command {
    /// Resource barrier between two states
    Transition {
        image: Arc<dyn RawImage>,
        before: ResourceState,
        after: ResourceState,
    },
    BindDescriptorHeaps {
        heaps: Vec<Arc<dyn RawDescriptorHeap>>,
    },
    BeginPass {
        target: Arc<dyn RawImage>,
        clear: Option<[f32; 4]>,
    },
    SetVertexBuffer {
        buffer: Arc<dyn RawBuffer>,
        address: u64,
        size: u64,
        stride: u32,
    },
    SetIndexBuffer {
        buffer: Arc<dyn RawBuffer>,
        address: u64,
        size: u64,
    },
    SetShapeProperties {
        buffer: Arc<dyn RawBuffer>,
        address: u64,
    },
    Draw(DrawCall),
    EndPass,
    ClearStorage {
        image: Arc<dyn RawImage>,
        value: [u32; 4],
    },
    CopyImageToBuffer {
        image: Arc<dyn RawImage>,
        rect: Rect,
        buffer: Arc<dyn RawBuffer>,
        row_pitch: u32,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Transition { .. } => "transition",
            Command::BindDescriptorHeaps { .. } => "bind_descriptor_heaps",
            Command::BeginPass { .. } => "begin_pass",
            Command::SetVertexBuffer { .. } => "set_vertex_buffer",
            Command::SetIndexBuffer { .. } => "set_index_buffer",
            Command::SetShapeProperties { .. } => "set_shape_properties",
            Command::Draw(_) => "draw",
            Command::EndPass => "end_pass",
            Command::ClearStorage { .. } => "clear_storage",
            Command::CopyImageToBuffer { .. } => "copy_image_to_buffer",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Transition {
                image,
                before,
                after,
            } => write!(f, "Transition({} {:?} -> {:?})", image.desc().label, before, after),
            Command::Draw(call) => write!(f, "Draw({:?})", call),
            Command::SetVertexBuffer { address, size, .. } => {
                write!(f, "SetVertexBuffer({:#x}, {} bytes)", address, size)
            }
            Command::SetIndexBuffer { address, size, .. } => {
                write!(f, "SetIndexBuffer({:#x}, {} bytes)", address, size)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// An ordered list of commands for one submission
#[derive(Debug, Default)]
pub struct CommandList {
    label: String,
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            commands: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Number of transition barriers recorded so far
    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Transition { .. }))
            .count()
    }

    /// Hand the recorded commands over for submission, leaving the list empty
    pub fn take(&mut self) -> CommandList {
        CommandList {
            label: self.label.clone(),
            commands: std::mem::take(&mut self.commands),
        }
    }
}
