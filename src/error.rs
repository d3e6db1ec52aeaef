//! GPU error taxonomy
//!
//! Every failure a GPU API can report is treated as fatal. Core functions
//! return [`GpuError`] so the render thread can log the failure with context
//! at the call site and terminate the process through [`fatal`]. Contract
//! violations (using a released descriptor slot, clearing a non-storage
//! image) are `debug_assert!`s instead, and the only transient condition, a
//! readback that has not completed yet, is an `Option`, not an error.

use crate::gpu::HeapKind;
use log::error;
use thiserror::Error;

/// Failures reported by the GPU backend or by the lifecycle core
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no suitable GPU adapter found")]
    NoAdapter,

    #[error("device creation failed: {0}")]
    DeviceCreation(String),

    #[error("GPU device was removed or lost")]
    DeviceLost,

    #[error("failed to create {what} ({detail})")]
    ResourceCreation { what: &'static str, detail: String },

    #[error("command submission failed: {0}")]
    Submit(String),

    #[error("present failed: {0}")]
    Present(String),

    #[error("swapchain operation failed: {0}")]
    Swapchain(String),

    #[error("descriptor heap kind {kind:?} cannot be created with {requested} slots")]
    HeapMisconfigured { kind: HeapKind, requested: u32 },

    #[error("descriptor heap {kind:?} exhausted its maximum of {max} slots")]
    SlotsExhausted { kind: HeapKind, max: u32 },

    #[error("buffer allocation of {requested} bytes exceeds the device limit of {limit} bytes")]
    BufferTooLarge { requested: u64, limit: u64 },
}

impl GpuError {
    /// Shorthand for resource creation failures
    pub fn creation(what: &'static str, detail: impl Into<String>) -> Self {
        Self::ResourceCreation {
            what,
            detail: detail.into(),
        }
    }
}

/// Log a fatal GPU error and terminate the process.
///
/// There is no recovery path for a lost device or a failed submission: the
/// command-list state after such a failure is undefined.
pub fn fatal(context: &str, err: &GpuError) -> ! {
    error!("💥 fatal GPU error while {}: {}", context, err);
    log::logger().flush();
    std::process::abort()
}
