//! UI thread to render thread plumbing
//!
//! The window system posts [`WindowMessage`]s on a bounded channel and bumps
//! a counting [`RenderSignal`]. The render thread is the only consumer. The
//! sending half is deliberately not `Clone`, so there is exactly one producer.

use crate::gpu::NativeSurface;
use crate::window::{WindowGeometry, WindowHooks, WindowId, WindowOptions};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Events from the native window system
pub enum WindowMessage {
    Created {
        id: WindowId,
        surface: NativeSurface,
        geometry: WindowGeometry,
        options: WindowOptions,
        hooks: WindowHooks,
    },
    Closed(WindowId),
    Resized {
        id: WindowId,
        width: u32,
        height: u32,
    },
    MinimizedChanged {
        id: WindowId,
        minimized: bool,
    },
    GeometryChanged {
        id: WindowId,
        geometry: WindowGeometry,
    },
}

impl WindowMessage {
    pub fn window(&self) -> WindowId {
        match self {
            WindowMessage::Created { id, .. }
            | WindowMessage::Resized { id, .. }
            | WindowMessage::MinimizedChanged { id, .. }
            | WindowMessage::GeometryChanged { id, .. } => *id,
            WindowMessage::Closed(id) => *id,
        }
    }
}

impl fmt::Debug for WindowMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowMessage::Created { id, geometry, .. } => {
                write!(f, "Created({}, {:?})", id, geometry)
            }
            WindowMessage::Closed(id) => write!(f, "Closed({})", id),
            WindowMessage::Resized { id, width, height } => {
                write!(f, "Resized({}, {}x{})", id, width, height)
            }
            WindowMessage::MinimizedChanged { id, minimized } => {
                write!(f, "MinimizedChanged({}, {})", id, minimized)
            }
            WindowMessage::GeometryChanged { id, geometry } => {
                write!(f, "GeometryChanged({}, {:?})", id, geometry)
            }
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("render thread has shut down")]
pub struct RenderThreadGone;

/// The single producer half of the window message queue
pub struct WindowEventSender {
    tx: Sender<WindowMessage>,
}

impl WindowEventSender {
    /// Post a message, blocking while the queue is full
    pub fn send(&self, message: WindowMessage) -> Result<(), RenderThreadGone> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                log::debug!("window queue full, waiting for the render thread");
                self.tx.send(message).map_err(|_| RenderThreadGone)
            }
            Err(TrySendError::Disconnected(_)) => Err(RenderThreadGone),
        }
    }
}

pub struct WindowEventReceiver {
    rx: Receiver<WindowMessage>,
}

impl WindowEventReceiver {
    /// Everything queued right now, without blocking
    pub fn drain(&self) -> impl Iterator<Item = WindowMessage> + '_ {
        self.rx.try_iter()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Bounded queue of window messages
pub fn window_channel(capacity: usize) -> (WindowEventSender, WindowEventReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (WindowEventSender { tx }, WindowEventReceiver { rx })
}

/// Why the render thread woke up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Coalesced render requests since the last wake
    Render(u64),
    Shutdown,
}

#[derive(Debug, Default)]
struct SignalState {
    pending: u64,
    shutdown: bool,
}

/// Counting wake-up signal for the render thread.
///
/// Requests coalesce: one wake covers every request made since the previous
/// one, and the loop drains all pending work on each wake.
#[derive(Debug, Default)]
pub struct RenderSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl RenderSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.state.lock().pending += 1;
        self.cond.notify_one();
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Block until there is a request or shutdown
    pub fn wait(&self) -> Wake {
        let mut state = self.state.lock();
        while state.pending == 0 && !state.shutdown {
            self.cond.wait(&mut state);
        }
        Self::take(&mut state)
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Wake> {
        let mut state = self.state.lock();
        if state.pending == 0 && !state.shutdown {
            self.cond.wait_for(&mut state, timeout);
        }
        if state.pending == 0 && !state.shutdown {
            return None;
        }
        Some(Self::take(&mut state))
    }

    fn take(state: &mut SignalState) -> Wake {
        if state.shutdown {
            Wake::Shutdown
        } else {
            Wake::Render(std::mem::take(&mut state.pending))
        }
    }
}
