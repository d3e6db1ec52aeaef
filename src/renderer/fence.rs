//! Fence clock
//!
//! A monotonically increasing counter paired with the backend's GPU
//! timeline. It is the single source of truth for "has the GPU finished
//! everything submitted up to point N": the renderer signals once per frame,
//! resources superseded during a frame are tagged with the value that frame
//! will signal, and the deferred reclaimer frees them once
//! [`FenceClock::completed_value`] has caught up.

use crate::error::GpuError;
use crate::gpu::RawTimeline;
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Completed value a timeline reports once the device is gone
pub const DEVICE_LOST_SENTINEL: u64 = u64::MAX;

/// How often a blocked wait re-checks for device loss
const LOST_DEVICE_POLL: Duration = Duration::from_millis(50);

/// Point on the GPU timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FenceValue(pub u64);

impl FenceValue {
    pub const ZERO: FenceValue = FenceValue(0);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> FenceValue {
        FenceValue(self.0 + 1)
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One-shot event set from a completion callback
#[derive(Default)]
struct WaitEvent {
    set: Mutex<bool>,
    cond: Condvar,
}

impl WaitEvent {
    fn set(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }
}

pub struct FenceClock {
    timeline: Arc<dyn RawTimeline>,
    last_signaled: AtomicU64,
}

impl fmt::Debug for FenceClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceClock")
            .field("last_signaled", &self.last_signaled())
            .field("completed", &self.timeline.completed())
            .finish()
    }
}

impl FenceClock {
    pub fn new(timeline: Arc<dyn RawTimeline>) -> Self {
        Self {
            timeline,
            last_signaled: AtomicU64::new(0),
        }
    }

    /// Advance the counter and signal it after all submitted work
    pub fn signal(&self) -> Result<FenceValue, GpuError> {
        let value = self.last_signaled.load(Ordering::SeqCst) + 1;
        self.timeline.signal(value)?;
        self.last_signaled.store(value, Ordering::SeqCst);
        trace!("fence signaled {}", value);
        Ok(FenceValue(value))
    }

    pub fn last_signaled(&self) -> FenceValue {
        FenceValue(self.last_signaled.load(Ordering::SeqCst))
    }

    /// Value the frame currently being recorded will signal.
    ///
    /// Anything superseded while recording may still be read by this frame's
    /// commands, so it is tagged with this value rather than the last one.
    pub fn pending_value(&self) -> FenceValue {
        self.last_signaled().next()
    }

    /// How far the GPU has progressed.
    ///
    /// A device-lost sentinel is reported as [`GpuError::DeviceLost`].
    pub fn completed_value(&self) -> Result<FenceValue, GpuError> {
        match self.timeline.completed() {
            DEVICE_LOST_SENTINEL => Err(GpuError::DeviceLost),
            value => Ok(FenceValue(value)),
        }
    }

    pub fn is_reached(&self, value: FenceValue) -> Result<bool, GpuError> {
        Ok(self.completed_value()? >= value)
    }

    /// Block the calling thread until the GPU reaches `value`
    pub fn wait_until(&self, value: FenceValue) -> Result<(), GpuError> {
        if self.is_reached(value)? {
            return Ok(());
        }
        debug_assert!(
            value <= self.last_signaled(),
            "waiting on {} which was never signaled",
            value
        );

        let event = Arc::new(WaitEvent::default());
        let armed = event.clone();
        self.timeline
            .on_completion(value.0, Box::new(move || armed.set()));

        let mut set = event.set.lock();
        while !*set {
            if event.cond.wait_for(&mut set, LOST_DEVICE_POLL).timed_out() {
                // The callback never fires on a removed device
                self.completed_value()?;
            }
        }
        Ok(())
    }

    /// Stall until everything signaled so far has completed
    pub fn wait_idle(&self) -> Result<(), GpuError> {
        self.wait_until(self.last_signaled())
    }

    /// Run `callback` once `value` is reached, immediately if it already is
    pub fn on_reached(&self, value: FenceValue, callback: impl FnOnce() + Send + 'static) {
        self.timeline.on_completion(value.0, Box::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessTimeline;
    use std::sync::atomic::AtomicBool;

    fn manual_clock() -> (Arc<HeadlessTimeline>, FenceClock) {
        let timeline = Arc::new(HeadlessTimeline::manual());
        let clock = FenceClock::new(timeline.clone());
        (timeline, clock)
    }

    #[test]
    fn test_signal_is_monotonic() {
        let (_, clock) = manual_clock();
        assert_eq!(clock.last_signaled(), FenceValue::ZERO);
        assert_eq!(clock.pending_value(), FenceValue(1));
        let a = clock.signal().unwrap();
        let b = clock.signal().unwrap();
        assert!(b > a);
        assert_eq!(clock.pending_value(), FenceValue(3));
    }

    #[test]
    fn test_completed_value_follows_timeline() {
        let (timeline, clock) = manual_clock();
        clock.signal().unwrap();
        clock.signal().unwrap();
        assert_eq!(clock.completed_value().unwrap(), FenceValue(0));
        timeline.complete_through(1);
        assert_eq!(clock.completed_value().unwrap(), FenceValue(1));
        assert!(clock.is_reached(FenceValue(1)).unwrap());
        assert!(!clock.is_reached(FenceValue(2)).unwrap());
    }

    #[test]
    fn test_device_lost_is_an_error() {
        let (timeline, clock) = manual_clock();
        timeline.lose_device();
        assert!(matches!(clock.completed_value(), Err(GpuError::DeviceLost)));
        assert!(matches!(clock.signal(), Err(GpuError::DeviceLost)));
    }

    #[test]
    fn test_wait_until_blocks_until_completion() {
        let (timeline, clock) = manual_clock();
        let value = clock.signal().unwrap();

        let finisher = {
            let timeline = timeline.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                timeline.complete_all();
            })
        };
        clock.wait_until(value).unwrap();
        assert!(clock.is_reached(value).unwrap());
        finisher.join().unwrap();
    }

    #[test]
    fn test_wait_until_reports_device_loss() {
        let (timeline, clock) = manual_clock();
        let value = clock.signal().unwrap();
        let loser = {
            let timeline = timeline.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                timeline.lose_device();
            })
        };
        assert!(matches!(clock.wait_until(value), Err(GpuError::DeviceLost)));
        loser.join().unwrap();
    }

    #[test]
    fn test_on_reached_fires_once_value_passes() {
        let (timeline, clock) = manual_clock();
        let value = clock.signal().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        clock.on_reached(value, move || flag.store(true, Ordering::SeqCst));
        assert!(!fired.load(Ordering::SeqCst));
        timeline.complete_all();
        assert!(fired.load(Ordering::SeqCst));
    }
}
