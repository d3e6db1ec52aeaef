//! Deferred resource reclamation
//!
//! Resources superseded while the GPU may still read them are not dropped in
//! place. Their owner moves them into a closure and queues it here, gated
//! either on a fence value or on an arbitrary predicate. The render loop
//! calls [`DeferredReclaimer::drain`] once per frame with the completed fence
//! value; every ready closure runs exactly once and is removed.

use super::fence::FenceValue;
use log::{debug, trace};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type Cleanup = Box<dyn FnOnce() + Send>;

/// When a queued cleanup may run
pub enum Readiness {
    /// Once the GPU has completed this fence value
    Tag(FenceValue),
    /// Whenever the predicate returns true
    Predicate(Box<dyn Fn() -> bool + Send>),
}

impl Readiness {
    pub fn predicate(check: impl Fn() -> bool + Send + 'static) -> Self {
        Readiness::Predicate(Box::new(check))
    }

    fn is_ready(&self, completed: FenceValue) -> bool {
        match self {
            Readiness::Tag(tag) => completed >= *tag,
            Readiness::Predicate(check) => check(),
        }
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Tag(tag) => write!(f, "Tag({})", tag),
            Readiness::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<FenceValue> for Readiness {
    fn from(tag: FenceValue) -> Self {
        Readiness::Tag(tag)
    }
}

struct Entry {
    readiness: Readiness,
    cleanup: Cleanup,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Entries ever queued
    pub queued: u64,
    /// Entries whose cleanup has run
    pub reclaimed: u64,
    /// Entries still waiting
    pub pending: usize,
}

#[derive(Default)]
struct Queue {
    entries: Vec<Entry>,
    queued: u64,
    reclaimed: u64,
}

/// Cheaply cloneable handle to the shared reclaim queue
#[derive(Clone, Default)]
pub struct DeferredReclaimer {
    queue: Arc<Mutex<Queue>>,
}

impl fmt::Debug for DeferredReclaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredReclaimer")
            .field("stats", &self.stats())
            .finish()
    }
}

impl DeferredReclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `cleanup` to run once `readiness` holds
    pub fn defer(&self, readiness: impl Into<Readiness>, cleanup: impl FnOnce() + Send + 'static) {
        let readiness = readiness.into();
        trace!("deferring cleanup until {:?}", readiness);
        let mut queue = self.queue.lock();
        queue.entries.push(Entry {
            readiness,
            cleanup: Box::new(cleanup),
        });
        queue.queued += 1;
    }

    /// Run every entry that is ready at `completed`; returns how many ran.
    ///
    /// Ready closures are taken out of the queue before they run, so a
    /// cleanup may itself queue further work.
    pub fn drain(&self, completed: FenceValue) -> usize {
        let ready: Vec<Cleanup> = {
            let mut queue = self.queue.lock();
            let (ready, pending): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut queue.entries)
                .into_iter()
                .partition(|entry| entry.readiness.is_ready(completed));
            queue.entries = pending;
            queue.reclaimed += ready.len() as u64;
            ready.into_iter().map(|entry| entry.cleanup).collect()
        };
        let count = ready.len();
        for cleanup in ready {
            cleanup();
        }
        if count > 0 {
            debug!("♻️ reclaimed {} deferred resources at {}", count, completed);
        }
        count
    }

    /// Run everything regardless of readiness.
    ///
    /// Only valid once the GPU is fully drained (shutdown).
    pub fn drain_all(&self) -> usize {
        let mut total = 0;
        loop {
            let entries = {
                let mut queue = self.queue.lock();
                let entries = std::mem::take(&mut queue.entries);
                queue.reclaimed += entries.len() as u64;
                entries
            };
            if entries.is_empty() {
                return total;
            }
            total += entries.len();
            for entry in entries {
                (entry.cleanup)();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ReclaimStats {
        let queue = self.queue.lock();
        ReclaimStats {
            queued: queue.queued,
            reclaimed: queue.reclaimed,
            pending: queue.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        let make = move || {
            let handle = handle.clone();
            Box::new(move || {
                handle.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>
        };
        (count, make)
    }

    #[test]
    fn test_tagged_entries_wait_for_their_fence() {
        let reclaimer = DeferredReclaimer::new();
        let (ran, make) = counter();
        reclaimer.defer(FenceValue(5), make());
        reclaimer.defer(FenceValue(7), make());

        assert_eq!(reclaimer.drain(FenceValue(4)), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        assert_eq!(reclaimer.drain(FenceValue(5)), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(reclaimer.len(), 1);

        assert_eq!(reclaimer.drain(FenceValue(10)), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(reclaimer.is_empty());
    }

    #[test]
    fn test_entries_run_exactly_once() {
        let reclaimer = DeferredReclaimer::new();
        let (ran, make) = counter();
        reclaimer.defer(FenceValue(1), make());
        reclaimer.drain(FenceValue(3));
        reclaimer.drain(FenceValue(3));
        reclaimer.drain_all();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_predicate_readiness() {
        let reclaimer = DeferredReclaimer::new();
        let gate = Arc::new(AtomicBool::new(false));
        let (ran, make) = counter();
        let check = gate.clone();
        reclaimer.defer(
            Readiness::predicate(move || check.load(Ordering::SeqCst)),
            make(),
        );

        reclaimer.drain(FenceValue(100));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        gate.store(true, Ordering::SeqCst);
        reclaimer.drain(FenceValue(0));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_may_defer_more_work() {
        let reclaimer = DeferredReclaimer::new();
        let (ran, make) = counter();
        let inner = reclaimer.clone();
        let follow_up = make();
        reclaimer.defer(FenceValue(1), move || inner.defer(FenceValue(2), follow_up));

        reclaimer.drain(FenceValue(1));
        assert_eq!(reclaimer.len(), 1);
        reclaimer.drain(FenceValue(2));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drain_all_and_stats() {
        let reclaimer = DeferredReclaimer::new();
        let (ran, make) = counter();
        for tag in 1..=4 {
            reclaimer.defer(FenceValue(tag), make());
        }
        reclaimer.drain(FenceValue(2));
        assert_eq!(
            reclaimer.stats(),
            ReclaimStats {
                queued: 4,
                reclaimed: 2,
                pending: 2
            }
        );
        assert_eq!(reclaimer.drain_all(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert_eq!(reclaimer.stats().pending, 0);
    }

    #[test]
    fn test_clones_share_one_queue() {
        let reclaimer = DeferredReclaimer::new();
        let other = reclaimer.clone();
        other.defer(FenceValue(1), || {});
        assert_eq!(reclaimer.len(), 1);
    }
}
