//! Descriptor slot pool
//!
//! One fixed-size descriptor heap per [`HeapKind`], handed out slot by slot.
//! Handles are stable: a slot index never moves while the handle is live.
//! When a heap runs out of free slots its capacity doubles:
//!
//! 1. the old heap is handed to the deferred reclaimer (in-flight command
//!    lists may still reference it)
//! 2. a new heap of twice the capacity is created
//! 3. every live handle's recreate function rewrites its view into the new
//!    heap at the same slot index
//!
//! Released slots are reusable at once; the generation counter catches use
//! of a handle after release in debug builds.

use super::fence::FenceClock;
use super::reclaim::DeferredReclaimer;
use crate::error::GpuError;
use crate::gpu::{GpuDevice, HeapKind, RawDescriptorHeap};
use log::{debug, info};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Rewrites a handle's descriptor into `heap` at `slot`
pub type RecreateFn =
    Box<dyn FnMut(&Arc<dyn RawDescriptorHeap>, u32) -> Result<(), GpuError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle {
    kind: HeapKind,
    slot: u32,
    generation: u32,
}

impl DescriptorHandle {
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub kind: HeapKind,
    pub live: u32,
    pub capacity: u32,
    pub growths: u32,
}

struct Slot {
    generation: u32,
    /// `Some` while the slot is allocated
    recreate: Option<RecreateFn>,
}

struct KindPool {
    kind: HeapKind,
    heap: Arc<dyn RawDescriptorHeap>,
    slots: Vec<Slot>,
    /// Free slot indices, lowest on top
    free: Vec<u32>,
    growths: u32,
}

impl KindPool {
    fn live(&self) -> u32 {
        self.slots.iter().filter(|s| s.recreate.is_some()).count() as u32
    }

    fn push_free_range(&mut self, from: u32, to: u32) {
        self.free.extend((from..to).rev());
        self.slots.extend((from..to).map(|_| Slot {
            generation: 0,
            recreate: None,
        }));
    }

    fn check(&self, handle: &DescriptorHandle) -> bool {
        self.slots
            .get(handle.slot as usize)
            .map(|slot| slot.generation == handle.generation && slot.recreate.is_some())
            .unwrap_or(false)
    }
}

struct PoolInner {
    kinds: Vec<KindPool>,
}

/// Cloneable handle to the process-wide descriptor pool
#[derive(Clone)]
pub struct DescriptorPool {
    inner: Arc<Mutex<PoolInner>>,
    device: Arc<dyn GpuDevice>,
    clock: Arc<FenceClock>,
    reclaimer: DeferredReclaimer,
}

impl fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats: Vec<PoolStats> = HeapKind::ALL.iter().map(|k| self.stats(*k)).collect();
        f.debug_struct("DescriptorPool").field("stats", &stats).finish()
    }
}

impl DescriptorPool {
    /// Create one heap per kind; `initial_capacity` is indexed by
    /// [`HeapKind::index`]
    pub fn new(
        device: Arc<dyn GpuDevice>,
        clock: Arc<FenceClock>,
        reclaimer: DeferredReclaimer,
        initial_capacity: [u32; 3],
    ) -> Result<Self, GpuError> {
        let mut kinds = Vec::with_capacity(HeapKind::ALL.len());
        for kind in HeapKind::ALL {
            let capacity = initial_capacity[kind.index()];
            if capacity == 0 || capacity > kind.layout().max_slots {
                return Err(GpuError::HeapMisconfigured {
                    kind,
                    requested: capacity,
                });
            }
            let heap = device.create_descriptor_heap(kind, capacity)?;
            let mut pool = KindPool {
                kind,
                heap,
                slots: Vec::with_capacity(capacity as usize),
                free: Vec::with_capacity(capacity as usize),
                growths: 0,
            };
            pool.push_free_range(0, capacity);
            kinds.push(pool);
        }
        debug!("descriptor pool ready: {:?}", initial_capacity);
        Ok(Self {
            inner: Arc::new(Mutex::new(PoolInner { kinds })),
            device,
            clock,
            reclaimer,
        })
    }

    /// Allocate a slot and write its descriptor through `recreate`.
    ///
    /// Never fails for lack of capacity below the kind's slot ceiling: the
    /// heap grows instead, and `recreate` is kept to rewrite the view after
    /// every future growth.
    pub fn pop_handle(
        &self,
        kind: HeapKind,
        mut recreate: RecreateFn,
    ) -> Result<DescriptorHandle, GpuError> {
        let mut inner = self.inner.lock();
        let pool = &mut inner.kinds[kind.index()];
        if pool.free.is_empty() {
            self.grow(pool)?;
        }
        let Some(slot) = pool.free.pop() else {
            return Err(GpuError::SlotsExhausted {
                kind,
                max: kind.layout().max_slots,
            });
        };
        if let Err(err) = recreate(&pool.heap, slot) {
            pool.free.push(slot);
            return Err(err);
        }
        let entry = &mut pool.slots[slot as usize];
        entry.recreate = Some(recreate);
        Ok(DescriptorHandle {
            kind,
            slot,
            generation: entry.generation,
        })
    }

    /// Return a slot to the free list; it is reusable immediately
    pub fn release(&self, handle: DescriptorHandle) {
        let mut inner = self.inner.lock();
        let pool = &mut inner.kinds[handle.kind.index()];
        debug_assert!(pool.check(&handle), "double release of {:?}", handle);
        let Some(slot) = pool.slots.get_mut(handle.slot as usize) else {
            return;
        };
        if slot.generation != handle.generation {
            return;
        }
        slot.recreate = None;
        slot.generation = slot.generation.wrapping_add(1);
        pool.free.push(handle.slot);
    }

    pub fn is_live(&self, handle: &DescriptorHandle) -> bool {
        self.inner.lock().kinds[handle.kind.index()].check(handle)
    }

    /// CPU-side descriptor address of a live handle
    pub fn cpu_handle(&self, handle: &DescriptorHandle) -> u64 {
        let inner = self.inner.lock();
        let pool = &inner.kinds[handle.kind.index()];
        debug_assert!(pool.check(handle), "cpu_handle on released {:?}", handle);
        pool.heap.cpu_base() + handle.slot as u64 * handle.kind.layout().descriptor_size
    }

    /// GPU-side descriptor address; only shader-visible heaps have one
    pub fn gpu_handle(&self, handle: &DescriptorHandle) -> Option<u64> {
        let inner = self.inner.lock();
        let pool = &inner.kinds[handle.kind.index()];
        debug_assert!(pool.check(handle), "gpu_handle on released {:?}", handle);
        pool.heap
            .gpu_base()
            .map(|base| base + handle.slot as u64 * handle.kind.layout().descriptor_size)
    }

    /// The heap currently backing `kind`
    pub fn heap(&self, kind: HeapKind) -> Arc<dyn RawDescriptorHeap> {
        self.inner.lock().kinds[kind.index()].heap.clone()
    }

    /// Shader-visible heaps to bind at the start of a command list
    pub fn shader_visible_heaps(&self) -> Vec<Arc<dyn RawDescriptorHeap>> {
        let inner = self.inner.lock();
        inner
            .kinds
            .iter()
            .filter(|pool| pool.kind.layout().shader_visible)
            .map(|pool| pool.heap.clone())
            .collect()
    }

    pub fn stats(&self, kind: HeapKind) -> PoolStats {
        let inner = self.inner.lock();
        let pool = &inner.kinds[kind.index()];
        PoolStats {
            kind,
            live: pool.live(),
            capacity: pool.heap.capacity(),
            growths: pool.growths,
        }
    }

    fn grow(&self, pool: &mut KindPool) -> Result<(), GpuError> {
        let kind = pool.kind;
        let max = kind.layout().max_slots;
        let old_capacity = pool.heap.capacity();
        if old_capacity >= max {
            return Err(GpuError::SlotsExhausted { kind, max });
        }
        let new_capacity = old_capacity.saturating_mul(2).min(max);

        let new_heap = self.device.create_descriptor_heap(kind, new_capacity)?;
        let old_heap = std::mem::replace(&mut pool.heap, new_heap);
        self.reclaimer
            .defer(self.clock.pending_value(), move || drop(old_heap));

        for (index, slot) in pool.slots.iter_mut().enumerate() {
            if let Some(recreate) = slot.recreate.as_mut() {
                recreate(&pool.heap, index as u32)?;
            }
        }
        pool.push_free_range(old_capacity, new_capacity);
        pool.growths += 1;
        info!(
            "📈 {:?} descriptor heap grew {} -> {} slots",
            kind, old_capacity, new_capacity
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{HeadlessDevice, HeadlessHeap};
    use crate::gpu::{ImageDesc, ImageFormat, ImageKind, RawImage};
    use crate::renderer::fence::FenceValue;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        device: Arc<HeadlessDevice>,
        clock: Arc<FenceClock>,
        reclaimer: DeferredReclaimer,
        pool: DescriptorPool,
    }

    fn fixture(capacity: u32) -> Fixture {
        let device = Arc::new(HeadlessDevice::new());
        let clock = Arc::new(FenceClock::new(device.timeline().clone()));
        let reclaimer = DeferredReclaimer::new();
        let pool = DescriptorPool::new(
            device.clone(),
            clock.clone(),
            reclaimer.clone(),
            [capacity; 3],
        )
        .unwrap();
        Fixture {
            device,
            clock,
            reclaimer,
            pool,
        }
    }

    fn counting_recreate(calls: &Arc<AtomicU32>) -> RecreateFn {
        let calls = calls.clone();
        Box::new(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn noop() -> RecreateFn {
        Box::new(|_, _| Ok(()))
    }

    #[test]
    fn test_released_slot_is_reused() {
        let f = fixture(4);
        let a = f.pool.pop_handle(HeapKind::ShaderResource, noop()).unwrap();
        let b = f.pool.pop_handle(HeapKind::ShaderResource, noop()).unwrap();
        assert_ne!(a.slot(), b.slot());

        f.pool.release(a);
        assert!(!f.pool.is_live(&a));
        let c = f.pool.pop_handle(HeapKind::ShaderResource, noop()).unwrap();
        assert_eq!(c.slot(), a.slot());
        assert_ne!(c, a, "generation must change on reuse");
        assert_eq!(f.pool.stats(HeapKind::ShaderResource).live, 2);
    }

    #[test]
    fn test_slot_indices_unique_among_live_handles() {
        let f = fixture(8);
        let handles: Vec<_> = (0..8)
            .map(|_| f.pool.pop_handle(HeapKind::RenderTarget, noop()).unwrap())
            .collect();
        let mut slots: Vec<u32> = handles.iter().map(|h| h.slot()).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 8);
    }

    #[test]
    fn test_growth_recreates_each_live_handle_exactly_once() {
        let f = fixture(2);
        let calls: Vec<Arc<AtomicU32>> = (0..2).map(|_| Arc::new(AtomicU32::new(0))).collect();
        let live: Vec<_> = calls
            .iter()
            .map(|c| {
                f.pool
                    .pop_handle(HeapKind::ShaderResource, counting_recreate(c))
                    .unwrap()
            })
            .collect();
        let before = f.pool.cpu_handle(&live[0]);
        let old_base = f.pool.heap(HeapKind::ShaderResource).cpu_base();

        let third_calls = Arc::new(AtomicU32::new(0));
        let third = f
            .pool
            .pop_handle(HeapKind::ShaderResource, counting_recreate(&third_calls))
            .unwrap();

        // one initial write plus one rewrite into the grown heap
        for c in &calls {
            assert_eq!(c.load(Ordering::SeqCst), 2);
        }
        assert_eq!(third_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.slot(), 2);

        let stats = f.pool.stats(HeapKind::ShaderResource);
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.growths, 1);

        let new_base = f.pool.heap(HeapKind::ShaderResource).cpu_base();
        assert_ne!(old_base, new_base);
        assert_ne!(before, f.pool.cpu_handle(&live[0]));
        assert_eq!(f.pool.cpu_handle(&live[0]), new_base);
    }

    #[test]
    fn test_old_heap_freed_only_after_fence() {
        let f = fixture(1);
        let baseline = f.device.live_objects().heaps;
        let _a = f.pool.pop_handle(HeapKind::DepthStencil, noop()).unwrap();
        let _b = f.pool.pop_handle(HeapKind::DepthStencil, noop()).unwrap();
        assert_eq!(f.device.live_objects().heaps, baseline + 1);
        assert_eq!(f.reclaimer.len(), 1);

        let tag = f.clock.signal().unwrap();
        f.reclaimer.drain(f.clock.completed_value().unwrap());
        assert_eq!(f.device.live_objects().heaps, baseline + 1);

        f.device.timeline().complete_through(tag.get());
        f.reclaimer.drain(f.clock.completed_value().unwrap());
        assert_eq!(f.device.live_objects().heaps, baseline);
        assert!(f.clock.is_reached(FenceValue(1)).unwrap());
    }

    #[test]
    fn test_recreate_writes_image_views() {
        let f = fixture(1);
        let image = f
            .device
            .create_image(&ImageDesc {
                label: "view".into(),
                kind: ImageKind::Sampled,
                format: ImageFormat::Rgba8Unorm,
                width: 4,
                height: 4,
            })
            .unwrap();
        let view: Arc<dyn RawImage> = image.clone();
        let handle = f
            .pool
            .pop_handle(
                HeapKind::ShaderResource,
                Box::new(move |heap, slot| heap.write_view(slot, &view)),
            )
            .unwrap();
        // force a growth; the view must follow into the new heap
        let _other = f.pool.pop_handle(HeapKind::ShaderResource, noop()).unwrap();

        let heap = f.pool.heap(HeapKind::ShaderResource);
        let heap = heap.as_any().downcast_ref::<HeadlessHeap>().unwrap();
        let id = image
            .as_any()
            .downcast_ref::<crate::gpu::headless::HeadlessImage>()
            .unwrap()
            .id();
        assert_eq!(heap.slot_contents(handle.slot()), Some(id));
    }

    #[test]
    fn test_gpu_handle_only_for_shader_visible() {
        let f = fixture(2);
        let sr = f.pool.pop_handle(HeapKind::ShaderResource, noop()).unwrap();
        let rt = f.pool.pop_handle(HeapKind::RenderTarget, noop()).unwrap();
        assert!(f.pool.gpu_handle(&sr).is_some());
        assert!(f.pool.gpu_handle(&rt).is_none());
        assert_eq!(f.pool.shader_visible_heaps().len(), 1);
    }

    #[test]
    fn test_misconfigured_capacity_is_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let clock = Arc::new(FenceClock::new(device.timeline().clone()));
        let result = DescriptorPool::new(device, clock, DeferredReclaimer::new(), [0, 4, 4]);
        assert!(matches!(
            result,
            Err(GpuError::HeapMisconfigured {
                kind: HeapKind::ShaderResource,
                requested: 0
            })
        ));
    }

    #[test]
    fn test_slot_ceiling_is_fatal() {
        let max = HeapKind::DepthStencil.layout().max_slots;
        let f = fixture(max);
        for _ in 0..max {
            f.pool.pop_handle(HeapKind::DepthStencil, noop()).unwrap();
        }
        let err = f.pool.pop_handle(HeapKind::DepthStencil, noop()).unwrap_err();
        assert!(matches!(err, GpuError::SlotsExhausted { .. }));
    }
}
