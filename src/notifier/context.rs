//! Per-address-space notifier state.
//!
//! A [`NotifierContext`] exists per (address space, class) pair and owns the
//! interval index of registered userptr buffers. Registration mutates the
//! index under the exclusive side of the context lock; invalidation
//! callbacks traverse it under a recursion-safe shared side that stays held
//! from `invalidate_range_start` to `invalidate_range_end`, blocking
//! command submission for the whole span.

use crate::bo::BufferObject;
use crate::config::CoreConfig;
use crate::gpu::GpuDevice;
use crate::interval::IntervalIndex;
use crate::mm::{AddressSpace, MmObserver, SubscriptionId};
use crate::notifier::NotifierClass;
use parking_lot::Mutex;
use parking_lot::RawRwLock;
use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub struct NotifierContext {
    device: Weak<GpuDevice>,
    mm_id: u64,
    class: NotifierClass,
    config: Arc<CoreConfig>,
    subscription: Mutex<Option<SubscriptionId>>,
    defunct: AtomicBool,

    lock: RawRwLock,
    // Serializes shared-side acquisition so the recursion count and the
    // underlying lock state cannot diverge.
    read_gate: Mutex<()>,
    recursion: AtomicUsize,

    objects: UnsafeCell<IntervalIndex<Arc<BufferObject>>>,

    weak_self: Weak<NotifierContext>,
}

// SAFETY: the index behind `objects` is only touched under the context
// lock: mutation requires the exclusive side, traversal the shared side.
// Every other field is synchronized on its own.
unsafe impl Send for NotifierContext {}
unsafe impl Sync for NotifierContext {}

/// Exclusive hold on a context, blocking invalidation spans. Taken around
/// command submission and while the index is mutated.
#[must_use]
pub struct NotifierWriteGuard<'a> {
    ctx: &'a NotifierContext,
}

impl Drop for NotifierWriteGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard's existence proves the exclusive side is held.
        unsafe { self.ctx.lock.unlock_exclusive() };
    }
}

impl NotifierContext {
    pub(crate) fn new(
        device: &Arc<GpuDevice>,
        mm_id: u64,
        class: NotifierClass,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            device: Arc::downgrade(device),
            mm_id,
            class,
            config: device.config().clone(),
            subscription: Mutex::new(None),
            defunct: AtomicBool::new(false),
            lock: RawRwLock::INIT,
            read_gate: Mutex::new(()),
            recursion: AtomicUsize::new(0),
            objects: UnsafeCell::new(IntervalIndex::new()),
            weak_self: weak_self.clone(),
        })
    }

    #[must_use]
    pub fn mm_id(&self) -> u64 {
        self.mm_id
    }

    #[must_use]
    pub fn class(&self) -> NotifierClass {
        self.class
    }

    pub(crate) fn key(&self) -> (u64, NotifierClass) {
        (self.mm_id, self.class)
    }

    pub(crate) fn set_subscription(&self, subscription: SubscriptionId) {
        *self.subscription.lock() = Some(subscription);
    }

    /// Take the exclusive side. Command submission holds this while it
    /// pins user pages so no invalidation span can slip in between.
    pub fn lock(&self) -> NotifierWriteGuard<'_> {
        self.lock.lock_exclusive();
        NotifierWriteGuard { ctx: self }
    }

    /// Take the shared side, recursion-safe: nested acquisitions from the
    /// same logical callback chain only bump a counter. The underlying lock
    /// is taken on the 0 -> 1 transition.
    pub(crate) fn read_lock(&self) {
        let _gate = self.read_gate.lock();
        if self.recursion.fetch_add(1, Ordering::AcqRel) == 0 {
            self.lock.lock_shared();
        }
    }

    /// Drop one shared-side hold; the underlying lock is released on the
    /// 1 -> 0 transition. The release may run on a different thread than
    /// the acquisition. An unmatched release is a caller bug and is
    /// swallowed rather than allowed to underflow.
    pub(crate) fn read_unlock(&self) {
        match self
            .recursion
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            // SAFETY: recursion was 1, so this caller's chain holds the
            // shared lock taken on its 0 -> 1 transition. The raw lock does
            // not track shared owners, which is what permits releasing from
            // a different thread than the acquiring one.
            Ok(1) => unsafe { self.lock.unlock_shared() },
            Ok(_) => {}
            Err(_) => warn!(mm = self.mm_id, "unbalanced notifier read unlock"),
        }
    }

    /// SAFETY: caller holds the shared or exclusive side.
    unsafe fn objects(&self) -> &IntervalIndex<Arc<BufferObject>> {
        unsafe { &*self.objects.get() }
    }

    /// SAFETY: caller holds the exclusive side.
    #[allow(clippy::mut_from_ref)]
    unsafe fn objects_mut(&self) -> &mut IntervalIndex<Arc<BufferObject>> {
        unsafe { &mut *self.objects.get() }
    }

    /// Insert `bo` for `[start, last]`, coalescing every range it overlaps.
    /// Caller holds the device registry lock.
    pub(crate) fn insert_binding(&self, bo: &Arc<BufferObject>, start: u64, last: u64) {
        debug_assert!(!self.defunct.load(Ordering::Acquire));
        let _guard = self.lock();
        bo.set_notifier(&self.weak_self);
        // SAFETY: exclusive side held by `_guard`.
        unsafe { self.objects_mut() }.insert_merged(start, last, bo.clone());
    }

    /// Remove `bo` from its node, dropping the node once its list empties.
    /// Caller holds the device registry lock.
    pub(crate) fn remove_binding(&self, bo: &BufferObject) {
        let _guard = self.lock();
        // SAFETY: exclusive side held by `_guard`.
        let objects = unsafe { self.objects_mut() };
        if let Some((start, last)) = bo.userptr_range() {
            if let Some(key) = objects.first_overlap(start, last) {
                let emptied = objects.get_mut(key).is_some_and(|node| {
                    node.items
                        .retain(|other| !std::ptr::eq(Arc::as_ptr(other), bo));
                    node.items.is_empty()
                });
                if emptied {
                    objects.remove(key);
                }
            }
        }
        bo.clear_notifier();
    }

    /// Drop every binding and clear each buffer's backref so a concurrent
    /// unregister no longer targets this context. Runs only on the deferred
    /// destruction path, after the context was unlinked from the registry.
    pub(crate) fn clear_bindings(&self) {
        self.defunct.store(true, Ordering::Release);
        let _guard = self.lock();
        // SAFETY: exclusive side held by `_guard`.
        let objects = unsafe { self.objects_mut() };
        for node in objects.drain() {
            for bo in node.items {
                bo.clear_notifier();
            }
        }
    }

    pub(crate) fn take_subscription(&self) -> Option<SubscriptionId> {
        self.subscription.lock().take()
    }

    /// Snapshot of tracked ranges as (start, last, buffer count), for
    /// diagnostics and tests.
    #[must_use]
    pub fn tracked_ranges(&self) -> Vec<(u64, u64, usize)> {
        self.read_lock();
        // SAFETY: shared side held.
        let ranges = unsafe { self.objects() }
            .iter()
            .map(|node| (node.start, node.last, node.items.len()))
            .collect();
        self.read_unlock();
        ranges
    }

    /// Block until every buffer overlapping `[start, last]` is idle, then
    /// flag its pages for revalidation. A wait failure is logged and
    /// skipped: stalling the memory-management callback forever is worse
    /// than one stale-mapping window.
    fn invalidate_gfx(&self, start: u64, last: u64) {
        // SAFETY: shared side held by the caller for the whole span.
        let objects = unsafe { self.objects() };
        let device = self.device.upgrade();

        let mut it = objects.first_overlap(start, last);
        while let Some(key) = it {
            it = objects.next_overlap(key, start, last);
            let Some(node) = objects.get(key) else { continue };
            for bo in &node.items {
                if !bo.affects_range(start, last) {
                    continue;
                }
                if let Err(err) = bo
                    .reservation()
                    .wait_timeout(false, self.config.fence_wait_budget)
                {
                    warn!(mm = self.mm_id, error = %err, "failed to wait for user bo");
                }
                if let Some(device) = &device {
                    device.vm().mark_user_pages_dirty(bo.memory());
                }
            }
        }
    }

    /// Hand every affected buffer to its process's eviction machinery. The
    /// quiesce happens asynchronously; the callback never blocks on it.
    fn invalidate_hsa(&self, start: u64, last: u64) {
        // SAFETY: shared side held by the caller for the whole span.
        let objects = unsafe { self.objects() };

        let mut it = objects.first_overlap(start, last);
        while let Some(key) = it {
            it = objects.next_overlap(key, start, last);
            let Some(node) = objects.get(key) else { continue };
            for bo in &node.items {
                if !bo.affects_range(start, last) {
                    continue;
                }
                if let Some(process) = bo.compute_process() {
                    process
                        .schedule_evict_and_restore(vec![(bo.device().clone(), bo.memory())]);
                }
            }
        }
    }
}

impl MmObserver for NotifierContext {
    /// The address space is going away. Destruction must not run on this
    /// thread (the notifier callback context cannot block on the registry
    /// or context locks), so it is deferred to the device worker: unlink
    /// from the registry, clear all bindings under the write lock, then
    /// drop the subscription.
    fn release(&self, mm: &Arc<AddressSpace>) {
        let Some(device) = self.device.upgrade() else {
            return;
        };
        let Some(ctx) = self.weak_self.upgrade() else {
            return;
        };
        debug!(mm = self.mm_id, class = ?self.class, "scheduling notifier context destruction");
        let mm = mm.clone();
        let destroy_device = device.clone();
        device.wq.submit(move || {
            destroy_device.notifiers.destroy(&ctx);
            if let Some(subscription) = ctx.take_subscription() {
                mm.unsubscribe(subscription);
            }
        });
    }

    fn invalidate_range_start(&self, start: u64, end: u64) {
        debug_assert!(end > start);
        // notification is exclusive, but the interval index is inclusive
        let last = end - 1;

        self.read_lock();
        match self.class {
            NotifierClass::Graphics => self.invalidate_gfx(start, last),
            NotifierClass::Compute => self.invalidate_hsa(start, last),
        }
    }

    fn invalidate_range_end(&self, _start: u64, _end: u64) {
        self.read_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_device;

    fn test_context() -> Arc<NotifierContext> {
        NotifierContext::new(&test_device(0), 1, NotifierClass::Graphics)
    }

    #[test]
    fn nested_read_locks_do_not_deadlock() {
        let ctx = test_context();

        ctx.read_lock();
        ctx.read_lock();
        assert_eq!(ctx.recursion.load(Ordering::SeqCst), 2);

        ctx.read_unlock();
        ctx.read_unlock();
        assert_eq!(ctx.recursion.load(Ordering::SeqCst), 0);

        // The lock is free again: the exclusive side must be available.
        let guard = ctx.lock();
        drop(guard);
    }

    #[test]
    fn unmatched_read_unlock_does_not_underflow() {
        let ctx = test_context();

        ctx.read_lock();
        ctx.read_unlock();
        // One extra release: swallowed, counter stays at zero.
        ctx.read_unlock();
        assert_eq!(ctx.recursion.load(Ordering::SeqCst), 0);

        let guard = ctx.lock();
        drop(guard);
    }

    #[test]
    fn read_lock_blocks_writer_until_final_release() {
        let ctx = test_context();

        ctx.read_lock();
        ctx.read_lock();
        ctx.read_unlock();
        // Still one hold outstanding; the exclusive side must not be
        // available yet.
        assert!(!ctx.lock.try_lock_exclusive());

        ctx.read_unlock();
        assert!(ctx.lock.try_lock_exclusive());
        // SAFETY: taken right above.
        unsafe { ctx.lock.unlock_exclusive() };
    }
}
