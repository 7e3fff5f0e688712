//! Per-device table of notifier contexts.
//!
//! One coarse mutex guards the table; registration is rare next to
//! invalidation traffic, so there is nothing to gain from finer grain. The
//! same mutex also orders context destruction against fresh registrations:
//! a context is unlinked here, under this lock, before its resources go
//! away, so no lookup can return a context whose teardown already started.

use crate::bo::BufferObject;
use crate::error::UserptrResult;
use crate::gpu::GpuDevice;
use crate::mm::AddressSpace;
use crate::notifier::NotifierClass;
use crate::notifier::context::NotifierContext;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) struct NotifierRegistry {
    table: Mutex<HashMap<(u64, NotifierClass), Arc<NotifierContext>>>,
}

impl NotifierRegistry {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub(crate) fn get(
        &self,
        mm_id: u64,
        class: NotifierClass,
    ) -> Option<Arc<NotifierContext>> {
        self.table.lock().get(&(mm_id, class)).cloned()
    }

    /// Look up or create the context for (address space, class).
    ///
    /// Creation subscribes the new context to address-space change
    /// notifications while holding both the registry lock and the space
    /// lock; the space lock is acquired killably so a signalled task gets
    /// `Interrupted` instead of blocking a syscall forever. When the
    /// subscription fails, the partially built context is dropped before
    /// the error propagates and the table is left untouched.
    pub(crate) fn get_or_create(
        &self,
        device: &Arc<GpuDevice>,
        mm: &Arc<AddressSpace>,
        class: NotifierClass,
    ) -> UserptrResult<Arc<NotifierContext>> {
        let mut table = self.table.lock();
        let _space = mm.lock_killable()?;

        let key = (mm.id(), class);
        if let Some(ctx) = table.get(&key) {
            return Ok(ctx.clone());
        }

        let ctx = NotifierContext::new(device, mm.id(), class);
        let subscription = mm.subscribe(ctx.clone())?;
        ctx.set_subscription(subscription);
        table.insert(key, ctx.clone());
        Ok(ctx)
    }

    /// Register `bo` at `addr`, resolving (and lazily creating) the target
    /// context. The registry lock is held across the index insertion so
    /// destruction of the context cannot interleave.
    pub(crate) fn register_bo(
        &self,
        device: &Arc<GpuDevice>,
        mm: &Arc<AddressSpace>,
        bo: &Arc<BufferObject>,
        addr: u64,
    ) -> UserptrResult<()> {
        let last = addr + bo.size() - 1;
        let class = if bo.is_compute() {
            NotifierClass::Compute
        } else {
            NotifierClass::Graphics
        };

        let mut table = self.table.lock();
        let ctx = {
            let _space = mm.lock_killable()?;
            let key = (mm.id(), class);
            match table.get(&key) {
                Some(ctx) => ctx.clone(),
                None => {
                    let ctx = NotifierContext::new(device, mm.id(), class);
                    let subscription = mm.subscribe(ctx.clone())?;
                    ctx.set_subscription(subscription);
                    table.insert(key, ctx.clone());
                    ctx
                }
            }
        };

        bo.set_userptr_start(addr);
        ctx.insert_binding(bo, addr, last);
        Ok(())
    }

    /// Drop `bo`'s registration, if any. Holding the registry lock keeps
    /// the backref stable against concurrent context destruction.
    pub(crate) fn unregister_bo(&self, bo: &BufferObject) {
        let _table = self.table.lock();
        let Some(ctx) = bo.notifier() else {
            bo.clear_notifier();
            return;
        };
        ctx.remove_binding(bo);
        bo.clear_userptr_start();
    }

    /// Deferred-destruction body: unlink the context so lookups stop
    /// finding it, then clear its bindings under the write lock. The write
    /// lock is taken only after the unlink, so an invalidation span that
    /// entered before the unlink finishes safely and nothing can reach the
    /// context fresh afterwards. The registry lock is dropped first: the
    /// write-side wait may be long (an open invalidation span) and must not
    /// stall unrelated lookups.
    pub(crate) fn destroy(&self, ctx: &Arc<NotifierContext>) {
        self.table.lock().remove(&ctx.key());
        ctx.clear_bindings();
    }
}

#[cfg(test)]
mod tests {
    use crate::mm::AddressSpace;
    use crate::notifier::NotifierClass;
    use crate::testing::test_device;
    use std::sync::Arc;

    #[test]
    fn racing_get_or_create_returns_one_context() {
        let device = test_device(0);
        let mm = AddressSpace::new(42);

        let contexts: Vec<_> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let device = device.clone();
                    let mm = mm.clone();
                    scope.spawn(move || {
                        device
                            .notifiers
                            .get_or_create(&device, &mm, NotifierClass::Compute)
                            .unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        for ctx in &contexts[1..] {
            assert!(Arc::ptr_eq(&contexts[0], ctx));
        }
        assert_eq!(device.notifiers.len(), 1);

        // The two classes are independent keys.
        let gfx = device
            .notifiers
            .get_or_create(&device, &mm, NotifierClass::Graphics)
            .unwrap();
        assert!(!Arc::ptr_eq(&contexts[0], &gfx));
        assert_eq!(device.notifiers.len(), 2);
    }
}
