use crate::error::UserptrResult;
use crate::gpu::{FenceSet, GpuDevice, MemoryObjectHandle};
use crate::mm::AddressSpace;
use crate::notifier::context::NotifierContext;
use crate::process::Process;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

const USERPTR_UNSET: u64 = u64::MAX;

/// A GPU-visible buffer backed by a range of the owning process's regular
/// virtual memory.
///
/// While registered, the buffer is tracked by a [`NotifierContext`] keyed
/// by its address space: page-table changes touching the range trigger
/// either a synchronous wait-and-revalidate (graphics) or an asynchronous
/// evict/restore cycle (compute). A buffer created with
/// [`new_compute`](Self::new_compute) carries a backref to its process,
/// which is what routes it to the compute policy.
pub struct BufferObject {
    size: u64,
    mem: MemoryObjectHandle,
    device: Arc<GpuDevice>,
    resv: Arc<dyn FenceSet>,
    compute_process: Option<Weak<Process>>,
    notifier: Mutex<Option<Weak<NotifierContext>>>,
    userptr_start: AtomicU64,
    weak_self: Weak<BufferObject>,
}

impl BufferObject {
    /// A graphics-class buffer. `resv` covers the GPU's outstanding work on
    /// the buffer and is waited on synchronously during invalidation.
    #[must_use]
    pub fn new(
        device: &Arc<GpuDevice>,
        mem: MemoryObjectHandle,
        size: u64,
        resv: Arc<dyn FenceSet>,
    ) -> Arc<Self> {
        debug_assert!(size >= 1);
        Arc::new_cyclic(|weak_self| Self {
            size,
            mem,
            device: device.clone(),
            resv,
            compute_process: None,
            notifier: Mutex::new(None),
            userptr_start: AtomicU64::new(USERPTR_UNSET),
            weak_self: weak_self.clone(),
        })
    }

    /// A compute-class buffer owned by `process`; invalidation hands it to
    /// the process's eviction machinery instead of blocking.
    #[must_use]
    pub fn new_compute(
        device: &Arc<GpuDevice>,
        mem: MemoryObjectHandle,
        size: u64,
        resv: Arc<dyn FenceSet>,
        process: &Arc<Process>,
    ) -> Arc<Self> {
        debug_assert!(size >= 1);
        Arc::new_cyclic(|weak_self| Self {
            size,
            mem,
            device: device.clone(),
            resv,
            compute_process: Some(Arc::downgrade(process)),
            notifier: Mutex::new(None),
            userptr_start: AtomicU64::new(USERPTR_UNSET),
            weak_self: weak_self.clone(),
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn memory(&self) -> MemoryObjectHandle {
        self.mem
    }

    #[must_use]
    pub fn device(&self) -> &Arc<GpuDevice> {
        &self.device
    }

    #[must_use]
    pub fn is_compute(&self) -> bool {
        self.compute_process.is_some()
    }

    pub(crate) fn reservation(&self) -> &Arc<dyn FenceSet> {
        &self.resv
    }

    pub(crate) fn compute_process(&self) -> Option<Arc<Process>> {
        self.compute_process.as_ref().and_then(Weak::upgrade)
    }

    /// Start tracking `[addr, addr + size - 1]` of `mm` for this buffer.
    ///
    /// Re-registering at a new address requires [`unregister`] first; this
    /// call does not move an existing registration.
    ///
    /// [`unregister`]: Self::unregister
    pub fn register(&self, mm: &Arc<AddressSpace>, addr: u64) -> UserptrResult<()> {
        let this = self
            .weak_self
            .upgrade()
            .expect("buffer objects are Arc-constructed");
        self.device.notifiers.register_bo(&self.device, mm, &this, addr)
    }

    /// Drop this buffer's registration. No-op when it was never registered
    /// or its context is already gone.
    pub fn unregister(&self) {
        self.device.notifiers.unregister_bo(self);
    }

    /// Whether a notifier context currently tracks this buffer.
    #[must_use]
    pub fn is_notifier_tracked(&self) -> bool {
        self.notifier.lock().is_some()
    }

    pub(crate) fn set_notifier(&self, ctx: &Weak<NotifierContext>) {
        *self.notifier.lock() = Some(ctx.clone());
    }

    pub(crate) fn clear_notifier(&self) {
        *self.notifier.lock() = None;
    }

    pub(crate) fn notifier(&self) -> Option<Arc<NotifierContext>> {
        self.notifier.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_userptr_start(&self, addr: u64) {
        self.userptr_start.store(addr, Ordering::Release);
    }

    pub(crate) fn clear_userptr_start(&self) {
        self.userptr_start.store(USERPTR_UNSET, Ordering::Release);
    }

    /// The registered range, inclusive on both ends.
    pub(crate) fn userptr_range(&self) -> Option<(u64, u64)> {
        let start = self.userptr_start.load(Ordering::Acquire);
        if start == USERPTR_UNSET {
            return None;
        }
        Some((start, start + self.size - 1))
    }

    /// Whether this buffer's registered range intersects `[start, last]`.
    pub(crate) fn affects_range(&self, start: u64, last: u64) -> bool {
        match self.userptr_range() {
            Some((bo_start, bo_last)) => bo_start <= last && start <= bo_last,
            None => false,
        }
    }
}
