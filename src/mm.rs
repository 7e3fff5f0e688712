//! Address-space change subscription.
//!
//! The OS memory-management subsystem is the producer here: it drives
//! `invalidate_range_start`/`invalidate_range_end` whenever page tables of a
//! tracked address space change, and `release` when the address space is
//! torn down. Range endpoints use the OS convention: start inclusive, end
//! exclusive. Subscribers convert to the inclusive convention of the
//! interval index themselves.

use crate::error::{UserptrError, UserptrResult};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Callback set registered against an [`AddressSpace`].
///
/// Callbacks arrive on arbitrary threads and a start/end span may nest with
/// other spans on the same space; implementers own their reentrancy.
pub trait MmObserver: Send + Sync {
    /// The address space is being torn down. Called exactly once.
    fn release(&self, mm: &Arc<AddressSpace>);

    fn invalidate_range_start(&self, _start: u64, _end: u64) {}

    fn invalidate_range_end(&self, _start: u64, _end: u64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// One process's virtual address space, as seen by this crate: a stable id
/// used as a lookup key, an exclusive space lock, and the subscriber list
/// the OS notifies on page-table changes.
///
/// The crate never owns the address space; the embedding driver keeps it
/// alive for the process lifetime and drives the invalidation entry points.
pub struct AddressSpace {
    id: u64,
    space_lock: Mutex<()>,
    interrupt_pending: AtomicBool,
    released: AtomicBool,
    next_subscription: AtomicU64,
    observers: Mutex<Vec<(u64, Arc<dyn MmObserver>)>>,
    weak_self: std::sync::Weak<AddressSpace>,
}

impl AddressSpace {
    #[must_use]
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            id,
            space_lock: Mutex::new(()),
            interrupt_pending: AtomicBool::new(false),
            released: AtomicBool::new(false),
            next_subscription: AtomicU64::new(1),
            observers: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flag a pending fatal signal for the owning task. While set, killable
    /// lock acquisitions on this space fail with
    /// [`UserptrError::Interrupted`].
    pub fn set_interrupt_pending(&self, pending: bool) {
        self.interrupt_pending.store(pending, Ordering::Release);
    }

    /// Acquire the exclusive space lock, giving up when a fatal signal is
    /// pending. User-initiated paths (buffer registration) go through this
    /// so a signalled task gets "try again" instead of an unbounded block.
    pub(crate) fn lock_killable(&self) -> UserptrResult<MutexGuard<'_, ()>> {
        loop {
            if self.interrupt_pending.load(Ordering::Acquire) {
                return Err(UserptrError::Interrupted);
            }
            if let Some(guard) = self.space_lock.try_lock_for(Duration::from_millis(10)) {
                return Ok(guard);
            }
        }
    }

    /// Register a callback set. Fails once teardown has begun.
    pub fn subscribe(&self, observer: Arc<dyn MmObserver>) -> UserptrResult<SubscriptionId> {
        if self.released.load(Ordering::Acquire) {
            return Err(UserptrError::AddressSpaceGone);
        }
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, observer));
        Ok(SubscriptionId(id))
    }

    /// Drop a subscription without waiting for in-flight callbacks. Only
    /// safe when the caller sequences its own destruction against them.
    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        self.observers.lock().retain(|(id, _)| *id != subscription.0);
    }

    fn snapshot(&self) -> Vec<Arc<dyn MmObserver>> {
        self.observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }

    /// Page tables for `[start, end)` are about to change.
    pub fn invalidate_range_start(&self, start: u64, end: u64) {
        for observer in self.snapshot() {
            observer.invalidate_range_start(start, end);
        }
    }

    /// The change to `[start, end)` is complete.
    pub fn invalidate_range_end(&self, start: u64, end: u64) {
        for observer in self.snapshot() {
            observer.invalidate_range_end(start, end);
        }
    }

    /// Drive a full start/end invalidation span for `[start, end)`.
    pub fn invalidate_range(&self, start: u64, end: u64) {
        self.invalidate_range_start(start, end);
        self.invalidate_range_end(start, end);
    }

    /// The address space is going away. Notifies every subscriber once;
    /// subsequent calls are no-ops.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = self
            .weak_self
            .upgrade()
            .expect("address spaces are Arc-constructed");
        for observer in self.snapshot() {
            observer.release(&this);
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.observers.lock().len()
    }
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace").field("id", &self.id).finish()
    }
}
