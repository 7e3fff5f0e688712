//! Per-process state and the process-wide table.
//!
//! A [`Process`] exists per tracked address space: it owns the per-device
//! data (queue state, eviction counters, handle tables), the process-local
//! buffer interval index, and the reusable eviction/restore work items. The
//! [`ProcessTable`] is the lookup/creation point; its map is only mutated
//! after a process is fully built, so lookups never observe a partial one.

pub mod directory;
pub mod eviction;

pub use directory::{BufferHandleEntry, SharedObject};

use crate::config::CoreConfig;
use crate::error::UserptrResult;
use crate::gpu::{FenceSet, GpuDevice, MemoryObjectHandle};
use crate::interval::IntervalIndex;
use crate::mm::{AddressSpace, MmObserver, SubscriptionId};
use crate::process::directory::{BoKey, HandleTable};
use crate::work::{DelayedWork, WorkQueue};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::debug;

pub(crate) struct ProcessDevice {
    pub(crate) device: Arc<GpuDevice>,
    pub(crate) handles: HandleTable,
    /// Eviction counter, 0 = active. Nested eviction triggers stack here;
    /// queues come back only when it drains to zero.
    pub(crate) evicted: u32,
    pub(crate) queues_active: bool,
}

pub(crate) struct ProcessState {
    pub(crate) devices: Vec<ProcessDevice>,
    pub(crate) bo_index: IntervalIndex<BoKey>,
    pub(crate) pending_evict: Vec<(Arc<GpuDevice>, MemoryObjectHandle)>,
    pub(crate) evicted_mems: Vec<(Arc<GpuDevice>, MemoryObjectHandle)>,
    pub(crate) restore_retries: u32,
}

pub struct Process {
    pasid: u32,
    mm_id: u64,
    mm: Weak<AddressSpace>,
    table: Weak<TableInner>,
    wq: Arc<WorkQueue>,
    pub(crate) config: Arc<CoreConfig>,

    pub(crate) state: Mutex<ProcessState>,

    pub(crate) eviction_work: DelayedWork,
    pub(crate) restore_work: DelayedWork,
    pub(crate) quiesce_fence: Mutex<Option<Arc<dyn FenceSet>>>,
    pub(crate) eviction_fence: Arc<dyn FenceSet>,
    pub(crate) last_restore: Mutex<Instant>,

    subscription: Mutex<Option<SubscriptionId>>,
    pub(crate) released: AtomicBool,
    weak_self: Weak<Process>,
}

impl Process {
    #[must_use]
    pub fn pasid(&self) -> u32 {
        self.pasid
    }

    #[must_use]
    pub fn mm_id(&self) -> u64 {
        self.mm_id
    }

    /// Create the per-device data for `device` if this process has none
    /// yet. Queues start active with a clear eviction counter.
    pub fn bind_device(&self, device: &Arc<GpuDevice>) {
        let mut state = self.state.lock();
        if state
            .devices
            .iter()
            .any(|pdd| pdd.device.id() == device.id())
        {
            return;
        }
        state.devices.push(ProcessDevice {
            device: device.clone(),
            handles: HandleTable::new(),
            evicted: 0,
            queues_active: true,
        });
    }

    /// Current eviction counter for `device_id`; 0 when unbound or active.
    #[must_use]
    pub fn eviction_count(&self, device_id: u32) -> u32 {
        self.state
            .lock()
            .devices
            .iter()
            .find(|pdd| pdd.device.id() == device_id)
            .map_or(0, |pdd| pdd.evicted)
    }

    /// Whether the process's queues are running on `device_id`.
    #[must_use]
    pub fn queues_active(&self, device_id: u32) -> bool {
        self.state
            .lock()
            .devices
            .iter()
            .find(|pdd| pdd.device.id() == device_id)
            .is_some_and(|pdd| pdd.queues_active)
    }

    /// Final teardown, off the notifier callback thread: the process is
    /// unreachable by now, so no locking against new users is needed.
    fn deferred_release(&self) {
        let mut state = self.state.lock();
        for pdd in &mut state.devices {
            for record in pdd.handles.drain() {
                // Best effort; the VM may already have dropped the mapping.
                let _ = pdd.device.vm().unmap(record.mem);
            }
        }
        state.bo_index.clear();
        state.pending_evict.clear();
        state.evicted_mems.clear();
        drop(state);
        debug!(pasid = self.pasid, "process released");
    }
}

impl MmObserver for Process {
    /// Address-space teardown. Runs on the notifier thread: cancel the
    /// delayed works so nothing runs against freed state, unlink from the
    /// table, stop the queues, then push the bulk teardown to the worker.
    fn release(&self, mm: &Arc<AddressSpace>) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(pasid = self.pasid, "releasing process");

        // Cancel-and-wait, not fire-and-forget: after this, no deferred
        // task can observe the process mid-teardown.
        self.eviction_work.cancel_sync();
        self.restore_work.cancel_sync();

        if let Some(table) = self.table.upgrade() {
            table.processes.write().remove(&self.mm_id);
        }

        let mut to_quiesce = Vec::new();
        {
            let mut state = self.state.lock();
            for pdd in &mut state.devices {
                if pdd.queues_active {
                    pdd.queues_active = false;
                    to_quiesce.push(pdd.device.clone());
                }
            }
        }
        for device in to_quiesce {
            device.queues().quiesce(self.pasid);
        }

        if let Some(subscription) = self.subscription.lock().take() {
            mm.unsubscribe(subscription);
        }

        if let Some(process) = self.weak_self.upgrade() {
            self.wq.submit(move || process.deferred_release());
        }
    }
}

struct TableInner {
    processes: RwLock<HashMap<u64, Arc<Process>>>,
    next_pasid: AtomicU32,
    wq: Arc<WorkQueue>,
    config: Arc<CoreConfig>,
}

/// Process-wide lookup and creation point, keyed by address-space id.
pub struct ProcessTable {
    inner: Arc<TableInner>,
}

impl ProcessTable {
    #[must_use]
    pub fn new(config: CoreConfig) -> Self {
        Self {
            inner: Arc::new(TableInner {
                processes: RwLock::new(HashMap::new()),
                next_pasid: AtomicU32::new(1),
                wq: Arc::new(WorkQueue::new("process-wq")),
                config: Arc::new(config),
            }),
        }
    }

    /// Look up the process for `mm`, creating it on first use.
    ///
    /// `eviction_fence` covers the process's in-flight GPU work; the
    /// eviction worker waits on it after quiescing the queues. Creation
    /// subscribes a release observer on the address space; if that fails
    /// the half-built process is dropped and the error propagates.
    pub fn get_or_create(
        &self,
        mm: &Arc<AddressSpace>,
        eviction_fence: Arc<dyn FenceSet>,
    ) -> UserptrResult<Arc<Process>> {
        let inner = &self.inner;
        let mut processes = inner.processes.write();
        if let Some(process) = processes.get(&mm.id()) {
            return Ok(process.clone());
        }

        let pasid = inner.next_pasid.fetch_add(1, Ordering::Relaxed);
        let process = Arc::new_cyclic(|weak_self: &Weak<Process>| {
            let evict = weak_self.clone();
            let restore = weak_self.clone();
            Process {
                pasid,
                mm_id: mm.id(),
                mm: Arc::downgrade(mm),
                table: Arc::downgrade(inner),
                wq: inner.wq.clone(),
                config: inner.config.clone(),
                state: Mutex::new(ProcessState {
                    devices: Vec::new(),
                    bo_index: IntervalIndex::new(),
                    pending_evict: Vec::new(),
                    evicted_mems: Vec::new(),
                    restore_retries: 0,
                }),
                eviction_work: DelayedWork::new(&inner.wq, move || {
                    if let Some(process) = evict.upgrade() {
                        process.evict_worker();
                    }
                }),
                restore_work: DelayedWork::new(&inner.wq, move || {
                    if let Some(process) = restore.upgrade() {
                        process.restore_worker();
                    }
                }),
                quiesce_fence: Mutex::new(None),
                eviction_fence,
                last_restore: Mutex::new(Instant::now()),
                subscription: Mutex::new(None),
                released: AtomicBool::new(false),
                weak_self: weak_self.clone(),
            }
        });

        let subscription = mm.subscribe(process.clone())?;
        *process.subscription.lock() = Some(subscription);
        processes.insert(mm.id(), process.clone());
        debug!(pasid, mm = mm.id(), "created process");
        Ok(process)
    }

    #[must_use]
    pub fn lookup_by_mm(&self, mm_id: u64) -> Option<Arc<Process>> {
        self.inner.processes.read().get(&mm_id).cloned()
    }

    #[must_use]
    pub fn lookup_by_pasid(&self, pasid: u32) -> Option<Arc<Process>> {
        self.inner
            .processes
            .read()
            .values()
            .find(|process| process.pasid == pasid)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.processes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.processes.read().is_empty()
    }
}
