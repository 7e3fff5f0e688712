//! The evict/quiesce/restore cycle.
//!
//! Compute workloads cannot survive a page moving under an active queue,
//! and the invalidation callback cannot block on a queue drain. So the
//! callback only bumps counters and arms the eviction work; the worker
//! thread quiesces the queues, waits out in-flight GPU work on the quiesce
//! fence, unmaps the affected objects and arms a delayed restore. Restore
//! remaps, backs off under memory pressure, and reactivates the queues
//! only once every eviction trigger has been paired with a restore.

use crate::gpu::{GpuDevice, MemoryObjectHandle};
use crate::process::Process;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, error, warn};

fn contains(
    list: &[(Arc<GpuDevice>, MemoryObjectHandle)],
    device: &Arc<GpuDevice>,
    mem: MemoryObjectHandle,
) -> bool {
    list.iter()
        .any(|(d, m)| Arc::ptr_eq(d, device) && *m == mem)
}

impl Process {
    /// Eviction trigger. Called from the compute invalidation path with the
    /// affected buffers, or with the process's whole allocation set for
    /// process-level triggers. Never blocks on the quiesce.
    ///
    /// Every trigger bumps each per-device eviction counter; the eviction
    /// work is armed on the 0 -> 1 transition and arming is a no-op while a
    /// pass is already queued, so later triggers only add their buffers to
    /// the pending set. A process restored less than the minimum active
    /// time ago has the eviction deferred by the remainder.
    pub(crate) fn schedule_evict_and_restore(
        &self,
        affected: Vec<(Arc<GpuDevice>, MemoryObjectHandle)>,
    ) {
        if self.released.load(Ordering::Acquire) {
            return;
        }

        {
            let mut state = self.state.lock();
            for (device, mem) in affected {
                if !contains(&state.pending_evict, &device, mem)
                    && !contains(&state.evicted_mems, &device, mem)
                {
                    state.pending_evict.push((device, mem));
                }
            }
            for pdd in &mut state.devices {
                pdd.evicted += 1;
            }
        }

        {
            let mut fence = self.quiesce_fence.lock();
            if fence.is_none() {
                *fence = Some(self.eviction_fence.clone());
            }
        }

        let delay = self
            .config
            .min_active_time
            .saturating_sub(self.last_restore.lock().elapsed());
        self.eviction_work.schedule(delay);
    }

    /// Evict every allocation the process has outstanding. External
    /// process-level trigger (e.g. an address-translation fault telling the
    /// driver the process must come off the hardware).
    pub fn schedule_process_eviction(&self) {
        let affected = {
            let state = self.state.lock();
            let mut affected = Vec::new();
            for pdd in &state.devices {
                for record in pdd.handles.iter() {
                    affected.push((pdd.device.clone(), record.mem));
                }
            }
            affected
        };
        self.schedule_evict_and_restore(affected);
    }

    pub(crate) fn evict_worker(&self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        debug!(pasid = self.pasid(), "evicting process queues");

        let (to_quiesce, pending) = {
            let mut state = self.state.lock();
            let mut to_quiesce = Vec::new();
            for pdd in &mut state.devices {
                if pdd.queues_active {
                    pdd.queues_active = false;
                    to_quiesce.push(pdd.device.clone());
                }
            }
            (to_quiesce, std::mem::take(&mut state.pending_evict))
        };

        for device in &to_quiesce {
            device.queues().quiesce(self.pasid());
        }

        // Nothing may be unmapped while the GPU could still touch it.
        if let Some(fence) = self.quiesce_fence.lock().take() {
            if let Err(err) = fence.wait_timeout(false, self.config.fence_wait_budget) {
                warn!(pasid = self.pasid(), error = %err, "failed to wait for process quiesce fence");
            }
        }

        let mut unmapped = Vec::new();
        for (device, mem) in pending {
            if let Err(err) = device.vm().unmap(mem) {
                warn!(pasid = self.pasid(), mem = mem.0, error = %err, "failed to unmap evicted buffer");
            }
            unmapped.push((device, mem));
        }

        {
            let mut state = self.state.lock();
            for (device, mem) in unmapped {
                if !contains(&state.evicted_mems, &device, mem) {
                    state.evicted_mems.push((device, mem));
                }
            }
        }

        // Restore is measured from the latest eviction event, so re-arm
        // even when a restore is already pending.
        self.restore_work.reschedule(self.config.restore_delay);
    }

    pub(crate) fn restore_worker(&self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }

        let evicted = self.state.lock().evicted_mems.clone();
        let mut pressure = false;
        for (device, mem) in &evicted {
            if let Err(err) = device.vm().map(*mem) {
                debug!(pasid = self.pasid(), mem = mem.0, error = %err, "restore attempt failed");
                pressure = true;
                break;
            }
        }

        if pressure {
            let retries = {
                let mut state = self.state.lock();
                state.restore_retries += 1;
                state.restore_retries
            };
            match self.config.max_restore_retries {
                Some(cap) if retries >= cap => {
                    error!(
                        pasid = self.pasid(),
                        retries, "giving up on restore after sustained memory pressure"
                    );
                }
                _ => {
                    self.restore_work.schedule(self.config.backoff_delay);
                }
            }
            return;
        }

        let mut to_resume = Vec::new();
        let still_evicted = {
            let mut state = self.state.lock();
            state.evicted_mems.clear();
            state.restore_retries = 0;

            let mut still_evicted = false;
            for pdd in &mut state.devices {
                if pdd.evicted > 0 {
                    pdd.evicted -= 1;
                }
                if pdd.evicted > 0 {
                    still_evicted = true;
                }
            }
            if !still_evicted {
                for pdd in &mut state.devices {
                    if !pdd.queues_active {
                        pdd.queues_active = true;
                        to_resume.push(pdd.device.clone());
                    }
                }
            }
            still_evicted
        };

        for device in to_resume {
            device.queues().resume(self.pasid());
        }
        *self.last_restore.lock() = Instant::now();

        if still_evicted {
            // Outstanding triggers remain; keep draining the counter.
            self.restore_work.schedule(self.config.restore_delay);
        } else {
            debug!(pasid = self.pasid(), "restored process queues");
        }
    }
}
