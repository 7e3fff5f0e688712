//! Per-process-per-device buffer handle directory.
//!
//! Handles translate ioctl-level references into memory objects in O(1);
//! the separate process-wide interval index answers "which allocation
//! covers this address" for operations that arrive with a range instead of
//! a handle. Both live under the process lock.

use crate::error::{UserptrError, UserptrResult};
use crate::gpu::{GpuDevice, MemoryObjectHandle};
use crate::process::Process;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

/// A cross-process-shared buffer attachment. Directory entries hold one
/// reference; dropping the entry releases it.
#[derive(Debug)]
pub struct SharedObject {
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoKey {
    pub(crate) device_id: u32,
    pub(crate) handle: u64,
}

pub(crate) struct BoRecord {
    pub(crate) handle: u64,
    pub(crate) start: u64,
    pub(crate) last: u64,
    pub(crate) mem: MemoryObjectHandle,
    pub(crate) shared: Option<Arc<SharedObject>>,
}

/// Resolved directory entry, as handed back to ioctl-level callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandleEntry {
    pub handle: u64,
    pub device_id: u32,
    pub start: u64,
    pub last: u64,
    pub mem: MemoryObjectHandle,
}

/// Handle-to-record table for one process-device pair. Ids are allocated
/// monotonically from 1; 0 stays free as the invalid sentinel.
pub(crate) struct HandleTable {
    next: u64,
    records: HashMap<u64, BoRecord>,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self {
            next: 1,
            records: HashMap::new(),
        }
    }

    fn insert(&mut self, start: u64, last: u64, mem: MemoryObjectHandle, shared: Option<Arc<SharedObject>>) -> u64 {
        let handle = self.next;
        self.next += 1;
        self.records.insert(
            handle,
            BoRecord {
                handle,
                start,
                last,
                mem,
                shared,
            },
        );
        handle
    }

    fn get(&self, handle: u64) -> Option<&BoRecord> {
        if handle < 1 {
            return None;
        }
        self.records.get(&handle)
    }

    fn remove(&mut self, handle: u64) -> Option<BoRecord> {
        if handle < 1 {
            return None;
        }
        self.records.remove(&handle)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &BoRecord> {
        self.records.values()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = BoRecord> + use<> {
        let records = std::mem::take(&mut self.records);
        records.into_values()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

impl Process {
    /// Record an allocation of `length` bytes at `start` for `device`,
    /// returning its handle. Binds the device on first use. The entry also
    /// lands in the process interval index for range lookups.
    pub fn create_handle(
        &self,
        device: &Arc<GpuDevice>,
        mem: MemoryObjectHandle,
        start: u64,
        length: u64,
        shared: Option<Arc<SharedObject>>,
    ) -> u64 {
        debug_assert!(length >= 1);
        let last = start + length - 1;

        self.bind_device(device);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let pdd = state
            .devices
            .iter_mut()
            .find(|pdd| pdd.device.id() == device.id())
            .expect("device bound above");
        let handle = pdd.handles.insert(start, last, mem, shared);
        state.bo_index.insert(
            start,
            last,
            BoKey {
                device_id: device.id(),
                handle,
            },
        );
        handle
    }

    /// O(1) handle lookup on `device_id`'s table.
    pub fn find_by_handle(&self, device_id: u32, handle: u64) -> UserptrResult<BufferHandleEntry> {
        let state = self.state.lock();
        state
            .devices
            .iter()
            .find(|pdd| pdd.device.id() == device_id)
            .and_then(|pdd| pdd.handles.get(handle))
            .map(|record| BufferHandleEntry {
                handle: record.handle,
                device_id,
                start: record.start,
                last: record.last,
                mem: record.mem,
            })
            .ok_or(UserptrError::InvalidHandle(handle))
    }

    /// Resolve `[start, last]` to the single allocation covering it.
    ///
    /// A range touching no allocation and a range touching more than one
    /// are both errors; a handle-level operation must never guess between
    /// candidates.
    pub fn find_by_range(&self, start: u64, last: u64) -> UserptrResult<BufferHandleEntry> {
        let state = self.state.lock();

        let Some(first) = state.bo_index.first_overlap(start, last) else {
            error!(
                pasid = self.pasid(),
                "0x{start:x}-0x{last:x} does not relate to an existing buffer"
            );
            return Err(UserptrError::NoBufferForRange { start, end: last });
        };
        if state.bo_index.next_overlap(first, start, last).is_some() {
            error!(
                pasid = self.pasid(),
                "0x{start:x}-0x{last:x} spans more than a single buffer"
            );
            return Err(UserptrError::RangeSpansMultiple { start, end: last });
        }

        let node = state.bo_index.get(first).expect("overlap key just found");
        let key = *node.items.first().expect("directory nodes carry one record");
        drop(state);
        self.find_by_handle(key.device_id, key.handle)
    }

    /// Drop the entry for `handle`, releasing its shared-object reference
    /// and its interval-index node.
    pub fn remove_handle(&self, device_id: u32, handle: u64) -> UserptrResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let record = state
            .devices
            .iter_mut()
            .find(|pdd| pdd.device.id() == device_id)
            .and_then(|pdd| pdd.handles.remove(handle))
            .ok_or(UserptrError::InvalidHandle(handle))?;

        // Cross-process reference goes first, then the entry itself.
        drop(record.shared);
        state.bo_index.remove(record.start);
        Ok(())
    }

    /// Outstanding allocations across every bound device.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.state
            .lock()
            .devices
            .iter()
            .map(|pdd| pdd.handles.len())
            .sum()
    }
}
