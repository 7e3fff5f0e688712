//! Inert collaborator doubles shared by the unit tests.

use crate::config::CoreConfig;
use crate::error::UserptrResult;
use crate::gpu::{GpuDevice, GpuVm, MemoryObjectHandle, QueueController};
use std::sync::Arc;

pub(crate) struct NullVm;

impl GpuVm for NullVm {
    fn map(&self, _mem: MemoryObjectHandle) -> UserptrResult<()> {
        Ok(())
    }

    fn unmap(&self, _mem: MemoryObjectHandle) -> UserptrResult<()> {
        Ok(())
    }

    fn mark_user_pages_dirty(&self, _mem: MemoryObjectHandle) {}
}

pub(crate) struct NullQueues;

impl QueueController for NullQueues {
    fn quiesce(&self, _pasid: u32) {}

    fn resume(&self, _pasid: u32) {}
}

pub(crate) fn test_device(id: u32) -> Arc<GpuDevice> {
    GpuDevice::new(id, CoreConfig::default(), Arc::new(NullVm), Arc::new(NullQueues))
}
