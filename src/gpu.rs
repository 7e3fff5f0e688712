use crate::config::CoreConfig;
use crate::error::{UserptrError, UserptrResult};
use crate::notifier::registry::NotifierRegistry;
use crate::work::WorkQueue;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Handle naming a GPU memory object inside the external GPU VM component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryObjectHandle(pub u64);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("wait timed out")]
    Timeout,
    #[error("wait interrupted")]
    Interrupted,
}

impl From<WaitError> for UserptrError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout => UserptrError::WaitTimeout,
            WaitError::Interrupted => UserptrError::Interrupted,
        }
    }
}

/// A set of completion fences covering outstanding GPU work.
pub trait FenceSet: Send + Sync {
    /// Block until every fence in the set signals or `timeout` elapses.
    /// Returns the remaining budget on success.
    fn wait_timeout(&self, interruptible: bool, timeout: Duration) -> Result<Duration, WaitError>;
}

/// External GPU VM component that can map, unmap and revalidate a memory
/// object given its handle. `map` and `unmap` leave the object in a
/// consistent state on failure, so a later retry is safe.
pub trait GpuVm: Send + Sync {
    fn map(&self, mem: MemoryObjectHandle) -> UserptrResult<()>;

    fn unmap(&self, mem: MemoryObjectHandle) -> UserptrResult<()>;

    /// The backing pages of `mem` may have moved; the GPU-side page table
    /// must revalidate them before the next access.
    fn mark_user_pages_dirty(&self, mem: MemoryObjectHandle);
}

/// Command-queue control for a process, addressed by PASID: stop the GPU
/// command processor from dispatching new work (doorbell access revoked),
/// and resume it after restore.
pub trait QueueController: Send + Sync {
    fn quiesce(&self, pasid: u32);

    fn resume(&self, pasid: u32);
}

/// One GPU. Owns the per-device notifier registry and the worker that runs
/// deferred notifier destruction.
pub struct GpuDevice {
    id: u32,
    config: Arc<CoreConfig>,
    vm: Arc<dyn GpuVm>,
    queues: Arc<dyn QueueController>,
    pub(crate) notifiers: NotifierRegistry,
    pub(crate) wq: Arc<WorkQueue>,
}

impl GpuDevice {
    #[must_use]
    pub fn new(
        id: u32,
        config: CoreConfig,
        vm: Arc<dyn GpuVm>,
        queues: Arc<dyn QueueController>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            config: Arc::new(config),
            vm,
            queues,
            notifiers: NotifierRegistry::new(),
            wq: Arc::new(WorkQueue::new("gpu-mn")),
        })
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of live notifier contexts on this device (diagnostic).
    #[must_use]
    pub fn notifier_context_count(&self) -> usize {
        self.notifiers.len()
    }

    /// The live notifier context for (address space, class), if any.
    #[must_use]
    pub fn notifier_context(
        &self,
        mm_id: u64,
        class: crate::notifier::NotifierClass,
    ) -> Option<Arc<crate::notifier::NotifierContext>> {
        self.notifiers.get(mm_id, class)
    }

    pub(crate) fn config(&self) -> &Arc<CoreConfig> {
        &self.config
    }

    pub(crate) fn vm(&self) -> &Arc<dyn GpuVm> {
        &self.vm
    }

    pub(crate) fn queues(&self) -> &Arc<dyn QueueController> {
        &self.queues
    }
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice").field("id", &self.id).finish()
    }
}
