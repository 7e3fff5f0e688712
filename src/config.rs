use std::time::Duration;

/// Approx. wait time before attempting to restore evicted buffers.
pub const PROCESS_RESTORE_TIME_MS: u64 = 100;
/// Approx. back off time if restore fails due to lack of memory.
pub const PROCESS_BACK_OFF_TIME_MS: u64 = 100;
/// Approx. time a process stays active before evicting it again is honored.
pub const PROCESS_ACTIVE_TIME_MS: u64 = 10;

/// Tuning knobs for the notifier and eviction machinery.
///
/// The defaults reproduce the driver's stock timings. Embedders that need a
/// bounded fence wait or a different restore policy override individual
/// fields and pass the result to [`GpuDevice::new`](crate::GpuDevice::new)
/// and [`ProcessTable::new`](crate::ProcessTable::new).
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Delay between the eviction pass and the first restore attempt.
    pub restore_delay: Duration,
    /// Delay before retrying a restore that failed under memory pressure.
    pub backoff_delay: Duration,
    /// Minimum time a process stays active after a restore before a new
    /// eviction trigger takes effect.
    pub min_active_time: Duration,
    /// Upper bound on consecutive failed restore attempts. `None` retries
    /// until the attempt succeeds.
    pub max_restore_retries: Option<u32>,
    /// Budget for the synchronous fence waits on the invalidate and quiesce
    /// paths. Effectively unbounded by default: a stuck GPU job shows up as
    /// a stuck callback, never as a silently stale mapping.
    pub fence_wait_budget: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            restore_delay: Duration::from_millis(PROCESS_RESTORE_TIME_MS),
            backoff_delay: Duration::from_millis(PROCESS_BACK_OFF_TIME_MS),
            min_active_time: Duration::from_millis(PROCESS_ACTIVE_TIME_MS),
            max_restore_retries: Some(300),
            fence_wait_budget: Duration::from_secs(u32::MAX as u64),
        }
    }
}
