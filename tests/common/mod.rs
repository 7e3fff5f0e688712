//! Recording collaborator doubles shared by the integration tests.

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use userptr_rs::{
    FenceSet, GpuVm, MemoryObjectHandle, QueueController, UserptrError, UserptrResult, WaitError,
};

/// Fence the test signals by hand. Starts signaled unless built with
/// [`TestFence::unsignaled`].
pub struct TestFence {
    signaled: Mutex<bool>,
    cv: Condvar,
    waits: AtomicU32,
}

impl TestFence {
    pub fn signaled() -> Arc<Self> {
        Arc::new(Self {
            signaled: Mutex::new(true),
            cv: Condvar::new(),
            waits: AtomicU32::new(0),
        })
    }

    pub fn unsignaled() -> Arc<Self> {
        Arc::new(Self {
            signaled: Mutex::new(false),
            cv: Condvar::new(),
            waits: AtomicU32::new(0),
        })
    }

    pub fn signal(&self) {
        *self.signaled.lock() = true;
        self.cv.notify_all();
    }

    pub fn wait_count(&self) -> u32 {
        self.waits.load(Ordering::SeqCst)
    }
}

impl FenceSet for TestFence {
    fn wait_timeout(&self, _interruptible: bool, timeout: Duration) -> Result<Duration, WaitError> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cv.wait_until(&mut signaled, deadline).timed_out() {
                if *signaled {
                    break;
                }
                return Err(WaitError::Timeout);
            }
        }
        Ok(deadline.saturating_duration_since(Instant::now()))
    }
}

/// GPU VM double recording every call; `fail_maps` makes the next N map
/// calls report memory pressure.
#[derive(Default)]
pub struct RecordingVm {
    pub mapped: Mutex<Vec<u64>>,
    pub unmapped: Mutex<Vec<u64>>,
    pub dirtied: Mutex<Vec<u64>>,
    pub map_attempts: AtomicU32,
    pub fail_maps: AtomicU32,
}

impl RecordingVm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_maps(&self, count: u32) {
        self.fail_maps.store(count, Ordering::SeqCst);
    }

    pub fn mapped_count(&self) -> usize {
        self.mapped.lock().len()
    }

    pub fn unmapped_count(&self) -> usize {
        self.unmapped.lock().len()
    }

    pub fn dirtied_count(&self) -> usize {
        self.dirtied.lock().len()
    }
}

impl GpuVm for RecordingVm {
    fn map(&self, mem: MemoryObjectHandle) -> UserptrResult<()> {
        self.map_attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_maps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(UserptrError::OutOfMemory);
        }
        self.mapped.lock().push(mem.0);
        Ok(())
    }

    fn unmap(&self, mem: MemoryObjectHandle) -> UserptrResult<()> {
        self.unmapped.lock().push(mem.0);
        Ok(())
    }

    fn mark_user_pages_dirty(&self, mem: MemoryObjectHandle) {
        self.dirtied.lock().push(mem.0);
    }
}

/// Queue controller double recording quiesce/resume transitions.
#[derive(Default)]
pub struct RecordingQueues {
    pub quiesced: AtomicU32,
    pub resumed: AtomicU32,
}

impl RecordingQueues {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn quiesce_count(&self) -> u32 {
        self.quiesced.load(Ordering::SeqCst)
    }

    pub fn resume_count(&self) -> u32 {
        self.resumed.load(Ordering::SeqCst)
    }
}

impl QueueController for RecordingQueues {
    fn quiesce(&self, _pasid: u32) {
        self.quiesced.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self, _pasid: u32) {
        self.resumed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
