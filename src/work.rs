//! Deferred and delayed task execution.
//!
//! Invalidation callbacks run in contexts where blocking or tearing down
//! heavyweight state is off limits, so destruction and the eviction/restore
//! cycle run on a dedicated worker thread instead. [`DelayedWork`] items are
//! reusable descriptors bound to their closure once, re-armed across
//! eviction cycles, and support the synchronous cancellation that process
//! teardown depends on.

use parking_lot::{Condvar, Mutex};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type OnceFn = Box<dyn FnOnce() + Send>;
type RepeatFn = Box<dyn Fn() + Send + Sync>;

enum Job {
    Once(OnceFn),
    Delayed(Arc<DelayedInner>, u64),
}

struct Entry {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct WqState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct WqShared {
    state: Mutex<WqState>,
    cv: Condvar,
}

impl WqShared {
    fn push(&self, due: Instant, job: Job) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry { due, seq, job });
        self.cv.notify_one();
    }
}

/// A single background worker draining a deadline-ordered queue. Tasks run
/// on the worker thread, never on the thread that submitted them.
pub struct WorkQueue {
    shared: Arc<WqShared>,
    worker: Option<JoinHandle<()>>,
}

impl WorkQueue {
    #[must_use]
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(WqShared {
            state: Mutex::new(WqState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&thread_shared))
            .expect("spawn work queue thread");

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Run `f` on the worker thread as soon as possible.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.push(Instant::now(), Job::Once(Box::new(f)));
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.cv.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &WqShared) {
    loop {
        let entry = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                let next_due = state.heap.peek().map(|entry| entry.due);
                match next_due {
                    None => shared.cv.wait(&mut state),
                    Some(due) if due <= Instant::now() => {
                        break state.heap.pop().expect("non-empty heap");
                    }
                    Some(due) => {
                        shared.cv.wait_until(&mut state, due);
                    }
                }
            }
        };

        match entry.job {
            Job::Once(f) => f(),
            Job::Delayed(inner, generation) => inner.run_if_current(generation),
        }
    }
}

#[derive(Debug)]
struct DwState {
    generation: u64,
    pending: Option<u64>,
    running: bool,
}

struct DelayedInner {
    func: RepeatFn,
    state: Mutex<DwState>,
    cv: Condvar,
    wq: Arc<WqShared>,
}

impl DelayedInner {
    fn run_if_current(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            // A cancel or re-arm after this entry was queued makes it stale.
            if state.pending != Some(generation) {
                return;
            }
            state.pending = None;
            state.running = true;
        }

        (self.func)();

        let mut state = self.state.lock();
        state.running = false;
        self.cv.notify_all();
    }
}

/// Reusable delayed-task descriptor.
///
/// The closure is fixed at construction; each [`schedule`](Self::schedule)
/// or [`reschedule`](Self::reschedule) arms one future run on the owning
/// [`WorkQueue`]. The closure may re-arm its own descriptor, but must never
/// call [`cancel_sync`](Self::cancel_sync) on it.
pub struct DelayedWork {
    inner: Arc<DelayedInner>,
}

impl DelayedWork {
    #[must_use]
    pub fn new(wq: &Arc<WorkQueue>, func: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(DelayedInner {
                func: Box::new(func),
                state: Mutex::new(DwState {
                    generation: 0,
                    pending: None,
                    running: false,
                }),
                cv: Condvar::new(),
                wq: wq.shared.clone(),
            }),
        }
    }

    /// Arm a run at `delay` from now. No-op while a run is already pending;
    /// returns whether this call armed it.
    pub fn schedule(&self, delay: Duration) -> bool {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.pending.is_some() {
                return false;
            }
            state.generation += 1;
            state.pending = Some(state.generation);
            state.generation
        };
        self.inner.wq.push(
            Instant::now() + delay,
            Job::Delayed(self.inner.clone(), generation),
        );
        true
    }

    /// Arm a run at `delay` from now, replacing any pending run.
    pub fn reschedule(&self, delay: Duration) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.pending = Some(state.generation);
            state.generation
        };
        self.inner.wq.push(
            Instant::now() + delay,
            Job::Delayed(self.inner.clone(), generation),
        );
    }

    /// Cancel any pending run and wait for a run already in progress to
    /// finish. After this returns, the closure is not and will not be
    /// executing until the descriptor is armed again.
    pub fn cancel_sync(&self) {
        let mut state = self.inner.state.lock();
        state.pending = None;
        state.generation += 1;
        while state.running {
            self.inner.cv.wait(&mut state);
        }
    }

    /// Whether a run is currently armed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }
}
