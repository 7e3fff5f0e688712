//! Registration, invalidation and teardown across the notifier path.

mod common;

use common::{RecordingQueues, RecordingVm, TestFence, wait_until};
use std::sync::Arc;
use std::time::Duration;
use userptr_rs::{
    AddressSpace, BufferObject, CoreConfig, GpuDevice, MemoryObjectHandle, NotifierClass,
    UserptrError,
};

fn test_device(vm: &Arc<RecordingVm>, queues: &Arc<RecordingQueues>) -> Arc<GpuDevice> {
    GpuDevice::new(0, CoreConfig::default(), vm.clone(), queues.clone())
}

#[test]
fn register_merges_overlapping_ranges() {
    let vm = RecordingVm::new();
    let queues = RecordingQueues::new();
    let device = test_device(&vm, &queues);
    let mm = AddressSpace::new(1);

    let bo_a = BufferObject::new(&device, MemoryObjectHandle(1), 100, TestFence::signaled());
    let bo_b = BufferObject::new(&device, MemoryObjectHandle(2), 100, TestFence::signaled());
    bo_a.register(&mm, 0).unwrap();
    bo_b.register(&mm, 50).unwrap();

    let ctx = device
        .notifier_context(mm.id(), NotifierClass::Graphics)
        .unwrap();
    assert_eq!(ctx.tracked_ranges(), vec![(0, 149, 2)]);
    assert!(bo_a.is_notifier_tracked());
    assert!(bo_b.is_notifier_tracked());
}

#[test]
fn unregister_restores_the_index() {
    let vm = RecordingVm::new();
    let queues = RecordingQueues::new();
    let device = test_device(&vm, &queues);
    let mm = AddressSpace::new(2);

    let bo_a = BufferObject::new(&device, MemoryObjectHandle(1), 0x1000, TestFence::signaled());
    let bo_b = BufferObject::new(&device, MemoryObjectHandle(2), 0x1000, TestFence::signaled());
    bo_a.register(&mm, 0x10000).unwrap();

    let ctx = device
        .notifier_context(mm.id(), NotifierClass::Graphics)
        .unwrap();
    let baseline = ctx.tracked_ranges();

    bo_b.register(&mm, 0x20000).unwrap();
    bo_b.unregister();
    assert_eq!(ctx.tracked_ranges(), baseline);
    assert!(!bo_b.is_notifier_tracked());

    bo_a.unregister();
    assert!(ctx.tracked_ranges().is_empty());

    // Unregistering twice is a no-op.
    bo_a.unregister();
    assert!(ctx.tracked_ranges().is_empty());
}

#[test]
fn graphics_invalidation_waits_and_marks_pages() {
    let vm = RecordingVm::new();
    let queues = RecordingQueues::new();
    let device = test_device(&vm, &queues);
    let mm = AddressSpace::new(3);

    let fence = TestFence::signaled();
    let bo = BufferObject::new(&device, MemoryObjectHandle(7), 0x1000, fence.clone());
    bo.register(&mm, 0x40000).unwrap();

    // Range below the registration: untouched.
    mm.invalidate_range(0x1000, 0x2000);
    assert_eq!(fence.wait_count(), 0);
    assert_eq!(vm.dirtied_count(), 0);

    // Overlapping range: waited on, then flagged for revalidation.
    mm.invalidate_range(0x40800, 0x41000);
    assert_eq!(fence.wait_count(), 1);
    assert_eq!(vm.dirtied.lock().as_slice(), &[7]);
}

#[test]
fn graphics_invalidation_survives_fence_timeout() {
    let vm = RecordingVm::new();
    let queues = RecordingQueues::new();
    let config = CoreConfig {
        fence_wait_budget: Duration::from_millis(20),
        ..CoreConfig::default()
    };
    let device = GpuDevice::new(0, config, vm.clone(), queues.clone());
    let mm = AddressSpace::new(4);

    let fence = TestFence::unsignaled();
    let bo = BufferObject::new(&device, MemoryObjectHandle(9), 0x1000, fence.clone());
    bo.register(&mm, 0).unwrap();

    // The wait times out; processing continues and still marks the pages.
    mm.invalidate_range(0, 0x1000);
    assert_eq!(fence.wait_count(), 1);
    assert_eq!(vm.dirtied.lock().as_slice(), &[9]);
}

#[test]
fn register_propagates_interruption() {
    let vm = RecordingVm::new();
    let queues = RecordingQueues::new();
    let device = test_device(&vm, &queues);
    let mm = AddressSpace::new(5);

    mm.set_interrupt_pending(true);
    let bo = BufferObject::new(&device, MemoryObjectHandle(1), 0x1000, TestFence::signaled());
    assert!(matches!(
        bo.register(&mm, 0),
        Err(UserptrError::Interrupted)
    ));
    assert_eq!(device.notifier_context_count(), 0);
    assert!(!bo.is_notifier_tracked());

    mm.set_interrupt_pending(false);
    bo.register(&mm, 0).unwrap();
    assert_eq!(device.notifier_context_count(), 1);
}

#[test]
fn register_fails_against_released_address_space() {
    let vm = RecordingVm::new();
    let queues = RecordingQueues::new();
    let device = test_device(&vm, &queues);
    let mm = AddressSpace::new(6);

    mm.release();
    let bo = BufferObject::new(&device, MemoryObjectHandle(1), 0x1000, TestFence::signaled());
    assert!(matches!(
        bo.register(&mm, 0),
        Err(UserptrError::AddressSpaceGone)
    ));
    assert_eq!(device.notifier_context_count(), 0);
}

#[test]
fn release_destroys_context_and_clears_backrefs() {
    let vm = RecordingVm::new();
    let queues = RecordingQueues::new();
    let device = test_device(&vm, &queues);
    let mm = AddressSpace::new(7);

    let bo = BufferObject::new(&device, MemoryObjectHandle(1), 0x1000, TestFence::signaled());
    bo.register(&mm, 0).unwrap();
    assert_eq!(device.notifier_context_count(), 1);

    mm.release();
    assert!(wait_until(Duration::from_secs(5), || {
        device.notifier_context_count() == 0 && !bo.is_notifier_tracked()
    }));
}

#[test]
fn destruction_blocks_on_inflight_invalidation_span() {
    let vm = RecordingVm::new();
    let queues = RecordingQueues::new();
    let device = test_device(&vm, &queues);
    let mm = AddressSpace::new(8);

    let bo = BufferObject::new(&device, MemoryObjectHandle(1), 0x1000, TestFence::signaled());
    bo.register(&mm, 0).unwrap();

    // Open an invalidation span; the context's read side stays held until
    // the matching end.
    mm.invalidate_range_start(0, 0x1000);

    mm.release();
    // The context unlinks promptly, but the binding teardown needs the
    // write side, which the open span denies.
    assert!(wait_until(Duration::from_secs(5), || {
        device.notifier_context_count() == 0
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert!(bo.is_notifier_tracked());

    mm.invalidate_range_end(0, 0x1000);
    assert!(wait_until(Duration::from_secs(5), || {
        !bo.is_notifier_tracked()
    }));
}

#[test]
fn graphics_and_compute_contexts_are_independent() {
    let vm = RecordingVm::new();
    let queues = RecordingQueues::new();
    let device = test_device(&vm, &queues);
    let mm = AddressSpace::new(9);

    let table = userptr_rs::ProcessTable::new(CoreConfig::default());
    let process = table.get_or_create(&mm, TestFence::signaled()).unwrap();

    let gfx = BufferObject::new(&device, MemoryObjectHandle(1), 0x1000, TestFence::signaled());
    let hsa = BufferObject::new_compute(
        &device,
        MemoryObjectHandle(2),
        0x1000,
        TestFence::signaled(),
        &process,
    );
    gfx.register(&mm, 0).unwrap();
    hsa.register(&mm, 0).unwrap();

    assert_eq!(device.notifier_context_count(), 2);
    let gfx_ctx = device
        .notifier_context(mm.id(), NotifierClass::Graphics)
        .unwrap();
    let hsa_ctx = device
        .notifier_context(mm.id(), NotifierClass::Compute)
        .unwrap();
    assert_eq!(gfx_ctx.tracked_ranges(), vec![(0, 0xfff, 1)]);
    assert_eq!(hsa_ctx.tracked_ranges(), vec![(0, 0xfff, 1)]);
}
