//! Allocation accounting lives in its own binary so no other test allocates concurrently.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicIsize, Ordering};

use handoff::{Manager, Status};
use more_asserts::{assert_ge, assert_le};
use pretty_assertions::assert_eq;

struct Counting;

static OUTSTANDING: AtomicIsize = AtomicIsize::new(0);

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            OUTSTANDING.fetch_add(1, Ordering::SeqCst);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        OUTSTANDING.fetch_sub(1, Ordering::SeqCst);
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static ALLOCATOR: Counting = Counting;

fn outstanding() -> isize {
    OUTSTANDING.load(Ordering::SeqCst)
}

/// Runs `k` coroutines: even ones to completion, odd ones up to their first yield. Returns how
/// many coroutines were left suspended at manager drop.
fn run(k: usize, drain: bool) -> usize {
    let manager = Manager::new();
    manager.set_teardown_policy(drain);
    let mut coroutines: Vec<_> = (0..k)
        .map(|i| {
            let weak = manager.downgrade();
            let captured = vec![i; 16];
            manager.create(move || {
                drop(captured);
                for _ in 0..=i % 3 {
                    weak.yield_now();
                }
            })
        })
        .collect();
    for (i, co) in coroutines.iter_mut().enumerate() {
        if i % 2 == 0 {
            while manager.resume(co) {}
            assert_eq!(co.status(), Status::Stopped);
        } else {
            assert_eq!(manager.resume(co), true);
            assert_eq!(co.status(), Status::Ready);
        }
    }
    let suspended = k / 2;
    assert_eq!(manager.len(), suspended);
    drop(manager);
    for co in coroutines.iter() {
        assert_eq!(co.status(), Status::Stopped);
    }
    drop(coroutines);
    suspended
}

#[test]
fn no_leak_no_double_free() {
    // Warm up lazily initialized statics.
    run(4, false);
    run(4, true);

    // Drained coroutines unwind their stacks completely.
    let baseline = outstanding();
    run(32, true);
    assert_eq!(outstanding(), baseline);

    // Reclaimed coroutines leak what sits on their abandoned stacks: the boxed body and the
    // manager allocation its weak reference keeps.
    let baseline = outstanding();
    let abandoned = run(32, false) as isize;
    assert_ge!(outstanding(), baseline);
    assert_le!(outstanding(), baseline + abandoned + 1);

    // Control blocks, contexts and unstarted entries are all released.
    let baseline = outstanding();
    run(32, true);
    assert_eq!(outstanding(), baseline);
}
