use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 7;
        assert!(l.is_locked());
    }

    assert!(!l.is_locked());
    assert_eq!(*l.lock(), 7);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(1u8);

    let held = l.try_lock();
    assert!(held.is_some());
    assert!(l.try_lock().is_none());

    drop(held);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_returns_closure_result() {
    let l = SpinLock::new(vec![1, 2]);
    let len = l.with_lock(|v| {
        v.push(3);
        v.len()
    });
    assert_eq!(len, 3);
    assert!(!l.is_locked());
}

#[test]
fn get_mut_and_into_inner_bypass_the_lock() {
    let mut l = SpinLock::new(String::from("frame"));
    l.get_mut().push_str("s");
    assert_eq!(l.into_inner(), "frames");
}

#[test]
fn lock_yielding_does_not_relax_when_free() {
    let l = SpinLock::new(());
    let mut relaxed = 0;
    drop(l.lock_yielding(|| relaxed += 1));
    assert_eq!(relaxed, 0);
}

#[test]
fn lock_yielding_relaxes_until_holder_releases() {
    let lock = Arc::new(SpinLock::new(0usize));
    let yields = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(2));

    let guard = lock.lock();

    let waiter = {
        let lock = Arc::clone(&lock);
        let yields = Arc::clone(&yields);
        let start = Arc::clone(&start);
        thread::spawn(move || {
            start.wait();
            let mut g = lock.lock_yielding(|| {
                yields.fetch_add(1, Ordering::SeqCst);
                thread::yield_now();
            });
            *g += 1;
        })
    };

    start.wait();
    // Keep the lock until the waiter has observed it held at least once.
    while yields.load(Ordering::SeqCst) == 0 {
        thread::yield_now();
    }
    drop(guard);

    waiter.join().unwrap();
    assert_eq!(*lock.lock(), 1);
    assert!(yields.load(Ordering::SeqCst) >= 1);
}

#[test]
fn contended_increments_are_exact() {
    let threads = 4;
    let iters = 2_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    let mut g = lock.lock_yielding(thread::yield_now);
                    assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0);
                    *g += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(*lock.lock(), threads * iters);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 99;
            panic!("boom");
        });
    }));
    assert!(res.is_err());
    assert!(!l.is_locked());
    assert_eq!(l.with_lock(|v| *v), 99);
}
