//! Port arbitration under contention: busy rejection with the retry window,
//! release ordering, and per-port lock identity.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use switchboard::arbiter::{PortArbiter, ACQUIRE_RETRY};
use switchboard::error::Error;

#[test]
fn second_console_is_rejected_then_third_succeeds() {
    // Two acquisitions race for the same port; the loser is rejected after
    // the retry window. Once the winner releases, a third succeeds at once.
    let arbiter = Arc::new(PortArbiter::new());

    let first = arbiter.acquire("~/port3").expect("first acquisition");

    let contender = {
        let arbiter = Arc::clone(&arbiter);
        thread::spawn(move || {
            let started = Instant::now();
            let result = arbiter.acquire("~/port3");
            (result, started.elapsed())
        })
    };
    let (result, waited) = contender.join().unwrap();
    assert!(matches!(result, Err(Error::PortBusy(_))));
    // The rejection came after the retry window, not immediately.
    assert!(waited >= ACQUIRE_RETRY);

    drop(first);
    let third = arbiter.acquire("~/port3");
    assert!(third.is_ok());
}

#[test]
fn retry_window_rescues_quick_reconnects() {
    // The holder releases during the contender's retry window; the second
    // acquisition then succeeds instead of being rejected.
    let arbiter = Arc::new(PortArbiter::new());
    let first = arbiter.acquire("~/port5").expect("first acquisition");

    let releaser = {
        thread::spawn(move || {
            thread::sleep(ACQUIRE_RETRY / 2);
            drop(first);
        })
    };

    let second = arbiter.acquire("~/port5");
    assert!(second.is_ok());
    releaser.join().unwrap();
}

#[test]
fn distinct_ports_are_independent() {
    let arbiter = Arc::new(PortArbiter::new());
    let _a = arbiter.acquire("~/port1").unwrap();
    let b = arbiter.acquire("~/port2");
    assert!(b.is_ok());
    assert!(arbiter.is_active("~/port1"));
    assert!(arbiter.is_active("~/port2"));
}

#[test]
fn lease_drop_releases_even_on_panic() {
    let arbiter = Arc::new(PortArbiter::new());
    let arbiter_clone = Arc::clone(&arbiter);
    let result = thread::spawn(move || {
        let _lease = arbiter_clone.acquire("~/port9").unwrap();
        panic!("worker died mid-run");
    })
    .join();
    assert!(result.is_err());
    // Give the unwinding thread's drop a moment, then the port must be free.
    thread::sleep(Duration::from_millis(10));
    assert!(!arbiter.is_active("~/port9"));
}
