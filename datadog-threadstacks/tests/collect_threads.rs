// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end behavior of the in-process collection path, run against real
//! threads of this test binary.  Collections are serialized behind a gate so
//! the masked-thread timeout scenario cannot starve an unrelated one.

#![cfg(target_os = "linux")]

use datadog_threadstacks::{
    collect, collect_with_timeout, install_internal_handler, internal_signum, to_pretty_string,
    MAX_STACK_DEPTH,
};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Once};
use std::thread;
use std::time::Duration;

static GATE: Mutex<()> = Mutex::new(());

fn setup() -> MutexGuard<'static, ()> {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| install_internal_handler().unwrap());
    GATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

type ParkState = Arc<(Mutex<bool>, Condvar)>;

struct ParkedThreads {
    tids: Vec<libc::pid_t>,
    state: ParkState,
    handles: Vec<thread::JoinHandle<()>>,
}

/// Spawns `count` threads that all block on the same condvar, in the same
/// function, so their stacks are structurally identical.
fn park_threads(count: usize) -> ParkedThreads {
    let state: ParkState = Arc::new((Mutex::new(false), Condvar::new()));
    let (tid_tx, tid_rx) = mpsc::channel();
    let mut handles = Vec::new();
    for _ in 0..count {
        let state = Arc::clone(&state);
        let tid_tx = tid_tx.clone();
        handles.push(thread::spawn(move || {
            tid_tx.send(gettid()).unwrap();
            drop(tid_tx);
            let (lock, cvar) = &*state;
            let mut released = lock.lock().unwrap();
            while !*released {
                released = cvar.wait(released).unwrap();
            }
        }));
    }
    let tids: Vec<_> = (0..count).map(|_| tid_rx.recv().unwrap()).collect();
    // Let the threads actually reach the wait before anyone collects.
    thread::sleep(Duration::from_millis(100));
    ParkedThreads {
        tids,
        state,
        handles,
    }
}

impl ParkedThreads {
    fn release(self) {
        let (lock, cvar) = &*self.state;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        for handle in self.handles {
            handle.join().unwrap();
        }
    }
}

#[test]
fn test_collect_covers_every_thread_exactly_once() {
    let _gate = setup();
    let results = collect().unwrap();
    assert!(!results.is_empty());

    for result in &results {
        assert!(!result.tids.is_empty());
        assert!(result.trace.depth() >= 1);
        assert!(result.trace.depth() <= MAX_STACK_DEPTH);
    }

    let mut tids: Vec<_> = results
        .iter()
        .flat_map(|result| result.tids.iter().copied())
        .collect();
    let total = tids.len();
    tids.sort_unstable();
    tids.dedup();
    assert_eq!(total, tids.len(), "a tid appeared in more than one result");
    assert!(tids.contains(&gettid()));
}

#[test]
fn test_threads_parked_together_share_one_result() {
    let _gate = setup();
    let parked = park_threads(2);
    let (a, b) = (parked.tids[0], parked.tids[1]);

    let results = collect().unwrap();
    let holder = results
        .iter()
        .find(|result| result.tids.contains(&a))
        .expect("parked thread missing from the results");
    assert!(
        holder.tids.contains(&b),
        "identically parked threads were not grouped: {:?}",
        results.iter().map(|r| &r.tids).collect::<Vec<_>>()
    );
    let mut sorted = holder.tids.clone();
    sorted.sort_unstable();
    assert_eq!(holder.tids, sorted, "result tids are not sorted");

    // Grouping structure is stable across a second collection of the same
    // quiescent threads.
    let again = collect().unwrap();
    let holder = again
        .iter()
        .find(|result| result.tids.contains(&a))
        .expect("parked thread missing from the second collection");
    assert!(holder.tids.contains(&b));

    parked.release();
}

macro_rules! parked_worker {
    ($name:ident, $id:expr) => {
        #[inline(never)]
        fn $name(state: ParkState, tid_tx: mpsc::Sender<libc::pid_t>) {
            tid_tx.send(gettid()).unwrap();
            drop(tid_tx);
            let (lock, cvar) = &*state;
            let mut released = lock.lock().unwrap();
            while !*released {
                released = cvar.wait(released).unwrap();
            }
            std::hint::black_box($id);
        }
    };
}

parked_worker!(parked_worker_one, 1);
parked_worker!(parked_worker_two, 2);
parked_worker!(parked_worker_three, 3);
parked_worker!(parked_worker_four, 4);
parked_worker!(parked_worker_five, 5);
parked_worker!(parked_worker_six, 6);
parked_worker!(parked_worker_seven, 7);
parked_worker!(parked_worker_eight, 8);
parked_worker!(parked_worker_nine, 9);
parked_worker!(parked_worker_ten, 10);

#[test]
fn test_threads_in_distinct_functions_get_distinct_results() {
    let _gate = setup();
    let workers: Vec<fn(ParkState, mpsc::Sender<libc::pid_t>)> = vec![
        parked_worker_one,
        parked_worker_two,
        parked_worker_three,
        parked_worker_four,
        parked_worker_five,
        parked_worker_six,
        parked_worker_seven,
        parked_worker_eight,
        parked_worker_nine,
        parked_worker_ten,
    ];
    let state: ParkState = Arc::new((Mutex::new(false), Condvar::new()));
    let (tid_tx, tid_rx) = mpsc::channel();
    let mut handles = Vec::new();
    for worker in workers {
        let state = Arc::clone(&state);
        let tid_tx = tid_tx.clone();
        handles.push(thread::spawn(move || worker(state, tid_tx)));
    }
    drop(tid_tx);
    let tids: Vec<_> = tid_rx.iter().collect();
    assert_eq!(tids.len(), 10);
    thread::sleep(Duration::from_millis(100));

    let results = collect().unwrap();
    for tid in &tids {
        let holder = results
            .iter()
            .find(|result| result.tids.contains(tid))
            .expect("worker thread missing from the results");
        assert_eq!(
            holder.tids,
            vec![*tid],
            "workers in distinct functions must not share a result"
        );
    }

    let (lock, cvar) = &*state;
    *lock.lock().unwrap() = true;
    cvar.notify_all();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_masked_thread_forces_timeout() {
    let _gate = setup();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, internal_signum());
            assert_eq!(
                libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()),
                0
            );
        }
        ready_tx.send(()).unwrap();
        stop_rx.recv().unwrap();
    });
    ready_rx.recv().unwrap();

    let err = collect_with_timeout(Duration::from_millis(300)).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Got only"), "unexpected error: {message}");

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

#[test]
fn test_report_renders_for_live_collection() {
    let _gate = setup();
    let results = collect().unwrap();
    let text = to_pretty_string(&results);
    assert!(text.contains("Threads: "));
    assert!(text.contains("Stack trace:"));
    assert!(text.contains("PC: @ 0x"));
    // The collector's own thread was interrupted inside the ack wait, so its
    // trace symbolizes into this crate's collection routine.
    assert!(text.contains("collect"), "report was:\n{text}");
}
