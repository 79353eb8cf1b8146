// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spawns a few parked worker threads, then prints a grouped stack report
//! for every thread of this process.

use datadog_threadstacks::{collect, install_internal_handler, to_pretty_string};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    install_internal_handler()?;

    let state = Arc::new((Mutex::new(false), Condvar::new()));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let state = Arc::clone(&state);
        handles.push(std::thread::spawn(move || {
            let (lock, cvar) = &*state;
            let mut released = lock.lock().unwrap();
            while !*released {
                released = cvar.wait(released).unwrap();
            }
        }));
    }
    std::thread::sleep(Duration::from_millis(200));

    let results = collect()?;
    print!("{}", to_pretty_string(&results));

    let (lock, cvar) = &*state;
    *lock.lock().unwrap() = true;
    cvar.notify_all();
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}
