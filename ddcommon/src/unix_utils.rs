// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use nix::unistd::Pid;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ListThreadsError {
    #[error("Failed to read /proc/self/task: {0}")]
    TaskDir(#[from] io::Error),
}

/// Lists the thread id of every live thread of the current process.
///
/// The result is a snapshot taken by scanning `/proc/self/task`: threads may
/// be created or exit while the directory is being read, so entries can be
/// stale by the time the caller acts on them.
pub fn list_threads() -> Result<Vec<Pid>, ListThreadsError> {
    let mut tids = Vec::new();
    for entry in std::fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        if let Some(tid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        {
            tids.push(Pid::from_raw(tid));
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_threads_includes_self() {
        let tids = list_threads().unwrap();
        assert!(!tids.is_empty());
        assert!(tids.contains(&nix::unistd::gettid()));
    }

    #[test]
    fn test_list_threads_is_sorted() {
        let tids = list_threads().unwrap();
        let mut sorted = tids.clone();
        sorted.sort_unstable();
        assert_eq!(tids, sorted);
    }

    #[test]
    fn test_list_threads_sees_new_thread() {
        let (tid_tx, tid_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            tid_tx.send(nix::unistd::gettid()).unwrap();
            stop_rx.recv().unwrap();
        });
        let tid = tid_rx.recv().unwrap();

        let tids = list_threads().unwrap();
        assert!(tids.contains(&tid));

        stop_tx.send(()).unwrap();
        handle.join().unwrap();
    }
}
