// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::signal_handler::signal_thread;
use super::stack_form::{StackTraceForm, ThreadStack};
use crate::report::UniqueStack;
use crate::shared::constants::DEFAULT_COLLECT_TIMEOUT;
use crate::signals::internal_signum;
use ddcommon::unix_utils::{list_threads, ListThreadsError};
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::unistd::{getpid, getuid, pipe};
use std::collections::BTreeMap;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("Failed to list the threads of this process: {0}")]
    ListThreads(#[from] ListThreadsError),
    #[error("Failed to create the ack pipe: {0}")]
    AckPipe(#[source] Errno),
    #[error("Failed to arm the collection timer: {0}")]
    Timer(#[source] Errno),
    #[error("Failed to get all ({expected}) stacktraces within timeout. Got only {acks}")]
    Timeout { expected: usize, acks: usize },
}

/// Collects the call stack of every live thread of this process and groups
/// structurally identical traces into one [`UniqueStack`] each.
///
/// PRECONDITIONS:
///     [`crate::install_internal_handler`] must have been called, or the
///     default disposition of the collection signal terminates the process.
/// ATOMICITY:
///     All-or-nothing: either every awaited thread acknowledged within the
///     default timeout and the grouped results are returned, or an error is
///     returned with no results.  Threads created after enumeration are not
///     captured; threads that exited since enumeration are skipped.
pub fn collect() -> Result<Vec<UniqueStack>, CollectError> {
    collect_with_timeout(DEFAULT_COLLECT_TIMEOUT)
}

/// Same as [`collect`] with a caller-chosen ack deadline.
pub fn collect_with_timeout(timeout: Duration) -> Result<Vec<UniqueStack>, CollectError> {
    let tids = list_threads()?;

    // Both pipe ends stay in this scope so every exit path closes them (the
    // timeout path deliberately leaks instead, see below).
    let (ack_rx, ack_tx) = pipe().map_err(CollectError::AckPipe)?;

    let pid = getpid();
    let uid = getuid().as_raw();

    // One form per target thread.  The forms are boxed and immediately turned
    // into raw pointers: the pointer travels through the signal payload to
    // the target's handler, and the box is only reconstructed (or leaked, on
    // timeout) once no handler can be holding it any more.
    let mut forms: Vec<*mut StackTraceForm> = Vec::with_capacity(tids.len());
    for tid in tids {
        let form = Box::into_raw(Box::new(StackTraceForm::new(tid.as_raw(), ack_tx.as_raw_fd())));
        match signal_thread(pid, tid, uid, internal_signum(), form) {
            Ok(()) => forms.push(form),
            Err(err) => {
                // Typically the thread exited since enumeration; it leaves
                // the awaited set.  The signal was never queued, so the
                // pointer never escaped.
                log::warn!("unable to signal thread {tid}: {err}");
                // SAFETY: reclaiming the box created just above.
                drop(unsafe { Box::from_raw(form) });
            }
        }
    }

    let timer =
        TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_CLOEXEC).map_err(CollectError::Timer)?;
    timer
        .set(
            Expiration::OneShot(TimeSpec::from_duration(timeout)),
            TimerSetTimeFlags::empty(),
        )
        .map_err(CollectError::Timer)?;

    set_nonblocking(ack_rx.as_raw_fd()).map_err(CollectError::AckPipe)?;

    let expected = forms.len();
    let mut acks = 0usize;
    while acks < expected {
        let mut poll_fds = [
            libc::pollfd {
                fd: ack_rx.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: timer.as_fd().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        // No timeout on the wait itself; the timer fd is the deadline.  Note
        // that our own thread is among the targets, so this poll is routinely
        // interrupted by the collection signal.
        // SAFETY: poll_fds outlives the call.
        let rc = unsafe { libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, -1) };
        if rc == -1 {
            let err = Errno::last();
            if err != Errno::EINTR {
                log::warn!("poll on the ack pipe failed, retrying: {err}");
            }
            continue;
        }
        if poll_fds[0].revents & libc::POLLIN != 0 {
            // The pipe is non-blocking: if poll reported readiness spuriously
            // the read returns EAGAIN instead of hanging the whole process.
            let mut byte = [0u8; 1];
            let n = unsafe { libc::read(ack_rx.as_raw_fd(), byte.as_mut_ptr().cast(), 1) };
            match n {
                1 => acks += 1,
                -1 if Errno::last() == Errno::EAGAIN => {}
                -1 => log::warn!("failed to read an ack from the pipe: {}", Errno::last()),
                n => log::warn!("unexpected ack read length: {n}"),
            }
        } else if poll_fds[1].revents & libc::POLLIN != 0 {
            // Some awaited thread never acked.  Its handler may still hold a
            // pointer into the forms, so the forms stay leaked and the pipe
            // ends are forgotten rather than closed: a straggler that fires
            // later writes into a still-open pipe nobody reads, not into
            // freed memory or a recycled fd.
            std::mem::forget(ack_rx);
            std::mem::forget(ack_tx);
            return Err(CollectError::Timeout { expected, acks });
        }
    }

    // Every awaited thread acked, and each ack was written after its handler
    // finished with the form; reading the acks above is the happens-before
    // edge that makes reclaiming the boxes sound.
    let forms: Vec<Box<StackTraceForm>> = forms
        .into_iter()
        // SAFETY: created by Box::into_raw during fan-out, never freed since.
        .map(|form| unsafe { Box::from_raw(form) })
        .collect();
    Ok(group_forms(&forms))
}

/// Groups acknowledged forms by structural equality of their traces.  The
/// BTreeMap ordering (depth, then address sequence) makes the result order
/// deterministic for a given multiset of traces.
fn group_forms(forms: &[Box<StackTraceForm>]) -> Vec<UniqueStack> {
    let mut groups: BTreeMap<&ThreadStack, Vec<libc::pid_t>> = BTreeMap::new();
    for form in forms {
        groups
            .entry(form.stack())
            .or_default()
            .push(form.stack().tid());
    }
    groups
        .into_iter()
        .map(|(trace, mut tids)| {
            tids.sort_unstable();
            UniqueStack {
                tids,
                trace: trace.clone(),
            }
        })
        .collect()
}

fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    // SAFETY: plain fcntl flag manipulation on an fd this function's caller owns.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(Errno::last());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(Errno::last());
    }
    Ok(())
}
