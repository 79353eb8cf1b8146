// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The out-of-band dump path: a foreign process raises the external signal,
//! and a dedicated service thread runs the collection.
//!
//! The signal handler itself cannot collect (it would need to allocate, take
//! locks, and wait), so it only bridges into the service thread: it creates a
//! fresh pipe per request and pushes the write-end fd, as raw bytes, onto the
//! long-lived request pipe.  The service thread does the unsafe-in-handler
//! work on its own time and closes the transmitted fd once the report is
//! fully on stderr, which is the requester-visible completion signal.

use crate::collector::api::collect;
use crate::collector::signal_handler::install_sigaction;
use crate::report::to_pretty_string;
use crate::shared::constants::REPORT_BANNER;
use crate::shared::err_log;
use crate::signals::external_signum;
use anyhow::Context;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::{getpid, pipe2};
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::mpsc;
use std::sync::{Mutex, OnceLock};

/// Process-wide service state.  Written exactly once, before the external
/// handler can observe it; read-only afterwards, including from the handler.
struct ExternalHandlerState {
    /// The process that started the service thread.  A forked child inherits
    /// the handler and this state but not the thread; the handler compares
    /// this against getpid() and ignores the signal on mismatch.
    server_tgid: libc::pid_t,
    /// Write end of the service thread's request pipe.
    server_fd: RawFd,
}

static EXTERNAL_STATE: OnceLock<ExternalHandlerState> = OnceLock::new();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Ensures the request service thread exists (started at most once per
/// process, regardless of how many times this is called) and registers the
/// external signal handler.
pub fn install_external_handler() -> anyhow::Result<()> {
    let _guard = INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if EXTERNAL_STATE.get().is_none() {
        let state = ExternalHandlerState::start()?;
        let _ = EXTERNAL_STATE.set(state);
    }
    install_sigaction(external_signum(), external_handler)
}

impl ExternalHandlerState {
    fn start() -> anyhow::Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel();
        // The service thread runs for the remaining lifetime of the process;
        // dropping the JoinHandle detaches it.
        std::thread::Builder::new()
            .name("threadstacks-svc".into())
            .spawn(move || request_loop(ready_tx))
            .context("failed to spawn the stack trace service thread")?;
        let server_fd = ready_rx
            .recv()
            .context("stack trace service thread exited before publishing its request fd")?
            .context("stack trace service thread failed to create its request pipe")?;
        Ok(Self {
            server_tgid: getpid().as_raw(),
            server_fd,
        })
    }
}

fn request_loop(ready: mpsc::Sender<Result<RawFd, Errno>>) {
    // O_CLOEXEC so the request pipe is not leaked into exec'd children.
    let (request_rx, request_tx) = match pipe2(OFlag::O_CLOEXEC) {
        Ok(ends) => ends,
        Err(err) => {
            log::error!("failed to create the stack trace request pipe: {err}");
            let _ = ready.send(Err(err));
            return;
        }
    };
    // The write end gets published to the signal handler and must stay usable
    // for the process lifetime: hand out the raw fd, never close it.
    let _ = ready.send(Ok(request_tx.into_raw_fd()));
    log::info!("started the external stack trace request service thread");

    let mut request_count: u64 = 0;
    loop {
        request_count += 1;
        let mut buf = [0u8; std::mem::size_of::<libc::c_int>()];
        // SAFETY: blocking read into a local buffer; this thread has nothing
        // else to do.
        let n = unsafe { libc::read(request_rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n == -1 {
            log::error!("failed to read a stack trace request: {}", Errno::last());
            continue;
        }
        if n == 0 {
            log::info!("request pipe closed, stopping the stack trace service thread");
            break;
        }
        if n as usize != buf.len() {
            log::warn!(
                "partial stack trace request: expected {} bytes, got {n}",
                buf.len()
            );
            continue;
        }
        serve_request(request_count, libc::c_int::from_ne_bytes(buf));
    }
}

/// Runs one collection and writes the bannered report to stderr.  Closing the
/// requester's fd is the requester-visible ack, so it happens strictly after
/// the report is flushed.
fn serve_request(request_count: u64, ack_fd: libc::c_int) {
    // SAFETY: the external handler transferred ownership of this fd to us
    // through the request pipe.
    let ack = unsafe { OwnedFd::from_raw_fd(ack_fd) };
    let stderr = std::io::stderr();
    let mut err = stderr.lock();
    let _ = writeln!(
        err,
        "{REPORT_BANNER}\n{request_count}) Stack traces - Start \n{REPORT_BANNER}"
    );
    match collect() {
        Ok(results) => {
            let _ = writeln!(err, "\n{}", to_pretty_string(&results));
        }
        Err(e) => {
            let _ = writeln!(err, "Stack trace collection failed: {e}");
        }
    }
    let _ = writeln!(
        err,
        "{REPORT_BANNER}\n{request_count}) Stack traces - End \n{REPORT_BANNER}"
    );
    let _ = err.flush();
    drop(ack);
}

extern "C" fn external_handler(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    let Some(state) = EXTERNAL_STATE.get() else {
        err_log("Stack trace service is not initialized, ignoring dump request...\n");
        return;
    };
    // This happens when a process forks and the child receives the signal:
    // fork does not carry the service thread over, so there is nobody to talk
    // to on the inherited fd.
    // SAFETY: getpid is async-signal-safe.
    if state.server_tgid != unsafe { libc::getpid() } {
        err_log("Not contacting a stack trace service started in a different thread group\n");
        return;
    }
    let mut request_pipe = [0 as libc::c_int; 2];
    // SAFETY: pipe(2) is async-signal-safe.
    if unsafe { libc::pipe(request_pipe.as_mut_ptr()) } == -1 {
        err_log("Failed to create a pipe for contacting the stack trace service\n");
        return;
    }
    // This handler does not wait for the request to be serviced, so its end
    // of the request's pipe closes right away; the service thread closes the
    // transmitted end after the report, completing the handshake.
    // SAFETY: close/write are async-signal-safe.
    unsafe { libc::close(request_pipe[0]) };
    let payload = request_pipe[1].to_ne_bytes();
    let written = unsafe {
        libc::write(
            state.server_fd,
            payload.as_ptr().cast(),
            payload.len(),
        )
    };
    if written != payload.len() as isize {
        err_log("Failed to send a request to the stack trace service thread\n");
        unsafe { libc::close(request_pipe[1]) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_external_handler_initializes_once() {
        install_external_handler().unwrap();
        let first = EXTERNAL_STATE.get().unwrap().server_fd;
        install_external_handler().unwrap();
        let second = EXTERNAL_STATE.get().unwrap().server_fd;
        assert_eq!(first, second);
    }

    #[test]
    fn test_serve_request_closes_requester_fd_after_report() {
        crate::install_internal_handler().unwrap();
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        serve_request(1, fds[1]);

        // The service closed the write end after the report: EOF.
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(fds[0], buf.as_mut_ptr().cast(), 1) };
        assert_eq!(n, 0);
        unsafe { libc::close(fds[0]) };
    }
}
