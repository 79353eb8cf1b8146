// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The handler for the internal collection signal, and the thread-directed
//! queued-signal delivery the collector fans out with.
//!
//! The handler runs on the target thread inside an asynchronous signal
//! context and therefore only uses async-signal-safe operations: getpid,
//! reads of the delivered siginfo, the non-allocating unwinder, and direct
//! writes to the ack fd and stderr.

use super::stack_form::StackTraceForm;
use super::unwinder::capture_from_ucontext;
use crate::shared::err_log;
use crate::signals::internal_signum;
use nix::errno::Errno;
use nix::unistd::Pid;

pub(crate) type SignalHandlerFn =
    extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Registers the handler for the internal stack collection signal.
///
/// Must be called (once) before [`crate::collect`]; without it the default
/// disposition of the real-time signal would terminate the process.
pub fn install_internal_handler() -> anyhow::Result<()> {
    install_sigaction(internal_signum(), internal_handler)
}

/// Registers `handler` with three-argument semantics and restart-on-interrupt
/// for `signum`.
pub(crate) fn install_sigaction(
    signum: libc::c_int,
    handler: SignalHandlerFn,
) -> anyhow::Result<()> {
    // SA_RESTART so supported syscalls of the interrupted thread resume after
    // the handler returns; SA_SIGINFO for the payload-carrying handler form.
    // SAFETY: zeroed sigaction is a valid starting point on Linux, and the
    // handler only performs async-signal-safe work.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    let rc = unsafe { libc::sigaction(signum, &action, std::ptr::null_mut()) };
    anyhow::ensure!(
        rc == 0,
        "sigaction({signum}) failed: {}",
        std::io::Error::last_os_error()
    );
    Ok(())
}

extern "C" fn internal_handler(
    _signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    if info.is_null() {
        err_log("Stack collection signal delivered without siginfo, ignoring...\n");
        return;
    }
    // The collection signal is normally sent by the in-process collector, but
    // anything authorized can queue it (e.g. `kill`).  Ignore those: their
    // payload is not one of our forms.
    // SAFETY: getpid and the siginfo reads are async-signal-safe.
    if unsafe { (*info).si_pid() } != unsafe { libc::getpid() } {
        err_log("Ignoring stack collection signal sent from an outsider pid...\n");
        return;
    }
    let form = unsafe { (*info).si_value().sival_ptr } as *mut StackTraceForm;
    if form.is_null() {
        err_log("Couldn't retrieve stack trace form pointer, ignoring signal...\n");
        return;
    }
    // SAFETY: the collector keeps the form alive until it has read the ack
    // (or deliberately leaks it on timeout), and this handler is the only
    // writer for the form's lifetime.
    let form = unsafe { &mut *form };
    unsafe { capture_from_ucontext(ucontext, 0, form.stack_mut()) };
    if !form.submit() {
        err_log("Failed to submit stack trace form...\n");
    }
}

// The raw siginfo handed to rt_tgsigqueueinfo, laid out like the kernel's
// rt-signal variant of the sifields union.  Mirrors what pthread_sigqueue()
// builds internally; we cannot use pthread_sigqueue itself because it wants
// pthread_t handles rather than kernel tids.
#[repr(C)]
#[derive(Clone, Copy)]
struct RtSigFields {
    si_pid: libc::pid_t,
    si_uid: libc::uid_t,
    si_value: *mut libc::c_void,
}

#[repr(C)]
union SigInfoFields {
    rt: RtSigFields,
    _pad: [libc::c_int; 28],
}

#[repr(C)]
struct RawSigInfo {
    si_signo: libc::c_int,
    si_errno: libc::c_int,
    si_code: libc::c_int,
    fields: SigInfoFields,
}

const _: () = assert!(
    std::mem::size_of::<RawSigInfo>() == std::mem::size_of::<libc::siginfo_t>(),
    "raw siginfo layout must match the kernel's"
);

/// Queues `signum` at exactly the thread `tid` of process `pid`, with the
/// form pointer as payload.
///
/// sigqueue(2) cannot direct a signal at a precise thread (the kernel picks
/// any thread of the group), so this goes through rt_tgsigqueueinfo instead.
pub(crate) fn signal_thread(
    pid: Pid,
    tid: Pid,
    uid: libc::uid_t,
    signum: libc::c_int,
    form: *mut StackTraceForm,
) -> nix::Result<()> {
    let mut info = RawSigInfo {
        si_signo: signum,
        si_errno: 0,
        si_code: libc::SI_QUEUE,
        fields: SigInfoFields {
            rt: RtSigFields {
                si_pid: pid.as_raw(),
                si_uid: uid,
                si_value: form.cast(),
            },
        },
    };
    // SAFETY: info is a fully initialized siginfo-sized buffer and the
    // syscall only reads it.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_rt_tgsigqueueinfo,
            pid.as_raw() as libc::c_long,
            tid.as_raw() as libc::c_long,
            signum as libc::c_long,
            &mut info as *mut RawSigInfo,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(Errno::last())
    }
}
