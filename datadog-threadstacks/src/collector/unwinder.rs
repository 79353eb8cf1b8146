// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack walking, callable from an asynchronous signal context.
//!
//! Note that everything here runs under the async-signal-safety rules from
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>:
//! - no heap allocation (the destination buffer is fixed-capacity and
//!   pre-allocated by the collector),
//! - no locks (`backtrace::trace_unsynchronized` takes none, unlike its
//!   synchronized sibling),
//! - diagnostics only as direct writes of fixed messages to stderr.

use super::stack_form::ThreadStack;
use crate::shared::err_log;

/// Captures the stack of the calling thread, starting at the caller's frame.
pub(crate) fn capture_current(stack: &mut ThreadStack) {
    // Skip this function's own frame from the recording.
    // SAFETY: walks only the calling thread's own stack.
    unsafe { walk(None, 1, stack) };
}

/// Captures the stack of the interrupted code, given the machine context a
/// signal handler was invoked with.
///
/// The walk starts at the handler's own frame, so frames are discarded until
/// the instruction pointer taken from `ucontext` shows up; that frame is the
/// interrupted location and becomes the first one recorded (after `skip`
/// additional frames, if requested).
///
/// # Safety
/// `ucontext` must be the context argument delivered to a signal handler (or
/// null, which records nothing).
pub(crate) unsafe fn capture_from_ucontext(
    ucontext: *mut libc::c_void,
    skip: usize,
    stack: &mut ThreadStack,
) {
    let resume_ip = if ucontext.is_null() {
        None
    } else {
        arch::instruction_pointer(ucontext.cast())
    };
    let Some(resume_ip) = resume_ip else {
        err_log("threadstacks: failed to read interrupted context registers\n");
        return;
    };
    if !walk(Some(resume_ip), skip, stack) {
        // The unwinder did not cross the signal trampoline to the interrupted
        // frame.  Record the raw walk so the caller still gets something; it
        // will include the handler frames.
        err_log("threadstacks: could not locate interrupted frame, recording raw walk\n");
        walk(None, skip, stack);
    }
}

/// Walks the current stack into `stack`.  When `resume_ip` is set, frames are
/// dropped until one with exactly that instruction pointer is seen; returns
/// false if it never shows up (in which case nothing was recorded).
///
/// Frame sizes are derived from the stack-pointer distance to the next outer
/// frame; the outermost recorded frame keeps size 0.
unsafe fn walk(resume_ip: Option<u64>, mut skip: usize, stack: &mut ThreadStack) -> bool {
    let mut seeking = resume_ip.is_some();
    let mut pending: Option<(u64, u64)> = None;
    backtrace::trace_unsynchronized(|frame| {
        let ip = frame.ip() as u64;
        if seeking {
            if Some(ip) != resume_ip {
                return true;
            }
            seeking = false;
        }
        if skip > 0 {
            skip -= 1;
            return true;
        }
        let sp = frame.sp() as u64;
        if let Some((pending_ip, pending_sp)) = pending.take() {
            stack.push_frame(frame_size_between(pending_sp, sp), pending_ip);
        }
        if stack.is_full() {
            return false;
        }
        pending = Some((ip, sp));
        true
    });
    if let Some((ip, _)) = pending {
        stack.push_frame(0, ip);
    }
    !seeking
}

fn frame_size_between(inner_sp: u64, outer_sp: u64) -> i64 {
    if inner_sp == 0 || outer_sp <= inner_sp {
        return 0;
    }
    i64::try_from(outer_sp - inner_sp).unwrap_or(0)
}

#[cfg(target_arch = "x86_64")]
mod arch {
    /// Reads the interrupted instruction pointer out of a signal context.
    pub(super) unsafe fn instruction_pointer(ucontext: *const libc::ucontext_t) -> Option<u64> {
        let ip = (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize];
        if ip == 0 {
            None
        } else {
            Some(ip as u64)
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    /// Reads the interrupted instruction pointer out of a signal context.
    pub(super) unsafe fn instruction_pointer(ucontext: *const libc::ucontext_t) -> Option<u64> {
        let ip = (*ucontext).uc_mcontext.pc;
        if ip == 0 {
            None
        } else {
            Some(ip)
        }
    }
}
