// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub(crate) mod constants;

/// Writes a fixed diagnostic message to the standard error file descriptor.
///
/// This is the only logging primitive allowed in code reachable from a signal
/// handler: a single direct `write(2)` of a preformatted byte string.  The
/// result is discarded; there is no fallback channel if stderr is gone.
pub(crate) fn err_log(msg: &str) {
    // SAFETY: write(2) is async-signal-safe and the buffer outlives the call.
    let _ = unsafe { libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len()) };
}
