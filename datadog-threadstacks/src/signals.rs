// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The two real-time signal numbers this crate reserves.
//!
//! Real-time signals support queued delivery with a pointer-sized payload,
//! which classic signals do not.  `SIGRTMIN` is a libc function rather than a
//! constant because glibc reserves the first few kernel realtime signals for
//! its own threading internals.

use libc::c_int;

/// The signal used inside the process to ask one specific thread to record
/// its stack.  Deliveries from other processes are ignored by the handler.
pub fn internal_signum() -> c_int {
    libc::SIGRTMIN()
}

/// The signal a foreign process raises to request a stack dump onto this
/// process's standard error.
pub fn external_signum() -> c_int {
    libc::SIGRTMIN() + 1
}
