// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! This crate captures the call stack of every live thread in its own
//! process, on demand, and renders a de-duplicated, symbolized report.
//!
//! Architecturally, it consists of two parts:
//! 1. An in-process collection protocol.  [`collect`] enumerates the threads
//!    of the current process and directs a real-time signal at each one,
//!    carrying a pointer to a per-thread form in the signal payload.  Each
//!    target's signal handler unwinds its own stack from the interrupted
//!    context, fills in the form, and acknowledges over a pipe with a single
//!    byte.  The collector waits on the pipe together with a one-shot timer
//!    fd, so a target that dies, never responds, or keeps the signal blocked
//!    cannot hang the caller.  The handler runs under the async-signal-safety
//!    constraints described in
//!    <https://man7.org/linux/man-pages/man7/signal-safety.7.html>: no heap
//!    allocation, no locks, no formatted I/O.  Everything it touches is
//!    pre-allocated by the collector.
//! 2. An external request service.  A foreign process can raise a second
//!    real-time signal ([`external_signum`]) at this process.  The signal
//!    handler cannot run a collection itself, so it forwards the request over
//!    a pipe to a dedicated service thread, which performs a full collection
//!    and writes the bannered report to standard error.  The service thread
//!    is started at most once per process and lives until process exit.
//!
//! The handlers must be installed before either path is used:
//! [`install_internal_handler`] for in-process collection, and additionally
//! [`install_external_handler`] for the signal-triggered dumps.

#![cfg(target_os = "linux")]

mod collector;
mod report;
mod service;
mod shared;
mod signals;

pub use collector::api::{collect, collect_with_timeout, CollectError};
pub use collector::signal_handler::install_internal_handler;
pub use collector::stack_form::{Frame, ThreadStack, MAX_STACK_DEPTH};
pub use report::{
    capture_backtrace, log_backtrace, pretty_print_stack, resolve_symbol, to_pretty_string,
    to_pretty_string_with, UniqueStack,
};
pub use service::install_external_handler;
pub use shared::constants::DEFAULT_COLLECT_TIMEOUT;
pub use signals::{external_signum, internal_signum};
