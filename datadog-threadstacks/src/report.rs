// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rendering of collected stacks into the human-readable report.
//!
//! Symbolization happens only here, never in a signal handler: resolving an
//! address takes locks and allocates.

use crate::collector::stack_form::ThreadStack;
use crate::collector::unwinder::capture_current;
use crate::shared::constants::LOG_BANNER;
use std::fmt::Write;

/// One group of threads that share a structurally identical stack trace.
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueStack {
    /// The sorted ids of every thread with this trace.  Never empty.
    pub tids: Vec<libc::pid_t>,
    /// A representative trace for the group.
    pub trace: ThreadStack,
}

/// Resolves an instruction address to a symbol name, demangled where
/// possible.
pub fn resolve_symbol(ip: u64) -> Option<String> {
    let mut name = None;
    backtrace::resolve(ip as usize as *mut libc::c_void, |symbol| {
        if name.is_none() {
            name = symbol.name().map(|n| n.to_string());
        }
    });
    name
}

/// Formats grouped collection results, resolving symbols in-process.
pub fn to_pretty_string(results: &[UniqueStack]) -> String {
    to_pretty_string_with(results, resolve_symbol)
}

/// Formats grouped collection results with a caller-supplied symbolizer.
/// Output is deterministic given the results and the symbolizer.
pub fn to_pretty_string_with(
    results: &[UniqueStack],
    symbolize: impl Fn(u64) -> Option<String>,
) -> String {
    let mut out = String::new();
    for result in results {
        let tids: Vec<String> = result.tids.iter().map(|tid| tid.to_string()).collect();
        let _ = writeln!(out, "Threads: {}", tids.join(", "));
        let _ = writeln!(out, "Stack trace:");
        write_pretty_trace(&mut out, &result.trace, &symbolize);
        out.push('\n');
    }
    out
}

fn write_pretty_trace(
    out: &mut String,
    trace: &ThreadStack,
    symbolize: &dyn Fn(u64) -> Option<String>,
) {
    for (depth, frame) in trace.frames().iter().enumerate() {
        let prefix = if depth == 0 { "PC: " } else { "    " };
        let symbol = symbol_or_fallback(symbolize, frame.ip);
        if frame.frame_size > 0 {
            let _ = writeln!(
                out,
                "{prefix}@ {:#018x}  {:>9}  {symbol}",
                frame.ip, frame.frame_size
            );
        } else {
            let _ = writeln!(out, "{prefix}@ {:#018x}  {:>9}  {symbol}", frame.ip, "unknown");
        }
    }
}

fn symbol_or_fallback(symbolize: &dyn Fn(u64) -> Option<String>, ip: u64) -> String {
    // A return-address frame points one past its call instruction, so when
    // the address itself does not resolve, retry one byte back.
    symbolize(ip)
        .or_else(|| ip.checked_sub(1).and_then(|previous| symbolize(previous)))
        .unwrap_or_else(|| "(unknown)".to_string())
}

/// Formats one stack trace, resolving symbols in-process.  Useful for
/// printing a single captured stack without running a full collection.
pub fn pretty_print_stack(stack: &ThreadStack) -> String {
    let mut out = String::new();
    write_pretty_trace(&mut out, stack, &resolve_symbol);
    out
}

/// Captures the calling thread's own stack, without any signalling.
pub fn capture_backtrace() -> ThreadStack {
    let mut stack = ThreadStack::new(nix::unistd::gettid().as_raw());
    capture_current(&mut stack);
    stack
}

/// Captures the calling thread's stack and emits it, bannered and
/// symbolized, through the `log` facade.
pub fn log_backtrace() {
    let rendered = pretty_print_stack(&capture_backtrace());
    log::info!("BACKTRACE:\n{LOG_BANNER}\n{rendered}{LOG_BANNER}");
}
