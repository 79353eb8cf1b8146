// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// How long [`crate::collect`] waits for every signalled thread to
/// acknowledge before giving up.
pub const DEFAULT_COLLECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The byte a target thread writes on the ack pipe.  The value is irrelevant;
/// only the successful single-byte write counts.
pub(crate) const ACK_BYTE: u8 = b'y';

/// Banner line framing the reports the request service writes to stderr.
pub(crate) const REPORT_BANNER: &str = "=============================================";

/// Banner line framing a single-thread backtrace emitted through the `log`
/// facade.
pub(crate) const LOG_BANNER: &str = "-------------------------------------------------";
