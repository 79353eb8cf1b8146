// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub(crate) mod api;
pub(crate) mod signal_handler;
pub(crate) mod stack_form;
pub(crate) mod unwinder;
