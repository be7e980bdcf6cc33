// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Test utilities for StreamExec integration tests
//!
//! - plan_fixture: plan builders and helpers to run a plan to completion
//! - recording: operators that record what the engine does to them, and
//!   operators that fail on purpose

#![allow(dead_code)]

pub mod plan_fixture;
pub mod recording;

/// Route engine logs to the test harness. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
