// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! CLI module for StreamExec
//!
//! Loads JSON physical plans, runs or validates them and prints the named
//! results.

pub mod commands;
pub mod output;
pub mod runner;

pub use commands::{Cli, Commands};
pub use runner::{handle_run, handle_validate};
