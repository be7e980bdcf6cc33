// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! StreamExec CLI entry point

use clap::Parser;
use colored::Colorize;

mod cli;
use cli::{Cli, Commands};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments first to get log level
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        log::LevelFilter::Debug
    } else if let Some(level) = cli.log_level {
        level.to_level_filter()
    } else {
        // Default to Warn (can still be overridden by RUST_LOG env var)
        log::LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    match cli.command {
        Commands::Version => {
            println!("{} {}", "StreamExec".bold().green(), streamexec::VERSION);
            println!("Execution core for dataflow query plans");
            Ok(())
        }

        Commands::Run {
            plan,
            config,
            format,
            timeout_ms,
        } => cli::handle_run(plan, config, format, timeout_ms),

        Commands::Validate { plan, config } => cli::handle_validate(plan, config),
    }
}
