// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! CLI command handlers for StreamExec

use colored::Colorize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::commands::OutputFormat;
use super::output::ResultFormatter;
use streamexec::{
    read_results, Executor, ExecutorConfig, Metadata, PhysicalPlan, PlanDocument, Result,
    RunContext, Table,
};

/// Tables or error of every named result, and the metadata of the run
pub type RunOutcome = (BTreeMap<String, Result<Vec<Table>>>, Vec<Metadata>);

fn load_executor(config: Option<&Path>) -> Result<Executor> {
    let config = match config {
        Some(path) => ExecutorConfig::from_file(path)?,
        None => ExecutorConfig::default(),
    };
    Ok(Executor::new(config))
}

fn load_plan(path: &Path) -> Result<PhysicalPlan> {
    PlanDocument::from_file(path)?.into_plan()
}

/// Execute the plan stored at `plan` and wait for all of its results
pub fn run_plan_file(
    plan: &Path,
    config: Option<&Path>,
    timeout_ms: Option<u64>,
) -> Result<RunOutcome> {
    let executor = load_executor(config)?;
    let plan = load_plan(plan)?;
    let ctx = match timeout_ms {
        Some(ms) => RunContext::with_timeout(Duration::from_millis(ms)),
        None => RunContext::background(),
    };

    let (results, meta) = executor.execute(&ctx, &plan, None)?;
    let results = read_results(results);
    let metadata = meta.iter().collect();
    Ok((results, metadata))
}

/// Handle the run command
pub fn handle_run(
    plan: PathBuf,
    config: Option<PathBuf>,
    format: OutputFormat,
    timeout_ms: Option<u64>,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    log::info!("running plan {}", plan.display());
    let (results, metadata) = run_plan_file(&plan, config.as_deref(), timeout_ms)?;

    print!("{}", ResultFormatter::format(&results, &metadata, format));

    let failed = results.values().filter(|r| r.is_err()).count();
    if failed > 0 {
        return Err(format!("{} of {} results failed", failed, results.len()).into());
    }
    Ok(())
}

/// Handle the validate command
pub fn handle_validate(
    plan: PathBuf,
    config: Option<PathBuf>,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let executor = load_executor(config.as_deref())?;
    let physical = load_plan(&plan)?;
    let resources = executor.validate(&physical)?;

    println!("{}", format!("✅ {} is valid", plan.display()).green());
    println!("  Nodes: {}", physical.len());
    println!("  Concurrency quota: {}", resources.concurrency_quota);
    if resources.memory_bytes_quota > 0 {
        println!("  Memory quota: {} bytes", resources.memory_bytes_quota);
    } else {
        println!("  Memory quota: unlimited");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PLAN: &str = r#"{
        "nodes": [
            {
                "id": "from0",
                "spec": {
                    "kind": "from",
                    "tables": [{
                        "key": ["host"],
                        "columns": [
                            { "label": "host", "type": "string" },
                            { "label": "_value", "type": "int" }
                        ],
                        "rows": [["a", 1], ["a", 5], ["a", 7]]
                    }]
                }
            },
            {
                "id": "limit0",
                "spec": { "kind": "limit", "n": 2 },
                "predecessors": ["from0"]
            }
        ]
    }"#;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("Failed to write temp file");
        file
    }

    #[test]
    fn test_run_plan_file() {
        let plan = write_temp(PLAN);
        let (results, metadata) = run_plan_file(plan.path(), None, None).unwrap();

        let tables = results["_result"].as_ref().unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].len(), 2);
        assert_eq!(metadata.len(), 1);
    }

    #[test]
    fn test_run_with_config_file() {
        let plan = write_temp(PLAN);
        let config = write_temp(r#"{ "options": { "concurrency_limit": 1 } }"#);
        let (results, _) = run_plan_file(plan.path(), Some(config.path()), Some(10_000)).unwrap();
        assert!(results["_result"].is_ok());
    }

    #[test]
    fn test_missing_plan_file() {
        let err = run_plan_file(Path::new("/nonexistent/plan.json"), None, None).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }

    #[test]
    fn test_validate() {
        let plan = write_temp(PLAN);
        handle_validate(plan.path().to_path_buf(), None).unwrap();
    }
}
