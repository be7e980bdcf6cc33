// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Executor configuration

use crate::exec::error::{ExecutionError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Messages a transport handles before yielding its worker
pub const DEFAULT_DISPATCHER_THROUGHPUT: usize = 10;

/// Ambient limits applied when a plan leaves its quotas unset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Memory quota for plans without one, in bytes
    pub default_memory_limit: Option<i64>,
    /// Upper bound of the derived concurrency quota
    pub concurrency_limit: Option<usize>,
}

/// Configuration of an [`Executor`](crate::exec::Executor)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub options: ExecutionOptions,
    pub dispatcher_throughput: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            options: ExecutionOptions::default(),
            dispatcher_throughput: DEFAULT_DISPATCHER_THROUGHPUT,
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_memory_limit(mut self, bytes: i64) -> Self {
        self.options.default_memory_limit = Some(bytes);
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.options.concurrency_limit = Some(limit);
        self
    }

    pub fn with_dispatcher_throughput(mut self, throughput: usize) -> Self {
        self.dispatcher_throughput = throughput;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExecutionError::InvalidPlan(format!("invalid executor config: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ExecutionError::InvalidPlan(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.dispatcher_throughput, 10);
        assert_eq!(config.options.concurrency_limit, None);
        assert_eq!(ExecutorConfig::from_json("{}").unwrap(), config);
    }

    #[test]
    fn test_partial_json() {
        let config =
            ExecutorConfig::from_json(r#"{"options":{"concurrency_limit":4}}"#).unwrap();
        assert_eq!(config.options.concurrency_limit, Some(4));
        assert_eq!(config.options.default_memory_limit, None);
        assert_eq!(config.dispatcher_throughput, 10);
    }

    #[test]
    fn test_builder_setters() {
        let config = ExecutorConfig::new()
            .with_default_memory_limit(1 << 20)
            .with_concurrency_limit(8)
            .with_dispatcher_throughput(1);
        assert_eq!(config.options.default_memory_limit, Some(1 << 20));
        assert_eq!(config.options.concurrency_limit, Some(8));
        assert_eq!(config.dispatcher_throughput, 1);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"dispatcher_throughput": 3}}"#).unwrap();
        let config = ExecutorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.dispatcher_throughput, 3);
    }
}
