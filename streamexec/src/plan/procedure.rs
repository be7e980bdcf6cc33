// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Procedure specifications attached to physical plan nodes
//!
//! Every plan node carries exactly one [`ProcedureSpec`]. The variant decides
//! which registered source or transformation constructor executes the node.

use crate::exec::value::ColMeta;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name used for results of terminal nodes without side effects
pub const DEFAULT_YIELD_NAME: &str = "_result";

/// Label of the column operators read values from by default
pub const DEFAULT_VALUE_COL_LABEL: &str = "_value";

/// Operation kinds known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureKind {
    From,
    Filter,
    Limit,
    Diff,
    Quantile,
    Merge,
    To,
    Yield,
}

impl ProcedureKind {
    pub const ALL: [ProcedureKind; 8] = [
        ProcedureKind::From,
        ProcedureKind::Filter,
        ProcedureKind::Limit,
        ProcedureKind::Diff,
        ProcedureKind::Quantile,
        ProcedureKind::Merge,
        ProcedureKind::To,
        ProcedureKind::Yield,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureKind::From => "from",
            ProcedureKind::Filter => "filter",
            ProcedureKind::Limit => "limit",
            ProcedureKind::Diff => "diff",
            ProcedureKind::Quantile => "quantile",
            ProcedureKind::Merge => "merge",
            ProcedureKind::To => "to",
            ProcedureKind::Yield => "yield",
        }
    }
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Procedure of a plan node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcedureSpec {
    From(FromSpec),
    Filter(FilterSpec),
    Limit(LimitSpec),
    Diff(DiffSpec),
    Quantile(QuantileSpec),
    Merge(MergeSpec),
    To(ToSpec),
    Yield(YieldSpec),
}

impl ProcedureSpec {
    pub fn kind(&self) -> ProcedureKind {
        match self {
            ProcedureSpec::From(_) => ProcedureKind::From,
            ProcedureSpec::Filter(_) => ProcedureKind::Filter,
            ProcedureSpec::Limit(_) => ProcedureKind::Limit,
            ProcedureSpec::Diff(_) => ProcedureKind::Diff,
            ProcedureSpec::Quantile(_) => ProcedureKind::Quantile,
            ProcedureSpec::Merge(_) => ProcedureKind::Merge,
            ProcedureSpec::To(_) => ProcedureKind::To,
            ProcedureSpec::Yield(_) => ProcedureKind::Yield,
        }
    }

    /// Whether running the procedure has effects beyond its output
    pub fn has_side_effect(&self) -> bool {
        matches!(self, ProcedureSpec::To(_))
    }

    pub fn yield_name(&self) -> Option<&str> {
        match self {
            ProcedureSpec::Yield(spec) => Some(&spec.name),
            _ => None,
        }
    }
}

/// One literal table of a `from` source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Labels of the group key columns
    #[serde(default)]
    pub key: Vec<String>,
    pub columns: Vec<ColMeta>,
    #[serde(default)]
    pub rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FromSpec {
    pub tables: Vec<TableSpec>,
}

/// Comparison operators usable in filter predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

/// Row predicate of a filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Compare {
        column: String,
        cmp: CompareOp,
        value: serde_json::Value,
    },
    Regex {
        column: String,
        pattern: String,
    },
    And {
        preds: Vec<Predicate>,
    },
    Or {
        preds: Vec<Predicate>,
    },
    Not {
        pred: Box<Predicate>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub predicate: Predicate,
    /// Emit tables whose rows were all filtered out
    #[serde(default)]
    pub keep_empty_tables: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitSpec {
    pub n: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_epsilon() -> f64 {
    1e-6
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffSpec {
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub nans_equal: bool,
}

impl Default for DiffSpec {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            nans_equal: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantileMethod {
    /// Approximate quantile from a bounded sample buffer
    #[default]
    Estimate,
    /// Exact quantile, interpolating between neighbouring values
    ExactMean,
    /// Exact quantile, selecting the row holding the value
    ExactSelector,
}

fn default_value_column() -> String {
    DEFAULT_VALUE_COL_LABEL.to_string()
}

fn default_compression() -> f64 {
    1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileSpec {
    pub quantile: f64,
    #[serde(default)]
    pub method: QuantileMethod,
    #[serde(default = "default_value_column")]
    pub column: String,
    /// Size bound of the estimate buffers
    #[serde(default = "default_compression")]
    pub compression: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeSpec {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToSpec {
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldSpec {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_json_is_tagged_by_kind() {
        let spec: ProcedureSpec = serde_json::from_str(
            r#"{"kind":"filter","predicate":{"op":"compare","column":"_value","cmp":">","value":2}}"#,
        )
        .unwrap();
        assert_eq!(spec.kind(), ProcedureKind::Filter);
        assert!(!spec.has_side_effect());

        let spec: ProcedureSpec = serde_json::from_str(r#"{"kind":"merge"}"#).unwrap();
        assert_eq!(spec, ProcedureSpec::Merge(MergeSpec {}));
    }

    #[test]
    fn test_quantile_defaults() {
        let spec: QuantileSpec = serde_json::from_str(r#"{"quantile":0.5}"#).unwrap();
        assert_eq!(spec.method, QuantileMethod::Estimate);
        assert_eq!(spec.column, "_value");
        assert_eq!(spec.compression, 1000.0);
    }

    #[test]
    fn test_side_effects_and_yield_names() {
        let to = ProcedureSpec::To(ToSpec {
            destination: "bucket".into(),
        });
        assert!(to.has_side_effect());
        let y = ProcedureSpec::Yield(YieldSpec { name: "out".into() });
        assert_eq!(y.yield_name(), Some("out"));
        assert_eq!(ProcedureKind::Quantile.to_string(), "quantile");
    }
}
