// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Result formatting for CLI output

use colored::*;
use comfy_table::{presets::UTF8_FULL, Cell, Color, Table as TextTable};
use std::collections::BTreeMap;
use streamexec::{Metadata, Result, Table};

use super::commands::OutputFormat;

/// Result formatter for different output formats
pub struct ResultFormatter;

impl ResultFormatter {
    /// Format every named result in the specified format
    pub fn format(
        results: &BTreeMap<String, Result<Vec<Table>>>,
        metadata: &[Metadata],
        format: OutputFormat,
    ) -> String {
        match format {
            OutputFormat::Table => Self::format_table(results, metadata),
            OutputFormat::Json => Self::format_json(results, metadata),
        }
    }

    fn format_table(results: &BTreeMap<String, Result<Vec<Table>>>, metadata: &[Metadata]) -> String {
        if results.is_empty() {
            return format!("{}\n", "No results produced".yellow());
        }

        let mut output = String::new();
        for (name, result) in results {
            output.push_str(&format!("{} {}\n", "Result:".bold().green(), name.bold()));
            let tables = match result {
                Ok(tables) => tables,
                Err(e) => {
                    output.push_str(&format!("{}\n\n", format!("❌ {}", e).red()));
                    continue;
                }
            };
            if tables.is_empty() {
                output.push_str(&format!("{}\n\n", "No tables".yellow()));
                continue;
            }
            let rows: usize = tables.iter().map(Table::len).sum();
            output.push_str(&format!("Tables: {}, rows: {}\n", tables.len(), rows));

            for table in tables {
                output.push_str(&format!("Group key: {}\n", table.key()));
                output.push_str(&Self::render_table(table));
                output.push('\n');
            }
            output.push('\n');
        }

        if !metadata.is_empty() {
            output.push_str(&format!("{}\n", "Metadata:".bold()));
            for (i, meta) in metadata.iter().enumerate() {
                let entries: Vec<String> = meta
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, serde_json::Value::Array(v.clone())))
                    .collect();
                output.push_str(&format!("  {}. {}\n", i + 1, entries.join(" ")));
            }
        }

        output
    }

    fn render_table(table: &Table) -> String {
        let mut text = TextTable::new();
        text.load_preset(UTF8_FULL);

        let header: Vec<Cell> = table
            .cols()
            .iter()
            .map(|col| Cell::new(format!("{} ({})", col.label, col.col_type)).fg(Color::Green))
            .collect();
        text.set_header(header);

        for row in table.rows() {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            text.add_row(cells);
        }
        text.to_string()
    }

    fn table_to_json(table: &Table) -> serde_json::Value {
        let mut key = serde_json::Map::new();
        for (col, value) in table.key().cols().iter().zip(table.key().values()) {
            key.insert(col.label.clone(), value.to_json());
        }
        serde_json::json!({
            "key": key,
            "columns": table.cols(),
            "rows": table
                .rows()
                .map(|row| row.iter().map(|v| v.to_json()).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
        })
    }

    fn format_json(results: &BTreeMap<String, Result<Vec<Table>>>, metadata: &[Metadata]) -> String {
        let mut named = serde_json::Map::new();
        for (name, result) in results {
            let value = match result {
                Ok(tables) => serde_json::json!({
                    "status": "success",
                    "tables": tables.iter().map(Self::table_to_json).collect::<Vec<_>>(),
                }),
                Err(e) => serde_json::json!({
                    "status": "error",
                    "code": e.code().to_string(),
                    "error": e.to_string(),
                }),
            };
            named.insert(name.clone(), value);
        }

        let json = serde_json::json!({
            "results": named,
            "metadata": metadata,
        });
        let mut text = serde_json::to_string_pretty(&json).unwrap_or_else(|_| {
            "{\"status\": \"error\", \"error\": \"Could not serialize results to JSON\"}".to_string()
        });
        text.push('\n');
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamexec::exec::{ColMeta, ColType, GroupKey};
    use streamexec::{Allocator, ExecutionError, Value};

    fn sample() -> BTreeMap<String, Result<Vec<Table>>> {
        let key = GroupKey::new(
            vec![ColMeta::new("host", ColType::String)],
            vec![Value::String("a".into())],
        )
        .unwrap();
        let table = Table::from_rows(
            key,
            vec![
                ColMeta::new("host", ColType::String),
                ColMeta::new("_value", ColType::Float),
            ],
            vec![vec![Value::String("a".into()), Value::Float(1.5)]],
            &Allocator::unlimited(),
        )
        .unwrap();
        let mut results = BTreeMap::new();
        results.insert("out".to_string(), Ok(vec![table]));
        results.insert("failed".to_string(), Err(ExecutionError::Canceled));
        results
    }

    #[test]
    fn test_json_output() {
        let text = ResultFormatter::format(&sample(), &[], OutputFormat::Json);
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["results"]["out"]["status"], "success");
        assert_eq!(json["results"]["out"]["tables"][0]["key"]["host"], "a");
        assert_eq!(json["results"]["out"]["tables"][0]["rows"][0][1], 1.5);
        assert_eq!(json["results"]["failed"]["status"], "error");
        assert_eq!(json["results"]["failed"]["error"], "context canceled");
    }

    #[test]
    fn test_table_output() {
        colored::control::set_override(false);
        let text = ResultFormatter::format(&sample(), &[], OutputFormat::Table);
        assert!(text.contains("Result: out"));
        assert!(text.contains("_value (float)"));
        assert!(text.contains("1.5"));
        assert!(text.contains("context canceled"));
    }
}
