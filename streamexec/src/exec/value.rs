// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Column values carried by tables

use crate::exec::error::{ErrorCode, ExecutionError, Result};
use crate::exec::time::Time;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColType {
    Bool,
    Int,
    #[serde(rename = "uint")]
    UInt,
    Float,
    String,
    Time,
}

impl fmt::Display for ColType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColType::Bool => "bool",
            ColType::Int => "int",
            ColType::UInt => "uint",
            ColType::Float => "float",
            ColType::String => "string",
            ColType::Time => "time",
        };
        f.write_str(name)
    }
}

/// Column label and type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColMeta {
    pub label: String,
    #[serde(rename = "type")]
    pub col_type: ColType,
}

impl ColMeta {
    pub fn new(label: impl Into<String>, col_type: ColType) -> Self {
        Self {
            label: label.into(),
            col_type,
        }
    }
}

/// A single cell value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    #[serde(rename = "uint")]
    UInt(u64),
    Float(f64),
    String(String),
    Time(Time),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Type of the value, `None` for null
    pub fn col_type(&self) -> Option<ColType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ColType::Bool),
            Value::Int(_) => Some(ColType::Int),
            Value::UInt(_) => Some(ColType::UInt),
            Value::Float(_) => Some(ColType::Float),
            Value::String(_) => Some(ColType::String),
            Value::Time(_) => Some(ColType::Time),
        }
    }

    /// Approximate number of bytes this value occupies in a column buffer
    pub fn byte_size(&self) -> usize {
        match self {
            Value::Null | Value::Bool(_) => 1,
            Value::String(s) => s.len() + std::mem::size_of::<usize>(),
            _ => 8,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<Time> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    /// Convert a JSON literal into a value of the given column type
    pub fn from_json(json: &serde_json::Value, col_type: ColType) -> Result<Value> {
        use serde_json::Value as Json;

        let mismatch = || {
            ExecutionError::InvalidPlan(format!("cannot convert {} to {}", json, col_type))
        };
        if json.is_null() {
            return Ok(Value::Null);
        }
        let value = match col_type {
            ColType::Bool => Value::Bool(json.as_bool().ok_or_else(mismatch)?),
            ColType::Int => Value::Int(json.as_i64().ok_or_else(mismatch)?),
            ColType::UInt => Value::UInt(json.as_u64().ok_or_else(mismatch)?),
            ColType::Float => Value::Float(json.as_f64().ok_or_else(mismatch)?),
            ColType::String => Value::String(json.as_str().ok_or_else(mismatch)?.to_string()),
            ColType::Time => match json {
                Json::Number(n) => Value::Time(Time(n.as_i64().ok_or_else(mismatch)?)),
                Json::String(s) => {
                    let dt = DateTime::parse_from_rfc3339(s).map_err(|_| mismatch())?;
                    Value::Time(Time::from_datetime(&dt.with_timezone(&Utc)))
                }
                _ => return Err(mismatch()),
            },
        };
        Ok(value)
    }

    /// Convert to a JSON literal
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(v) => Json::from(*v),
            Value::UInt(v) => Json::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Time(t) => Json::String(t.to_string()),
        }
    }

    /// Compare two values of compatible types. Numeric types compare by value,
    /// null and mismatched types are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::UInt(a), Value::UInt(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// Check that the value can be stored in a column of `col_type`
    pub fn check_type(&self, col_type: ColType) -> Result<()> {
        match self.col_type() {
            None => Ok(()),
            Some(t) if t == col_type => Ok(()),
            Some(t) => Err(ExecutionError::operator(
                ErrorCode::FailedPrecondition,
                format!("value of type {} in column of type {}", t, col_type),
            )),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            // Bitwise so that equality agrees with Hash.
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(v) => v.hash(state),
            Value::UInt(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Time(t) => t.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => f.write_str(s),
            Value::Time(t) => write!(f, "{}", t),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Time> for Value {
    fn from(v: Time) -> Self {
        Value::Time(v)
    }
}
