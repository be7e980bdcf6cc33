// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Execution error types

use std::fmt;
use thiserror::Error;

/// Result alias used throughout the execution engine
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Classification attached to every execution error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Keep the classification of the wrapped error
    Inherit,
    Invalid,
    Internal,
    Canceled,
    DeadlineExceeded,
    FailedPrecondition,
    ResourceExhausted,
    Unimplemented,
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Inherit => "inherit",
            ErrorCode::Invalid => "invalid",
            ErrorCode::Internal => "internal",
            ErrorCode::Canceled => "canceled",
            ErrorCode::DeadlineExceeded => "deadline exceeded",
            ErrorCode::FailedPrecondition => "failed precondition",
            ErrorCode::ResourceExhausted => "resource exhausted",
            ErrorCode::Unimplemented => "unimplemented",
            ErrorCode::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Execution errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("unsupported source kind {0}")]
    UnsupportedSource(String),

    #[error("unsupported procedure {0}")]
    UnsupportedProcedure(String),

    #[error("tried to produce more than one result with the name {0:?}")]
    DuplicateResult(String),

    #[error("execution state must have a non-zero concurrency quota")]
    ZeroConcurrencyQuota,

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("{message}")]
    Operator { code: ErrorCode, message: String },

    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("panic: {0}")]
    Panic(String),

    #[error("memory limit exceeded: requested {requested} bytes, limit {limit} bytes")]
    MemoryLimitExceeded { limit: i64, requested: i64 },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Wrapped {
        code: ErrorCode,
        context: String,
        #[source]
        source: Box<ExecutionError>,
    },
}

impl ExecutionError {
    /// Create an operator error with an explicit classification
    pub fn operator(code: ErrorCode, message: impl Into<String>) -> Self {
        ExecutionError::Operator {
            code,
            message: message.into(),
        }
    }

    /// Wrap this error with additional context.
    ///
    /// `ErrorCode::Inherit` keeps the classification of `self`.
    pub fn wrap(self, code: ErrorCode, context: impl Into<String>) -> Self {
        ExecutionError::Wrapped {
            code,
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Resolved classification of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            ExecutionError::UnsupportedSource(_)
            | ExecutionError::UnsupportedProcedure(_)
            | ExecutionError::DuplicateResult(_)
            | ExecutionError::ZeroConcurrencyQuota
            | ExecutionError::InvalidPlan(_) => ErrorCode::Invalid,
            ExecutionError::Operator { code, .. } => *code,
            ExecutionError::Canceled => ErrorCode::Canceled,
            ExecutionError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            ExecutionError::Panic(_) | ExecutionError::Internal(_) => ErrorCode::Internal,
            ExecutionError::MemoryLimitExceeded { .. } => ErrorCode::ResourceExhausted,
            ExecutionError::Wrapped { code, source, .. } => match code {
                ErrorCode::Inherit => source.code(),
                code => *code,
            },
        }
    }

    /// Whether this error originates from cancellation of the run context
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Canceled | ErrorCode::DeadlineExceeded
        )
    }
}

impl From<serde_json::Error> for ExecutionError {
    fn from(error: serde_json::Error) -> Self {
        ExecutionError::InvalidPlan(error.to_string())
    }
}

impl From<regex::Error> for ExecutionError {
    fn from(error: regex::Error) -> Self {
        ExecutionError::operator(ErrorCode::Invalid, error.to_string())
    }
}
