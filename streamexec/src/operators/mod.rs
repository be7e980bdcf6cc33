// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Built-in sources and transformations
//!
//! Every operator module contributes its [`Registration`]s. They are
//! collected by [`registrations`] and installed into a registry by
//! [`register_all`]; the executor's default registry is populated this way.

pub mod diff;
pub mod filter;
pub mod from;
pub mod limit;
pub mod merge;
pub mod quantile;
pub mod to;

use crate::exec::error::{ErrorCode, ExecutionError, Result};
use crate::exec::registry::{Registration, Registry};
use crate::plan::procedure::{ProcedureKind, ProcedureSpec};

pub use diff::DiffTransformation;
pub use filter::FilterTransformation;
pub use from::FromSource;
pub use limit::LimitTransformation;
pub use merge::MergeTransformation;
pub use quantile::{QuantileAgg, QuantileTransformation};
pub use to::{clear_destinations, destination_tables, ToTransformation};

/// Registrations of every built-in operator
pub fn registrations() -> Vec<Registration> {
    vec![
        from::registration(),
        filter::registration(),
        limit::registration(),
        diff::registration(),
        quantile::registration(),
        merge::registration(),
        to::registration(),
    ]
}

/// Install every built-in operator into `registry`
pub fn register_all(registry: &mut Registry) -> Result<()> {
    for registration in registrations() {
        registry.register(registration)?;
    }
    Ok(())
}

/// Error for a constructor handed a spec of another kind
pub(crate) fn invalid_spec(expected: ProcedureKind, spec: &ProcedureSpec) -> ExecutionError {
    ExecutionError::operator(
        ErrorCode::Internal,
        format!("invalid spec type {} for {} operator", spec.kind(), expected),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registrations_cover_every_kind_but_yield() {
        let mut kinds: Vec<ProcedureKind> = registrations().iter().map(|r| r.kind()).collect();
        kinds.sort();
        let mut expected: Vec<ProcedureKind> = ProcedureKind::ALL
            .iter()
            .copied()
            .filter(|k| *k != ProcedureKind::Yield)
            .collect();
        expected.sort();
        assert_eq!(kinds, expected);
    }

    #[test]
    fn test_invalid_spec_is_internal() {
        let spec = ProcedureSpec::Merge(Default::default());
        let err = invalid_spec(ProcedureKind::Limit, &spec);
        assert_eq!(err.code(), ErrorCode::Internal);
    }
}
