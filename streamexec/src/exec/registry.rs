// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Registry of source and transformation constructors
//!
//! The registry maps every [`ProcedureKind`] to the constructor that
//! instantiates it. The process-wide default registry is populated once
//! with the built-in operators; registration order never matters because
//! each kind maps to at most one constructor.

use crate::exec::context::ExecutionContext;
use crate::exec::error::{ExecutionError, Result};
use crate::exec::node::{AccumulationMode, Dataset, DatasetId, Source, Transformation};
use crate::plan::procedure::{ProcedureKind, ProcedureSpec};
use log::error;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Constructor of a source replica
pub type CreateSource = Arc<
    dyn Fn(&ProcedureSpec, DatasetId, &ExecutionContext) -> Result<Box<dyn Source>> + Send + Sync,
>;

/// Transformation together with the dataset it writes into
pub type TransformationPair = (Box<dyn Transformation>, Arc<dyn Dataset>);

/// Constructor of a transformation replica
pub type CreateTransformation = Arc<
    dyn Fn(DatasetId, AccumulationMode, &ProcedureSpec, &ExecutionContext) -> Result<TransformationPair>
        + Send
        + Sync,
>;

/// One registration, as contributed by an operator module
#[derive(Clone)]
pub enum Registration {
    Source(ProcedureKind, CreateSource),
    Transformation(ProcedureKind, CreateTransformation),
}

impl Registration {
    pub fn kind(&self) -> ProcedureKind {
        match self {
            Registration::Source(kind, _) | Registration::Transformation(kind, _) => *kind,
        }
    }
}

/// Constructors by operation kind
#[derive(Clone, Default)]
pub struct Registry {
    sources: HashMap<ProcedureKind, CreateSource>,
    transformations: HashMap<ProcedureKind, CreateTransformation>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("sources", &self.source_kinds())
            .field("transformations", &self.transformation_kinds())
            .finish()
    }
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in operators
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        crate::operators::register_all(&mut registry)?;
        Ok(registry)
    }

    /// Register a source constructor. Each kind can be registered once.
    pub fn register_source(&mut self, kind: ProcedureKind, create: CreateSource) -> Result<()> {
        if self.sources.contains_key(&kind) {
            return Err(ExecutionError::Internal(format!(
                "duplicate registration for source kind {}",
                kind
            )));
        }
        self.sources.insert(kind, create);
        Ok(())
    }

    /// Register a transformation constructor. Each kind can be registered once.
    pub fn register_transformation(
        &mut self,
        kind: ProcedureKind,
        create: CreateTransformation,
    ) -> Result<()> {
        if self.transformations.contains_key(&kind) {
            return Err(ExecutionError::Internal(format!(
                "duplicate registration for transformation kind {}",
                kind
            )));
        }
        self.transformations.insert(kind, create);
        Ok(())
    }

    pub fn register(&mut self, registration: Registration) -> Result<()> {
        match registration {
            Registration::Source(kind, create) => self.register_source(kind, create),
            Registration::Transformation(kind, create) => {
                self.register_transformation(kind, create)
            }
        }
    }

    /// Replace the source constructor of `kind`
    pub fn override_source(&mut self, kind: ProcedureKind, create: CreateSource) {
        self.sources.insert(kind, create);
    }

    /// Replace the transformation constructor of `kind`
    pub fn override_transformation(&mut self, kind: ProcedureKind, create: CreateTransformation) {
        self.transformations.insert(kind, create);
    }

    pub fn source(&self, kind: ProcedureKind) -> Option<&CreateSource> {
        self.sources.get(&kind)
    }

    pub fn transformation(&self, kind: ProcedureKind) -> Option<&CreateTransformation> {
        self.transformations.get(&kind)
    }

    pub fn source_kinds(&self) -> Vec<ProcedureKind> {
        let mut kinds: Vec<_> = self.sources.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn transformation_kinds(&self) -> Vec<ProcedureKind> {
        let mut kinds: Vec<_> = self.transformations.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

static DEFAULT_REGISTRY: Lazy<Arc<Registry>> = Lazy::new(|| match Registry::with_builtins() {
    Ok(registry) => Arc::new(registry),
    Err(e) => {
        error!("failed to register built-in operators: {}", e);
        Arc::new(Registry::new())
    }
});

/// The process-wide registry of built-in operators
pub fn default_registry() -> Arc<Registry> {
    DEFAULT_REGISTRY.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_builtins() {
        let registry = default_registry();
        assert_eq!(registry.source_kinds(), vec![ProcedureKind::From]);
        assert!(registry.transformation(ProcedureKind::Filter).is_some());
        assert!(registry.transformation(ProcedureKind::Yield).is_none());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = Registry::with_builtins().unwrap();
        let filter = registry
            .transformation(ProcedureKind::Filter)
            .cloned()
            .unwrap();
        assert!(registry
            .register_transformation(ProcedureKind::Filter, filter.clone())
            .is_err());
        registry.override_transformation(ProcedureKind::Filter, filter);
    }
}
