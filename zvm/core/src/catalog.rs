//! Function catalog: the immutable set of virtualized functions decoded
//! from the protected payload.
//!
//! Built exactly once during bootstrap stage 2. Every stream is
//! validated at build time so the interpreter never sees a malformed
//! body. Lookups after construction are read-only and need no locking.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eval::CalleeResolver;
use crate::opcodes::{validate_stream, Inst, StreamError};

/// One virtualized function body plus its call metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionEntry {
    /// Stable identifier, unique within the catalog.
    pub name: String,
    /// Number of argument registers seeded into `r0..rN`.
    pub arity: u8,
    /// Register file size allocated per invocation.
    pub reg_count: u8,
    pub insts: Vec<Inst>,
    /// Branch id -> instruction offset.
    pub branches: Vec<u32>,
    /// Callee id -> catalog identifier.
    pub callees: Vec<String>,
}

impl FunctionEntry {
    pub fn validate(&self) -> Result<(), StreamError> {
        validate_stream(
            &self.insts,
            &self.branches,
            self.reg_count,
            self.callees.len(),
            self.arity,
        )
    }
}

/// A reporting case: which function to invoke, with which canned
/// arguments, and the expected-result descriptor the smoke check
/// verifies against. Cases may name identifiers absent from the catalog;
/// such cases report `Unsupported`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSpec {
    pub name: String,
    pub args: Vec<u64>,
    pub expected: u64,
    /// Member of the smoke-check subset.
    pub smoke: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate function identifier '{0}'")]
    Duplicate(String),
    #[error("invalid stream in '{name}': {source}")]
    InvalidStream {
        name: String,
        #[source]
        source: StreamError,
    },
}

/// Read-only function table preserving registration order.
#[derive(Debug)]
pub struct Catalog {
    entries: Vec<FunctionEntry>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Validate and index `entries`. Registration order is the order of
    /// the input and is preserved by [`Catalog::iter`].
    pub fn from_entries(entries: Vec<FunctionEntry>) -> Result<Self, CatalogError> {
        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            entry.validate().map_err(|source| CatalogError::InvalidStream {
                name: entry.name.clone(),
                source,
            })?;
            if index.insert(entry.name.clone(), i).is_some() {
                return Err(CatalogError::Duplicate(entry.name.clone()));
            }
        }
        Ok(Self { entries, index })
    }

    /// Look up a function by identifier. Absence is a caller contract
    /// error, not an execution fault.
    pub fn lookup(&self, name: &str) -> Option<&FunctionEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// Entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &FunctionEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CalleeResolver for Catalog {
    fn resolve(&self, name: &str) -> Option<&FunctionEntry> {
        self.lookup(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{BinOp, Width};

    fn add_entry(name: &str) -> FunctionEntry {
        FunctionEntry {
            name: name.to_string(),
            arity: 2,
            reg_count: 3,
            insts: vec![
                Inst::Binary {
                    op: BinOp::Add,
                    width: Width::W32,
                    dst: 2,
                    lhs: 0,
                    rhs: 1,
                },
                Inst::Return { src: 2 },
            ],
            branches: Vec::new(),
            callees: Vec::new(),
        }
    }

    #[test]
    fn lookup_hits_registered_entries_only() {
        let catalog = Catalog::from_entries(vec![add_entry("fun_a"), add_entry("fun_b")]).unwrap();
        assert!(catalog.lookup("fun_a").is_some());
        assert!(catalog.lookup("fun_missing").is_none());
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn iteration_preserves_registration_order() {
        let catalog =
            Catalog::from_entries(vec![add_entry("fun_z"), add_entry("fun_a"), add_entry("fun_m")])
                .unwrap();
        let names: Vec<&str> = catalog.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["fun_z", "fun_a", "fun_m"]);
    }

    #[test]
    fn duplicate_identifiers_are_rejected() {
        let err = Catalog::from_entries(vec![add_entry("fun_a"), add_entry("fun_a")]).unwrap_err();
        assert_eq!(err, CatalogError::Duplicate("fun_a".to_string()));
    }

    #[test]
    fn malformed_entries_fail_the_build() {
        let mut bad = add_entry("fun_bad");
        bad.insts.pop(); // drop the terminator
        let err = Catalog::from_entries(vec![bad]).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidStream { .. }));
    }
}
