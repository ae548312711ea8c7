//! # Caller-Visible Error Kinds
//!
//! All fallible operations in this crate return `eyre::Result`. Failures a
//! caller is expected to branch on — schema violations, alias constraint
//! failures, lifecycle misuse — carry a [`StoreError`] at the root of the
//! report chain so they can be recovered with
//! `report.downcast_ref::<StoreError>()`.
//!
//! Kinds split into three groups:
//!
//! - **Lifecycle**: `NotInitialized`, `AlreadyInitialized`.
//! - **Validation**: name resolution, schema, and alias-invariant failures.
//!   These are raised before any index mutation, leaving the store
//!   unchanged.
//! - **Fatal**: `IndexInconsistent`. Raised once a mutation has partially
//!   applied; every subsequent mutation fails with this kind until the
//!   store is re-initialized.

use std::fmt::{self, Display};

/// Failure kinds surfaced to partition callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Operation invoked before `init` or after `destroy`.
    NotInitialized,
    /// `init` invoked on an already-initialized store.
    AlreadyInitialized,
    /// A DN that must resolve to an entry id did not.
    NoSuchObject { dn: String },
    /// An add below a parent that is not present in the partition.
    NoSuchParent { dn: String },
    /// Missing `objectClass` or an attribute id the schema cannot resolve.
    SchemaViolation { detail: String },
    /// Alias target is an ancestor of the alias entry.
    AliasCycle { alias: String, target: String },
    /// Alias target is itself an alias.
    AliasChain { alias: String, target: String },
    /// Alias names itself as its target.
    AliasToSelf { alias: String },
    /// Alias target lies outside the partition suffix.
    AliasExternal { target: String, suffix: String },
    /// Alias target does not name an existing entry.
    AliasTargetMissing { target: String },
    /// No user or system index is configured for the attribute.
    IndexNotFound { attribute: String },
    /// Forward/reverse index correspondence was broken mid-mutation.
    /// Fatal: all further mutations fail until the store is reopened.
    IndexInconsistent,
    /// A raw modification op code outside {add, delete, replace}.
    UnknownModificationOp { code: u8 },
}

impl Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotInitialized => {
                write!(f, "store is not initialized")
            }
            StoreError::AlreadyInitialized => {
                write!(f, "store is already initialized")
            }
            StoreError::NoSuchObject { dn } => {
                write!(f, "no entry found for dn '{dn}'")
            }
            StoreError::NoSuchParent { dn } => {
                write!(f, "parent entry '{dn}' does not exist")
            }
            StoreError::SchemaViolation { detail } => {
                write!(f, "schema violation: {detail}")
            }
            StoreError::AliasCycle { alias, target } => {
                write!(
                    f,
                    "aliasDereferencingProblem: alias '{alias}' would form a cycle \
                     with relative target '{target}'"
                )
            }
            StoreError::AliasChain { alias, target } => {
                write!(
                    f,
                    "aliasDereferencingProblem: alias '{alias}' points to alias \
                     '{target}', alias chaining is not supported"
                )
            }
            StoreError::AliasToSelf { alias } => {
                write!(
                    f,
                    "aliasDereferencingProblem: alias '{alias}' names itself as target"
                )
            }
            StoreError::AliasExternal { target, suffix } => {
                write!(
                    f,
                    "aliasDereferencingProblem: target '{target}' lies outside the \
                     '{suffix}' naming context"
                )
            }
            StoreError::AliasTargetMissing { target } => {
                write!(
                    f,
                    "aliasProblem: dereferencing would not name a known object, \
                     '{target}' does not exist"
                )
            }
            StoreError::IndexNotFound { attribute } => {
                write!(f, "no index configured for attribute '{attribute}'")
            }
            StoreError::IndexInconsistent => {
                write!(
                    f,
                    "forward/reverse index correspondence broken, store requires restart"
                )
            }
            StoreError::UnknownModificationOp { code } => {
                write!(f, "unknown modification op code {code}")
            }
        }
    }
}

impl std::error::Error for StoreError {}
