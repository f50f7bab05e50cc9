//! Structural description of the entity schema.
//!
//! A [`SchemaSnapshot`] is produced two ways: by folding the schema
//! operations of every applied migration, and by introspecting the live
//! database. The runner compares the two to detect schema changes that were
//! never recorded in the ledger.

mod introspect;
mod snapshot;
mod types;
mod validate;

use thiserror::Error;

pub use introspect::introspect;
pub use snapshot::SchemaSnapshot;
pub use types::{Column, ColumnType, Index, OnDelete, PRIMARY_KEY, Reference, TableSchema};
pub use validate::{SchemaWarning, lint, validate};

/// A schema operation that cannot be applied to the current snapshot, or a
/// snapshot that breaks a structural rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("table {0} does not exist")]
    UnknownTable(String),

    #[error("column {table}.{column} already exists")]
    ColumnExists { table: String, column: String },

    #[error("column {table}.{column} does not exist")]
    UnknownColumn { table: String, column: String },

    #[error("column {table}.{column} is reserved for the primary key")]
    ReservedColumn { table: String, column: String },

    #[error("column {table}.{column} is NOT NULL and needs a default to be added to an existing table")]
    NotNullWithoutDefault { table: String, column: String },

    #[error("column {table}.{column} carries a reference; use add_foreign_key / remove_foreign_key")]
    ReferenceRequiresForeignKey { table: String, column: String },

    #[error("column {table}.{column} is not a foreign key to {references}")]
    NotAForeignKey {
        table: String,
        column: String,
        references: String,
    },

    #[error("column {table}.{column} is used by index {index}; remove the index first")]
    ColumnIndexed {
        table: String,
        column: String,
        index: String,
    },

    #[error("table {table} is still referenced by {by}")]
    TableReferenced { table: String, by: String },

    #[error("drop_table {0} does not describe the table's current columns and indexes")]
    DropTableMismatch(String),

    #[error("index {0} already exists")]
    IndexExists(String),

    #[error("index {0} does not exist")]
    UnknownIndex(String),

    #[error("index {0} has no columns")]
    EmptyIndex(String),

    /// A `*_id` column without its foreign-key constraint.
    #[error("column {table}.{column} looks like a relationship but has no foreign-key constraint")]
    IncompleteRelationship { table: String, column: String },

    #[error("removing NOT NULL column {table}.{column} without a default cannot be reversed")]
    IrreversibleRemoval { table: String, column: String },

    #[error("relation {name} does not match the schema: {reason}")]
    InvalidRelation { name: String, reason: String },
}

impl From<SchemaError> for strata_common::Error {
    fn from(e: SchemaError) -> Self {
        strata_common::Error::Schema(e.to_string())
    }
}

/// Identifiers must be plain SQL names so they can be interpolated into DDL.
pub(crate) fn check_identifier(name: &str) -> Result<(), SchemaError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("sqlite_");
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(name.to_string()))
    }
}
