//! Versioned schema migrations.
//!
//! Definitions are registered (built-in or loaded from a directory), applied
//! in ascending version order by the [`MigrationRunner`], and recorded in the
//! `schema_migrations` ledger inside the same transaction as their schema
//! change.

pub mod builtin;
mod definition;
mod ledger;
mod loader;
mod operation;
mod registry;
mod runner;
mod version;

pub use definition::MigrationDefinition;
pub use ledger::{LEDGER_TABLE, MigrationLedger, MigrationRecord};
pub use loader::load_definitions_from_dir;
pub use operation::SchemaOperation;
pub use registry::MigrationRegistry;
pub use runner::{MigrationReport, MigrationRunner, MigrationStatus};
pub use version::MigrationVersion;
