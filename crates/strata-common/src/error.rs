use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("schema error: {0}")]
    Schema(String),

    /// Two migration definitions claim the same version.
    #[error("migration version {version} is defined twice ({first} and {second})")]
    DefinitionConflict {
        version: u64,
        first: String,
        second: String,
    },

    /// A schema operation failed while applying a migration. Nothing from
    /// that migration was committed.
    #[error("migration {version} ({name}) failed at operation {operation}: {source}")]
    ApplyFailure {
        version: u64,
        name: String,
        operation: usize,
        source: Box<Error>,
    },

    /// A `down` operation failed while rolling back a migration. The
    /// migration stays recorded as applied.
    #[error("rollback of migration {version} ({name}) failed at operation {operation}: {source}")]
    RollbackFailure {
        version: u64,
        name: String,
        operation: usize,
        source: Box<Error>,
    },

    #[error("migration {version} ({name}) has no down operations and cannot be rolled back")]
    IrreversibleMigration { version: u64, name: String },

    /// The ledger and the database schema disagree. Requires manual
    /// reconciliation.
    #[error("ledger inconsistency: {0}")]
    LedgerInconsistency(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Version of the migration this error is attributed to, if any.
    pub fn migration_version(&self) -> Option<u64> {
        match self {
            Error::DefinitionConflict { version, .. }
            | Error::ApplyFailure { version, .. }
            | Error::RollbackFailure { version, .. }
            | Error::IrreversibleMigration { version, .. } => Some(*version),
            _ => None,
        }
    }
}
