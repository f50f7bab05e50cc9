use ring::digest::{SHA256, digest};
use serde::{Deserialize, Serialize};
use strata_common::Result;

use super::operation::SchemaOperation;
use crate::schema::SchemaError;
use super::version::MigrationVersion;

/// A named, versioned unit of schema change. Immutable once authored; the
/// ledger stores a checksum of its operations to detect later edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDefinition {
    pub version: MigrationVersion,
    pub name: String,
    pub up: Vec<SchemaOperation>,
    #[serde(default)]
    pub down: Vec<SchemaOperation>,
}

impl MigrationDefinition {
    /// Definition with explicit `up` and `down` operation lists.
    pub fn new(
        version: impl Into<MigrationVersion>,
        name: impl Into<String>,
        up: Vec<SchemaOperation>,
        down: Vec<SchemaOperation>,
    ) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            up,
            down,
        }
    }

    /// Definition whose `down` is derived by inverting each `up` operation
    /// in reverse order.
    pub fn reversible(
        version: impl Into<MigrationVersion>,
        name: impl Into<String>,
        up: Vec<SchemaOperation>,
    ) -> Self {
        let down = up.iter().rev().flat_map(SchemaOperation::inverse).collect();
        Self::new(version, name, up, down)
    }

    /// Definition that can only move forward.
    pub fn irreversible(
        version: impl Into<MigrationVersion>,
        name: impl Into<String>,
        up: Vec<SchemaOperation>,
    ) -> Self {
        Self::new(version, name, up, Vec::new())
    }

    pub fn is_reversible(&self) -> bool {
        !self.down.is_empty()
    }

    /// Reject a `down` list that can never be applied. Re-adding a NOT NULL
    /// column without a default always fails, which is what inverting the
    /// removal of such a column produces.
    pub fn check_down(&self) -> std::result::Result<(), SchemaError> {
        match self.down.iter().find_map(|op| match op {
            SchemaOperation::AddColumn { table, column }
                if !column.nullable && column.default.is_none() =>
            {
                Some((table, column))
            }
            _ => None,
        }) {
            Some((table, column)) => Err(SchemaError::IrreversibleRemoval {
                table: table.clone(),
                column: column.name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Hex SHA-256 over the canonical JSON of `up` and `down`.
    pub fn checksum(&self) -> Result<String> {
        let payload = serde_json::to_vec(&(&self.up, &self.down))?;
        Ok(hex::encode(digest(&SHA256, &payload)))
    }
}
