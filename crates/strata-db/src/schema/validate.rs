use std::fmt;

use serde::Serialize;

use super::SchemaError;
use super::snapshot::SchemaSnapshot;
use super::types::ColumnType;

/// Design smells the engine tolerates but reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaWarning {
    /// A foreign-key column with no index leading on it; lookups through the
    /// relationship fall back to a full table scan.
    UnindexedForeignKey { table: String, column: String },
}

impl fmt::Display for SchemaWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaWarning::UnindexedForeignKey { table, column } => {
                write!(f, "foreign key {table}.{column} has no index")
            }
        }
    }
}

/// Reject snapshots containing a relationship column without its
/// foreign-key constraint. Relationship columns follow the `<entity>_id`
/// naming convention.
pub fn validate(snapshot: &SchemaSnapshot) -> Result<(), SchemaError> {
    for table in snapshot.tables.values() {
        for column in &table.columns {
            if column.name.ends_with("_id")
                && column.ty == ColumnType::Integer
                && column.references.is_none()
            {
                return Err(SchemaError::IncompleteRelationship {
                    table: table.name.clone(),
                    column: column.name.clone(),
                });
            }
        }
    }
    Ok(())
}

pub fn lint(snapshot: &SchemaSnapshot) -> Vec<SchemaWarning> {
    snapshot
        .tables
        .values()
        .flat_map(|table| {
            table
                .foreign_keys()
                .filter(|(column, _)| table.index_leading_with(&column.name).is_none())
                .map(|(column, _)| SchemaWarning::UnindexedForeignKey {
                    table: table.name.clone(),
                    column: column.name.clone(),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Index};

    fn orders_snapshot(user_id: Column) -> SchemaSnapshot {
        let mut snapshot = SchemaSnapshot::new();
        snapshot
            .create_table("users", &[Column::new("name", ColumnType::Text)])
            .unwrap();
        snapshot
            .create_table("orders", &[Column::new("date", ColumnType::Date), user_id])
            .unwrap();
        snapshot
    }

    #[test]
    fn bare_id_column_is_incomplete() {
        let snapshot = orders_snapshot(Column::new("user_id", ColumnType::Integer));
        assert_eq!(
            validate(&snapshot),
            Err(SchemaError::IncompleteRelationship {
                table: "orders".into(),
                column: "user_id".into()
            })
        );
    }

    #[test]
    fn referenced_id_column_is_valid() {
        let snapshot = orders_snapshot(Column::reference("user_id", "users"));
        assert_eq!(validate(&snapshot), Ok(()));
    }

    #[test]
    fn lint_flags_unindexed_foreign_keys() {
        let mut snapshot = orders_snapshot(Column::reference("user_id", "users"));
        assert_eq!(
            lint(&snapshot),
            vec![SchemaWarning::UnindexedForeignKey {
                table: "orders".into(),
                column: "user_id".into()
            }]
        );

        snapshot
            .add_index(
                "orders",
                &Index {
                    name: "index_orders_on_user_id".into(),
                    columns: vec!["user_id".into()],
                    unique: false,
                },
            )
            .unwrap();
        assert!(lint(&snapshot).is_empty());
    }

    #[test]
    fn trailing_index_column_does_not_count() {
        let mut snapshot = orders_snapshot(Column::reference("user_id", "users"));
        snapshot
            .add_index(
                "orders",
                &Index {
                    name: "index_orders_on_date_and_user_id".into(),
                    columns: vec!["date".into(), "user_id".into()],
                    unique: false,
                },
            )
            .unwrap();
        assert_eq!(lint(&snapshot).len(), 1);
    }
}
