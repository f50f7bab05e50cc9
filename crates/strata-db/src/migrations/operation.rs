use serde::{Deserialize, Serialize};

use crate::schema::{Column, ColumnType, Index, OnDelete, Reference, SchemaError, SchemaSnapshot};

/// A single structural change. Each variant carries enough information to
/// be applied to a [`SchemaSnapshot`], rendered as SQLite DDL, and reversed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaOperation {
    /// Create a table. An `id INTEGER PRIMARY KEY AUTOINCREMENT` column is
    /// always added first and must not be listed.
    CreateTable { name: String, columns: Vec<Column> },
    /// Drop a table. `columns` and `indexes` must describe the table as it
    /// currently exists so the drop can be reversed.
    DropTable {
        name: String,
        columns: Vec<Column>,
        #[serde(default)]
        indexes: Vec<Index>,
    },
    /// Add a plain column to an existing table.
    AddColumn { table: String, column: Column },
    /// Remove a plain column; carries its definition for reversal.
    RemoveColumn { table: String, column: Column },
    /// Add a nullable integer column together with its foreign-key
    /// constraint to `references.id`.
    AddForeignKey {
        table: String,
        column: String,
        references: String,
        #[serde(default)]
        on_delete: OnDelete,
    },
    RemoveForeignKey {
        table: String,
        column: String,
        references: String,
        #[serde(default)]
        on_delete: OnDelete,
    },
    AddIndex {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        columns: Vec<String>,
        #[serde(default)]
        unique: bool,
    },
    RemoveIndex {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        columns: Vec<String>,
        #[serde(default)]
        unique: bool,
    },
}

impl SchemaOperation {
    pub fn create_table(name: impl Into<String>, columns: Vec<Column>) -> Self {
        SchemaOperation::CreateTable {
            name: name.into(),
            columns,
        }
    }

    pub fn add_index(table: impl Into<String>, columns: &[&str]) -> Self {
        SchemaOperation::AddIndex {
            table: table.into(),
            name: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn add_foreign_key(
        table: impl Into<String>,
        column: impl Into<String>,
        references: impl Into<String>,
    ) -> Self {
        SchemaOperation::AddForeignKey {
            table: table.into(),
            column: column.into(),
            references: references.into(),
            on_delete: OnDelete::NoAction,
        }
    }

    /// Short description used in logs and errors.
    pub fn describe(&self) -> String {
        match self {
            SchemaOperation::CreateTable { name, .. } => format!("create_table {name}"),
            SchemaOperation::DropTable { name, .. } => format!("drop_table {name}"),
            SchemaOperation::AddColumn { table, column } => {
                format!("add_column {table}.{}", column.name)
            }
            SchemaOperation::RemoveColumn { table, column } => {
                format!("remove_column {table}.{}", column.name)
            }
            SchemaOperation::AddForeignKey {
                table,
                column,
                references,
                ..
            } => format!("add_foreign_key {table}.{column} -> {references}"),
            SchemaOperation::RemoveForeignKey {
                table,
                column,
                references,
                ..
            } => format!("remove_foreign_key {table}.{column} -> {references}"),
            SchemaOperation::AddIndex { table, columns, .. } => format!(
                "add_index {} on {table} ({})",
                self.index().map(|i| i.name).unwrap_or_default(),
                columns.join(", ")
            ),
            SchemaOperation::RemoveIndex { table, .. } => format!(
                "remove_index {} on {table}",
                self.index().map(|i| i.name).unwrap_or_default()
            ),
        }
    }

    /// The index an `AddIndex`/`RemoveIndex` operation refers to, with the
    /// conventional name filled in when none was given.
    fn index(&self) -> Option<Index> {
        match self {
            SchemaOperation::AddIndex {
                table,
                name,
                columns,
                unique,
            }
            | SchemaOperation::RemoveIndex {
                table,
                name,
                columns,
                unique,
            } => Some(Index {
                name: name
                    .clone()
                    .unwrap_or_else(|| Index::default_name(table, columns)),
                columns: columns.clone(),
                unique: *unique,
            }),
            _ => None,
        }
    }

    fn foreign_key_column(column: &str, references: &str, on_delete: OnDelete) -> Column {
        Column {
            references: Some(Reference {
                table: references.to_string(),
                on_delete,
            }),
            ..Column::new(column, ColumnType::Integer).nullable()
        }
    }

    /// Fold this operation into `snapshot`, rejecting structurally invalid
    /// changes before any SQL runs.
    pub fn apply_to(&self, snapshot: &mut SchemaSnapshot) -> Result<(), SchemaError> {
        match self {
            SchemaOperation::CreateTable { name, columns } => snapshot.create_table(name, columns),
            SchemaOperation::DropTable {
                name,
                columns,
                indexes,
            } => snapshot.drop_table(name, columns, indexes),
            SchemaOperation::AddColumn { table, column } => {
                if column.references.is_some() {
                    return Err(SchemaError::ReferenceRequiresForeignKey {
                        table: table.clone(),
                        column: column.name.clone(),
                    });
                }
                snapshot.add_column(table, column)
            }
            SchemaOperation::RemoveColumn { table, column } => {
                let current = snapshot
                    .table(table)
                    .and_then(|t| t.column(&column.name))
                    .ok_or_else(|| SchemaError::UnknownColumn {
                        table: table.clone(),
                        column: column.name.clone(),
                    })?;
                if current.references.is_some() {
                    return Err(SchemaError::ReferenceRequiresForeignKey {
                        table: table.clone(),
                        column: column.name.clone(),
                    });
                }
                snapshot.remove_column(table, &column.name).map(|_| ())
            }
            SchemaOperation::AddForeignKey {
                table,
                column,
                references,
                on_delete,
            } => snapshot.add_column(
                table,
                &Self::foreign_key_column(column, references, *on_delete),
            ),
            SchemaOperation::RemoveForeignKey {
                table,
                column,
                references,
                ..
            } => {
                let is_fk = snapshot
                    .table(table)
                    .and_then(|t| t.column(column))
                    .and_then(|c| c.references.as_ref())
                    .is_some_and(|r| &r.table == references);
                if !is_fk {
                    return Err(SchemaError::NotAForeignKey {
                        table: table.clone(),
                        column: column.clone(),
                        references: references.clone(),
                    });
                }
                snapshot.remove_column(table, column).map(|_| ())
            }
            SchemaOperation::AddIndex { table, .. } => match self.index() {
                Some(index) => snapshot.add_index(table, &index),
                None => Ok(()),
            },
            SchemaOperation::RemoveIndex { table, .. } => match self.index() {
                Some(index) => snapshot.remove_index(table, &index.name),
                None => Ok(()),
            },
        }
    }

    /// SQLite statements implementing this operation. Call only after
    /// [`apply_to`](Self::apply_to) succeeded, which validates identifiers.
    pub fn to_sql(&self) -> Vec<String> {
        match self {
            SchemaOperation::CreateTable { name, columns } => {
                let mut defs = vec![Column::primary_key().to_sql()];
                defs.extend(columns.iter().map(Column::to_sql));
                vec![format!(
                    "CREATE TABLE \"{name}\" (\n    {}\n)",
                    defs.join(",\n    ")
                )]
            }
            SchemaOperation::DropTable { name, .. } => vec![format!("DROP TABLE \"{name}\"")],
            SchemaOperation::AddColumn { table, column } => {
                vec![format!("ALTER TABLE \"{table}\" ADD COLUMN {}", column.to_sql())]
            }
            SchemaOperation::RemoveColumn { table, column } => {
                vec![format!("ALTER TABLE \"{table}\" DROP COLUMN \"{}\"", column.name)]
            }
            SchemaOperation::AddForeignKey {
                table,
                column,
                references,
                on_delete,
            } => vec![format!(
                "ALTER TABLE \"{table}\" ADD COLUMN {}",
                Self::foreign_key_column(column, references, *on_delete).to_sql()
            )],
            SchemaOperation::RemoveForeignKey { table, column, .. } => {
                vec![format!("ALTER TABLE \"{table}\" DROP COLUMN \"{column}\"")]
            }
            SchemaOperation::AddIndex { table, .. } => self
                .index()
                .map(|index| {
                    let columns: Vec<String> =
                        index.columns.iter().map(|c| format!("\"{c}\"")).collect();
                    format!(
                        "CREATE {}INDEX \"{}\" ON \"{table}\" ({})",
                        if index.unique { "UNIQUE " } else { "" },
                        index.name,
                        columns.join(", ")
                    )
                })
                .into_iter()
                .collect(),
            SchemaOperation::RemoveIndex { .. } => self
                .index()
                .map(|index| format!("DROP INDEX \"{}\"", index.name))
                .into_iter()
                .collect(),
        }
    }

    /// Operations undoing this one, in execution order.
    pub fn inverse(&self) -> Vec<SchemaOperation> {
        match self {
            SchemaOperation::CreateTable { name, columns } => vec![SchemaOperation::DropTable {
                name: name.clone(),
                columns: columns.clone(),
                indexes: Vec::new(),
            }],
            SchemaOperation::DropTable {
                name,
                columns,
                indexes,
            } => {
                let mut ops = vec![SchemaOperation::CreateTable {
                    name: name.clone(),
                    columns: columns.clone(),
                }];
                ops.extend(indexes.iter().map(|index| SchemaOperation::AddIndex {
                    table: name.clone(),
                    name: Some(index.name.clone()),
                    columns: index.columns.clone(),
                    unique: index.unique,
                }));
                ops
            }
            SchemaOperation::AddColumn { table, column } => vec![SchemaOperation::RemoveColumn {
                table: table.clone(),
                column: column.clone(),
            }],
            SchemaOperation::RemoveColumn { table, column } => vec![SchemaOperation::AddColumn {
                table: table.clone(),
                column: column.clone(),
            }],
            SchemaOperation::AddForeignKey {
                table,
                column,
                references,
                on_delete,
            } => vec![SchemaOperation::RemoveForeignKey {
                table: table.clone(),
                column: column.clone(),
                references: references.clone(),
                on_delete: *on_delete,
            }],
            SchemaOperation::RemoveForeignKey {
                table,
                column,
                references,
                on_delete,
            } => vec![SchemaOperation::AddForeignKey {
                table: table.clone(),
                column: column.clone(),
                references: references.clone(),
                on_delete: *on_delete,
            }],
            SchemaOperation::AddIndex {
                table,
                name,
                columns,
                unique,
            } => vec![SchemaOperation::RemoveIndex {
                table: table.clone(),
                name: name.clone(),
                columns: columns.clone(),
                unique: *unique,
            }],
            SchemaOperation::RemoveIndex {
                table,
                name,
                columns,
                unique,
            } => vec![SchemaOperation::AddIndex {
                table: table.clone(),
                name: name.clone(),
                columns: columns.clone(),
                unique: *unique,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> SchemaOperation {
        SchemaOperation::create_table("users", vec![Column::new("name", ColumnType::Text)])
    }

    #[test]
    fn create_table_sql_lists_primary_key_first() {
        let sql = users().to_sql();
        assert_eq!(sql.len(), 1);
        assert!(sql[0].starts_with("CREATE TABLE \"users\""));
        assert!(sql[0].contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n    \"name\" TEXT NOT NULL"));
    }

    #[test]
    fn add_index_uses_conventional_name() {
        let op = SchemaOperation::add_index("orders", &["user_id"]);
        assert_eq!(
            op.to_sql(),
            vec!["CREATE INDEX \"index_orders_on_user_id\" ON \"orders\" (\"user_id\")".to_string()]
        );
        assert_eq!(
            op.inverse()[0].to_sql(),
            vec!["DROP INDEX \"index_orders_on_user_id\"".to_string()]
        );
    }

    #[test]
    fn add_foreign_key_creates_column_and_constraint_together() {
        let mut snapshot = SchemaSnapshot::new();
        users().apply_to(&mut snapshot).unwrap();
        SchemaOperation::create_table("orders", vec![Column::new("date", ColumnType::Date)])
            .apply_to(&mut snapshot)
            .unwrap();

        let op = SchemaOperation::add_foreign_key("orders", "user_id", "users");
        op.apply_to(&mut snapshot).unwrap();

        let column = snapshot.table("orders").unwrap().column("user_id").unwrap();
        assert!(column.nullable);
        assert_eq!(column.references.as_ref().unwrap().table, "users");
        assert_eq!(
            op.to_sql(),
            vec![
                "ALTER TABLE \"orders\" ADD COLUMN \"user_id\" INTEGER REFERENCES \"users\"(\"id\") ON DELETE NO ACTION"
                    .to_string()
            ]
        );
    }

    #[test]
    fn add_column_refuses_references() {
        let mut snapshot = SchemaSnapshot::new();
        users().apply_to(&mut snapshot).unwrap();
        let op = SchemaOperation::AddColumn {
            table: "users".into(),
            column: Column::reference("team_id", "users").nullable(),
        };
        assert!(matches!(
            op.apply_to(&mut snapshot),
            Err(SchemaError::ReferenceRequiresForeignKey { .. })
        ));
    }

    #[test]
    fn remove_foreign_key_checks_target() {
        let mut snapshot = SchemaSnapshot::new();
        users().apply_to(&mut snapshot).unwrap();
        let op = SchemaOperation::RemoveForeignKey {
            table: "users".into(),
            column: "name".into(),
            references: "users".into(),
            on_delete: OnDelete::NoAction,
        };
        assert!(matches!(
            op.apply_to(&mut snapshot),
            Err(SchemaError::NotAForeignKey { .. })
        ));
    }

    #[test]
    fn inverse_restores_snapshot() {
        let mut snapshot = SchemaSnapshot::new();
        users().apply_to(&mut snapshot).unwrap();
        let before = snapshot.clone();

        let ops = vec![
            SchemaOperation::AddColumn {
                table: "users".into(),
                column: Column::new("email", ColumnType::Text).nullable(),
            },
            SchemaOperation::add_index("users", &["email"]),
        ];
        for op in &ops {
            op.apply_to(&mut snapshot).unwrap();
        }
        for op in ops.iter().rev().flat_map(SchemaOperation::inverse) {
            op.apply_to(&mut snapshot).unwrap();
        }
        assert_eq!(snapshot, before);
    }

    #[test]
    fn operations_deserialize_from_yaml() {
        let ops: Vec<SchemaOperation> = serde_yaml::from_str(
            r#"
- op: create_table
  name: users
  columns:
    - { name: name, type: text }
- op: add_index
  table: users
  columns: [name]
  unique: true
"#,
        )
        .unwrap();
        assert_eq!(ops[0], users());
        assert_eq!(
            ops[1].describe(),
            "add_index index_users_on_name on users (name)"
        );
    }
}
