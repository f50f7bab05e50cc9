use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::types::{Column, Index, TableSchema};
use super::{SchemaError, check_identifier};
use crate::migrations::MigrationVersion;

/// Tables, columns, foreign keys and indexes at one point in the migration
/// history. Maps are ordered so dumps are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Latest migration folded into this snapshot; `None` for an empty
    /// history or a live introspection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<MigrationVersion>,
    pub tables: BTreeMap<String, TableSchema>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Structural equality, ignoring which version produced the snapshot.
    pub fn same_structure(&self, other: &SchemaSnapshot) -> bool {
        self.tables == other.tables
    }

    /// Human-readable list of structural differences from `self` (expected)
    /// to `other` (actual).
    pub fn differences(&self, other: &SchemaSnapshot) -> Vec<String> {
        let mut diffs = Vec::new();
        for (name, expected) in &self.tables {
            match other.tables.get(name) {
                None => diffs.push(format!("table {name} is missing")),
                Some(actual) => {
                    for col in &expected.columns {
                        match actual.column(&col.name) {
                            None => diffs.push(format!("column {name}.{} is missing", col.name)),
                            Some(found) if found != col => diffs.push(format!(
                                "column {name}.{} differs (expected {}, found {})",
                                col.name,
                                col.to_sql(),
                                found.to_sql()
                            )),
                            Some(_) => {}
                        }
                    }
                    for col in &actual.columns {
                        if expected.column(&col.name).is_none() {
                            diffs.push(format!("column {name}.{} is unexpected", col.name));
                        }
                    }
                    if expected.columns.len() == actual.columns.len()
                        && expected.columns != actual.columns
                        && diffs.is_empty()
                    {
                        diffs.push(format!("columns of {name} are in a different order"));
                    }
                    for (idx_name, idx) in &expected.indexes {
                        match actual.indexes.get(idx_name) {
                            None => diffs.push(format!("index {idx_name} is missing")),
                            Some(found) if found != idx => {
                                diffs.push(format!("index {idx_name} differs"))
                            }
                            Some(_) => {}
                        }
                    }
                    for idx_name in actual.indexes.keys() {
                        if !expected.indexes.contains_key(idx_name) {
                            diffs.push(format!("index {idx_name} is unexpected"));
                        }
                    }
                }
            }
        }
        for name in other.tables.keys() {
            if !self.tables.contains_key(name) {
                diffs.push(format!("table {name} is unexpected"));
            }
        }
        diffs
    }

    /// `(table, column)` pairs holding a foreign key to `table`, excluding
    /// self-references.
    pub fn referencing(&self, table: &str) -> Vec<(String, String)> {
        self.tables
            .values()
            .filter(|t| t.name != table)
            .flat_map(|t| {
                t.foreign_keys()
                    .filter(|(_, r)| r.table == table)
                    .map(|(c, _)| (t.name.clone(), c.name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn index_exists(&self, name: &str) -> bool {
        self.tables.values().any(|t| t.indexes.contains_key(name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableSchema, SchemaError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| SchemaError::UnknownTable(name.to_string()))
    }

    fn check_reference(&self, table: &str, column: &Column) -> Result<(), SchemaError> {
        if let Some(reference) = &column.references {
            check_identifier(&reference.table)?;
            if reference.table != table && !self.has_table(&reference.table) {
                return Err(SchemaError::UnknownTable(reference.table.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn create_table(&mut self, name: &str, columns: &[Column]) -> Result<(), SchemaError> {
        check_identifier(name)?;
        if self.has_table(name) {
            return Err(SchemaError::TableExists(name.to_string()));
        }

        let mut all = vec![Column::primary_key()];
        for column in columns {
            check_identifier(&column.name)?;
            if column.primary_key || column.name == super::PRIMARY_KEY {
                return Err(SchemaError::ReservedColumn {
                    table: name.to_string(),
                    column: column.name.clone(),
                });
            }
            if all.iter().any(|c| c.name == column.name) {
                return Err(SchemaError::ColumnExists {
                    table: name.to_string(),
                    column: column.name.clone(),
                });
            }
            self.check_reference(name, column)?;
            all.push(column.clone());
        }

        self.tables.insert(
            name.to_string(),
            TableSchema {
                name: name.to_string(),
                columns: all,
                indexes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub(crate) fn drop_table(
        &mut self,
        name: &str,
        columns: &[Column],
        indexes: &[Index],
    ) -> Result<(), SchemaError> {
        let table = self
            .table(name)
            .ok_or_else(|| SchemaError::UnknownTable(name.to_string()))?;

        let described: Vec<&Column> = columns.iter().collect();
        let current: Vec<&Column> = table.columns.iter().filter(|c| !c.primary_key).collect();
        let described_indexes: BTreeMap<&str, &Index> =
            indexes.iter().map(|i| (i.name.as_str(), i)).collect();
        let current_indexes: BTreeMap<&str, &Index> =
            table.indexes.iter().map(|(k, v)| (k.as_str(), v)).collect();
        if described != current || described_indexes != current_indexes {
            return Err(SchemaError::DropTableMismatch(name.to_string()));
        }

        if let Some((by_table, by_column)) = self.referencing(name).into_iter().next() {
            return Err(SchemaError::TableReferenced {
                table: name.to_string(),
                by: format!("{by_table}.{by_column}"),
            });
        }

        self.tables.remove(name);
        Ok(())
    }

    pub(crate) fn add_column(&mut self, table: &str, column: &Column) -> Result<(), SchemaError> {
        check_identifier(&column.name)?;
        self.check_reference(table, column)?;
        let schema = self.table_mut(table)?;
        if column.primary_key || column.name == super::PRIMARY_KEY {
            return Err(SchemaError::ReservedColumn {
                table: table.to_string(),
                column: column.name.clone(),
            });
        }
        if schema.column(&column.name).is_some() {
            return Err(SchemaError::ColumnExists {
                table: table.to_string(),
                column: column.name.clone(),
            });
        }
        // SQLite cannot back-fill existing rows of a NOT NULL column.
        if !column.nullable && column.default.is_none() {
            return Err(SchemaError::NotNullWithoutDefault {
                table: table.to_string(),
                column: column.name.clone(),
            });
        }
        schema.columns.push(column.clone());
        Ok(())
    }

    pub(crate) fn remove_column(&mut self, table: &str, column: &str) -> Result<Column, SchemaError> {
        let schema = self.table_mut(table)?;
        let position = schema
            .columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| SchemaError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            })?;
        if schema.columns[position].primary_key {
            return Err(SchemaError::ReservedColumn {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        if let Some(index) = schema.index_covering(column) {
            return Err(SchemaError::ColumnIndexed {
                table: table.to_string(),
                column: column.to_string(),
                index: index.name.clone(),
            });
        }
        Ok(schema.columns.remove(position))
    }

    pub(crate) fn add_index(&mut self, table: &str, index: &Index) -> Result<(), SchemaError> {
        check_identifier(&index.name)?;
        if index.columns.is_empty() {
            return Err(SchemaError::EmptyIndex(index.name.clone()));
        }
        if self.index_exists(&index.name) {
            return Err(SchemaError::IndexExists(index.name.clone()));
        }
        let schema = self.table_mut(table)?;
        for column in &index.columns {
            if schema.column(column).is_none() {
                return Err(SchemaError::UnknownColumn {
                    table: table.to_string(),
                    column: column.clone(),
                });
            }
        }
        schema.indexes.insert(index.name.clone(), index.clone());
        Ok(())
    }

    pub(crate) fn remove_index(&mut self, table: &str, name: &str) -> Result<(), SchemaError> {
        let schema = self.table_mut(table)?;
        schema
            .indexes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SchemaError::UnknownIndex(name.to_string()))
    }
}
