use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the implicit primary key every table receives.
pub const PRIMARY_KEY: &str = "id";

/// SQLite column types, stored under their declared names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Text,
    Real,
    Boolean,
    Date,
    Timestamp,
    Decimal,
    /// Declared type not produced by any schema operation; only seen when
    /// introspecting tables created outside the runner.
    Other(String),
}

impl ColumnType {
    pub fn to_sql(&self) -> &str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Text => "TEXT",
            ColumnType::Real => "REAL",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Decimal => "DECIMAL",
            ColumnType::Other(decl) => decl,
        }
    }

    pub fn from_sql(decl: &str) -> Self {
        match decl.trim().to_ascii_uppercase().as_str() {
            "INTEGER" => ColumnType::Integer,
            "TEXT" => ColumnType::Text,
            "REAL" => ColumnType::Real,
            "BOOLEAN" => ColumnType::Boolean,
            "DATE" => ColumnType::Date,
            "TIMESTAMP" => ColumnType::Timestamp,
            "DECIMAL" => ColumnType::Decimal,
            _ => ColumnType::Other(decl.trim().to_string()),
        }
    }
}

/// Referential action taken on the child row when its parent is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
}

impl OnDelete {
    pub fn to_sql(self) -> &'static str {
        match self {
            OnDelete::NoAction => "NO ACTION",
            OnDelete::Restrict => "RESTRICT",
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
        }
    }

    pub fn from_sql(action: &str) -> Self {
        match action.trim().to_ascii_uppercase().as_str() {
            "RESTRICT" => OnDelete::Restrict,
            "CASCADE" => OnDelete::Cascade,
            "SET NULL" => OnDelete::SetNull,
            _ => OnDelete::NoAction,
        }
    }
}

/// Foreign-key constraint on a column, always targeting the referenced
/// table's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub table: String,
    #[serde(default)]
    pub on_delete: OnDelete,
}

impl Reference {
    pub fn to(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            on_delete: OnDelete::NoAction,
        }
    }
}

/// A column as authored in a migration and as recorded in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default)]
    pub nullable: bool,
    /// SQL literal, stored verbatim (e.g. `0`, `'pending'`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Reference>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub primary_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            default: None,
            references: None,
            primary_key: false,
        }
    }

    /// Integer column constrained to reference `table`.
    pub fn reference(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            references: Some(Reference::to(table)),
            ..Self::new(name, ColumnType::Integer)
        }
    }

    pub fn primary_key() -> Self {
        Self {
            primary_key: true,
            ..Self::new(PRIMARY_KEY, ColumnType::Integer)
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default_value(mut self, literal: impl Into<String>) -> Self {
        self.default = Some(literal.into());
        self
    }

    pub fn on_delete(mut self, action: OnDelete) -> Self {
        if let Some(reference) = self.references.as_mut() {
            reference.on_delete = action;
        }
        self
    }

    /// Column definition as it appears inside `CREATE TABLE` or
    /// `ALTER TABLE ... ADD COLUMN`.
    pub fn to_sql(&self) -> String {
        if self.primary_key {
            return format!("\"{}\" INTEGER PRIMARY KEY AUTOINCREMENT", self.name);
        }

        let mut parts = vec![format!("\"{}\"", self.name), self.ty.to_sql().to_string()];
        if !self.nullable {
            parts.push("NOT NULL".to_string());
        }
        if let Some(default) = &self.default {
            parts.push(format!("DEFAULT {default}"));
        }
        if let Some(reference) = &self.references {
            parts.push(format!(
                "REFERENCES \"{}\"(\"{PRIMARY_KEY}\") ON DELETE {}",
                reference.table,
                reference.on_delete.to_sql()
            ));
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl Index {
    /// Conventional index name: `index_<table>_on_<col>_and_<col>`.
    pub fn default_name(table: &str, columns: &[String]) -> String {
        format!("index_{table}_on_{}", columns.join("_and_"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub indexes: BTreeMap<String, Index>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns carrying a foreign-key constraint.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&Column, &Reference)> {
        self.columns
            .iter()
            .filter_map(|c| c.references.as_ref().map(|r| (c, r)))
    }

    /// First index whose leading column is `column`, i.e. one that can
    /// serve lookups filtered on that column alone.
    pub fn index_leading_with(&self, column: &str) -> Option<&Index> {
        self.indexes
            .values()
            .find(|idx| idx.columns.first().is_some_and(|c| c == column))
    }

    /// First index that covers `column` anywhere in its column list.
    pub fn index_covering(&self, column: &str) -> Option<&Index> {
        self.indexes
            .values()
            .find(|idx| idx.columns.iter().any(|c| c == column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_sql_includes_constraints() {
        let col = Column::reference("user_id", "users").on_delete(OnDelete::Cascade);
        assert_eq!(
            col.to_sql(),
            "\"user_id\" INTEGER NOT NULL REFERENCES \"users\"(\"id\") ON DELETE CASCADE"
        );

        let col = Column::new("packed", ColumnType::Boolean).default_value("0");
        assert_eq!(col.to_sql(), "\"packed\" BOOLEAN NOT NULL DEFAULT 0");

        let col = Column::new("notes", ColumnType::Text).nullable();
        assert_eq!(col.to_sql(), "\"notes\" TEXT");

        assert_eq!(
            Column::primary_key().to_sql(),
            "\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"
        );
    }

    #[test]
    fn column_type_parses_declared_names() {
        assert_eq!(ColumnType::from_sql("integer"), ColumnType::Integer);
        assert_eq!(ColumnType::from_sql("DECIMAL"), ColumnType::Decimal);
        assert_eq!(
            ColumnType::from_sql("VARCHAR(20)"),
            ColumnType::Other("VARCHAR(20)".into())
        );
        assert_eq!(OnDelete::from_sql("SET NULL"), OnDelete::SetNull);
        assert_eq!(OnDelete::from_sql("NO ACTION"), OnDelete::NoAction);
    }

    #[test]
    fn column_deserializes_from_yaml() {
        let col: Column = serde_yaml::from_str(
            "name: user_id\ntype: integer\nreferences:\n  table: users\n  on_delete: cascade\n",
        )
        .unwrap();
        assert_eq!(
            col,
            Column::reference("user_id", "users").on_delete(OnDelete::Cascade)
        );
    }

    #[test]
    fn default_index_name_follows_convention() {
        let cols = vec!["order_id".to_string(), "product_id".to_string()];
        assert_eq!(
            Index::default_name("order_products", &cols),
            "index_order_products_on_order_id_and_product_id"
        );
    }
}
