use std::collections::BTreeMap;

use rusqlite::{Connection, params};
use strata_common::{Error, Result};

use super::snapshot::SchemaSnapshot;
use super::types::{Column, ColumnType, Index, OnDelete, Reference, TableSchema};
use crate::migrations::LEDGER_TABLE;

/// Read the live database structure into a snapshot. SQLite internal tables
/// and the migration ledger are excluded.
pub fn introspect(conn: &Connection) -> Result<SchemaSnapshot> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ?1
             ORDER BY name",
        )
        .map_err(|e| Error::Database(format!("failed to prepare table listing: {e}")))?;
    let names = stmt
        .query_map(params![LEDGER_TABLE], |row| row.get::<_, String>(0))
        .map_err(|e| Error::Database(format!("failed to list tables: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Database(format!("failed to read table name: {e}")))?;

    let mut tables = BTreeMap::new();
    for name in names {
        let table = introspect_table(conn, &name)?;
        tables.insert(name, table);
    }

    Ok(SchemaSnapshot {
        version: None,
        tables,
    })
}

fn introspect_table(conn: &Connection, table: &str) -> Result<TableSchema> {
    let references = foreign_keys(conn, table)?;

    let mut stmt = conn
        .prepare(
            "SELECT name, type, \"notnull\", dflt_value, pk
             FROM pragma_table_info(?1) ORDER BY cid",
        )
        .map_err(|e| Error::Database(format!("failed to prepare column query: {e}")))?;
    let columns = stmt
        .query_map(params![table], |row| {
            let name: String = row.get(0)?;
            let decl: String = row.get(1)?;
            let not_null: bool = row.get(2)?;
            let default: Option<String> = row.get(3)?;
            let pk: i64 = row.get(4)?;
            Ok(Column {
                references: references.get(&name).cloned(),
                ty: ColumnType::from_sql(&decl),
                nullable: !not_null && pk == 0,
                default,
                primary_key: pk > 0,
                name,
            })
        })
        .map_err(|e| Error::Database(format!("failed to query columns of {table}: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Database(format!("failed to read column of {table}: {e}")))?;

    Ok(TableSchema {
        name: table.to_string(),
        columns,
        indexes: indexes(conn, table)?,
    })
}

fn foreign_keys(conn: &Connection, table: &str) -> Result<BTreeMap<String, Reference>> {
    let mut stmt = conn
        .prepare("SELECT \"from\", \"table\", on_delete FROM pragma_foreign_key_list(?1)")
        .map_err(|e| Error::Database(format!("failed to prepare foreign key query: {e}")))?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Reference {
                    table: row.get(1)?,
                    on_delete: OnDelete::from_sql(&row.get::<_, String>(2)?),
                },
            ))
        })
        .map_err(|e| Error::Database(format!("failed to query foreign keys of {table}: {e}")))?;

    rows.collect::<std::result::Result<BTreeMap<_, _>, _>>()
        .map_err(|e| Error::Database(format!("failed to read foreign key of {table}: {e}")))
}

fn indexes(conn: &Connection, table: &str) -> Result<BTreeMap<String, Index>> {
    // origin 'c' = created by CREATE INDEX; skips automatic pk/unique indexes
    let mut stmt = conn
        .prepare("SELECT name, \"unique\" FROM pragma_index_list(?1) WHERE origin = 'c'")
        .map_err(|e| Error::Database(format!("failed to prepare index query: {e}")))?;
    let listed = stmt
        .query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
        })
        .map_err(|e| Error::Database(format!("failed to query indexes of {table}: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Database(format!("failed to read index of {table}: {e}")))?;

    let mut columns_stmt = conn
        .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
        .map_err(|e| Error::Database(format!("failed to prepare index column query: {e}")))?;

    let mut indexes = BTreeMap::new();
    for (name, unique) in listed {
        let columns = columns_stmt
            .query_map(params![name], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Database(format!("failed to query columns of {name}: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read column of {name}: {e}")))?;
        indexes.insert(
            name.clone(),
            Index {
                name,
                columns,
                unique,
            },
        );
    }
    Ok(indexes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn introspects_columns_keys_and_indexes() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE \"users\" (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT, \"name\" TEXT NOT NULL);
             CREATE TABLE \"orders\" (
                 \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,
                 \"date\" DATE NOT NULL,
                 \"user_id\" INTEGER NOT NULL REFERENCES \"users\"(\"id\") ON DELETE CASCADE,
                 \"note\" TEXT DEFAULT 'none'
             );
             CREATE INDEX \"index_orders_on_user_id\" ON \"orders\" (\"user_id\");
             CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY);",
        )
        .unwrap();

        let snapshot = introspect(&conn).unwrap();
        assert_eq!(
            snapshot.tables.keys().collect::<Vec<_>>(),
            vec!["orders", "users"]
        );

        let orders = snapshot.table("orders").unwrap();
        assert!(orders.columns[0].primary_key);
        assert!(!orders.columns[0].nullable);
        assert_eq!(orders.columns[1].ty, ColumnType::Date);
        let user_id = orders.column("user_id").unwrap();
        assert_eq!(
            user_id.references,
            Some(Reference {
                table: "users".into(),
                on_delete: OnDelete::Cascade
            })
        );
        let note = orders.column("note").unwrap();
        assert!(note.nullable);
        assert_eq!(note.default.as_deref(), Some("'none'"));

        let index = &orders.indexes["index_orders_on_user_id"];
        assert_eq!(index.columns, vec!["user_id".to_string()]);
        assert!(!index.unique);
    }

    #[test]
    fn folded_and_introspected_snapshots_agree() {
        let conn = Connection::open_in_memory().unwrap();
        let mut folded = SchemaSnapshot::new();
        let columns = vec![
            Column::new("name", ColumnType::Text),
            Column::new("cost", ColumnType::Decimal),
            Column::new("active", ColumnType::Boolean).default_value("1"),
        ];
        folded.create_table("products", &columns).unwrap();

        let mut defs: Vec<String> = vec![Column::primary_key().to_sql()];
        defs.extend(columns.iter().map(Column::to_sql));
        conn.execute_batch(&format!("CREATE TABLE \"products\" ({})", defs.join(", ")))
            .unwrap();

        let live = introspect(&conn).unwrap();
        assert!(
            folded.same_structure(&live),
            "{:?}",
            folded.differences(&live)
        );
    }
}
