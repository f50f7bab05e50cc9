use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use strata_common::{Error, Result};

use super::version::MigrationVersion;

/// Table recording applied migrations.
pub const LEDGER_TABLE: &str = "schema_migrations";

/// One applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    /// Position in application order, starting at 1. `applied_at` is
    /// informational only; clocks can step backwards.
    pub sequence: i64,
    pub version: MigrationVersion,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// Read/write access to the ledger through a borrowed connection. Pass a
/// `Transaction` (which derefs to `Connection`) so ledger writes commit
/// together with the schema change they record.
pub struct MigrationLedger<'c> {
    conn: &'c Connection,
}

impl<'c> MigrationLedger<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn ensure_table(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
                    version INTEGER PRIMARY KEY,
                    sequence INTEGER NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    applied_at TEXT NOT NULL
                );"
            ))
            .map_err(|e| Error::Database(format!("failed to create migration ledger: {e}")))
    }

    pub fn has_applied(&self, version: MigrationVersion) -> Result<bool> {
        self.conn
            .query_row(
                &format!("SELECT 1 FROM {LEDGER_TABLE} WHERE version = ?1"),
                params![version],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
            .map_err(|e| Error::Database(format!("failed to check migration {version}: {e}")))
    }

    /// Record `version` as the latest applied migration. Call inside the
    /// write transaction applying it so the next sequence number is stable.
    pub fn record_applied(
        &self,
        version: MigrationVersion,
        name: &str,
        checksum: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {LEDGER_TABLE} (version, sequence, name, checksum, applied_at)
                     VALUES (?1, (SELECT COALESCE(MAX(sequence), 0) + 1 FROM {LEDGER_TABLE}),
                             ?2, ?3, ?4)"
                ),
                params![
                    version,
                    name,
                    checksum,
                    applied_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
                ],
            )
            .map_err(|e| Error::Database(format!("failed to record migration {version}: {e}")))?;
        Ok(())
    }

    pub fn record_reverted(&self, version: MigrationVersion) -> Result<()> {
        let removed = self
            .conn
            .execute(
                &format!("DELETE FROM {LEDGER_TABLE} WHERE version = ?1"),
                params![version],
            )
            .map_err(|e| Error::Database(format!("failed to remove migration {version}: {e}")))?;
        if removed == 0 {
            return Err(Error::NotFound(format!("migration {version} is not recorded")));
        }
        Ok(())
    }

    /// Applied versions in ascending order.
    pub fn all_applied(&self) -> Result<Vec<MigrationVersion>> {
        let mut versions: Vec<MigrationVersion> =
            self.records()?.into_iter().map(|r| r.version).collect();
        versions.sort();
        Ok(versions)
    }

    /// Records in application order (oldest first).
    pub fn records(&self) -> Result<Vec<MigrationRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT sequence, version, name, checksum, applied_at FROM {LEDGER_TABLE}
                 ORDER BY sequence ASC"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare ledger query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(MigrationRecord {
                    sequence: row.get(0)?,
                    version: row.get(1)?,
                    name: row.get(2)?,
                    checksum: row.get(3)?,
                    applied_at: parse_datetime(row.get::<_, String>(4)?),
                })
            })
            .map_err(|e| Error::Database(format!("failed to query ledger: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| Error::Database(format!("failed to read ledger row: {e}")))?);
        }
        Ok(records)
    }
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // rows written by hand with datetime('now') use "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}
