//! Migration runner.
//!
//! Every migration runs in its own `BEGIN IMMEDIATE` transaction: the schema
//! change and its ledger record commit together or not at all. The
//! immediate transaction takes SQLite's write lock before the ledger is read,
//! so concurrent runners against the same database file serialize and never
//! apply the same version twice. Within a process, callers serialize on the
//! connection mutex.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use strata_common::{Error, Result};
use tracing::{debug, info, warn};

use super::definition::MigrationDefinition;
use super::ledger::{MigrationLedger, MigrationRecord};
use super::registry::MigrationRegistry;
use super::version::MigrationVersion;
use crate::database::Database;
use crate::schema::{SchemaSnapshot, introspect, validate};

/// One row of `status`: a known definition, a recorded version, or both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub version: MigrationVersion,
    pub name: String,
    pub applied_at: Option<DateTime<Utc>>,
    pub reversible: bool,
    /// `false` when the ledger records a version no definition exists for.
    pub defined: bool,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

/// Outcome of an apply or rollback run.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub applied: Vec<MigrationVersion>,
    pub rolled_back: Vec<MigrationVersion>,
    pub elapsed: Duration,
}

pub struct MigrationRunner {
    db: Arc<Database>,
    registry: MigrationRegistry,
}

impl MigrationRunner {
    pub fn new(db: Arc<Database>, registry: MigrationRegistry) -> Result<Self> {
        {
            let conn = db.connection()?;
            MigrationLedger::new(&conn).ensure_table()?;
        }
        Ok(Self { db, registry })
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Known definitions not yet recorded in the ledger, ascending.
    pub fn pending(&self) -> Result<Vec<&MigrationDefinition>> {
        let mut conn = self.db.connection()?;
        let tx = begin(&mut conn, TransactionBehavior::Deferred)?;
        let applied: HashSet<MigrationVersion> =
            MigrationLedger::new(&tx).all_applied()?.into_iter().collect();
        Ok(self
            .registry
            .iter()
            .filter(|d| !applied.contains(&d.version))
            .collect())
    }

    pub fn status(&self) -> Result<Vec<MigrationStatus>> {
        let mut conn = self.db.connection()?;
        let tx = begin(&mut conn, TransactionBehavior::Deferred)?;
        let records = MigrationLedger::new(&tx).records()?;

        let mut rows: BTreeMap<MigrationVersion, MigrationStatus> = self
            .registry
            .iter()
            .map(|d| {
                (
                    d.version,
                    MigrationStatus {
                        version: d.version,
                        name: d.name.clone(),
                        applied_at: None,
                        reversible: d.is_reversible(),
                        defined: true,
                    },
                )
            })
            .collect();

        for record in records {
            rows.entry(record.version)
                .and_modify(|row| row.applied_at = Some(record.applied_at))
                .or_insert_with(|| MigrationStatus {
                    version: record.version,
                    name: record.name.clone(),
                    applied_at: Some(record.applied_at),
                    reversible: false,
                    defined: false,
                });
        }

        Ok(rows.into_values().collect())
    }

    /// Schema produced by folding every applied migration, in the order
    /// they were applied.
    pub fn snapshot(&self) -> Result<SchemaSnapshot> {
        let mut conn = self.db.connection()?;
        let tx = begin(&mut conn, TransactionBehavior::Deferred)?;
        let records = MigrationLedger::new(&tx).records()?;
        self.fold(&records)
    }

    /// Structure of the live database.
    pub fn live_schema(&self) -> Result<SchemaSnapshot> {
        let conn = self.db.connection()?;
        introspect(&conn)
    }

    /// Check that the ledger, the definitions and the live schema agree.
    /// Returns the verified snapshot.
    pub fn verify(&self) -> Result<SchemaSnapshot> {
        let mut conn = self.db.connection()?;
        let tx = begin(&mut conn, TransactionBehavior::Deferred)?;
        let (snapshot, _) = self.verify_locked(&tx)?;
        Ok(snapshot)
    }

    /// Apply every pending migration in ascending version order.
    pub fn apply_pending(&self) -> Result<MigrationReport> {
        self.run_apply(None)
    }

    /// Apply the given migrations (ascending, skipping any already applied).
    pub fn apply(&self, versions: &[MigrationVersion]) -> Result<MigrationReport> {
        for version in versions {
            if !self.registry.contains(*version) {
                return Err(Error::NotFound(format!("no migration with version {version}")));
            }
        }
        self.run_apply(Some(versions.iter().copied().collect()))
    }

    /// Apply pending migrations up to and including `target`.
    pub fn migrate_to(&self, target: MigrationVersion) -> Result<MigrationReport> {
        let versions = self.registry.versions().filter(|v| *v <= target).collect();
        self.run_apply(Some(versions))
    }

    /// Roll back the `steps` most recently applied migrations, newest first.
    /// Fails without changing anything if one of them has no `down`.
    pub fn rollback(&self, steps: usize) -> Result<MigrationReport> {
        let started = Instant::now();
        let mut report = MigrationReport::default();
        if steps == 0 {
            return Ok(report);
        }

        let mut conn = self.db.connection()?;
        {
            let tx = begin(&mut conn, TransactionBehavior::Deferred)?;
            let (_, records) = self.verify_locked(&tx)?;
            for record in records.iter().rev().take(steps) {
                let definition = self.definition_for(record)?;
                if !definition.is_reversible() {
                    return Err(Error::IrreversibleMigration {
                        version: definition.version.get(),
                        name: definition.name.clone(),
                    });
                }
            }
        }

        for _ in 0..steps {
            let tx = begin(&mut conn, TransactionBehavior::Immediate)?;
            let (snapshot, records) = self.verify_locked(&tx)?;
            let Some((latest, remaining)) = records.split_last() else {
                break;
            };
            let definition = self.definition_for(latest)?;
            if !definition.is_reversible() {
                return Err(Error::IrreversibleMigration {
                    version: definition.version.get(),
                    name: definition.name.clone(),
                });
            }
            let expected = self.fold(remaining)?;

            self.revert_one(&tx, definition, snapshot, &expected)?;
            tx.commit().map_err(|e| Error::RollbackFailure {
                version: definition.version.get(),
                name: definition.name.clone(),
                operation: definition.down.len(),
                source: Box::new(Error::Database(format!("commit failed: {e}"))),
            })?;
            info!(
                "rolled back migration {} ({})",
                definition.version, definition.name
            );
            report.rolled_back.push(definition.version);
        }

        report.elapsed = started.elapsed();
        Ok(report)
    }

    fn run_apply(&self, targets: Option<BTreeSet<MigrationVersion>>) -> Result<MigrationReport> {
        let started = Instant::now();
        let mut report = MigrationReport::default();
        let mut conn = self.db.connection()?;

        loop {
            let tx = begin(&mut conn, TransactionBehavior::Immediate)?;
            let (snapshot, records) = self.verify_locked(&tx)?;
            let applied: HashSet<MigrationVersion> = records.iter().map(|r| r.version).collect();

            let next = self.registry.iter().find(|d| {
                !applied.contains(&d.version)
                    && targets.as_ref().is_none_or(|t| t.contains(&d.version))
            });
            let Some(definition) = next else {
                break;
            };

            if let Some(latest) = applied.iter().max().filter(|v| **v > definition.version) {
                warn!(
                    "applying migration {} out of order (latest applied is {latest})",
                    definition.version
                );
            }

            self.apply_one(&tx, definition, snapshot)?;
            tx.commit().map_err(|e| Error::ApplyFailure {
                version: definition.version.get(),
                name: definition.name.clone(),
                operation: definition.up.len(),
                source: Box::new(Error::Database(format!("commit failed: {e}"))),
            })?;
            info!("applied migration {} ({})", definition.version, definition.name);
            report.applied.push(definition.version);
        }

        report.elapsed = started.elapsed();
        if report.applied.is_empty() {
            info!("schema is up to date");
        } else {
            info!(
                "applied {} migration(s) in {:?}",
                report.applied.len(),
                report.elapsed
            );
        }
        Ok(report)
    }

    /// Run `up` and record the version. Failures carry the index of the
    /// failing operation; index `up.len()` means the ledger write or the
    /// post-apply schema check failed.
    fn apply_one(
        &self,
        tx: &Connection,
        definition: &MigrationDefinition,
        mut snapshot: SchemaSnapshot,
    ) -> Result<()> {
        info!(
            "applying migration {} ({})",
            definition.version, definition.name
        );
        let fail = |operation: usize, source: Error| Error::ApplyFailure {
            version: definition.version.get(),
            name: definition.name.clone(),
            operation,
            source: Box::new(source),
        };

        for (index, op) in definition.up.iter().enumerate() {
            op.apply_to(&mut snapshot).map_err(|e| fail(index, e.into()))?;
            validate(&snapshot).map_err(|e| fail(index, e.into()))?;
            execute(tx, op).map_err(|e| fail(index, e))?;
        }
        snapshot.version = Some(definition.version);

        let finished = definition.up.len();
        check_live(tx, &snapshot).map_err(|e| fail(finished, e))?;
        let checksum = definition.checksum().map_err(|e| fail(finished, e))?;
        MigrationLedger::new(tx)
            .record_applied(definition.version, &definition.name, &checksum, Utc::now())
            .map_err(|e| fail(finished, e))
    }

    fn revert_one(
        &self,
        tx: &Connection,
        definition: &MigrationDefinition,
        mut snapshot: SchemaSnapshot,
        expected: &SchemaSnapshot,
    ) -> Result<()> {
        info!(
            "rolling back migration {} ({})",
            definition.version, definition.name
        );
        let fail = |operation: usize, source: Error| Error::RollbackFailure {
            version: definition.version.get(),
            name: definition.name.clone(),
            operation,
            source: Box::new(source),
        };

        for (index, op) in definition.down.iter().enumerate() {
            op.apply_to(&mut snapshot).map_err(|e| fail(index, e.into()))?;
            execute(tx, op).map_err(|e| fail(index, e))?;
        }

        let finished = definition.down.len();
        if !snapshot.same_structure(expected) {
            return Err(fail(
                finished,
                Error::Schema(format!(
                    "down operations do not restore the previous schema: {}",
                    expected.differences(&snapshot).join("; ")
                )),
            ));
        }
        check_live(tx, expected).map_err(|e| fail(finished, e))?;
        MigrationLedger::new(tx)
            .record_reverted(definition.version)
            .map_err(|e| fail(finished, e))
    }

    fn definition_for(&self, record: &MigrationRecord) -> Result<&MigrationDefinition> {
        self.registry.get(record.version).ok_or_else(|| {
            Error::LedgerInconsistency(format!(
                "migration {} ({}) is recorded as applied but no definition exists",
                record.version, record.name
            ))
        })
    }

    /// Replay the `up` operations of `records` in order.
    fn fold(&self, records: &[MigrationRecord]) -> Result<SchemaSnapshot> {
        let mut snapshot = SchemaSnapshot::new();
        for record in records {
            let definition = self.definition_for(record)?;
            for (index, op) in definition.up.iter().enumerate() {
                op.apply_to(&mut snapshot).map_err(|e| {
                    Error::LedgerInconsistency(format!(
                        "replaying migration {} ({}) failed at operation {index}: {e}",
                        record.version, record.name
                    ))
                })?;
            }
            snapshot.version = Some(record.version);
        }
        Ok(snapshot)
    }

    /// Refuse to proceed when the ledger names unknown or edited
    /// definitions, or when the live schema differs from the replayed one.
    fn verify_locked(&self, conn: &Connection) -> Result<(SchemaSnapshot, Vec<MigrationRecord>)> {
        let records = MigrationLedger::new(conn).records()?;

        for record in &records {
            let definition = self.definition_for(record)?;
            let checksum = definition.checksum()?;
            if checksum != record.checksum {
                return Err(Error::LedgerInconsistency(format!(
                    "migration {} ({}) was modified after it was applied (recorded checksum {}, current {})",
                    record.version, record.name, record.checksum, checksum
                )));
            }
        }

        let snapshot = self.fold(&records)?;
        let live = introspect(conn)?;
        if !snapshot.same_structure(&live) {
            return Err(Error::LedgerInconsistency(format!(
                "database schema does not match applied migrations: {}",
                snapshot.differences(&live).join("; ")
            )));
        }

        debug!("ledger verified: {} applied migration(s)", records.len());
        Ok((snapshot, records))
    }
}

fn begin(
    conn: &mut Connection,
    behavior: TransactionBehavior,
) -> Result<rusqlite::Transaction<'_>> {
    conn.transaction_with_behavior(behavior)
        .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))
}

fn execute(tx: &Connection, op: &super::SchemaOperation) -> Result<()> {
    for sql in op.to_sql() {
        debug!("executing: {sql}");
        tx.execute_batch(&sql)
            .map_err(|e| Error::Database(format!("{}: {e}", op.describe())))?;
    }
    Ok(())
}

fn check_live(tx: &Connection, expected: &SchemaSnapshot) -> Result<()> {
    let live = introspect(tx)?;
    if expected.same_structure(&live) {
        Ok(())
    } else {
        Err(Error::Schema(format!(
            "database schema diverged from the migration: {}",
            expected.differences(&live).join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::SchemaOperation;
    use crate::schema::{Column, ColumnType};

    fn runner_with(definitions: Vec<MigrationDefinition>) -> MigrationRunner {
        let mut registry = MigrationRegistry::new();
        registry.extend(definitions).unwrap();
        MigrationRunner::new(Arc::new(Database::in_memory().unwrap()), registry).unwrap()
    }

    fn create(version: u64, table: &str) -> MigrationDefinition {
        MigrationDefinition::reversible(
            version,
            format!("create_{table}"),
            vec![SchemaOperation::create_table(
                table,
                vec![Column::new("label", ColumnType::Text)],
            )],
        )
    }

    #[test]
    fn apply_pending_is_idempotent() {
        let runner = runner_with(vec![create(1, "tags"), create(2, "notes")]);
        assert_eq!(runner.pending().unwrap().len(), 2);

        let first = runner.apply_pending().unwrap();
        assert_eq!(
            first.applied,
            vec![MigrationVersion::new(1), MigrationVersion::new(2)]
        );
        assert!(runner.pending().unwrap().is_empty());

        let second = runner.apply_pending().unwrap();
        assert!(second.applied.is_empty());
    }

    #[test]
    fn apply_selected_versions_only() {
        let runner = runner_with(vec![create(1, "tags"), create(2, "notes"), create(3, "labels")]);
        let report = runner
            .apply(&[MigrationVersion::new(3), MigrationVersion::new(1)])
            .unwrap();
        assert_eq!(
            report.applied,
            vec![MigrationVersion::new(1), MigrationVersion::new(3)]
        );
        let pending: Vec<_> = runner.pending().unwrap().iter().map(|d| d.version).collect();
        assert_eq!(pending, vec![MigrationVersion::new(2)]);

        assert!(matches!(
            runner.apply(&[MigrationVersion::new(99)]),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn migrate_to_stops_at_target() {
        let runner = runner_with(vec![create(1, "tags"), create(2, "notes"), create(3, "labels")]);
        let report = runner.migrate_to(MigrationVersion::new(2)).unwrap();
        assert_eq!(report.applied.len(), 2);
        assert_eq!(runner.pending().unwrap().len(), 1);
    }

    #[test]
    fn status_lists_applied_and_pending() {
        let runner = runner_with(vec![create(1, "tags"), create(2, "notes")]);
        runner.apply(&[MigrationVersion::new(1)]).unwrap();

        let status = runner.status().unwrap();
        assert_eq!(status.len(), 2);
        assert!(status[0].is_applied());
        assert!(status[0].defined);
        assert!(!status[1].is_applied());
        assert_eq!(status[1].name, "create_notes");
    }

    #[test]
    fn failed_operation_rolls_back_the_whole_migration() {
        let broken = MigrationDefinition::reversible(
            2,
            "broken",
            vec![
                SchemaOperation::create_table("notes", vec![Column::new("body", ColumnType::Text)]),
                // duplicate table: rejected at operation 1
                SchemaOperation::create_table("tags", vec![]),
            ],
        );
        let runner = runner_with(vec![create(1, "tags"), broken, create(3, "labels")]);

        let err = runner.apply_pending().unwrap_err();
        match &err {
            Error::ApplyFailure {
                version, operation, ..
            } => {
                assert_eq!(*version, 2);
                assert_eq!(*operation, 1);
            }
            other => panic!("expected ApplyFailure, got {other:?}"),
        }

        let status = runner.status().unwrap();
        let applied: Vec<u64> = status
            .iter()
            .filter(|s| s.is_applied())
            .map(|s| s.version.get())
            .collect();
        assert_eq!(applied, vec![1]);

        let live = runner.live_schema().unwrap();
        assert!(live.has_table("tags"));
        assert!(!live.has_table("notes"));
        assert!(!live.has_table("labels"));
    }

    #[test]
    fn incomplete_relationship_fails_validation() {
        let def = MigrationDefinition::reversible(
            1,
            "create_orders",
            vec![SchemaOperation::create_table(
                "orders",
                vec![Column::new("user_id", ColumnType::Integer)],
            )],
        );
        let runner = runner_with(vec![def]);
        let err = runner.apply_pending().unwrap_err();
        assert!(err.to_string().contains("no foreign-key constraint"), "{err}");
        assert!(runner.live_schema().unwrap().tables.is_empty());
    }

    #[test]
    fn rollback_without_down_is_an_error() {
        let seed = MigrationDefinition::irreversible(
            2,
            "create_notes",
            vec![SchemaOperation::create_table("notes", vec![])],
        );
        let runner = runner_with(vec![create(1, "tags"), seed]);
        runner.apply_pending().unwrap();

        let err = runner.rollback(2).unwrap_err();
        assert!(matches!(err, Error::IrreversibleMigration { version: 2, .. }));
        // nothing was rolled back, not even the reversible one
        assert!(runner.pending().unwrap().is_empty());
    }

    #[test]
    fn rollback_reverts_newest_first() {
        let runner = runner_with(vec![create(1, "tags"), create(2, "notes"), create(3, "labels")]);
        runner.apply_pending().unwrap();

        let report = runner.rollback(2).unwrap();
        assert_eq!(
            report.rolled_back,
            vec![MigrationVersion::new(3), MigrationVersion::new(2)]
        );
        let live = runner.live_schema().unwrap();
        assert_eq!(live.tables.keys().collect::<Vec<_>>(), vec!["tags"]);

        // asking for more than is applied stops at the beginning of history
        let report = runner.rollback(10).unwrap();
        assert_eq!(report.rolled_back, vec![MigrationVersion::new(1)]);
        assert!(runner.rollback(1).unwrap().rolled_back.is_empty());
        assert_eq!(runner.rollback(0).unwrap().rolled_back.len(), 0);
    }

    #[test]
    fn down_that_does_not_restore_schema_is_rejected() {
        let lossy = MigrationDefinition::new(
            2,
            "add_body",
            vec![SchemaOperation::AddColumn {
                table: "tags".into(),
                column: Column::new("body", ColumnType::Text).nullable(),
            }],
            vec![SchemaOperation::add_index("tags", &["label"])],
        );
        let runner = runner_with(vec![create(1, "tags"), lossy]);
        runner.apply_pending().unwrap();

        let err = runner.rollback(1).unwrap_err();
        assert!(matches!(err, Error::RollbackFailure { version: 2, .. }), "{err}");
        assert!(runner.pending().unwrap().is_empty());
        assert!(runner.verify().is_ok());
    }

    #[test]
    fn replay_follows_application_order_when_clock_steps_back() {
        let runner = runner_with(vec![create(1, "tags"), create(2, "notes")]);
        runner.apply_pending().unwrap();
        let ext = MigrationDefinition::reversible(
            3,
            "add_tag_to_notes",
            vec![SchemaOperation::add_foreign_key("notes", "tag_id", "tags")],
        );
        let mut registry = runner.registry().clone();
        registry.register(ext).unwrap();
        let runner = MigrationRunner::new(runner.db.clone(), registry).unwrap();
        runner.apply_pending().unwrap();

        {
            let conn = runner.db.connection().unwrap();
            conn.execute_batch(
                "UPDATE schema_migrations SET applied_at = '2099-01-01T00:00:00.000000000Z'
                 WHERE version = 2;
                 UPDATE schema_migrations SET applied_at = '2000-01-01 00:00:00'
                 WHERE version = 3;",
            )
            .unwrap();
        }

        let snapshot = runner.verify().unwrap();
        assert_eq!(snapshot.version, Some(MigrationVersion::new(3)));

        let report = runner.rollback(1).unwrap();
        assert_eq!(report.rolled_back, vec![MigrationVersion::new(3)]);
        assert!(runner.live_schema().unwrap().table("notes").unwrap().column("tag_id").is_none());
        runner.verify().unwrap();
    }

    #[test]
    fn added_foreign_key_rolls_back() {
        let add_fk = MigrationDefinition::reversible(
            3,
            "add_user_to_notes",
            vec![
                SchemaOperation::add_foreign_key("notes", "user_id", "users"),
                SchemaOperation::add_index("notes", &["user_id"]),
            ],
        );
        let runner = runner_with(vec![create(1, "users"), create(2, "notes"), add_fk]);
        runner.migrate_to(MigrationVersion::new(2)).unwrap();
        let before = runner.live_schema().unwrap();

        runner.apply_pending().unwrap();
        let live = runner.live_schema().unwrap();
        let notes = live.table("notes").unwrap();
        let fk = notes.column("user_id").unwrap().references.as_ref().unwrap();
        assert_eq!(fk.table, "users");
        assert!(notes.index_leading_with("user_id").is_some());

        let report = runner.rollback(1).unwrap();
        assert_eq!(report.rolled_back, vec![MigrationVersion::new(3)]);
        assert_eq!(runner.live_schema().unwrap(), before);
        runner.verify().unwrap();
    }

    #[test]
    fn unrecorded_schema_change_is_a_ledger_inconsistency() {
        let runner = runner_with(vec![create(1, "tags"), create(2, "notes")]);
        runner.apply(&[MigrationVersion::new(1)]).unwrap();

        {
            let conn = runner.db.connection().unwrap();
            conn.execute_batch("ALTER TABLE tags ADD COLUMN sneaky TEXT").unwrap();
        }

        let err = runner.apply_pending().unwrap_err();
        assert!(matches!(err, Error::LedgerInconsistency(_)));
        assert!(err.to_string().contains("tags.sneaky"), "{err}");
        assert_eq!(runner.pending().unwrap().len(), 1);
    }

    #[test]
    fn unknown_recorded_version_is_a_ledger_inconsistency() {
        let db = Arc::new(Database::in_memory().unwrap());
        let mut registry = MigrationRegistry::new();
        registry.register(create(1, "tags")).unwrap();
        let runner = MigrationRunner::new(db.clone(), registry).unwrap();
        runner.apply_pending().unwrap();

        let forgetful = MigrationRunner::new(db, MigrationRegistry::new()).unwrap();
        let err = forgetful.verify().unwrap_err();
        assert!(err.to_string().contains("no definition exists"), "{err}");

        let status = forgetful.status().unwrap();
        assert_eq!(status.len(), 1);
        assert!(!status[0].defined);
    }

    #[test]
    fn edited_definition_is_detected_by_checksum() {
        let db = Arc::new(Database::in_memory().unwrap());
        let mut registry = MigrationRegistry::new();
        registry.register(create(1, "tags")).unwrap();
        MigrationRunner::new(db.clone(), registry)
            .unwrap()
            .apply_pending()
            .unwrap();

        let mut edited = create(1, "tags");
        edited.up.push(SchemaOperation::add_index("tags", &["label"]));
        let mut registry = MigrationRegistry::new();
        registry.register(edited).unwrap();
        let runner = MigrationRunner::new(db, registry).unwrap();

        let err = runner.verify().unwrap_err();
        assert!(err.to_string().contains("modified after it was applied"), "{err}");
    }
}
