use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use strata_config::AppConfig;
use strata_db::migrations::load_definitions_from_dir;
use strata_db::schema::{lint, validate as validate_schema};
use strata_db::{Database, MigrationRegistry, MigrationRunner, MigrationVersion, SchemaSnapshot};
use tracing::info;

use crate::Format;

pub fn open_runner(config: &AppConfig) -> anyhow::Result<MigrationRunner> {
    let mut registry = if config.migrations.include_builtin {
        MigrationRegistry::builtin()
    } else {
        MigrationRegistry::new()
    };
    if let Some(dir) = &config.migrations.dir {
        let definitions = load_definitions_from_dir(dir)
            .with_context(|| format!("failed to load migrations from {}", dir.display()))?;
        registry.extend(definitions)?;
    }

    let db = Database::open(
        &config.database.path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )?;
    Ok(MigrationRunner::new(Arc::new(db), registry)?)
}

pub fn status(runner: &MigrationRunner) -> anyhow::Result<()> {
    println!("{:<16} {:<8} {:<26} NAME", "VERSION", "STATUS", "APPLIED AT");
    for row in runner.status()? {
        let state = match (row.is_applied(), row.defined) {
            (_, false) => "missing",
            (true, true) => "up",
            (false, true) => "down",
        };
        let applied_at = row
            .applied_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<8} {:<26} {}",
            row.version.to_string(),
            state,
            applied_at,
            row.name
        );
    }
    Ok(())
}

pub fn pending(runner: &MigrationRunner) -> anyhow::Result<()> {
    let pending = runner.pending()?;
    if pending.is_empty() {
        println!("no pending migrations");
    }
    for definition in pending {
        println!("{} {}", definition.version, definition.name);
    }
    Ok(())
}

pub fn migrate(runner: &MigrationRunner, to: Option<u64>) -> anyhow::Result<()> {
    let report = match to {
        Some(target) => runner.migrate_to(MigrationVersion::new(target))?,
        None => runner.apply_pending()?,
    };
    for version in &report.applied {
        println!("applied {version}");
    }
    println!(
        "{} migration(s) applied in {:.2?}",
        report.applied.len(),
        report.elapsed
    );
    Ok(())
}

pub fn rollback(runner: &MigrationRunner, steps: usize) -> anyhow::Result<()> {
    let report = runner.rollback(steps)?;
    for version in &report.rolled_back {
        println!("rolled back {version}");
    }
    println!(
        "{} migration(s) rolled back in {:.2?}",
        report.rolled_back.len(),
        report.elapsed
    );
    Ok(())
}

pub fn schema(runner: &MigrationRunner, live: bool, format: Format) -> anyhow::Result<()> {
    let snapshot = if live {
        runner.live_schema()?
    } else {
        runner.snapshot()?
    };
    println!("{}", render(&snapshot, format)?);
    Ok(())
}

/// Fold every pending migration onto the applied schema without touching
/// the database, reporting the first structural or validation error and any
/// lint warnings of the result.
pub fn validate(runner: &MigrationRunner) -> anyhow::Result<()> {
    let mut snapshot = runner.verify()?;
    for definition in runner.pending()? {
        for (index, op) in definition.up.iter().enumerate() {
            op.apply_to(&mut snapshot)
                .and_then(|()| validate_schema(&snapshot))
                .with_context(|| {
                    format!(
                        "migration {} ({}) operation {index}: {}",
                        definition.version,
                        definition.name,
                        op.describe()
                    )
                })?;
        }
        snapshot.version = Some(definition.version);
    }

    let warnings = lint(&snapshot);
    for warning in &warnings {
        println!("warning: {warning}");
    }
    println!(
        "schema valid ({} table(s), {} warning(s))",
        snapshot.tables.len(),
        warnings.len()
    );
    Ok(())
}

pub fn verify(runner: &MigrationRunner) -> anyhow::Result<()> {
    let snapshot = runner.verify()?;
    let applied = runner.status()?.iter().filter(|s| s.is_applied()).count();
    info!("ledger verified");
    match snapshot.version {
        Some(version) => println!("ok: {applied} migration(s) applied, latest {version}"),
        None => println!("ok: no migrations applied"),
    }
    Ok(())
}

fn render(snapshot: &SchemaSnapshot, format: Format) -> anyhow::Result<String> {
    Ok(match format {
        Format::Json => serde_json::to_string_pretty(snapshot)?,
        Format::Yaml => serde_yaml::to_string(snapshot)?,
    })
}
