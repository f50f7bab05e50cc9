mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use strata_config::{AppConfig, ConfigLoader, LoggingConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata", version, about = "Versioned schema migrations for the order catalog")]
struct Cli {
    /// Path to a config file (YAML or TOML)
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file, overriding the config
    #[arg(long, global = true, env = "STRATA_DATABASE")]
    database: Option<PathBuf>,

    /// Directory of migration definition files
    #[arg(long, global = true)]
    migrations: Option<PathBuf>,

    /// Skip the built-in catalog migrations
    #[arg(long, global = true)]
    no_builtin: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show every known migration and whether it is applied
    Status,
    /// List migrations that have not been applied
    Pending,
    /// Apply pending migrations
    Migrate {
        /// Stop after this version
        #[arg(long)]
        to: Option<u64>,
    },
    /// Roll back the most recently applied migrations
    Rollback {
        #[arg(default_value_t = 1)]
        steps: usize,
    },
    /// Print the schema produced by the applied migrations
    Schema {
        /// Introspect the database instead of folding migrations
        #[arg(long)]
        live: bool,
        #[arg(long, value_enum, default_value_t = Format::Yaml)]
        format: Format,
    },
    /// Check that applying every pending migration yields a valid schema
    Validate,
    /// Check that the ledger, the definitions and the database agree
    Verify,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Yaml,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        ConfigLoader::load(cli.config.as_deref()).context("failed to load configuration")?;
    apply_overrides(&mut config, &cli);
    init_tracing(&config.logging);

    let runner = commands::open_runner(&config)?;
    match cli.command {
        Commands::Status => commands::status(&runner),
        Commands::Pending => commands::pending(&runner),
        Commands::Migrate { to } => commands::migrate(&runner, to),
        Commands::Rollback { steps } => commands::rollback(&runner, steps),
        Commands::Schema { live, format } => commands::schema(&runner, live, format),
        Commands::Validate => commands::validate(&runner),
        Commands::Verify => commands::verify(&runner),
    }
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(path) = &cli.database {
        config.database.path = path.clone();
    }
    if let Some(dir) = &cli.migrations {
        config.migrations.dir = Some(dir.clone());
    }
    if cli.no_builtin {
        config.migrations.include_builtin = false;
    }
    if cli.json_logs {
        config.logging.json = true;
    }
}

/// `RUST_LOG` wins over the configured level. Logs go to stderr so command
/// output can be piped.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_override_config() {
        let cli = Cli::parse_from([
            "strata",
            "--database",
            "/tmp/shop.db",
            "--no-builtin",
            "migrate",
            "--to",
            "20240115093100",
        ]);
        let mut config = AppConfig::default();
        apply_overrides(&mut config, &cli);

        assert_eq!(config.database.path, PathBuf::from("/tmp/shop.db"));
        assert!(!config.migrations.include_builtin);
        assert!(!config.logging.json);
        assert!(matches!(cli.command, Commands::Migrate { to: Some(20240115093100) }));
    }

    #[test]
    fn rollback_defaults_to_one_step() {
        let cli = Cli::parse_from(["strata", "rollback"]);
        assert!(matches!(cli.command, Commands::Rollback { steps: 1 }));
    }
}
