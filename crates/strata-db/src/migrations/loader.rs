use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use strata_common::{Error, Result};
use tracing::debug;

use super::definition::MigrationDefinition;
use super::operation::SchemaOperation;
use super::version::MigrationVersion;

/// On-disk form of a definition. Either `up` (with optional `down`) or
/// `change`, whose `down` is derived automatically.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DefinitionFile {
    up: Vec<SchemaOperation>,
    down: Vec<SchemaOperation>,
    change: Vec<SchemaOperation>,
}

/// Load migration definitions from a directory.
///
/// Files are named `<version>_<name>.yml` (or `.yaml` / `.toml`), e.g.
/// `20240301120000_add_email_to_users.yml`. Other files are ignored. The
/// result is sorted by version; two files with the same version are a
/// [`Error::DefinitionConflict`].
pub fn load_definitions_from_dir(dir: &Path) -> Result<Vec<MigrationDefinition>> {
    if !dir.exists() {
        debug!("migrations directory does not exist: {}", dir.display());
        return Ok(Vec::new());
    }

    let mut definitions: BTreeMap<MigrationVersion, MigrationDefinition> = BTreeMap::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !matches!(ext, "yml" | "yaml" | "toml") {
            continue;
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Config(format!("invalid migration filename: {}", path.display())))?;
        let (version, name) = parse_file_stem(stem)?;

        let contents = std::fs::read_to_string(&path)?;
        let file: DefinitionFile = match ext {
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("{}: TOML parse error: {e}", path.display())))?,
            _ => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("{}: YAML parse error: {e}", path.display())))?,
        };
        let definition = into_definition(version, name, file)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;

        if let Some(existing) = definitions.get(&version) {
            return Err(Error::DefinitionConflict {
                version: version.get(),
                first: existing.name.clone(),
                second: definition.name,
            });
        }
        definitions.insert(version, definition);
    }

    debug!("loaded {} migrations from {}", definitions.len(), dir.display());
    Ok(definitions.into_values().collect())
}

fn parse_file_stem(stem: &str) -> Result<(MigrationVersion, &str)> {
    let (version, name) = stem
        .split_once('_')
        .ok_or_else(|| Error::Config(format!("migration filename must be <version>_<name>: {stem}")))?;
    if name.is_empty() {
        return Err(Error::Config(format!("migration {stem} has an empty name")));
    }
    Ok((version.parse()?, name))
}

fn into_definition(
    version: MigrationVersion,
    name: &str,
    file: DefinitionFile,
) -> std::result::Result<MigrationDefinition, String> {
    match (file.change.is_empty(), file.up.is_empty()) {
        (false, false) => Err("`change` cannot be combined with `up`/`down`".to_string()),
        (false, true) if !file.down.is_empty() => {
            Err("`change` cannot be combined with `up`/`down`".to_string())
        }
        (false, true) => {
            let definition = MigrationDefinition::reversible(version, name, file.change);
            definition.check_down().map_err(|e| e.to_string())?;
            Ok(definition)
        }
        (true, true) => Err("migration has no operations".to_string()),
        (true, false) => Ok(MigrationDefinition::new(version, name, file.up, file.down)),
    }
}
