use std::collections::BTreeMap;

use strata_common::{Error, Result};

use super::definition::MigrationDefinition;
use super::version::MigrationVersion;

/// Every known migration definition, keyed and iterated by version.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    definitions: BTreeMap<MigrationVersion, MigrationDefinition>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in catalog migrations.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for definition in super::builtin::definitions() {
            // built-in versions are distinct constants
            registry
                .definitions
                .insert(definition.version, definition);
        }
        registry
    }

    /// Add a definition. Fails on a version that is already registered or on
    /// a `down` that could never be applied.
    pub fn register(&mut self, definition: MigrationDefinition) -> Result<()> {
        if let Some(existing) = self.definitions.get(&definition.version) {
            return Err(Error::DefinitionConflict {
                version: definition.version.get(),
                first: existing.name.clone(),
                second: definition.name,
            });
        }
        definition
            .check_down()
            .map_err(|e| Error::Schema(format!("migration {}: {e}", definition.version)))?;
        self.definitions.insert(definition.version, definition);
        Ok(())
    }

    pub fn extend(&mut self, definitions: impl IntoIterator<Item = MigrationDefinition>) -> Result<()> {
        definitions.into_iter().try_for_each(|d| self.register(d))
    }

    pub fn get(&self, version: MigrationVersion) -> Option<&MigrationDefinition> {
        self.definitions.get(&version)
    }

    pub fn contains(&self, version: MigrationVersion) -> bool {
        self.definitions.contains_key(&version)
    }

    /// Definitions in ascending version order.
    pub fn iter(&self) -> impl Iterator<Item = &MigrationDefinition> {
        self.definitions.values()
    }

    pub fn versions(&self) -> impl Iterator<Item = MigrationVersion> + '_ {
        self.definitions.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
