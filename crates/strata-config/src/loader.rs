use std::path::{Path, PathBuf};

use strata_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_CANDIDATES: &[&str] = &["config.yml", "config.yaml", "config.toml"];

/// Locates and parses the Strata configuration file.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Default configuration directory (`~/.config/strata` on Linux).
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("strata"))
    }

    /// Load configuration from an explicit path, or from the first config
    /// file found in the default directory. A missing file yields defaults;
    /// a file that exists but cannot be parsed is an error.
    pub fn load(explicit: Option<&Path>) -> Result<AppConfig> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Self::load_file(path);
        }

        let Some(dir) = Self::default_config_dir() else {
            debug!("no config directory available, using defaults");
            return Ok(AppConfig::default());
        };

        match CONFIG_CANDIDATES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists())
        {
            Some(path) => Self::load_file(&path),
            None => {
                debug!("no config file in {}, using defaults", dir.display());
                Ok(AppConfig::default())
            }
        }
    }

    /// Parse a config file; the format is chosen by extension.
    pub fn load_file(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::parse(path, &contents)?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<AppConfig> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "yml" | "yaml" => serde_yaml::from_str(contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
            "toml" => {
                toml::from_str(contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
            }
            other => Err(Error::Config(format!(
                "unsupported config extension: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn yaml_config_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            "database:\n  path: /var/lib/strata/shop.db\nmigrations:\n  include_builtin: false\n",
        )
        .unwrap();

        let config = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(
            config.database.path,
            PathBuf::from("/var/lib/strata/shop.db")
        );
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert!(!config.migrations.include_builtin);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn toml_config_is_parsed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[migrations]\ndir = \"db/migrate\"\n\n[logging]\njson = true\n",
        )
        .unwrap();

        let config = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(config.migrations.dir, Some(PathBuf::from("db/migrate")));
        assert!(config.migrations.include_builtin);
        assert!(config.logging.json);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = ConfigLoader::load(Some(Path::new("/nonexistent/strata.yml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.ini");
        fs::write(&path, "[database]").unwrap();
        let err = ConfigLoader::load_file(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config extension"));
    }

    #[test]
    fn malformed_yaml_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "database: [unclosed").unwrap();
        let err = ConfigLoader::load_file(&path).unwrap_err();
        assert!(err.to_string().contains("YAML parse error"));
    }
}
