//! Registry tuning and the on-disk configuration file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Knobs for conflict scoping and the commit protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// When true each VPC+region pair is its own address space.
    pub shared_address_space: bool,
    /// Attempts at acquiring a scope's commit guard before giving up.
    pub max_attempts: u32,
    /// Longest single wait for a commit guard.
    pub lock_wait_ms: u64,
    /// Overall budget for one commit.
    pub commit_deadline_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            shared_address_space: true,
            max_attempts: 8,
            lock_wait_ms: 250,
            commit_deadline_ms: 5_000,
        }
    }
}

impl RegistryConfig {
    /// One address space per family shared by every VPC.
    pub fn global() -> Self {
        Self {
            shared_address_space: false,
            ..Self::default()
        }
    }

    /// Longest single wait for a commit guard.
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Overall budget for one commit.
    pub fn commit_deadline(&self) -> Duration {
        Duration::from_millis(self.commit_deadline_ms)
    }

    /// Parses the registry keys from a TOML document with no table header.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the `[registry]` table of a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        read_file(path).map(|file| file.registry)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.commit_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "commit_deadline_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Contents of `config.toml`.
///
/// ```toml
/// [database]
/// path = "/var/lib/ipam/ipam.db"
///
/// [registry]
/// shared_address_space = false
/// max_attempts = 4
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Storage location.
    #[serde(default)]
    pub database: DatabaseSection,
    /// Registry tuning.
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// `[database]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// SQLite file holding allocations.
    pub path: Option<PathBuf>,
}

impl FileConfig {
    /// Loads `explicit`, else the per-user default file, else defaults.
    ///
    /// An explicitly named file must exist; a missing default file is not an
    /// error.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return read_file(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => read_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Database path from the file, else the per-user data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database.path.clone().or_else(default_database_path)
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: FileConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.registry.validate()?;
    Ok(config)
}

/// `<config dir>/ipam/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("ipam").join("config.toml"))
}

/// `<data dir>/ipam/ipam.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|base| base.join("ipam").join("ipam.db"))
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_documents_keep_defaults() {
        let config = RegistryConfig::from_toml_str("max_attempts = 3").unwrap();
        assert_eq!(config.max_attempts, 3);
        assert!(config.shared_address_space);
        assert_eq!(config.lock_wait(), Duration::from_millis(250));
    }

    #[test]
    fn zero_attempts_rejected() {
        assert!(matches!(
            RegistryConfig::from_toml_str("max_attempts = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn file_sections_parse() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[database]\npath = \"/tmp/x.db\"\n\n[registry]\nshared_address_space = false"
        )
        .unwrap();
        let config = FileConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.database_path(), Some(PathBuf::from("/tmp/x.db")));
        assert!(!config.registry.shared_address_space);
        assert_eq!(config.registry.max_attempts, 8);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            FileConfig::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }
}
