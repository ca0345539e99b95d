//! Configuration loading for the graft daemon.
//!
//! Configuration lives in a single TOML file (`graft.toml` by default).
//! Every section has sensible defaults so a minimal deployment only has to
//! override paths that differ from the packaged layout.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid TOML or has the wrong shape.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying parse error.
        source: toml::de::Error,
    },

    /// A field failed validation.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What was wrong.
        reason: String,
    },
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Hook socket and helper settings.
    pub hooks: HooksConfig,
    /// Object-daemon connection settings.
    pub objd: ObjdConfig,
    /// Record store settings.
    pub db: DbConfig,
    /// Web front-end settings used when constructing user-visible URLs.
    pub web: WebConfig,
}

/// Hook IPC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HooksConfig {
    /// Unix socket the hook helper connects back to.
    pub socket: PathBuf,
    /// Directory holding the hook executables new repositories point at.
    pub execs: PathBuf,
}

/// Object-daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ObjdConfig {
    /// Unix socket of the object daemon.
    pub socket: PathBuf,
}

/// Record store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DbConfig {
    /// SQLite database path.
    pub path: PathBuf,
}

/// Web front-end settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WebConfig {
    /// Root URL of the web front end, without a trailing slash.
    pub root: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hooks: HooksConfig::default(),
            objd: ObjdConfig::default(),
            db: DbConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/var/run/graft/hooks.sock"),
            execs: PathBuf::from("/usr/libexec/graft/hooks"),
        }
    }
}

impl Default for ObjdConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/var/run/graft/objd.sock"),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/graft/graft.db"),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            root: String::from("http://localhost:8080"),
        }
    }
}

impl Config {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// a field fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.web.root.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "web.root must not be empty".to_owned(),
            });
        }
        if self.web.root.ends_with('/') {
            return Err(ConfigError::Invalid {
                reason: "web.root must not end with a slash".to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn loads_partial_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[hooks]\nsocket = \"/tmp/test-hooks.sock\"\n\n[web]\nroot = \"https://forge.example.org\"\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.hooks.socket, PathBuf::from("/tmp/test-hooks.sock"));
        assert_eq!(config.web.root, "https://forge.example.org");
        // Untouched section keeps its default.
        assert_eq!(config.db.path, PathBuf::from("/var/lib/graft/graft.db"));
    }

    #[test]
    fn trailing_slash_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[web]\nroot = \"https://forge.example.org/\"\n").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn unknown_keys_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[hooks]\nsock = \"/tmp/x\"\n").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
