//! Configuration file loading

use super::schema::Config;
use super::validator::ConfigValidator;
use crate::error::ConfigError;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Find the user config by checking environment and standard locations
    pub fn find_user_config() -> Option<PathBuf> {
        // 1. $CLOUDSOCKS_CONFIG
        if let Ok(path) = env::var("CLOUDSOCKS_CONFIG") {
            let p = PathBuf::from(path);
            if p.exists() {
                return Some(p);
            }
        }

        // 2. $XDG_CONFIG_HOME/cloudsocks/config.toml
        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            let p = PathBuf::from(xdg).join("cloudsocks/config.toml");
            if p.exists() {
                return Some(p);
            }
        }

        // 3. ~/.config/cloudsocks/config.toml
        if let Ok(home) = env::var("HOME") {
            let p = PathBuf::from(home).join(".config/cloudsocks/config.toml");
            if p.exists() {
                return Some(p);
            }
        }

        None
    }

    /// Load config from a file. Sections and fields missing from the file
    /// keep their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::ConfigLoad {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load the user config if one exists, otherwise the defaults
    pub fn load() -> Result<Config, ConfigError> {
        match Self::find_user_config() {
            Some(path) => {
                tracing::debug!("Loading config from {:?}", path);
                Self::load_from_file(&path)
            }
            None => {
                tracing::debug!("No user config found, using defaults");
                Ok(Config::default())
            }
        }
    }

    /// Load and validate config from an explicit path or the standard locations
    /// Priority: Explicit path > User config > Defaults
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let config = match path {
            Some(p) => Self::load_from_file(&p)?,
            None => Self::load()?,
        };

        ConfigValidator::validate(&config)?;
        Ok(config)
    }
}
