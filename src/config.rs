use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = ".gatorconfig.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub db_url: String,
    #[serde(default)]
    pub current_user_name: String,
}

impl Config {
    /// Parse config from a JSON string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    /// The logged-in user, if one has been set. Only an empty name means unset;
    /// the name is returned exactly as stored.
    pub fn current_user(&self) -> Option<&str> {
        if self.current_user_name.is_empty() {
            None
        } else {
            Some(&self.current_user_name)
        }
    }

    /// Returns a copy of this config with `name` as the current user.
    pub fn with_user(&self, name: &str) -> Self {
        Self {
            current_user_name: name.to_string(),
            ..self.clone()
        }
    }
}

/// Reads and rewrites the config file at a fixed location.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn at<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// `$GATOR_CONFIG` if set, otherwise `~/.gatorconfig.json`.
    pub fn default_location() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var("GATOR_CONFIG") {
            return Ok(Self::at(path));
        }
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(Self::at(PathBuf::from(home).join(CONFIG_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> anyhow::Result<Config> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read config file {}", self.path.display()))?;
        Config::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", self.path.display()))
    }

    /// Overwrites the whole file with `config`.
    pub fn write(&self, config: &Config) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write config file {}", self.path.display()))?;
        Ok(())
    }
}
