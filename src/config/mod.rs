//! Server settings
//!
//! Loads relay settings from an optional TOML file. A missing file yields
//! the defaults; CLI flags may override individual fields afterwards.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading settings
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Relay server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Address to bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Channels advertised in the welcome payload. Joining is not restricted
    /// to this list; it is only what clients see before picking a room.
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_channels() -> Vec<String> {
    ["general", "random", "help", "announcements"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            channels: default_channels(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file; defaults if the file does not exist
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Socket address to bind the listener to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
