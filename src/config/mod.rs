pub mod persistence;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use std::{fs, io};

use crate::core::error::Result;
use crate::schema::{BROADCAST_EVENT, DEFAULT_STORAGE_KEY, PermissionSchema, SchemaPreset};

pub use persistence::{ConfigError, ConfigPersister, ConfigResult, PresetSwitch};

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

pub fn get_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|h| h.join("Library/Application Support/permsync"))
    }

    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
            .map(|c| c.join("permsync"))
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .map(|a| a.join("permsync"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|h| h.join(".config/permsync"))
    }
}

/// One entry of a custom permission set. Names are values rather than table
/// keys so their case survives the config layering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEntry {
    pub name: String,
    #[serde(rename = "default")]
    pub default_value: bool,
}

impl PermissionEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, default_value: bool) -> Self {
        Self {
            name: name.into(),
            default_value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<SchemaPreset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<PermissionEntry>,
}

impl AppConfig {
    #[must_use]
    pub fn load() -> Self {
        let mut builder = Config::builder();

        if let Some(path) = Self::get_config_path() {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(Environment::with_prefix("PERMSYNC"));

        builder
            .build()
            .and_then(Config::try_deserialize)
            .unwrap_or_else(|e| {
                eprintln!("Warning: Failed to load config: {e}");
                Self::default()
            })
    }

    #[must_use]
    pub fn get_config_path() -> Option<PathBuf> {
        get_config_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn init_default() -> std::result::Result<PathBuf, io::Error> {
        let path = Self::get_config_path().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "Could not determine config directory",
            )
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Config file already exists at {}", path.display()),
            ));
        }

        fs::write(&path, include_str!("config.template.toml"))?;
        Ok(path)
    }

    /// A custom `[[permissions]]` list wins over the preset.
    pub fn schema(&self) -> Result<PermissionSchema> {
        if self.permissions.is_empty() {
            return Ok(PermissionSchema::preset(self.preset.unwrap_or_default()));
        }
        PermissionSchema::new(
            self.permissions
                .iter()
                .map(|entry| (entry.name.clone(), entry.default_value)),
        )
    }

    #[must_use]
    pub fn storage_key(&self) -> String {
        if let Some(key) = &self.storage_key {
            return key.clone();
        }
        match self.preset {
            Some(preset) if self.permissions.is_empty() => preset.storage_key().to_string(),
            _ => DEFAULT_STORAGE_KEY.to_string(),
        }
    }

    #[must_use]
    pub fn event_name(&self) -> String {
        self.event_name
            .clone()
            .unwrap_or_else(|| BROADCAST_EVENT.to_string())
    }

    #[must_use]
    pub fn storage_path(&self) -> PathBuf {
        self.storage_path.clone().unwrap_or_else(|| {
            get_config_dir()
                .unwrap_or_else(|| PathBuf::from(".permsync"))
                .join("storage.json")
        })
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        )
    }
}
