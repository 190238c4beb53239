use crate::config::{AppConfig, get_config_dir};
use crate::schema::SchemaPreset;
use parking_lot::Mutex;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Config directory not found")]
    NoConfigDir,
}

/// What `config use-preset` changed besides the preset itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetSwitch {
    pub preset: SchemaPreset,
    /// Names from the custom `[[permissions]]` list, which would otherwise
    /// keep overriding the preset.
    pub removed_permissions: Vec<String>,
    /// A `storage_key` that pointed at some preset's record. Removed so the
    /// new preset's own key applies.
    pub removed_storage_key: Option<String>,
    /// A `storage_key` not tied to any preset. Kept, but records stored under
    /// it may have been written with another permission set.
    pub kept_storage_key: Option<String>,
}

impl PresetSwitch {
    fn apply(config: &mut AppConfig, preset: SchemaPreset) -> Self {
        let removed_permissions = config
            .permissions
            .drain(..)
            .map(|entry| entry.name)
            .collect();

        let (removed_storage_key, kept_storage_key) = match config.storage_key.take() {
            Some(key) if SchemaPreset::is_preset_key(&key) => (Some(key), None),
            Some(key) => {
                config.storage_key = Some(key.clone());
                (None, Some(key))
            }
            None => (None, None),
        };

        config.preset = Some(preset);

        Self {
            preset,
            removed_permissions,
            removed_storage_key,
            kept_storage_key,
        }
    }
}

/// Rewrites `config.toml` in place for the CLI's `config` subcommands.
pub struct ConfigPersister {
    config_path: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigPersister {
    #[must_use]
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_default_path() -> ConfigResult<Self> {
        get_config_dir()
            .map(|dir| Self::new(dir.join("config.toml")))
            .ok_or(ConfigError::NoConfigDir)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Selects `preset` and removes the settings that would stop it from
    /// taking effect: the custom permission list and a storage key left over
    /// from another preset. Other settings are kept.
    pub fn use_preset(&self, preset: SchemaPreset) -> ConfigResult<PresetSwitch> {
        let _lock = self.write_lock.lock();

        let mut config = self.read()?;
        let switch = PresetSwitch::apply(&mut config, preset);
        self.write(&config)?;

        tracing::info!(
            path = %self.config_path.display(),
            %preset,
            removed_permissions = switch.removed_permissions.len(),
            "Switched permission preset"
        );
        Ok(switch)
    }

    fn read(&self) -> ConfigResult<AppConfig> {
        if !self.config_path.exists() {
            return Ok(AppConfig::default());
        }
        let content = fs::read_to_string(&self.config_path)?;
        Ok(toml::from_str(&content)?)
    }

    fn write(&self, config: &AppConfig) -> ConfigResult<()> {
        let parent = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let content = format!(
            "# permsync configuration\n\
             # Rewritten by `permsync config use-preset`.\n\n\
             {}",
            toml::to_string_pretty(config)?
        );

        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(content.as_bytes())?;
        temp.persist(&self.config_path).map_err(|e| e.error)?;
        Ok(())
    }
}
