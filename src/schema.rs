//! Shared permission schema.
//!
//! Every bundle that talks to a [`PermissionStore`](crate::PermissionStore)
//! builds its store from the constants and presets in this module, so the
//! storage key, broadcast event name and permission key set cannot drift
//! between independently deployed consumers.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::core::error::{Result, StoreError};

/// Bumped whenever the persisted layout or wire payload changes shape.
pub const SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_STORAGE_KEY: &str = "microfrontend-permissions";

pub const LEGACY_STORAGE_KEY: &str = "userPermissions";

pub const BROADCAST_EVENT: &str = "permissions-updated";

const MICROFRONTEND_DEFAULTS: &[(&str, bool)] = &[
    ("canAccessRemote1", true),
    ("canAccessRemote2", true),
    ("canAccessAdmin", false),
    ("canViewRemote2Dashboard", true),
    ("canViewRemote2Analytics", true),
    ("canViewRemote2Settings", true),
    ("canEditRemote2Data", true),
];

const WIDGET_DEFAULTS: &[(&str, bool)] = &[
    ("canViewWidget", false),
    ("canEditData", false),
    ("canAccessAdmin", false),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaPreset {
    #[default]
    Microfrontend,
    Widget,
}

impl SchemaPreset {
    pub const ALL: [Self; 2] = [Self::Microfrontend, Self::Widget];

    /// Whether `key` is the storage key some preset persists under.
    #[must_use]
    pub fn is_preset_key(key: &str) -> bool {
        Self::ALL.iter().any(|preset| preset.storage_key() == key)
    }

    #[must_use]
    pub const fn storage_key(self) -> &'static str {
        match self {
            Self::Microfrontend => DEFAULT_STORAGE_KEY,
            Self::Widget => LEGACY_STORAGE_KEY,
        }
    }

    const fn defaults(self) -> &'static [(&'static str, bool)] {
        match self {
            Self::Microfrontend => MICROFRONTEND_DEFAULTS,
            Self::Widget => WIDGET_DEFAULTS,
        }
    }
}

impl fmt::Display for SchemaPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Microfrontend => write!(f, "microfrontend"),
            Self::Widget => write!(f, "widget"),
        }
    }
}

impl FromStr for SchemaPreset {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "microfrontend" => Ok(Self::Microfrontend),
            "widget" => Ok(Self::Widget),
            other => Err(StoreError::Schema(format!(
                "unknown preset '{other}', expected 'microfrontend' or 'widget'"
            ))),
        }
    }
}

/// The closed, ordered set of permission names and their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionSchema {
    entries: Vec<(String, bool)>,
}

impl PermissionSchema {
    pub fn new<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        let entries: Vec<(String, bool)> = entries
            .into_iter()
            .map(|(name, default)| (name.into(), default))
            .collect();

        if entries.is_empty() {
            return Err(StoreError::Schema(
                "at least one permission is required".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(entries.len());
        for (name, _) in &entries {
            if name.trim().is_empty() {
                return Err(StoreError::Schema(
                    "permission names must not be empty".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(StoreError::Schema(format!(
                    "duplicate permission '{name}'"
                )));
            }
        }
        drop(seen);

        Ok(Self { entries })
    }

    #[must_use]
    pub fn preset(preset: SchemaPreset) -> Self {
        Self {
            entries: preset
                .defaults()
                .iter()
                .map(|(name, default)| ((*name).to_string(), *default))
                .collect(),
        }
    }

    #[must_use]
    pub fn microfrontend() -> Self {
        Self::preset(SchemaPreset::Microfrontend)
    }

    #[must_use]
    pub fn widget() -> Self {
        Self::preset(SchemaPreset::Widget)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    #[must_use]
    pub fn default_for(&self, name: &str) -> Option<bool> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, default)| *default)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, bool)> {
        self.entries.iter().map(|(n, d)| (n.as_str(), *d))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PermissionSchema {
    fn default() -> Self {
        Self::microfrontend()
    }
}
