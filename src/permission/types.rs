use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::error::{Result, StoreError};
use crate::schema::PermissionSchema;

/// A full permission record: one boolean per schema entry, in schema order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRecord {
    values: Vec<(String, bool)>,
}

impl PermissionRecord {
    #[must_use]
    pub fn defaults(schema: &PermissionSchema) -> Self {
        Self {
            values: schema
                .entries()
                .map(|(name, default)| (name.to_string(), default))
                .collect(),
        }
    }

    /// Parses a persisted or broadcast payload over the schema defaults.
    ///
    /// Keys outside the schema are dropped and missing keys keep their
    /// default, so the result is always fully populated. A payload that is
    /// not a flat JSON object, or that carries a non-boolean value for a
    /// known permission, is rejected as a whole.
    pub fn from_json(schema: &PermissionSchema, payload: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| StoreError::MalformedPayload(e.to_string()))?;

        let serde_json::Value::Object(map) = value else {
            return Err(StoreError::MalformedPayload(
                "expected a JSON object".to_string(),
            ));
        };

        let mut record = Self::defaults(schema);
        for (name, value) in &map {
            let Some(slot) = record.slot_mut(name) else {
                tracing::debug!(permission = %name, "Ignoring unrecognized permission");
                continue;
            };
            *slot = value.as_bool().ok_or_else(|| {
                StoreError::MalformedPayload(format!("'{name}' must be a boolean, got {value}"))
            })?;
        }
        Ok(record)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<bool> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    #[must_use]
    pub fn is_granted(&self, name: &str) -> bool {
        self.get(name).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.values.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn granted(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|(_, v)| *v).map(|(n, _)| n)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Applies `patch` field by field. Fails without touching anything if the
    /// patch names a permission this record does not carry.
    pub fn merged(&self, patch: &PermissionPatch) -> Result<Self> {
        if let Some(unknown) = patch.names().find(|name| self.get(name).is_none()) {
            return Err(StoreError::UnknownPermission(unknown.to_string()));
        }

        let mut next = self.clone();
        for (name, value) in patch.iter() {
            if let Some(slot) = next.slot_mut(name) {
                *slot = value;
            }
        }
        Ok(next)
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut bool> {
        self.values
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

impl Serialize for PermissionRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl fmt::Display for PermissionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

/// A partial update. Only the permissions present override the current record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionPatch {
    values: BTreeMap<String, bool>,
}

impl PermissionPatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: bool) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: bool) {
        self.values.insert(name.into(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<bool> {
        self.values.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.values.iter().map(|(n, v)| (n.as_str(), *v))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<&PermissionRecord> for PermissionPatch {
    fn from(record: &PermissionRecord) -> Self {
        Self {
            values: record.iter().map(|(n, v)| (n.to_string(), v)).collect(),
        }
    }
}

impl<S: Into<String>> FromIterator<(S, bool)> for PermissionPatch {
    fn from_iter<I: IntoIterator<Item = (S, bool)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(n, v)| (n.into(), v)).collect(),
        }
    }
}
