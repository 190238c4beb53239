use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::storage::{PersistenceBackend, StorageEvent, StorageHandler};
use super::{HandlerId, HandlerList};
use crate::core::error::{Result, StoreError};
use crate::schema::SCHEMA_VERSION;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StorageFile {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

impl StorageFile {
    fn empty() -> Self {
        Self {
            version: SCHEMA_VERSION,
            updated_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }
}

/// Key/value storage in a single JSON file, shared by every process that
/// opens the same path.
///
/// Writes go to a uniquely named temporary file in the same directory that is
/// then renamed over the target, so concurrent writers from separate
/// processes never observe a partial file. Each write re-reads the file
/// first; writers racing on *different* keys follow last-write-wins at file
/// granularity. Changes made by other processes are
/// picked up by [`FileStorage::poll_changes`], which fires the registered
/// handlers once per changed key.
pub struct FileStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
    last_seen: Mutex<BTreeMap<String, String>>,
    handlers: RwLock<HandlerList<StorageHandler>>,
}

impl FileStorage {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        let last_seen = match Self::load(&path) {
            Ok(file) => file.entries,
            Err(e) => {
                tracing::warn!(path = %path.display(), "Ignoring unreadable storage file: {}", e);
                BTreeMap::new()
            }
        };

        Self {
            path,
            write_lock: Mutex::new(()),
            last_seen: Mutex::new(last_seen),
            handlers: RwLock::new(HandlerList::new()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Compares the file against the last state this handle observed and
    /// notifies handlers about every key another process changed.
    pub fn poll_changes(&self) -> Result<usize> {
        let current = Self::load(&self.path)?.entries;

        let events: Vec<StorageEvent> = {
            let mut last_seen = self.last_seen.lock();
            let mut events = Vec::new();

            for (key, value) in &current {
                if last_seen.get(key) != Some(value) {
                    events.push(StorageEvent {
                        key: key.clone(),
                        old_value: last_seen.get(key).cloned(),
                        new_value: Some(value.clone()),
                    });
                }
            }
            for (key, value) in last_seen.iter() {
                if !current.contains_key(key) {
                    events.push(StorageEvent {
                        key: key.clone(),
                        old_value: Some(value.clone()),
                        new_value: None,
                    });
                }
            }

            *last_seen = current;
            events
        };

        if events.is_empty() {
            return Ok(0);
        }

        let handlers = self.handlers.read().snapshot();
        for event in &events {
            tracing::debug!(key = %event.key, "Storage entry changed externally");
            for handler in &handlers {
                handler(event);
            }
        }
        Ok(events.len())
    }

    fn load(path: &Path) -> Result<StorageFile> {
        if !path.exists() {
            return Ok(StorageFile::empty());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| StoreError::PersistenceRead(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| StoreError::PersistenceRead(format!("{}: {e}", path.display())))
    }

    fn atomic_write(&self, file: &StorageFile) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let content = serde_json::to_string_pretty(file)?;

        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(content.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| e.error)?;

        Ok(())
    }
}

impl PersistenceBackend for FileStorage {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(Self::load(&self.path)?.entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let _lock = self.write_lock.lock();

        let mut file = Self::load(&self.path).unwrap_or_else(|e| {
            tracing::warn!("Replacing unreadable storage file: {}", e);
            StorageFile::empty()
        });
        file.entries.insert(key.to_string(), value.to_string());
        file.version = SCHEMA_VERSION;
        file.updated_at = Utc::now();

        self.atomic_write(&file)
            .map_err(|e| StoreError::PersistenceWrite(e.to_string()))?;

        self.last_seen
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn on_change(&self, handler: StorageHandler) -> HandlerId {
        self.handlers.write().add(handler)
    }

    fn remove_handler(&self, id: HandlerId) {
        self.handlers.write().remove(id);
    }
}
