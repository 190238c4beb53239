//! Observable permission state shared by independently loaded bundles.
//!
//! A [`PermissionStore`] owns one [`PermissionRecord`]. Updates are merged as
//! patches, mirrored to a [`PersistenceBackend`], delivered to subscribers
//! and broadcast over a [`Broadcaster`] so that every other store in the same
//! document converges. Stores in other contexts converge through the storage
//! change notifications of the shared backend.

pub mod cli;
pub mod config;
pub mod core;
pub mod logging;
pub mod permission;
pub mod schema;
pub mod sync;

pub use crate::core::{Result, StoreError};
pub use permission::{PermissionPatch, PermissionRecord, PermissionStore, Subscription};
pub use schema::{PermissionSchema, SchemaPreset};
pub use sync::{
    Broadcaster, DocumentBus, FileStorage, HandlerId, PersistenceBackend, SharedStorage,
    StorageContext,
};
