pub mod store;
pub mod subscription;
pub mod types;

pub use store::{PermissionStore, PermissionStoreBuilder};
pub use subscription::{Listener, Subscription};
pub use types::{PermissionPatch, PermissionRecord};
