// Storage: destination bucket bindings and the manifest store

pub mod binding;
pub mod manifest_store;

pub use binding::{bind_access, plan_bindings, resolve_bucket, OBJECT_STORAGE_SCHEME};
pub use manifest_store::ManifestStore;
