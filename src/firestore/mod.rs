pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod settings;
pub mod value;

#[cfg(test)]
pub mod test_support;

pub use core::{FirestoreClient, ListenOptions, ListenSource, ListenerRegistration, Query, ViewSnapshot};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use settings::SyncSettings;
