//! berth-state — persistence for the Berth scheduling core.
//!
//! A versioned key-value store over redb plus the read/write-through
//! repository in front of it:
//!
//! - `PersistentStore`: entities addressed by `(kind, path, version)`,
//!   JSON blobs, read-after-write per key, no cross-key atomicity
//! - `GroupRepository`: the root application tree with a cached,
//!   revertable current value guaranteeing read-after-write for the root

pub mod error;
pub mod repository;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use repository::{GroupRepository, PreStoreHook};
pub use store::{EntityKind, PersistentStore, StoredGroup};
