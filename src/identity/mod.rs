//! Identity persistence
//!
//! Maps each (user, proxy) pair to a stable device identifier and each user to
//! the last session token the server issued. Records live behind the
//! [`KeyValueStore`] trait so the backend can be swapped:
//!
//! - **File**: one small text file per record under a data directory
//! - **Memory**: `DashMap` backed, for tests and embedding

pub mod file;
pub mod memory;
pub mod store;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{Identity, IdentityKey, IdentityStore, KeyValueStore};
