//! rollguard-state: the shared key-value store.
//!
//! Circuit breakers persist their state here so that every caller, and
//! every restart of the daemon, observes the same circuit. Two backends
//! implement [`KvStore`]:
//!
//! - [`RedbStore`]: [redb](https://docs.rs/redb) file (or in-memory
//!   backend for tests). Compare-and-swap runs inside a single write
//!   transaction; redb serializes writers, so the swap is atomic.
//! - [`MemoryStore`]: `Mutex<HashMap>` for tests and single-process use.
//!
//! Values are opaque bytes with an optional TTL. Expired entries read as
//! absent and are overwritten by the next write.

pub mod entry;
pub mod error;
pub mod memory;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use memory::MemoryStore;
pub use store::{KvStore, RedbStore};
