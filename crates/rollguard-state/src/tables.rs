//! redb table definitions for the rollguard store.

use redb::TableDefinition;

/// Every key-value pair lives here; values are [`crate::entry`] envelopes.
///
/// Keys are namespaced by their owner, e.g. `circuit/feature-flags`.
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
