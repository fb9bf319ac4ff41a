//! redb table definitions.
//!
//! Both tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Event keys embed a zero-padded timestamp and a process-local
//! sequence number so a prefix scan yields events in creation order.

use redb::TableDefinition;

/// Scaling rules keyed by `{rule_id}`.
pub const RULES: TableDefinition<&str, &[u8]> = TableDefinition::new("rules");

/// Scaling events keyed by `{deployment_id}:{timestamp_ms:013}:{seq:06}`.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");
