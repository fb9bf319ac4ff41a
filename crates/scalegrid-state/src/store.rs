//! StateStore — redb-backed persistence for rules and scaling events.
//!
//! Rules get full CRUD with validation on write. Events are append-only:
//! there is no update or delete path, and the composite key embeds the
//! creation timestamp plus a process-local sequence number so that a
//! prefix scan replays a deployment's history in order.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Orders events appended within the same millisecond.
    event_seq: Arc<AtomicU64>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            event_seq: Arc::new(AtomicU64::new(0)),
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            event_seq: Arc::new(AtomicU64::new(0)),
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RULES).map_err(map_err!(Table))?;
        txn.open_table(EVENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Rules ──────────────────────────────────────────────────────

    /// Insert or update a scaling rule. Validates before any write.
    pub fn put_rule(&self, rule: &ScalingRule) -> StateResult<()> {
        rule.validate()?;
        let value = serde_json::to_vec(rule).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RULES).map_err(map_err!(Table))?;
            table
                .insert(rule.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rule_id = %rule.id, deployment_id = %rule.deployment_id, "rule stored");
        Ok(())
    }

    /// Get a rule by id.
    pub fn get_rule(&self, rule_id: &str) -> StateResult<Option<ScalingRule>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RULES).map_err(map_err!(Table))?;
        match table.get(rule_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let rule: ScalingRule =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(rule))
            }
            None => Ok(None),
        }
    }

    /// List rules, optionally filtered to one deployment.
    ///
    /// Sorted by creation time (ties broken by id) so "the first enabled
    /// rule" is a deterministic governing-rule policy.
    pub fn list_rules(&self, deployment_id: Option<&str>) -> StateResult<Vec<ScalingRule>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RULES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rule: ScalingRule =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if deployment_id.is_none_or(|d| rule.deployment_id == d) {
                results.push(rule);
            }
        }
        results.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(results)
    }

    /// Enable or disable a rule. Returns the updated rule, or `None` if
    /// absent. Idempotent.
    pub fn toggle_rule(&self, rule_id: &str, enabled: bool) -> StateResult<Option<ScalingRule>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(RULES).map_err(map_err!(Table))?;
            let existing = table
                .get(rule_id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            updated = match existing {
                Some(bytes) => {
                    let mut rule: ScalingRule =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    rule.enabled = enabled;
                    let value = serde_json::to_vec(&rule).map_err(map_err!(Serialize))?;
                    table
                        .insert(rule_id, value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(rule)
                }
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if let Some(ref rule) = updated {
            debug!(%rule_id, enabled = rule.enabled, "rule toggled");
        }
        Ok(updated)
    }

    /// Delete a rule by id. Returns true if it existed.
    pub fn delete_rule(&self, rule_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(RULES).map_err(map_err!(Table))?;
            existed = table.remove(rule_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%rule_id, existed, "rule deleted");
        Ok(existed)
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append a scaling event to the log.
    pub fn append_event(&self, event: &ScalingEvent) -> StateResult<()> {
        let seq = self.event_seq.fetch_add(1, Ordering::Relaxed);
        let key = format!(
            "{}:{:013}:{:06}",
            event.deployment_id, event.timestamp, seq
        );
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            event_id = %event.id,
            deployment_id = %event.deployment_id,
            action = ?event.action,
            "event appended"
        );
        Ok(())
    }

    /// List events newest-first, optionally filtered to one deployment,
    /// truncated to `limit`.
    pub fn list_events(
        &self,
        deployment_id: Option<&str>,
        limit: usize,
    ) -> StateResult<Vec<ScalingEvent>> {
        let mut results = self.collect_events(deployment_id)?;
        results.reverse();
        results.truncate(limit);
        Ok(results)
    }

    /// List a deployment's events oldest-first (the full history).
    ///
    /// Used by the cost estimator, which integrates over elapsed time
    /// between consecutive events.
    pub fn event_history(&self, deployment_id: &str) -> StateResult<Vec<ScalingEvent>> {
        self.collect_events(Some(deployment_id))
    }

    /// Timestamp of the newest event recorded for a rule on a deployment.
    ///
    /// All persisted events are actions, so this is exactly the "last
    /// non-no-action event" the cooldown check needs.
    pub fn last_action_time(
        &self,
        deployment_id: &str,
        rule_id: &str,
    ) -> StateResult<Option<u64>> {
        let events = self.collect_events(Some(deployment_id))?;
        Ok(events
            .iter()
            .rev()
            .find(|e| e.rule_id == rule_id)
            .map(|e| e.timestamp))
    }

    /// Collect events oldest-first. Per-deployment order comes straight
    /// from the key encoding; the unfiltered listing is re-sorted by
    /// timestamp since keys group by deployment first.
    fn collect_events(&self, deployment_id: Option<&str>) -> StateResult<Vec<ScalingEvent>> {
        let prefix = deployment_id.map(|d| format!("{d}:"));
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if prefix.as_deref().is_none_or(|p| key.value().starts_with(p)) {
                let event: ScalingEvent =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(event);
            }
        }
        if deployment_id.is_none() {
            results.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }
        Ok(results)
    }
}
