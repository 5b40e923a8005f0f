//! Side-table of work deferred until a temporary id is confirmed.
//!
//! Intents live in arena slots addressed through an id index. Slots are
//! reused after an intent resolves or expires.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tripsync_core::PoiId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentKind {
    Schedule { plan_day_id: String },
    Unmark,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIntent {
    pub temp_id: PoiId,
    pub kind: IntentKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct IntentLedger {
    slots: Vec<Option<PendingIntent>>,
    free: Vec<usize>,
    index: HashMap<PoiId, usize>,
    resolved: HashMap<PoiId, (PoiId, DateTime<Utc>)>,
}

impl IntentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Records the intent for `temp_id`, replacing any earlier one.
    pub fn record(&mut self, temp_id: &str, kind: IntentKind, now: DateTime<Utc>) {
        let intent = PendingIntent {
            temp_id: temp_id.to_string(),
            kind,
            created_at: now,
        };
        if let Some(&slot) = self.index.get(temp_id) {
            self.slots[slot] = Some(intent);
            return;
        }
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(intent);
                slot
            }
            None => {
                self.slots.push(Some(intent));
                self.slots.len() - 1
            }
        };
        self.index.insert(temp_id.to_string(), slot);
    }

    pub fn get(&self, temp_id: &str) -> Option<&PendingIntent> {
        let slot = *self.index.get(temp_id)?;
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn contains(&self, temp_id: &str) -> bool {
        self.index.contains_key(temp_id)
    }

    pub fn take(&mut self, temp_id: &str) -> Option<PendingIntent> {
        let slot = self.index.remove(temp_id)?;
        self.free.push(slot);
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub fn purge_expired(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<PendingIntent> {
        let expired: Vec<PoiId> = self
            .slots
            .iter()
            .flatten()
            .filter(|intent| now - intent.created_at >= ttl)
            .map(|intent| intent.temp_id.clone())
            .collect();
        expired.iter().filter_map(|id| self.take(id)).collect()
    }

    pub fn mark_resolved(&mut self, temp_id: &str, permanent_id: &str, now: DateTime<Utc>) {
        self.resolved
            .insert(temp_id.to_string(), (permanent_id.to_string(), now));
    }

    pub fn resolved(&self, temp_id: &str) -> Option<&str> {
        self.resolved.get(temp_id).map(|(id, _)| id.as_str())
    }

    pub fn resolved_len(&self) -> usize {
        self.resolved.len()
    }

    /// Forgets `temp → permanent` pairs older than `ttl`. Returns how many
    /// were dropped.
    pub fn purge_resolved(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let before = self.resolved.len();
        self.resolved
            .retain(|_, (_, resolved_at)| now - *resolved_at < ttl);
        before - self.resolved.len()
    }

    /// The id callers should use now: a resolved temporary id maps to its
    /// permanent id, anything else is returned unchanged.
    pub fn canonical_id(&self, id: &str) -> PoiId {
        self.resolved(id).unwrap_or(id).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_792_310_400 + offset_secs, 0)
            .single()
            .expect("valid timestamp")
    }

    fn schedule(day: &str) -> IntentKind {
        IntentKind::Schedule {
            plan_day_id: day.to_string(),
        }
    }

    #[test]
    fn later_intent_replaces_earlier_for_same_temp_id() {
        let mut ledger = IntentLedger::new();
        ledger.record("poi-temp-1", schedule("day-1"), ts(0));
        ledger.record("poi-temp-1", IntentKind::Unmark, ts(1));
        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.get("poi-temp-1").map(|i| &i.kind),
            Some(&IntentKind::Unmark)
        );
    }

    #[test]
    fn slots_are_reused_after_take() {
        let mut ledger = IntentLedger::new();
        ledger.record("poi-temp-1", schedule("day-1"), ts(0));
        let taken = ledger.take("poi-temp-1").expect("intent present");
        assert_eq!(taken.kind, schedule("day-1"));
        assert!(ledger.take("poi-temp-1").is_none());

        ledger.record("poi-temp-2", schedule("day-2"), ts(1));
        assert_eq!(ledger.slots.len(), 1);
        assert!(ledger.contains("poi-temp-2"));
    }

    #[test]
    fn purge_drops_only_expired_intents() {
        let mut ledger = IntentLedger::new();
        ledger.record("old", schedule("day-1"), ts(0));
        ledger.record("fresh", schedule("day-1"), ts(100));

        let expired = ledger.purge_expired(ts(120), Duration::seconds(120));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].temp_id, "old");
        assert!(ledger.contains("fresh"));
        assert!(!ledger.contains("old"));
    }

    #[test]
    fn resolved_ids_translate_to_permanent_ids() {
        let mut ledger = IntentLedger::new();
        ledger.mark_resolved("poi-temp-1", "srv-42", ts(0));
        assert_eq!(ledger.canonical_id("poi-temp-1"), "srv-42");
        assert_eq!(ledger.canonical_id("srv-7"), "srv-7");
    }

    #[test]
    fn resolved_pairs_are_forgotten_after_ttl() {
        let mut ledger = IntentLedger::new();
        ledger.mark_resolved("poi-temp-1", "srv-1", ts(0));
        ledger.mark_resolved("poi-temp-2", "srv-2", ts(90));

        assert_eq!(ledger.purge_resolved(ts(120), Duration::seconds(120)), 1);
        assert_eq!(ledger.resolved_len(), 1);
        assert_eq!(ledger.canonical_id("poi-temp-1"), "poi-temp-1");
        assert_eq!(ledger.canonical_id("poi-temp-2"), "srv-2");
    }
}
