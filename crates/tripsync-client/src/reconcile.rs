//! Merges server confirmations into the store.
//!
//! Match order: the correlation id the confirmation carries, then a record
//! already stored under the confirmed id, then (only when no correlation id
//! was sent) the first unconfirmed record at the same coordinates. Anything
//! left is another client's creation and is appended.

use crate::intents::{IntentKind, IntentLedger, PendingIntent};
use crate::store::EntityStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};
use tripsync_core::{Container, Poi, PoiId, PoiRecord, PoiStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Correlated,
    Existing,
    Coordinates,
    Appended,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Correlated => "correlated",
            MatchKind::Existing => "existing",
            MatchKind::Coordinates => "coordinates",
            MatchKind::Appended => "appended",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Merged {
        id: PoiId,
        replaced: Option<PoiId>,
        matched_by: MatchKind,
        /// Deferred work that must now be sent under `id`.
        replay: Option<PendingIntent>,
    },
    Duplicate {
        id: PoiId,
    },
    Rejected {
        id: PoiId,
        reason: &'static str,
    },
}

#[derive(Debug)]
pub struct Reconciler {
    tolerance: f64,
    applied: HashMap<PoiId, PoiRecord>,
}

impl Reconciler {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            applied: HashMap::new(),
        }
    }

    pub fn reconcile(
        &mut self,
        store: &mut EntityStore,
        ledger: &mut IntentLedger,
        confirmed: PoiRecord,
        workspace_id: &str,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        if self.applied.get(&confirmed.id) == Some(&confirmed) {
            debug!(event = "confirmation_duplicate", poi_id = %confirmed.id);
            return ReconcileOutcome::Duplicate { id: confirmed.id };
        }

        let outcome = match self.find_local(store, &confirmed) {
            Some((local_id, matched_by)) => {
                merge_into_local(store, ledger, &confirmed, &local_id, matched_by, now)
            }
            None => append_remote(store, ledger, &confirmed, workspace_id, now),
        };
        if let ReconcileOutcome::Merged { .. } = outcome {
            self.applied.insert(confirmed.id.clone(), confirmed);
        }
        outcome
    }

    /// Drops the remembered confirmation for a record that no longer exists.
    pub fn forget(&mut self, id: &str) {
        self.applied.remove(id);
    }

    /// Keeps remembered confirmations only for records still in `store`.
    pub fn retain_known(&mut self, store: &EntityStore) {
        self.applied.retain(|id, _| store.contains(id));
    }

    pub fn applied_len(&self) -> usize {
        self.applied.len()
    }

    fn find_local(&self, store: &EntityStore, confirmed: &PoiRecord) -> Option<(PoiId, MatchKind)> {
        if let Some(temp_id) = confirmed.temp_id.as_deref() {
            if store.contains(temp_id) {
                return Some((temp_id.to_string(), MatchKind::Correlated));
            }
        }
        if store.contains(&confirmed.id) {
            return Some((confirmed.id.clone(), MatchKind::Existing));
        }
        if confirmed.temp_id.is_some() {
            return None;
        }
        let (latitude, longitude) = confirmed.geometry()?;
        store
            .find_unpersisted_near(latitude, longitude, self.tolerance)
            .map(|poi| (poi.id.clone(), MatchKind::Coordinates))
    }
}

fn merge_into_local(
    store: &mut EntityStore,
    ledger: &mut IntentLedger,
    confirmed: &PoiRecord,
    local_id: &str,
    matched_by: MatchKind,
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    let Some(local) = store.get(local_id).cloned() else {
        return ReconcileOutcome::Rejected {
            id: confirmed.id.clone(),
            reason: "matched record vanished",
        };
    };
    let intent = ledger.take(local_id).or_else(|| {
        confirmed
            .temp_id
            .as_deref()
            .and_then(|temp_id| ledger.take(temp_id))
    });

    let mut merged = Poi {
        id: confirmed.id.clone(),
        place_id: confirmed.place_id.clone().or(local.place_id.clone()),
        address: confirmed.address.clone().unwrap_or(local.address.clone()),
        place_name: confirmed.place_name.clone().or(local.place_name.clone()),
        category_name: confirmed
            .category_name
            .clone()
            .or(local.category_name.clone()),
        distance: confirmed.distance.or(local.distance),
        duration: confirmed.duration.or(local.duration),
        is_persisted: true,
        ..local.clone()
    };
    if merged.workspace_id.is_empty() {
        merged.workspace_id = confirmed.workspace_id.clone().unwrap_or_default();
    }
    if merged.created_by.is_empty() {
        merged.created_by = confirmed.created_by.clone().unwrap_or_default();
    }
    match confirmed.geometry() {
        Some((latitude, longitude)) => {
            merged.latitude = latitude;
            merged.longitude = longitude;
        }
        None => warn!(
            event = "confirmation_geometry_missing",
            poi_id = %confirmed.id,
            "keeping local geometry"
        ),
    }

    merged = match &intent {
        Some(intent) => apply_intent(store, &merged, intent),
        None => take_server_placement(store, &local, merged, confirmed),
    };

    if local_id != confirmed.id {
        ledger.mark_resolved(local_id, &confirmed.id, now);
    }
    if let Some(temp_id) = confirmed.temp_id.as_deref() {
        if temp_id != confirmed.id && ledger.resolved(temp_id).is_none() {
            ledger.mark_resolved(temp_id, &confirmed.id, now);
        }
    }
    store.replace(local_id, merged);

    ReconcileOutcome::Merged {
        id: confirmed.id.clone(),
        replaced: (local_id != confirmed.id).then(|| local_id.to_string()),
        matched_by,
        replay: intent,
    }
}

fn append_remote(
    store: &mut EntityStore,
    ledger: &mut IntentLedger,
    confirmed: &PoiRecord,
    workspace_id: &str,
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    if confirmed.placement().0 == PoiStatus::Unmarked {
        return ReconcileOutcome::Rejected {
            id: confirmed.id.clone(),
            reason: "confirmation for an unmarked poi",
        };
    }
    let Some(mut poi) = confirmed.clone().into_poi(workspace_id) else {
        return ReconcileOutcome::Rejected {
            id: confirmed.id.clone(),
            reason: "missing geometry",
        };
    };
    // Our own creation whose optimistic record a snapshot already wiped.
    let intent = confirmed
        .temp_id
        .as_deref()
        .and_then(|temp_id| ledger.take(temp_id));
    if let Some(intent) = &intent {
        ledger.mark_resolved(&intent.temp_id, &poi.id, now);
        poi = apply_intent(store, &poi, intent);
    } else if confirmed.sequence.is_none() {
        if let Some(container) = poi.container() {
            poi.sequence = store.next_sequence(&container);
        }
    }
    store.upsert(poi);

    ReconcileOutcome::Merged {
        id: confirmed.id.clone(),
        replaced: None,
        matched_by: MatchKind::Appended,
        replay: intent,
    }
}

/// Placement a record must show once `intent` is replayed.
fn apply_intent(store: &EntityStore, poi: &Poi, intent: &PendingIntent) -> Poi {
    match &intent.kind {
        IntentKind::Schedule { plan_day_id } => {
            let day = Container::Day(plan_day_id.clone());
            if poi.is_in(&day) {
                poi.clone()
            } else {
                poi.placed_in(&day, store.next_sequence(&day))
            }
        }
        IntentKind::Unmark => Poi {
            status: PoiStatus::Unmarked,
            plan_day_id: None,
            ..poi.clone()
        },
    }
}

fn take_server_placement(store: &EntityStore, local: &Poi, merged: Poi, confirmed: &PoiRecord) -> Poi {
    let (status, plan_day_id) = confirmed.placement();
    let target = Poi {
        status,
        plan_day_id,
        ..merged
    };
    let sequence = match (confirmed.sequence, target.container()) {
        (Some(sequence), _) => sequence,
        (None, Some(container)) if local.is_in(&container) => local.sequence,
        (None, Some(container)) => store.next_sequence(&container),
        (None, None) => local.sequence,
    };
    target.with_sequence(sequence)
}
