//! Per-container sequencing and translation of drag gestures into wire
//! messages.

use crate::intents::{IntentKind, IntentLedger};
use crate::store::EntityStore;
use crate::SyncError;
use tripsync_core::protocol::{ReorderPayload, SchedulePayload, WireMsg};
use tripsync_core::{Container, Poi, PoiId};

/// What a move asks the session to do after the store was updated.
#[derive(Debug, Clone, PartialEq)]
pub enum MoveEffect {
    Send(WireMsg),
    /// The record is still unconfirmed; replay once its id is known.
    Defer { temp_id: PoiId, kind: IntentKind },
    /// An earlier deferred schedule no longer applies.
    Cancel { temp_id: PoiId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteReorder {
    pub applied: usize,
    pub unknown: Vec<PoiId>,
}

/// Applies a new visual order to one container. Listed ids that are not in
/// the container are ignored and unlisted members keep their relative order
/// after the listed ones. Returns the message to share, or `None` when the
/// order did not change or only unconfirmed records are involved.
pub fn reorder_local(
    store: &mut EntityStore,
    container: &Container,
    ordered_ids: &[PoiId],
) -> Option<ReorderPayload> {
    let current = store.container_ids(container);
    let mut order: Vec<PoiId> = Vec::with_capacity(current.len());
    for id in ordered_ids {
        if current.contains(id) && !order.contains(id) {
            order.push(id.clone());
        }
    }
    for id in &current {
        if !order.contains(id) {
            order.push(id.clone());
        }
    }
    if order == current {
        return None;
    }

    let updated: Vec<Poi> = order
        .iter()
        .enumerate()
        .filter_map(|(idx, id)| store.get(id).map(|poi| poi.with_sequence(idx as i64)))
        .collect();
    store.upsert_all(updated);
    outbound_order(store, container, &order)
}

/// Applies an order decided elsewhere. Only listed records already in the
/// container are resequenced. A listed record that sits in another container
/// keeps its placement; container changes only arrive as schedule events.
pub fn reorder_remote(
    store: &mut EntityStore,
    ledger: &IntentLedger,
    payload: &ReorderPayload,
) -> RemoteReorder {
    let container = Container::from_plan_day(payload.plan_day_id.as_deref());
    let mut result = RemoteReorder::default();
    let mut updated = Vec::new();

    for (idx, raw_id) in payload.poi_ids.iter().enumerate() {
        let id = ledger.canonical_id(raw_id);
        let Some(poi) = store.get(&id) else {
            result.unknown.push(id);
            continue;
        };
        if !poi.is_in(&container) {
            continue;
        }
        let sequence = idx as i64;
        if poi.sequence != sequence {
            updated.push(poi.with_sequence(sequence));
        }
        result.applied += 1;
    }
    store.upsert_all(updated);
    result
}

/// Moves `id` into `destination` at `index` (clamped to the end).
///
/// Within one container this is a pure reorder. Across containers the
/// record changes container in a single store mutation and the effects are
/// ordered removeSchedule, addSchedule, reorder.
pub fn move_poi(
    store: &mut EntityStore,
    id: &str,
    destination: &Container,
    index: usize,
) -> Result<Vec<MoveEffect>, SyncError> {
    let poi = store
        .get(id)
        .cloned()
        .ok_or_else(|| SyncError::UnknownPoi(id.to_string()))?;
    let source = poi
        .container()
        .ok_or_else(|| SyncError::ReadOnly(id.to_string()))?;

    let mut order = store.container_ids(destination);
    order.retain(|member| member != id);
    order.insert(index.min(order.len()), id.to_string());

    if &source == destination {
        return Ok(reorder_local(store, destination, &order)
            .map(|payload| vec![MoveEffect::Send(WireMsg::Reorder(payload))])
            .unwrap_or_default());
    }

    let updated: Vec<Poi> = order
        .iter()
        .enumerate()
        .filter_map(|(idx, member)| {
            let sequence = idx as i64;
            if member == id {
                Some(poi.placed_in(destination, sequence))
            } else {
                store.get(member).map(|other| other.with_sequence(sequence))
            }
        })
        .collect();
    store.upsert_all(updated);

    let mut effects = Vec::new();
    if poi.is_persisted {
        if let Container::Day(old_day) = &source {
            effects.push(MoveEffect::Send(WireMsg::RemoveSchedule(SchedulePayload {
                poi_id: poi.id.clone(),
                plan_day_id: old_day.clone(),
            })));
        }
        if let Container::Day(new_day) = destination {
            effects.push(MoveEffect::Send(WireMsg::AddSchedule(SchedulePayload {
                poi_id: poi.id.clone(),
                plan_day_id: new_day.clone(),
            })));
        }
    } else {
        effects.push(match destination {
            Container::Day(new_day) => MoveEffect::Defer {
                temp_id: poi.id.clone(),
                kind: IntentKind::Schedule {
                    plan_day_id: new_day.clone(),
                },
            },
            Container::Unscheduled => MoveEffect::Cancel {
                temp_id: poi.id.clone(),
            },
        });
    }
    if let Some(payload) = outbound_order(store, destination, &order) {
        effects.push(MoveEffect::Send(WireMsg::Reorder(payload)));
    }
    Ok(effects)
}

/// The shareable order of a container as it currently renders.
pub fn container_order(store: &EntityStore, container: &Container) -> Option<ReorderPayload> {
    outbound_order(store, container, &store.container_ids(container))
}

fn outbound_order(store: &EntityStore, container: &Container, order: &[PoiId]) -> Option<ReorderPayload> {
    let poi_ids: Vec<PoiId> = order
        .iter()
        .filter(|id| store.get(id).map(|poi| poi.is_persisted).unwrap_or(false))
        .cloned()
        .collect();
    if poi_ids.is_empty() {
        return None;
    }
    Some(ReorderPayload {
        plan_day_id: container.plan_day_id().map(str::to_string),
        poi_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripsync_core::PoiDraft;

    fn day(id: &str) -> Container {
        Container::Day(id.to_string())
    }

    fn persisted(id: &str, container: &Container, sequence: i64) -> Poi {
        let draft = PoiDraft::new(33.0, 126.0, id);
        let mut poi = Poi::draft(id, "ws", "user-1", &draft, container, sequence);
        poi.is_persisted = true;
        poi
    }

    fn ids(list: &[&str]) -> Vec<PoiId> {
        list.iter().map(|id| id.to_string()).collect()
    }

    fn sends(effects: &[MoveEffect]) -> Vec<&'static str> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                MoveEffect::Send(msg) => Some(msg.event_name()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn local_reorder_assigns_index_sequences() {
        let mut store = EntityStore::new();
        for (idx, id) in ["a", "b", "c"].iter().enumerate() {
            store.upsert(persisted(id, &day("d1"), idx as i64 * 10));
        }
        let payload = reorder_local(&mut store, &day("d1"), &ids(&["c", "a", "ghost", "b"]))
            .expect("order changed");
        assert_eq!(payload.poi_ids, ids(&["c", "a", "b"]));
        assert_eq!(payload.plan_day_id.as_deref(), Some("d1"));
        assert_eq!(store.get("c").map(|p| p.sequence), Some(0));
        assert_eq!(store.get("b").map(|p| p.sequence), Some(2));
    }

    #[test]
    fn unchanged_local_order_emits_nothing() {
        let mut store = EntityStore::new();
        store.upsert(persisted("a", &Container::Unscheduled, 0));
        store.upsert(persisted("b", &Container::Unscheduled, 1));
        let revision = store.revision();
        assert!(reorder_local(&mut store, &Container::Unscheduled, &ids(&["a", "b"])).is_none());
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn remote_reorder_leaves_unlisted_records_alone_and_reports_unknown() {
        let mut store = EntityStore::new();
        store.upsert(persisted("a", &day("d1"), 0));
        store.upsert(persisted("b", &day("d1"), 1));
        store.upsert(persisted("c", &day("d1"), 7));
        let ledger = IntentLedger::new();

        let result = reorder_remote(
            &mut store,
            &ledger,
            &ReorderPayload {
                plan_day_id: Some("d1".to_string()),
                poi_ids: ids(&["b", "missing", "a"]),
            },
        );
        assert_eq!(result.applied, 2);
        assert_eq!(result.unknown, ids(&["missing"]));
        assert_eq!(store.get("b").map(|p| p.sequence), Some(0));
        assert_eq!(store.get("a").map(|p| p.sequence), Some(2));
        assert_eq!(store.get("c").map(|p| p.sequence), Some(7));
    }

    #[test]
    fn remote_reorder_keeps_records_of_other_containers_in_place() {
        let mut store = EntityStore::new();
        store.upsert(persisted("a", &day("d1"), 4));
        store.upsert(persisted("x", &day("d2"), 0));
        let revision = store.revision();

        let result = reorder_remote(
            &mut store,
            &IntentLedger::new(),
            &ReorderPayload {
                plan_day_id: Some("d2".to_string()),
                poi_ids: ids(&["a", "x"]),
            },
        );
        assert_eq!(result.applied, 0);
        assert!(result.unknown.is_empty());
        let a = store.get("a").expect("record");
        assert!(a.is_in(&day("d1")));
        assert_eq!(a.sequence, 4);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn remote_reorder_resolves_temp_ids() {
        let mut store = EntityStore::new();
        store.upsert(persisted("a", &day("d1"), 0));
        store.upsert(persisted("b", &day("d1"), 1));
        let mut ledger = IntentLedger::new();
        ledger.mark_resolved("poi-temp-1", "b", chrono::Utc::now());

        let result = reorder_remote(
            &mut store,
            &ledger,
            &ReorderPayload {
                plan_day_id: Some("d1".to_string()),
                poi_ids: ids(&["poi-temp-1", "a"]),
            },
        );
        assert_eq!(result.applied, 2);
        assert_eq!(store.container_ids(&day("d1")), ids(&["b", "a"]));
    }

    #[test]
    fn same_container_move_is_a_pure_reorder() {
        let mut store = EntityStore::new();
        store.upsert(persisted("a", &day("d1"), 0));
        store.upsert(persisted("b", &day("d1"), 1));
        let effects = move_poi(&mut store, "b", &day("d1"), 0).expect("move");
        assert_eq!(sends(&effects), vec!["reorder"]);
        assert_eq!(store.container_ids(&day("d1")), ids(&["b", "a"]));
    }

    #[test]
    fn cross_day_move_removes_before_adding() {
        let mut store = EntityStore::new();
        store.upsert(persisted("a", &day("d1"), 0));
        store.upsert(persisted("x", &day("d2"), 0));
        let effects = move_poi(&mut store, "a", &day("d2"), 99).expect("move");

        assert_eq!(sends(&effects), vec!["removeSchedule", "addSchedule", "reorder"]);
        match &effects[0] {
            MoveEffect::Send(WireMsg::RemoveSchedule(payload)) => {
                assert_eq!(payload.plan_day_id, "d1")
            }
            other => panic!("unexpected effect: {other:?}"),
        }
        assert!(store.container_ids(&day("d1")).is_empty());
        assert_eq!(store.container_ids(&day("d2")), ids(&["x", "a"]));
    }

    #[test]
    fn moving_to_the_pool_only_removes_schedule() {
        let mut store = EntityStore::new();
        store.upsert(persisted("a", &day("d1"), 0));
        let effects = move_poi(&mut store, "a", &Container::Unscheduled, 0).expect("move");
        assert_eq!(sends(&effects), vec!["removeSchedule", "reorder"]);
        let poi = store.get("a").expect("record");
        assert_eq!(poi.plan_day_id, None);
        assert!(poi.is_consistent());
    }

    #[test]
    fn unconfirmed_moves_become_intents_and_hide_temp_ids() {
        let mut store = EntityStore::new();
        let draft = PoiDraft::new(33.0, 126.0, "Pending");
        store.upsert(Poi::draft("poi-temp-1", "ws", "user-1", &draft, &Container::Unscheduled, 0));

        let effects = move_poi(&mut store, "poi-temp-1", &day("d1"), 0).expect("move");
        assert_eq!(
            effects,
            vec![MoveEffect::Defer {
                temp_id: "poi-temp-1".to_string(),
                kind: IntentKind::Schedule {
                    plan_day_id: "d1".to_string()
                },
            }]
        );

        let back = move_poi(&mut store, "poi-temp-1", &Container::Unscheduled, 0).expect("move");
        assert!(matches!(back.as_slice(), [MoveEffect::Cancel { .. }]));
    }

    #[test]
    fn unknown_and_read_only_records_are_rejected() {
        let mut store = EntityStore::new();
        let mut suggested = persisted("r", &Container::Unscheduled, 0);
        suggested.status = tripsync_core::PoiStatus::Recommended;
        store.upsert(suggested);
        assert!(matches!(
            move_poi(&mut store, "nope", &day("d1"), 0),
            Err(SyncError::UnknownPoi(_))
        ));
        assert!(matches!(
            move_poi(&mut store, "r", &day("d1"), 0),
            Err(SyncError::ReadOnly(_))
        ));
    }
}
