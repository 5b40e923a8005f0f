//! One client's view of one workspace.
//!
//! `SyncSession` owns every piece of client state and is driven from a single
//! task: local actions, inbound messages and ticks each run to completion.
//! Messages to send pile up in an outbound queue that the channel drains.

use crate::config::SyncConfig;
use crate::intents::{IntentKind, IntentLedger, PendingIntent};
use crate::ordering::{self, MoveEffect};
use crate::presence::PresenceRelay;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::recovery::{DegradedReason, RecoveryAction, RecoveryController, SyncPhase};
use crate::routes::RouteTable;
use crate::store::EntityStore;
use crate::SyncError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use tripsync_core::protocol::{
    FocusPayload, MapBounds, MarkPayload, PoiConnection, PoiDisconnection, PoiRefPayload,
    SchedulePayload, SnapshotPayload, WireEnvelope, WireMsg, WorkspacePayload,
};
use tripsync_core::recommend::{interpret_tool_call, RecommendedPlace, ToolCall, ToolOutcome};
use tripsync_core::{
    new_temp_id, valid_geometry, Container, Identity, Poi, PoiDraft, PoiId, PoiRecord, PoiStatus,
};

/// User-visible signals for the embedding UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Degraded(DegradedReason),
    Recovered,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecommendationReport {
    pub added: Vec<PoiId>,
    /// Titles already in the plan.
    pub skipped: Vec<String>,
    /// Titles whose coordinates are unusable.
    pub invalid: Vec<String>,
    pub message: Option<String>,
}

impl RecommendationReport {
    pub fn success(&self) -> bool {
        !self.added.is_empty()
    }
}

#[derive(Debug)]
pub struct SyncSession {
    config: SyncConfig,
    workspace_id: String,
    identity: Option<Identity>,
    plan_days: Vec<String>,
    store: EntityStore,
    routes: RouteTable,
    ledger: IntentLedger,
    reconciler: Reconciler,
    presence: PresenceRelay,
    recovery: RecoveryController,
    connected: bool,
    outbound: Vec<WireMsg>,
    notices: Vec<Notice>,
    focused_places: Vec<Value>,
    recommendations: Vec<RecommendedPlace>,
}

impl SyncSession {
    pub fn new(workspace_id: impl Into<String>, identity: Option<Identity>, config: SyncConfig) -> Self {
        let mut presence = PresenceRelay::new(&config);
        presence.set_local_user(identity.as_ref().map(|id| id.user_id.clone()));
        Self {
            reconciler: Reconciler::new(config.coordinate_tolerance_deg),
            recovery: RecoveryController::new(&config),
            presence,
            config,
            workspace_id: workspace_id.into(),
            identity,
            plan_days: Vec::new(),
            store: EntityStore::new(),
            routes: RouteTable::new(),
            ledger: IntentLedger::new(),
            connected: false,
            outbound: Vec::new(),
            notices: Vec::new(),
            focused_places: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn set_identity(&mut self, identity: Option<Identity>) {
        self.presence
            .set_local_user(identity.as_ref().map(|id| id.user_id.clone()));
        self.identity = identity;
    }

    /// The day containers that exist in the plan. An empty list accepts any
    /// day id.
    pub fn set_plan_days(&mut self, plan_days: Vec<String>) {
        self.plan_days = plan_days;
    }

    pub fn plan_days(&self) -> &[String] {
        &self.plan_days
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn ledger(&self) -> &IntentLedger {
        &self.ledger
    }

    pub fn presence(&self) -> &PresenceRelay {
        &self.presence
    }

    pub fn phase(&self) -> SyncPhase {
        self.recovery.phase()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_degraded(&self) -> bool {
        self.recovery.is_degraded()
    }

    pub fn focused_places(&self) -> &[Value] {
        &self.focused_places
    }

    pub fn recommendations(&self) -> &[RecommendedPlace] {
        &self.recommendations
    }

    pub fn drain_outbound(&mut self) -> Vec<WireMsg> {
        std::mem::take(&mut self.outbound)
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    // ----- connection lifecycle -----

    pub fn on_connected(&mut self, now: DateTime<Utc>) {
        self.connected = true;
        self.recovery.on_connect(now);
        self.presence.clear_remote();
        info!(event = "workspace_join", workspace_id = %self.workspace_id);
        self.emit(WireMsg::Join(self.workspace_payload()));
    }

    pub fn on_disconnected(&mut self) {
        self.connected = false;
        self.recovery.on_disconnect();
        let dropped = self.outbound.len();
        self.outbound.clear();
        warn!(
            event = "workspace_disconnected",
            workspace_id = %self.workspace_id,
            dropped
        );
    }

    /// Sends `leave` while the channel is still up.
    pub fn leave(&mut self) {
        info!(event = "workspace_leave", workspace_id = %self.workspace_id);
        self.emit(WireMsg::Leave(self.workspace_payload()));
    }

    // ----- local actions -----

    /// Marks a place into the unscheduled pool. Returns the temporary id.
    pub fn mark(&mut self, draft: PoiDraft) -> Result<PoiId, SyncError> {
        let identity = self.require_identity()?;
        self.mark_into(&identity, draft, &Container::Unscheduled)
    }

    /// Marks a place and schedules it on `plan_day_id` as soon as the
    /// creation is confirmed.
    pub fn mark_and_schedule(
        &mut self,
        draft: PoiDraft,
        plan_day_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PoiId, SyncError> {
        let identity = self.require_identity()?;
        let day = self.require_day(plan_day_id)?;
        let temp_id = self.mark_into(&identity, draft, &day)?;
        self.ledger.record(
            &temp_id,
            IntentKind::Schedule {
                plan_day_id: plan_day_id.to_string(),
            },
            now,
        );
        Ok(temp_id)
    }

    pub fn unmark(&mut self, id: &str, now: DateTime<Utc>) -> Result<(), SyncError> {
        self.require_identity()?;
        let id = self.ledger.canonical_id(id);
        let poi = self
            .store
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownPoi(id.clone()))?;
        if poi.status == PoiStatus::Recommended {
            return Err(SyncError::ReadOnly(id));
        }
        if poi.status == PoiStatus::Unmarked {
            return Ok(());
        }
        self.store.upsert(Poi {
            status: PoiStatus::Unmarked,
            plan_day_id: None,
            ..poi.clone()
        });
        if poi.is_persisted {
            self.emit(WireMsg::Unmark(PoiRefPayload { poi_id: id }));
        } else {
            self.ledger.record(&id, IntentKind::Unmark, now);
        }
        Ok(())
    }

    pub fn move_poi(
        &mut self,
        id: &str,
        destination: &Container,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.require_identity()?;
        if let Container::Day(day) = destination {
            self.require_day(day)?;
        }
        let id = self.ledger.canonical_id(id);
        let effects = ordering::move_poi(&mut self.store, &id, destination, index)?;
        debug!(
            event = "poi_moved",
            poi_id = %id,
            destination = %destination,
            effects = effects.len()
        );
        for effect in effects {
            match effect {
                MoveEffect::Send(msg) => self.emit(msg),
                MoveEffect::Defer { temp_id, kind } => self.ledger.record(&temp_id, kind, now),
                MoveEffect::Cancel { temp_id } => {
                    self.ledger.take(&temp_id);
                }
            }
        }
        Ok(())
    }

    pub fn schedule(&mut self, id: &str, plan_day_id: &str, now: DateTime<Utc>) -> Result<(), SyncError> {
        self.move_poi(id, &Container::Day(plan_day_id.to_string()), usize::MAX, now)
    }

    pub fn unschedule(&mut self, id: &str, now: DateTime<Utc>) -> Result<(), SyncError> {
        self.move_poi(id, &Container::Unscheduled, usize::MAX, now)
    }

    /// Applies a new visual order to one container, e.g. after route
    /// optimisation. An unchanged order sends nothing.
    pub fn reorder(&mut self, container: &Container, ordered_ids: &[PoiId]) -> Result<(), SyncError> {
        self.require_identity()?;
        if let Container::Day(day) = container {
            self.require_day(day)?;
        }
        let ordered: Vec<PoiId> = ordered_ids
            .iter()
            .map(|id| self.ledger.canonical_id(id))
            .collect();
        if let Some(payload) = ordering::reorder_local(&mut self.store, container, &ordered) {
            self.emit(WireMsg::Reorder(payload));
        }
        Ok(())
    }

    /// Asks the server for a fresh authoritative snapshot.
    pub fn flush(&mut self) -> Result<(), SyncError> {
        self.require_identity()?;
        info!(event = "flush_requested", workspace_id = %self.workspace_id);
        self.emit(WireMsg::Flush(self.workspace_payload()));
        Ok(())
    }

    /// Records a route segment between two confirmed POIs of one day.
    pub fn connect_pois(
        &mut self,
        prev_id: &str,
        next_id: &str,
        plan_day_id: &str,
        distance: Option<f64>,
        duration: Option<f64>,
    ) -> Result<(), SyncError> {
        self.require_identity()?;
        self.require_day(plan_day_id)?;
        let prev_poi_id = self.require_confirmed(prev_id)?;
        let next_poi_id = self.require_confirmed(next_id)?;
        self.emit(WireMsg::PoiConnect(PoiConnection {
            id: None,
            prev_poi_id,
            next_poi_id,
            plan_day_id: plan_day_id.to_string(),
            distance,
            duration,
        }));
        Ok(())
    }

    /// Removes the route segment between two confirmed POIs of one day.
    pub fn disconnect_pois(&mut self, prev_id: &str, next_id: &str, plan_day_id: &str) -> Result<(), SyncError> {
        self.require_identity()?;
        self.require_day(plan_day_id)?;
        let prev_poi_id = self.require_confirmed(prev_id)?;
        let next_poi_id = self.require_confirmed(next_id)?;
        self.emit(WireMsg::PoiDisconnect(PoiDisconnection {
            id: None,
            prev_poi_id,
            next_poi_id,
            plan_day_id: plan_day_id.to_string(),
        }));
        Ok(())
    }

    /// Keeps the places of a recommendation tool call for display. Text
    /// output is returned as a chat message.
    pub fn apply_tool_call(&mut self, call: &ToolCall) -> ToolOutcome {
        let outcome = interpret_tool_call(call);
        if let ToolOutcome::Places(places) = &outcome {
            info!(
                event = "recommendations_received",
                tool = %call.tool_name,
                count = places.len()
            );
            self.recommendations = places.clone();
        }
        outcome
    }

    /// Marks every recommended place onto `plan_day_id`, skipping places the
    /// plan already holds.
    pub fn add_recommended_to_day(
        &mut self,
        plan_day_id: &str,
        places: &[RecommendedPlace],
        now: DateTime<Utc>,
    ) -> Result<RecommendationReport, SyncError> {
        self.require_identity()?;
        self.require_day(plan_day_id)?;
        let mut report = RecommendationReport::default();
        for place in places {
            if self.in_plan(place) {
                report.skipped.push(place.title.clone());
                continue;
            }
            match self.mark_and_schedule(place.to_draft(), plan_day_id, now) {
                Ok(temp_id) => report.added.push(temp_id),
                Err(SyncError::InvalidGeometry { .. }) => report.invalid.push(place.title.clone()),
                Err(err) => return Err(err),
            }
        }
        let mut notes = Vec::new();
        match (report.added.len(), report.skipped.len(), report.invalid.len()) {
            (0, skipped, 0) if skipped > 0 => {
                notes.push("The selected places are already in the plan.".to_string())
            }
            (_, skipped, invalid) => {
                if skipped > 0 {
                    notes.push(format!("{skipped} place(s) already in the plan were skipped."));
                }
                if invalid > 0 {
                    notes.push(format!("{invalid} place(s) without a valid location were skipped."));
                }
            }
        }
        report.message = (!notes.is_empty()).then(|| notes.join(" "));
        Ok(report)
    }

    pub fn focus_place(&mut self, bounds: MapBounds) -> Result<(), SyncError> {
        let identity = self.require_identity()?;
        self.emit(WireMsg::PlaceFocus(FocusPayload {
            bounds,
            user_id: identity.user_id,
        }));
        Ok(())
    }

    pub fn move_cursor(&mut self, latitude: f64, longitude: f64, now: DateTime<Utc>) -> Result<(), SyncError> {
        let identity = self.require_identity()?;
        if let Some(msg) = self
            .presence
            .move_cursor(&identity, latitude, longitude, self.connected, now)
        {
            self.emit(msg);
        }
        Ok(())
    }

    pub fn hover_poi(&mut self, poi_id: Option<&str>) -> Result<(), SyncError> {
        let identity = self.require_identity()?;
        let poi_id = poi_id.map(|id| self.ledger.canonical_id(id));
        if let Some(msg) = self.presence.hover(&identity, poi_id, self.connected) {
            self.emit(msg);
        }
        Ok(())
    }

    pub fn click_map(&mut self, latitude: f64, longitude: f64, now: DateTime<Utc>) -> Result<(), SyncError> {
        let identity = self.require_identity()?;
        if let Some(msg) = self
            .presence
            .click(&identity, latitude, longitude, self.connected, now)
        {
            self.emit(msg);
        }
        Ok(())
    }

    // ----- inbound -----

    pub fn handle_envelope(&mut self, envelope: WireEnvelope, now: DateTime<Utc>) {
        if !envelope.workspace_id.is_empty() && envelope.workspace_id != self.workspace_id {
            debug!(
                event = "foreign_workspace_frame",
                workspace_id = %envelope.workspace_id,
                kind = envelope.msg.event_name()
            );
            return;
        }
        self.handle_message(envelope.msg, now);
    }

    pub fn handle_message(&mut self, msg: WireMsg, now: DateTime<Utc>) {
        match msg {
            WireMsg::Joined(payload) => {
                info!(event = "workspace_joined", workspace_id = %payload.workspace_id);
            }
            WireMsg::Left(payload) => {
                info!(event = "workspace_left", workspace_id = %payload.workspace_id);
            }
            WireMsg::Sync(snapshot) | WireMsg::Flushed(snapshot) => self.apply_snapshot(snapshot, now),
            WireMsg::Marked(record) => self.apply_confirmation(record, now),
            WireMsg::Unmarked(payload) => self.apply_unmarked(&payload.poi_id, now),
            WireMsg::AddSchedule(payload) => self.apply_remote_schedule(&payload, true, now),
            WireMsg::RemoveSchedule(payload) => self.apply_remote_schedule(&payload, false, now),
            WireMsg::Reorder(payload) => {
                let result = ordering::reorder_remote(&mut self.store, &self.ledger, &payload);
                debug!(
                    event = "remote_reorder",
                    plan_day_id = ?payload.plan_day_id,
                    applied = result.applied,
                    unknown = result.unknown.len()
                );
                if !result.unknown.is_empty() {
                    self.anomaly(now, "reorder", &result.unknown.join(","));
                }
            }
            WireMsg::Connected(connection) => self.apply_connection(connection, now),
            WireMsg::Disconnected(segment) => self.apply_disconnection(&segment),
            WireMsg::PlaceFocused(payload) => {
                let own = self.identity.as_ref().map(|id| id.user_id.as_str());
                if payload.user_id.is_none() || payload.user_id.as_deref() == own {
                    self.focused_places = payload.places;
                }
            }
            msg @ (WireMsg::CursorMoved(_) | WireMsg::PoiHovered(_) | WireMsg::MapClicked(_)) => {
                self.presence.apply(&msg, &self.store, now);
            }
            other => {
                debug!(event = "inbound_ignored", kind = other.event_name());
            }
        }
    }

    /// Periodic housekeeping: intent expiry, presence expiry and recovery
    /// deadlines.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        for intent in self.ledger.purge_expired(now, self.config.intent_ttl) {
            warn!(
                event = "intent_expired",
                temp_id = %intent.temp_id,
                kind = ?intent.kind
            );
            let orphaned = self
                .store
                .get(&intent.temp_id)
                .is_some_and(|poi| !poi.is_persisted && poi.status == PoiStatus::Unmarked);
            if orphaned {
                self.store.remove(&intent.temp_id);
            }
        }
        let forgotten = self.ledger.purge_resolved(now, self.config.intent_ttl);
        if forgotten > 0 {
            debug!(event = "resolved_ids_purged", count = forgotten);
        }
        self.presence.sweep(now, &self.store);
        let actions = self.recovery.poll(now);
        self.apply_recovery(actions);
    }

    // ----- internals -----

    fn emit(&mut self, msg: WireMsg) {
        if !self.connected {
            if !msg.is_presence() {
                debug!(event = "outbound_dropped", kind = msg.event_name());
            }
            return;
        }
        self.outbound.push(msg);
    }

    fn workspace_payload(&self) -> WorkspacePayload {
        WorkspacePayload {
            workspace_id: self.workspace_id.clone(),
        }
    }

    fn require_identity(&self) -> Result<Identity, SyncError> {
        self.identity.clone().ok_or(SyncError::MissingIdentity)
    }

    fn require_day(&self, plan_day_id: &str) -> Result<Container, SyncError> {
        if !self.plan_days.is_empty() && !self.plan_days.iter().any(|day| day == plan_day_id) {
            return Err(SyncError::UnknownPlanDay(plan_day_id.to_string()));
        }
        Ok(Container::Day(plan_day_id.to_string()))
    }

    fn require_confirmed(&self, id: &str) -> Result<PoiId, SyncError> {
        let id = self.ledger.canonical_id(id);
        match self.store.get(&id) {
            Some(poi) if poi.is_persisted => Ok(id),
            Some(_) => Err(SyncError::Unconfirmed(id)),
            None => Err(SyncError::UnknownPoi(id)),
        }
    }

    fn mark_into(&mut self, identity: &Identity, draft: PoiDraft, container: &Container) -> Result<PoiId, SyncError> {
        if valid_geometry(Some(draft.latitude), Some(draft.longitude)).is_none() {
            return Err(SyncError::InvalidGeometry {
                latitude: draft.latitude,
                longitude: draft.longitude,
            });
        }
        let temp_id = new_temp_id();
        let sequence = self.store.next_sequence(container);
        self.store.upsert(Poi::draft(
            temp_id.clone(),
            self.workspace_id.clone(),
            identity.user_id.clone(),
            &draft,
            container,
            sequence,
        ));
        info!(
            event = "poi_marked",
            temp_id = %temp_id,
            container = %container,
            place = draft.place_name.as_deref().unwrap_or("")
        );
        self.emit(WireMsg::Mark(MarkPayload {
            temp_id: temp_id.clone(),
            workspace_id: self.workspace_id.clone(),
            created_by: identity.user_id.clone(),
            draft,
        }));
        Ok(temp_id)
    }

    fn in_plan(&self, place: &RecommendedPlace) -> bool {
        let tolerance = self.config.coordinate_tolerance_deg;
        self.store.list().iter().any(|poi| {
            matches!(poi.status, PoiStatus::Marked | PoiStatus::Scheduled)
                && (poi.place_id.as_deref() == Some(place.id.as_str())
                    || poi.is_near(place.latitude, place.longitude, tolerance))
        })
    }

    fn apply_snapshot(&mut self, snapshot: SnapshotPayload, now: DateTime<Utc>) {
        let received = snapshot.pois.len();
        let mut records: Vec<Poi> = snapshot
            .pois
            .into_iter()
            .filter_map(|record| record.into_poi(&self.workspace_id))
            .filter(|poi| poi.status != PoiStatus::Unmarked)
            .collect();
        for segment in snapshot.connections.values().flatten() {
            if let Some(next) = records.iter_mut().find(|poi| poi.id == segment.next_poi_id) {
                next.distance = next.distance.or(segment.distance);
                next.duration = next.duration.or(segment.duration);
            }
        }
        let kept = records.len();
        self.store.replace_all(records);
        self.routes.replace_all(snapshot.connections);
        self.reconciler.retain_known(&self.store);
        self.presence.sweep(now, &self.store);
        info!(
            event = "snapshot_applied",
            workspace_id = %self.workspace_id,
            count = kept,
            dropped = received - kept,
            segments = self.routes.len()
        );
        if self.recovery.on_snapshot() {
            info!(event = "sync_recovered", workspace_id = %self.workspace_id);
            self.notices.push(Notice::Recovered);
        }
    }

    fn apply_confirmation(&mut self, record: PoiRecord, now: DateTime<Utc>) {
        let outcome = self.reconciler.reconcile(
            &mut self.store,
            &mut self.ledger,
            record,
            &self.workspace_id,
            now,
        );
        match outcome {
            ReconcileOutcome::Merged {
                id,
                replaced,
                matched_by,
                replay,
            } => {
                info!(
                    event = "confirmation_merged",
                    poi_id = %id,
                    replaced = ?replaced,
                    matched_by = matched_by.as_str()
                );
                if let Some(intent) = replay {
                    self.replay_intent(&id, intent);
                }
            }
            ReconcileOutcome::Duplicate { id } => {
                debug!(event = "confirmation_duplicate", poi_id = %id);
            }
            ReconcileOutcome::Rejected { id, reason } => {
                warn!(event = "confirmation_rejected", poi_id = %id, reason);
            }
        }
    }

    fn replay_intent(&mut self, id: &str, intent: PendingIntent) {
        info!(
            event = "intent_replayed",
            temp_id = %intent.temp_id,
            poi_id = %id,
            kind = ?intent.kind
        );
        match intent.kind {
            IntentKind::Schedule { plan_day_id } => {
                let day = Container::Day(plan_day_id.clone());
                self.emit(WireMsg::AddSchedule(SchedulePayload {
                    poi_id: id.to_string(),
                    plan_day_id,
                }));
                if let Some(payload) = ordering::container_order(&self.store, &day) {
                    self.emit(WireMsg::Reorder(payload));
                }
            }
            IntentKind::Unmark => self.emit(WireMsg::Unmark(PoiRefPayload {
                poi_id: id.to_string(),
            })),
        }
    }

    fn apply_unmarked(&mut self, raw_id: &str, now: DateTime<Utc>) {
        let id = self.ledger.canonical_id(raw_id);
        self.ledger.take(&id);
        self.reconciler.forget(&id);
        let segments = self.routes.drop_poi(&id);
        match self.store.remove(&id) {
            Some(poi) => info!(event = "poi_unmarked", poi_id = %id, place = poi.label(), segments),
            None => debug!(event = "poi_unmarked_unknown", poi_id = %id),
        }
        self.presence.sweep(now, &self.store);
    }

    fn apply_remote_schedule(&mut self, payload: &SchedulePayload, add: bool, now: DateTime<Utc>) {
        let id = self.ledger.canonical_id(&payload.poi_id);
        let Some(poi) = self.store.get(&id).cloned() else {
            let kind = if add { "addSchedule" } else { "removeSchedule" };
            self.anomaly(now, kind, &id);
            return;
        };
        let day = Container::Day(payload.plan_day_id.clone());
        let target = if add {
            Some(day)
        } else if poi.is_in(&day) {
            Some(Container::Unscheduled)
        } else {
            None
        };
        if let Some(target) = target.filter(|target| poi.container().is_some() && !poi.is_in(target)) {
            let sequence = self.store.next_sequence(&target);
            self.store.upsert(poi.placed_in(&target, sequence));
        }
    }

    fn apply_connection(&mut self, connection: PoiConnection, now: DateTime<Utc>) {
        let id = self.ledger.canonical_id(&connection.next_poi_id);
        let Some(poi) = self.store.get(&id).cloned() else {
            self.anomaly(now, "connected", &id);
            return;
        };
        self.store.upsert(Poi {
            distance: connection.distance.or(poi.distance),
            duration: connection.duration.or(poi.duration),
            ..poi
        });
        debug!(
            event = "route_segment",
            prev_poi_id = %connection.prev_poi_id,
            next_poi_id = %id,
            plan_day_id = %connection.plan_day_id
        );
        self.routes.insert(PoiConnection {
            prev_poi_id: self.ledger.canonical_id(&connection.prev_poi_id),
            next_poi_id: id,
            ..connection
        });
    }

    /// A removed segment takes its distance and duration off the next POI.
    /// Segments this client never saw are ignored.
    fn apply_disconnection(&mut self, segment: &PoiDisconnection) {
        let Some(removed) = self.routes.remove(segment) else {
            debug!(
                event = "route_segment_unknown",
                prev_poi_id = %segment.prev_poi_id,
                next_poi_id = %segment.next_poi_id
            );
            return;
        };
        if let Some(next) = self.store.get(&removed.next_poi_id).cloned() {
            self.store.upsert(Poi {
                distance: None,
                duration: None,
                ..next
            });
        }
        debug!(
            event = "route_segment_removed",
            prev_poi_id = %removed.prev_poi_id,
            next_poi_id = %removed.next_poi_id,
            plan_day_id = %removed.plan_day_id
        );
    }

    fn anomaly(&mut self, now: DateTime<Utc>, kind: &str, ids: &str) {
        warn!(
            event = "referential_anomaly",
            kind,
            ids,
            phase = %self.recovery.phase()
        );
        let actions = self.recovery.on_anomaly(now);
        self.apply_recovery(actions);
    }

    fn apply_recovery(&mut self, actions: Vec<RecoveryAction>) {
        for action in actions {
            match action {
                RecoveryAction::RequestSnapshot => {
                    info!(
                        event = "resync_requested",
                        workspace_id = %self.workspace_id,
                        attempt = self.recovery.attempts()
                    );
                    self.emit(WireMsg::Flush(self.workspace_payload()));
                }
                RecoveryAction::ClearStore => self.store.clear(),
                RecoveryAction::Degraded(reason) => {
                    warn!(event = "sync_degraded", workspace_id = %self.workspace_id, %reason);
                    self.notices.push(Notice::Degraded(reason));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_792_310_400 + offset_secs, 0)
            .single()
            .expect("valid timestamp")
    }

    fn connected_session() -> SyncSession {
        let mut session = SyncSession::new(
            "ws-jeju",
            Some(Identity::new("user-1", "Ada")),
            SyncConfig::default(),
        );
        session.on_connected(ts(0));
        session.handle_message(WireMsg::Sync(SnapshotPayload::default()), ts(0));
        session.drain_outbound();
        session
    }

    fn confirmed(id: &str, temp_id: &str, lat: f64, lng: f64) -> WireMsg {
        WireMsg::Marked(
            serde_json::from_value(serde_json::json!({
                "id": id, "tempId": temp_id, "latitude": lat, "longitude": lng, "status": "MARKED"
            }))
            .expect("record"),
        )
    }

    #[test]
    fn join_is_sent_on_connect() {
        let mut session = SyncSession::new("ws-jeju", None, SyncConfig::default());
        session.on_connected(ts(0));
        assert_eq!(session.phase(), SyncPhase::Syncing);
        let sent = session.drain_outbound();
        assert!(matches!(sent.as_slice(), [WireMsg::Join(p)] if p.workspace_id == "ws-jeju"));
    }

    #[test]
    fn unmarking_an_unconfirmed_poi_waits_for_its_id() {
        let mut session = connected_session();
        let temp_id = session
            .mark(PoiDraft::new(33.45, 126.57, "Beach"))
            .expect("mark");
        session.unmark(&temp_id, ts(1)).expect("unmark");
        let sent = session.drain_outbound();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            session.store().get(&temp_id).map(|p| p.status),
            Some(PoiStatus::Unmarked)
        );

        session.handle_message(confirmed("srv-1", &temp_id, 33.45, 126.57), ts(2));
        let sent = session.drain_outbound();
        assert!(matches!(sent.as_slice(), [WireMsg::Unmark(p)] if p.poi_id == "srv-1"));

        session.handle_message(
            WireMsg::Unmarked(PoiRefPayload {
                poi_id: "srv-1".to_string(),
            }),
            ts(3),
        );
        assert!(session.store().is_empty());
    }

    #[test]
    fn unknown_unmarked_is_not_an_anomaly() {
        let mut session = connected_session();
        session.handle_message(
            WireMsg::Unmarked(PoiRefPayload {
                poi_id: "ghost".to_string(),
            }),
            ts(1),
        );
        assert_eq!(session.phase(), SyncPhase::Synced);
        assert!(session.drain_outbound().is_empty());
    }

    #[test]
    fn offline_actions_update_the_store_but_send_nothing() {
        let mut session = connected_session();
        session.on_disconnected();
        session
            .mark(PoiDraft::new(33.45, 126.57, "Beach"))
            .expect("mark");
        session.move_cursor(1.0, 2.0, ts(1)).expect("cursor");
        assert_eq!(session.store().len(), 1);
        assert!(session.drain_outbound().is_empty());
    }

    #[test]
    fn invalid_geometry_and_unknown_days_are_rejected() {
        let mut session = connected_session();
        session.set_plan_days(vec!["day-1".to_string()]);
        assert!(matches!(
            session.mark(PoiDraft::new(123.0, 0.0, "Nowhere")),
            Err(SyncError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            session.mark_and_schedule(PoiDraft::new(1.0, 2.0, "Cafe"), "day-9", ts(0)),
            Err(SyncError::UnknownPlanDay(_))
        ));
        assert!(session.store().is_empty());
    }

    #[test]
    fn connected_segment_updates_next_poi() {
        let mut session = connected_session();
        let a = session.mark(PoiDraft::new(33.0, 126.0, "A")).expect("mark a");
        let b = session.mark(PoiDraft::new(33.1, 126.1, "B")).expect("mark b");
        session.handle_message(confirmed("p1", &a, 33.0, 126.0), ts(1));
        session.handle_message(confirmed("p2", &b, 33.1, 126.1), ts(1));
        assert!(matches!(
            session.connect_pois(&a, "missing", "day-1", None, None),
            Err(SyncError::UnknownPoi(_))
        ));
        session
            .connect_pois(&a, &b, "day-1", Some(1200.0), Some(300.0))
            .expect("connect");

        session.handle_message(
            WireMsg::Connected(PoiConnection {
                id: Some("seg-1".to_string()),
                prev_poi_id: "p1".to_string(),
                next_poi_id: "p2".to_string(),
                plan_day_id: "day-1".to_string(),
                distance: Some(1200.0),
                duration: Some(300.0),
            }),
            ts(2),
        );
        let next = session.store().get("p2").expect("p2");
        assert_eq!(next.distance, Some(1200.0));
        assert_eq!(next.duration, Some(300.0));
    }

    #[test]
    fn expired_unmark_intent_drops_the_orphan() {
        let mut session = connected_session();
        let temp_id = session
            .mark(PoiDraft::new(33.45, 126.57, "Beach"))
            .expect("mark");
        session.unmark(&temp_id, ts(0)).expect("unmark");
        session.tick(ts(0) + Duration::seconds(121));
        assert!(session.store().is_empty());
        assert!(session.ledger().is_empty());
    }

    #[test]
    fn focused_places_for_other_users_are_ignored() {
        let mut session = connected_session();
        session
            .focus_place(MapBounds {
                south_west_lat: 33.0,
                south_west_lng: 126.0,
                north_east_lat: 34.0,
                north_east_lng: 127.0,
            })
            .expect("focus");
        assert!(matches!(
            session.drain_outbound().as_slice(),
            [WireMsg::PlaceFocus(p)] if p.user_id == "user-1"
        ));

        session.handle_message(
            WireMsg::PlaceFocused(tripsync_core::protocol::FocusedPayload {
                user_id: Some("someone-else".to_string()),
                places: vec![serde_json::json!({"id": 1})],
            }),
            ts(1),
        );
        assert!(session.focused_places().is_empty());
        session.handle_message(
            WireMsg::PlaceFocused(tripsync_core::protocol::FocusedPayload {
                user_id: Some("user-1".to_string()),
                places: vec![serde_json::json!({"id": 2})],
            }),
            ts(1),
        );
        assert_eq!(session.focused_places().len(), 1);
    }
    #[test]
    fn unmarked_poi_drops_remote_hover_at_once() {
        let mut session = connected_session();
        let temp_id = session.mark(PoiDraft::new(33.0, 126.0, "A")).expect("mark");
        session.handle_message(confirmed("p1", &temp_id, 33.0, 126.0), ts(1));
        session.handle_message(
            WireMsg::PoiHovered(tripsync_core::protocol::HoverPayload {
                user_id: "peer".to_string(),
                user_name: Some("Grace".to_string()),
                color: None,
                poi_id: Some("p1".to_string()),
            }),
            ts(2),
        );
        assert_eq!(session.presence().hovered_by("peer").map(String::as_str), Some("p1"));

        session.handle_message(
            WireMsg::Unmarked(PoiRefPayload {
                poi_id: "p1".to_string(),
            }),
            ts(3),
        );
        assert!(session.presence().hovered_by("peer").is_none());
    }

    #[test]
    fn confirmation_bookkeeping_shrinks_after_unmark_and_ttl() {
        let mut session = connected_session();
        let temp_id = session.mark(PoiDraft::new(33.0, 126.0, "A")).expect("mark");
        session.handle_message(confirmed("p1", &temp_id, 33.0, 126.0), ts(1));
        assert_eq!(session.reconciler.applied_len(), 1);
        assert_eq!(session.ledger().resolved_len(), 1);

        session.handle_message(
            WireMsg::Unmarked(PoiRefPayload {
                poi_id: "p1".to_string(),
            }),
            ts(2),
        );
        assert_eq!(session.reconciler.applied_len(), 0);

        session.tick(ts(60));
        assert_eq!(session.ledger().resolved_len(), 1);
        session.tick(ts(1) + Duration::seconds(121));
        assert_eq!(session.ledger().resolved_len(), 0);
    }

    #[test]
    fn route_segments_follow_snapshot_and_disconnect() {
        let mut session = connected_session();
        let snapshot: SnapshotPayload = serde_json::from_value(serde_json::json!({
            "pois": [
                {"id": "p1", "latitude": 33.0, "longitude": 126.0, "status": "SCHEDULED", "planDayId": "day-1", "sequence": 0},
                {"id": "p2", "latitude": 33.1, "longitude": 126.1, "status": "SCHEDULED", "planDayId": "day-1", "sequence": 1}
            ],
            "connections": {
                "day-1": [{"id": "seg-1", "prevPoiId": "p1", "nextPoiId": "p2", "planDayId": "day-1", "distance": 800.0, "duration": 240.0}]
            }
        }))
        .expect("snapshot");
        session.handle_message(WireMsg::Sync(snapshot), ts(1));
        assert_eq!(session.routes().day("day-1").len(), 1);
        assert_eq!(session.store().get("p2").and_then(|p| p.distance), Some(800.0));

        session.disconnect_pois("p1", "p2", "day-1").expect("disconnect");
        assert!(matches!(
            session.drain_outbound().as_slice(),
            [WireMsg::PoiDisconnect(seg)] if seg.prev_poi_id == "p1" && seg.next_poi_id == "p2"
        ));

        session.handle_message(
            WireMsg::Disconnected(PoiDisconnection {
                id: Some("seg-1".to_string()),
                prev_poi_id: "p1".to_string(),
                next_poi_id: "p2".to_string(),
                plan_day_id: "day-1".to_string(),
            }),
            ts(2),
        );
        assert!(session.routes().is_empty());
        let next = session.store().get("p2").expect("p2");
        assert_eq!((next.distance, next.duration), (None, None));
        assert_eq!(session.phase(), SyncPhase::Synced);
    }

    #[test]
    fn recommended_places_without_location_are_reported_apart() {
        let mut session = connected_session();
        let temp_id = session.mark(PoiDraft::new(33.0, 126.0, "A")).expect("mark");
        session.handle_message(confirmed("p1", &temp_id, 33.0, 126.0), ts(1));
        let places: Vec<RecommendedPlace> = serde_json::from_value(serde_json::json!([
            {"id": 1, "title": "A", "latitude": 33.0, "longitude": 126.0},
            {"id": 2, "title": "Nowhere", "latitude": 123.0, "longitude": 0.0}
        ]))
        .expect("places");

        let report = session
            .add_recommended_to_day("day-1", &places, ts(2))
            .expect("add");
        assert!(report.added.is_empty());
        assert_eq!(report.skipped, vec!["A".to_string()]);
        assert_eq!(report.invalid, vec!["Nowhere".to_string()]);
        assert_eq!(
            report.message.as_deref(),
            Some("1 place(s) already in the plan were skipped. 1 place(s) without a valid location were skipped.")
        );
    }

    #[test]
    fn offline_presence_is_dropped_quietly() {
        let mut session = connected_session();
        session.on_disconnected();
        session.hover_poi(None).expect("hover");
        session.click_map(33.0, 126.0, ts(1)).expect("click");
        assert!(session.drain_outbound().is_empty());
    }
}
