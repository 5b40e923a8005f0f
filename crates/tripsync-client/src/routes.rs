//! Route segments between consecutive POIs of a plan day.

use std::collections::BTreeMap;
use tripsync_core::protocol::{PoiConnection, PoiDisconnection};

#[derive(Debug, Default)]
pub struct RouteTable {
    days: BTreeMap<String, Vec<PoiConnection>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Segments of one day in arrival order.
    pub fn day(&self, plan_day_id: &str) -> &[PoiConnection] {
        self.days
            .get(plan_day_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn days(&self) -> impl Iterator<Item = (&str, &[PoiConnection])> {
        self.days
            .iter()
            .map(|(day, segments)| (day.as_str(), segments.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn replace_all(&mut self, days: BTreeMap<String, Vec<PoiConnection>>) {
        self.days = days;
        self.days.retain(|_, segments| !segments.is_empty());
    }

    /// Adds a segment, replacing one with the same endpoints on that day.
    pub fn insert(&mut self, connection: PoiConnection) {
        let segments = self.days.entry(connection.plan_day_id.clone()).or_default();
        match segments.iter_mut().find(|segment| {
            segment.prev_poi_id == connection.prev_poi_id
                && segment.next_poi_id == connection.next_poi_id
        }) {
            Some(existing) => *existing = connection,
            None => segments.push(connection),
        }
    }

    /// Drops the named segment, matched by id when both sides carry one and
    /// by endpoints otherwise.
    pub fn remove(&mut self, target: &PoiDisconnection) -> Option<PoiConnection> {
        let segments = self.days.get_mut(&target.plan_day_id)?;
        let idx = segments.iter().position(|segment| match (&segment.id, &target.id) {
            (Some(id), Some(wanted)) => id == wanted,
            _ => {
                segment.prev_poi_id == target.prev_poi_id
                    && segment.next_poi_id == target.next_poi_id
            }
        })?;
        let removed = segments.remove(idx);
        if segments.is_empty() {
            self.days.remove(&target.plan_day_id);
        }
        Some(removed)
    }

    /// Drops every segment touching `poi_id`. Returns how many went.
    pub fn drop_poi(&mut self, poi_id: &str) -> usize {
        let before = self.len();
        for segments in self.days.values_mut() {
            segments.retain(|segment| segment.prev_poi_id != poi_id && segment.next_poi_id != poi_id);
        }
        self.days.retain(|_, segments| !segments.is_empty());
        before - self.len()
    }
}
