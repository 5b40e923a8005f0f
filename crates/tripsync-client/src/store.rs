//! Client-local POI records, the single source of truth for rendering.
//!
//! Every mutation swaps whole records and bumps the revision exactly once, so
//! a subscriber never sees a half-applied change.

use tokio::sync::watch;
use tripsync_core::{Container, Poi, PoiId, PoiStatus};

#[derive(Debug)]
pub struct EntityStore {
    records: Vec<Poi>,
    revision: u64,
    notifier: watch::Sender<u64>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let (notifier, _) = watch::channel(0);
        Self {
            records: Vec::new(),
            revision: 0,
            notifier,
        }
    }

    pub fn list(&self) -> &[Poi] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Receives the store revision after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<&Poi> {
        self.records.iter().find(|poi| poi.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn filter<F>(&self, predicate: F) -> Vec<&Poi>
    where
        F: Fn(&Poi) -> bool,
    {
        self.records.iter().filter(|poi| predicate(poi)).collect()
    }

    /// Inserts or replaces the record with the same id; returns the old one.
    pub fn upsert(&mut self, record: Poi) -> Option<Poi> {
        let previous = self.put(record);
        self.bump();
        previous
    }

    /// Applies several full-record replacements as one mutation.
    pub fn upsert_all(&mut self, records: Vec<Poi>) {
        if records.is_empty() {
            return;
        }
        for record in records {
            self.put(record);
        }
        self.bump();
    }

    pub fn remove(&mut self, id: &str) -> Option<Poi> {
        let idx = self.position(id)?;
        let removed = self.records.remove(idx);
        self.bump();
        Some(removed)
    }

    /// Swaps the record stored under `old_id` for `record`, keeping its slot
    /// even when the id changes. Any other record already holding the new id
    /// is dropped so the id stays unique.
    pub fn replace(&mut self, old_id: &str, record: Poi) -> Option<Poi> {
        let Some(mut idx) = self.position(old_id) else {
            return self.upsert(record);
        };
        if record.id != old_id {
            if let Some(dup) = self.position(&record.id) {
                self.records.remove(dup);
                if dup < idx {
                    idx -= 1;
                }
            }
        }
        let previous = std::mem::replace(&mut self.records[idx], record);
        self.bump();
        Some(previous)
    }

    /// Full reset from an authoritative snapshot. Later duplicates win.
    pub fn replace_all(&mut self, records: Vec<Poi>) {
        self.records.clear();
        for record in records {
            self.put(record);
        }
        self.bump();
    }

    pub fn clear(&mut self) {
        self.replace_all(Vec::new());
    }

    /// Records of one container in render order: ascending sequence, ties
    /// broken by store position.
    pub fn container(&self, container: &Container) -> Vec<&Poi> {
        let mut members: Vec<&Poi> = self
            .records
            .iter()
            .filter(|poi| poi.is_in(container))
            .collect();
        members.sort_by_key(|poi| poi.sequence);
        members
    }

    pub fn container_ids(&self, container: &Container) -> Vec<PoiId> {
        self.container(container)
            .into_iter()
            .map(|poi| poi.id.clone())
            .collect()
    }

    pub fn next_sequence(&self, container: &Container) -> i64 {
        self.records
            .iter()
            .filter(|poi| poi.is_in(container))
            .map(|poi| poi.sequence.saturating_add(1))
            .max()
            .unwrap_or(0)
    }

    /// First unconfirmed local record within `tolerance` degrees.
    pub fn find_unpersisted_near(&self, latitude: f64, longitude: f64, tolerance: f64) -> Option<&Poi> {
        self.records.iter().find(|poi| {
            !poi.is_persisted
                && poi.status != PoiStatus::Recommended
                && poi.is_near(latitude, longitude, tolerance)
        })
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|poi| poi.id == id)
    }

    fn put(&mut self, record: Poi) -> Option<Poi> {
        match self.position(&record.id) {
            Some(idx) => Some(std::mem::replace(&mut self.records[idx], record)),
            None => {
                self.records.push(record);
                None
            }
        }
    }

    fn bump(&mut self) {
        self.revision += 1;
        self.notifier.send_replace(self.revision);
    }
}
