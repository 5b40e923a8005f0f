//! Ephemeral cursors, hover highlights and click ripples.
//!
//! The relay only ever reads the entity store; presence state lives here and
//! expires on its own.

use crate::config::SyncConfig;
use crate::store::EntityStore;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tripsync_core::protocol::{ClickPayload, CursorPayload, HoverPayload, WireMsg};
use tripsync_core::{Identity, PoiId};

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub user_id: String,
    pub user_name: Option<String>,
    pub color: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoverHighlight {
    pub user_id: String,
    pub user_name: Option<String>,
    pub color: Option<String>,
    pub poi_id: PoiId,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClickRipple {
    pub user_id: String,
    pub color: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PresenceRelay {
    cursor_throttle: Duration,
    cursor_ttl: Duration,
    hover_ttl: Duration,
    ripple_ttl: Duration,
    local_user: Option<String>,
    last_cursor_sent: Option<DateTime<Utc>>,
    cursors: HashMap<String, RemoteCursor>,
    hovers: HashMap<String, HoverHighlight>,
    ripples: HashMap<String, ClickRipple>,
}

impl PresenceRelay {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            cursor_throttle: config.cursor_throttle,
            cursor_ttl: config.cursor_ttl,
            hover_ttl: config.hover_ttl,
            ripple_ttl: config.ripple_ttl,
            local_user: None,
            last_cursor_sent: None,
            cursors: HashMap::new(),
            hovers: HashMap::new(),
            ripples: HashMap::new(),
        }
    }

    pub fn set_local_user(&mut self, user_id: Option<String>) {
        self.local_user = user_id;
    }

    pub fn cursors(&self) -> impl Iterator<Item = &RemoteCursor> {
        self.cursors.values()
    }

    pub fn hovers(&self) -> impl Iterator<Item = &HoverHighlight> {
        self.hovers.values()
    }

    pub fn ripples(&self) -> impl Iterator<Item = &ClickRipple> {
        self.ripples.values()
    }

    pub fn hovered_by(&self, user_id: &str) -> Option<&PoiId> {
        self.hovers.get(user_id).map(|hover| &hover.poi_id)
    }

    /// Cursor updates inside the throttle window or while offline are dropped.
    pub fn move_cursor(
        &mut self,
        identity: &Identity,
        latitude: f64,
        longitude: f64,
        connected: bool,
        now: DateTime<Utc>,
    ) -> Option<WireMsg> {
        if !connected {
            return None;
        }
        if let Some(last) = self.last_cursor_sent {
            if now - last < self.cursor_throttle {
                return None;
            }
        }
        self.last_cursor_sent = Some(now);
        Some(WireMsg::CursorMove(CursorPayload {
            user_id: identity.user_id.clone(),
            user_name: Some(identity.display_name.clone()),
            color: Some(identity.color.clone()),
            latitude,
            longitude,
        }))
    }

    pub fn hover(&self, identity: &Identity, poi_id: Option<PoiId>, connected: bool) -> Option<WireMsg> {
        connected.then(|| {
            WireMsg::PoiHover(HoverPayload {
                user_id: identity.user_id.clone(),
                user_name: Some(identity.display_name.clone()),
                color: Some(identity.color.clone()),
                poi_id,
            })
        })
    }

    /// The local ripple is shown even when the click cannot be shared.
    pub fn click(
        &mut self,
        identity: &Identity,
        latitude: f64,
        longitude: f64,
        connected: bool,
        now: DateTime<Utc>,
    ) -> Option<WireMsg> {
        self.ripples.insert(
            identity.user_id.clone(),
            ClickRipple {
                user_id: identity.user_id.clone(),
                color: Some(identity.color.clone()),
                latitude,
                longitude,
                created_at: now,
            },
        );
        connected.then(|| {
            WireMsg::MapClick(ClickPayload {
                user_id: identity.user_id.clone(),
                color: Some(identity.color.clone()),
                latitude,
                longitude,
            })
        })
    }

    /// Applies a peer's presence message; returns false for anything that is
    /// not presence or that echoes the local user.
    pub fn apply(&mut self, msg: &WireMsg, store: &EntityStore, now: DateTime<Utc>) -> bool {
        match msg {
            WireMsg::CursorMoved(payload) if !self.is_local(&payload.user_id) => {
                self.cursors.insert(
                    payload.user_id.clone(),
                    RemoteCursor {
                        user_id: payload.user_id.clone(),
                        user_name: payload.user_name.clone(),
                        color: payload.color.clone(),
                        latitude: payload.latitude,
                        longitude: payload.longitude,
                        updated_at: now,
                    },
                );
                true
            }
            WireMsg::PoiHovered(payload) if !self.is_local(&payload.user_id) => {
                match payload.poi_id.as_ref().filter(|id| store.contains(id)) {
                    Some(poi_id) => {
                        self.hovers.insert(
                            payload.user_id.clone(),
                            HoverHighlight {
                                user_id: payload.user_id.clone(),
                                user_name: payload.user_name.clone(),
                                color: payload.color.clone(),
                                poi_id: poi_id.clone(),
                                updated_at: now,
                            },
                        );
                    }
                    None => {
                        self.hovers.remove(&payload.user_id);
                    }
                }
                true
            }
            WireMsg::MapClicked(payload) if !self.is_local(&payload.user_id) => {
                self.ripples.insert(
                    payload.user_id.clone(),
                    ClickRipple {
                        user_id: payload.user_id.clone(),
                        color: payload.color.clone(),
                        latitude: payload.latitude,
                        longitude: payload.longitude,
                        created_at: now,
                    },
                );
                true
            }
            _ => false,
        }
    }

    /// Drops expired entries and hovers whose POI is gone. Returns how many
    /// entries were removed.
    pub fn sweep(&mut self, now: DateTime<Utc>, store: &EntityStore) -> usize {
        let before = self.cursors.len() + self.hovers.len() + self.ripples.len();
        let (cursor_ttl, hover_ttl, ripple_ttl) = (self.cursor_ttl, self.hover_ttl, self.ripple_ttl);
        self.cursors
            .retain(|_, cursor| now - cursor.updated_at < cursor_ttl);
        self.hovers.retain(|_, hover| {
            now - hover.updated_at < hover_ttl && store.contains(&hover.poi_id)
        });
        self.ripples
            .retain(|_, ripple| now - ripple.created_at < ripple_ttl);
        before - (self.cursors.len() + self.hovers.len() + self.ripples.len())
    }

    /// Remote presence is meaningless across a reconnect.
    pub fn clear_remote(&mut self) {
        self.cursors.clear();
        self.hovers.clear();
        self.ripples.clear();
        self.last_cursor_sent = None;
    }

    fn is_local(&self, user_id: &str) -> bool {
        self.local_user.as_deref() == Some(user_id)
    }
}
