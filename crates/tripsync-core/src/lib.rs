pub mod protocol;
pub mod recommend;

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type PoiId = String;

pub const TEMP_ID_PREFIX: &str = "poi-temp-";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoiStatus {
    Marked,
    Scheduled,
    Recommended,
    Unmarked,
}

impl Default for PoiStatus {
    fn default() -> Self {
        Self::Marked
    }
}

impl PoiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoiStatus::Marked => "MARKED",
            PoiStatus::Scheduled => "SCHEDULED",
            PoiStatus::Recommended => "RECOMMENDED",
            PoiStatus::Unmarked => "UNMARKED",
        }
    }
}

impl fmt::Display for PoiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoiStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_uppercase();
        match normalized.as_str() {
            "MARKED" => Ok(PoiStatus::Marked),
            "SCHEDULED" => Ok(PoiStatus::Scheduled),
            "RECOMMENDED" => Ok(PoiStatus::Recommended),
            "UNMARKED" => Ok(PoiStatus::Unmarked),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// An ordered list a POI can live in: the unscheduled pool or one plan day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Container {
    Unscheduled,
    Day(String),
}

impl Container {
    pub fn from_plan_day(plan_day_id: Option<&str>) -> Self {
        match plan_day_id {
            Some(day) => Container::Day(day.to_string()),
            None => Container::Unscheduled,
        }
    }

    pub fn plan_day_id(&self) -> Option<&str> {
        match self {
            Container::Unscheduled => None,
            Container::Day(day) => Some(day.as_str()),
        }
    }

    pub fn status(&self) -> PoiStatus {
        match self {
            Container::Unscheduled => PoiStatus::Marked,
            Container::Day(_) => PoiStatus::Scheduled,
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Container::Unscheduled => f.write_str("unscheduled"),
            Container::Day(day) => write!(f, "day:{day}"),
        }
    }
}

/// A point of interest as this client currently sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Poi {
    pub id: PoiId,
    pub workspace_id: String,
    pub created_by: String,
    #[serde(default)]
    pub place_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub place_name: Option<String>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub status: PoiStatus,
    #[serde(default)]
    pub plan_day_id: Option<String>,
    #[serde(default)]
    pub sequence: i64,
    #[serde(default)]
    pub is_persisted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Poi {
    /// Builds the optimistic record for a place this client is about to mark.
    pub fn draft(
        id: impl Into<PoiId>,
        workspace_id: impl Into<String>,
        created_by: impl Into<String>,
        draft: &PoiDraft,
        container: &Container,
        sequence: i64,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            created_by: created_by.into(),
            place_id: draft.place_id.clone(),
            latitude: draft.latitude,
            longitude: draft.longitude,
            address: draft.address.clone(),
            place_name: draft.place_name.clone(),
            category_name: draft.category_name.clone(),
            status: container.status(),
            plan_day_id: container.plan_day_id().map(str::to_string),
            sequence,
            is_persisted: false,
            distance: None,
            duration: None,
        }
    }

    pub fn container(&self) -> Option<Container> {
        match self.status {
            PoiStatus::Marked => Some(Container::Unscheduled),
            PoiStatus::Scheduled => self
                .plan_day_id
                .as_deref()
                .map(|day| Container::Day(day.to_string())),
            PoiStatus::Recommended | PoiStatus::Unmarked => None,
        }
    }

    pub fn is_in(&self, container: &Container) -> bool {
        self.container().as_ref() == Some(container)
    }

    /// A copy of this record placed in `container` at `sequence`.
    pub fn placed_in(&self, container: &Container, sequence: i64) -> Self {
        Self {
            status: container.status(),
            plan_day_id: container.plan_day_id().map(str::to_string),
            sequence,
            ..self.clone()
        }
    }

    pub fn with_sequence(&self, sequence: i64) -> Self {
        Self {
            sequence,
            ..self.clone()
        }
    }

    /// SCHEDULED carries a day and MARKED never does.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            PoiStatus::Scheduled => self.plan_day_id.is_some(),
            PoiStatus::Marked => self.plan_day_id.is_none(),
            PoiStatus::Recommended | PoiStatus::Unmarked => true,
        }
    }

    pub fn is_near(&self, latitude: f64, longitude: f64, tolerance: f64) -> bool {
        (self.latitude - latitude).abs() <= tolerance
            && (self.longitude - longitude).abs() <= tolerance
    }

    pub fn label(&self) -> &str {
        self.place_name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// The display fields copied from the place catalog when a place is marked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoiDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
}

impl PoiDraft {
    pub fn new(latitude: f64, longitude: f64, place_name: impl Into<String>) -> Self {
        Self {
            place_id: None,
            latitude,
            longitude,
            address: String::new(),
            place_name: Some(place_name.into()),
            category_name: None,
        }
    }

    pub fn has_valid_geometry(&self) -> bool {
        valid_geometry(Some(self.latitude), Some(self.longitude)).is_some()
    }
}

/// A POI as the server sends it. Every field except the id may be missing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoiRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: PoiId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub place_id: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_status",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<PoiStatus>,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub plan_day_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl PoiRecord {
    pub fn geometry(&self) -> Option<(f64, f64)> {
        valid_geometry(self.latitude, self.longitude)
    }

    /// Status and day as the server states them. RECOMMENDED is never
    /// authoritative and an inconsistent pair falls back to MARKED.
    pub fn placement(&self) -> (PoiStatus, Option<String>) {
        match (self.status.unwrap_or_default(), self.plan_day_id.as_ref()) {
            (PoiStatus::Scheduled, Some(day)) => (PoiStatus::Scheduled, Some(day.clone())),
            (PoiStatus::Unmarked, _) => (PoiStatus::Unmarked, None),
            _ => (PoiStatus::Marked, None),
        }
    }

    /// Converts into an authoritative record; `None` when geometry is unusable.
    pub fn into_poi(self, workspace_id: &str) -> Option<Poi> {
        let (latitude, longitude) = self.geometry()?;
        let (status, plan_day_id) = self.placement();
        Some(Poi {
            id: self.id,
            workspace_id: self
                .workspace_id
                .unwrap_or_else(|| workspace_id.to_string()),
            created_by: self.created_by.unwrap_or_default(),
            place_id: self.place_id,
            latitude,
            longitude,
            address: self.address.unwrap_or_default(),
            place_name: self.place_name,
            category_name: self.category_name,
            status,
            plan_day_id,
            sequence: self.sequence.unwrap_or(0),
            is_persisted: true,
            distance: self.distance,
            duration: self.duration,
        })
    }
}

/// The signed-in participant, as supplied by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = color_for_user(&user_id);
        Self {
            user_id,
            display_name: display_name.into(),
            color,
        }
    }
}

/// Stable per-user colour: a string hash spread over RGB, darkened to 70%.
pub fn color_for_user(user_id: &str) -> String {
    let mut hash: i32 = 0;
    for unit in user_id.encode_utf16() {
        hash = i32::from(unit).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash));
    }
    let mut color = String::from("#");
    for i in 0..3 {
        let value = (hash >> (i * 8)) & 0xff;
        let dark = (f64::from(value) * 0.7).floor() as u8;
        color.push_str(&format!("{dark:02X}"));
    }
    color
}

pub fn new_temp_id() -> PoiId {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

pub fn valid_geometry(latitude: Option<f64>, longitude: Option<f64>) -> Option<(f64, f64)> {
    let (lat, lng) = (latitude?, longitude?);
    if !lat.is_finite() || !lng.is_finite() {
        return None;
    }
    if lat.abs() > 90.0 || lng.abs() > 180.0 {
        return None;
    }
    Some((lat, lng))
}

fn id_from_value(val: serde_json::Value) -> Option<String> {
    match val {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Deserialize an ID that can be either a string or a number into a String
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    id_from_value(val).ok_or_else(|| serde::de::Error::custom("expected string or number for id"))
}

pub fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    match val {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(val) => id_from_value(val)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("expected string or number for id")),
    }
}

pub fn deserialize_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
    Ok(v.into_iter().filter_map(id_from_value).collect())
}

fn deserialize_status<'de, D>(deserializer: D) -> Result<Option<PoiStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<String> = Option::deserialize(deserializer)?;
    Ok(val.and_then(|raw| raw.parse::<PoiStatus>().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accepts_numeric_ids_and_lenient_status() {
        let record: PoiRecord = serde_json::from_str(
            r#"{"id": 42, "tempId": "poi-temp-1", "latitude": 33.45, "longitude": 126.57,
                "status": "scheduled", "planDayId": 7}"#,
        )
        .expect("parse record");
        assert_eq!(record.id, "42");
        assert_eq!(record.plan_day_id.as_deref(), Some("7"));
        assert_eq!(record.status, Some(PoiStatus::Scheduled));

        let odd: PoiRecord =
            serde_json::from_str(r#"{"id": "a", "status": "ARCHIVED"}"#).expect("parse odd");
        assert_eq!(odd.status, None);
        assert_eq!(odd.geometry(), None);
    }

    #[test]
    fn recommended_and_dayless_scheduled_fall_back_to_marked() {
        let mut record: PoiRecord =
            serde_json::from_str(r#"{"id": "a", "latitude": 1.0, "longitude": 2.0}"#)
                .expect("parse record");
        record.status = Some(PoiStatus::Recommended);
        record.plan_day_id = Some("day-1".to_string());
        assert_eq!(record.placement(), (PoiStatus::Marked, None));

        record.status = Some(PoiStatus::Scheduled);
        record.plan_day_id = None;
        assert_eq!(record.placement(), (PoiStatus::Marked, None));

        let poi = record.into_poi("ws-1").expect("valid geometry");
        assert!(poi.is_persisted);
        assert!(poi.is_consistent());
        assert_eq!(poi.workspace_id, "ws-1");
    }

    #[test]
    fn geometry_rejects_out_of_range_and_nan() {
        assert!(valid_geometry(Some(91.0), Some(0.0)).is_none());
        assert!(valid_geometry(Some(f64::NAN), Some(0.0)).is_none());
        assert!(valid_geometry(None, Some(0.0)).is_none());
        assert_eq!(valid_geometry(Some(-33.0), Some(151.0)), Some((-33.0, 151.0)));
    }

    #[test]
    fn placement_keeps_invariant() {
        let draft = PoiDraft::new(33.450701, 126.570667, "Beach");
        let poi = Poi::draft("poi-temp-1", "ws", "user-1", &draft, &Container::Unscheduled, 0);
        let day = poi.placed_in(&Container::Day("day-1".to_string()), 3);
        assert_eq!(day.status, PoiStatus::Scheduled);
        assert_eq!(day.plan_day_id.as_deref(), Some("day-1"));
        assert!(day.is_consistent());

        let back = day.placed_in(&Container::Unscheduled, 0);
        assert_eq!(back.plan_day_id, None);
        assert!(back.is_consistent());
        assert_eq!(back.container(), Some(Container::Unscheduled));
    }

    #[test]
    fn user_colors_are_stable_hex() {
        let a = color_for_user("user-1");
        assert_eq!(a, color_for_user("user-1"));
        assert_eq!(a.len(), 7);
        assert!(a.starts_with('#'));
        assert_eq!(color_for_user("a"), "#430000");
    }

    #[test]
    fn temp_ids_are_recognisable() {
        let id = new_temp_id();
        assert!(is_temp_id(&id));
        assert!(!is_temp_id("srv-42"));
    }
}
