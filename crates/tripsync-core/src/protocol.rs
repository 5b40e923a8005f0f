use crate::{deserialize_id, deserialize_ids, deserialize_opt_id, PoiDraft, PoiId, PoiRecord};
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProtocolVersionVisitor;

        impl<'de> Visitor<'de> for ProtocolVersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let version = u16::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))?;
                Ok(ProtocolVersion(version))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                let version = cleaned.parse::<u16>().map_err(|err| {
                    E::custom(format!("invalid protocol version '{value}': {err}"))
                })?;
                Ok(ProtocolVersion(version))
            }
        }

        deserializer.deserialize_any(ProtocolVersionVisitor)
    }
}

/// One frame on the workspace channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub workspace_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum WireMsg {
    #[serde(rename = "join")]
    Join(WorkspacePayload),
    #[serde(rename = "joined")]
    Joined(WorkspacePayload),
    #[serde(rename = "leave")]
    Leave(WorkspacePayload),
    #[serde(rename = "left")]
    Left(WorkspacePayload),
    #[serde(rename = "sync")]
    Sync(SnapshotPayload),
    #[serde(rename = "mark")]
    Mark(MarkPayload),
    #[serde(rename = "marked")]
    Marked(PoiRecord),
    #[serde(rename = "unmark")]
    Unmark(PoiRefPayload),
    #[serde(rename = "unmarked")]
    Unmarked(PoiRefPayload),
    #[serde(rename = "addSchedule")]
    AddSchedule(SchedulePayload),
    #[serde(rename = "removeSchedule")]
    RemoveSchedule(SchedulePayload),
    #[serde(rename = "reorder")]
    Reorder(ReorderPayload),
    #[serde(rename = "flush")]
    Flush(WorkspacePayload),
    #[serde(rename = "flushed")]
    Flushed(SnapshotPayload),
    #[serde(rename = "cursorMove")]
    CursorMove(CursorPayload),
    #[serde(rename = "cursorMoved")]
    CursorMoved(CursorPayload),
    #[serde(rename = "poi:hover")]
    PoiHover(HoverPayload),
    #[serde(rename = "poi:hovered")]
    PoiHovered(HoverPayload),
    #[serde(rename = "map:click")]
    MapClick(ClickPayload),
    #[serde(rename = "map:clicked")]
    MapClicked(ClickPayload),
    #[serde(rename = "place:focus")]
    PlaceFocus(FocusPayload),
    #[serde(rename = "place:focused")]
    PlaceFocused(FocusedPayload),
    #[serde(rename = "poi:connect")]
    PoiConnect(PoiConnection),
    #[serde(rename = "connected")]
    Connected(PoiConnection),
    #[serde(rename = "poi:disconnect")]
    PoiDisconnect(PoiDisconnection),
    #[serde(rename = "disconnected")]
    Disconnected(PoiDisconnection),
}

impl WireMsg {
    pub fn event_name(&self) -> &'static str {
        match self {
            WireMsg::Join(_) => "join",
            WireMsg::Joined(_) => "joined",
            WireMsg::Leave(_) => "leave",
            WireMsg::Left(_) => "left",
            WireMsg::Sync(_) => "sync",
            WireMsg::Mark(_) => "mark",
            WireMsg::Marked(_) => "marked",
            WireMsg::Unmark(_) => "unmark",
            WireMsg::Unmarked(_) => "unmarked",
            WireMsg::AddSchedule(_) => "addSchedule",
            WireMsg::RemoveSchedule(_) => "removeSchedule",
            WireMsg::Reorder(_) => "reorder",
            WireMsg::Flush(_) => "flush",
            WireMsg::Flushed(_) => "flushed",
            WireMsg::CursorMove(_) => "cursorMove",
            WireMsg::CursorMoved(_) => "cursorMoved",
            WireMsg::PoiHover(_) => "poi:hover",
            WireMsg::PoiHovered(_) => "poi:hovered",
            WireMsg::MapClick(_) => "map:click",
            WireMsg::MapClicked(_) => "map:clicked",
            WireMsg::PlaceFocus(_) => "place:focus",
            WireMsg::PlaceFocused(_) => "place:focused",
            WireMsg::PoiConnect(_) => "poi:connect",
            WireMsg::Connected(_) => "connected",
            WireMsg::PoiDisconnect(_) => "poi:disconnect",
            WireMsg::Disconnected(_) => "disconnected",
        }
    }

    /// Ephemeral signals that are dropped rather than queued while offline.
    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            WireMsg::CursorMove(_)
                | WireMsg::CursorMoved(_)
                | WireMsg::PoiHover(_)
                | WireMsg::PoiHovered(_)
                | WireMsg::MapClick(_)
                | WireMsg::MapClicked(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspacePayload {
    pub workspace_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotPayload {
    #[serde(default, deserialize_with = "deserialize_records")]
    pub pois: Vec<PoiRecord>,
    /// Route segments keyed by plan day id.
    #[serde(
        default,
        deserialize_with = "deserialize_connections",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub connections: BTreeMap<String, Vec<PoiConnection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarkPayload {
    pub temp_id: PoiId,
    pub workspace_id: String,
    pub created_by: String,
    #[serde(flatten)]
    pub draft: PoiDraft,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoiRefPayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub poi_id: PoiId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub poi_id: PoiId,
    #[serde(deserialize_with = "deserialize_id")]
    pub plan_day_id: String,
}

/// A new order for one container; a missing day means the unscheduled pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReorderPayload {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub plan_day_id: Option<String>,
    #[serde(deserialize_with = "deserialize_ids")]
    pub poi_ids: Vec<PoiId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CursorPayload {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HoverPayload {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub poi_id: Option<PoiId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClickPayload {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MapBounds {
    pub south_west_lat: f64,
    pub south_west_lng: f64,
    pub north_east_lat: f64,
    pub north_east_lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FocusPayload {
    pub bounds: MapBounds,
    pub user_id: String,
}

/// Place-catalog entries are owned elsewhere and carried opaquely.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FocusedPayload {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub places: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoiConnection {
    #[serde(
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(deserialize_with = "deserialize_id")]
    pub prev_poi_id: PoiId,
    #[serde(deserialize_with = "deserialize_id")]
    pub next_poi_id: PoiId,
    #[serde(deserialize_with = "deserialize_id")]
    pub plan_day_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// Names a route segment to drop. The segment id is optional; the endpoint
/// pair within the day always identifies it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoiDisconnection {
    #[serde(
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(deserialize_with = "deserialize_id")]
    pub prev_poi_id: PoiId,
    #[serde(deserialize_with = "deserialize_id")]
    pub next_poi_id: PoiId,
    #[serde(deserialize_with = "deserialize_id")]
    pub plan_day_id: String,
}

fn deserialize_connections<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, Vec<PoiConnection>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(Value::Object(days)) = Option::<Value>::deserialize(deserializer)? else {
        return Ok(BTreeMap::new());
    };
    Ok(days
        .into_iter()
        .map(|(day, segments)| {
            let segments = match segments {
                Value::Array(items) => items
                    .into_iter()
                    .filter_map(|val| serde_json::from_value(val).ok())
                    .collect(),
                _ => Vec::new(),
            };
            (day, segments)
        })
        .collect())
}

/// Snapshot records that fail to decode are skipped instead of failing the
/// whole snapshot.
fn deserialize_records<'de, D>(deserializer: D) -> Result<Vec<PoiRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    Ok(v.unwrap_or_default()
        .into_iter()
        .filter_map(|val| serde_json::from_value(val).ok())
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(text: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = text.trim_end_matches(['\n', '\r']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(msg: WireMsg) -> WireEnvelope {
        WireEnvelope {
            version: ProtocolVersion::CURRENT,
            workspace_id: "ws-jeju".to_string(),
            sender_id: "user-1".to_string(),
            timestamp: "2026-10-18T09:00:00Z".to_string(),
            request_id: None,
            msg,
        }
    }

    #[test]
    fn mark_flattens_draft_fields_next_to_temp_id() {
        let message = envelope(WireMsg::Mark(MarkPayload {
            temp_id: "poi-temp-1".to_string(),
            workspace_id: "ws-jeju".to_string(),
            created_by: "user-1".to_string(),
            draft: PoiDraft::new(33.450701, 126.570667, "Beach"),
        }));
        let frame = encode_frame(&message, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let value: Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["event"], "mark");
        assert_eq!(value["workspaceId"], "ws-jeju");
        assert_eq!(value["payload"]["tempId"], "poi-temp-1");
        assert_eq!(value["payload"]["placeName"], "Beach");
        assert_eq!(value["payload"]["latitude"], 33.450701);

        let decoded: WireEnvelope = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn server_frames_with_numeric_ids_decode() {
        let decoded: WireEnvelope = decode_frame(
            r#"{
                "version": 1,
                "workspaceId": "ws-jeju",
                "event": "marked",
                "payload": {"id": 42, "tempId": "poi-temp-1", "latitude": 33.45, "longitude": 126.57, "status": "MARKED"}
            }"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode marked");
        match decoded.msg {
            WireMsg::Marked(record) => {
                assert_eq!(record.id, "42");
                assert_eq!(record.temp_id.as_deref(), Some("poi-temp-1"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let reorder: WireEnvelope = decode_frame(
            r#"{"workspaceId":"ws-jeju","event":"reorder","payload":{"planDayId":3,"poiIds":[1,"2",null]}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode reorder");
        assert_eq!(
            reorder.msg,
            WireMsg::Reorder(ReorderPayload {
                plan_day_id: Some("3".to_string()),
                poi_ids: vec!["1".to_string(), "2".to_string()],
            })
        );
    }

    #[test]
    fn snapshot_skips_undecodable_records() {
        let decoded: WireEnvelope = decode_frame(
            r#"{"workspaceId":"ws-jeju","event":"sync","payload":{"pois":[
                {"id":"p1","latitude":1.0,"longitude":2.0},
                {"latitude":1.0},
                {"id":"p2","latitude":"north"}
            ]}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode sync");
        match decoded.msg {
            WireMsg::Sync(snapshot) => {
                let ids: Vec<_> = snapshot.pois.iter().map(|poi| poi.id.as_str()).collect();
                assert_eq!(ids, vec!["p1"]);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let empty: WireEnvelope = decode_frame(
            r#"{"workspaceId":"ws-jeju","event":"flushed","payload":{"pois":null}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode flushed");
        assert_eq!(empty.msg, WireMsg::Flushed(SnapshotPayload::default()));
    }

    #[test]
    fn snapshot_carries_route_segments_per_day() {
        let decoded: WireEnvelope = decode_frame(
            r#"{"workspaceId":"ws-jeju","event":"sync","payload":{
                "pois":[],
                "connections":{"day-1":[
                    {"id":9,"prevPoiId":1,"nextPoiId":2,"planDayId":"day-1","distance":1200.5,"duration":300},
                    {"prevPoiId":1}
                ],"day-2":null}
            }}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode sync");
        let WireMsg::Sync(snapshot) = decoded.msg else {
            panic!("expected sync");
        };
        let day_one = &snapshot.connections["day-1"];
        assert_eq!(day_one.len(), 1);
        assert_eq!(day_one[0].id.as_deref(), Some("9"));
        assert_eq!(day_one[0].next_poi_id, "2");
        assert_eq!(day_one[0].duration, Some(300.0));
        assert!(snapshot.connections["day-2"].is_empty());

        let bare: WireEnvelope = decode_frame(
            r#"{"workspaceId":"ws","event":"flushed","payload":{"pois":[],"connections":[]}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode flushed");
        assert_eq!(bare.msg, WireMsg::Flushed(SnapshotPayload::default()));
    }

    #[test]
    fn disconnect_frames_round_through_the_codec() {
        let message = envelope(WireMsg::PoiDisconnect(PoiDisconnection {
            id: None,
            prev_poi_id: "1".to_string(),
            next_poi_id: "2".to_string(),
            plan_day_id: "day-1".to_string(),
        }));
        let frame = encode_frame(&message, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert!(frame.contains(r#""event":"poi:disconnect""#));
        assert!(!frame.contains(r#""id""#));

        let inbound: WireEnvelope = decode_frame(
            r#"{"workspaceId":"ws","event":"disconnected","payload":{"id":"seg-1","prevPoiId":1,"nextPoiId":2,"planDayId":3}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode disconnected");
        assert!(matches!(
            inbound.msg,
            WireMsg::Disconnected(ref seg) if seg.plan_day_id == "3" && seg.id.as_deref() == Some("seg-1")
        ));
    }

    #[test]
    fn presence_events_use_namespaced_names() {
        let hover = envelope(WireMsg::PoiHover(HoverPayload {
            user_id: "user-1".to_string(),
            user_name: None,
            color: None,
            poi_id: Some("p1".to_string()),
        }));
        let frame = encode_frame(&hover, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert!(frame.contains(r#""event":"poi:hover""#));
        assert!(hover.msg.is_presence());
        assert_eq!(hover.msg.event_name(), "poi:hover");
        assert!(!WireMsg::Flush(WorkspacePayload {
            workspace_id: "ws".to_string()
        })
        .is_presence());
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let message = envelope(WireMsg::PlaceFocused(FocusedPayload {
            user_id: Some("user-1".to_string()),
            places: vec![serde_json::json!({"blob": "x".repeat(128)})],
        }));
        let result = encode_frame(&message, 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn version_field_accepts_string_number_and_missing() {
        for raw in [
            r#"{"version":"1","workspaceId":"ws","event":"joined","payload":{"workspaceId":"ws"}}"#,
            r#"{"version":1,"workspaceId":"ws","event":"joined","payload":{"workspaceId":"ws"}}"#,
            r#"{"workspaceId":"ws","event":"joined","payload":{"workspaceId":"ws"}}"#,
        ] {
            let decoded: WireEnvelope =
                decode_frame(raw, DEFAULT_MAX_FRAME_BYTES).expect("decode joined");
            assert_eq!(decoded.version, ProtocolVersion::CURRENT);
        }
    }

    #[test]
    fn unknown_events_are_decode_errors() {
        let result: Result<WireEnvelope, _> = decode_frame(
            r#"{"workspaceId":"ws","event":"teleport","payload":{}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        );
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }
}
