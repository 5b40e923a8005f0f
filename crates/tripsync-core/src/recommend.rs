//! Interpretation of AI tool calls that suggest places.
//!
//! Tool output arrives in several historical shapes. Each shape is a variant
//! of [`ToolOutput`]; anything else lands in an explicit fallback branch.

use crate::{deserialize_id, PoiDraft};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RECOMMENDATION_TOOLS: [&str; 3] = [
    "recommend_places_by_all_users",
    "recommend_nearby_places",
    "recommend_popular_places_in_region",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub tool_output: Value,
    #[serde(default)]
    pub frontend_actions: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedPlace {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, alias = "image_url")]
    pub image_url: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "recommendation_reason")]
    pub recommendation_reason: Option<String>,
}

impl RecommendedPlace {
    pub fn to_draft(&self) -> PoiDraft {
        PoiDraft {
            place_id: Some(self.id.clone()),
            latitude: self.latitude,
            longitude: self.longitude,
            address: self.address.clone(),
            place_name: Some(self.title.clone()),
            category_name: self.category.clone(),
        }
    }
}

/// The shapes a tool's output has been observed in.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// A bare array of places.
    PlaceList(Vec<Value>),
    /// `{ "data": { "places": [...] } }`
    Wrapped(Vec<Value>),
    /// JSON that arrived as a string, possibly with single quotes.
    Encoded(Value),
    Text(String),
    Unrecognised,
}

impl ToolOutput {
    pub fn classify(output: &Value) -> Self {
        match output {
            Value::Array(items) => ToolOutput::PlaceList(items.clone()),
            Value::Object(map) => match map
                .get("data")
                .and_then(|data| data.get("places"))
                .and_then(Value::as_array)
            {
                Some(items) => ToolOutput::Wrapped(items.clone()),
                None => ToolOutput::Unrecognised,
            },
            Value::String(raw) => match decode_embedded_json(raw) {
                Some(value) => ToolOutput::Encoded(value),
                None => ToolOutput::Text(raw.clone()),
            },
            _ => ToolOutput::Unrecognised,
        }
    }

    pub fn places(&self) -> Vec<RecommendedPlace> {
        match self {
            ToolOutput::PlaceList(items) | ToolOutput::Wrapped(items) => parse_places(items),
            ToolOutput::Encoded(value) => match ToolOutput::classify(value) {
                ToolOutput::PlaceList(items) | ToolOutput::Wrapped(items) => parse_places(&items),
                _ => Vec::new(),
            },
            ToolOutput::Text(_) | ToolOutput::Unrecognised => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Places(Vec<RecommendedPlace>),
    Message(String),
    Ignored,
}

pub fn is_recommendation_tool(name: &str) -> bool {
    RECOMMENDATION_TOOLS.contains(&name)
}

pub fn interpret_tool_call(call: &ToolCall) -> ToolOutcome {
    let output = ToolOutput::classify(&call.tool_output);
    if is_recommendation_tool(&call.tool_name) {
        let places = output.places();
        if !places.is_empty() {
            return ToolOutcome::Places(places);
        }
    }
    match output {
        ToolOutput::Text(text) if !text.trim().is_empty() => ToolOutcome::Message(text),
        _ => ToolOutcome::Ignored,
    }
}

fn decode_embedded_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if !(trimmed.starts_with('[') || trimmed.starts_with('{')) {
        return None;
    }
    serde_json::from_str(trimmed)
        .or_else(|_| serde_json::from_str(&trimmed.replace('\'', "\"")))
        .ok()
}

fn parse_places(items: &[Value]) -> Vec<RecommendedPlace> {
    items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
}
