use chrono::{DateTime, Utc};
use serde_json::Value;
use tripsync_client::{SyncError, SyncSession};
use tripsync_core::protocol::MapBounds;
use tripsync_core::recommend::{ToolCall, ToolOutcome};
use tripsync_core::{Container, PoiDraft, PoiId};

pub const HELP: &str = "\
commands:
  mark <lat> <lng> <name...>            mark a place into the unscheduled pool
  mark-to <day> <lat> <lng> <name...>   mark a place and schedule it on <day>
  unmark <id>
  move <id> <pool|day> [index]          move within or across containers
  schedule <id> <day>
  unschedule <id>
  reorder <pool|day> <id> [id...]
  connect <prev> <next> <day> [distance] [duration]
  disconnect <prev> <next> <day>
  focus <sw_lat> <sw_lng> <ne_lat> <ne_lng>
  cursor <lat> <lng>
  hover [id]
  click <lat> <lng>
  tool <json>                           feed an AI tool call
  add-recommended <day>                 add the last recommended places to <day>
  flush                                 request a full resync
  list                                  print the plan
  status
  help
  quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Mark { draft: PoiDraft },
    MarkTo { day: String, draft: PoiDraft },
    Unmark { id: PoiId },
    Move { id: PoiId, destination: Container, index: usize },
    Schedule { id: PoiId, day: String },
    Unschedule { id: PoiId },
    Reorder { container: Container, ids: Vec<PoiId> },
    Connect {
        prev: PoiId,
        next: PoiId,
        day: String,
        distance: Option<f64>,
        duration: Option<f64>,
    },
    Disconnect { prev: PoiId, next: PoiId, day: String },
    Focus { bounds: MapBounds },
    Cursor { latitude: f64, longitude: f64 },
    Hover { id: Option<PoiId> },
    Click { latitude: f64, longitude: f64 },
    Tool { call: ToolCall },
    AddRecommended { day: String },
    Flush,
    List,
    Status,
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();
    match verb {
        "mark" => Ok(Command::Mark {
            draft: parse_draft(&args)?,
        }),
        "mark-to" => {
            let (day, rest) = args.split_first().ok_or("usage: mark-to <day> <lat> <lng> <name...>")?;
            Ok(Command::MarkTo {
                day: day.to_string(),
                draft: parse_draft(rest)?,
            })
        }
        "unmark" => Ok(Command::Unmark {
            id: arg(&args, 0, "id")?.to_string(),
        }),
        "move" => Ok(Command::Move {
            id: arg(&args, 0, "id")?.to_string(),
            destination: parse_container(arg(&args, 1, "destination")?),
            index: match args.get(2) {
                Some(raw) => raw.parse().map_err(|_| format!("invalid index: {raw}"))?,
                None => usize::MAX,
            },
        }),
        "schedule" => Ok(Command::Schedule {
            id: arg(&args, 0, "id")?.to_string(),
            day: arg(&args, 1, "day")?.to_string(),
        }),
        "unschedule" => Ok(Command::Unschedule {
            id: arg(&args, 0, "id")?.to_string(),
        }),
        "reorder" => {
            let container = parse_container(arg(&args, 0, "container")?);
            if args.len() < 2 {
                return Err("reorder needs at least one id".to_string());
            }
            Ok(Command::Reorder {
                container,
                ids: args[1..].iter().map(|id| id.to_string()).collect(),
            })
        }
        "connect" => Ok(Command::Connect {
            prev: arg(&args, 0, "prev")?.to_string(),
            next: arg(&args, 1, "next")?.to_string(),
            day: arg(&args, 2, "day")?.to_string(),
            distance: args.get(3).map(|raw| parse_f64(raw)).transpose()?,
            duration: args.get(4).map(|raw| parse_f64(raw)).transpose()?,
        }),
        "disconnect" => Ok(Command::Disconnect {
            prev: arg(&args, 0, "prev")?.to_string(),
            next: arg(&args, 1, "next")?.to_string(),
            day: arg(&args, 2, "day")?.to_string(),
        }),
        "focus" => Ok(Command::Focus {
            bounds: MapBounds {
                south_west_lat: parse_f64(arg(&args, 0, "sw_lat")?)?,
                south_west_lng: parse_f64(arg(&args, 1, "sw_lng")?)?,
                north_east_lat: parse_f64(arg(&args, 2, "ne_lat")?)?,
                north_east_lng: parse_f64(arg(&args, 3, "ne_lng")?)?,
            },
        }),
        "cursor" => Ok(Command::Cursor {
            latitude: parse_f64(arg(&args, 0, "lat")?)?,
            longitude: parse_f64(arg(&args, 1, "lng")?)?,
        }),
        "hover" => Ok(Command::Hover {
            id: args.first().map(|id| id.to_string()),
        }),
        "click" => Ok(Command::Click {
            latitude: parse_f64(arg(&args, 0, "lat")?)?,
            longitude: parse_f64(arg(&args, 1, "lng")?)?,
        }),
        "tool" => {
            let raw = line.trim_start().trim_start_matches("tool").trim();
            let call: ToolCall =
                serde_json::from_str(raw).map_err(|err| format!("invalid tool call: {err}"))?;
            Ok(Command::Tool { call })
        }
        "add-recommended" => Ok(Command::AddRecommended {
            day: arg(&args, 0, "day")?.to_string(),
        }),
        "flush" => Ok(Command::Flush),
        "list" => Ok(Command::List),
        "status" => Ok(Command::Status),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command: {other}")),
    }
}

/// Runs one command against the session and returns the text to print.
pub fn apply(session: &mut SyncSession, command: Command, now: DateTime<Utc>) -> Result<String, SyncError> {
    match command {
        Command::Mark { draft } => session.mark(draft).map(|id| format!("marked {id}")),
        Command::MarkTo { day, draft } => session
            .mark_and_schedule(draft, &day, now)
            .map(|id| format!("marked {id} for {day}")),
        Command::Unmark { id } => session.unmark(&id, now).map(|_| format!("unmarked {id}")),
        Command::Move {
            id,
            destination,
            index,
        } => session
            .move_poi(&id, &destination, index, now)
            .map(|_| format!("moved {id} to {destination}")),
        Command::Schedule { id, day } => session
            .schedule(&id, &day, now)
            .map(|_| format!("scheduled {id} on {day}")),
        Command::Unschedule { id } => session
            .unschedule(&id, now)
            .map(|_| format!("unscheduled {id}")),
        Command::Reorder { container, ids } => session
            .reorder(&container, &ids)
            .map(|_| format!("reordered {container}")),
        Command::Connect {
            prev,
            next,
            day,
            distance,
            duration,
        } => session
            .connect_pois(&prev, &next, &day, distance, duration)
            .map(|_| format!("connected {prev} -> {next}")),
        Command::Disconnect { prev, next, day } => session
            .disconnect_pois(&prev, &next, &day)
            .map(|_| format!("disconnected {prev} -> {next}")),
        Command::Focus { bounds } => session.focus_place(bounds).map(|_| "focus sent".to_string()),
        Command::Cursor {
            latitude,
            longitude,
        } => session.move_cursor(latitude, longitude, now).map(|_| String::new()),
        Command::Hover { id } => session.hover_poi(id.as_deref()).map(|_| String::new()),
        Command::Click {
            latitude,
            longitude,
        } => session.click_map(latitude, longitude, now).map(|_| String::new()),
        Command::Tool { call } => Ok(match session.apply_tool_call(&call) {
            ToolOutcome::Places(places) => places
                .iter()
                .map(|place| format!("recommended {} ({})", place.title, place.id))
                .collect::<Vec<_>>()
                .join("\n"),
            ToolOutcome::Message(text) => text,
            ToolOutcome::Ignored => "tool output ignored".to_string(),
        }),
        Command::AddRecommended { day } => {
            let places = session.recommendations().to_vec();
            let report = session.add_recommended_to_day(&day, &places, now)?;
            let mut out = format!("added {} place(s) to {day}", report.added.len());
            if let Some(message) = report.message {
                out.push('\n');
                out.push_str(&message);
            }
            Ok(out)
        }
        Command::Flush => session.flush().map(|_| "flush requested".to_string()),
        Command::List => Ok(render_plan(session)),
        Command::Status => Ok(render_status(session)),
        Command::Help => Ok(HELP.to_string()),
        Command::Quit => Ok(String::new()),
    }
}

pub fn render_plan(session: &SyncSession) -> String {
    let store = session.store();
    let mut containers: Vec<Container> = store
        .list()
        .iter()
        .filter_map(|poi| poi.container())
        .collect();
    containers.sort();
    containers.dedup();

    let mut lines = Vec::new();
    for container in containers {
        lines.push(format!("[{container}]"));
        for poi in store.container(&container) {
            let pending = if poi.is_persisted { "" } else { " (pending)" };
            lines.push(format!("  {:>3} {} {}{pending}", poi.sequence, poi.id, poi.label()));
        }
    }
    if lines.is_empty() {
        lines.push("plan is empty".to_string());
    }
    lines.join("\n")
}

pub fn render_status(session: &SyncSession) -> String {
    let value: Value = serde_json::json!({
        "workspaceId": session.workspace_id(),
        "phase": session.phase().as_str(),
        "connected": session.is_connected(),
        "degraded": session.is_degraded(),
        "pois": session.store().len(),
        "pendingIntents": session.ledger().len(),
        "revision": session.store().revision(),
    });
    value.to_string()
}

fn parse_container(raw: &str) -> Container {
    match raw {
        "pool" | "unscheduled" => Container::Unscheduled,
        day => Container::Day(day.to_string()),
    }
}

fn parse_draft(args: &[&str]) -> Result<PoiDraft, String> {
    let latitude = parse_f64(arg(args, 0, "lat")?)?;
    let longitude = parse_f64(arg(args, 1, "lng")?)?;
    if args.len() < 3 {
        return Err("missing place name".to_string());
    }
    Ok(PoiDraft::new(latitude, longitude, args[2..].join(" ")))
}

fn parse_f64(raw: &str) -> Result<f64, String> {
    raw.parse().map_err(|_| format!("not a number: {raw}"))
}

fn arg<'a>(args: &[&'a str], idx: usize, name: &str) -> Result<&'a str, String> {
    args.get(idx).copied().ok_or_else(|| format!("missing {name}"))
}
