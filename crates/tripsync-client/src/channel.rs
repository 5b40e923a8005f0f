//! Websocket plumbing between a [`SyncSession`] and the workspace server.

use crate::session::SyncSession;
use crate::SyncError;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{Sink, SinkExt, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use tripsync_core::protocol::{decode_frame, encode_frame, ProtocolVersion, WireEnvelope, WireMsg};
use url::Url;
use uuid::Uuid;

/// A local action queued for the task that owns the session.
pub type SessionCommand = Box<dyn FnOnce(&mut SyncSession, DateTime<Utc>) + Send>;

/// Wraps messages into envelopes for one workspace and back.
#[derive(Debug, Clone)]
pub struct ChannelAdapter {
    workspace_id: String,
    max_frame_bytes: usize,
}

impl ChannelAdapter {
    pub fn new(workspace_id: impl Into<String>, max_frame_bytes: usize) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            max_frame_bytes,
        }
    }

    pub fn envelope(&self, msg: WireMsg, sender_id: &str, now: DateTime<Utc>) -> WireEnvelope {
        WireEnvelope {
            version: ProtocolVersion::CURRENT,
            workspace_id: self.workspace_id.clone(),
            sender_id: sender_id.to_string(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            request_id: Some(Uuid::new_v4().to_string()),
            msg,
        }
    }

    pub fn encode(&self, msg: WireMsg, sender_id: &str, now: DateTime<Utc>) -> Result<String, SyncError> {
        let envelope = self.envelope(msg, sender_id, now);
        Ok(encode_frame(&envelope, self.max_frame_bytes)?)
    }

    pub fn decode(&self, text: &str) -> Result<WireEnvelope, SyncError> {
        Ok(decode_frame(text, self.max_frame_bytes)?)
    }
}

/// Drives `session` over a websocket until the command sender is dropped.
///
/// Connection failures are retried with doubling backoff; every reconnect
/// re-joins the workspace and the session resyncs from the next snapshot.
/// Commands and ticks keep running while offline.
pub async fn run_channel(
    url: Url,
    mut session: SyncSession,
    mut commands: mpsc::Receiver<SessionCommand>,
) -> SyncSession {
    let adapter = ChannelAdapter::new(session.workspace_id(), session.config().max_frame_bytes);
    let mut ticker = tokio::time::interval(session.config().tick_interval);
    let mut backoff = Duration::from_secs(1);

    loop {
        let (mut ws, _) = match connect_async(url.clone()).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "channel_connect_error", url = %url, error = %err);
                if !wait_offline(backoff, &mut session, &mut commands, &mut ticker).await {
                    return session;
                }
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = Duration::from_secs(1);
        info!(event = "channel_connected", url = %url);
        session.on_connected(Utc::now());

        let mut closing = false;
        loop {
            if let Err(err) = flush_outbound(&adapter, &mut ws, &mut session).await {
                warn!(event = "channel_send_error", error = %err);
                break;
            }
            if closing {
                break;
            }
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => match adapter.decode(&text) {
                        Ok(envelope) => session.handle_envelope(envelope, Utc::now()),
                        Err(err) => warn!(event = "frame_dropped", error = %err),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "channel_read_error", error = %err);
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => command(&mut session, Utc::now()),
                    None => {
                        session.leave();
                        closing = true;
                    }
                },
                _ = ticker.tick() => session.tick(Utc::now()),
            }
        }

        let _ = ws.close(None).await;
        session.on_disconnected();
        if closing {
            info!(event = "channel_closed", workspace_id = %session.workspace_id());
            return session;
        }
    }
}

async fn flush_outbound<S>(adapter: &ChannelAdapter, ws: &mut S, session: &mut SyncSession) -> Result<(), SyncError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let sender_id = session
        .identity()
        .map(|identity| identity.user_id.clone())
        .unwrap_or_default();
    for msg in session.drain_outbound() {
        let kind = msg.event_name();
        match adapter.encode(msg, &sender_id, Utc::now()) {
            Ok(frame) => {
                ws.send(Message::Text(frame))
                    .await
                    .map_err(|err| SyncError::Transport(err.to_string()))?;
                debug!(event = "frame_sent", kind);
            }
            Err(err) => warn!(event = "frame_encode_failed", kind, error = %err),
        }
    }
    Ok(())
}

/// Keeps serving commands and ticks for `delay`. Returns false once the
/// command sender is gone.
async fn wait_offline(
    delay: Duration,
    session: &mut SyncSession,
    commands: &mut mpsc::Receiver<SessionCommand>,
    ticker: &mut Interval,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(command) => {
                    command(session, Utc::now());
                    session.drain_outbound();
                }
                None => return false,
            },
            _ = ticker.tick() => session.tick(Utc::now()),
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > Duration::from_secs(10) {
        Duration::from_secs(10)
    } else {
        next
    }
}
