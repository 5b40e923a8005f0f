pub mod channel;
pub mod config;
pub mod intents;
pub mod ordering;
pub mod presence;
pub mod reconcile;
pub mod recovery;
pub mod routes;
pub mod session;
pub mod store;

pub use channel::{run_channel, ChannelAdapter, SessionCommand};
pub use config::SyncConfig;
pub use intents::{IntentKind, IntentLedger, PendingIntent};
pub use presence::PresenceRelay;
pub use recovery::{DegradedReason, RecoveryAction, RecoveryController, SyncPhase};
pub use routes::RouteTable;
pub use session::{Notice, SyncSession};
pub use store::EntityStore;

use thiserror::Error;
use tripsync_core::protocol::FrameError;
use tripsync_core::PoiId;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no authenticated identity; sign in before editing the plan")]
    MissingIdentity,
    #[error("unknown poi: {0}")]
    UnknownPoi(PoiId),
    #[error("unknown plan day: {0}")]
    UnknownPlanDay(String),
    #[error("poi {0} is read-only")]
    ReadOnly(PoiId),
    #[error("poi {0} is not confirmed yet")]
    Unconfirmed(PoiId),
    #[error("invalid geometry: latitude {latitude}, longitude {longitude}")]
    InvalidGeometry { latitude: f64, longitude: f64 },
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("transport error: {0}")]
    Transport(String),
}
