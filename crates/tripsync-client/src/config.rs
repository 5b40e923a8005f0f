use chrono::Duration;
use tripsync_core::protocol::DEFAULT_MAX_FRAME_BYTES;

pub const DEFAULT_COORDINATE_TOLERANCE_DEG: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long SYNCING or RESYNCING waits for a full snapshot.
    pub snapshot_timeout: Duration,
    pub resync_max_attempts: u32,
    pub resync_base_backoff: Duration,
    pub resync_max_backoff: Duration,
    /// Unconfirmed intents older than this are purged.
    pub intent_ttl: Duration,
    pub coordinate_tolerance_deg: f64,
    pub cursor_throttle: Duration,
    pub cursor_ttl: Duration,
    pub hover_ttl: Duration,
    pub ripple_ttl: Duration,
    pub tick_interval: std::time::Duration,
    pub max_frame_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_timeout: Duration::seconds(10),
            resync_max_attempts: 3,
            resync_base_backoff: Duration::seconds(1),
            resync_max_backoff: Duration::seconds(10),
            intent_ttl: Duration::seconds(120),
            coordinate_tolerance_deg: DEFAULT_COORDINATE_TOLERANCE_DEG,
            cursor_throttle: Duration::milliseconds(50),
            cursor_ttl: Duration::seconds(30),
            hover_ttl: Duration::seconds(30),
            ripple_ttl: Duration::seconds(1),
            tick_interval: std::time::Duration::from_millis(250),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}
