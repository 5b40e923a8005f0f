//! Sync phase tracking and bounded full-resync.
//!
//! The controller never touches the store. It is polled with the current
//! time and answers with actions for the session to apply.

use crate::config::SyncConfig;
use chrono::{DateTime, Duration, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Offline,
    Syncing,
    Synced,
    Resyncing,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Offline => "offline",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Synced => "synced",
            SyncPhase::Resyncing => "resyncing",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedReason {
    /// No snapshot arrived after connecting; the plan is shown empty.
    SnapshotTimeout,
    /// Repeated resync requests went unanswered.
    ResyncExhausted { attempts: u32 },
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradedReason::SnapshotTimeout => f.write_str("no snapshot received in time"),
            DegradedReason::ResyncExhausted { attempts } => {
                write!(f, "resync failed after {attempts} attempts")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    RequestSnapshot,
    ClearStore,
    Degraded(DegradedReason),
}

#[derive(Debug)]
pub struct RecoveryController {
    phase: SyncPhase,
    snapshot_timeout: Duration,
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    backoff: Duration,
    attempts: u32,
    deadline: Option<DateTime<Utc>>,
    retry_at: Option<DateTime<Utc>>,
    degraded: Option<DegradedReason>,
}

impl RecoveryController {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            phase: SyncPhase::Offline,
            snapshot_timeout: config.snapshot_timeout,
            max_attempts: config.resync_max_attempts.max(1),
            base_backoff: config.resync_base_backoff,
            max_backoff: config.resync_max_backoff,
            backoff: config.resync_base_backoff,
            attempts: 0,
            deadline: None,
            retry_at: None,
            degraded: None,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn degraded(&self) -> Option<DegradedReason> {
        self.degraded
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_connect(&mut self, now: DateTime<Utc>) {
        self.phase = SyncPhase::Syncing;
        self.deadline = Some(now + self.snapshot_timeout);
        self.retry_at = None;
        self.attempts = 0;
        self.backoff = self.base_backoff;
    }

    pub fn on_disconnect(&mut self) {
        self.phase = SyncPhase::Offline;
        self.deadline = None;
        self.retry_at = None;
    }

    /// A full snapshot settles every phase. Returns true when it lifted a
    /// degraded state.
    pub fn on_snapshot(&mut self) -> bool {
        self.phase = SyncPhase::Synced;
        self.deadline = None;
        self.retry_at = None;
        self.attempts = 0;
        self.backoff = self.base_backoff;
        self.degraded.take().is_some()
    }

    /// Reports evidence of a missed event. Only a settled session starts a
    /// resync; anything raised while a snapshot is already due is absorbed.
    pub fn on_anomaly(&mut self, now: DateTime<Utc>) -> Vec<RecoveryAction> {
        if self.phase != SyncPhase::Synced {
            return Vec::new();
        }
        self.phase = SyncPhase::Resyncing;
        self.attempts = 1;
        self.backoff = self.base_backoff;
        self.deadline = Some(now + self.snapshot_timeout);
        self.retry_at = None;
        vec![RecoveryAction::RequestSnapshot]
    }

    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<RecoveryAction> {
        match self.phase {
            SyncPhase::Syncing => {
                if self.deadline.is_some_and(|deadline| now >= deadline) {
                    self.phase = SyncPhase::Synced;
                    self.deadline = None;
                    self.degraded = Some(DegradedReason::SnapshotTimeout);
                    return vec![
                        RecoveryAction::ClearStore,
                        RecoveryAction::Degraded(DegradedReason::SnapshotTimeout),
                    ];
                }
                Vec::new()
            }
            SyncPhase::Resyncing => self.poll_resync(now),
            SyncPhase::Offline | SyncPhase::Synced => Vec::new(),
        }
    }

    fn poll_resync(&mut self, now: DateTime<Utc>) -> Vec<RecoveryAction> {
        if let Some(retry_at) = self.retry_at {
            if now < retry_at {
                return Vec::new();
            }
            self.retry_at = None;
            self.attempts += 1;
            self.deadline = Some(now + self.snapshot_timeout);
            return vec![RecoveryAction::RequestSnapshot];
        }
        if !self.deadline.is_some_and(|deadline| now >= deadline) {
            return Vec::new();
        }
        self.deadline = None;
        if self.attempts >= self.max_attempts {
            let reason = DegradedReason::ResyncExhausted {
                attempts: self.attempts,
            };
            self.phase = SyncPhase::Synced;
            self.degraded = Some(reason);
            return vec![RecoveryAction::Degraded(reason)];
        }
        self.retry_at = Some(now + self.backoff);
        self.backoff = next_backoff(self.backoff, self.max_backoff);
        Vec::new()
    }
}

fn next_backoff(current: Duration, cap: Duration) -> Duration {
    let next = current + current;
    if next > cap {
        cap
    } else {
        next
    }
}
