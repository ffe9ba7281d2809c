//! Reconnection Controller
//!
//! Drives `Connected -> Disconnected -> Backoff -> Connecting -> Connected`
//! with a terminal `Abandoned` state once the attempt budget is spent.
//!
//! Delay policy:
//! - room reset: uniform in `[room_reset_min_ms, room_reset_max_ms]`, flat
//! - otherwise: full jitter, `random() * min(max_ms, base_ms * 2^attempt)`
//!
//! A connection that stays up for `stable_reset_ms` resets the attempt
//! counter.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::env_or;

/// WebSocket close code the server uses to cycle a room ("try again later").
pub const ROOM_RESET_CLOSE_CODE: u16 = 1013;

/// Backoff configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Base delay for exponential backoff.
    pub base_ms: u64,
    /// Cap for exponential backoff.
    pub max_ms: u64,
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Uptime after which the attempt counter resets.
    pub stable_reset_ms: u64,
    /// Lower bound of the room-reset delay.
    pub room_reset_min_ms: u64,
    /// Upper bound of the room-reset delay.
    pub room_reset_max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 30_000,
            max_attempts: 10,
            stable_reset_ms: 10_000,
            room_reset_min_ms: 5_000,
            room_reset_max_ms: 15_000,
        }
    }
}

impl BackoffConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_ms: env_or("RECONNECT_BASE_MS", defaults.base_ms),
            max_ms: env_or("RECONNECT_MAX_MS", defaults.max_ms),
            max_attempts: env_or("RECONNECT_MAX_ATTEMPTS", defaults.max_attempts),
            stable_reset_ms: env_or("RECONNECT_STABLE_RESET_MS", defaults.stable_reset_ms),
            room_reset_min_ms: env_or("ROOM_RESET_MIN_MS", defaults.room_reset_min_ms),
            room_reset_max_ms: env_or("ROOM_RESET_MAX_MS", defaults.room_reset_max_ms),
        }
    }
}

/// Why the connection went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Ordinary network drop.
    Close,
    /// Server forcibly cycled the room.
    RoomReset,
    /// Client-initiated reconnect after suspend.
    Resume,
}

/// Does a close frame signal a room reset?
///
/// True for code 1013, or a reason of "room reset" in any case with an
/// optional trailing period.
pub fn is_room_reset_close(code: Option<u16>, reason: &str) -> bool {
    if code == Some(ROOM_RESET_CLOSE_CODE) {
        return true;
    }
    let reason = reason.trim();
    let reason = reason.strip_suffix('.').unwrap_or(reason);
    reason.eq_ignore_ascii_case("room reset")
}

/// Classify a close frame.
pub fn classify_close(code: Option<u16>, reason: &str) -> CloseReason {
    if is_room_reset_close(code, reason) {
        CloseReason::RoomReset
    } else {
        CloseReason::Close
    }
}

/// Delay before retry number `attempt` (0-based).
pub fn compute_backoff_delay<R: Rng + ?Sized>(
    attempt: u32,
    reason: CloseReason,
    config: &BackoffConfig,
    rng: &mut R,
) -> Duration {
    if reason == CloseReason::RoomReset {
        let low = config.room_reset_min_ms.min(config.room_reset_max_ms);
        let high = config.room_reset_min_ms.max(config.room_reset_max_ms);
        return Duration::from_millis(rng.gen_range(low..=high));
    }

    let growth = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let ceiling = config.base_ms.saturating_mul(growth).min(config.max_ms);
    let jitter: f64 = rng.gen();
    Duration::from_millis((jitter * ceiling as f64).floor() as u64)
}

/// Has the attempt budget been spent?
pub fn should_abandon_reconnect(attempt: u32, max_attempts: u32) -> bool {
    attempt >= max_attempts
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Controller state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectState {
    /// Transport is up.
    Connected,
    /// Transport dropped; no retry scheduled yet.
    Disconnected,
    /// Waiting out a retry delay.
    Backoff,
    /// A connection attempt is in flight.
    Connecting,
    /// Attempt budget spent. Terminal.
    Abandoned,
    /// The client left on purpose. Terminal.
    Cancelled,
}

/// Transient retry bookkeeping, reset once a connection is stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffState {
    /// Retries scheduled since the last stable connection.
    pub attempt: u32,
    /// Most recent close reason.
    pub reason: CloseReason,
    /// Most recent close code.
    pub last_close_code: Option<u16>,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            attempt: 0,
            reason: CloseReason::Close,
            last_close_code: None,
        }
    }
}

/// What to do after a drop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then reconnect.
    Retry {
        /// Delay before the attempt.
        delay: Duration,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Give up; surface a terminal disconnect.
    Abandon {
        /// Attempts made.
        attempts: u32,
    },
    /// The controller was cancelled.
    Cancelled,
}

/// Reconnection state machine.
#[derive(Debug)]
pub struct ReconnectController {
    config: BackoffConfig,
    state: ReconnectState,
    backoff: BackoffState,
    connected_at: Option<Instant>,
    cancel_tx: watch::Sender<bool>,
}

impl ReconnectController {
    /// Create a controller in the `Disconnected` state.
    pub fn new(config: BackoffConfig) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            config,
            state: ReconnectState::Disconnected,
            backoff: BackoffState::default(),
            connected_at: None,
            cancel_tx,
        }
    }

    /// Current state.
    pub fn state(&self) -> ReconnectState {
        self.state
    }

    /// Current retry bookkeeping.
    pub fn backoff(&self) -> BackoffState {
        self.backoff
    }

    /// Config in use.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Receiver that flips to `true` on [`cancel`](Self::cancel).
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, ReconnectState::Abandoned | ReconnectState::Cancelled)
    }

    /// A connection attempt started.
    pub fn on_connecting(&mut self) {
        if !self.is_terminal() {
            self.state = ReconnectState::Connecting;
        }
    }

    /// The transport came up.
    pub fn on_connected(&mut self, now: Instant) {
        if self.is_terminal() {
            return;
        }
        self.state = ReconnectState::Connected;
        self.connected_at = Some(now);
    }

    /// Reset the attempt counter if the connection has been up long enough.
    pub fn note_stable(&mut self, now: Instant) -> bool {
        let Some(since) = self.connected_at else {
            return false;
        };
        if self.state != ReconnectState::Connected
            || now.saturating_duration_since(since) < Duration::from_millis(self.config.stable_reset_ms)
        {
            return false;
        }
        if self.backoff.attempt > 0 {
            debug!(attempts = self.backoff.attempt, "Connection stable, resetting backoff");
        }
        self.backoff.attempt = 0;
        true
    }

    /// The transport closed.
    pub fn on_close<R: Rng + ?Sized>(
        &mut self,
        code: Option<u16>,
        reason: &str,
        now: Instant,
        rng: &mut R,
    ) -> ReconnectDecision {
        let close_reason = classify_close(code, reason);
        self.backoff.last_close_code = code;
        self.schedule(close_reason, now, rng)
    }

    /// The client is resuming after a suspend.
    pub fn on_resume<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> ReconnectDecision {
        self.schedule(CloseReason::Resume, now, rng)
    }

    fn schedule<R: Rng + ?Sized>(&mut self, reason: CloseReason, now: Instant, rng: &mut R) -> ReconnectDecision {
        if self.state == ReconnectState::Cancelled {
            return ReconnectDecision::Cancelled;
        }
        if self.state == ReconnectState::Abandoned {
            return ReconnectDecision::Abandon {
                attempts: self.backoff.attempt,
            };
        }

        self.note_stable(now);
        self.connected_at = None;
        self.state = ReconnectState::Disconnected;
        self.backoff.reason = reason;

        if should_abandon_reconnect(self.backoff.attempt, self.config.max_attempts) {
            warn!(attempts = self.backoff.attempt, "Reconnect attempts exhausted, giving up");
            self.state = ReconnectState::Abandoned;
            return ReconnectDecision::Abandon {
                attempts: self.backoff.attempt,
            };
        }

        let delay = compute_backoff_delay(self.backoff.attempt, reason, &self.config, rng);
        self.backoff.attempt += 1;
        self.state = ReconnectState::Backoff;
        info!(
            attempt = self.backoff.attempt,
            delay_ms = delay.as_millis() as u64,
            ?reason,
            "Scheduling reconnect"
        );
        ReconnectDecision::Retry {
            delay,
            attempt: self.backoff.attempt,
        }
    }

    /// Stop retrying; the client is leaving the session.
    pub fn cancel(&mut self) {
        self.state = ReconnectState::Cancelled;
        let _ = self.cancel_tx.send(true);
    }
}

/// Sleep for `delay` unless cancelled first. Returns false when cancelled.
pub async fn wait_retry(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = cancel.changed() => match changed {
            Ok(()) => !*cancel.borrow(),
            // Controller dropped; nobody can cancel any more
            Err(_) => {
                tokio::time::sleep(delay).await;
                true
            }
        },
    }
}

// =============================================================================
// TESTS
// =============================================================================
