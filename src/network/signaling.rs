//! Signaling Transport
//!
//! WebSocket link to the room's signaling server. Text frames are forwarded
//! to an event channel; drops are classified by close frame and fed to the
//! reconnection controller, which decides whether and when to redial.

use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::network::auth::ValidationError;
use crate::network::reconnect::{wait_retry, BackoffConfig, ReconnectController, ReconnectDecision};

/// Path segment every signaling URL ends in.
pub const SIGNAL_PATH: &str = "/signal";

/// Derive the signaling WebSocket URL from an HTTP(S) base URL.
///
/// `http` becomes `ws` and `https` becomes `wss`; `ws(s)` input is kept.
/// The signaling segment is appended once.
pub fn signaling_url(base: &str) -> Result<String, ValidationError> {
    let trimmed = base.trim().trim_end_matches('/');
    let (scheme, rest) = trimmed
        .split_once("://")
        .ok_or_else(|| ValidationError::InvalidBaseUrl(base.to_string()))?;
    let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(ValidationError::InvalidBaseUrl(base.to_string())),
    };
    if rest.is_empty() {
        return Err(ValidationError::InvalidBaseUrl(base.to_string()));
    }

    let mut url = format!("{ws_scheme}://{rest}");
    if !url.ends_with(SIGNAL_PATH) {
        url.push_str(SIGNAL_PATH);
    }
    Ok(url)
}

/// Signaling configuration.
#[derive(Clone, Debug)]
pub struct SignalingConfig {
    /// HTTP(S) base URL of the signaling server.
    pub base_url: String,
    /// Capacity of the event channel.
    pub channel_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".into(),
            channel_capacity: 256,
        }
    }
}

impl SignalingConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("SIGNALING_BASE_URL").unwrap_or(defaults.base_url),
            ..defaults
        }
    }
}

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Base URL was rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Reconnect budget spent. The only user-visible transport failure.
    #[error("signaling connection abandoned after {attempts} attempts")]
    Abandoned {
        /// Attempts made.
        attempts: u32,
    },
}

/// Events delivered to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Link established.
    Connected,
    /// Text frame from the server.
    Message(String),
    /// Link dropped.
    Disconnected {
        /// Close code, if a close frame arrived.
        code: Option<u16>,
        /// Close reason or error text.
        reason: String,
    },
}

/// How one connection ended.
enum LinkEnd {
    Closed { code: Option<u16>, reason: String },
    Shutdown,
}

/// Reconnecting signaling client.
pub struct SignalingClient {
    url: String,
    controller: ReconnectController,
    events: mpsc::Sender<SignalingEvent>,
    outgoing: mpsc::Receiver<String>,
}

impl SignalingClient {
    /// Create a client for `base_url`.
    pub fn new(
        base_url: &str,
        backoff: BackoffConfig,
        events: mpsc::Sender<SignalingEvent>,
        outgoing: mpsc::Receiver<String>,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            url: signaling_url(base_url)?,
            controller: ReconnectController::new(backoff),
            events,
            outgoing,
        })
    }

    /// Signaling URL in use.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect and keep reconnecting until shut down or abandoned.
    ///
    /// Returns `Ok(())` when `shutdown` flips to true (intentional leave).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        loop {
            self.controller.on_connecting();
            let (code, reason) = match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    info!(url = %self.url, "Signaling connected");
                    self.controller.on_connected(Instant::now());
                    let _ = self.events.send(SignalingEvent::Connected).await;

                    match self.pump(stream, &mut shutdown).await {
                        LinkEnd::Shutdown => {
                            self.controller.cancel();
                            return Ok(());
                        }
                        LinkEnd::Closed { code, reason } => (code, reason),
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Signaling connect failed");
                    (None, e.to_string())
                }
            };

            let _ = self
                .events
                .send(SignalingEvent::Disconnected {
                    code,
                    reason: reason.clone(),
                })
                .await;

            let decision = self
                .controller
                .on_close(code, &reason, Instant::now(), &mut rand::thread_rng());
            match decision {
                ReconnectDecision::Retry { delay, .. } => {
                    if !wait_retry(delay, &mut shutdown).await {
                        self.controller.cancel();
                        return Ok(());
                    }
                }
                ReconnectDecision::Abandon { attempts } => {
                    return Err(TransportError::Abandoned { attempts });
                }
                ReconnectDecision::Cancelled => return Ok(()),
            }
        }
    }

    async fn pump(
        &mut self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkEnd {
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.controller.note_stable(Instant::now());
                        if self.events.send(SignalingEvent::Message(text)).await.is_err() {
                            // Nobody is listening any more
                            return LinkEnd::Shutdown;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                            .unwrap_or((None, String::new()));
                        debug!(?code, %reason, "Signaling closed by server");
                        return LinkEnd::Closed { code, reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return LinkEnd::Closed { code: None, reason: e.to_string() };
                    }
                    None => {
                        return LinkEnd::Closed { code: None, reason: String::new() };
                    }
                },
                Some(text) = self.outgoing.recv() => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        return LinkEnd::Closed { code: None, reason: e.to_string() };
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return LinkEnd::Shutdown;
                    }
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
