// src/connectors/feed.rs
use crate::connectors::messages::{
    AuthReply, AuthRequest, AUTH_OK, AUTH_REJECTED, PING_FRAME, PONG_FRAME,
};
use crate::error::FeedError;
use crate::utils::backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Connection survives this long → the backoff schedule starts over.
const STABLE_CONNECTION_THRESHOLD: Duration = Duration::from_secs(300);

/// Everything the engine receives from the connection task, on one ordered
/// channel — messages and lifecycle transitions interleave in real order.
#[derive(Debug)]
pub enum FeedEvent {
    Connected,
    Message {
        raw: String,
        received_at: DateTime<Utc>,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Disconnected {
        reason: String,
    },
}

/// Lifecycle of the broadcaster connection:
/// Connected → Disconnected → Reconnecting(attempt, delay) → Connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
}

impl ConnState {
    pub fn on_established(self) -> ConnState {
        ConnState::Connected
    }

    pub fn on_drop(self) -> ConnState {
        ConnState::Disconnected
    }

    pub fn on_retry_scheduled(self, attempt: u32, delay: Duration) -> ConnState {
        ConnState::Reconnecting { attempt, delay }
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub auth_secret: String,
    pub client_id: String,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
}

impl FeedConfig {
    pub fn new(url: String, auth_secret: String, client_id: String) -> Self {
        Self {
            url,
            auth_secret,
            client_id,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// How a single connection session ended.
enum SessionEnd {
    /// Shutdown was requested while the session ran.
    Shutdown,
    /// The engine side of the event channel is gone; nothing left to do.
    ReceiverGone,
    /// The connection dropped. `connected_for` is None when the handshake
    /// never completed.
    Dropped {
        reason: FeedError,
        connected_for: Option<Duration>,
    },
}

/// Owns the persistent socket to the broadcaster: handshake, heartbeats,
/// staleness detection and reconnection with backoff. Decoding happens on
/// the engine side; this task only moves frames.
pub struct FeedConnection {
    config: FeedConfig,
    events: mpsc::Sender<FeedEvent>,
    shutdown: watch::Receiver<bool>,
    state: ConnState,
}

impl FeedConnection {
    pub fn new(
        config: FeedConfig,
        events: mpsc::Sender<FeedEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            events,
            shutdown,
            state: ConnState::Disconnected,
        }
    }

    /// Run until shutdown. Returns an error only on fatal authentication
    /// failure — the operator has to fix the secret, retrying is pointless.
    pub async fn run(&mut self) -> Result<(), FeedError> {
        let mut backoff = ExponentialBackoff::default();

        loop {
            if *self.shutdown.borrow() {
                info!("shutdown requested, feed task exiting");
                return Ok(());
            }

            match self.run_session().await? {
                SessionEnd::Shutdown => {
                    info!("feed connection closed for shutdown");
                    return Ok(());
                }
                SessionEnd::ReceiverGone => {
                    info!("engine receiver dropped, feed task exiting");
                    return Ok(());
                }
                SessionEnd::Dropped {
                    reason,
                    connected_for,
                } => {
                    self.state = self.state.clone().on_drop();
                    if self
                        .events
                        .send(FeedEvent::Disconnected {
                            reason: reason.to_string(),
                        })
                        .await
                        .is_err()
                    {
                        info!("engine receiver dropped, feed task exiting");
                        return Ok(());
                    }

                    if connected_for.map_or(false, |d| d >= STABLE_CONNECTION_THRESHOLD) {
                        info!("connection was stable, resetting backoff");
                        backoff.reset();
                    }

                    let delay = backoff.next_delay();
                    self.state = self
                        .state
                        .clone()
                        .on_retry_scheduled(backoff.attempt(), delay);
                    warn!(
                        error = %reason,
                        state = ?self.state,
                        attempt = backoff.attempt(),
                        delay_secs = delay.as_secs_f64(),
                        "connection lost, reconnecting"
                    );
                    if self
                        .events
                        .send(FeedEvent::Reconnecting {
                            attempt: backoff.attempt(),
                            delay,
                        })
                        .await
                        .is_err()
                    {
                        info!("engine receiver dropped, feed task exiting");
                        return Ok(());
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => {
                            if *self.shutdown.borrow() {
                                info!("shutdown requested during backoff");
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    async fn run_session(&mut self) -> Result<SessionEnd, FeedError> {
        info!(url = %self.config.url, "connecting to broadcaster");

        let ws_stream = tokio::select! {
            biased;

            _ = self.shutdown.changed() => {
                if *self.shutdown.borrow() {
                    return Ok(SessionEnd::Shutdown);
                }
                return Ok(SessionEnd::Dropped {
                    reason: FeedError::Network("connection attempt interrupted".to_string()),
                    connected_for: None,
                });
            }

            result = tokio::time::timeout(
                self.config.connect_timeout,
                connect_async(self.config.url.as_str()),
            ) => match result {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(e)) => {
                    return Ok(SessionEnd::Dropped {
                        reason: FeedError::Network(e.to_string()),
                        connected_for: None,
                    })
                }
                Err(_) => {
                    return Ok(SessionEnd::Dropped {
                        reason: FeedError::Network("connect timeout".to_string()),
                        connected_for: None,
                    })
                }
            },
        };

        let (mut write, mut read) = ws_stream.split();

        // Shared-secret handshake before any traffic is accepted.
        let auth = AuthRequest::new(&self.config.auth_secret, &self.config.client_id);
        let frame = match serde_json::to_string(&auth) {
            Ok(frame) => frame,
            Err(e) => {
                return Ok(SessionEnd::Dropped {
                    reason: FeedError::Network(format!("failed to encode auth frame: {e}")),
                    connected_for: None,
                })
            }
        };
        if let Err(e) = write.send(Message::Text(frame)).await {
            return Ok(SessionEnd::Dropped {
                reason: FeedError::Network(e.to_string()),
                connected_for: None,
            });
        }

        let ack = tokio::time::timeout(self.config.handshake_timeout, read.next()).await;
        match ack {
            Err(_) => {
                return Ok(SessionEnd::Dropped {
                    reason: FeedError::Network("handshake timeout".to_string()),
                    connected_for: None,
                })
            }
            Ok(None) => {
                return Ok(SessionEnd::Dropped {
                    reason: FeedError::Closed,
                    connected_for: None,
                })
            }
            Ok(Some(Err(e))) => {
                return Ok(SessionEnd::Dropped {
                    reason: FeedError::Network(e.to_string()),
                    connected_for: None,
                })
            }
            Ok(Some(Ok(msg))) => {
                let text = match msg.to_text() {
                    Ok(text) => text,
                    Err(_) => {
                        return Ok(SessionEnd::Dropped {
                            reason: FeedError::Network("non-text handshake reply".to_string()),
                            connected_for: None,
                        })
                    }
                };
                match classify_auth_reply(text) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "authentication failed - check auth_secret");
                        return Err(e);
                    }
                    Err(e) => {
                        return Ok(SessionEnd::Dropped {
                            reason: e,
                            connected_for: None,
                        })
                    }
                }
            }
        }

        info!("✅ connected to broadcaster");
        self.state = self.state.clone().on_established();
        if self.events.send(FeedEvent::Connected).await.is_err() {
            return Ok(SessionEnd::ReceiverGone);
        }

        let connected_at = Instant::now();
        let mut last_traffic = Instant::now();
        let mut ping_timer = tokio::time::interval(self.config.ping_interval);
        // First tick of an interval completes immediately; burn it so pings
        // start one interval after the handshake.
        ping_timer.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("shutdown signal received, closing connection");
                        let _ = write.close().await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }

                _ = ping_timer.tick() => {
                    if last_traffic.elapsed() > self.config.idle_timeout {
                        let _ = write.close().await;
                        return Ok(SessionEnd::Dropped {
                            reason: FeedError::Stale(self.config.idle_timeout),
                            connected_for: Some(connected_at.elapsed()),
                        });
                    }
                    if let Err(e) = write.send(Message::Text(PING_FRAME.to_string())).await {
                        return Ok(SessionEnd::Dropped {
                            reason: FeedError::Network(e.to_string()),
                            connected_for: Some(connected_at.elapsed()),
                        });
                    }
                    debug!("sent ping");
                }

                msg_opt = read.next() => {
                    let msg = match msg_opt {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            return Ok(SessionEnd::Dropped {
                                reason: FeedError::Network(e.to_string()),
                                connected_for: Some(connected_at.elapsed()),
                            })
                        }
                        None => {
                            return Ok(SessionEnd::Dropped {
                                reason: FeedError::Closed,
                                connected_for: Some(connected_at.elapsed()),
                            })
                        }
                    };

                    last_traffic = Instant::now();

                    match msg {
                        Message::Text(text) => {
                            if text == PONG_FRAME {
                                debug!("received pong");
                                continue;
                            }
                            let event = FeedEvent::Message {
                                raw: text,
                                received_at: Utc::now(),
                            };
                            if self.events.send(event).await.is_err() {
                                return Ok(SessionEnd::ReceiverGone);
                            }
                        }
                        Message::Ping(data) => {
                            debug!("received ws ping, answering");
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return Ok(SessionEnd::Dropped {
                                    reason: FeedError::Network(e.to_string()),
                                    connected_for: Some(connected_at.elapsed()),
                                });
                            }
                        }
                        Message::Close(_) => {
                            info!("connection closed by broadcaster");
                            return Ok(SessionEnd::Dropped {
                                reason: FeedError::Closed,
                                connected_for: Some(connected_at.elapsed()),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Interpret the broadcaster's reply to our AUTH frame. Only an explicit
/// rejection is fatal; anything garbled goes through the retry path.
fn classify_auth_reply(text: &str) -> Result<(), FeedError> {
    match serde_json::from_str::<AuthReply>(text) {
        Ok(reply) if reply.kind == AUTH_OK => Ok(()),
        Ok(reply) if reply.kind == AUTH_REJECTED => Err(FeedError::Auth(
            reply
                .reason
                .unwrap_or_else(|| "rejected by broadcaster".to_string()),
        )),
        Ok(reply) => Err(FeedError::Network(format!(
            "unexpected handshake reply: {}",
            reply.kind
        ))),
        Err(e) => Err(FeedError::Network(format!(
            "unreadable handshake reply: {e}"
        ))),
    }
}
