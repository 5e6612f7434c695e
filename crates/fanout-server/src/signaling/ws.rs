//! WebSocket connection to the signaling service
//!
//! Frames are JSON arrays in both directions. Outbound messages go through an
//! unbounded queue so senders never wait on the socket; the queue survives
//! reconnects and is drained by whichever connection is current.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fanout_protocol::OutboundSignal;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::SignalSender;
use crate::error::{RelayError, Result};
use crate::relay::Relay;

/// Handle for queueing frames to the signaling service
#[derive(Clone)]
pub struct SignalClient {
    outbound: mpsc::UnboundedSender<String>,
}

impl SignalClient {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { outbound }, rx)
    }
}

#[async_trait]
impl SignalSender for SignalClient {
    async fn send(&self, message: OutboundSignal) -> Result<()> {
        self.outbound
            .send(message.to_json())
            .map_err(|_| RelayError::Internal(anyhow::anyhow!("signaling connection is gone")))
    }
}

/// Outbound frames plus the one whose write failed, which goes out first on
/// the next connection
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<String>,
    unsent: Option<String>,
}

impl OutboundQueue {
    pub fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx, unsent: None }
    }

    /// Cancel safe
    pub async fn next(&mut self) -> Option<String> {
        if let Some(frame) = self.unsent.take() {
            return Some(frame);
        }
        self.rx.recv().await
    }

    pub fn hold(&mut self, frame: String) {
        self.unsent = Some(frame);
    }
}

/// URL used to register `node_id` with the signaling service
pub fn node_url(signal_url: &str, node_id: &str) -> String {
    let separator = if signal_url.contains('?') { '&' } else { '?' };
    format!("{}{}id={}", signal_url, separator, node_id)
}

/// Keep a connection to `url` open, reconnecting after `reconnect_delay`
/// whenever it drops. Only returns when the outbound queue is closed.
pub async fn run(
    url: String,
    outbound: mpsc::UnboundedReceiver<String>,
    relay: Arc<Relay>,
    reconnect_delay: Duration,
) {
    let mut outbound = OutboundQueue::new(outbound);
    loop {
        match connect_and_serve(&url, &mut outbound, &relay).await {
            Ok(true) => {
                tracing::info!("Outbound signaling queue closed, stopping client");
                return;
            }
            Ok(false) => tracing::warn!(url = %url, "Signaling connection closed"),
            Err(e) => tracing::error!(url = %url, "Signaling connection error: {:#}", e),
        }

        tokio::time::sleep(reconnect_delay).await;
        tracing::info!(url = %url, "Reconnecting to signaling service");
    }
}

/// Serve one connection. `Ok(true)` means the outbound queue has closed.
async fn connect_and_serve(
    url: &str,
    outbound: &mut OutboundQueue,
    relay: &Arc<Relay>,
) -> anyhow::Result<bool> {
    let (stream, _) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {}", url))?;
    tracing::info!(url = %url, "Connected to signaling service");

    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            frame = outbound.next() => {
                let Some(frame) = frame else {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(true);
                };
                if let Err(e) = write.send(Message::text(frame.clone())).await {
                    outbound.hold(frame);
                    return Err(e).context("failed to send signaling frame");
                }
            }
            message = read.next() => {
                let Some(message) = message else {
                    return Ok(false);
                };
                match message? {
                    Message::Text(text) => relay.handle_frame(text.as_str()).await,
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => relay.handle_frame(text).await,
                        Err(_) => tracing::debug!("Dropping non-UTF-8 binary frame"),
                    },
                    Message::Ping(payload) => write.send(Message::Pong(payload)).await?,
                    Message::Close(_) => return Ok(false),
                    _ => {}
                }
            }
        }
    }
}
