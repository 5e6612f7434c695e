//! Forwarder registry
//!
//! Maps stream ids to forwarders. Every check-then-mutate sequence on the
//! table, including the transfer step of a replacement, runs while holding the
//! table lock, so a create and a remove for the same id never interleave.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::forwarder::{ForwarderConfig, ForwarderStats, MediaPacket, PacketSink, RtpForwarder};
use crate::error::RelayError;

pub struct ForwarderRegistry {
    forwarders: Mutex<HashMap<String, Arc<RtpForwarder>>>,
    config: ForwarderConfig,
}

impl ForwarderRegistry {
    pub fn new() -> Self {
        Self::with_config(ForwarderConfig::default())
    }

    pub fn with_config(config: ForwarderConfig) -> Self {
        Self {
            forwarders: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Return the forwarder for `stream_id`, creating it if needed
    pub async fn get_or_create(&self, stream_id: &str) -> Arc<RtpForwarder> {
        let mut forwarders = self.forwarders.lock().await;
        if let Some(forwarder) = forwarders.get(stream_id) {
            return forwarder.clone();
        }

        let forwarder = RtpForwarder::spawn(stream_id, self.config);
        forwarders.insert(stream_id.to_string(), forwarder.clone());
        forwarder
    }

    pub async fn get(&self, stream_id: &str) -> Option<Arc<RtpForwarder>> {
        self.forwarders.lock().await.get(stream_id).cloned()
    }

    /// Install a fresh forwarder, carrying over the old one's subscribers
    pub async fn replace(&self, stream_id: &str) -> Arc<RtpForwarder> {
        let mut forwarders = self.forwarders.lock().await;
        let replacement = RtpForwarder::spawn(stream_id, self.config);

        if let Some(old) = forwarders.remove(stream_id) {
            old.transfer_subscriptions_to(&replacement).await;
            old.close().await;
        }

        forwarders.insert(stream_id.to_string(), replacement.clone());
        tracing::info!(stream_id, "Forwarder replaced");
        replacement
    }

    pub async fn remove(&self, stream_id: &str) {
        let mut forwarders = self.forwarders.lock().await;
        if let Some(forwarder) = forwarders.remove(stream_id) {
            forwarder.close().await;
            tracing::info!(stream_id, "Forwarder removed");
        }
    }

    /// Publish to the stream's forwarder. Nothing happens if none exists.
    pub async fn publish(&self, stream_id: &str, packet: MediaPacket) {
        let forwarder = self.forwarders.lock().await.get(stream_id).cloned();
        match forwarder {
            Some(forwarder) => forwarder.publish(packet).await,
            None => {
                tracing::debug!("{}", RelayError::ForwarderAbsent(stream_id.to_string()));
            }
        }
    }

    /// Holds the table lock until the command is queued, so it cannot
    /// interleave with `replace`.
    pub async fn subscribe(&self, stream_id: &str, subscriber_id: &str, sink: Arc<dyn PacketSink>) {
        let mut forwarders = self.forwarders.lock().await;
        let forwarder = forwarders
            .entry(stream_id.to_string())
            .or_insert_with(|| RtpForwarder::spawn(stream_id, self.config))
            .clone();
        forwarder.subscribe(subscriber_id, sink).await;
    }

    /// Does nothing when the stream has no forwarder
    pub async fn unsubscribe(&self, stream_id: &str, subscriber_id: &str) {
        let forwarders = self.forwarders.lock().await;
        if let Some(forwarder) = forwarders.get(stream_id) {
            forwarder.unsubscribe(subscriber_id).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.forwarders.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.forwarders.lock().await.is_empty()
    }

    pub async fn stream_ids(&self) -> Vec<String> {
        self.forwarders.lock().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> Vec<ForwarderStats> {
        let forwarders: Vec<_> = self.forwarders.lock().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(forwarders.len());
        for forwarder in forwarders {
            if let Some(s) = forwarder.stats().await {
                stats.push(s);
            }
        }
        stats
    }
}

impl Default for ForwarderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
