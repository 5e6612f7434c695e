//! Relay
//!
//! Entry point for decoded signaling frames. Heartbeats are answered inline;
//! session events are queued to the orchestrator of their endpoint, which
//! processes them one at a time in arrival order. Different endpoints run
//! concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use fanout_protocol::{InboundSignal, OutboundSignal, SignalEnvelope};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::signaling::{OrchestratorSettings, SessionOrchestrator, SignalSender};
use crate::sfu::{ForwarderRegistry, TransportFactory};

struct EndpointHandle {
    orchestrator: Arc<SessionOrchestrator>,
    inbox: mpsc::UnboundedSender<SignalEnvelope>,
    /// Events queued or in progress
    pending: Arc<AtomicUsize>,
}

impl EndpointHandle {
    async fn is_idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
            && self.orchestrator.session_count().await == 0
            && self.orchestrator.cached_candidates().await == 0
    }
}

pub struct Relay {
    settings: OrchestratorSettings,
    registry: Arc<ForwarderRegistry>,
    factory: Arc<dyn TransportFactory>,
    signal: Arc<dyn SignalSender>,
    endpoints: Mutex<HashMap<String, EndpointHandle>>,
}

impl Relay {
    pub fn new(
        settings: OrchestratorSettings,
        registry: Arc<ForwarderRegistry>,
        factory: Arc<dyn TransportFactory>,
        signal: Arc<dyn SignalSender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            registry,
            factory,
            signal,
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<ForwarderRegistry> {
        &self.registry
    }

    /// Decode and dispatch one raw frame. Malformed frames are logged and dropped.
    pub async fn handle_frame(&self, text: &str) {
        match InboundSignal::from_json(text) {
            Ok(signal) => self.dispatch(signal).await,
            Err(e) => tracing::warn!("Dropping signaling frame: {}", e),
        }
    }

    pub async fn dispatch(&self, signal: InboundSignal) {
        match signal {
            InboundSignal::Ping { from } => {
                if let Err(e) = self.signal.send(OutboundSignal::Pong { to: from }).await {
                    tracing::warn!("Failed to answer heartbeat: {}", e);
                }
            }
            InboundSignal::Event(envelope) => {
                let mut endpoints = self.endpoints.lock().await;
                let handle = endpoints
                    .entry(envelope.endpoint_id.clone())
                    .or_insert_with(|| self.open_endpoint(&envelope.endpoint_id));
                handle.pending.fetch_add(1, Ordering::AcqRel);
                if handle.inbox.send(envelope).is_err() {
                    handle.pending.fetch_sub(1, Ordering::AcqRel);
                    tracing::error!("Endpoint inbox closed, event dropped");
                }
            }
        }
    }

    fn open_endpoint(&self, endpoint_id: &str) -> EndpointHandle {
        tracing::info!(endpoint_id = %endpoint_id, "New signaling endpoint");

        let orchestrator = SessionOrchestrator::new(
            endpoint_id,
            self.registry.clone(),
            self.factory.clone(),
            self.signal.clone(),
            self.settings.clone(),
        );

        let (inbox, mut rx) = mpsc::unbounded_channel::<SignalEnvelope>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = orchestrator.clone();
        let in_flight = pending.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                worker.process_event(envelope).await;
                in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        });

        EndpointHandle {
            orchestrator,
            inbox,
            pending,
        }
    }

    pub async fn orchestrator(&self, endpoint_id: &str) -> Option<Arc<SessionOrchestrator>> {
        self.endpoints
            .lock()
            .await
            .get(endpoint_id)
            .map(|handle| handle.orchestrator.clone())
    }

    /// Drop endpoints with no sessions, no cached candidates and no queued
    /// events. Returns how many were removed.
    pub async fn prune_idle_endpoints(&self) -> usize {
        let mut endpoints = self.endpoints.lock().await;
        let mut idle = Vec::new();
        for (endpoint_id, handle) in endpoints.iter() {
            if handle.is_idle().await {
                idle.push(endpoint_id.clone());
            }
        }
        for endpoint_id in &idle {
            endpoints.remove(endpoint_id);
            tracing::info!(endpoint_id = %endpoint_id, "Idle signaling endpoint dropped");
        }
        idle.len()
    }

    /// Change the REMB target for every session, including running ones
    pub fn set_target_bitrate(&self, kbps: u32) {
        self.settings.session.bitrate.set_kbps(kbps);
        tracing::info!(kbps, "Target bitrate updated");
    }

    pub fn target_bitrate(&self) -> u32 {
        self.settings.session.bitrate.kbps()
    }

    /// Periodically log session and forwarder counts
    pub fn spawn_stats(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let relay = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(relay) = relay.upgrade() else {
                    break;
                };
                relay.log_stats().await;
            }
        })
    }

    async fn log_stats(&self) {
        self.prune_idle_endpoints().await;

        let orchestrators: Vec<_> = self
            .endpoints
            .lock()
            .await
            .values()
            .map(|handle| handle.orchestrator.clone())
            .collect();

        let now = Utc::now();
        let mut total = 0;
        for orchestrator in &orchestrators {
            let sessions = orchestrator.session_count().await;
            let slots_in_use = orchestrator.slots().occupied().await;
            let oldest_session_secs = orchestrator
                .oldest_session()
                .await
                .map(|created_at| (now - created_at).num_seconds())
                .unwrap_or(0);
            total += sessions;
            tracing::debug!(
                endpoint_id = %orchestrator.endpoint_id(),
                sessions,
                slots_in_use,
                oldest_session_secs,
                "Endpoint stats"
            );
        }

        for stats in self.registry.stats().await {
            tracing::debug!(
                stream_id = %stats.stream_id,
                subscribers = stats.subscribers,
                published = stats.published,
                dropped = stats.dropped,
                age_secs = (now - stats.created_at).num_seconds(),
                "Forwarder stats"
            );
        }

        let forwarders = self.registry.len().await;
        tracing::info!(
            endpoints = orchestrators.len(),
            sessions = total,
            forwarders,
            bitrate_kbps = self.target_bitrate(),
            "Relay stats"
        );
    }

    /// Close every session and forwarder
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.endpoints.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.orchestrator.shutdown().await;
        }
        for stream_id in self.registry.stream_ids().await {
            self.registry.remove(&stream_id).await;
        }
        tracing::info!("Relay shut down");
    }
}
