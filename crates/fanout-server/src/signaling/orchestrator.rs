//! Session orchestrator
//!
//! One orchestrator per remote signaling endpoint. It owns that endpoint's
//! sessions (one per stream id), a second-level cache for candidates that
//! arrive ahead of their session, and the endpoint's slot pool. Session
//! notices are drained by a dedicated task.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fanout_media::{CodecSelection, VideoCodec};
use fanout_protocol::{
    IceCandidate, OutboundEvent, OutboundSignal, Role, SdpType, SessionDescription,
    SignalEnvelope, SignalEvent,
};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use super::SignalSender;
use crate::error::{RelayError, Result};
use crate::sfu::{
    ConnectionSession, ForwarderRegistry, MediaPacket, NoticeKind, PacketSink, PendingCandidate,
    SessionConfig, SessionNotice, SessionSetup, TrackSlotPool, TransportFactory,
};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Codec forced on every session, `None` for the VP9 default
    pub codec: Option<VideoCodec>,
    pub slot_capacity: usize,
    pub session: SessionConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            codec: None,
            slot_capacity: 1,
            session: SessionConfig::default(),
        }
    }
}

/// Candidates waiting for a session, keyed by candidate string
#[derive(Default)]
struct IceCache {
    entries: HashMap<String, PendingCandidate>,
    next_arrival: u64,
}

impl IceCache {
    fn insert(&mut self, owner_session_id: &str, candidate: IceCandidate) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.entries.insert(
            candidate.candidate.clone(),
            PendingCandidate {
                owner_session_id: owner_session_id.to_string(),
                candidate,
                arrival,
            },
        );
    }

    /// Remove and return everything owned by `session_id`, oldest first
    fn take_for(&mut self, session_id: &str) -> Vec<IceCandidate> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, pending)| pending.owner_session_id == session_id)
            .map(|(key, _)| key.clone())
            .collect();

        let mut taken: Vec<PendingCandidate> = keys
            .iter()
            .filter_map(|key| self.entries.remove(key))
            .collect();
        taken.sort_by_key(|pending| pending.arrival);
        taken.into_iter().map(|pending| pending.candidate).collect()
    }
}

/// Publishes a source session's packets into the registry
struct StreamPublisher {
    registry: Arc<ForwarderRegistry>,
    stream_id: String,
}

#[async_trait]
impl PacketSink for StreamPublisher {
    async fn deliver(&self, packet: MediaPacket) -> Result<()> {
        self.registry.publish(&self.stream_id, packet).await;
        Ok(())
    }
}

pub struct SessionOrchestrator {
    endpoint_id: String,
    sessions: Mutex<HashMap<String, Arc<ConnectionSession>>>,
    ice_cache: Mutex<IceCache>,
    registry: Arc<ForwarderRegistry>,
    slots: Arc<TrackSlotPool>,
    factory: Arc<dyn TransportFactory>,
    signal: Arc<dyn SignalSender>,
    settings: OrchestratorSettings,
    notices: mpsc::UnboundedSender<SessionNotice>,
}

impl SessionOrchestrator {
    pub fn new(
        endpoint_id: impl Into<String>,
        registry: Arc<ForwarderRegistry>,
        factory: Arc<dyn TransportFactory>,
        signal: Arc<dyn SignalSender>,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        let (notices, rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            endpoint_id: endpoint_id.into(),
            sessions: Mutex::new(HashMap::new()),
            ice_cache: Mutex::new(IceCache::default()),
            registry,
            slots: Arc::new(TrackSlotPool::new(settings.slot_capacity)),
            factory,
            signal,
            settings,
            notices,
        });

        tokio::spawn(Self::run_notices(Arc::downgrade(&orchestrator), rx));
        orchestrator
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn slots(&self) -> &Arc<TrackSlotPool> {
        &self.slots
    }

    pub async fn session(&self, stream_id: &str) -> Option<Arc<ConnectionSession>> {
        self.sessions.lock().await.get(stream_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Creation time of the longest-lived session
    pub async fn oldest_session(&self) -> Option<DateTime<Utc>> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|session| session.created_at())
            .min()
    }

    pub async fn cached_candidates(&self) -> usize {
        self.ice_cache.lock().await.entries.len()
    }

    /// Handle one decoded signaling event for this endpoint
    pub async fn process_event(&self, envelope: SignalEnvelope) {
        tracing::debug!(
            endpoint_id = %envelope.endpoint_id,
            stream_id = %envelope.stream_id,
            session_id = %envelope.session_id,
            event = envelope.event.name(),
            "Signaling event"
        );

        let result = match &envelope.event {
            SignalEvent::Ok => self.handle_ok(&envelope).await,
            SignalEvent::Sdp(description) => self.handle_sdp(&envelope, description.clone()).await,
            SignalEvent::Candidate(candidate) => {
                self.handle_candidate(&envelope, candidate.clone()).await;
                Ok(())
            }
            SignalEvent::Close => {
                self.handle_close(&envelope).await;
                Ok(())
            }
            SignalEvent::Reconnect => {
                self.send(envelope.reply(OutboundEvent::ReconnectOk)).await;
                Ok(())
            }
            SignalEvent::Error(payload) => {
                tracing::warn!(
                    stream_id = %envelope.stream_id,
                    session_id = %envelope.session_id,
                    "Endpoint reported error: {:?}",
                    payload
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::error!(
                stream_id = %envelope.stream_id,
                session_id = %envelope.session_id,
                "Failed to handle {} event: {}",
                envelope.event.name(),
                e
            );
            if e.is_reported() {
                self.send(envelope.reply(OutboundEvent::Error(e.to_string())))
                    .await;
            }
        }
    }

    async fn handle_ok(&self, envelope: &SignalEnvelope) -> Result<()> {
        if let Some(session) = self.find_by_session_id(&envelope.session_id).await {
            self.replay_cached(&session).await;
        }
        self.send(envelope.reply(OutboundEvent::Ok)).await;
        Ok(())
    }

    async fn handle_sdp(
        &self,
        envelope: &SignalEnvelope,
        description: SessionDescription,
    ) -> Result<()> {
        let previous = self.sessions.lock().await.remove(&envelope.stream_id);
        if let Some(previous) = previous {
            tracing::info!(
                stream_id = %envelope.stream_id,
                old_session_id = %previous.session_id(),
                new_session_id = %envelope.session_id,
                "Replacing session"
            );
            self.teardown(&previous).await;
        }

        let codec = if description.sdp_type == SdpType::Offer {
            CodecSelection::resolve(self.settings.codec, &description.sdp)
        } else {
            CodecSelection::resolve(self.settings.codec, "")
        };

        let setup = SessionSetup {
            endpoint_id: self.endpoint_id.clone(),
            stream_id: envelope.stream_id.clone(),
            session_id: envelope.session_id.clone(),
            role: envelope.role,
            codec,
        };
        let session = ConnectionSession::connect(
            setup,
            self.factory.as_ref(),
            Some(self.slots.clone()),
            self.notices.clone(),
            self.settings.session.clone(),
        )
        .await?;

        if envelope.role == Role::Source {
            // A new publisher gets a fresh forwarder; existing subscribers move over
            if self.registry.get(&envelope.stream_id).await.is_some() {
                self.registry.replace(&envelope.stream_id).await;
            }
        }

        self.sessions
            .lock()
            .await
            .insert(envelope.stream_id.clone(), session.clone());

        let answer = match session.set_remote_description(description).await {
            Ok(answer) => answer,
            Err(e) => {
                self.remove_if_current(&envelope.stream_id, session.instance_id())
                    .await;
                self.teardown(&session).await;
                return Err(e);
            }
        };

        self.replay_cached(&session).await;

        if let Some(answer) = answer {
            self.send(envelope.reply(OutboundEvent::Sdp(answer))).await;
        }
        Ok(())
    }

    async fn handle_candidate(&self, envelope: &SignalEnvelope, candidate: IceCandidate) {
        let session = self.session(&envelope.stream_id).await;
        match session {
            Some(session) if session.session_id() == envelope.session_id => {
                session.add_ice_candidate(candidate).await;
            }
            _ => {
                tracing::debug!(
                    stream_id = %envelope.stream_id,
                    session_id = %envelope.session_id,
                    "No session for candidate yet, caching"
                );
                self.ice_cache
                    .lock()
                    .await
                    .insert(&envelope.session_id, candidate);
            }
        }
    }

    async fn handle_close(&self, envelope: &SignalEnvelope) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            let current_session_id = sessions
                .get(&envelope.stream_id)
                .map(|current| current.session_id().to_string());
            match current_session_id {
                Some(current) if current == envelope.session_id => {
                    sessions.remove(&envelope.stream_id)
                }
                Some(current) => {
                    tracing::info!(
                        stream_id = %envelope.stream_id,
                        current_session_id = %current,
                        stale_session_id = %envelope.session_id,
                        "Ignoring close for replaced session"
                    );
                    None
                }
                None => {
                    tracing::debug!(
                        stream_id = %envelope.stream_id,
                        "Close ignored: {}",
                        RelayError::SessionNotFound(envelope.session_id.clone())
                    );
                    None
                }
            }
        };

        if let Some(session) = removed {
            self.teardown(&session).await;
        }
    }

    async fn handle_notice(&self, notice: SessionNotice) {
        let current = self
            .current_instance(&notice.stream_id, notice.instance_id)
            .await;

        let Some(session) = current else {
            tracing::debug!(
                stream_id = %notice.stream_id,
                session_id = %notice.session_id,
                kind = ?notice.kind,
                "Ignoring notice from replaced session instance"
            );
            return;
        };

        match notice.kind {
            NoticeKind::Succeeded => self.on_succeeded(&session).await,
            NoticeKind::TrackAdded => {
                if session.has_connected() {
                    self.start_relays(&session).await;
                }
            }
            NoticeKind::LocalCandidate(candidate) => {
                self.send(OutboundSignal::Event {
                    endpoint_id: self.endpoint_id.clone(),
                    stream_id: session.stream_id().to_string(),
                    role: session.role(),
                    session_id: session.session_id().to_string(),
                    event: OutboundEvent::Candidate(candidate),
                })
                .await;
            }
            kind @ (NoticeKind::Failed | NoticeKind::Closed) => {
                tracing::info!(
                    stream_id = %notice.stream_id,
                    session_id = %notice.session_id,
                    ?kind,
                    "Removing session"
                );
                self.remove_if_current(&notice.stream_id, notice.instance_id)
                    .await;
                self.teardown(&session).await;
            }
        }
    }

    async fn on_succeeded(&self, session: &Arc<ConnectionSession>) {
        tracing::info!(
            stream_id = %session.stream_id(),
            session_id = %session.session_id(),
            role = %session.role(),
            "Session connected"
        );

        match session.role() {
            Role::Dest | Role::Mixer => match self.slots.lookup(session.session_id()).await {
                Ok(slot) => {
                    self.registry
                        .subscribe(
                            session.stream_id(),
                            &subscriber_key(session),
                            session.slot_sink(),
                        )
                        .await;
                    tracing::info!(
                        stream_id = %session.stream_id(),
                        session_id = %session.session_id(),
                        slot,
                        "Subscribed to stream"
                    );
                }
                Err(e) => {
                    tracing::error!(session_id = %session.session_id(), "Cannot subscribe: {}", e);
                    self.send(session_reply(
                        &self.endpoint_id,
                        session,
                        OutboundEvent::Error(e.to_string()),
                    ))
                    .await;
                    self.remove_if_current(session.stream_id(), session.instance_id())
                        .await;
                    self.teardown(session).await;
                }
            },
            Role::Source => {
                self.registry.get_or_create(session.stream_id()).await;
                self.start_relays(session).await;
            }
            Role::SelfLoop => self.start_relays(session).await,
        }
    }

    /// Start read loops for tracks the session has not handed out yet
    async fn start_relays(&self, session: &Arc<ConnectionSession>) {
        let sink: Arc<dyn PacketSink> = match session.role() {
            Role::Source => Arc::new(StreamPublisher {
                registry: self.registry.clone(),
                stream_id: session.stream_id().to_string(),
            }),
            Role::SelfLoop => session.slot_sink(),
            Role::Dest | Role::Mixer => return,
        };

        for track in session.take_pending_tracks().await {
            session.spawn_read_loop(track, sink.clone());
        }
    }

    async fn replay_cached(&self, session: &ConnectionSession) {
        let cached = self.ice_cache.lock().await.take_for(session.session_id());
        if cached.is_empty() {
            return;
        }
        tracing::debug!(
            session_id = %session.session_id(),
            count = cached.len(),
            "Replaying cached candidates"
        );
        for candidate in cached {
            session.add_ice_candidate(candidate).await;
        }
    }

    async fn teardown(&self, session: &ConnectionSession) {
        if session.role().is_receiver() && session.has_connected() {
            self.registry
                .unsubscribe(session.stream_id(), &subscriber_key(session))
                .await;
        }
        session.close().await;
    }

    async fn current_instance(
        &self,
        stream_id: &str,
        instance_id: Uuid,
    ) -> Option<Arc<ConnectionSession>> {
        self.sessions
            .lock()
            .await
            .get(stream_id)
            .filter(|session| session.instance_id() == instance_id)
            .cloned()
    }

    async fn remove_if_current(&self, stream_id: &str, instance_id: Uuid) {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(stream_id)
            .is_some_and(|session| session.instance_id() == instance_id)
        {
            sessions.remove(stream_id);
        }
    }

    async fn find_by_session_id(&self, session_id: &str) -> Option<Arc<ConnectionSession>> {
        self.sessions
            .lock()
            .await
            .values()
            .find(|session| session.session_id() == session_id)
            .cloned()
    }

    /// Close every session of this endpoint
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            self.teardown(&session).await;
        }
    }

    async fn send(&self, message: OutboundSignal) {
        let event = message.event_name();
        if let Err(e) = self.signal.send(message).await {
            tracing::warn!(endpoint_id = %self.endpoint_id, "Failed to send {}: {}", event, e);
        }
    }

    async fn run_notices(orchestrator: Weak<Self>, mut rx: mpsc::UnboundedReceiver<SessionNotice>) {
        while let Some(notice) = rx.recv().await {
            let Some(orchestrator) = orchestrator.upgrade() else {
                break;
            };
            orchestrator.handle_notice(notice).await;
        }
    }
}

/// Subscriber id of a receiving session within its stream's forwarder
fn subscriber_key(session: &ConnectionSession) -> String {
    format!("{}:{}", session.endpoint_id(), session.session_id())
}

fn session_reply(
    endpoint_id: &str,
    session: &ConnectionSession,
    event: OutboundEvent,
) -> OutboundSignal {
    OutboundSignal::Event {
        endpoint_id: endpoint_id.to_string(),
        stream_id: session.stream_id().to_string(),
        role: session.role(),
        session_id: session.session_id().to_string(),
        event,
    }
}
