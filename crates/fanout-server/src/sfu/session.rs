//! Connection session
//!
//! Wraps one peer transport. Owns the negotiation state machine, buffers
//! candidates that arrive before the remote description, runs the RTCP
//! feedback loops and reports lifecycle changes to its orchestrator through a
//! notice channel. Sessions never call back into the orchestrator directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fanout_media::CodecSelection;
use fanout_protocol::{IceCandidate, Role, SdpType, SessionDescription};
use tokio::sync::{Mutex, mpsc, watch};
use uuid::Uuid;

use super::forwarder::{MediaKind, MediaPacket, PacketSink};
use super::rewrite::SequenceRewriter;
use super::slots::TrackSlotPool;
use super::transport::{
    ConnectivityState, FeedbackMessage, PeerTransport, RemoteMediaTrack, TransportEvent,
    TransportFactory, TransportParams,
};
use crate::error::{RelayError, Result};

const PICTURE_LOSS_INTERVAL: Duration = Duration::from_millis(500);
const RAPID_RESYNC_INTERVAL: Duration = Duration::from_millis(100);
const BITRATE_INTERVAL: Duration = Duration::from_millis(500);
/// Consecutive read failures after which a read loop gives up
const MAX_READ_ERRORS: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

/// Target bitrate advertised in REMB messages, adjustable at runtime
#[derive(Debug, Clone)]
pub struct TargetBitrate(Arc<AtomicU32>);

impl TargetBitrate {
    pub fn new(kbps: u32) -> Self {
        Self(Arc::new(AtomicU32::new(kbps)))
    }

    pub fn kbps(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set_kbps(&self, kbps: u32) {
        self.0.store(kbps, Ordering::Relaxed);
    }

    pub fn bits_per_second(&self) -> u64 {
        u64::from(self.kbps()) * 1024
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a failed connection may recover before it is reported
    pub failed_grace: Duration,
    pub bitrate: TargetBitrate,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            failed_grace: Duration::from_secs(10),
            bitrate: TargetBitrate::new(500),
        }
    }
}

/// Identity of a session as given by signaling
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub endpoint_id: String,
    pub stream_id: String,
    pub session_id: String,
    pub role: Role,
    pub codec: CodecSelection,
}

/// A candidate held until its session can use it
#[derive(Debug, Clone)]
pub struct PendingCandidate {
    pub owner_session_id: String,
    pub candidate: IceCandidate,
    pub arrival: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NoticeKind {
    /// First transition into connected
    Succeeded,
    /// Still down after the grace period
    Failed,
    Closed,
    LocalCandidate(IceCandidate),
    TrackAdded,
}

/// Lifecycle report sent from a session to its orchestrator
#[derive(Debug, Clone)]
pub struct SessionNotice {
    pub stream_id: String,
    pub session_id: String,
    pub instance_id: Uuid,
    pub kind: NoticeKind,
}

struct SessionInner {
    state: SessionState,
    connectivity: ConnectivityState,
    remote_description_set: bool,
    candidate_buffer: Vec<PendingCandidate>,
    next_arrival: u64,
    pending_tracks: Vec<Arc<dyn RemoteMediaTrack>>,
}

pub struct ConnectionSession {
    instance_id: Uuid,
    setup: SessionSetup,
    created_at: DateTime<Utc>,
    transport: Arc<dyn PeerTransport>,
    inner: Mutex<SessionInner>,
    closed: watch::Sender<bool>,
    connected_once: AtomicBool,
    grace_pending: AtomicBool,
    feedback_started: AtomicBool,
    slot: Option<(Arc<TrackSlotPool>, usize)>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    config: SessionConfig,
}

impl ConnectionSession {
    /// Build the transport and start the session's event task.
    ///
    /// Receiving roles claim a slot from `slots` first; the slot index labels
    /// the local tracks. The slot is released again if the transport cannot
    /// be created.
    pub async fn connect(
        setup: SessionSetup,
        factory: &dyn TransportFactory,
        slots: Option<Arc<TrackSlotPool>>,
        notices: mpsc::UnboundedSender<SessionNotice>,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        let slot = match slots {
            Some(pool) if setup.role.is_receiver() => {
                let index = pool.acquire(&setup.session_id).await?;
                Some((pool, index))
            }
            _ => None,
        };

        let params = TransportParams {
            endpoint_id: setup.endpoint_id.clone(),
            stream_id: setup.stream_id.clone(),
            session_id: setup.session_id.clone(),
            role: setup.role,
            codec: setup.codec,
            slot: slot.as_ref().map(|(_, index)| *index),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match factory.create(&params, events_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                if let Some((pool, _)) = &slot {
                    pool.release(&setup.session_id).await;
                }
                return Err(e);
            }
        };

        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            instance_id: Uuid::new_v4(),
            setup,
            created_at: Utc::now(),
            transport,
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                connectivity: ConnectivityState::New,
                remote_description_set: false,
                candidate_buffer: Vec::new(),
                next_arrival: 0,
                pending_tracks: Vec::new(),
            }),
            closed,
            connected_once: AtomicBool::new(false),
            grace_pending: AtomicBool::new(false),
            feedback_started: AtomicBool::new(false),
            slot,
            notices,
            config,
        });

        tokio::spawn(session.clone().run_events(events_rx));

        tracing::info!(
            stream_id = %session.setup.stream_id,
            session_id = %session.setup.session_id,
            role = %session.setup.role,
            slot = ?session.slot(),
            "Session created"
        );

        Ok(session)
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn endpoint_id(&self) -> &str {
        &self.setup.endpoint_id
    }

    pub fn stream_id(&self) -> &str {
        &self.setup.stream_id
    }

    pub fn session_id(&self) -> &str {
        &self.setup.session_id
    }

    pub fn role(&self) -> Role {
        self.setup.role
    }

    pub fn codec(&self) -> CodecSelection {
        self.setup.codec
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn slot(&self) -> Option<usize> {
        self.slot.as_ref().map(|(_, index)| *index)
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        self.transport.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn has_connected(&self) -> bool {
        self.connected_once.load(Ordering::Acquire)
    }

    /// Flips to `true` once when the session closes
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn buffered_candidates(&self) -> usize {
        self.inner.lock().await.candidate_buffer.len()
    }

    /// Apply the remote document, replay buffered candidates in arrival
    /// order, and answer if the document was an offer.
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<Option<SessionDescription>> {
        let mut inner = self.inner.lock().await;
        if self.is_closed() {
            return Err(RelayError::SessionClosed(self.setup.session_id.clone()));
        }
        if inner.state == SessionState::Created {
            inner.state = SessionState::Negotiating;
        }

        let is_offer = description.sdp_type == SdpType::Offer;
        self.transport.set_remote_description(description).await?;
        inner.remote_description_set = true;

        let mut buffered = std::mem::take(&mut inner.candidate_buffer);
        buffered.sort_by_key(|pending| pending.arrival);
        for pending in buffered {
            if let Err(e) = self.transport.add_ice_candidate(pending.candidate).await {
                tracing::warn!(
                    session_id = %self.setup.session_id,
                    "Failed to apply buffered candidate: {}",
                    e
                );
            }
        }

        if !is_offer {
            return Ok(None);
        }
        let answer = self.transport.create_answer().await?;
        Ok(Some(answer))
    }

    /// Forward a remote candidate, or hold it until the remote description
    /// is in place. Failures are logged, never returned.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        let mut inner = self.inner.lock().await;
        if self.is_closed() {
            tracing::debug!(session_id = %self.setup.session_id, "Candidate for closed session dropped");
            return;
        }

        if !inner.remote_description_set {
            let arrival = inner.next_arrival;
            inner.next_arrival += 1;
            inner.candidate_buffer.push(PendingCandidate {
                owner_session_id: self.setup.session_id.clone(),
                candidate,
                arrival,
            });
            return;
        }

        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            tracing::warn!(session_id = %self.setup.session_id, "Failed to add ICE candidate: {}", e);
        }
    }

    /// React to a connectivity report from the transport
    pub async fn handle_connectivity_change(self: &Arc<Self>, state: ConnectivityState) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Closed {
                return;
            }
            inner.connectivity = state;
            match state {
                ConnectivityState::Connected => inner.state = SessionState::Connected,
                ConnectivityState::Failed => inner.state = SessionState::Failed,
                _ => {}
            }
        }

        tracing::debug!(
            stream_id = %self.setup.stream_id,
            session_id = %self.setup.session_id,
            ?state,
            "Connectivity changed"
        );

        match state {
            ConnectivityState::Connected => {
                if !self.connected_once.swap(true, Ordering::AcqRel) {
                    self.notify(NoticeKind::Succeeded);
                }
            }
            ConnectivityState::Failed => self.start_failure_grace(),
            ConnectivityState::Closed => self.notify(NoticeKind::Closed),
            _ => {}
        }
    }

    fn start_failure_grace(self: &Arc<Self>) {
        if self.grace_pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let session = self.clone();
        let mut closed = self.closed_signal();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(session.config.failed_grace) => {}
                _ = closed.wait_for(|closed| *closed) => return,
            }
            session.grace_pending.store(false, Ordering::Release);

            let connectivity = session.inner.lock().await.connectivity;
            if connectivity != ConnectivityState::Connected {
                tracing::warn!(
                    stream_id = %session.setup.stream_id,
                    session_id = %session.setup.session_id,
                    "Session did not recover within {:?}",
                    session.config.failed_grace
                );
                session.notify(NoticeKind::Failed);
            }
        });
    }

    /// Record an inbound track and start feedback for the first video track
    pub async fn attach_remote_track(self: &Arc<Self>, track: Arc<dyn RemoteMediaTrack>) {
        let kind = track.kind();
        let ssrc = track.ssrc();
        self.inner.lock().await.pending_tracks.push(track);

        tracing::info!(
            stream_id = %self.setup.stream_id,
            session_id = %self.setup.session_id,
            %kind,
            ssrc,
            "Remote track attached"
        );

        if kind == MediaKind::Video && !self.feedback_started.swap(true, Ordering::AcqRel) {
            self.start_feedback_loops(ssrc);
        }

        self.notify(NoticeKind::TrackAdded);
    }

    /// Tracks that no read loop has claimed yet
    pub async fn take_pending_tracks(&self) -> Vec<Arc<dyn RemoteMediaTrack>> {
        std::mem::take(&mut self.inner.lock().await.pending_tracks)
    }

    fn start_feedback_loops(&self, media_ssrc: u32) {
        self.spawn_feedback_loop(PICTURE_LOSS_INTERVAL, move |_| FeedbackMessage::PictureLoss {
            media_ssrc,
        });
        self.spawn_feedback_loop(RAPID_RESYNC_INTERVAL, move |_| FeedbackMessage::RapidResync {
            media_ssrc,
        });
        self.spawn_feedback_loop(BITRATE_INTERVAL, move |bitrate: &TargetBitrate| {
            FeedbackMessage::BitrateEstimate {
                bitrate_bps: bitrate.bits_per_second(),
                ssrcs: vec![media_ssrc],
            }
        });
    }

    fn spawn_feedback_loop<F>(&self, period: Duration, build: F)
    where
        F: Fn(&TargetBitrate) -> FeedbackMessage + Send + 'static,
    {
        let transport = self.transport.clone();
        let closed = self.closed_signal();
        let bitrate = self.config.bitrate.clone();
        let session_id = self.setup.session_id.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if *closed.borrow() {
                    break;
                }
                if let Err(e) = transport.send_feedback(build(&bitrate)).await {
                    tracing::debug!(session_id = %session_id, "Failed to send RTCP feedback: {}", e);
                }
            }
        });
    }

    /// Pump packets from `track` into `sink` until the session closes or the
    /// track keeps failing.
    pub fn spawn_read_loop(
        self: &Arc<Self>,
        track: Arc<dyn RemoteMediaTrack>,
        sink: Arc<dyn PacketSink>,
    ) {
        let session = self.clone();
        tokio::spawn(async move {
            let kind = track.kind();
            let mut closed = session.closed_signal();
            let mut errors = 0u32;

            loop {
                let result = tokio::select! {
                    _ = closed.wait_for(|closed| *closed) => break,
                    result = track.read_packet() => result,
                };

                match result {
                    Ok(packet) => {
                        errors = 0;
                        if let Err(e) = sink.deliver(MediaPacket::new(kind, packet)).await {
                            tracing::warn!(session_id = %session.setup.session_id, "Failed to relay packet: {}", e);
                        }
                    }
                    Err(e) => {
                        if session.is_closed() {
                            break;
                        }
                        errors += 1;
                        if errors >= MAX_READ_ERRORS {
                            tracing::error!(
                                stream_id = %session.setup.stream_id,
                                session_id = %session.setup.session_id,
                                "Giving up on {} track after {} read errors: {}",
                                kind,
                                errors,
                                e
                            );
                            break;
                        }
                        if errors % 100 == 1 {
                            tracing::warn!(session_id = %session.setup.session_id, "Error reading {} track: {}", kind, e);
                        }
                    }
                }
            }

            tracing::debug!(session_id = %session.setup.session_id, %kind, "Read loop finished");
        });
    }

    /// Sink writing delivered packets into this session's local tracks
    pub fn slot_sink(&self) -> Arc<dyn PacketSink> {
        Arc::new(SlotSink {
            transport: self.transport.clone(),
            closed: self.closed_signal(),
            rewriters: Mutex::new(HashMap::new()),
        })
    }

    /// Single-commit teardown. Returns `false` if the session was already closed.
    pub async fn close(&self) -> bool {
        let first = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if !first {
            return false;
        }

        self.inner.lock().await.state = SessionState::Closed;

        if let Some((pool, _)) = &self.slot {
            pool.release(&self.setup.session_id).await;
        }

        if let Err(e) = self.transport.close().await {
            tracing::warn!(session_id = %self.setup.session_id, "Error closing transport: {}", e);
        }

        tracing::info!(
            stream_id = %self.setup.stream_id,
            session_id = %self.setup.session_id,
            "Session closed"
        );
        true
    }

    fn notify(&self, kind: NoticeKind) {
        let notice = SessionNotice {
            stream_id: self.setup.stream_id.clone(),
            session_id: self.setup.session_id.clone(),
            instance_id: self.instance_id,
            kind,
        };
        if self.notices.send(notice).is_err() {
            tracing::debug!(session_id = %self.setup.session_id, "Notice dropped, orchestrator gone");
        }
    }

    async fn run_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let mut closed = self.closed_signal();
        loop {
            let event = tokio::select! {
                _ = closed.wait_for(|closed| *closed) => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };

            match event {
                TransportEvent::LocalCandidate(candidate) => {
                    self.notify(NoticeKind::LocalCandidate(candidate));
                }
                TransportEvent::Connectivity(state) => self.handle_connectivity_change(state).await,
                TransportEvent::RemoteTrack(track) => self.attach_remote_track(track).await,
            }
        }
    }
}

/// Writes forwarded packets into a session's local tracks, keeping sequence
/// numbers continuous per kind.
struct SlotSink {
    transport: Arc<dyn PeerTransport>,
    closed: watch::Receiver<bool>,
    rewriters: Mutex<HashMap<MediaKind, SequenceRewriter>>,
}

#[async_trait]
impl PacketSink for SlotSink {
    async fn deliver(&self, packet: MediaPacket) -> Result<()> {
        if *self.closed.borrow() {
            return Ok(());
        }

        let MediaPacket { kind, mut packet } = packet;
        self.rewriters
            .lock()
            .await
            .entry(kind)
            .or_insert_with(|| SequenceRewriter::for_kind(kind))
            .rewrite(&mut packet.header);

        self.transport.write_rtp(kind, &packet).await
    }
}
