//! Shared fakes for the relay integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use fanout_protocol::{IceCandidate, OutboundEvent, OutboundSignal, SessionDescription};
use fanout_server::error::{RelayError, Result};
use fanout_server::sfu::{
    FeedbackMessage, MediaKind, MediaPacket, PacketSink, PeerTransport, RemoteMediaTrack,
    TransportEvent, TransportFactory, TransportParams,
};
use fanout_server::signaling::SignalSender;
use tokio::sync::mpsc;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

/// Poll `$cond` until it holds, failing the test after two seconds
#[macro_export]
macro_rules! wait_until {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while !($cond) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                stringify!($cond)
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}

pub fn rtp(ssrc: u32, seq: u16) -> Packet {
    Packet {
        header: Header {
            version: 2,
            payload_type: 98,
            ssrc,
            sequence_number: seq,
            timestamp: u32::from(seq) * 3000,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
    }
}

pub fn offer() -> SessionDescription {
    SessionDescription::offer("v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 98\r\na=rtpmap:98 VP9/90000\r\n")
}

#[derive(Default)]
pub struct TransportLog {
    pub remote_descriptions: Vec<SessionDescription>,
    pub candidates: Vec<String>,
    pub written: Vec<(MediaKind, Packet)>,
    pub feedback: Vec<FeedbackMessage>,
}

pub struct FakeTransport {
    pub params: TransportParams,
    events: mpsc::UnboundedSender<TransportEvent>,
    log: Mutex<TransportLog>,
    closes: AtomicUsize,
    fail_remote: AtomicBool,
}

impl FakeTransport {
    pub fn session_id(&self) -> &str {
        &self.params.session_id
    }

    /// Raise an event as the engine would
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn fail_remote_description(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }

    pub fn candidates(&self) -> Vec<String> {
        self.log.lock().unwrap().candidates.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.log.lock().unwrap().remote_descriptions.clone()
    }

    pub fn written(&self) -> Vec<(MediaKind, Packet)> {
        self.log.lock().unwrap().written.clone()
    }

    pub fn feedback(&self) -> Vec<FeedbackMessage> {
        self.log.lock().unwrap().feedback.clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(RelayError::NegotiationFailure("rejected by fake".to_string()));
        }
        self.log.lock().unwrap().remote_descriptions.push(description);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!(
            "v=0\r\ns=answer-{}\r\n",
            self.params.session_id
        )))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.log.lock().unwrap().candidates.push(candidate.candidate);
        Ok(())
    }

    async fn write_rtp(&self, kind: MediaKind, packet: &Packet) -> Result<()> {
        self.log.lock().unwrap().written.push((kind, packet.clone()));
        Ok(())
    }

    async fn send_feedback(&self, message: FeedbackMessage) -> Result<()> {
        self.log.lock().unwrap().feedback.push(message);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    fail_create: AtomicBool,
    reject_offer: AtomicBool,
}

impl FakeTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// The next transport refuses its remote description
    pub fn reject_next_offer(&self) {
        self.reject_offer.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    /// Most recent transport built for `session_id`
    pub fn transport(&self, session_id: &str) -> Option<Arc<FakeTransport>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.params.session_id == session_id)
            .cloned()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        params: &TransportParams,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(RelayError::Internal(anyhow::anyhow!("factory failure")));
        }
        let transport = Arc::new(FakeTransport {
            params: params.clone(),
            events,
            log: Mutex::new(TransportLog::default()),
            closes: AtomicUsize::new(0),
            fail_remote: AtomicBool::new(self.reject_offer.swap(false, Ordering::SeqCst)),
        });
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// Inbound track fed from the test through a channel
pub struct FakeRemoteTrack {
    kind: MediaKind,
    ssrc: u32,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

impl FakeRemoteTrack {
    pub fn new(kind: MediaKind, ssrc: u32) -> (Arc<Self>, mpsc::UnboundedSender<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let track = Arc::new(Self {
            kind,
            ssrc,
            packets: tokio::sync::Mutex::new(rx),
        });
        (track, tx)
    }
}

#[async_trait]
impl RemoteMediaTrack for FakeRemoteTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    async fn read_packet(&self) -> Result<Packet> {
        self.packets
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| RelayError::Internal(anyhow::anyhow!("track ended")))
    }
}

#[derive(Default)]
pub struct RecordingSignal {
    sent: Mutex<Vec<OutboundSignal>>,
}

impl RecordingSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().unwrap().clone()
    }

    /// Events sent for `session_id`, in order
    pub fn events_for(&self, session_id: &str) -> Vec<OutboundEvent> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                OutboundSignal::Event {
                    session_id: id,
                    event,
                    ..
                } if id == session_id => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn count_named(&self, session_id: &str, name: &str) -> usize {
        self.events_for(session_id)
            .iter()
            .filter(|event| event.name() == name)
            .count()
    }
}

#[async_trait]
impl SignalSender for RecordingSignal {
    async fn send(&self, message: OutboundSignal) -> Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct CollectingSink {
    packets: Mutex<Vec<MediaPacket>>,
}

impl CollectingSink {
    pub fn sequence_numbers(&self) -> Vec<u16> {
        self.packets
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.packet.header.sequence_number)
            .collect()
    }
}

#[async_trait]
impl PacketSink for CollectingSink {
    async fn deliver(&self, packet: MediaPacket) -> Result<()> {
        self.packets.lock().unwrap().push(packet);
        Ok(())
    }
}
