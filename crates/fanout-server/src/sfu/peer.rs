//! webrtc-rs backed transport
//!
//! Builds one peer connection per session with a media engine registered for
//! the session's codec. Receiving roles get an audio and a video
//! `TrackLocalStaticRTP` labelled with their slot index; forwarded RTP is
//! written into those tracks unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fanout_media::{CodecSelection, register_codecs};
use fanout_protocol::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtcp::transport_feedbacks::rapid_resynchronization_request::RapidResynchronizationRequest;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use super::forwarder::MediaKind;
use super::transport::{
    FeedbackMessage, PeerTransport, RemoteMediaTrack, TransportEvent, TransportFactory,
    TransportParams,
};
use crate::error::{RelayError, Result};
use crate::ice::IceServerProvider;

const RTCP_READ_BUFFER: usize = 1500;

/// Creates webrtc-rs peer connections
pub struct WebRtcTransportFactory {
    ice: Arc<IceServerProvider>,
}

impl WebRtcTransportFactory {
    pub fn new(ice: Arc<IceServerProvider>) -> Self {
        Self { ice }
    }

    fn build_api(codec: &CodecSelection) -> Result<API> {
        let mut media_engine = MediaEngine::default();
        register_codecs(&mut media_engine, codec)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(SettingEngine::default())
            .build())
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        params: &TransportParams,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let api = Self::build_api(&params.codec)?;
        let ice_servers = self
            .ice
            .fetch(params.role.as_str(), &params.session_id)
            .await;

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let mut local_tracks = HashMap::new();
        if params.has_local_tracks() {
            let label = params.local_track_label();
            for (kind, capability) in [
                (MediaKind::Audio, params.codec.audio_capability()),
                (MediaKind::Video, params.codec.video_capability()),
            ] {
                let track = Arc::new(TrackLocalStaticRTP::new(
                    capability,
                    format!("{}-{}", kind, label),
                    label.clone(),
                ));
                let sender = pc
                    .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;

                // Interceptors only see incoming RTCP if someone reads it
                tokio::spawn(async move {
                    let mut buf = vec![0u8; RTCP_READ_BUFFER];
                    while sender.read(&mut buf).await.is_ok() {}
                });

                local_tracks.insert(kind, track);
            }
        }

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::error!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = tx.send(TransportEvent::Connectivity(state.into()));
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let _ = tx.send(TransportEvent::RemoteTrack(Arc::new(WebRtcRemoteTrack {
                track,
            })));
            Box::pin(async {})
        }));

        tracing::info!(
            stream_id = %params.stream_id,
            session_id = %params.session_id,
            role = %params.role,
            codec = %params.codec.codec,
            payload_type = params.codec.payload_type,
            "Created peer connection"
        );

        Ok(Arc::new(WebRtcTransport { pc, local_tracks }))
    }
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    local_tracks: HashMap<MediaKind, Arc<TrackLocalStaticRTP>>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| RelayError::NegotiationFailure(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| RelayError::NegotiationFailure(format!("remote description: {}", e)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| RelayError::NegotiationFailure(format!("create answer: {}", e)))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| RelayError::NegotiationFailure(format!("local description: {}", e)))?;

        let local = self.pc.local_description().await.ok_or_else(|| {
            RelayError::NegotiationFailure("local description missing after answer".to_string())
        })?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn write_rtp(&self, kind: MediaKind, packet: &Packet) -> Result<()> {
        let track = self
            .local_tracks
            .get(&kind)
            .ok_or_else(|| anyhow::anyhow!("no local {} track", kind))?;
        track.write_rtp(packet).await?;
        Ok(())
    }

    async fn send_feedback(&self, message: FeedbackMessage) -> Result<()> {
        match message {
            FeedbackMessage::PictureLoss { media_ssrc } => {
                self.pc
                    .write_rtcp(&[Box::new(PictureLossIndication {
                        sender_ssrc: 0,
                        media_ssrc,
                    })])
                    .await?;
            }
            FeedbackMessage::RapidResync { media_ssrc } => {
                self.pc
                    .write_rtcp(&[Box::new(RapidResynchronizationRequest {
                        sender_ssrc: 0,
                        media_ssrc,
                    })])
                    .await?;
            }
            FeedbackMessage::BitrateEstimate { bitrate_bps, ssrcs } => {
                self.pc
                    .write_rtcp(&[Box::new(ReceiverEstimatedMaximumBitrate {
                        sender_ssrc: 0,
                        bitrate: bitrate_bps as f32,
                        ssrcs,
                    })])
                    .await?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

struct WebRtcRemoteTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteMediaTrack for WebRtcRemoteTrack {
    fn kind(&self) -> MediaKind {
        self.track.kind().into()
    }

    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    async fn read_packet(&self) -> Result<Packet> {
        let (packet, _attributes) = self.track.read_rtp().await?;
        Ok(packet)
    }
}
