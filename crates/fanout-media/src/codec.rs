//! Codec catalogue
//!
//! The relay forwards RTP untouched, so both sides must agree on exactly the
//! codec and payload number the local slot tracks are created with.

use std::fmt;
use std::str::FromStr;

use webrtc::api::media_engine::MediaEngine;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};

use crate::error::{MediaError, Result};
use crate::sdp::find_payload_type;

const VIDEO_CLOCK_RATE: u32 = 90000;
const ULPFEC_PAYLOAD_TYPE: u8 = 116;

const HEADER_EXTENSIONS: [&str; 3] = [
    "urn:ietf:params:rtp-hdrext:sdes:mid",
    "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
    "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
];

/// Video codec type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    VP8,
    VP9,
    H264,
}

impl VideoCodec {
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::VP9 => "video/VP9",
            VideoCodec::H264 => "video/H264",
        }
    }

    /// Encoding name as it appears in `a=rtpmap` lines
    pub fn encoding_name(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "VP8",
            VideoCodec::VP9 => "VP9",
            VideoCodec::H264 => "H264",
        }
    }

    pub fn default_payload_type(&self) -> u8 {
        match self {
            VideoCodec::VP8 => 96,
            VideoCodec::VP9 => 98,
            VideoCodec::H264 => 102,
        }
    }

    fn fmtp_line(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "",
            VideoCodec::VP9 => "profile-id=0",
            VideoCodec::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            }
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding_name())
    }
}

impl FromStr for VideoCodec {
    type Err = MediaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vp8" => Ok(VideoCodec::VP8),
            "vp9" => Ok(VideoCodec::VP9),
            "h264" => Ok(VideoCodec::H264),
            other => Err(MediaError::UnsupportedCodec(other.to_string())),
        }
    }
}

/// The codec and payload number a session is negotiated with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecSelection {
    pub codec: VideoCodec,
    pub payload_type: u8,
}

impl Default for CodecSelection {
    fn default() -> Self {
        Self {
            codec: VideoCodec::VP9,
            payload_type: VideoCodec::VP9.default_payload_type(),
        }
    }
}

impl CodecSelection {
    /// Resolve against an offer.
    ///
    /// Without a configured codec the default pair is used. Otherwise the
    /// payload number the offer assigns to the codec is used, falling back to
    /// the codec's usual payload number.
    pub fn resolve(configured: Option<VideoCodec>, offer_sdp: &str) -> Self {
        let Some(codec) = configured else {
            return Self::default();
        };

        let payload_type = match find_payload_type(offer_sdp, codec.encoding_name()) {
            Some(payload_type) => payload_type,
            None => {
                tracing::warn!(
                    "No rtpmap for {} in offer, using payload {}",
                    codec,
                    codec.default_payload_type()
                );
                codec.default_payload_type()
            }
        };

        Self {
            codec,
            payload_type,
        }
    }

    /// Capability for local video tracks, matching the MediaEngine registration
    pub fn video_capability(&self) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: self.codec.mime_type().to_string(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: self.codec.fmtp_line().to_string(),
            rtcp_feedback: video_feedback(),
        }
    }

    /// Capability for local audio tracks
    pub fn audio_capability(&self) -> RTCRtpCodecCapability {
        opus_capability()
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

fn video_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

fn rtx_parameters(payload_type: u8, apt: u8) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: "video/rtx".to_string(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: format!("apt={}", apt),
            rtcp_feedback: vec![],
        },
        payload_type,
        ..Default::default()
    }
}

/// Register the audio catalogue, the selected video codec and the SDES
/// header extensions on `media_engine`.
pub fn register_codecs(media_engine: &mut MediaEngine, selection: &CodecSelection) -> Result<()> {
    let audio = [
        (opus_capability(), 111),
        (plain_audio("audio/G722", 8000), 9),
        (plain_audio("audio/PCMU", 8000), 0),
        (plain_audio("audio/PCMA", 8000), 8),
    ];
    for (capability, payload_type) in audio {
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability,
                payload_type,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
    }

    let pt = selection.payload_type;
    let mut video = vec![
        RTCRtpCodecParameters {
            capability: selection.video_capability(),
            payload_type: pt,
            ..Default::default()
        },
        rtx_parameters(pt.wrapping_add(1), pt),
    ];

    if selection.codec == VideoCodec::VP9 {
        let profile_one = pt.wrapping_add(2);
        video.push(RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                sdp_fmtp_line: "profile-id=1".to_string(),
                ..selection.video_capability()
            },
            payload_type: profile_one,
            ..Default::default()
        });
        video.push(rtx_parameters(pt.wrapping_add(3), profile_one));
        video.push(RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: "video/ulpfec".to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            payload_type: ULPFEC_PAYLOAD_TYPE,
            ..Default::default()
        });
    }

    for parameters in video {
        media_engine.register_codec(parameters, RTPCodecType::Video)?;
    }

    for uri in HEADER_EXTENSIONS {
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            media_engine.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: uri.to_string(),
                },
                kind,
                None,
            )?;
        }
    }

    tracing::debug!("Registered codecs with {} at payload {}", selection.codec, pt);

    Ok(())
}

fn plain_audio(mime_type: &str, clock_rate: u32) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: mime_type.to_string(),
        clock_rate,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}
