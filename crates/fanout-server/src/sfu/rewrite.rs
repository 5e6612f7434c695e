//! Per-subscription RTP header rewriting
//!
//! When the publisher of a stream reconnects its packets arrive with a new
//! SSRC and fresh sequence/timestamp bases. Subscribers keep one outbound
//! track for the lifetime of their session, so the numbering they see must
//! continue from where the previous publisher left off.

use webrtc::rtp::header::Header;

use super::forwarder::MediaKind;

/// Timestamp advance inserted at a publisher switch, one frame at 30fps
const VIDEO_TIMESTAMP_STEP: u32 = 3000;
/// One 20ms Opus frame at 48kHz
const AUDIO_TIMESTAMP_STEP: u32 = 960;

#[derive(Debug, Clone, Copy)]
struct RewriteState {
    ssrc: u32,
    seq_offset: u16,
    ts_offset: u32,
    last_seq: u16,
    last_ts: u32,
}

#[derive(Debug, Clone)]
pub struct SequenceRewriter {
    timestamp_step: u32,
    state: Option<RewriteState>,
}

impl SequenceRewriter {
    pub fn new(timestamp_step: u32) -> Self {
        Self {
            timestamp_step,
            state: None,
        }
    }

    pub fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::new(AUDIO_TIMESTAMP_STEP),
            MediaKind::Video => Self::new(VIDEO_TIMESTAMP_STEP),
        }
    }

    /// Rewrite `header` in place so numbering stays continuous
    pub fn rewrite(&mut self, header: &mut Header) {
        let step = self.timestamp_step;
        let state = self.state.get_or_insert(RewriteState {
            ssrc: header.ssrc,
            seq_offset: 0,
            ts_offset: 0,
            last_seq: header.sequence_number.wrapping_sub(1),
            last_ts: header.timestamp,
        });

        if state.ssrc != header.ssrc {
            state.seq_offset = state
                .last_seq
                .wrapping_add(1)
                .wrapping_sub(header.sequence_number);
            state.ts_offset = state
                .last_ts
                .wrapping_add(step)
                .wrapping_sub(header.timestamp);
            state.ssrc = header.ssrc;
            tracing::debug!(
                ssrc = header.ssrc,
                seq_offset = state.seq_offset,
                "Upstream SSRC changed, rebasing sequence numbers"
            );
        }

        header.sequence_number = header.sequence_number.wrapping_add(state.seq_offset);
        header.timestamp = header.timestamp.wrapping_add(state.ts_offset);

        if is_newer(header.sequence_number, state.last_seq) {
            state.last_seq = header.sequence_number;
            state.last_ts = header.timestamp;
        }
    }
}

fn is_newer(seq: u16, than: u16) -> bool {
    seq != than && seq.wrapping_sub(than) < 0x8000
}
