//! Session description helpers
//!
//! Full SDP parsing belongs to the transport engine. The relay only needs the
//! payload number the remote side picked for its preferred codec.

/// Find the payload number of the last `a=rtpmap` line naming `codec_name`.
///
/// Matching is case-insensitive on the encoding name, so `vp9` matches
/// `a=rtpmap:98 VP9/90000`.
pub fn find_payload_type(sdp: &str, codec_name: &str) -> Option<u8> {
    let needle = format!("{}/", codec_name.to_ascii_lowercase());

    sdp.lines().rev().find_map(|line| {
        let lower = line.trim().to_ascii_lowercase();
        let rest = lower.strip_prefix("a=rtpmap:")?;
        let (payload, encoding) = rest.split_once(' ')?;
        if !encoding.trim_start().starts_with(&needle) {
            return None;
        }
        payload.trim().parse().ok()
    })
}
