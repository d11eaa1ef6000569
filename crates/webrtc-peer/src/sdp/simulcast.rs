//! Legacy SSRC-group simulcast mangling
//!
//! Rewrites a local description so that it advertises three simulcast
//! layers (`a=ssrc-group:SIM 1 2 3`) fed by the first local video track.
//! Only engines that understand the `x-google-flag:conference` extension
//! honor the result.

use crate::media::MediaStream;
use tracing::{debug, warn};

const FID_GROUP_PREFIX: &str = "a=ssrc-group:FID";
const SIMULCAST_SSRCS: [u32; 3] = [1, 2, 3];

/// SDP line-list transform that appends a simulcast SSRC block
#[derive(Debug, Clone, Copy)]
pub struct SimulcastMangler {
    supported: bool,
}

impl SimulcastMangler {
    /// `supported` reflects whether the connection honors legacy SSRC groups
    pub fn new(supported: bool) -> Self {
        Self { supported }
    }

    /// Mangle `sdp` for `stream`
    ///
    /// The first `a=ssrc-group:FID` line and every line after it are
    /// dropped, then the simulcast block is appended. Unsupported engines
    /// and streams without a video track get `sdp` back unchanged.
    pub fn mangle(&self, sdp: &str, stream: &MediaStream) -> String {
        if !self.supported {
            warn!("Simulcast is only available with legacy SSRC-group support, leaving SDP untouched");
            return sdp.to_string();
        }

        let Some(block) = simulcast_block(stream) else {
            warn!(stream_id = %stream.id(), "No video track available for simulcast, leaving SDP untouched");
            return sdp.to_string();
        };

        let mut lines: Vec<&str> = sdp.lines().filter(|line| !line.is_empty()).collect();
        if let Some(cut) = lines.iter().position(|line| line.starts_with(FID_GROUP_PREFIX)) {
            debug!("Dropping {} SDP lines from the FID group onward", lines.len() - cut);
            lines.truncate(cut);
        }

        let mut out = String::with_capacity(sdp.len() + 512);
        for line in lines.iter().copied().chain(block.iter().map(String::as_str)) {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out
    }
}

fn simulcast_block(stream: &MediaStream) -> Option<Vec<String>> {
    let track = stream.video_tracks().into_iter().next()?;
    let stream_id = stream.id();
    let track_id = track.id();

    let ssrc_list = SIMULCAST_SSRCS
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(" ");

    let mut block = vec![
        "a=x-google-flag:conference".to_string(),
        format!("a=ssrc-group:SIM {}", ssrc_list),
    ];
    for ssrc in SIMULCAST_SSRCS {
        block.push(format!("a=ssrc:{} cname:localVideo", ssrc));
        block.push(format!("a=ssrc:{} msid:{} {}", ssrc, stream_id, track_id));
        block.push(format!("a=ssrc:{} mslabel:{}", ssrc, stream_id));
        block.push(format!("a=ssrc:{} label:{}", ssrc, track_id));
    }
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaKind, MediaTrack};

    const SDP: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=ssrc-group:FID 1111 2222\r\n\
a=ssrc:1111 cname:abc\r\n\
a=ssrc:2222 cname:abc\r\n";

    fn video_stream() -> MediaStream {
        MediaStream::with_id(
            "stream-a",
            vec![MediaTrack::with_id("track-v", MediaKind::Video, "camera")],
        )
    }

    #[test]
    fn test_unsupported_leaves_sdp() {
        let out = SimulcastMangler::new(false).mangle(SDP, &video_stream());
        assert_eq!(out, SDP);
    }

    #[test]
    fn test_no_video_track_leaves_sdp() {
        let stream = MediaStream::with_id(
            "stream-a",
            vec![MediaTrack::with_id("track-a", MediaKind::Audio, "mic")],
        );
        let out = SimulcastMangler::new(true).mangle(SDP, &stream);
        assert_eq!(out, SDP);
    }

    #[test]
    fn test_cuts_at_fid_group_and_appends_block() {
        let out = SimulcastMangler::new(true).mangle(SDP, &video_stream());

        assert!(!out.contains("ssrc-group:FID"));
        assert!(!out.contains("a=ssrc:1111"));
        assert!(out.starts_with("v=0\r\n"));
        assert!(out.contains("a=rtpmap:96 VP8/90000\r\na=x-google-flag:conference\r\n"));
        assert!(out.contains("a=ssrc-group:SIM 1 2 3\r\n"));
        for ssrc in 1..=3 {
            assert!(out.contains(&format!("a=ssrc:{} cname:localVideo\r\n", ssrc)));
            assert!(out.contains(&format!("a=ssrc:{} msid:stream-a track-v\r\n", ssrc)));
            assert!(out.contains(&format!("a=ssrc:{} mslabel:stream-a\r\n", ssrc)));
            assert!(out.contains(&format!("a=ssrc:{} label:track-v\r\n", ssrc)));
        }
        assert!(out.ends_with("a=ssrc:3 label:track-v\r\n"));
    }

    #[test]
    fn test_without_fid_group_keeps_all_lines() {
        let sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
        let out = SimulcastMangler::new(true).mangle(sdp, &video_stream());
        assert!(out.starts_with(sdp));
        assert_eq!(out.lines().count(), 2 + 2 + 12);
    }

    #[test]
    fn test_lf_only_input_is_normalized() {
        let sdp = "v=0\nm=video 9 UDP/TLS/RTP/SAVPF 96\na=ssrc-group:FID 1 2\n";
        let out = SimulcastMangler::new(true).mangle(sdp, &video_stream());
        assert!(out.starts_with("v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=x-google-flag"));
    }
}
