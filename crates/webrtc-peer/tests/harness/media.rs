//! Synthetic local media for tests

use webrtc_peer::{MediaKind, MediaStream, MediaTrack};

pub fn audio_stream() -> MediaStream {
    MediaStream::new(vec![MediaTrack::new(MediaKind::Audio, "test-microphone")])
}

pub fn video_stream() -> MediaStream {
    MediaStream::new(vec![MediaTrack::new(MediaKind::Video, "test-camera")])
}

/// Camera-like stream with one audio and one video track
pub fn av_stream() -> MediaStream {
    MediaStream::new(vec![
        MediaTrack::new(MediaKind::Audio, "test-microphone"),
        MediaTrack::new(MediaKind::Video, "test-camera"),
    ])
}
