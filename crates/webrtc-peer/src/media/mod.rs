//! Media tracks, streams and the capture/render capability seams

pub mod sink;
pub mod source;
pub mod track;

pub use sink::{FrameBufferSink, MediaSink, VideoFrame};
pub use source::{SyntheticTrackSource, TrackSource};
pub use track::{MediaKind, MediaStream, MediaTrack, TrackState};
