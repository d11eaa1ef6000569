//! Rendering seam for local and remote streams

use super::MediaStream;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::Instant;

/// A decoded video frame snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Raw pixel data (RGBA)
    pub data: Bytes,
    pub captured_at: Instant,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            data: data.into(),
            captured_at: Instant::now(),
        }
    }
}

/// Something a stream can be rendered into (a video element, a canvas, a file)
pub trait MediaSink: Send + Sync {
    fn attach(&self, stream: MediaStream);

    fn detach(&self);

    /// The currently attached stream
    fn stream(&self) -> Option<MediaStream>;

    /// Snapshot of the most recent frame
    ///
    /// Fails with [`Error::NoRemoteStream`] when nothing live is attached.
    fn current_frame(&self) -> Result<VideoFrame>;
}

/// Sink that keeps the last frame pushed into it
#[derive(Debug, Default)]
pub struct FrameBufferSink {
    stream: Mutex<Option<MediaStream>>,
    frame: Mutex<Option<VideoFrame>>,
}

impl FrameBufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rendered frame; ignored while detached
    pub fn push_frame(&self, frame: VideoFrame) {
        if self.stream.lock().is_some() {
            *self.frame.lock() = Some(frame);
        }
    }
}

impl MediaSink for FrameBufferSink {
    fn attach(&self, stream: MediaStream) {
        let mut current = self.stream.lock();
        if current.as_ref().map(|s| s.id()) != Some(stream.id()) {
            *self.frame.lock() = None;
        }
        *current = Some(stream);
    }

    fn detach(&self) {
        *self.stream.lock() = None;
        *self.frame.lock() = None;
    }

    fn stream(&self) -> Option<MediaStream> {
        self.stream.lock().clone()
    }

    fn current_frame(&self) -> Result<VideoFrame> {
        let live = self
            .stream
            .lock()
            .as_ref()
            .map(|s| s.video_tracks().iter().any(|t| !t.is_ended()))
            .unwrap_or(false);
        if !live {
            return Err(Error::NoRemoteStream);
        }

        self.frame
            .lock()
            .clone()
            .ok_or_else(|| Error::MediaTrackError("no frame rendered yet".to_string()))
    }
}
