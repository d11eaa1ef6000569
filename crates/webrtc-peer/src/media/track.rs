//! Media track handles and streams

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Kind of media a track carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ready state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

type EndedHandler = Box<dyn FnOnce(MediaTrack) + Send>;

struct TrackInner {
    id: String,
    kind: MediaKind,
    label: String,
    remote: bool,
    enabled: AtomicBool,
    ended: AtomicBool,
    ended_handlers: Mutex<Vec<EndedHandler>>,
}

/// Shared handle to a media track
///
/// Clones refer to the same track: enabling, stopping or ending through
/// one handle is visible through all of them.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a local track with a fresh id
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, label)
    }

    pub fn with_id(id: impl Into<String>, kind: MediaKind, label: impl Into<String>) -> Self {
        Self::build(id.into(), kind, label.into(), false)
    }

    /// Create a handle for a track received from the remote peer
    pub fn remote(id: impl Into<String>, kind: MediaKind) -> Self {
        let id = id.into();
        let label = format!("remote {}", kind);
        Self::build(id, kind, label, true)
    }

    fn build(id: String, kind: MediaKind, label: String, remote: bool) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                label,
                remote,
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
                ended_handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_remote(&self) -> bool {
        self.inner.remote
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn ready_state(&self) -> TrackState {
        if self.inner.ended.load(Ordering::Acquire) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ready_state() == TrackState::Ended
    }

    /// Stop the track locally
    ///
    /// Ended handlers are discarded without being called. Stopping twice
    /// is a no-op.
    pub fn stop(&self) {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(track_id = %self.inner.id, kind = %self.inner.kind, "Track stopped");
        self.inner.ended_handlers.lock().clear();
    }

    /// Signal that the source of this track went away
    ///
    /// Marks the track ended and fires the `on_ended` handlers once.
    pub fn end(&self) {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(track_id = %self.inner.id, kind = %self.inner.kind, "Track ended at source");
        let handlers = std::mem::take(&mut *self.inner.ended_handlers.lock());
        for handler in handlers {
            handler(self.clone());
        }
    }

    /// Register a one-shot handler for [`MediaTrack::end`]
    ///
    /// Handlers registered on an already ended track are dropped.
    pub fn on_ended<F>(&self, handler: F)
    where
        F: FnOnce(MediaTrack) + Send + 'static,
    {
        let mut handlers = self.inner.ended_handlers.lock();
        if !self.is_ended() {
            handlers.push(Box::new(handler));
        }
    }

    /// Whether two handles refer to the same track
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.same_track(other)
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("remote", &self.inner.remote)
            .field("enabled", &self.enabled())
            .field("state", &self.ready_state())
            .finish()
    }
}

/// An ordered group of tracks sharing a stream id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> Vec<MediaTrack> {
        self.tracks
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(MediaKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(MediaKind::Video)
    }

    pub fn track_by_id(&self, id: &str) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.id() == id)
    }

    /// Add a track unless the same track is already present
    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.iter().any(|t| t.same_track(&track)) {
            self.tracks.push(track);
        }
    }

    pub fn remove_track(&mut self, track: &MediaTrack) -> bool {
        let before = self.tracks.len();
        self.tracks.retain(|t| !t.same_track(track));
        self.tracks.len() != before
    }

    /// Swap every track of `track`'s kind for `track`, returning the removed ones
    pub fn replace_kind(&mut self, track: MediaTrack) -> Vec<MediaTrack> {
        let kind = track.kind();
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tracks)
            .into_iter()
            .partition(|t| t.kind() == kind && !t.same_track(&track));
        self.tracks = kept;
        self.add_track(track);
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Whether any track is still live
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|t| !t.is_ended())
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}
