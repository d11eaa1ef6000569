//! Media acquisition seam

use super::{MediaKind, MediaStream, MediaTrack};
use crate::config::{MediaConstraints, SendSource};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, instrument};

/// Capture device access (camera/microphone and screen)
#[async_trait]
pub trait TrackSource: Send + Sync {
    /// Capture from camera and microphone
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream>;

    /// Capture the screen
    async fn display_media(&self, constraints: &MediaConstraints) -> Result<MediaStream>;

    /// Capture from the given source
    async fn acquire(
        &self,
        source: SendSource,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream> {
        match source {
            SendSource::Webcam => self.user_media(constraints).await,
            SendSource::Screen => self.display_media(constraints).await,
        }
    }
}

/// Headless source producing synthetic tracks
///
/// Every acquisition returns fresh tracks. A source built with
/// [`SyntheticTrackSource::failing`] rejects every request, which is how
/// denied permissions or missing devices are simulated.
#[derive(Debug, Default)]
pub struct SyntheticTrackSource {
    failure: Option<String>,
    acquisitions: AtomicUsize,
}

impl SyntheticTrackSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Number of successful acquisitions so far
    pub fn acquisition_count(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        match &self.failure {
            Some(message) => Err(Error::MediaAcquisition(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TrackSource for SyntheticTrackSource {
    #[instrument(skip(self, constraints))]
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        self.check()?;

        let mut tracks = Vec::new();
        if constraints.wants_audio() {
            tracks.push(MediaTrack::new(MediaKind::Audio, "synthetic-microphone"));
        }
        if constraints.wants_video() {
            tracks.push(MediaTrack::new(MediaKind::Video, "synthetic-camera"));
        }
        if tracks.is_empty() {
            return Err(Error::MediaAcquisition(
                "at least one of audio or video must be requested".to_string(),
            ));
        }

        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let stream = MediaStream::new(tracks);
        debug!(stream_id = %stream.id(), tracks = stream.tracks().len(), "Synthetic camera stream acquired");
        Ok(stream)
    }

    #[instrument(skip(self, constraints))]
    async fn display_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        self.check()?;

        let mut tracks = vec![MediaTrack::new(MediaKind::Video, "synthetic-screen")];
        if constraints.wants_audio() {
            tracks.push(MediaTrack::new(MediaKind::Audio, "synthetic-system-audio"));
        }

        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let stream = MediaStream::new(tracks);
        debug!(stream_id = %stream.id(), "Synthetic screen stream acquired");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_user_media_follows_constraints() {
        let source = SyntheticTrackSource::new();
        let stream = source
            .user_media(&MediaConstraints::audio_only())
            .await
            .unwrap();
        assert_eq!(stream.audio_tracks().len(), 1);
        assert!(stream.video_tracks().is_empty());

        let stream = source.user_media(&MediaConstraints::default()).await.unwrap();
        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(source.acquisition_count(), 2);
    }

    #[tokio::test]
    async fn test_nothing_requested_fails() {
        let source = SyntheticTrackSource::new();
        let constraints = MediaConstraints {
            audio: crate::config::MediaRequest::Enabled(false),
            video: crate::config::MediaRequest::Enabled(false),
        };
        let err = source.user_media(&constraints).await.unwrap_err();
        assert!(err.is_media_error());
    }

    #[tokio::test]
    async fn test_acquire_screen() {
        let source = SyntheticTrackSource::new();
        let stream = source
            .acquire(SendSource::Screen, &MediaConstraints::default())
            .await
            .unwrap();
        assert_eq!(stream.video_tracks()[0].label(), "synthetic-screen");
        assert_eq!(stream.audio_tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_source() {
        let source = SyntheticTrackSource::failing("permission denied");
        let err = source
            .acquire(SendSource::Webcam, &MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaAcquisition(m) if m == "permission denied"));
        assert_eq!(source.acquisition_count(), 0);
    }
}
