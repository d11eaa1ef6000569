//! Construction options for [`crate::Peer`]

use super::events::{
    CandidateHandler, GatheringDoneHandler, NegotiationNeededHandler, StreamEndedHandler,
    TrackHandler,
};
use crate::channels::DataChannelHandlers;
use crate::config::{DataChannelConfig, MediaConstraints, PeerConfig, RtcConfiguration, SendSource};
use crate::connection::{
    ConnectionFactory, PeerConnectionBackend, RemoteTrack, WebRtcConnectionFactory,
};
use crate::media::{MediaSink, MediaStream, MediaTrack, SyntheticTrackSource, TrackSource};
use crate::sdp::{IceCandidate, SdpTranslator};
use std::fmt;
use std::sync::Arc;

/// Everything a peer needs besides its mode
///
/// The serializable part lives in [`PeerConfig`]; the rest are runtime
/// collaborators and callbacks.
///
/// ```no_run
/// use webrtc_peer::{Peer, PeerMode, PeerOptions};
///
/// # async fn run() -> webrtc_peer::Result<()> {
/// let peer = Peer::new(
///     PeerMode::SendRecv,
///     PeerOptions::new()
///         .with_simulcast(true)
///         .on_ice_candidate(|candidate| println!("local candidate {}", candidate.candidate)),
/// )
/// .await?;
/// peer.ready().await?;
/// let offer = peer.generate_offer().await?;
/// # let _ = offer;
/// # Ok(())
/// # }
/// ```
pub struct PeerOptions {
    pub(crate) config: PeerConfig,
    pub(crate) audio_stream: Option<MediaStream>,
    pub(crate) video_stream: Option<MediaStream>,
    pub(crate) connection: Option<Arc<dyn PeerConnectionBackend>>,
    pub(crate) connection_factory: Arc<dyn ConnectionFactory>,
    pub(crate) track_source: Arc<dyn TrackSource>,
    pub(crate) local_sink: Option<Arc<dyn MediaSink>>,
    pub(crate) remote_sink: Option<Arc<dyn MediaSink>>,
    pub(crate) sdp_translator: Option<Arc<dyn SdpTranslator>>,
    pub(crate) data_channel_handlers: DataChannelHandlers,
    pub(crate) on_ice_candidate: Option<CandidateHandler>,
    pub(crate) on_candidate_gathering_done: Option<GatheringDoneHandler>,
    pub(crate) on_negotiation_needed: Option<NegotiationNeededHandler>,
    pub(crate) on_stream_ended: Option<StreamEndedHandler>,
    pub(crate) on_track: Option<TrackHandler>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            config: PeerConfig::default(),
            audio_stream: None,
            video_stream: None,
            connection: None,
            connection_factory: Arc::new(WebRtcConnectionFactory),
            track_source: Arc::new(SyntheticTrackSource::new()),
            local_sink: None,
            remote_sink: None,
            sdp_translator: None,
            data_channel_handlers: DataChannelHandlers::default(),
            on_ice_candidate: None,
            on_candidate_gathering_done: None,
            on_negotiation_needed: None,
            on_stream_ended: None,
            on_track: None,
        }
    }
}

impl PeerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole serializable configuration
    pub fn with_config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.config.id = Some(id.into());
        self
    }

    pub fn with_simulcast(mut self, simulcast: bool) -> Self {
        self.config.simulcast = simulcast;
        self
    }

    pub fn with_send_source(mut self, source: SendSource) -> Self {
        self.config.send_source = source;
        self
    }

    pub fn with_media_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.config.media_constraints = constraints;
        self
    }

    pub fn with_configuration(mut self, configuration: RtcConfiguration) -> Self {
        self.config.configuration = configuration;
        self
    }

    /// Create a data channel at construction with the given settings
    pub fn with_data_channel(mut self, config: DataChannelConfig) -> Self {
        self.config.data_channels = true;
        self.config.data_channel = config;
        self
    }

    pub fn with_data_channel_handlers(mut self, handlers: DataChannelHandlers) -> Self {
        self.config.data_channels = true;
        self.data_channel_handlers = handlers;
        self
    }

    /// Local audio to send instead of capturing
    pub fn with_audio_stream(mut self, stream: MediaStream) -> Self {
        self.audio_stream = Some(stream);
        self
    }

    /// Local video (possibly with audio) to send instead of capturing
    pub fn with_video_stream(mut self, stream: MediaStream) -> Self {
        self.video_stream = Some(stream);
        self
    }

    /// Use a pre-built connection for the first initialization
    ///
    /// Recoveries still go through the connection factory.
    pub fn with_connection(mut self, connection: Arc<dyn PeerConnectionBackend>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.connection_factory = factory;
        self
    }

    pub fn with_track_source(mut self, source: Arc<dyn TrackSource>) -> Self {
        self.track_source = source;
        self
    }

    pub fn with_local_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.local_sink = Some(sink);
        self
    }

    pub fn with_remote_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.remote_sink = Some(sink);
        self
    }

    pub fn with_sdp_translator(mut self, translator: Arc<dyn SdpTranslator>) -> Self {
        self.sdp_translator = Some(translator);
        self
    }

    pub fn on_ice_candidate(mut self, f: impl Fn(IceCandidate) + Send + Sync + 'static) -> Self {
        self.on_ice_candidate = Some(Arc::new(f));
        self
    }

    pub fn on_candidate_gathering_done(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_candidate_gathering_done = Some(Arc::new(f));
        self
    }

    pub fn on_negotiation_needed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_negotiation_needed = Some(Arc::new(f));
        self
    }

    pub fn on_stream_ended(mut self, f: impl Fn(MediaTrack) + Send + Sync + 'static) -> Self {
        self.on_stream_ended = Some(Arc::new(f));
        self
    }

    pub fn on_track(mut self, f: impl Fn(RemoteTrack) + Send + Sync + 'static) -> Self {
        self.on_track = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for PeerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerOptions")
            .field("config", &self.config)
            .field("audio_stream", &self.audio_stream.as_ref().map(|s| s.id()))
            .field("video_stream", &self.video_stream.as_ref().map(|s| s.id()))
            .field("connection", &self.connection.is_some())
            .field("local_sink", &self.local_sink.is_some())
            .field("remote_sink", &self.remote_sink.is_some())
            .field("sdp_translator", &self.sdp_translator.is_some())
            .field("data_channel_handlers", &self.data_channel_handlers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataChannelMode;

    #[test]
    fn test_builder_fills_config() {
        let options = PeerOptions::new()
            .with_id("viewer")
            .with_simulcast(true)
            .with_send_source(SendSource::Screen)
            .with_media_constraints(MediaConstraints::video_only())
            .with_data_channel(DataChannelConfig::from_mode(DataChannelMode::Unreliable));

        assert_eq!(options.config.id.as_deref(), Some("viewer"));
        assert!(options.config.simulcast);
        assert_eq!(options.config.send_source, SendSource::Screen);
        assert!(!options.config.media_constraints.wants_audio());
        assert!(options.config.data_channels);
        assert!(!options.config.data_channel.ordered);
        assert!(options.config.validate().is_ok());
    }

    #[test]
    fn test_handlers_enable_data_channel() {
        let options = PeerOptions::new().with_data_channel_handlers(DataChannelHandlers::new());
        assert!(options.config.data_channels);
        assert!(format!("{:?}", options).contains("PeerOptions"));
    }
}
