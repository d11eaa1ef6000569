//! Peer negotiation core
//!
//! A [`Peer`] owns one underlying connection at a time. Every connection
//! goes through the same initialization routine: install the event
//! handler, create the data channel, attach local media (capturing it
//! first when needed). When a connection reaches `closed` it is replaced by
//! a fresh one from the factory and the routine runs again; the `Peer`
//! itself survives until [`Peer::dispose`].

use super::candidates::CandidateDispatcher;
use super::events::{
    NegotiationNeededHandler, StreamEndedHandler, Subscribers, SubscriptionId, TrackHandler,
};
use super::options::PeerOptions;
use super::state::{Lifecycle, PeerState};
use crate::channels::{DataChannel, DataChannelHandlers, DataChannelMessage};
use crate::config::{PeerConfig, PeerMode, RtcConfiguration, SendSource};
use crate::connection::{
    ConnectionEvent, ConnectionFactory, ConnectionState, PeerConnectionBackend, RemoteTrack,
    RtpReceiver, RtpSender, TransceiverDirection,
};
use crate::media::{MediaKind, MediaSink, MediaStream, MediaTrack, TrackSource, VideoFrame};
use crate::sdp::{IceCandidate, SdpTranslator, SessionDescription, SimulcastMangler};
use crate::{Error, Result};
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// What [`Peer::replace_track`] swaps in
#[derive(Debug, Clone)]
pub enum TrackReplacement {
    /// An existing track; replaces senders of the same kind
    Track(MediaTrack),
    /// Capture a new video track from this source first
    Source(SendSource),
}

impl From<MediaTrack> for TrackReplacement {
    fn from(track: MediaTrack) -> Self {
        TrackReplacement::Track(track)
    }
}

impl From<SendSource> for TrackReplacement {
    fn from(source: SendSource) -> Self {
        TrackReplacement::Source(source)
    }
}

struct Current {
    connection: Arc<dyn PeerConnectionBackend>,
    generation: u64,
}

#[derive(Default)]
struct LocalStreams {
    audio: Option<MediaStream>,
    video: Option<MediaStream>,
    /// Connection generation the tracks were last attached to
    attached_generation: Option<u64>,
}

impl LocalStreams {
    fn all(&self) -> Vec<MediaStream> {
        self.video.iter().chain(self.audio.iter()).cloned().collect()
    }

    fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

struct PeerInner {
    self_ref: Weak<PeerInner>,
    id: String,
    mode: PeerMode,
    config: PeerConfig,
    rtc_configuration: RtcConfiguration,

    current: RwLock<Current>,
    factory: Arc<dyn ConnectionFactory>,
    track_source: Arc<dyn TrackSource>,

    /// Serializes initialization runs, recoveries and media attachment
    init_lock: tokio::sync::Mutex<()>,
    acquiring: AtomicBool,
    lifecycle: Lifecycle,

    streams: Mutex<LocalStreams>,
    remote_stream: Mutex<Option<MediaStream>>,
    watched_tracks: Mutex<Vec<MediaTrack>>,

    data_channel: RwLock<Option<DataChannel>>,
    data_channel_handlers: DataChannelHandlers,

    candidates: CandidateDispatcher,
    stream_ended: Mutex<Subscribers<dyn Fn(MediaTrack) + Send + Sync>>,
    on_track: Option<TrackHandler>,
    on_negotiation_needed: Option<NegotiationNeededHandler>,

    local_sink: Option<Arc<dyn MediaSink>>,
    remote_sink: Option<Arc<dyn MediaSink>>,
    translator: Option<Arc<dyn SdpTranslator>>,
}

/// A WebRTC peer with declarative offer/answer negotiation
///
/// Cheap to clone; clones share the same peer.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Create a peer and run its initialization routine
    ///
    /// Returns once the connection exists and its handlers are wired. Local
    /// media capture may still be running; await [`Peer::ready`] before
    /// negotiating.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, when the connection cannot be
    /// created, or when the data channel cannot be set up.
    #[instrument(skip_all, fields(mode = %mode))]
    pub async fn new(mode: PeerMode, options: PeerOptions) -> Result<Self> {
        options.config.validate()?;

        let PeerOptions {
            config,
            audio_stream,
            video_stream,
            connection,
            connection_factory,
            track_source,
            local_sink,
            remote_sink,
            sdp_translator,
            data_channel_handlers,
            on_ice_candidate,
            on_candidate_gathering_done,
            on_negotiation_needed,
            on_stream_ended,
            on_track,
        } = options;

        let id = config
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let rtc_configuration = config.configuration.merged_with_defaults();

        let connection = match connection {
            Some(connection) => connection,
            None => connection_factory.create(&rtc_configuration).await?,
        };

        let candidates = CandidateDispatcher::new(sdp_translator.clone());
        if let Some(handler) = on_ice_candidate {
            candidates.subscribe_candidates(handler);
        }
        if let Some(handler) = on_candidate_gathering_done {
            candidates.subscribe_gathering_done(handler);
        }

        let mut stream_ended = Subscribers::new();
        if let Some(handler) = on_stream_ended {
            stream_ended.add(handler);
        }

        let inner = Arc::new_cyclic(|self_ref| PeerInner {
            self_ref: self_ref.clone(),
            id,
            mode,
            config,
            rtc_configuration,
            current: RwLock::new(Current {
                connection,
                generation: 0,
            }),
            factory: connection_factory,
            track_source,
            init_lock: tokio::sync::Mutex::new(()),
            acquiring: AtomicBool::new(false),
            lifecycle: Lifecycle::new(),
            streams: Mutex::new(LocalStreams {
                audio: audio_stream,
                video: video_stream,
                attached_generation: None,
            }),
            remote_stream: Mutex::new(None),
            watched_tracks: Mutex::new(Vec::new()),
            data_channel: RwLock::new(None),
            data_channel_handlers,
            candidates,
            stream_ended: Mutex::new(stream_ended),
            on_track,
            on_negotiation_needed,
            local_sink,
            remote_sink,
            translator: sdp_translator,
        });

        {
            let guard = inner.init_lock.lock().await;
            inner.initialize(&guard).await?;
        }

        info!(peer_id = %inner.id, "Peer created");
        Ok(Self { inner })
    }

    /// Resolves once local media is attached and negotiation is safe
    ///
    /// Fails with the capture error when media acquisition failed, with
    /// [`Error::ConnectionClosed`] when the connection closed before media
    /// could be attached, and with [`Error::Disposed`] when the peer was
    /// disposed first. Every caller observes the same outcome.
    pub async fn ready(&self) -> Result<()> {
        self.inner.lifecycle.ready().await
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn mode(&self) -> PeerMode {
        self.inner.mode
    }

    pub fn state(&self) -> PeerState {
        self.inner.lifecycle.state()
    }

    /// The underlying connection currently in use
    ///
    /// Replaced after a recovery; do not hold on to it across one.
    pub fn connection(&self) -> Arc<dyn PeerConnectionBackend> {
        self.inner.connection()
    }

    /// Create an offer and set it as the local description
    ///
    /// In `recvonly` mode a receive-only transceiver is added for each
    /// media kind the constraints do not disable. In `sendonly` mode every
    /// transceiver is switched to send-only first. Returns the local SDP.
    #[instrument(skip(self), fields(peer_id = %self.inner.id))]
    pub async fn generate_offer(&self) -> Result<String> {
        let connection = self.inner.connection_for_negotiation()?;
        let _negotiation = self.inner.lifecycle.begin_negotiation()?;

        match self.inner.mode {
            PeerMode::RecvOnly => {
                let constraints = &self.inner.config.media_constraints;
                if constraints.wants_audio() {
                    connection
                        .add_transceiver(MediaKind::Audio, TransceiverDirection::RecvOnly)
                        .await?;
                }
                if constraints.wants_video() {
                    connection
                        .add_transceiver(MediaKind::Video, TransceiverDirection::RecvOnly)
                        .await?;
                }
            }
            PeerMode::SendOnly => {
                for transceiver in connection.transceivers().await {
                    transceiver
                        .set_direction(TransceiverDirection::SendOnly)
                        .await?;
                }
            }
            PeerMode::SendRecv => {}
        }

        let offer = connection.create_offer().await?;
        debug!("Created offer");
        let offer = self.inner.mangle_for_simulcast(&connection, offer);
        connection.set_local_description(offer).await?;

        let local = self.inner.local_description_for_app(&connection).await?;
        info!("Local offer ready");
        Ok(local.sdp)
    }

    /// Apply a remote answer to a previously generated offer
    #[instrument(skip(self, sdp), fields(peer_id = %self.inner.id))]
    pub async fn process_answer(&self, sdp: impl Into<String>) -> Result<()> {
        let connection = self.inner.connection_for_negotiation()?;
        let _negotiation = self.inner.lifecycle.begin_negotiation()?;

        let answer = self.inner.remote_for_connection(SessionDescription::answer(sdp))?;
        connection.set_remote_description(answer).await?;
        self.inner.wire_remote_tracks(&connection).await;

        info!("Remote answer applied");
        Ok(())
    }

    /// Apply a remote offer and answer it, returning the local answer SDP
    #[instrument(skip(self, sdp), fields(peer_id = %self.inner.id))]
    pub async fn process_offer(&self, sdp: impl Into<String>) -> Result<String> {
        let connection = self.inner.connection_for_negotiation()?;
        let _negotiation = self.inner.lifecycle.begin_negotiation()?;

        let offer = self.inner.remote_for_connection(SessionDescription::offer(sdp))?;
        connection.set_remote_description(offer).await?;
        self.inner.wire_remote_tracks(&connection).await;

        let answer = connection.create_answer().await?;
        debug!("Created answer");
        let answer = self.inner.mangle_for_simulcast(&connection, answer);
        connection.set_local_description(answer).await?;

        let local = self.inner.local_description_for_app(&connection).await?;
        info!("Local answer ready");
        Ok(local.sdp)
    }

    /// Add a candidate received from the remote peer
    #[instrument(skip(self, candidate), fields(peer_id = %self.inner.id))]
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let connection = self.inner.connection_for_negotiation()?;
        let candidate = match &self.inner.translator {
            Some(translator) => translator.candidate_to_plan_b(&candidate)?,
            None => candidate,
        };
        debug!(candidate = %candidate.candidate, "Adding remote ICE candidate");
        connection.add_ice_candidate(candidate).await
    }

    /// Subscribe to local ICE candidates
    ///
    /// The first candidate or gathering-done subscription receives every
    /// event buffered since construction.
    pub fn on_ice_candidate(
        &self,
        handler: impl Fn(IceCandidate) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.candidates.subscribe_candidates(Arc::new(handler))
    }

    /// Subscribe to the end of candidate gathering (once per gathering cycle)
    pub fn on_gathering_done(&self, handler: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        self.inner
            .candidates
            .subscribe_gathering_done(Arc::new(handler))
    }

    /// Subscribe to local tracks ending at their source
    pub fn on_stream_ended(
        &self,
        handler: impl Fn(MediaTrack) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let handler: StreamEndedHandler = Arc::new(handler);
        self.inner.stream_ended.lock().add(handler)
    }

    /// Remove a subscription; false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.candidates.unsubscribe(id) || self.inner.stream_ended.lock().remove(id)
    }

    /// Replace the local stream without renegotiating
    ///
    /// Every track of the previously held streams is stopped, then each
    /// track of `stream` replaces the track of every sender of its kind.
    #[instrument(skip(self, stream), fields(peer_id = %self.inner.id, stream_id = %stream.id()))]
    pub async fn replace_stream(&self, stream: MediaStream) -> Result<()> {
        self.inner.ensure_not_disposed()?;

        let previous = {
            let mut streams = self.inner.streams.lock();
            let previous = streams.all();
            streams.audio = None;
            streams.video = Some(stream.clone());
            previous
        };
        for old in &previous {
            old.stop_all();
            self.inner.unwatch_tracks(old.tracks());
        }

        for track in stream.tracks() {
            self.inner.watch_track(track);
        }
        if let Some(sink) = &self.inner.local_sink {
            if sink.stream().is_some() {
                sink.attach(stream.clone());
            }
        }

        let senders = self.inner.connection().senders().await;
        let replacements = stream.tracks().iter().flat_map(|track| {
            senders
                .iter()
                .filter(|sender| sender.kind() == track.kind())
                .map(|sender| replace_on_sender(Arc::clone(sender), track.clone()))
                .collect::<Vec<_>>()
        });
        let replaced = try_join_all(replacements).await?;

        info!(
            stopped = previous.iter().map(|s| s.tracks().len()).sum::<usize>(),
            replaced = replaced.len(),
            "Local stream replaced"
        );
        Ok(())
    }

    /// Replace the sent track of one kind without renegotiating
    ///
    /// With [`TrackReplacement::Source`] a new stream is captured first and
    /// its first video track is used; every other captured track is
    /// stopped.
    #[instrument(skip(self, replacement), fields(peer_id = %self.inner.id))]
    pub async fn replace_track(&self, replacement: impl Into<TrackReplacement>) -> Result<()> {
        self.inner.ensure_not_disposed()?;

        let track = match replacement.into() {
            TrackReplacement::Track(track) => track,
            TrackReplacement::Source(source) => {
                let captured = self
                    .inner
                    .track_source
                    .acquire(source, &self.inner.config.media_constraints)
                    .await?;
                let mut video = captured.video_tracks().into_iter();
                let Some(track) = video.next() else {
                    captured.stop_all();
                    return Err(Error::MediaAcquisition(format!(
                        "{:?} capture produced no video track",
                        source
                    )));
                };
                for extra in video.chain(captured.audio_tracks()) {
                    extra.stop();
                }
                if self.inner.lifecycle.is_closed() {
                    track.stop();
                    return Err(Error::Disposed);
                }
                track
            }
        };

        let removed = {
            let mut guard = self.inner.streams.lock();
            let streams = &mut *guard;
            let holder = streams
                .video
                .as_mut()
                .filter(|s| !s.tracks_of(track.kind()).is_empty())
                .or(streams.audio.as_mut());
            holder
                .map(|stream| stream.replace_kind(track.clone()))
                .unwrap_or_default()
        };
        for old in &removed {
            old.stop();
        }
        self.inner.unwatch_tracks(&removed);
        self.inner.watch_track(&track);

        let senders: Vec<_> = self
            .inner
            .connection()
            .senders()
            .await
            .into_iter()
            .filter(|sender| sender.kind() == track.kind())
            .collect();
        let count = senders.len();
        try_join_all(
            senders
                .into_iter()
                .map(|sender| replace_on_sender(sender, track.clone())),
        )
        .await?;

        info!(track_id = %track.id(), kind = %track.kind(), senders = count, "Track replaced");
        Ok(())
    }

    /// Send a message over the data channel
    ///
    /// Fails with [`Error::DataChannelError`] when there is no data channel
    /// or it is not open.
    pub async fn send(&self, message: impl Into<DataChannelMessage>) -> Result<()> {
        self.inner.ensure_not_disposed()?;

        let Some(channel) = self.inner.data_channel.read().clone() else {
            warn!(peer_id = %self.inner.id, "Cannot send: no data channel");
            return Err(Error::DataChannelError("no data channel".to_string()));
        };
        if !channel.is_open() {
            warn!(
                peer_id = %self.inner.id,
                label = %channel.label(),
                state = ?channel.state(),
                "Cannot send: data channel is not open"
            );
            return Err(Error::DataChannelError(format!(
                "data channel '{}' is not open",
                channel.label()
            )));
        }
        channel.send(&message.into()).await
    }

    pub async fn sender(&self, index: usize) -> Option<Arc<dyn RtpSender>> {
        self.inner.connection().senders().await.into_iter().nth(index)
    }

    pub async fn receiver(&self, index: usize) -> Option<Arc<dyn RtpReceiver>> {
        self.inner
            .connection()
            .receivers()
            .await
            .into_iter()
            .nth(index)
    }

    /// The held local stream (video stream first, else audio stream)
    pub fn local_stream(&self) -> Option<MediaStream> {
        let streams = self.inner.streams.lock();
        streams.video.clone().or_else(|| streams.audio.clone())
    }

    /// Every held local stream
    pub fn local_streams(&self) -> Vec<MediaStream> {
        self.inner.streams.lock().all()
    }

    /// Tracks received from the remote peer so far
    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.inner.remote_stream.lock().clone()
    }

    pub async fn local_session_description(&self) -> Option<SessionDescription> {
        self.inner.connection().local_description().await
    }

    pub async fn remote_session_description(&self) -> Option<SessionDescription> {
        self.inner.connection().remote_description().await
    }

    pub fn data_channel(&self) -> Option<DataChannel> {
        self.inner.data_channel.read().clone()
    }

    /// Whether every audio sender track is enabled
    ///
    /// `None` when no sender carries an audio track.
    pub async fn audio_enabled(&self) -> Option<bool> {
        self.inner.kind_enabled(MediaKind::Audio).await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) {
        self.inner.set_kind_enabled(MediaKind::Audio, enabled).await
    }

    /// Whether every video sender track is enabled
    ///
    /// `None` when no sender carries a video track.
    pub async fn video_enabled(&self) -> Option<bool> {
        self.inner.kind_enabled(MediaKind::Video).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        self.inner.set_kind_enabled(MediaKind::Video, enabled).await
    }

    /// Conjunction of the defined audio/video flags; `None` if neither is defined
    pub async fn enabled(&self) -> Option<bool> {
        match (self.audio_enabled().await, self.video_enabled().await) {
            (None, None) => None,
            (a, v) => Some(a.unwrap_or(true) && v.unwrap_or(true)),
        }
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.set_audio_enabled(enabled).await;
        self.set_video_enabled(enabled).await;
    }

    /// Render the local stream into the local sink
    pub fn show_local_video(&self) -> Result<()> {
        let sink = self
            .inner
            .local_sink
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("no local sink configured".to_string()))?;
        let stream = self
            .local_stream()
            .ok_or_else(|| Error::MediaTrackError("no local stream".to_string()))?;
        sink.attach(stream);
        Ok(())
    }

    /// Latest frame of the remote stream
    ///
    /// Fails with [`Error::NoRemoteStream`] when nothing live is rendered.
    pub fn current_frame(&self) -> Result<VideoFrame> {
        match &self.inner.remote_sink {
            Some(sink) => sink.current_frame(),
            None => Err(Error::NoRemoteStream),
        }
    }

    /// Release every resource; later negotiation fails with [`Error::Disposed`]
    ///
    /// Idempotent. Errors while closing the connection are logged only.
    #[instrument(skip(self), fields(peer_id = %self.inner.id))]
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if !inner.lifecycle.close() {
            debug!("Peer already disposed");
            return;
        }

        let connection = inner.connection();
        if connection.connection_state() != ConnectionState::Closed {
            if let Err(e) = connection.close().await {
                warn!("Error closing peer connection: {}", e);
            }
        }

        let channel = inner.data_channel.write().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!("Error closing data channel: {}", e);
            }
        }

        let streams = {
            let mut streams = inner.streams.lock();
            let all = streams.all();
            streams.audio = None;
            streams.video = None;
            all
        };
        for stream in &streams {
            stream.stop_all();
        }

        for sink in inner.local_sink.iter().chain(inner.remote_sink.iter()) {
            sink.detach();
        }

        inner.candidates.clear();
        inner.stream_ended.lock().clear();
        inner.watched_tracks.lock().clear();

        info!("Peer disposed");
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("state", &self.state())
            .finish()
    }
}

async fn replace_on_sender(sender: Arc<dyn RtpSender>, track: MediaTrack) -> Result<()> {
    let previous = sender.track();
    sender.replace_track(Some(track.clone())).await?;
    if let Some(previous) = previous {
        if !previous.same_track(&track) {
            previous.stop();
        }
    }
    Ok(())
}

impl PeerInner {
    fn connection(&self) -> Arc<dyn PeerConnectionBackend> {
        Arc::clone(&self.current.read().connection)
    }

    fn current(&self) -> (Arc<dyn PeerConnectionBackend>, u64) {
        let current = self.current.read();
        (Arc::clone(&current.connection), current.generation)
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.lifecycle.is_closed() {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    fn connection_for_negotiation(&self) -> Result<Arc<dyn PeerConnectionBackend>> {
        self.ensure_not_disposed()?;
        let connection = self.connection();
        if connection.connection_state() == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(connection)
    }

    /// Single initialization routine for construction and recovery
    ///
    /// The caller holds `init_lock`.
    async fn initialize(self: &Arc<Self>, _guard: &tokio::sync::MutexGuard<'_, ()>) -> Result<()> {
        self.lifecycle.begin_initialization();
        let (connection, generation) = self.current();
        debug!(peer_id = %self.id, generation, "Initializing connection");

        self.install_event_handler(&connection, generation);

        if let Err(e) = self.setup_data_channel(&connection).await {
            self.lifecycle.finish_initialization(Err(e.replicate()));
            return Err(e);
        }

        let needs_capture = self.mode.sends_media() && self.streams.lock().is_empty();
        if !needs_capture {
            if connection.connection_state() == ConnectionState::Closed {
                warn!(peer_id = %self.id, "Connection closed before local setup");
                self.lifecycle.finish_initialization(Err(Error::ConnectionClosed));
                return Ok(());
            }
            let result = self.attach_local_streams(&connection, generation).await;
            self.lifecycle
                .finish_initialization(result.as_ref().map(|_| ()).map_err(Error::replicate));
            return result;
        }

        if self.acquiring.swap(true, Ordering::AcqRel) {
            debug!(peer_id = %self.id, "Media acquisition already in flight");
            return Ok(());
        }

        let inner = Arc::clone(self);
        let span = info_span!("acquire_media", peer_id = %self.id);
        tokio::spawn(async move { inner.acquire_local_media().await }.instrument(span));
        Ok(())
    }

    fn install_event_handler(&self, connection: &Arc<dyn PeerConnectionBackend>, generation: u64) {
        let weak = self.self_ref.clone();
        connection.set_event_handler(Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_connection_event(generation, event);
            }
        }));
    }

    async fn setup_data_channel(&self, connection: &Arc<dyn PeerConnectionBackend>) -> Result<()> {
        if !self.config.data_channels {
            return Ok(());
        }
        let config = &self.config.data_channel;
        let transport = connection.create_data_channel(config).await?;
        let channel = DataChannel::new(
            transport,
            self.data_channel_handlers.clone(),
            config.buffered_amount_low_threshold,
        )
        .await;
        debug!(peer_id = %self.id, label = %config.label, "Data channel ready");
        *self.data_channel.write() = Some(channel);
        Ok(())
    }

    async fn acquire_local_media(self: Arc<Self>) {
        let source = self.config.send_source;
        debug!(?source, "Acquiring local media");
        let captured = self
            .track_source
            .acquire(source, &self.config.media_constraints)
            .await;

        let guard = self.init_lock.lock().await;
        self.acquiring.store(false, Ordering::Release);

        let result = match captured {
            Ok(stream) if self.lifecycle.is_closed() => {
                stream.stop_all();
                Err(Error::Disposed)
            }
            Ok(stream) => {
                self.streams.lock().video = Some(stream);
                let (connection, generation) = self.current();
                if connection.connection_state() == ConnectionState::Closed {
                    Err(Error::ConnectionClosed)
                } else {
                    self.attach_local_streams(&connection, generation).await
                }
            }
            Err(e) => Err(e),
        };
        drop(guard);

        match &result {
            Ok(()) => info!("Local media attached"),
            Err(e) => warn!("Local setup failed: {}", e),
        }
        self.lifecycle.finish_initialization(result);
    }

    async fn attach_local_streams(
        &self,
        connection: &Arc<dyn PeerConnectionBackend>,
        generation: u64,
    ) -> Result<()> {
        let streams = {
            let streams = self.streams.lock();
            if streams.attached_generation == Some(generation) {
                return Ok(());
            }
            streams.all()
        };

        for stream in &streams {
            for track in stream.tracks() {
                connection.add_track(track, stream).await?;
                self.watch_track(track);
            }
        }

        self.streams.lock().attached_generation = Some(generation);
        debug!(
            peer_id = %self.id,
            generation,
            tracks = streams.iter().map(|s| s.tracks().len()).sum::<usize>(),
            "Local tracks attached"
        );
        Ok(())
    }

    /// Report `track` ending at its source to stream-ended subscribers
    fn watch_track(&self, track: &MediaTrack) {
        {
            let mut watched = self.watched_tracks.lock();
            if watched.iter().any(|t| t.same_track(track)) {
                return;
            }
            watched.push(track.clone());
        }

        let weak = self.self_ref.clone();
        track.on_ended(move |ended| {
            if let Some(inner) = weak.upgrade() {
                inner.notify_stream_ended(ended);
            }
        });
    }

    fn unwatch_tracks(&self, tracks: &[MediaTrack]) {
        self.watched_tracks
            .lock()
            .retain(|watched| !tracks.iter().any(|t| t.same_track(watched)));
    }

    fn notify_stream_ended(&self, track: MediaTrack) {
        if self.lifecycle.is_closed() {
            return;
        }
        if !self.watched_tracks.lock().iter().any(|t| t.same_track(&track)) {
            return;
        }
        self.unwatch_tracks(std::slice::from_ref(&track));
        info!(peer_id = %self.id, track_id = %track.id(), kind = %track.kind(), "Local track ended");
        let handlers = self.stream_ended.lock().snapshot();
        for handler in handlers {
            handler(track.clone());
        }
    }

    fn handle_connection_event(self: &Arc<Self>, generation: u64, event: ConnectionEvent) {
        if self.lifecycle.is_closed() {
            debug!(peer_id = %self.id, "Ignoring connection event after dispose");
            return;
        }
        if self.current.read().generation != generation {
            debug!(peer_id = %self.id, generation, "Ignoring event from replaced connection");
            return;
        }

        match event {
            ConnectionEvent::ConnectionStateChanged(state) => match state {
                ConnectionState::Closed => {
                    warn!(peer_id = %self.id, "Connection closed, recreating");
                    self.spawn_recovery(generation);
                }
                ConnectionState::Failed => {
                    warn!(peer_id = %self.id, "Connection failed")
                }
                state => info!(peer_id = %self.id, %state, "Connection state changed"),
            },
            ConnectionEvent::IceCandidate(candidate) => self.candidates.handle(candidate),
            ConnectionEvent::Track(remote) => self.add_remote_track(remote),
            ConnectionEvent::NegotiationNeeded => {
                debug!(peer_id = %self.id, "Negotiation needed");
                if let Some(handler) = &self.on_negotiation_needed {
                    handler();
                }
            }
        }
    }

    fn spawn_recovery(self: &Arc<Self>, generation: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(peer_id = %self.id, "No async runtime available to recreate the connection");
            return;
        };
        let inner = Arc::clone(self);
        let span = info_span!("recover_connection", peer_id = %self.id, generation);
        runtime.spawn(async move { inner.recover(generation).await }.instrument(span));
    }

    /// Replace a closed connection and rerun the initialization routine
    async fn recover(self: Arc<Self>, generation: u64) {
        let guard = self.init_lock.lock().await;
        if self.lifecycle.is_closed() || self.current.read().generation != generation {
            return;
        }

        let connection = match self.factory.create(&self.rtc_configuration).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to recreate peer connection: {}", e);
                return;
            }
        };

        if self.lifecycle.is_closed() {
            if let Err(e) = connection.close().await {
                debug!("Error closing connection created during dispose: {}", e);
            }
            return;
        }

        {
            let mut current = self.current.write();
            current.connection = connection;
            current.generation = generation + 1;
        }
        self.candidates.reset_cycle();
        *self.remote_stream.lock() = None;
        *self.data_channel.write() = None;

        match self.initialize(&guard).await {
            Ok(()) => info!(generation = generation + 1, "Connection recreated"),
            Err(e) => error!("Reinitialization after close failed: {}", e),
        }
    }

    fn add_remote_track(&self, remote: RemoteTrack) {
        debug!(peer_id = %self.id, track_id = %remote.track.id(), kind = %remote.track.kind(), "Remote track");
        let stream = {
            let mut slot = self.remote_stream.lock();
            let stream = slot.get_or_insert_with(|| match remote.stream_ids.first() {
                Some(id) => MediaStream::with_id(id.clone(), Vec::new()),
                None => MediaStream::new(Vec::new()),
            });
            stream.add_track(remote.track.clone());
            stream.clone()
        };
        if let Some(sink) = &self.remote_sink {
            sink.attach(stream);
        }
        if let Some(handler) = &self.on_track {
            handler(remote);
        }
    }

    /// Collect receiver tracks into the remote stream and render it
    async fn wire_remote_tracks(&self, connection: &Arc<dyn PeerConnectionBackend>) {
        let tracks: Vec<MediaTrack> = connection
            .receivers()
            .await
            .iter()
            .map(|receiver| receiver.track())
            .collect();
        if tracks.is_empty() {
            return;
        }

        let stream = {
            let mut slot = self.remote_stream.lock();
            let stream = slot.get_or_insert_with(|| MediaStream::new(Vec::new()));
            for track in tracks {
                stream.add_track(track);
            }
            stream.clone()
        };
        debug!(peer_id = %self.id, tracks = stream.tracks().len(), "Remote tracks wired");
        if let Some(sink) = &self.remote_sink {
            sink.attach(stream);
        }
    }

    fn mangle_for_simulcast(
        &self,
        connection: &Arc<dyn PeerConnectionBackend>,
        description: SessionDescription,
    ) -> SessionDescription {
        if !self.config.simulcast {
            return description;
        }
        let stream = {
            let streams = self.streams.lock();
            streams.video.clone().or_else(|| streams.audio.clone())
        };
        let Some(stream) = stream else {
            warn!(peer_id = %self.id, "Simulcast requested without a local stream, leaving SDP untouched");
            return description;
        };
        let mangler = SimulcastMangler::new(connection.supports_legacy_simulcast());
        let sdp = mangler.mangle(&description.sdp, &stream);
        description.with_sdp(sdp)
    }

    fn remote_for_connection(&self, description: SessionDescription) -> Result<SessionDescription> {
        match &self.translator {
            Some(translator) => translator.to_plan_b(&description),
            None => Ok(description),
        }
    }

    async fn local_description_for_app(
        &self,
        connection: &Arc<dyn PeerConnectionBackend>,
    ) -> Result<SessionDescription> {
        let local = connection
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("local description missing after set".to_string()))?;
        match &self.translator {
            Some(translator) => translator.to_unified_plan(&local),
            None => Ok(local),
        }
    }

    async fn kind_enabled(&self, kind: MediaKind) -> Option<bool> {
        let tracks = self.sender_tracks(kind).await;
        if tracks.is_empty() {
            None
        } else {
            Some(tracks.iter().all(MediaTrack::enabled))
        }
    }

    async fn set_kind_enabled(&self, kind: MediaKind, enabled: bool) {
        let tracks = self.sender_tracks(kind).await;
        for track in &tracks {
            track.set_enabled(enabled);
        }
        debug!(peer_id = %self.id, %kind, enabled, tracks = tracks.len(), "Sender tracks toggled");
    }

    async fn sender_tracks(&self, kind: MediaKind) -> Vec<MediaTrack> {
        if self.lifecycle.is_closed() {
            return Vec::new();
        }
        self.connection()
            .senders()
            .await
            .iter()
            .filter(|sender| sender.kind() == kind)
            .filter_map(|sender| sender.track())
            .collect()
    }
}
