//! webrtc-rs backend

use super::{
    ConnectionEvent, ConnectionEventHandler, ConnectionFactory, ConnectionState,
    DataChannelEvent, DataChannelEventHandler, DataChannelTransport, PeerConnectionBackend,
    RemoteTrack, RtpReceiver, RtpSender, RtpTransceiver, TransceiverDirection,
};
use crate::channels::{DataChannelMessage, DataChannelState};
use crate::config::{BundlePolicy, DataChannelConfig, IceTransportPolicy, RtcConfiguration};
use crate::media::{MediaKind, MediaStream, MediaTrack};
use crate::sdp::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage as RtcDataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

type LocalTracks = Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>;
type RemoteTracks = Arc<Mutex<Vec<(Arc<RTCRtpReceiver>, MediaTrack)>>>;

/// Creates [`WebRtcConnection`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcConnectionFactory;

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        configuration: &RtcConfiguration,
    ) -> Result<Arc<dyn PeerConnectionBackend>> {
        Ok(Arc::new(WebRtcConnection::new(configuration).await?))
    }
}

/// Peer connection backed by webrtc-rs
pub struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    handler: Arc<RwLock<Option<ConnectionEventHandler>>>,
    senders: Mutex<Vec<Arc<WebRtcSender>>>,
    local_tracks: LocalTracks,
    remote_tracks: RemoteTracks,
}

impl WebRtcConnection {
    /// Create a connection with default codecs and interceptors
    #[instrument(skip(configuration))]
    pub async fn new(configuration: &RtcConfiguration) -> Result<Self> {
        // Create MediaEngine with default codecs
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_configuration(configuration))
                .await
                .map_err(|e| {
                    Error::WebRtcError(format!("Failed to create peer connection: {}", e))
                })?,
        );

        let connection = Self {
            peer_connection,
            handler: Arc::new(RwLock::new(None)),
            senders: Mutex::new(Vec::new()),
            local_tracks: Arc::new(Mutex::new(HashMap::new())),
            remote_tracks: Arc::new(Mutex::new(Vec::new())),
        };
        connection.install_callbacks();

        info!(
            ice_servers = configuration.ice_servers.len(),
            "Created webrtc-rs peer connection"
        );
        Ok(connection)
    }

    /// The wrapped webrtc-rs connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    /// Sample track feeding the sender of local track `track_id`
    ///
    /// Media producers write encoded samples here.
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(track_id).cloned()
    }

    fn install_callbacks(&self) {
        let handler = Arc::clone(&self.handler);
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                emit(&handler, ConnectionEvent::ConnectionStateChanged(connection_state(s)));
                Box::pin(async {})
            }));

        let handler = Arc::clone(&self.handler);
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let event = match candidate {
                    Some(c) => match c.to_json() {
                        Ok(init) => Some(ConnectionEvent::IceCandidate(Some(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }))),
                        Err(e) => {
                            warn!("Failed to serialize local ICE candidate: {}", e);
                            None
                        }
                    },
                    None => Some(ConnectionEvent::IceCandidate(None)),
                };
                if let Some(event) = event {
                    emit(&handler, event);
                }
                Box::pin(async {})
            }));

        let handler = Arc::clone(&self.handler);
        let remote_tracks = Arc::clone(&self.remote_tracks);
        self.peer_connection
            .on_track(Box::new(move |track, receiver, _transceiver| {
                let kind = media_kind(track.kind());
                let media_track =
                    remote_track_for(&remote_tracks, &receiver, kind, Some(track.id()));
                debug!(track_id = %media_track.id(), %kind, "Remote track received");
                emit(
                    &handler,
                    ConnectionEvent::Track(RemoteTrack {
                        track: media_track,
                        stream_ids: vec![track.stream_id()],
                    }),
                );
                Box::pin(async {})
            }));

        let handler = Arc::clone(&self.handler);
        self.peer_connection
            .on_negotiation_needed(Box::new(move || {
                emit(&handler, ConnectionEvent::NegotiationNeeded);
                Box::pin(async {})
            }));
    }
}

fn emit(handler: &RwLock<Option<ConnectionEventHandler>>, event: ConnectionEvent) {
    let handler = handler.read().clone();
    if let Some(handler) = handler {
        handler(event);
    }
}

fn remote_track_for(
    remote_tracks: &Mutex<Vec<(Arc<RTCRtpReceiver>, MediaTrack)>>,
    receiver: &Arc<RTCRtpReceiver>,
    kind: MediaKind,
    id: Option<String>,
) -> MediaTrack {
    let mut tracks = remote_tracks.lock();
    if let Some((_, track)) = tracks.iter().find(|(r, _)| Arc::ptr_eq(r, receiver)) {
        return track.clone();
    }
    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let track = MediaTrack::remote(id, kind);
    tracks.push((Arc::clone(receiver), track.clone()));
    track
}

fn rtc_configuration(configuration: &RtcConfiguration) -> RTCConfiguration {
    let ice_servers = configuration
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ice_transport_policy: match configuration.ice_transport_policy {
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        },
        bundle_policy: match configuration.bundle_policy {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
        },
        ..Default::default()
    }
}

fn connection_state(s: RTCPeerConnectionState) -> ConnectionState {
    match s {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn media_kind(kind: RTPCodecType) -> MediaKind {
    match kind {
        RTPCodecType::Audio => MediaKind::Audio,
        _ => MediaKind::Video,
    }
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn rtc_direction(direction: TransceiverDirection) -> RTCRtpTransceiverDirection {
    match direction {
        TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
        TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
        TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
    }
}

fn transceiver_direction(direction: RTCRtpTransceiverDirection) -> TransceiverDirection {
    match direction {
        RTCRtpTransceiverDirection::Sendrecv => TransceiverDirection::SendRecv,
        RTCRtpTransceiverDirection::Sendonly => TransceiverDirection::SendOnly,
        RTCRtpTransceiverDirection::Recvonly => TransceiverDirection::RecvOnly,
        _ => TransceiverDirection::Inactive,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(Error::SdpError(
                "rollback descriptions are not supported".to_string(),
            ))
        }
    };
    result.map_err(|e| Error::SdpError(format!("Invalid session description: {}", e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Offer | RTCSdpType::Unspecified => SdpType::Offer,
    };
    SessionDescription {
        sdp_type,
        sdp: description.sdp,
    }
}

/// Sample track for `track`, using Opus for audio and VP8 for video
fn sample_track(track: &MediaTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    let capability = match track.kind() {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    };
    Arc::new(TrackLocalStaticSample::new(
        capability,
        track.id().to_owned(),
        stream_id.to_owned(),
    ))
}

#[async_trait]
impl PeerConnectionBackend for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        Ok(from_rtc_description(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(from_rtc_description(answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.peer_connection
            .local_description()
            .await
            .map(from_rtc_description)
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.peer_connection
            .remote_description()
            .await
            .map(from_rtc_description)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_track(
        &self,
        track: &MediaTrack,
        stream: &MediaStream,
    ) -> Result<Arc<dyn RtpSender>> {
        let local = sample_track(track, stream.id());
        let rtp_sender = self
            .peer_connection
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add track: {}", e)))?;

        self.local_tracks
            .lock()
            .insert(track.id().to_owned(), local);

        let sender = Arc::new(WebRtcSender {
            inner: rtp_sender,
            kind: track.kind(),
            stream_id: stream.id().to_owned(),
            track: Mutex::new(Some(track.clone())),
            local_tracks: Arc::clone(&self.local_tracks),
        });
        self.senders.lock().push(Arc::clone(&sender));

        debug!(track_id = %track.id(), kind = %track.kind(), "Added local track");
        Ok(sender)
    }

    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<Arc<dyn RtpTransceiver>> {
        let transceiver = self
            .peer_connection
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: rtc_direction(direction),
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to add {} transceiver: {}", kind, e)))?;
        Ok(Arc::new(WebRtcTransceiver { inner: transceiver }))
    }

    async fn transceivers(&self) -> Vec<Arc<dyn RtpTransceiver>> {
        self.peer_connection
            .get_transceivers()
            .await
            .into_iter()
            .map(|inner| Arc::new(WebRtcTransceiver { inner }) as Arc<dyn RtpTransceiver>)
            .collect()
    }

    async fn senders(&self) -> Vec<Arc<dyn RtpSender>> {
        self.senders
            .lock()
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn RtpSender>)
            .collect()
    }

    async fn receivers(&self) -> Vec<Arc<dyn RtpReceiver>> {
        self.peer_connection
            .get_receivers()
            .await
            .into_iter()
            .map(|receiver| {
                let kind = media_kind(receiver.kind());
                let track = remote_track_for(&self.remote_tracks, &receiver, kind, None);
                Arc::new(WebRtcReceiver { kind, track }) as Arc<dyn RtpReceiver>
            })
            .collect()
    }

    async fn create_data_channel(
        &self,
        config: &DataChannelConfig,
    ) -> Result<Arc<dyn DataChannelTransport>> {
        let init = RTCDataChannelInit {
            ordered: Some(config.ordered),
            max_packet_life_time: config.max_packet_life_time,
            max_retransmits: config.max_retransmits,
            protocol: (!config.protocol.is_empty()).then(|| config.protocol.clone()),
            negotiated: config.negotiated,
        };

        let channel = self
            .peer_connection
            .create_data_channel(&config.label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;
        Ok(Arc::new(WebRtcDataChannel { inner: channel }))
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state(self.peer_connection.connection_state())
    }

    fn set_event_handler(&self, handler: ConnectionEventHandler) {
        *self.handler.write() = Some(handler);
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

struct WebRtcSender {
    inner: Arc<RTCRtpSender>,
    kind: MediaKind,
    stream_id: String,
    track: Mutex<Option<MediaTrack>>,
    local_tracks: LocalTracks,
}

#[async_trait]
impl RtpSender for WebRtcSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Option<MediaTrack> {
        self.track.lock().clone()
    }

    async fn replace_track(&self, track: Option<MediaTrack>) -> Result<()> {
        let local = track.as_ref().map(|t| sample_track(t, &self.stream_id));
        self.inner
            .replace_track(
                local
                    .clone()
                    .map(|l| l as Arc<dyn TrackLocal + Send + Sync>),
            )
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to replace track: {}", e)))?;

        let previous = std::mem::replace(&mut *self.track.lock(), track.clone());
        let mut local_tracks = self.local_tracks.lock();
        if let Some(previous) = previous {
            local_tracks.remove(previous.id());
        }
        if let (Some(track), Some(local)) = (track, local) {
            local_tracks.insert(track.id().to_owned(), local);
        }
        Ok(())
    }
}

struct WebRtcReceiver {
    kind: MediaKind,
    track: MediaTrack,
}

impl RtpReceiver for WebRtcReceiver {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> MediaTrack {
        self.track.clone()
    }
}

struct WebRtcTransceiver {
    inner: Arc<RTCRtpTransceiver>,
}

#[async_trait]
impl RtpTransceiver for WebRtcTransceiver {
    fn mid(&self) -> Option<String> {
        self.inner.mid().map(|m| m.to_string())
    }

    fn kind(&self) -> MediaKind {
        media_kind(self.inner.kind())
    }

    fn direction(&self) -> TransceiverDirection {
        transceiver_direction(self.inner.direction())
    }

    async fn set_direction(&self, direction: TransceiverDirection) -> Result<()> {
        self.inner.set_direction(rtc_direction(direction)).await;
        Ok(())
    }
}

struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannelTransport for WebRtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_owned()
    }

    fn ready_state(&self) -> DataChannelState {
        match self.inner.ready_state() {
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            _ => DataChannelState::Connecting,
        }
    }

    async fn send(&self, msg: &DataChannelMessage) -> Result<usize> {
        let result = match msg {
            DataChannelMessage::Text(text) => self.inner.send_text(text.clone()).await,
            DataChannelMessage::Binary(data) => self.inner.send(data).await,
        };
        result.map_err(|e| Error::DataChannelError(format!("Failed to send message: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close channel: {}", e)))
    }

    async fn set_event_handler(&self, handler: DataChannelEventHandler) {
        let h = Arc::clone(&handler);
        self.inner.on_open(Box::new(move || {
            h(DataChannelEvent::Open);
            Box::pin(async {})
        }));

        let h = Arc::clone(&handler);
        self.inner.on_close(Box::new(move || {
            h(DataChannelEvent::Close);
            Box::pin(async {})
        }));

        let h = Arc::clone(&handler);
        self.inner
            .on_message(Box::new(move |msg: RtcDataChannelMessage| {
                let message = if msg.is_string {
                    DataChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    DataChannelMessage::Binary(msg.data)
                };
                h(DataChannelEvent::Message(message));
                Box::pin(async {})
            }));

        let h = Arc::clone(&handler);
        self.inner.on_error(Box::new(move |err| {
            h(DataChannelEvent::Error(err.to_string()));
            Box::pin(async {})
        }));

        let h = handler;
        self.inner
            .on_buffered_amount_low(Box::new(move || {
                h(DataChannelEvent::BufferedAmountLow);
                Box::pin(async {})
            }))
            .await;
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.inner.set_buffered_amount_low_threshold(threshold).await;
    }
}
