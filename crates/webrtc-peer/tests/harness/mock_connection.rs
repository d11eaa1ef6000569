//! Scripted in-memory peer connection
//!
//! Generates deterministic SDP from its transceivers, creates receivers for
//! every media section of a remote description, and exposes hooks to emit
//! connection events and inject failures.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use webrtc_peer::channels::DataChannelState;
use webrtc_peer::connection::{
    ConnectionEvent, ConnectionEventHandler, ConnectionFactory, ConnectionState,
    DataChannelEvent, DataChannelEventHandler, DataChannelTransport, PeerConnectionBackend,
    RtpReceiver, RtpSender, RtpTransceiver, TransceiverDirection,
};
use webrtc_peer::{
    DataChannelConfig, DataChannelMessage, Error, IceCandidate, MediaKind, MediaStream,
    MediaTrack, Result, RtcConfiguration, SdpType, SessionDescription,
};

// ============================================================================
// RTP primitives
// ============================================================================

pub struct MockSender {
    kind: MediaKind,
    track: Mutex<Option<MediaTrack>>,
    stream_id: String,
    pub replacements: AtomicUsize,
}

#[async_trait]
impl RtpSender for MockSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Option<MediaTrack> {
        self.track.lock().clone()
    }

    async fn replace_track(&self, track: Option<MediaTrack>) -> Result<()> {
        if let Some(track) = &track {
            if track.kind() != self.kind {
                return Err(Error::MediaTrackError(format!(
                    "cannot send {} on a {} sender",
                    track.kind(),
                    self.kind
                )));
            }
        }
        *self.track.lock() = track;
        self.replacements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockReceiver {
    track: MediaTrack,
}

impl RtpReceiver for MockReceiver {
    fn kind(&self) -> MediaKind {
        self.track.kind()
    }

    fn track(&self) -> MediaTrack {
        self.track.clone()
    }
}

pub struct MockTransceiver {
    kind: MediaKind,
    direction: Mutex<TransceiverDirection>,
    mid: Mutex<Option<String>>,
    sender: Option<Arc<MockSender>>,
}

impl MockTransceiver {
    fn new(kind: MediaKind, direction: TransceiverDirection, sender: Option<Arc<MockSender>>) -> Self {
        Self {
            kind,
            direction: Mutex::new(direction),
            mid: Mutex::new(None),
            sender,
        }
    }
}

#[async_trait]
impl RtpTransceiver for MockTransceiver {
    fn mid(&self) -> Option<String> {
        self.mid.lock().clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn direction(&self) -> TransceiverDirection {
        *self.direction.lock()
    }

    async fn set_direction(&self, direction: TransceiverDirection) -> Result<()> {
        *self.direction.lock() = direction;
        Ok(())
    }
}

// ============================================================================
// Data channel
// ============================================================================

pub struct MockDataChannel {
    label: String,
    state: Mutex<DataChannelState>,
    handler: Mutex<Option<DataChannelEventHandler>>,
    threshold: Mutex<Option<usize>>,
    pub sent: Mutex<Vec<DataChannelMessage>>,
}

impl MockDataChannel {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: Mutex::new(DataChannelState::Connecting),
            handler: Mutex::new(None),
            threshold: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Transition to open and notify the handler
    pub fn open(&self) {
        *self.state.lock() = DataChannelState::Open;
        self.emit(DataChannelEvent::Open);
    }

    /// Deliver a message as if it came from the remote side
    pub fn receive(&self, message: DataChannelMessage) {
        self.emit(DataChannelEvent::Message(message));
    }

    pub fn threshold(&self) -> Option<usize> {
        *self.threshold.lock()
    }

    fn emit(&self, event: DataChannelEvent) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

#[async_trait]
impl DataChannelTransport for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock()
    }

    async fn send(&self, msg: &DataChannelMessage) -> Result<usize> {
        if *self.state.lock() != DataChannelState::Open {
            return Err(Error::DataChannelError("mock channel not open".to_string()));
        }
        self.sent.lock().push(msg.clone());
        Ok(msg.size())
    }

    async fn close(&self) -> Result<()> {
        let was_open = {
            let mut state = self.state.lock();
            let was_open = *state != DataChannelState::Closed;
            *state = DataChannelState::Closed;
            was_open
        };
        if was_open {
            self.emit(DataChannelEvent::Close);
        }
        Ok(())
    }

    async fn set_event_handler(&self, handler: DataChannelEventHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        *self.threshold.lock() = Some(threshold);
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Behaviour switches for a [`MockConnection`]
#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    pub legacy_simulcast: bool,
    /// Error returned by `close()` (the state still becomes closed)
    pub close_error: Option<String>,
}

#[derive(Default)]
struct Descriptions {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
}

pub struct MockConnection {
    pub index: usize,
    options: MockOptions,
    state: Mutex<ConnectionState>,
    handler: Mutex<Option<ConnectionEventHandler>>,
    transceivers: Mutex<Vec<Arc<MockTransceiver>>>,
    /// Receivers keyed by remote media section index
    receivers: Mutex<Vec<(usize, Arc<MockReceiver>)>>,
    descriptions: Mutex<Descriptions>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    data_channels: Mutex<Vec<Arc<MockDataChannel>>>,
    fail_next: Mutex<Option<String>>,
    pub close_calls: AtomicUsize,
    pub offers_created: AtomicUsize,
}

impl MockConnection {
    pub fn new(index: usize, options: MockOptions) -> Self {
        Self {
            index,
            options,
            state: Mutex::new(ConnectionState::New),
            handler: Mutex::new(None),
            transceivers: Mutex::new(Vec::new()),
            receivers: Mutex::new(Vec::new()),
            descriptions: Mutex::new(Descriptions::default()),
            remote_candidates: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
            close_calls: AtomicUsize::new(0),
            offers_created: AtomicUsize::new(0),
        }
    }

    /// Deliver `event` to the installed handler
    pub fn emit(&self, event: ConnectionEvent) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    pub fn emit_candidate(&self, candidate: &str) {
        self.emit(ConnectionEvent::IceCandidate(Some(
            IceCandidate::new(candidate).with_mid("0", 0),
        )));
    }

    pub fn emit_gathering_done(&self) {
        self.emit(ConnectionEvent::IceCandidate(None));
    }

    /// Close from the remote side: state becomes closed and the handler is told
    pub fn simulate_close(&self) {
        self.set_state(ConnectionState::Closed);
        self.emit(ConnectionEvent::ConnectionStateChanged(ConnectionState::Closed));
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Make the next offer/answer/description call fail with an SDP error
    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock() = Some(message.to_string());
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn transceiver_summary(&self) -> Vec<(MediaKind, TransceiverDirection)> {
        self.transceivers
            .lock()
            .iter()
            .map(|t| (t.kind, t.direction()))
            .collect()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    pub fn data_channel(&self) -> Option<Arc<MockDataChannel>> {
        self.data_channels.lock().first().cloned()
    }

    pub fn local_sdp(&self) -> Option<String> {
        self.descriptions.lock().local.as_ref().map(|d| d.sdp.clone())
    }

    fn take_failure(&self) -> Result<()> {
        match self.fail_next.lock().take() {
            Some(message) => Err(Error::SdpError(message)),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.state.lock() == ConnectionState::Closed {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Render an SDP with one media section per transceiver
    fn render_sdp(&self) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE",
            4000 + self.index
        );
        let transceivers = self.transceivers.lock();
        for i in 0..transceivers.len() {
            sdp.push_str(&format!(" {}", i));
        }
        sdp.push_str("\r\n");

        for (i, transceiver) in transceivers.iter().enumerate() {
            *transceiver.mid.lock() = Some(i.to_string());
            let payload = match transceiver.kind {
                MediaKind::Audio => 111,
                MediaKind::Video => 96,
            };
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF {}\r\nc=IN IP4 0.0.0.0\r\na=mid:{}\r\na={}\r\n",
                transceiver.kind,
                payload,
                i,
                transceiver.direction()
            ));
            let Some(sender) = &transceiver.sender else {
                continue;
            };
            let Some(track) = sender.track() else {
                continue;
            };
            let primary = 1000 + i;
            let retransmit = 2000 + i;
            sdp.push_str(&format!(
                "a=msid:{} {}\r\na=ssrc-group:FID {} {}\r\na=ssrc:{} cname:mock\r\na=ssrc:{} cname:mock\r\n",
                sender.stream_id,
                track.id(),
                primary,
                retransmit,
                primary,
                retransmit
            ));
        }
        sdp
    }
}

/// Media sections of `sdp` as `(index, kind, sends)`
fn media_sections(sdp: &str) -> Vec<(usize, MediaKind, bool)> {
    let mut sections: Vec<(usize, MediaKind, bool)> = Vec::new();
    for line in sdp.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("m=") {
            let kind = if rest.starts_with("audio") {
                MediaKind::Audio
            } else if rest.starts_with("video") {
                MediaKind::Video
            } else {
                continue;
            };
            let index = sections.len();
            sections.push((index, kind, true));
        } else if line == "a=recvonly" || line == "a=inactive" {
            if let Some(last) = sections.last_mut() {
                last.2 = false;
            }
        }
    }
    sections
}

#[async_trait]
impl PeerConnectionBackend for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        self.take_failure()?;
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(self.render_sdp()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        self.take_failure()?;
        let has_offer = matches!(
            &self.descriptions.lock().remote,
            Some(d) if d.sdp_type == SdpType::Offer
        );
        if !has_offer {
            return Err(Error::SdpError("no remote offer to answer".to_string()));
        }
        Ok(SessionDescription::answer(self.render_sdp()))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        self.take_failure()?;
        self.descriptions.lock().local = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        self.take_failure()?;
        if !description.sdp.starts_with("v=0") {
            return Err(Error::SdpError("malformed remote description".to_string()));
        }

        let sections = media_sections(&description.sdp);
        if description.sdp_type == SdpType::Offer {
            let mut transceivers = self.transceivers.lock();
            for (index, kind, sends) in &sections {
                if *index >= transceivers.len() {
                    let direction = if *sends {
                        TransceiverDirection::RecvOnly
                    } else {
                        TransceiverDirection::Inactive
                    };
                    transceivers.push(Arc::new(MockTransceiver::new(*kind, direction, None)));
                }
            }
        }

        {
            let mut receivers = self.receivers.lock();
            for (index, kind, sends) in sections {
                if !sends || receivers.iter().any(|(i, _)| *i == index) {
                    continue;
                }
                let track =
                    MediaTrack::remote(format!("remote-{}-{}-{}", self.index, kind, index), kind);
                receivers.push((index, Arc::new(MockReceiver { track })));
            }
        }

        self.descriptions.lock().remote = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.descriptions.lock().local.clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.descriptions.lock().remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if self.descriptions.lock().remote.is_none() {
            return Err(Error::IceCandidateError(
                "remote description not set".to_string(),
            ));
        }
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_track(
        &self,
        track: &MediaTrack,
        stream: &MediaStream,
    ) -> Result<Arc<dyn RtpSender>> {
        self.ensure_open()?;
        let sender = Arc::new(MockSender {
            kind: track.kind(),
            track: Mutex::new(Some(track.clone())),
            stream_id: stream.id().to_string(),
            replacements: AtomicUsize::new(0),
        });
        self.transceivers.lock().push(Arc::new(MockTransceiver::new(
            track.kind(),
            TransceiverDirection::SendRecv,
            Some(Arc::clone(&sender)),
        )));
        Ok(sender)
    }

    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<Arc<dyn RtpTransceiver>> {
        self.ensure_open()?;
        let transceiver = Arc::new(MockTransceiver::new(kind, direction, None));
        self.transceivers.lock().push(Arc::clone(&transceiver));
        Ok(transceiver)
    }

    async fn transceivers(&self) -> Vec<Arc<dyn RtpTransceiver>> {
        self.transceivers
            .lock()
            .iter()
            .map(|t| Arc::clone(t) as Arc<dyn RtpTransceiver>)
            .collect()
    }

    async fn senders(&self) -> Vec<Arc<dyn RtpSender>> {
        self.transceivers
            .lock()
            .iter()
            .filter_map(|t| t.sender.clone())
            .map(|s| s as Arc<dyn RtpSender>)
            .collect()
    }

    async fn receivers(&self) -> Vec<Arc<dyn RtpReceiver>> {
        self.receivers
            .lock()
            .iter()
            .map(|(_, r)| Arc::clone(r) as Arc<dyn RtpReceiver>)
            .collect()
    }

    async fn create_data_channel(
        &self,
        config: &DataChannelConfig,
    ) -> Result<Arc<dyn DataChannelTransport>> {
        self.ensure_open()?;
        let channel = Arc::new(MockDataChannel::new(&config.label));
        self.data_channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_event_handler(&self, handler: ConnectionEventHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn supports_legacy_simulcast(&self) -> bool {
        self.options.legacy_simulcast
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = ConnectionState::Closed;
        match &self.options.close_error {
            Some(message) => Err(Error::WebRtcError(message.clone())),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Factory that records every connection it hands out
#[derive(Default)]
pub struct MockFactory {
    options: MockOptions,
    created: Mutex<Vec<Arc<MockConnection>>>,
    configurations: Mutex<Vec<RtcConfiguration>>,
    fail_after: Mutex<Option<usize>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_options(options: MockOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            ..Self::default()
        })
    }

    /// Refuse to create connections once `count` exist
    pub fn fail_after(&self, count: usize) {
        *self.fail_after.lock() = Some(count);
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        Arc::clone(&self.created.lock()[index])
    }

    pub fn latest(&self) -> Arc<MockConnection> {
        let created = self.created.lock();
        Arc::clone(created.last().expect("no connection created yet"))
    }

    pub fn configurations(&self) -> Vec<RtcConfiguration> {
        self.configurations.lock().clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn create(
        &self,
        configuration: &RtcConfiguration,
    ) -> Result<Arc<dyn PeerConnectionBackend>> {
        let mut created = self.created.lock();
        if let Some(limit) = *self.fail_after.lock() {
            if created.len() >= limit {
                return Err(Error::WebRtcError("mock factory exhausted".to_string()));
            }
        }
        let connection = Arc::new(MockConnection::new(created.len(), self.options.clone()));
        created.push(Arc::clone(&connection));
        self.configurations.lock().push(configuration.clone());
        Ok(connection)
    }
}
