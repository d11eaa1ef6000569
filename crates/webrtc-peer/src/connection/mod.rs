//! Underlying peer connection seam
//!
//! The peer negotiation core drives an abstract [`PeerConnectionBackend`]
//! through standard offer/answer, ICE and track primitives. The default
//! implementation wraps webrtc-rs ([`rtc::WebRtcConnection`]); tests
//! plug in scripted backends through [`ConnectionFactory`].

pub mod rtc;

pub use self::rtc::{WebRtcConnection, WebRtcConnectionFactory};

use crate::channels::{DataChannelMessage, DataChannelState};
use crate::config::{DataChannelConfig, RtcConfiguration};
use crate::media::{MediaKind, MediaStream, MediaTrack};
use crate::sdp::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// State of the underlying peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Transceiver direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl TransceiverDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransceiverDirection::SendRecv => "sendrecv",
            TransceiverDirection::SendOnly => "sendonly",
            TransceiverDirection::RecvOnly => "recvonly",
            TransceiverDirection::Inactive => "inactive",
        }
    }
}

impl fmt::Display for TransceiverDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A track received from the remote peer
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub track: MediaTrack,
    pub stream_ids: Vec<String>,
}

/// Events raised by the underlying connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnectionStateChanged(ConnectionState),
    /// A gathered candidate; `None` marks the end of gathering
    IceCandidate(Option<IceCandidate>),
    Track(RemoteTrack),
    NegotiationNeeded,
}

pub type ConnectionEventHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Events raised by a data channel transport
#[derive(Debug, Clone)]
pub enum DataChannelEvent {
    Open,
    Close,
    Message(DataChannelMessage),
    BufferedAmountLow,
    Error(String),
}

pub type DataChannelEventHandler = Arc<dyn Fn(DataChannelEvent) + Send + Sync>;

/// Outgoing RTP stream bound to a local track
#[async_trait]
pub trait RtpSender: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Track currently being sent, if any
    fn track(&self) -> Option<MediaTrack>;

    /// Swap the sent track without renegotiation
    async fn replace_track(&self, track: Option<MediaTrack>) -> Result<()>;
}

/// Incoming RTP stream
pub trait RtpReceiver: Send + Sync {
    fn kind(&self) -> MediaKind;

    fn track(&self) -> MediaTrack;
}

/// Paired sender/receiver for one media section
#[async_trait]
pub trait RtpTransceiver: Send + Sync {
    fn mid(&self) -> Option<String>;

    fn kind(&self) -> MediaKind;

    fn direction(&self) -> TransceiverDirection;

    async fn set_direction(&self, direction: TransceiverDirection) -> Result<()>;
}

/// Message transport created by the connection
#[async_trait]
pub trait DataChannelTransport: Send + Sync {
    fn label(&self) -> String;

    fn ready_state(&self) -> DataChannelState;

    /// Send a message, returning the number of payload bytes written
    async fn send(&self, msg: &DataChannelMessage) -> Result<usize>;

    async fn close(&self) -> Result<()>;

    /// Install the handler for every transport event, replacing any previous one
    async fn set_event_handler(&self, handler: DataChannelEventHandler);

    async fn set_buffered_amount_low_threshold(&self, threshold: usize);
}

/// The native peer connection driven by a [`crate::Peer`]
#[async_trait]
pub trait PeerConnectionBackend: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attach `track` as part of `stream`, creating a sendrecv transceiver
    async fn add_track(&self, track: &MediaTrack, stream: &MediaStream)
        -> Result<Arc<dyn RtpSender>>;

    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<Arc<dyn RtpTransceiver>>;

    async fn transceivers(&self) -> Vec<Arc<dyn RtpTransceiver>>;

    async fn senders(&self) -> Vec<Arc<dyn RtpSender>>;

    async fn receivers(&self) -> Vec<Arc<dyn RtpReceiver>>;

    async fn create_data_channel(
        &self,
        config: &DataChannelConfig,
    ) -> Result<Arc<dyn DataChannelTransport>>;

    fn connection_state(&self) -> ConnectionState;

    /// Install the handler for every connection event, replacing any previous one
    fn set_event_handler(&self, handler: ConnectionEventHandler);

    /// Whether `a=ssrc-group` simulcast mangling is understood by this engine
    fn supports_legacy_simulcast(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<()>;
}

/// Creates backends; used at construction and on every recovery
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, configuration: &RtcConfiguration)
        -> Result<Arc<dyn PeerConnectionBackend>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
        assert_eq!(TransceiverDirection::RecvOnly.to_string(), "recvonly");
    }
}
