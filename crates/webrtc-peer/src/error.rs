//! Error types for peer negotiation

/// Result type alias using the peer Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a peer
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying peer connection has reached the closed state
    #[error("Peer connection is closed")]
    ConnectionClosed,

    /// The peer was disposed; no further negotiation is possible
    #[error("Peer has been disposed")]
    Disposed,

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Camera/screen capture failed
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Frame-like state was queried without an active remote stream
    #[error("No remote stream available")]
    NoRemoteStream,

    /// Local setup did not complete
    #[error("Peer not ready: {0}")]
    NotReady(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error reports a closed connection or a disposed peer
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::Disposed)
    }

    /// Check if this error came from media capture or track handling
    pub fn is_media_error(&self) -> bool {
        matches!(
            self,
            Error::MediaAcquisition(_) | Error::MediaTrackError(_) | Error::NoRemoteStream
        )
    }

    /// Check if this error came from the offer/answer or candidate exchange
    pub fn is_negotiation_error(&self) -> bool {
        matches!(self, Error::SdpError(_) | Error::IceCandidateError(_))
    }

    /// Produce an owned copy for fan-out to several waiters.
    ///
    /// Variants carrying foreign errors collapse into `NotReady` with the
    /// rendered message.
    pub(crate) fn replicate(&self) -> Error {
        match self {
            Error::ConnectionClosed => Error::ConnectionClosed,
            Error::Disposed => Error::Disposed,
            Error::InvalidConfig(m) => Error::InvalidConfig(m.clone()),
            Error::SdpError(m) => Error::SdpError(m.clone()),
            Error::IceCandidateError(m) => Error::IceCandidateError(m.clone()),
            Error::MediaAcquisition(m) => Error::MediaAcquisition(m.clone()),
            Error::MediaTrackError(m) => Error::MediaTrackError(m.clone()),
            Error::DataChannelError(m) => Error::DataChannelError(m.clone()),
            Error::NoRemoteStream => Error::NoRemoteStream,
            Error::NotReady(m) => Error::NotReady(m.clone()),
            Error::WebRtcError(m) => Error::WebRtcError(m.clone()),
            Error::Serialization(m) => Error::Serialization(m.clone()),
            Error::Other(e) => Error::NotReady(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
